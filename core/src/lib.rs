pub mod bus;
pub mod config;
pub mod diag;
pub mod emulator;
pub mod handshake;
pub mod reset;
pub mod scsi;
pub mod storage;
