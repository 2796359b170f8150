use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use log::*;

use lcscsi_core::bus::initiator::{HostCommand, Transcript, VirtualInitiator};
use lcscsi_core::config::TargetConfig;
use lcscsi_core::diag::{DebugFlags, Diagnostics, hexdump};
use lcscsi_core::emulator::{Emulator, shared_state};
use lcscsi_core::handshake::BLOCK_SIZE;
use lcscsi_core::reset::ResetMonitor;
use lcscsi_core::scsi::{CDB_LEN, STATUS_GOOD};
use lcscsi_core::storage::Storage;
use lcscsi_core::storage::image::ImageStorage;
use lcscsi_core::storage::ram::RamStorage;

#[derive(Parser)]
#[command(
    version,
    about = "Plays SCSI commands from a virtual host against the target emulation"
)]
struct Args {
    /// Image root directory (containing scsi0/, scsi1/, ...)
    #[arg(long, conflicts_with = "ram")]
    images: Option<PathBuf>,

    /// Use a single in-memory LUN 0 of this many blocks
    #[arg(long)]
    ram: Option<u32>,

    /// Create a zero-filled image LUN before running, as LUN:BLOCKS.
    /// Existing images are kept.
    #[arg(long, value_parser = parse_lun_blocks, requires = "images")]
    create_lun: Vec<(u8, u32)>,

    /// JSON target configuration
    #[arg(long)]
    config: Option<PathBuf>,

    /// Target SCSI ID, overriding the configuration
    #[arg(long)]
    id: Option<u8>,

    /// Select with ATN and name the LUN in an IDENTIFY message
    #[arg(long)]
    identify: bool,

    /// Enable debug output of the target (all categories except blocks)
    #[arg(long)]
    debug: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// INQUIRY
    Inquiry {
        #[arg(long, default_value_t = 0)]
        lun: u8,
    },
    /// REQUEST SENSE
    Sense {
        #[arg(long, default_value_t = 0)]
        lun: u8,
    },
    /// READ(6), printing the data or writing it to a file
    Read {
        #[arg(long, default_value_t = 0)]
        lun: u8,
        #[arg(long, default_value_t = 0)]
        lba: u32,
        #[arg(long, default_value_t = 1)]
        count: u16,
        #[arg(long)]
        out: Option<PathBuf>,
    },
    /// WRITE(6) the contents of a file, padded to whole blocks
    Write {
        #[arg(long, default_value_t = 0)]
        lun: u8,
        #[arg(long, default_value_t = 0)]
        lba: u32,
        #[arg(long)]
        file: PathBuf,
    },
    /// MODE SENSE
    ModeSense {
        #[arg(long, default_value_t = 0)]
        lun: u8,
    },
    /// FORMAT UNIT, creating the LUN if it has no image yet
    Format {
        #[arg(long, default_value_t = 0)]
        lun: u8,
        /// Fill byte for every block
        #[arg(long, default_value_t = 0, value_parser = parse_byte)]
        pattern: u8,
    },
    /// Runs one hex CDB per line, optionally followed by '< hex data' for DataOut
    Script { file: PathBuf },
}

/// Decimal or 0x-prefixed hex
fn parse_byte(s: &str) -> Result<u8, String> {
    let value = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(digits) => u8::from_str_radix(digits, 16),
        None => s.parse(),
    };
    value.map_err(|e| format!("invalid byte '{}': {}", s, e))
}

fn parse_lun_blocks(s: &str) -> Result<(u8, u32), String> {
    let (lun, blocks) = s
        .split_once(':')
        .ok_or_else(|| format!("expected LUN:BLOCKS, got '{}'", s))?;
    let lun: u8 = lun.parse().map_err(|e| format!("invalid LUN '{}': {}", lun, e))?;
    if lun > 7 {
        return Err(format!("LUN {} out of range (0-7)", lun));
    }
    let blocks = blocks
        .parse()
        .map_err(|e| format!("invalid block count '{}': {}", blocks, e))?;
    Ok((lun, blocks))
}

fn cdb(opcode: u8, lun: u8, lba: u32, length: u8) -> [u8; CDB_LEN] {
    let lba = lba & 0x1F_FFFF;
    [
        opcode,
        ((lun & 7) << 5) | (lba >> 16) as u8,
        (lba >> 8) as u8,
        lba as u8,
        length,
        0,
    ]
}

/// Block count as encoded in the length byte (256 is sent as 0)
fn block_length(count: usize) -> Result<u8> {
    match count {
        1..=255 => Ok(count as u8),
        256 => Ok(0),
        _ => bail!("Block count {} out of range (1-256)", count),
    }
}

fn parse_hex(s: &str) -> Result<Vec<u8>> {
    let digits: String = s.split_whitespace().collect();
    hex::decode(&digits).with_context(|| format!("Invalid hex '{}'", s.trim()))
}

fn parse_script(path: &Path) -> Result<Vec<([u8; CDB_LEN], Vec<u8>)>> {
    let text = fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    let mut commands = vec![];
    for (n, line) in text.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let (cdb, data) = match line.split_once('<') {
            Some((cdb, data)) => (cdb, parse_hex(data)?),
            None => (line, vec![]),
        };
        let cdb = parse_hex(cdb)?;
        let Ok(cdb) = <[u8; CDB_LEN]>::try_from(cdb.as_slice()) else {
            bail!("{}:{}: CDB must be {} bytes", path.display(), n + 1, CDB_LEN);
        };
        commands.push((cdb, data));
    }
    Ok(commands)
}

/// The commands to queue and the LUN they address
fn host_commands(args: &Args, target: u8) -> Result<Vec<HostCommand>> {
    let (lun, commands): (u8, Vec<([u8; CDB_LEN], Vec<u8>)>) = match &args.command {
        Command::Inquiry { lun } => (*lun, vec![(cdb(0x12, *lun, 0, 36), vec![])]),
        Command::Sense { lun } => (*lun, vec![(cdb(0x03, *lun, 0, 4), vec![])]),
        Command::Read { lun, lba, count, .. } => (
            *lun,
            vec![(cdb(0x08, *lun, *lba, block_length(usize::from(*count))?), vec![])],
        ),
        Command::Write { lun, lba, file } => {
            let mut data =
                fs::read(file).with_context(|| format!("Failed to read {}", file.display()))?;
            data.resize(data.len().next_multiple_of(BLOCK_SIZE).max(BLOCK_SIZE), 0);
            let length = block_length(data.len() / BLOCK_SIZE)?;
            (*lun, vec![(cdb(0x0A, *lun, *lba, length), data)])
        }
        Command::ModeSense { lun } => (*lun, vec![(cdb(0x1A, *lun, 0, 22), vec![])]),
        Command::Format { lun, pattern } => {
            let mut format = cdb(0x04, *lun, 0, 0);
            format[2] = *pattern;
            (*lun, vec![(format, vec![])])
        }
        Command::Script { file } => (0, parse_script(file)?),
    };

    Ok(commands
        .into_iter()
        .map(|(cdb, data)| {
            let cmd = HostCommand::new(target, cdb).with_data(data);
            if args.identify {
                let lun = if matches!(args.command, Command::Script { .. }) {
                    cdb[1] >> 5
                } else {
                    lun
                };
                cmd.with_identify(lun)
            } else {
                cmd
            }
        })
        .collect())
}

fn print_transcript(t: &Transcript) {
    println!("CDB:     {}", hex::encode_upper(t.command.cdb));
    let phases: Vec<&str> = t.phases.iter().map(|&p| p.into()).collect();
    println!("Phases:  {}", phases.join(" -> "));
    if t.data_out_sent > 0 {
        println!("Sent:    {} bytes", t.data_out_sent);
    }
    if !t.data_in.is_empty() {
        println!("Data in: {} bytes\n{}", t.data_in.len(), hexdump(&t.data_in));
    }
    match t.status {
        Some(STATUS_GOOD) => println!("Status:  GOOD"),
        Some(s) => println!("Status:  {:02X} (CHECK CONDITION)", s),
        None => println!("Status:  none (bus reset)"),
    }
    if let Some(m) = t.message {
        println!("Message: {:02X}", m);
    }
    println!();
}

fn run<S: Storage>(
    args: &Args,
    config: TargetConfig,
    storage: impl FnOnce(Diagnostics) -> Result<S>,
) -> Result<()> {
    let target = config.target_id;
    let commands = host_commands(args, target)?;

    let shared = shared_state(&config);
    let storage = storage(Diagnostics::new(shared.clone()))?;
    let port = VirtualInitiator::new().with_reset_monitor(ResetMonitor::new(shared.clone()));
    let mut emu = Emulator::new(config, shared, port, storage)?;

    for cmd in commands {
        emu.sequencer_mut().port_mut().queue(cmd);
    }
    emu.run_until(|e| e.sequencer().port().is_idle());

    let transcripts = emu.sequencer_mut().port_mut().take_transcripts();
    for t in &transcripts {
        print_transcript(t);
    }

    if let Command::Read { out: Some(out), .. } = &args.command {
        if let Some(t) = transcripts.first().filter(|t| t.status == Some(STATUS_GOOD)) {
            fs::write(out, &t.data_in)
                .with_context(|| format!("Failed to write {}", out.display()))?;
            info!("Wrote {} bytes to {}", t.data_in.len(), out.display());
        }
    }

    let stats = emu.stats();
    info!(
        "{} transactions, {} check conditions, {} resets, {} stalls",
        stats.transactions, stats.check_conditions, stats.resets, stats.stalls
    );
    Ok(())
}

fn main() -> Result<()> {
    env_logger::Builder::new()
        .filter_level(log::LevelFilter::Info)
        .parse_default_env()
        .init();
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => TargetConfig::load(path)?,
        None => TargetConfig::default(),
    };
    if let Some(id) = args.id {
        config.target_id = id;
    }
    if args.debug {
        config.debug = DebugFlags::default().apply_command(1).unwrap_or(DebugFlags::ALL);
    }
    config.validate()?;

    match (&args.images, args.ram) {
        (Some(root), _) => run(&args, config, |diag| {
            let mut storage = ImageStorage::open(root)?.with_diagnostics(diag);
            for &(lun, blocks) in &args.create_lun {
                storage.create_lun(lun, blocks)?;
                info!("LUN {} ready with {} blocks", lun, storage.lun_size_in_blocks(lun));
            }
            Ok(storage)
        }),
        (None, Some(blocks)) => run(&args, config, |_| {
            let mut storage = RamStorage::new();
            storage.add_lun(0, blocks);
            Ok(storage)
        }),
        (None, None) => bail!("One of --images or --ram is required"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cdb_encoding() {
        assert_eq!(cdb(0x08, 2, 0x01_0203, 4), [0x08, 0x41, 0x02, 0x03, 4, 0]);
        assert_eq!(block_length(256).unwrap(), 0);
        assert!(block_length(257).is_err());
    }

    #[test]
    fn option_values() {
        assert_eq!(parse_byte("0xE5"), Ok(0xE5));
        assert_eq!(parse_byte("17"), Ok(17));
        assert!(parse_byte("0x100").is_err());

        assert_eq!(parse_lun_blocks("1:2048"), Ok((1, 2048)));
        assert!(parse_lun_blocks("8:10").is_err());
        assert!(parse_lun_blocks("1").is_err());
    }

    #[test]
    fn format_carries_pattern() {
        let args = Args::parse_from([
            "lcscsi", "--ram", "4", "format", "--lun", "2", "--pattern", "0x6C",
        ]);
        let commands = host_commands(&args, 0).unwrap();
        assert_eq!(commands[0].cdb, [0x04, 0x40, 0x6C, 0, 0, 0]);
    }

    #[test]
    fn script_lines() {
        let path =
            std::env::temp_dir().join(format!("lcscsi-script-{}.txt", std::process::id()));
        fs::write(&path, "# comment\n12 00 00 00 24 00\n\n0A00000001 00 < DE AD\n").unwrap();
        let commands = parse_script(&path).unwrap();
        let _ = fs::remove_file(&path);

        assert_eq!(commands.len(), 2);
        assert_eq!(commands[0], ([0x12, 0, 0, 0, 0x24, 0], vec![]));
        assert_eq!(commands[1], ([0x0A, 0, 0, 0, 1, 0], vec![0xDE, 0xAD]));
    }
}
