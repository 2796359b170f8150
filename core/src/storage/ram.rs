//! In-memory LUNs

use crate::handshake::{BLOCK_SIZE, Block};
use crate::scsi::MAX_LUNS;
use crate::scsi::descriptor::LunDescriptor;

use super::{FatEntry, Storage, StorageError, StorageResult, USER_CODE_LEN, UserCode};

struct RamLun {
    data: Vec<u8>,
    descriptor: LunDescriptor,
    started: bool,
    user_code: UserCode,
    /// Error returned by the next sector access
    fault: Option<StorageError>,
}

impl RamLun {
    fn blocks(&self) -> u32 {
        (self.data.len() / BLOCK_SIZE) as u32
    }

    fn range(&self, lba: u32) -> StorageResult<std::ops::Range<usize>> {
        if lba >= self.blocks() {
            return Err(StorageError::OutOfRange);
        }
        let start = lba as usize * BLOCK_SIZE;
        Ok(start..start + BLOCK_SIZE)
    }
}

#[derive(Default)]
pub struct RamStorage {
    luns: [Option<RamLun>; MAX_LUNS],
    /// Descriptors set by MODE SELECT for LUNs that are yet to be formatted
    pending: [Option<LunDescriptor>; MAX_LUNS],
    fat: Vec<(FatEntry, Vec<u8>)>,
}

impl RamStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a zero-filled LUN
    pub fn add_lun(&mut self, lun: u8, blocks: u32) {
        self.add_lun_with(lun, vec![0; blocks as usize * BLOCK_SIZE]);
    }

    /// Adds a LUN with the given contents, padded to a whole block
    pub fn add_lun_with(&mut self, lun: u8, mut data: Vec<u8>) {
        data.resize(data.len().next_multiple_of(BLOCK_SIZE), 0);
        let descriptor = LunDescriptor::for_capacity((data.len() / BLOCK_SIZE) as u32);
        self.luns[usize::from(lun & 7)] = Some(RamLun {
            data,
            descriptor,
            started: true,
            user_code: [0; USER_CODE_LEN],
            fault: None,
        });
    }

    pub fn set_user_code(&mut self, lun: u8, code: UserCode) {
        if let Some(l) = self.get_mut(lun) {
            l.user_code = code;
        }
    }

    /// Makes the next sector access on `lun` fail
    pub fn inject_fault(&mut self, lun: u8, err: StorageError) {
        if let Some(l) = self.get_mut(lun) {
            l.fault = Some(err);
        }
    }

    pub fn contents(&self, lun: u8) -> Option<&[u8]> {
        self.get(lun).map(|l| l.data.as_slice())
    }

    /// Adds a file to the FAT transfer area
    pub fn add_fat_file(&mut self, name: &str, data: Vec<u8>) {
        let entry = FatEntry {
            name: name.to_string(),
            size: data.len() as u32,
            is_dir: false,
        };
        self.fat.push((entry, data));
    }

    fn get(&self, lun: u8) -> Option<&RamLun> {
        self.luns.get(usize::from(lun)).and_then(Option::as_ref)
    }

    fn get_mut(&mut self, lun: u8) -> Option<&mut RamLun> {
        self.luns.get_mut(usize::from(lun)).and_then(Option::as_mut)
    }

    fn accessible(&mut self, lun: u8) -> StorageResult<&mut RamLun> {
        let l = self.get_mut(lun).ok_or(StorageError::NotFound)?;
        if let Some(e) = l.fault.take() {
            return Err(e);
        }
        if !l.started {
            return Err(StorageError::NotReady);
        }
        Ok(l)
    }
}

impl Storage for RamStorage {
    fn lun_exists(&self, lun: u8) -> bool {
        self.get(lun).is_some()
    }

    fn lun_ready(&self, lun: u8) -> bool {
        self.get(lun).is_some_and(|l| l.started)
    }

    fn lun_size_in_blocks(&self, lun: u8) -> u32 {
        self.get(lun).map_or(0, RamLun::blocks)
    }

    fn read_sector(&mut self, lun: u8, lba: u32, buffer: &mut Block) -> StorageResult<()> {
        let l = self.accessible(lun)?;
        let range = l.range(lba)?;
        buffer.copy_from_slice(&l.data[range]);
        Ok(())
    }

    fn write_sector(&mut self, lun: u8, lba: u32, buffer: &Block) -> StorageResult<()> {
        let l = self.accessible(lun)?;
        let range = l.range(lba)?;
        l.data[range].copy_from_slice(buffer);
        Ok(())
    }

    fn read_descriptor(&mut self, lun: u8) -> StorageResult<LunDescriptor> {
        match self.get(lun) {
            Some(l) => Ok(l.descriptor),
            None => self
                .pending
                .get(usize::from(lun))
                .copied()
                .flatten()
                .ok_or(StorageError::NotFound),
        }
    }

    fn write_descriptor(&mut self, lun: u8, descriptor: &LunDescriptor) -> StorageResult<()> {
        let idx = usize::from(lun);
        if idx >= MAX_LUNS {
            return Err(StorageError::NotFound);
        }
        match self.luns[idx].as_mut() {
            Some(l) => l.descriptor = *descriptor,
            None => self.pending[idx] = Some(*descriptor),
        }
        Ok(())
    }

    fn format_lun(&mut self, lun: u8, pattern: u8) -> StorageResult<()> {
        let idx = usize::from(lun);
        if idx >= MAX_LUNS {
            return Err(StorageError::NotFound);
        }
        if self.luns[idx].is_none() {
            let descriptor = self.pending[idx].take().unwrap_or_default();
            self.luns[idx] = Some(RamLun {
                data: vec![],
                descriptor,
                started: true,
                user_code: [0; USER_CODE_LEN],
                fault: None,
            });
        }
        let l = self.get_mut(lun).ok_or(StorageError::NotFound)?;
        let blocks = l.descriptor.blocks as usize;
        l.data.clear();
        l.data.resize(blocks * BLOCK_SIZE, pattern);
        Ok(())
    }

    fn lun_user_code(&self, lun: u8) -> UserCode {
        self.get(lun).map_or([0; USER_CODE_LEN], |l| l.user_code)
    }

    fn set_lun_ready(&mut self, lun: u8, ready: bool) -> StorageResult<()> {
        let l = self.get_mut(lun).ok_or(StorageError::NotFound)?;
        l.started = ready;
        Ok(())
    }

    fn reset(&mut self) {
        for l in self.luns.iter_mut().flatten() {
            l.fault = None;
        }
    }

    fn set_fat_directory(&mut self, path: &str) -> StorageResult<()> {
        match path.trim_matches('/') {
            "" => Ok(()),
            _ => Err(StorageError::NotFound),
        }
    }

    fn fat_file_info(&mut self, file: u32) -> StorageResult<Option<FatEntry>> {
        Ok(self.fat.get(file as usize).map(|(e, _)| e.clone()))
    }

    fn read_fat_block(&mut self, file: u32, block: u32, buffer: &mut Block) -> StorageResult<()> {
        let (_, data) = self.fat.get(file as usize).ok_or(StorageError::NotFound)?;
        let start = block as usize * BLOCK_SIZE;
        if start >= data.len() {
            return Err(StorageError::OutOfRange);
        }
        let end = (start + BLOCK_SIZE).min(data.len());
        buffer.fill(0);
        buffer[..end - start].copy_from_slice(&data[start..end]);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sectors() {
        let mut s = RamStorage::new();
        s.add_lun(1, 4);
        assert!(s.lun_exists(1));
        assert!(!s.lun_exists(0));
        assert_eq!(s.lun_size_in_blocks(1), 4);

        let block = [0xA5; BLOCK_SIZE];
        s.write_sector(1, 3, &block).unwrap();
        let mut read = [0; BLOCK_SIZE];
        s.read_sector(1, 3, &mut read).unwrap();
        assert_eq!(read, block);

        assert_eq!(s.read_sector(1, 4, &mut read), Err(StorageError::OutOfRange));
        assert_eq!(s.read_sector(0, 0, &mut read), Err(StorageError::NotFound));
    }

    #[test]
    fn fault_is_single_shot() {
        let mut s = RamStorage::new();
        s.add_lun(0, 1);
        s.inject_fault(0, StorageError::Io);
        let mut buf = [0; BLOCK_SIZE];
        assert_eq!(s.read_sector(0, 0, &mut buf), Err(StorageError::Io));
        assert!(s.read_sector(0, 0, &mut buf).is_ok());
    }

    #[test]
    fn stop_unit() {
        let mut s = RamStorage::new();
        s.add_lun(0, 1);
        s.set_lun_ready(0, false).unwrap();
        assert!(!s.lun_ready(0));
        let mut buf = [0; BLOCK_SIZE];
        assert_eq!(s.read_sector(0, 0, &mut buf), Err(StorageError::NotReady));
        s.set_lun_ready(0, true).unwrap();
        assert!(s.lun_ready(0));
    }

    #[test]
    fn format_resizes_to_descriptor() {
        let mut s = RamStorage::new();
        s.add_lun_with(0, vec![0xFF; 300]);
        assert_eq!(s.lun_size_in_blocks(0), 2);

        let d = LunDescriptor::for_capacity(5);
        s.write_descriptor(0, &d).unwrap();
        s.format_lun(0, 0).unwrap();
        assert_eq!(s.lun_size_in_blocks(0), 5);
        assert!(s.contents(0).unwrap().iter().all(|&b| b == 0));

        s.format_lun(0, 0xE5).unwrap();
        assert!(s.contents(0).unwrap().iter().all(|&b| b == 0xE5));
    }

    #[test]
    fn format_creates_missing_lun() {
        let mut s = RamStorage::new();
        assert_eq!(s.read_descriptor(3), Err(StorageError::NotFound));
        s.write_descriptor(3, &LunDescriptor::for_capacity(7)).unwrap();
        assert!(!s.lun_exists(3));
        assert_eq!(s.read_descriptor(3).unwrap().blocks, 7);

        s.format_lun(3, 0).unwrap();
        assert!(s.lun_exists(3));
        assert_eq!(s.lun_size_in_blocks(3), 7);

        // No descriptor at all
        s.format_lun(4, 0).unwrap();
        assert_eq!(s.read_descriptor(4).unwrap(), LunDescriptor::default());
    }

    #[test]
    fn user_codes() {
        let mut s = RamStorage::new();
        s.add_lun(0, 1);
        assert_eq!(s.lun_user_code(0), [0; USER_CODE_LEN]);
        s.set_user_code(0, *b"BBC01");
        assert_eq!(s.lun_user_code(0), *b"BBC01");
        assert_eq!(s.lun_user_code(1), [0; USER_CODE_LEN]);
    }

    #[test]
    fn fat_blocks() {
        let mut s = RamStorage::new();
        s.add_fat_file("A", vec![1; 300]);
        assert_eq!(s.fat_file_info(0).unwrap().unwrap().size, 300);
        assert_eq!(s.fat_file_info(1).unwrap(), None);

        let mut buf = [0xFF; BLOCK_SIZE];
        s.read_fat_block(0, 1, &mut buf).unwrap();
        assert!(buf[..44].iter().all(|&b| b == 1));
        assert!(buf[44..].iter().all(|&b| b == 0));
        assert_eq!(s.read_fat_block(0, 2, &mut buf), Err(StorageError::OutOfRange));
    }
}
