//! File-backed LUN images
//!
//! Directory layout below the root:
//!
//! ```text
//! scsi0/scsi0.dat   raw 256-byte sectors of LUN 0
//! scsi0/scsi0.dsc   its 22-byte descriptor
//! scsi0/scsi0.ucd   optional 5-byte user code
//! scsi1/...         LUN directory 1, selected by VENDOR SELECT
//! transfer/         FAT transfer area
//! ```

use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Component, Path, PathBuf};

use anyhow::{Context, Result, bail};
use log::*;
#[cfg(feature = "mmap")]
use memmap2::MmapMut;

use crate::diag::{DebugCategory, Diagnostics};
use crate::handshake::{BLOCK_SIZE, Block};
use crate::scsi::MAX_LUNS;
use crate::scsi::descriptor::{DESCRIPTOR_LEN, LunDescriptor};

use super::{FatEntry, Storage, StorageError, StorageResult, USER_CODE_LEN, UserCode};

/// Name of the FAT transfer area below the root
pub const TRANSFER_DIR: &str = "transfer";

/// An opened LUN image
struct LunImage {
    #[cfg(feature = "mmap")]
    map: MmapMut,
    /// Holds the exclusive lock for as long as the map lives
    #[cfg(feature = "mmap")]
    _file: File,

    #[cfg(not(feature = "mmap"))]
    file: File,

    blocks: u32,
}

impl LunImage {
    #[cfg(feature = "mmap")]
    fn open(path: &Path) -> StorageResult<Self> {
        use fs2::FileExt;
        use memmap2::MmapOptions;

        let file = OpenOptions::new().read(true).write(true).open(path)?;
        let len = file.metadata()?.len() as usize;
        file.try_lock_exclusive()?;
        let map = unsafe { MmapOptions::new().len(len).map_mut(&file)? };
        Ok(Self {
            map,
            _file: file,
            blocks: (len / BLOCK_SIZE) as u32,
        })
    }

    #[cfg(not(feature = "mmap"))]
    fn open(path: &Path) -> StorageResult<Self> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        let len = file.metadata()?.len() as usize;
        Ok(Self {
            file,
            blocks: (len / BLOCK_SIZE) as u32,
        })
    }

    fn check(&self, lba: u32) -> StorageResult<()> {
        if lba >= self.blocks {
            return Err(StorageError::OutOfRange);
        }
        Ok(())
    }

    #[cfg(feature = "mmap")]
    fn read(&mut self, lba: u32, buffer: &mut Block) -> StorageResult<()> {
        self.check(lba)?;
        let start = lba as usize * BLOCK_SIZE;
        buffer.copy_from_slice(&self.map[start..start + BLOCK_SIZE]);
        Ok(())
    }

    #[cfg(feature = "mmap")]
    fn write(&mut self, lba: u32, buffer: &Block) -> StorageResult<()> {
        self.check(lba)?;
        let start = lba as usize * BLOCK_SIZE;
        self.map[start..start + BLOCK_SIZE].copy_from_slice(buffer);
        Ok(())
    }

    #[cfg(not(feature = "mmap"))]
    fn read(&mut self, lba: u32, buffer: &mut Block) -> StorageResult<()> {
        self.check(lba)?;
        self.file.seek(SeekFrom::Start(u64::from(lba) * BLOCK_SIZE as u64))?;
        self.file.read_exact(buffer)?;
        Ok(())
    }

    #[cfg(not(feature = "mmap"))]
    fn write(&mut self, lba: u32, buffer: &Block) -> StorageResult<()> {
        self.check(lba)?;
        self.file.seek(SeekFrom::Start(u64::from(lba) * BLOCK_SIZE as u64))?;
        self.file.write_all(buffer)?;
        Ok(())
    }

    fn flush(&mut self) {
        #[cfg(feature = "mmap")]
        let result = self.map.flush();
        #[cfg(not(feature = "mmap"))]
        let result = self.file.flush();

        if let Err(e) = result {
            error!("Flushing LUN image failed: {}", e);
        }
    }
}

/// FAT file held open between blocks of a VENDOR FAT READ
struct FatHandle {
    file_number: u32,
    file: File,
    len: u64,
}

pub struct ImageStorage {
    root: PathBuf,
    directory: u8,
    images: [Option<LunImage>; MAX_LUNS],
    stopped: [bool; MAX_LUNS],
    /// Current directory within the transfer area, relative to it
    fat_dir: PathBuf,
    fat_open: Option<FatHandle>,
    diag: Option<Diagnostics>,
}

impl ImageStorage {
    /// Opens an image root directory. LUN directory 0 is selected.
    pub fn open(root: &Path) -> Result<Self> {
        if !root.is_dir() {
            bail!("Image root {} is not a directory", root.display());
        }
        let storage = Self {
            root: root.to_path_buf(),
            directory: 0,
            images: Default::default(),
            stopped: [false; MAX_LUNS],
            fat_dir: PathBuf::new(),
            fat_open: None,
            diag: None,
        };
        let dir = storage.lun_dir(0);
        if !dir.is_dir() {
            fs::create_dir(&dir)
                .with_context(|| format!("Failed to create {}", dir.display()))?;
        }
        Ok(storage)
    }

    pub fn with_diagnostics(mut self, diag: Diagnostics) -> Self {
        self.diag = Some(diag);
        self
    }

    /// Creates a zero-filled LUN image with a matching descriptor in the
    /// current LUN directory. An existing image is left alone.
    pub fn create_lun(&mut self, lun: u8, blocks: u32) -> Result<()> {
        if usize::from(lun) >= MAX_LUNS {
            bail!("Invalid LUN {}", lun);
        }
        if self.lun_exists(lun) {
            info!("LUN {} already exists, not creating", lun);
            return Ok(());
        }
        self.write_dsc(lun, &LunDescriptor::for_capacity(blocks))
            .with_context(|| format!("Failed to write descriptor for LUN {}", lun))?;
        self.format_lun(lun, 0)
            .with_context(|| format!("Failed to create image for LUN {}", lun))?;
        Ok(())
    }

    fn lun_dir(&self, directory: u8) -> PathBuf {
        self.root.join(format!("scsi{}", directory))
    }

    fn dat_path(&self, lun: u8) -> PathBuf {
        self.lun_dir(self.directory).join(format!("scsi{}.dat", lun))
    }

    fn dsc_path(&self, lun: u8) -> PathBuf {
        self.lun_dir(self.directory).join(format!("scsi{}.dsc", lun))
    }

    fn ucd_path(&self, lun: u8) -> PathBuf {
        self.lun_dir(self.directory).join(format!("scsi{}.ucd", lun))
    }

    fn debug(&self, category: DebugCategory, msg: std::fmt::Arguments) {
        if self.diag.as_ref().is_some_and(|d| d.enabled(category)) {
            debug!(target: category.target(), "{}", msg);
        }
    }

    fn fs_debug(&self, msg: std::fmt::Arguments) {
        self.debug(DebugCategory::Filesystem, msg);
    }

    fn fat_debug(&self, msg: std::fmt::Arguments) {
        self.debug(DebugCategory::FatFs, msg);
    }

    fn read_dsc(&self, lun: u8) -> StorageResult<Option<LunDescriptor>> {
        let path = self.dsc_path(lun);
        let data = match fs::read(&path) {
            Ok(d) => d,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let Ok(bytes) = <[u8; DESCRIPTOR_LEN]>::try_from(data.as_slice()) else {
            warn!("Descriptor {} has invalid length {}", path.display(), data.len());
            return Err(StorageError::Io);
        };
        Ok(Some(LunDescriptor::from_bytes(&bytes)))
    }

    fn write_dsc(&self, lun: u8, descriptor: &LunDescriptor) -> StorageResult<()> {
        fs::write(self.dsc_path(lun), descriptor.to_bytes())?;
        Ok(())
    }

    fn image(&mut self, lun: u8) -> StorageResult<&mut LunImage> {
        let idx = usize::from(lun);
        if idx >= MAX_LUNS || !self.lun_exists(lun) {
            return Err(StorageError::NotFound);
        }
        if self.stopped[idx] {
            return Err(StorageError::NotReady);
        }
        if self.images[idx].is_none() {
            self.fs_debug(format_args!(
                "Opening LUN image {}",
                self.dat_path(lun).display()
            ));
            // Creates the descriptor if this image has none yet
            self.read_descriptor(lun)?;
            self.images[idx] = Some(LunImage::open(&self.dat_path(lun))?);
        }
        self.images[idx].as_mut().ok_or(StorageError::Io)
    }

    fn close_lun(&mut self, lun: u8) {
        if let Some(mut image) = self.images[usize::from(lun)].take() {
            image.flush();
        }
    }

    fn close_all(&mut self) {
        for lun in 0..MAX_LUNS as u8 {
            self.close_lun(lun);
        }
        self.fat_open = None;
    }

    /// Current FAT directory listing, sorted by name without dotfiles
    fn fat_listing(&self) -> StorageResult<Vec<(PathBuf, FatEntry)>> {
        let dir = self.root.join(TRANSFER_DIR).join(&self.fat_dir);
        let mut entries = vec![];
        for entry in fs::read_dir(&dir)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.starts_with('.') {
                continue;
            }
            let meta = entry.metadata()?;
            entries.push((
                entry.path(),
                FatEntry {
                    name,
                    size: meta.len().min(u64::from(u32::MAX)) as u32,
                    is_dir: meta.is_dir(),
                },
            ));
        }
        entries.sort_by(|a, b| a.1.name.cmp(&b.1.name));
        Ok(entries)
    }
}

impl Storage for ImageStorage {
    fn lun_exists(&self, lun: u8) -> bool {
        usize::from(lun) < MAX_LUNS && self.dat_path(lun).is_file()
    }

    fn lun_ready(&self, lun: u8) -> bool {
        self.lun_exists(lun) && !self.stopped[usize::from(lun)]
    }

    fn lun_size_in_blocks(&self, lun: u8) -> u32 {
        if !self.lun_exists(lun) {
            return 0;
        }
        match self.read_dsc(lun) {
            Ok(Some(d)) => d.blocks,
            _ => fs::metadata(self.dat_path(lun))
                .map_or(0, |m| (m.len() / BLOCK_SIZE as u64).min(0xFF_FFFF) as u32),
        }
    }

    fn read_sector(&mut self, lun: u8, lba: u32, buffer: &mut Block) -> StorageResult<()> {
        self.image(lun)?.read(lba, buffer)
    }

    fn write_sector(&mut self, lun: u8, lba: u32, buffer: &Block) -> StorageResult<()> {
        self.image(lun)?.write(lba, buffer)
    }

    fn read_descriptor(&mut self, lun: u8) -> StorageResult<LunDescriptor> {
        if let Some(d) = self.read_dsc(lun)? {
            return Ok(d);
        }
        if !self.lun_exists(lun) {
            return Err(StorageError::NotFound);
        }
        let len = fs::metadata(self.dat_path(lun))?.len();
        let d = LunDescriptor::for_capacity((len / BLOCK_SIZE as u64).min(0xFF_FFFF) as u32);
        self.fs_debug(format_args!(
            "Creating descriptor for LUN {} ({} blocks)",
            lun, d.blocks
        ));
        self.write_dsc(lun, &d)?;
        Ok(d)
    }

    fn write_descriptor(&mut self, lun: u8, descriptor: &LunDescriptor) -> StorageResult<()> {
        if usize::from(lun) >= MAX_LUNS {
            return Err(StorageError::NotFound);
        }
        self.write_dsc(lun, descriptor)
    }

    fn format_lun(&mut self, lun: u8, pattern: u8) -> StorageResult<()> {
        if usize::from(lun) >= MAX_LUNS {
            return Err(StorageError::NotFound);
        }
        let descriptor = match self.read_dsc(lun)? {
            Some(d) => d,
            None if self.lun_exists(lun) => self.read_descriptor(lun)?,
            None => {
                let d = LunDescriptor::default();
                self.fs_debug(format_args!("Creating default descriptor for LUN {}", lun));
                self.write_dsc(lun, &d)?;
                d
            }
        };
        self.close_lun(lun);

        let path = self.dat_path(lun);
        self.fs_debug(format_args!(
            "Formatting {} with {} blocks of {:02X}",
            path.display(),
            descriptor.blocks,
            pattern
        ));
        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)?;
        if pattern == 0 {
            file.set_len(u64::from(descriptor.blocks) * BLOCK_SIZE as u64)?;
        } else {
            let block = [pattern; BLOCK_SIZE];
            let mut writer = BufWriter::new(&file);
            for _ in 0..descriptor.blocks {
                writer.write_all(&block)?;
            }
            writer.flush()?;
        }
        file.sync_all()?;
        Ok(())
    }

    fn lun_user_code(&self, lun: u8) -> UserCode {
        let mut code = [0; USER_CODE_LEN];
        if usize::from(lun) >= MAX_LUNS {
            return code;
        }
        let path = self.ucd_path(lun);
        match fs::read(&path) {
            Ok(data) => {
                if data.len() != USER_CODE_LEN {
                    warn!("User code {} has invalid length {}", path.display(), data.len());
                }
                let len = data.len().min(USER_CODE_LEN);
                code[..len].copy_from_slice(&data[..len]);
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => (),
            Err(e) => warn!("Cannot read user code {}: {}", path.display(), e),
        }
        code
    }

    fn set_lun_ready(&mut self, lun: u8, ready: bool) -> StorageResult<()> {
        if !self.lun_exists(lun) {
            return Err(StorageError::NotFound);
        }
        if !ready {
            self.close_lun(lun);
        }
        self.stopped[usize::from(lun)] = !ready;
        Ok(())
    }

    fn reset(&mut self) {
        self.close_all();
    }

    fn lun_directory(&self) -> u8 {
        self.directory
    }

    fn set_lun_directory(&mut self, directory: u8) -> StorageResult<()> {
        if !self.lun_dir(directory).is_dir() {
            return Err(StorageError::NotFound);
        }
        self.close_all();
        self.directory = directory;
        self.stopped = [false; MAX_LUNS];
        self.fs_debug(format_args!("LUN directory is now {}", directory));
        Ok(())
    }

    fn set_fat_directory(&mut self, path: &str) -> StorageResult<()> {
        let rel = Path::new(path.trim_start_matches('/'));
        if rel.components().any(|c| !matches!(c, Component::Normal(_) | Component::CurDir)) {
            return Err(StorageError::NotFound);
        }
        if !self.root.join(TRANSFER_DIR).join(rel).is_dir() {
            return Err(StorageError::NotFound);
        }
        self.fat_dir = rel.to_path_buf();
        self.fat_open = None;
        self.fat_debug(format_args!("FAT directory is now /{}", self.fat_dir.display()));
        Ok(())
    }

    fn fat_file_info(&mut self, file: u32) -> StorageResult<Option<FatEntry>> {
        Ok(self
            .fat_listing()?
            .into_iter()
            .nth(file as usize)
            .map(|(_, e)| e))
    }

    fn read_fat_block(&mut self, file: u32, block: u32, buffer: &mut Block) -> StorageResult<()> {
        if self.fat_open.as_ref().is_none_or(|h| h.file_number != file) {
            let (path, entry) = self
                .fat_listing()?
                .into_iter()
                .nth(file as usize)
                .ok_or(StorageError::NotFound)?;
            if entry.is_dir {
                return Err(StorageError::NotFound);
            }
            self.fat_debug(format_args!("Opening FAT file {}", path.display()));
            self.fat_open = Some(FatHandle {
                file_number: file,
                file: File::open(path)?,
                len: u64::from(entry.size),
            });
        }
        let handle = self.fat_open.as_mut().ok_or(StorageError::Io)?;

        let start = u64::from(block) * BLOCK_SIZE as u64;
        if start >= handle.len {
            return Err(StorageError::OutOfRange);
        }
        let len = (handle.len - start).min(BLOCK_SIZE as u64) as usize;
        buffer.fill(0);
        handle.file.seek(SeekFrom::Start(start))?;
        handle.file.read_exact(&mut buffer[..len])?;
        Ok(())
    }
}

impl Drop for ImageStorage {
    fn drop(&mut self) {
        self.close_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct TempDir(PathBuf);

    impl TempDir {
        fn new(name: &str) -> Self {
            let path =
                std::env::temp_dir().join(format!("lcscsi-{}-{}", std::process::id(), name));
            let _ = fs::remove_dir_all(&path);
            fs::create_dir_all(&path).unwrap();
            Self(path)
        }
    }

    impl Drop for TempDir {
        fn drop(&mut self) {
            let _ = fs::remove_dir_all(&self.0);
        }
    }

    #[test]
    fn create_and_access() {
        let tmp = TempDir::new("create");
        let mut s = ImageStorage::open(&tmp.0).unwrap();
        assert!(!s.lun_exists(0));

        s.create_lun(0, 10).unwrap();
        assert!(s.lun_exists(0));
        assert_eq!(s.lun_size_in_blocks(0), 10);
        assert!(tmp.0.join("scsi0/scsi0.dsc").is_file());
        assert_eq!(fs::metadata(tmp.0.join("scsi0/scsi0.dat")).unwrap().len(), 2560);

        let block = [0x42; BLOCK_SIZE];
        s.write_sector(0, 9, &block).unwrap();
        let mut read = [0; BLOCK_SIZE];
        s.read_sector(0, 9, &mut read).unwrap();
        assert_eq!(read, block);
        assert_eq!(s.read_sector(0, 10, &mut read), Err(StorageError::OutOfRange));

        s.reset();
        let data = fs::read(tmp.0.join("scsi0/scsi0.dat")).unwrap();
        assert_eq!(&data[9 * BLOCK_SIZE..], &block[..]);
    }

    #[test]
    fn descriptor_created_from_image() {
        let tmp = TempDir::new("dsc");
        fs::create_dir_all(tmp.0.join("scsi0")).unwrap();
        fs::write(tmp.0.join("scsi0/scsi3.dat"), vec![0; 66 * BLOCK_SIZE]).unwrap();

        let mut s = ImageStorage::open(&tmp.0).unwrap();
        assert!(s.lun_exists(3));
        let d = s.read_descriptor(3).unwrap();
        assert_eq!(d.blocks, 66);
        assert_eq!(d.cylinders, 2);
        assert_eq!(fs::read(tmp.0.join("scsi0/scsi3.dsc")).unwrap(), d.to_bytes());
    }

    #[test]
    fn format_without_image() {
        let tmp = TempDir::new("format");
        let mut s = ImageStorage::open(&tmp.0).unwrap();

        // Descriptor only, as left by MODE SELECT
        s.write_descriptor(1, &LunDescriptor::for_capacity(8)).unwrap();
        assert!(!s.lun_exists(1));
        s.format_lun(1, 0x6C).unwrap();
        assert!(s.lun_exists(1));
        let data = fs::read(tmp.0.join("scsi0/scsi1.dat")).unwrap();
        assert_eq!(data.len(), 8 * BLOCK_SIZE);
        assert!(data.iter().all(|&b| b == 0x6C));

        // Nothing at all
        s.format_lun(2, 0).unwrap();
        assert_eq!(s.read_descriptor(2).unwrap(), LunDescriptor::default());
        assert_eq!(
            s.lun_size_in_blocks(2),
            crate::scsi::descriptor::DEFAULT_BLOCKS
        );
    }

    #[test]
    fn host_formats_new_lun() {
        use crate::config::TargetConfig;
        use crate::scsi::Cdb;
        use crate::scsi::command::tests::{FakeBus, dispatcher};

        let tmp = TempDir::new("hostfmt");
        let mut s = ImageStorage::open(&tmp.0).unwrap();
        s.write_descriptor(1, &LunDescriptor::for_capacity(8)).unwrap();

        let mut d = dispatcher(TargetConfig::default());
        let cdb = Cdb([0x04, 0x20, 0, 0, 0, 0]);
        let outcome = d.dispatch(&cdb, 1, &mut s, &mut FakeBus::default());
        assert!(outcome.is_good());
        assert!(s.lun_exists(1));
        assert_eq!(s.lun_size_in_blocks(1), 8);
        let mut read = [0xFF; BLOCK_SIZE];
        s.read_sector(1, 7, &mut read).unwrap();
        assert_eq!(read, [0; BLOCK_SIZE]);
    }

    #[test]
    fn user_code_file() {
        let tmp = TempDir::new("ucd");
        let mut s = ImageStorage::open(&tmp.0).unwrap();
        s.create_lun(0, 1).unwrap();
        assert_eq!(s.lun_user_code(0), [0; USER_CODE_LEN]);

        fs::write(tmp.0.join("scsi0/scsi0.ucd"), b"ABCDE").unwrap();
        assert_eq!(s.lun_user_code(0), *b"ABCDE");

        // Short files are zero padded
        fs::write(tmp.0.join("scsi0/scsi0.ucd"), b"AB").unwrap();
        assert_eq!(s.lun_user_code(0), [b'A', b'B', 0, 0, 0]);
    }

    #[test]
    fn create_keeps_existing_image() {
        let tmp = TempDir::new("keep");
        let mut s = ImageStorage::open(&tmp.0).unwrap();
        s.create_lun(0, 2).unwrap();
        s.write_sector(0, 1, &[9; BLOCK_SIZE]).unwrap();
        s.create_lun(0, 2).unwrap();
        let mut read = [0; BLOCK_SIZE];
        s.read_sector(0, 1, &mut read).unwrap();
        assert_eq!(read, [9; BLOCK_SIZE]);
    }

    #[test]
    fn lun_directories() {
        let tmp = TempDir::new("dirs");
        let mut s = ImageStorage::open(&tmp.0).unwrap();
        s.create_lun(0, 1).unwrap();
        assert_eq!(s.set_lun_directory(2), Err(StorageError::NotFound));

        fs::create_dir_all(tmp.0.join("scsi2")).unwrap();
        s.set_lun_directory(2).unwrap();
        assert_eq!(s.lun_directory(), 2);
        assert!(!s.lun_exists(0));
    }

    #[test]
    fn stopped_lun_not_ready() {
        let tmp = TempDir::new("stop");
        let mut s = ImageStorage::open(&tmp.0).unwrap();
        s.create_lun(1, 2).unwrap();
        s.set_lun_ready(1, false).unwrap();
        assert!(s.lun_exists(1));
        assert!(!s.lun_ready(1));
        let mut buf = [0; BLOCK_SIZE];
        assert_eq!(s.read_sector(1, 0, &mut buf), Err(StorageError::NotReady));
        s.set_lun_ready(1, true).unwrap();
        assert!(s.read_sector(1, 0, &mut buf).is_ok());
    }

    #[test]
    fn fat_transfer_area() {
        let tmp = TempDir::new("fat");
        let transfer = tmp.0.join(TRANSFER_DIR);
        fs::create_dir_all(transfer.join("sub")).unwrap();
        fs::write(transfer.join("b.txt"), vec![7; 300]).unwrap();
        fs::write(transfer.join("a.txt"), b"hello").unwrap();
        fs::write(transfer.join(".hidden"), b"x").unwrap();

        let mut s = ImageStorage::open(&tmp.0).unwrap();
        s.set_fat_directory("/").unwrap();
        let names: Vec<String> = (0..4)
            .filter_map(|i| s.fat_file_info(i).unwrap())
            .map(|e| e.name)
            .collect();
        assert_eq!(names, ["a.txt", "b.txt", "sub"]);
        assert!(s.fat_file_info(2).unwrap().unwrap().is_dir);

        let mut buf = [0xFF; BLOCK_SIZE];
        s.read_fat_block(1, 1, &mut buf).unwrap();
        assert!(buf[..44].iter().all(|&b| b == 7));
        assert!(buf[44..].iter().all(|&b| b == 0));
        assert_eq!(s.read_fat_block(1, 2, &mut buf), Err(StorageError::OutOfRange));
        assert_eq!(s.read_fat_block(2, 0, &mut buf), Err(StorageError::NotFound));

        assert_eq!(s.set_fat_directory("../scsi0"), Err(StorageError::NotFound));
        s.set_fat_directory("sub").unwrap();
        assert_eq!(s.fat_file_info(0).unwrap(), None);
    }

    #[test]
    fn missing_root() {
        let tmp = TempDir::new("missing");
        assert!(ImageStorage::open(&tmp.0.join("nope")).is_err());
    }
}
