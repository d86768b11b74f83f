//! File-based backend using position-based I/O (`pread`/`pwrite`).
//!
//! On Unix, reads are lock-free via [`std::os::unix::fs::FileExt`]:
//! `read_at()` takes `&self` and never touches the file cursor, allowing
//! concurrent readers with zero synchronization. The single-writer
//! discipline of the log means the writer side needs no locking either.

#[cfg(unix)]
use std::os::unix::fs::FileExt;
#[cfg(windows)]
use std::os::windows::fs::FileExt;
use std::{
    collections::HashMap,
    fs::{self, File, OpenOptions},
    io::Write,
    path::{Path, PathBuf},
    time::{Duration, Instant},
};

use super::{
    parse_segment_file_name, segment_file_name, Block, DataReader, DataWriter, RemoveBlockKind,
    DELETED_EXT, TEMP_EXT,
};
use crate::error::{Error, Result};

/// Name of the advisory lock file inside a log directory.
const LOCK_FILE_NAME: &str = "sediment.lck";

/// Read side of the filesystem backend.
pub struct FileDataReader {
    dir: PathBuf,
}

impl FileDataReader {
    /// Creates a reader over the given log directory.
    ///
    /// The directory is created if it does not exist.
    pub fn new(dir: impl AsRef<Path>) -> Result<Self> {
        fs::create_dir_all(dir.as_ref())?;
        Ok(Self { dir: dir.as_ref().to_path_buf() })
    }

    /// The directory this reader serves.
    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

struct FileBlock {
    file: File,
    address: u64,
}

impl Block for FileBlock {
    fn address(&self) -> u64 {
        self.address
    }

    fn length(&self) -> Result<u64> {
        Ok(self.file.metadata()?.len())
    }

    fn read(&self, buf: &mut [u8], offset: u64) -> Result<usize> {
        read_at_offset(&self.file, buf, offset)
    }
}

impl DataReader for FileDataReader {
    fn block_addresses(&self) -> Result<Vec<u64>> {
        let mut addresses = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let entry = entry?;
            if let Some(name) = entry.file_name().to_str() {
                if let Some(address) = parse_segment_file_name(name) {
                    addresses.push(address);
                }
            }
        }
        addresses.sort_unstable();
        Ok(addresses)
    }

    fn block(&self, address: u64) -> Result<Box<dyn Block>> {
        let path = self.dir.join(segment_file_name(address));
        let file = File::open(&path).map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => Error::BlockNotFound { address },
            _ => Error::from(e),
        })?;
        Ok(Box::new(FileBlock { file, address }))
    }

    fn read_metadata(&self, name: &str) -> Result<Option<Vec<u8>>> {
        match fs::read(self.dir.join(name)) {
            Ok(data) => Ok(Some(data)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

/// Write side of the filesystem backend.
///
/// Keeps an open handle per touched segment so repeated page writes to the
/// tail do not reopen the file; handles are dropped when a segment is
/// removed.
pub struct FileDataWriter {
    dir: PathBuf,
    files: HashMap<u64, File>,
    lock_held: bool,
}

impl FileDataWriter {
    /// Creates a writer over the given log directory.
    pub fn new(dir: impl AsRef<Path>) -> Result<Self> {
        fs::create_dir_all(dir.as_ref())?;
        Ok(Self { dir: dir.as_ref().to_path_buf(), files: HashMap::new(), lock_held: false })
    }

    fn segment_path(&self, address: u64) -> PathBuf {
        self.dir.join(segment_file_name(address))
    }

    fn open_segment(&mut self, address: u64) -> Result<&File> {
        if !self.files.contains_key(&address) {
            let file = OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .open(self.segment_path(address))?;
            self.files.insert(address, file);
        }
        Ok(&self.files[&address])
    }

    fn lock_path(&self) -> PathBuf {
        self.dir.join(LOCK_FILE_NAME)
    }
}

impl DataWriter for FileDataWriter {
    fn write(&mut self, block_address: u64, offset: u64, data: &[u8]) -> Result<()> {
        let file = self.open_segment(block_address)?;
        write_all_at_offset(file, data, offset)
    }

    fn truncate_block(&mut self, block_address: u64, new_length: u64) -> Result<()> {
        self.files.remove(&block_address);
        let path = self.segment_path(block_address);
        let tmp_path = path.with_extension(TEMP_EXT);

        // Stage the surviving prefix in a temp file, then move it into
        // place so a crash mid-truncation leaves either the old or the new
        // segment, never a half-written one.
        let source = File::open(&path)?;
        let mut prefix = vec![0u8; new_length as usize];
        let read = read_at_offset(&source, &mut prefix, 0)?;
        prefix.truncate(read);

        let mut tmp = File::create(&tmp_path)?;
        tmp.write_all(&prefix)?;
        tmp.sync_all()?;
        drop(tmp);

        fs::rename(&tmp_path, &path)?;
        Ok(())
    }

    fn remove_block(&mut self, block_address: u64, kind: RemoveBlockKind) -> Result<()> {
        self.files.remove(&block_address);
        let path = self.segment_path(block_address);
        match kind {
            RemoveBlockKind::Delete => fs::remove_file(&path)?,
            RemoveBlockKind::Rename => fs::rename(&path, path.with_extension(DELETED_EXT))?,
        }
        Ok(())
    }

    fn write_metadata(&mut self, name: &str, data: &[u8]) -> Result<()> {
        let path = self.dir.join(name);
        let tmp_path = path.with_extension(TEMP_EXT);
        let mut tmp = File::create(&tmp_path)?;
        tmp.write_all(data)?;
        tmp.sync_all()?;
        drop(tmp);
        fs::rename(&tmp_path, &path)?;
        Ok(())
    }

    fn remove_metadata(&mut self, name: &str) -> Result<()> {
        match fs::remove_file(self.dir.join(name)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn sync(&mut self) -> Result<()> {
        for file in self.files.values() {
            file.sync_data()?;
        }
        Ok(())
    }

    fn lock(&mut self, timeout: Duration) -> Result<()> {
        if self.lock_held {
            return Ok(());
        }
        let path = self.lock_path();
        let deadline = Instant::now() + timeout;
        loop {
            match OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(mut file) => {
                    let stamp = format!("pid {}", std::process::id());
                    file.write_all(stamp.as_bytes())?;
                    file.sync_all()?;
                    self.lock_held = true;
                    return Ok(());
                }
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                    if Instant::now() >= deadline {
                        let details = self
                            .lock_info()
                            .unwrap_or_else(|| "lock holder unknown".to_string());
                        return Err(Error::LockFailed { details });
                    }
                    std::thread::sleep(Duration::from_millis(50));
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    fn lock_info(&self) -> Option<String> {
        fs::read_to_string(self.lock_path()).ok()
    }

    fn release_lock(&mut self) -> Result<()> {
        if self.lock_held {
            self.lock_held = false;
            match fs::remove_file(self.lock_path()) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }
}

impl Drop for FileDataWriter {
    fn drop(&mut self) {
        let _ = self.release_lock();
    }
}

// ---------------------------------------------------------------------------
// Platform-specific position-based I/O helpers
// ---------------------------------------------------------------------------

/// Reads up to `buf.len()` bytes from `file` at `offset`, returning the
/// number of bytes read. On Unix this is `pread(2)` — no lock, no cursor
/// mutation.
#[cfg(unix)]
fn read_at_offset(file: &File, buf: &mut [u8], offset: u64) -> Result<usize> {
    let mut pos = 0;
    while pos < buf.len() {
        let n = file.read_at(&mut buf[pos..], offset + pos as u64)?;
        if n == 0 {
            break;
        }
        pos += n;
    }
    Ok(pos)
}

/// Windows fallback: `seek_read` updates the file cursor; the single-writer
/// model keeps this safe.
#[cfg(windows)]
fn read_at_offset(file: &File, buf: &mut [u8], offset: u64) -> Result<usize> {
    let mut pos = 0;
    while pos < buf.len() {
        let n = file.seek_read(&mut buf[pos..], offset + pos as u64)?;
        if n == 0 {
            break;
        }
        pos += n;
    }
    Ok(pos)
}

/// Writes all of `data` to `file` at `offset`, extending the file as needed.
#[cfg(unix)]
fn write_all_at_offset(file: &File, data: &[u8], offset: u64) -> Result<()> {
    file.write_all_at(data, offset)?;
    Ok(())
}

/// Windows fallback for positional writes.
#[cfg(windows)]
fn write_all_at_offset(file: &File, data: &[u8], offset: u64) -> Result<()> {
    let mut pos = 0;
    while pos < data.len() {
        let n = file.seek_write(&data[pos..], offset + pos as u64)?;
        pos += n;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use tempfile::tempdir;

    use super::*;

    #[test]
    fn test_write_read_round_trip() {
        let dir = tempdir().unwrap();
        let mut writer = FileDataWriter::new(dir.path()).unwrap();
        let reader = FileDataReader::new(dir.path()).unwrap();

        writer.write(0, 0, &[0xde, 0xad, 0xbe, 0xef]).unwrap();
        writer.write(0, 4096, &[0x42]).unwrap();
        writer.sync().unwrap();

        let block = reader.block(0).unwrap();
        assert_eq!(block.length().unwrap(), 4097);

        let mut buf = [0u8; 4];
        assert_eq!(block.read(&mut buf, 0).unwrap(), 4);
        assert_eq!(buf, [0xde, 0xad, 0xbe, 0xef]);

        // The hole between the writes reads as zeros.
        let mut hole = [0xffu8; 4];
        assert_eq!(block.read(&mut hole, 100).unwrap(), 4);
        assert_eq!(hole, [0, 0, 0, 0]);
    }

    #[test]
    fn test_block_enumeration_ignores_foreign_files() {
        let dir = tempdir().unwrap();
        let mut writer = FileDataWriter::new(dir.path()).unwrap();
        let reader = FileDataReader::new(dir.path()).unwrap();

        writer.write(0, 0, &[1]).unwrap();
        writer.write(0x100000, 0, &[2]).unwrap();
        writer.write_metadata("startup.meta", &[0; 16]).unwrap();
        std::fs::write(dir.path().join("notes.txt"), b"hi").unwrap();

        assert_eq!(reader.block_addresses().unwrap(), vec![0, 0x100000]);
    }

    #[test]
    fn test_truncate_block() {
        let dir = tempdir().unwrap();
        let mut writer = FileDataWriter::new(dir.path()).unwrap();
        let reader = FileDataReader::new(dir.path()).unwrap();

        writer.write(0, 0, &vec![0xaa; 8192]).unwrap();
        writer.truncate_block(0, 4096).unwrap();

        let block = reader.block(0).unwrap();
        assert_eq!(block.length().unwrap(), 4096);
        // No temp file left behind.
        assert!(!dir.path().join("0000000000000000.tmp").exists());
    }

    #[test]
    fn test_remove_block_kinds() {
        let dir = tempdir().unwrap();
        let mut writer = FileDataWriter::new(dir.path()).unwrap();
        let reader = FileDataReader::new(dir.path()).unwrap();

        writer.write(0, 0, &[1]).unwrap();
        writer.write(0x100000, 0, &[2]).unwrap();

        writer.remove_block(0, RemoveBlockKind::Delete).unwrap();
        writer.remove_block(0x100000, RemoveBlockKind::Rename).unwrap();

        assert!(reader.block_addresses().unwrap().is_empty());
        assert!(dir.path().join("0000000000100000.del").exists());
    }

    #[test]
    fn test_lock_conflict_reports_holder() {
        let dir = tempdir().unwrap();
        let mut first = FileDataWriter::new(dir.path()).unwrap();
        first.lock(Duration::from_millis(10)).unwrap();

        let mut second = FileDataWriter::new(dir.path()).unwrap();
        let err = second.lock(Duration::from_millis(50)).unwrap_err();
        match err {
            Error::LockFailed { details } => assert!(details.contains("pid"), "got: {details}"),
            other => panic!("expected LockFailed, got {other:?}"),
        }

        first.release_lock().unwrap();
        second.lock(Duration::from_millis(500)).unwrap();
    }

    #[test]
    fn test_metadata_round_trip() {
        let dir = tempdir().unwrap();
        let mut writer = FileDataWriter::new(dir.path()).unwrap();
        let reader = FileDataReader::new(dir.path()).unwrap();

        assert_eq!(reader.read_metadata("startup.meta").unwrap(), None);
        writer.write_metadata("startup.meta", &[1, 2, 3]).unwrap();
        assert_eq!(reader.read_metadata("startup.meta").unwrap(), Some(vec![1, 2, 3]));
        writer.remove_metadata("startup.meta").unwrap();
        assert_eq!(reader.read_metadata("startup.meta").unwrap(), None);
    }
}
