//! In-memory backend for testing.
//!
//! A [`MemoryStorage`] owns the segment map; readers and writers created
//! from it share the same underlying state, so a log can be closed and
//! reopened over the same storage to exercise recovery paths without
//! touching the filesystem.

use std::{
    collections::{BTreeMap, HashMap},
    sync::Arc,
    time::Duration,
};

use parking_lot::RwLock;

use super::{Block, DataReader, DataWriter, RemoveBlockKind};
use crate::error::{Error, Result};

#[derive(Default)]
struct MemoryState {
    blocks: BTreeMap<u64, Vec<u8>>,
    metadata: HashMap<String, Vec<u8>>,
    locked: bool,
}

/// Shared in-memory storage; clone handles freely.
#[derive(Clone, Default)]
pub struct MemoryStorage {
    state: Arc<RwLock<MemoryState>>,
}

impl MemoryStorage {
    /// Creates empty storage.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a reader over this storage.
    pub fn reader(&self) -> MemoryDataReader {
        MemoryDataReader { state: Arc::clone(&self.state) }
    }

    /// Creates a writer over this storage.
    pub fn writer(&self) -> MemoryDataWriter {
        MemoryDataWriter { state: Arc::clone(&self.state), lock_held: false }
    }

    /// Number of segments currently stored.
    pub fn block_count(&self) -> usize {
        self.state.read().blocks.len()
    }

    /// Truncates the segment at `address` to `length` bytes, bypassing the
    /// writer. Test hook for simulating torn tails.
    pub fn corrupt_truncate(&self, address: u64, length: usize) {
        let mut state = self.state.write();
        if let Some(data) = state.blocks.get_mut(&address) {
            data.truncate(length);
        }
    }

    /// Flips one byte of the segment at `address`. Test hook.
    pub fn corrupt_byte(&self, address: u64, offset: usize) {
        let mut state = self.state.write();
        if let Some(data) = state.blocks.get_mut(&address) {
            if let Some(b) = data.get_mut(offset) {
                *b ^= 0xff;
            }
        }
    }
}

/// Read side of the in-memory backend.
pub struct MemoryDataReader {
    state: Arc<RwLock<MemoryState>>,
}

struct MemoryBlock {
    address: u64,
    // Snapshot taken at open; immutable-before-tail semantics make this
    // equivalent to reading the live segment.
    data: Vec<u8>,
}

impl Block for MemoryBlock {
    fn address(&self) -> u64 {
        self.address
    }

    fn length(&self) -> Result<u64> {
        Ok(self.data.len() as u64)
    }

    fn read(&self, buf: &mut [u8], offset: u64) -> Result<usize> {
        let offset = offset as usize;
        if offset >= self.data.len() {
            return Ok(0);
        }
        let n = buf.len().min(self.data.len() - offset);
        buf[..n].copy_from_slice(&self.data[offset..offset + n]);
        Ok(n)
    }
}

impl DataReader for MemoryDataReader {
    fn block_addresses(&self) -> Result<Vec<u64>> {
        Ok(self.state.read().blocks.keys().copied().collect())
    }

    fn block(&self, address: u64) -> Result<Box<dyn Block>> {
        let state = self.state.read();
        let data = state
            .blocks
            .get(&address)
            .cloned()
            .ok_or(Error::BlockNotFound { address })?;
        Ok(Box::new(MemoryBlock { address, data }))
    }

    fn read_metadata(&self, name: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.state.read().metadata.get(name).cloned())
    }
}

/// Write side of the in-memory backend.
pub struct MemoryDataWriter {
    state: Arc<RwLock<MemoryState>>,
    lock_held: bool,
}

impl DataWriter for MemoryDataWriter {
    fn write(&mut self, block_address: u64, offset: u64, data: &[u8]) -> Result<()> {
        let mut state = self.state.write();
        let block = state.blocks.entry(block_address).or_default();
        let end = offset as usize + data.len();
        if block.len() < end {
            block.resize(end, 0);
        }
        block[offset as usize..end].copy_from_slice(data);
        Ok(())
    }

    fn truncate_block(&mut self, block_address: u64, new_length: u64) -> Result<()> {
        let mut state = self.state.write();
        match state.blocks.get_mut(&block_address) {
            Some(block) => {
                block.truncate(new_length as usize);
                Ok(())
            }
            None => Err(Error::BlockNotFound { address: block_address }),
        }
    }

    fn remove_block(&mut self, block_address: u64, _kind: RemoveBlockKind) -> Result<()> {
        self.state.write().blocks.remove(&block_address);
        Ok(())
    }

    fn write_metadata(&mut self, name: &str, data: &[u8]) -> Result<()> {
        self.state.write().metadata.insert(name.to_string(), data.to_vec());
        Ok(())
    }

    fn remove_metadata(&mut self, name: &str) -> Result<()> {
        self.state.write().metadata.remove(name);
        Ok(())
    }

    fn sync(&mut self) -> Result<()> {
        Ok(())
    }

    fn lock(&mut self, _timeout: Duration) -> Result<()> {
        let mut state = self.state.write();
        if state.locked && !self.lock_held {
            return Err(Error::LockFailed { details: "storage already locked".to_string() });
        }
        state.locked = true;
        self.lock_held = true;
        Ok(())
    }

    fn lock_info(&self) -> Option<String> {
        self.state.read().locked.then(|| "in-memory lock".to_string())
    }

    fn release_lock(&mut self) -> Result<()> {
        if self.lock_held {
            self.state.write().locked = false;
            self.lock_held = false;
        }
        Ok(())
    }
}

impl Drop for MemoryDataWriter {
    fn drop(&mut self) {
        let _ = self.release_lock();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_round_trip() {
        let storage = MemoryStorage::new();
        let mut writer = storage.writer();
        let reader = storage.reader();

        writer.write(0, 0, &[1, 2, 3]).unwrap();
        writer.write(0, 10, &[9]).unwrap();

        let block = reader.block(0).unwrap();
        assert_eq!(block.length().unwrap(), 11);

        let mut buf = [0u8; 3];
        assert_eq!(block.read(&mut buf, 0).unwrap(), 3);
        assert_eq!(buf, [1, 2, 3]);

        // Reads past the end are short.
        let mut tail = [0u8; 8];
        assert_eq!(block.read(&mut tail, 8).unwrap(), 3);
    }

    #[test]
    fn test_memory_lock_exclusion() {
        let storage = MemoryStorage::new();
        let mut a = storage.writer();
        let mut b = storage.writer();

        a.lock(Duration::from_millis(1)).unwrap();
        assert!(b.lock(Duration::from_millis(1)).is_err());
        a.release_lock().unwrap();
        b.lock(Duration::from_millis(1)).unwrap();
    }
}
