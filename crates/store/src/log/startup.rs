//! Startup and backup metadata sidecars.
//!
//! # Crash Safety: Dual-Slot Startup Metadata
//!
//! The startup record uses a dual-slot layout:
//! - The file contains TWO metadata slots (primary and secondary)
//! - A "god byte" indicates which slot is currently active
//! - Updates write to the INACTIVE slot, then flip the god byte
//! - Open reads both slots and uses the valid one
//!
//! This ensures there is always one valid slot to recover from, even if a
//! crash occurs while the metadata file is being rewritten. A missing or
//! unreadable startup file over a non-empty segment directory means the
//! log predates the hash-code format and must be migrated (opened
//! read-only, page hash verification disabled).

use byteorder::{BigEndian, ByteOrder};
use xxhash_rust::xxh3::xxh3_64;

use crate::error::{Address, Error, Result, NULL_ADDRESS};

/// Magic number of the startup metadata file.
pub const STARTUP_MAGIC: &[u8; 8] = b"SEDSTART";
/// Magic number of the backup metadata file.
pub const BACKUP_MAGIC: &[u8; 8] = b"SEDBCKUP";
/// Current environment format version.
pub const FORMAT_VERSION: u16 = 1;

/// Total startup metadata size on disk.
/// Layout: 16-byte common header + 2 x 64-byte slots + 112 bytes reserved.
pub const STARTUP_METADATA_SIZE: usize = 256;

/// A single metadata slot describing the log state at a point in time.
#[derive(Debug, Clone)]
pub struct MetadataSlot {
    /// Configured segment size.
    pub file_length_bound: u64,
    /// Address of the last known database root record.
    pub root_address: Address,
    /// High address at the time the slot was written.
    pub high_address: u64,
    /// Whether the log was closed cleanly after this slot was written.
    pub clean_close: bool,
    /// Whether the first (zero-address) segment has ever been written.
    pub used_first_file: bool,
    /// Unix epoch seconds of the write.
    pub timestamp: u64,
    /// XXH3-64 checksum of this slot's fields.
    pub checksum: u64,
}

impl Default for MetadataSlot {
    fn default() -> Self {
        Self {
            file_length_bound: 0,
            root_address: NULL_ADDRESS,
            high_address: 0,
            clean_close: false,
            used_first_file: false,
            timestamp: 0,
            checksum: 0,
        }
    }
}

const FLAG_CLEAN_CLOSE: u64 = 1;
const FLAG_USED_FIRST_FILE: u64 = 2;

impl MetadataSlot {
    /// Size of a slot on disk.
    pub const SIZE: usize = 64;

    /// Size of the checksum-protected region (5 x 8-byte fields).
    const CHECKSUMMED_SIZE: usize = 40;

    /// Serializes the slot, computing its checksum.
    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut buf = [0u8; Self::SIZE];
        BigEndian::write_u64(&mut buf[0..8], self.file_length_bound);
        BigEndian::write_u64(&mut buf[8..16], self.root_address);
        BigEndian::write_u64(&mut buf[16..24], self.high_address);
        let mut flags = 0;
        if self.clean_close {
            flags |= FLAG_CLEAN_CLOSE;
        }
        if self.used_first_file {
            flags |= FLAG_USED_FIRST_FILE;
        }
        BigEndian::write_u64(&mut buf[24..32], flags);
        BigEndian::write_u64(&mut buf[32..40], self.timestamp);
        let checksum = xxh3_64(&buf[..Self::CHECKSUMMED_SIZE]);
        BigEndian::write_u64(&mut buf[40..48], checksum);
        buf
    }

    /// Deserializes a slot; the checksum is kept as stored.
    pub fn from_bytes(buf: &[u8]) -> Option<Self> {
        if buf.len() < Self::SIZE {
            return None;
        }
        let flags = BigEndian::read_u64(&buf[24..32]);
        Some(Self {
            file_length_bound: BigEndian::read_u64(&buf[0..8]),
            root_address: BigEndian::read_u64(&buf[8..16]),
            high_address: BigEndian::read_u64(&buf[16..24]),
            clean_close: flags & FLAG_CLEAN_CLOSE != 0,
            used_first_file: flags & FLAG_USED_FIRST_FILE != 0,
            timestamp: BigEndian::read_u64(&buf[32..40]),
            checksum: BigEndian::read_u64(&buf[40..48]),
        })
    }

    /// Verifies the stored checksum against the slot's fields.
    pub fn verify_checksum(&self) -> bool {
        let buf = self.to_bytes();
        self.checksum == xxh3_64(&buf[..Self::CHECKSUMMED_SIZE])
    }
}

/// Startup metadata with dual-slot crash safety.
///
/// Layout (256 bytes total):
/// - Bytes 0-15: common header (magic, format version, page-size power,
///   god byte at offset 15)
/// - Bytes 16-79: slot 0
/// - Bytes 80-143: slot 1
/// - Bytes 144-255: reserved
#[derive(Debug, Clone)]
pub struct StartupMetadata {
    /// Page size as a power of two.
    pub page_size_power: u8,
    /// Bit 0 selects the primary slot.
    pub god_byte: u8,
    /// Slot 0.
    pub slot0: MetadataSlot,
    /// Slot 1.
    pub slot1: MetadataSlot,
}

impl StartupMetadata {
    /// Creates fresh metadata for a new log.
    pub fn new(page_size_power: u8, file_length_bound: u64) -> Self {
        let slot = MetadataSlot { file_length_bound, ..MetadataSlot::default() };
        Self { page_size_power, god_byte: 0, slot0: slot.clone(), slot1: slot }
    }

    /// Index of the primary (active) slot.
    pub fn primary_slot_index(&self) -> usize {
        (self.god_byte & 1) as usize
    }

    /// Reference to the primary (active) slot.
    pub fn primary_slot(&self) -> &MetadataSlot {
        if self.primary_slot_index() == 0 {
            &self.slot0
        } else {
            &self.slot1
        }
    }

    /// Mutable reference to the secondary (inactive) slot.
    pub fn secondary_slot_mut(&mut self) -> &mut MetadataSlot {
        if self.primary_slot_index() == 0 {
            &mut self.slot1
        } else {
            &mut self.slot0
        }
    }

    /// Reference to a slot by index.
    pub fn slot(&self, index: usize) -> &MetadataSlot {
        if index == 0 {
            &self.slot0
        } else {
            &self.slot1
        }
    }

    /// Toggles which slot is primary.
    pub fn flip_primary_slot(&mut self) {
        self.god_byte ^= 1;
    }

    /// Serializes the metadata file image.
    pub fn to_bytes(&self) -> [u8; STARTUP_METADATA_SIZE] {
        let mut buf = [0u8; STARTUP_METADATA_SIZE];
        buf[0..8].copy_from_slice(STARTUP_MAGIC);
        BigEndian::write_u16(&mut buf[8..10], FORMAT_VERSION);
        buf[10] = self.page_size_power;
        buf[15] = self.god_byte;
        buf[16..16 + MetadataSlot::SIZE].copy_from_slice(&self.slot0.to_bytes());
        buf[80..80 + MetadataSlot::SIZE].copy_from_slice(&self.slot1.to_bytes());
        buf
    }

    /// Deserializes a metadata file image.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Corrupted`] for short buffers or malformed slots,
    /// [`Error::InvalidSetting`] for a bad magic number or an unsupported
    /// future format version.
    pub fn from_bytes(buf: &[u8]) -> Result<Self> {
        if buf.len() < STARTUP_METADATA_SIZE {
            return Err(Error::corrupted(0, "startup metadata too short"));
        }
        if &buf[0..8] != STARTUP_MAGIC {
            return Err(Error::InvalidSetting {
                reason: "startup metadata has an invalid magic number".to_string(),
            });
        }
        let version = BigEndian::read_u16(&buf[8..10]);
        if version > FORMAT_VERSION {
            return Err(Error::InvalidSetting {
                reason: format!("unsupported environment format version {version}"),
            });
        }
        let slot0 = MetadataSlot::from_bytes(&buf[16..16 + MetadataSlot::SIZE])
            .ok_or_else(|| Error::corrupted(0, "failed to parse metadata slot 0"))?;
        let slot1 = MetadataSlot::from_bytes(&buf[80..80 + MetadataSlot::SIZE])
            .ok_or_else(|| Error::corrupted(0, "failed to parse metadata slot 1"))?;
        Ok(Self { page_size_power: buf[10], god_byte: buf[15], slot0, slot1 })
    }

    /// Validates the slots and returns the index of the one to use.
    ///
    /// Tries the slot indicated by the god byte first and falls back to
    /// the other if its checksum is invalid.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Corrupted`] if both slots have invalid checksums.
    pub fn validate_and_choose_slot(&self) -> Result<usize> {
        let primary = self.primary_slot_index();
        if self.slot(primary).verify_checksum() {
            return Ok(primary);
        }
        let secondary = 1 - primary;
        if self.slot(secondary).verify_checksum() {
            return Ok(secondary);
        }
        Err(Error::corrupted(0, "both startup metadata slots have invalid checksums"))
    }

    /// Page size in bytes.
    pub fn page_size(&self) -> usize {
        1 << self.page_size_power
    }
}

/// Backup metadata pinning the restore point of a dynamic backup.
///
/// Layout (32 bytes): magic, last file address, last file offset,
/// XXH3-64 checksum of the preceding 24 bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackupMetadata {
    /// Address of the last segment included in the backup.
    pub last_file_address: u64,
    /// Number of valid bytes in that segment.
    pub last_file_offset: u64,
}

impl BackupMetadata {
    /// Total backup metadata size on disk.
    pub const SIZE: usize = 32;

    /// Serializes the backup record.
    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut buf = [0u8; Self::SIZE];
        buf[0..8].copy_from_slice(BACKUP_MAGIC);
        BigEndian::write_u64(&mut buf[8..16], self.last_file_address);
        BigEndian::write_u64(&mut buf[16..24], self.last_file_offset);
        let checksum = xxh3_64(&buf[..24]);
        BigEndian::write_u64(&mut buf[24..32], checksum);
        buf
    }

    /// Deserializes and verifies a backup record; `None` if malformed.
    pub fn from_bytes(buf: &[u8]) -> Option<Self> {
        if buf.len() < Self::SIZE || &buf[0..8] != BACKUP_MAGIC {
            return None;
        }
        if BigEndian::read_u64(&buf[24..32]) != xxh3_64(&buf[..24]) {
            return None;
        }
        Some(Self {
            last_file_address: BigEndian::read_u64(&buf[8..16]),
            last_file_offset: BigEndian::read_u64(&buf[16..24]),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_slot_round_trip() {
        let slot = MetadataSlot {
            file_length_bound: 1 << 20,
            root_address: 0x1234,
            high_address: 0x2000,
            clean_close: true,
            used_first_file: true,
            timestamp: 1_700_000_000,
            checksum: 0,
        };
        let bytes = slot.to_bytes();
        let recovered = MetadataSlot::from_bytes(&bytes).unwrap();
        assert_eq!(recovered.file_length_bound, 1 << 20);
        assert_eq!(recovered.root_address, 0x1234);
        assert_eq!(recovered.high_address, 0x2000);
        assert!(recovered.clean_close);
        assert!(recovered.used_first_file);
        assert!(recovered.verify_checksum());
    }

    #[test]
    fn test_metadata_round_trip() {
        let meta = StartupMetadata::new(12, 1 << 20);
        let bytes = meta.to_bytes();
        let recovered = StartupMetadata::from_bytes(&bytes).unwrap();
        assert_eq!(recovered.page_size(), 4096);
        assert_eq!(recovered.god_byte, 0);
        assert_eq!(recovered.validate_and_choose_slot().unwrap(), 0);
    }

    #[test]
    fn test_dual_slot_fallback() {
        let mut meta = StartupMetadata::new(12, 1 << 20);
        meta.secondary_slot_mut().root_address = 0x42;
        meta.flip_primary_slot();
        let mut bytes = meta.to_bytes();

        // Corrupt the primary (slot 1) checksum; open must fall back to
        // slot 0.
        bytes[80 + 40] ^= 0xff;
        let recovered = StartupMetadata::from_bytes(&bytes).unwrap();
        assert_eq!(recovered.primary_slot_index(), 1);
        assert_eq!(recovered.validate_and_choose_slot().unwrap(), 0);
    }

    #[test]
    fn test_both_slots_corrupt() {
        let meta = StartupMetadata::new(12, 1 << 20);
        let mut bytes = meta.to_bytes();
        bytes[16 + 40] ^= 0xff;
        bytes[80 + 40] ^= 0xff;
        let recovered = StartupMetadata::from_bytes(&bytes).unwrap();
        assert!(recovered.validate_and_choose_slot().is_err());
    }

    #[test]
    fn test_bad_magic_is_invalid_setting() {
        let meta = StartupMetadata::new(12, 1 << 20);
        let mut bytes = meta.to_bytes();
        bytes[0] = b'X';
        match StartupMetadata::from_bytes(&bytes) {
            Err(Error::InvalidSetting { .. }) => {}
            other => panic!("expected InvalidSetting, got {other:?}"),
        }
    }

    #[test]
    fn test_backup_metadata_round_trip() {
        let backup = BackupMetadata { last_file_address: 0x100000, last_file_offset: 8192 };
        let bytes = backup.to_bytes();
        assert_eq!(BackupMetadata::from_bytes(&bytes), Some(backup));

        let mut corrupt = bytes;
        corrupt[20] ^= 0x01;
        assert_eq!(BackupMetadata::from_bytes(&corrupt), None);
    }
}
