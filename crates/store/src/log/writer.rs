//! The single-writer tail of the log.
//!
//! [`WriterState`] owns the plaintext tail page and the queue of sealed
//! page images awaiting flush. It performs the spec'd write-path layout:
//! small records never split across pages (the page is null-padded
//! instead), no record straddles a segment boundary, and a filled page is
//! immediately sealed with its trailer hash.

use std::sync::Arc;

use super::blockset::{BlockSet, BlockSetBuilder};
use super::loggable::{encode_header, PageData};
use super::page::{PageCodec, NULL_BYTE, SMALL_RECORD_SHIFT};
use crate::error::{Address, Error, Result};

/// A sealed page image queued for flushing, together with the plaintext
/// the cache retains.
pub(crate) struct PendingPage {
    /// Page address.
    pub address: Address,
    /// On-disk image: enciphered, null-padded, trailer written.
    pub image: Vec<u8>,
    /// Plaintext image for the page cache.
    pub plain: PageData,
}

/// In-memory state of the writer between `begin_write` and `end_write`.
pub(crate) struct WriterState {
    codec: PageCodec,
    file_length_bound: u64,
    /// Plaintext tail page buffer.
    tail: Vec<u8>,
    /// Page address of the tail buffer.
    tail_address: Address,
    /// Bytes of the tail's data region in use.
    tail_fill: usize,
    /// Sealed pages not yet handed to the data writer.
    pub pending: Vec<PendingPage>,
    /// Segment set under construction.
    pub blocks: BlockSetBuilder,
    /// Segments created since the last drain, for listener notification.
    pub created_blocks: Vec<Address>,
}

impl WriterState {
    pub fn new(
        codec: PageCodec,
        file_length_bound: u64,
        blocks: &BlockSet,
        high_address: Address,
        tail_plain: Vec<u8>,
    ) -> Self {
        let mut tail_address = codec.page_address(high_address);
        let mut tail_fill = codec.page_offset(high_address);
        let mut tail_plain = tail_plain;
        debug_assert!(tail_fill <= codec.data_space());
        debug_assert_eq!(tail_plain.len(), codec.page_size());
        // A recovered high address at the end of a fully-padded data
        // region resumes on the next page.
        if tail_fill == codec.data_space() {
            tail_address += codec.page_size() as u64;
            tail_fill = 0;
            tail_plain.fill(0);
        }
        Self {
            codec,
            file_length_bound,
            tail: tail_plain,
            tail_address,
            tail_fill,
            pending: Vec::new(),
            blocks: blocks.builder(),
            created_blocks: Vec::new(),
        }
    }

    /// The pending high address: the first byte past the last queued
    /// record.
    pub fn position(&self) -> Address {
        self.tail_address + self.tail_fill as u64
    }

    /// Address of the segment the tail page belongs to.
    pub fn file_address(&self) -> Address {
        self.tail_address - self.tail_address % self.file_length_bound
    }

    /// Payload bytes still available in the current segment.
    fn remaining_in_file(&self) -> u64 {
        let space = self.codec.data_space() as u64;
        let page_size = self.codec.page_size() as u64;
        let file_end = self.file_address() + self.file_length_bound;
        let pages_after_tail = (file_end - self.tail_address) / page_size - 1;
        (self.codec.data_space() - self.tail_fill) as u64 + pages_after_tail * space
    }

    /// Appends one record.
    ///
    /// Returns the record's address, or `None` if it does not fit into the
    /// current segment (the caller pads to the segment end and retries).
    ///
    /// # Errors
    ///
    /// Returns [`Error::TooBigLoggable`] if the record cannot fit even
    /// into an empty segment.
    pub fn write_record(
        &mut self,
        type_id: u8,
        structure_id: u64,
        data: &[u8],
    ) -> Result<Option<Address>> {
        let header = encode_header(type_id, structure_id, data.len());
        let total = header.len() + data.len();

        let space = self.codec.data_space() as u64;
        let file_capacity = self.file_length_bound / self.codec.page_size() as u64 * space;
        if total as u64 > file_capacity {
            return Err(Error::TooBigLoggable { length: total, bound: self.file_length_bound });
        }

        // Small records are never split across pages: pad the rest of the
        // page with nulls and start a fresh one.
        let room_in_page = self.codec.data_space() - self.tail_fill;
        if total > room_in_page && total < self.codec.page_size() >> SMALL_RECORD_SHIFT {
            self.pad_page_with_nulls();
        }

        if (self.remaining_in_file() as usize) < total {
            return Ok(None);
        }

        let address = self.position();
        self.push_bytes(&header);
        self.push_bytes(data);
        Ok(Some(address))
    }

    /// Fills the rest of the tail page with null records and seals it.
    pub fn pad_page_with_nulls(&mut self) {
        let space = self.codec.data_space();
        for b in self.tail[self.tail_fill..space].iter_mut() {
            *b = NULL_BYTE;
        }
        self.tail_fill = space;
        self.seal_tail_full();
    }

    /// Pads with null records (and whole null pages) up to the end of the
    /// current segment, so a retried record starts in a fresh one.
    pub fn pad_to_file_end(&mut self) {
        if self.tail_fill == 0 && self.tail_address % self.file_length_bound == 0 {
            return;
        }
        let file_end = self.file_address() + self.file_length_bound;
        while self.tail_address < file_end {
            self.pad_page_with_nulls();
        }
    }

    fn push_bytes(&mut self, mut bytes: &[u8]) {
        let space = self.codec.data_space();
        while !bytes.is_empty() {
            self.ensure_block();
            let room = space - self.tail_fill;
            let n = room.min(bytes.len());
            self.tail[self.tail_fill..self.tail_fill + n].copy_from_slice(&bytes[..n]);
            self.tail_fill += n;
            bytes = &bytes[n..];
            if self.tail_fill == space {
                self.seal_tail_full();
            }
        }
    }

    /// Registers the segment of the tail page the first time a byte is
    /// written into it.
    fn ensure_block(&mut self) {
        let file_address = self.file_address();
        if self.blocks.last() != Some(file_address) {
            self.blocks.add(file_address);
            self.created_blocks.push(file_address);
        }
    }

    fn seal_tail_full(&mut self) {
        debug_assert_eq!(self.tail_fill, self.codec.data_space());
        self.ensure_block();
        let image = self.codec.seal(&self.tail, self.tail_fill, self.tail_address);
        let plain = self.padded_plain();
        self.pending.push(PendingPage { address: self.tail_address, image, plain });
        self.tail_address += self.codec.page_size() as u64;
        self.tail.fill(0);
        self.tail_fill = 0;
    }

    /// Plaintext image of the tail with nulls past the fill point, as the
    /// cache should retain it.
    pub fn padded_plain(&self) -> PageData {
        let mut plain = self.tail.clone();
        for b in plain[self.tail_fill..self.codec.data_space()].iter_mut() {
            *b = NULL_BYTE;
        }
        Arc::from(plain.into_boxed_slice())
    }

    /// Snapshot of the partially-filled tail for a commit: the sealed
    /// on-disk image plus the plaintext for the cache. `None` when the
    /// tail page is empty.
    pub fn tail_snapshot(&mut self) -> Option<PendingPage> {
        if self.tail_fill == 0 {
            return None;
        }
        self.ensure_block();
        let image = self.codec.seal(&self.tail, self.tail_fill, self.tail_address);
        Some(PendingPage { address: self.tail_address, image, plain: self.padded_plain() })
    }

    /// Address of the tail page.
    pub fn tail_address(&self) -> Address {
        self.tail_address
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::log::loggable::{encoded_length, BTREE_LEAF, DATABASE_ROOT_TYPE};

    const PAGE: usize = 256;
    const FILE: u64 = 1024;

    fn state() -> WriterState {
        let codec = PageCodec::new(PAGE, true, None);
        WriterState::new(codec, FILE, &BlockSet::empty(), 0, vec![0u8; PAGE])
    }

    #[test]
    fn test_single_record_layout() {
        let mut w = state();
        let addr = w.write_record(BTREE_LEAF, 7, b"hello").unwrap().unwrap();
        assert_eq!(addr, 0);
        assert_eq!(w.position() as usize, encoded_length(7, 5));
        assert_eq!(w.blocks.last(), Some(0));
    }

    #[test]
    fn test_small_record_pads_page() {
        let mut w = state();
        let space = PAGE - 8;
        // Nearly fill the first page.
        w.write_record(BTREE_LEAF, 1, &vec![0xaa; space - 10]).unwrap().unwrap();

        // A small record that does not fit lands at the next page start.
        let addr = w.write_record(DATABASE_ROOT_TYPE, 0, &[0u8; 12]).unwrap().unwrap();
        assert_eq!(addr, PAGE as u64);
        assert_eq!(w.pending.len(), 1);
        let padded = &w.pending[0].plain;
        assert!(padded[space - 6..space].iter().all(|&b| b == NULL_BYTE));
    }

    #[test]
    fn test_record_spans_pages() {
        let mut w = state();
        // Larger than a page but well under the segment: spans pages.
        let data = vec![0x55u8; PAGE];
        let addr = w.write_record(BTREE_LEAF, 1, &data).unwrap().unwrap();
        assert_eq!(addr, 0);
        assert!(w.pending.len() >= 1, "first page must have been sealed");
        // Position advanced past one trailer.
        assert_eq!(w.position() as usize, encoded_length(1, data.len()) + 8);
    }

    #[test]
    fn test_segment_boundary_refusal_and_retry() {
        let mut w = state();
        let space = PAGE - 8;
        // Fill three of the four pages.
        for _ in 0..3 {
            w.write_record(BTREE_LEAF, 1, &vec![1u8; space - 20]).unwrap().unwrap();
            w.pad_page_with_nulls();
        }
        // This record cannot finish inside the segment.
        let big = vec![2u8; space + 10];
        assert!(w.write_record(BTREE_LEAF, 1, &big).unwrap().is_none());

        w.pad_to_file_end();
        assert_eq!(w.position(), FILE);

        let addr = w.write_record(BTREE_LEAF, 1, &big).unwrap().unwrap();
        assert_eq!(addr, FILE);
        assert_eq!(w.blocks.last(), Some(FILE));
    }

    #[test]
    fn test_too_big_loggable() {
        let mut w = state();
        let err = w.write_record(BTREE_LEAF, 1, &vec![0u8; FILE as usize]).unwrap_err();
        assert!(matches!(err, Error::TooBigLoggable { .. }));
    }

    #[test]
    fn test_pad_to_file_end_produces_whole_null_pages() {
        let mut w = state();
        w.write_record(BTREE_LEAF, 1, b"x").unwrap().unwrap();
        w.pad_to_file_end();
        assert_eq!(w.position(), FILE);
        assert_eq!(w.pending.len(), (FILE as usize) / PAGE);
        // Pages after the first contain nothing but null padding.
        for page in &w.pending[1..] {
            assert!(page.plain[..PAGE - 8].iter().all(|&b| b == NULL_BYTE));
        }
    }
}
