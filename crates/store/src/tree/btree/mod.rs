//! B+-like tree index.
//!
//! Three record kinds build a tree: **leaf** records hold one key/value
//! pair, **bottom** pages hold an ordered array of keys with leaf
//! addresses (or duplicate sub-tree roots), and **internal** pages hold
//! `(min-key, child-address)` arrays. A save writes leaves first, then
//! bottoms, then internals, and finally a root record whose payload is
//! `varint(size) || root-page-bytes`.
//!
//! Duplicates, when enabled, promote a slot to a nested sub-tree whose
//! keys are the values; the nested tree uses its own record types so the
//! reclaimer can tell the levels apart.

mod cursor;
mod mutable;
mod reclaim;

pub use cursor::BTreeCursor;
pub use mutable::BTreeMutable;

use std::sync::Arc;

use crate::error::{Address, Error, Result, NULL_ADDRESS};
use crate::log::loggable::{
    BTREE_BOTTOM, BTREE_BOTTOM_ROOT, BTREE_DUP_BOTTOM, BTREE_DUP_BOTTOM_ROOT, BTREE_DUP_INTERNAL,
    BTREE_DUP_INTERNAL_ROOT, BTREE_DUP_LEAF, BTREE_INTERNAL, BTREE_INTERNAL_ROOT, BTREE_LEAF,
};
use crate::log::Log;
use crate::tree::{BalancePolicy, Tree, TreeCursor};
use crate::varint;

/// Record type of a page with the given shape.
pub(crate) fn page_type(bottom: bool, root: bool, dup: bool) -> u8 {
    match (bottom, root, dup) {
        (true, false, false) => BTREE_BOTTOM,
        (false, false, false) => BTREE_INTERNAL,
        (true, true, false) => BTREE_BOTTOM_ROOT,
        (false, true, false) => BTREE_INTERNAL_ROOT,
        (true, false, true) => BTREE_DUP_BOTTOM,
        (false, false, true) => BTREE_DUP_INTERNAL,
        (true, true, true) => BTREE_DUP_BOTTOM_ROOT,
        (false, true, true) => BTREE_DUP_INTERNAL_ROOT,
    }
}

/// Record type of a leaf at the given level.
pub(crate) fn leaf_type(dup: bool) -> u8 {
    if dup {
        BTREE_DUP_LEAF
    } else {
        BTREE_LEAF
    }
}

/// One entry of a bottom or internal page.
#[derive(Debug, Clone)]
pub(crate) struct PageEntry {
    /// The key (bottom) or subtree minimum key (internal).
    pub key: Vec<u8>,
    /// Child address: a leaf record, a duplicate sub-tree root, or a
    /// child page.
    pub child: Address,
    /// Bottom pages only: the child is a duplicate sub-tree root.
    pub dup: bool,
    /// Number of values in the duplicate sub-tree.
    pub dup_count: u64,
}

const ENTRY_FLAG_DUP: u8 = 1;

/// A decoded bottom or internal page.
#[derive(Debug, Clone)]
pub(crate) struct NodePage {
    pub bottom: bool,
    pub entries: Vec<PageEntry>,
}

impl NodePage {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        varint::write_u64(&mut out, self.entries.len() as u64);
        for entry in &self.entries {
            out.push(if entry.dup { ENTRY_FLAG_DUP } else { 0 });
            varint::write_u64(&mut out, entry.key.len() as u64);
            out.extend_from_slice(&entry.key);
            varint::write_u64(&mut out, entry.child);
            if entry.dup {
                varint::write_u64(&mut out, entry.dup_count);
            }
        }
        out
    }

    pub fn decode(bottom: bool, data: &[u8], address: Address) -> Result<NodePage> {
        let corrupt = || Error::corrupted(address, "malformed tree page");
        let mut pos = 0;
        let (count, n) = varint::read_u64(&data[pos..]).ok_or_else(corrupt)?;
        pos += n;
        let mut entries = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let flags = *data.get(pos).ok_or_else(corrupt)?;
            pos += 1;
            let (klen, n) = varint::read_u64(&data[pos..]).ok_or_else(corrupt)?;
            pos += n;
            let key = data
                .get(pos..pos + klen as usize)
                .ok_or_else(corrupt)?
                .to_vec();
            pos += klen as usize;
            let (child, n) = varint::read_u64(&data[pos..]).ok_or_else(corrupt)?;
            pos += n;
            let dup = flags & ENTRY_FLAG_DUP != 0;
            let dup_count = if dup {
                let (c, n) = varint::read_u64(&data[pos..]).ok_or_else(corrupt)?;
                pos += n;
                c
            } else {
                0
            };
            entries.push(PageEntry { key, child, dup, dup_count });
        }
        if pos != data.len() {
            return Err(corrupt());
        }
        Ok(NodePage { bottom, entries })
    }

    /// Exact binary search by key.
    pub fn search(&self, key: &[u8]) -> std::result::Result<usize, usize> {
        self.entries.binary_search_by(|e| e.key.as_slice().cmp(key))
    }

    /// Index of the child an internal page descends into for `key`.
    pub fn child_index_for(&self, key: &[u8]) -> usize {
        match self.search(key) {
            Ok(i) => i,
            Err(0) => 0,
            Err(i) => i - 1,
        }
    }
}

/// A page decoded from the log, with the metadata a mutation needs.
pub(crate) struct LoadedPage {
    pub page: NodePage,
    /// Encoded record length, for expired-loggable accounting.
    pub length: usize,
    /// Tree size, present on root records only.
    pub size: u64,
}

/// Reads and decodes a page record, validating its type against the
/// expected shape.
pub(crate) fn load_page(
    log: &Log,
    structure_id: u64,
    address: Address,
    dup: bool,
    root: bool,
) -> Result<LoadedPage> {
    let loggable = log.read(address)?;
    if loggable.structure_id != structure_id {
        return Err(Error::corrupted(address, "tree page owned by another structure"));
    }
    let bottom = match loggable.type_id {
        t if t == page_type(true, root, dup) => true,
        t if t == page_type(false, root, dup) => false,
        t => {
            return Err(Error::corrupted(
                address,
                format!("unexpected record type {t} for a tree page"),
            ))
        }
    };
    let data = loggable.data();
    let (size, offset) = if root {
        varint::read_u64(data)
            .ok_or_else(|| Error::corrupted(address, "malformed tree root record"))?
    } else {
        (0, 0)
    };
    let page = NodePage::decode(bottom, &data[offset..], address)?;
    Ok(LoadedPage { page, length: loggable.length, size })
}

/// Reads a leaf record, returning `(key, value, record length)`.
pub(crate) fn load_leaf(
    log: &Log,
    structure_id: u64,
    address: Address,
    dup: bool,
) -> Result<(Vec<u8>, Vec<u8>, usize)> {
    let loggable = log.read(address)?;
    if loggable.type_id != leaf_type(dup) || loggable.structure_id != structure_id {
        return Err(Error::corrupted(address, "expected a tree leaf record"));
    }
    let data = loggable.data();
    let (klen, n) =
        varint::read_u64(data).ok_or_else(|| Error::corrupted(address, "malformed leaf"))?;
    let key = data
        .get(n..n + klen as usize)
        .ok_or_else(|| Error::corrupted(address, "malformed leaf"))?
        .to_vec();
    let value = data[n + klen as usize..].to_vec();
    Ok((key, value, loggable.length))
}

/// Encodes a leaf record payload.
pub(crate) fn encode_leaf(key: &[u8], value: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(varint::MAX_LEN + key.len() + value.len());
    varint::write_u64(&mut out, key.len() as u64);
    out.extend_from_slice(key);
    out.extend_from_slice(value);
    out
}

/// An immutable B+-tree snapshot rooted at a log address.
pub struct BTree {
    pub(crate) log: Arc<Log>,
    pub(crate) structure_id: u64,
    pub(crate) root_address: Address,
    pub(crate) size: u64,
    pub(crate) dups: bool,
    pub(crate) policy: BalancePolicy,
}

impl BTree {
    /// Opens a snapshot at `root_address` (pass [`NULL_ADDRESS`] for an
    /// empty tree).
    ///
    /// # Errors
    ///
    /// Returns [`Error::Corrupted`] if the record at `root_address` is not
    /// a root of this structure.
    pub fn open(
        log: Arc<Log>,
        structure_id: u64,
        root_address: Address,
        dups: bool,
        policy: BalancePolicy,
    ) -> Result<Self> {
        let size = if root_address == NULL_ADDRESS {
            0
        } else {
            load_page(&log, structure_id, root_address, false, true)?.size
        };
        Ok(Self { log, structure_id, root_address, size, dups, policy })
    }

    /// Creates an empty tree that has never been saved.
    pub fn empty(log: Arc<Log>, structure_id: u64, dups: bool, policy: BalancePolicy) -> Self {
        Self { log, structure_id, root_address: NULL_ADDRESS, size: 0, dups, policy }
    }

    /// The log this tree lives in.
    pub fn log(&self) -> &Arc<Log> {
        &self.log
    }

    /// Whether this tree keeps multiple values per key.
    pub fn allows_duplicates(&self) -> bool {
        self.dups
    }

    /// Descends to the bottom entry for `key`.
    pub(crate) fn find_entry(&self, key: &[u8]) -> Result<Option<PageEntry>> {
        if self.root_address == NULL_ADDRESS {
            return Ok(None);
        }
        let mut page = load_page(&self.log, self.structure_id, self.root_address, false, true)?.page;
        loop {
            if page.bottom {
                return Ok(match page.search(key) {
                    Ok(i) => Some(page.entries[i].clone()),
                    Err(_) => None,
                });
            }
            if page.entries.is_empty() {
                return Ok(None);
            }
            let child = page.entries[page.child_index_for(key)].child;
            page = load_page(&self.log, self.structure_id, child, false, false)?.page;
        }
    }

    /// Smallest value of the duplicate sub-tree rooted at `root`.
    pub(crate) fn dup_first_value(&self, root: Address) -> Result<Vec<u8>> {
        let mut page = load_page(&self.log, self.structure_id, root, true, true)?.page;
        loop {
            let first = page
                .entries
                .first()
                .ok_or_else(|| Error::corrupted(root, "empty duplicate sub-tree page"))?;
            if page.bottom {
                return Ok(first.key.clone());
            }
            let child = first.child;
            page = load_page(&self.log, self.structure_id, child, true, false)?.page;
        }
    }

    /// Whether the duplicate sub-tree rooted at `root` contains `value`.
    pub(crate) fn dup_contains(&self, root: Address, value: &[u8]) -> Result<bool> {
        let mut page = load_page(&self.log, self.structure_id, root, true, true)?.page;
        loop {
            if page.bottom {
                return Ok(page.search(value).is_ok());
            }
            if page.entries.is_empty() {
                return Ok(false);
            }
            let child = page.entries[page.child_index_for(value)].child;
            page = load_page(&self.log, self.structure_id, child, true, false)?.page;
        }
    }

    fn collect_addresses(
        &self,
        address: Address,
        dup: bool,
        root: bool,
        out: &mut Vec<Address>,
    ) -> Result<()> {
        out.push(address);
        let page = load_page(&self.log, self.structure_id, address, dup, root)?.page;
        for entry in &page.entries {
            if page.bottom {
                if entry.dup {
                    self.collect_addresses(entry.child, true, true, out)?;
                } else {
                    out.push(entry.child);
                }
            } else {
                self.collect_addresses(entry.child, dup, false, out)?;
            }
        }
        Ok(())
    }
}

impl Tree for BTree {
    fn structure_id(&self) -> u64 {
        self.structure_id
    }

    fn root_address(&self) -> Address {
        self.root_address
    }

    fn size(&self) -> u64 {
        self.size
    }

    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        match self.find_entry(key)? {
            None => Ok(None),
            Some(entry) if entry.dup => Ok(Some(self.dup_first_value(entry.child)?)),
            Some(entry) => {
                let (_, value, _) = load_leaf(&self.log, self.structure_id, entry.child, false)?;
                Ok(Some(value))
            }
        }
    }

    fn has_pair(&self, key: &[u8], value: &[u8]) -> Result<bool> {
        match self.find_entry(key)? {
            None => Ok(false),
            Some(entry) if entry.dup => self.dup_contains(entry.child, value),
            Some(entry) => {
                let (_, v, _) = load_leaf(&self.log, self.structure_id, entry.child, false)?;
                Ok(v == value)
            }
        }
    }

    fn open_cursor(&self) -> Box<dyn TreeCursor + '_> {
        Box::new(BTreeCursor::new(self))
    }

    fn addresses(&self) -> Result<Vec<Address>> {
        let mut out = Vec::new();
        if self.root_address != NULL_ADDRESS {
            self.collect_addresses(self.root_address, false, true, &mut out)?;
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_page_codec_round_trip() {
        let page = NodePage {
            bottom: true,
            entries: vec![
                PageEntry { key: b"alpha".to_vec(), child: 100, dup: false, dup_count: 0 },
                PageEntry { key: b"beta".to_vec(), child: 250, dup: true, dup_count: 3 },
                PageEntry { key: vec![], child: 7, dup: false, dup_count: 0 },
            ],
        };
        let encoded = page.encode();
        let decoded = NodePage::decode(true, &encoded, 0).unwrap();
        assert_eq!(decoded.entries.len(), 3);
        assert_eq!(decoded.entries[0].key, b"alpha");
        assert_eq!(decoded.entries[0].child, 100);
        assert!(decoded.entries[1].dup);
        assert_eq!(decoded.entries[1].dup_count, 3);
        assert!(decoded.entries[2].key.is_empty());
    }

    #[test]
    fn test_page_decode_rejects_trailing_garbage() {
        let page = NodePage { bottom: false, entries: vec![] };
        let mut encoded = page.encode();
        encoded.push(0xff);
        assert!(NodePage::decode(false, &encoded, 0).is_err());
    }

    #[test]
    fn test_child_index_for() {
        let page = NodePage {
            bottom: false,
            entries: vec![
                PageEntry { key: b"b".to_vec(), child: 1, dup: false, dup_count: 0 },
                PageEntry { key: b"m".to_vec(), child: 2, dup: false, dup_count: 0 },
                PageEntry { key: b"t".to_vec(), child: 3, dup: false, dup_count: 0 },
            ],
        };
        assert_eq!(page.child_index_for(b"a"), 0); // below minimum
        assert_eq!(page.child_index_for(b"b"), 0);
        assert_eq!(page.child_index_for(b"c"), 0);
        assert_eq!(page.child_index_for(b"m"), 1);
        assert_eq!(page.child_index_for(b"z"), 2);
    }

    #[test]
    fn test_leaf_codec_round_trip() {
        let data = encode_leaf(b"key", b"value bytes");
        let (klen, n) = varint::read_u64(&data).unwrap();
        assert_eq!(klen, 3);
        assert_eq!(&data[n..n + 3], b"key");
        assert_eq!(&data[n + 3..], b"value bytes");
    }
}
