//! Patricia (compressed radix) tree index.
//!
//! Nodes carry a shared byte prefix, an optional value, and a sparse,
//! sorted child table keyed by the next byte. The tree shares the
//! B+-tree's external contract and save protocol: a mutation copies
//! touched nodes on write, and `save` serializes dirty nodes bottom-up,
//! ending in a root record of type `PATRICIA_ROOT` carrying
//! `varint(size) || node-bytes`.
//!
//! Duplicates are a decorator: the pair `(key, value)` is stored as the
//! single key `key ‖ 0x00 ‖ value ‖ BE32(key-length)` with an empty
//! value, following the original single-separator scheme.

mod cursor;
mod mutable;

pub use cursor::PatriciaCursor;
pub use mutable::PatriciaTreeMutable;

use std::sync::Arc;

use byteorder::{BigEndian, ByteOrder};

use crate::error::{Address, Error, Result, NULL_ADDRESS};
use crate::log::loggable::{PATRICIA_NODE, PATRICIA_ROOT};
use crate::log::Log;
use crate::tree::{Tree, TreeCursor};
use crate::varint;

const NODE_FLAG_VALUE: u8 = 1;

/// A decoded persisted node.
#[derive(Debug, Clone)]
pub(crate) struct PNode {
    pub prefix: Vec<u8>,
    pub value: Option<Vec<u8>>,
    /// Sorted by edge byte; the child's prefix excludes the edge byte.
    pub children: Vec<(u8, Address)>,
}

impl PNode {
    pub fn encode_into(&self, out: &mut Vec<u8>) {
        varint::write_u64(out, self.prefix.len() as u64);
        out.extend_from_slice(&self.prefix);
        out.push(if self.value.is_some() { NODE_FLAG_VALUE } else { 0 });
        if let Some(value) = &self.value {
            varint::write_u64(out, value.len() as u64);
            out.extend_from_slice(value);
        }
        varint::write_u64(out, self.children.len() as u64);
        for (edge, child) in &self.children {
            out.push(*edge);
            varint::write_u64(out, *child);
        }
    }

    pub fn decode(data: &[u8], address: Address) -> Result<PNode> {
        let corrupt = || Error::corrupted(address, "malformed patricia node");
        let mut pos = 0;
        let (plen, n) = varint::read_u64(&data[pos..]).ok_or_else(corrupt)?;
        pos += n;
        let prefix = data.get(pos..pos + plen as usize).ok_or_else(corrupt)?.to_vec();
        pos += plen as usize;
        let flags = *data.get(pos).ok_or_else(corrupt)?;
        pos += 1;
        let value = if flags & NODE_FLAG_VALUE != 0 {
            let (vlen, n) = varint::read_u64(&data[pos..]).ok_or_else(corrupt)?;
            pos += n;
            let value = data.get(pos..pos + vlen as usize).ok_or_else(corrupt)?.to_vec();
            pos += vlen as usize;
            Some(value)
        } else {
            None
        };
        let (count, n) = varint::read_u64(&data[pos..]).ok_or_else(corrupt)?;
        pos += n;
        let mut children = Vec::with_capacity(count as usize);
        let mut last_edge: Option<u8> = None;
        for _ in 0..count {
            let edge = *data.get(pos).ok_or_else(corrupt)?;
            pos += 1;
            let (child, n) = varint::read_u64(&data[pos..]).ok_or_else(corrupt)?;
            pos += n;
            if last_edge.is_some_and(|prev| prev >= edge) {
                return Err(corrupt());
            }
            last_edge = Some(edge);
            children.push((edge, child));
        }
        if pos != data.len() {
            return Err(corrupt());
        }
        Ok(PNode { prefix, value, children })
    }

    pub fn child(&self, edge: u8) -> Option<Address> {
        self.children
            .binary_search_by_key(&edge, |(b, _)| *b)
            .ok()
            .map(|i| self.children[i].1)
    }
}

/// Reads and decodes a node record; root records carry the tree size.
pub(crate) fn load_node(
    log: &Log,
    structure_id: u64,
    address: Address,
    root: bool,
) -> Result<(PNode, usize, u64)> {
    let loggable = log.read(address)?;
    let expected = if root { PATRICIA_ROOT } else { PATRICIA_NODE };
    if loggable.type_id != expected || loggable.structure_id != structure_id {
        return Err(Error::corrupted(address, "expected a patricia node record"));
    }
    let data = loggable.data();
    let (size, offset) = if root {
        varint::read_u64(data)
            .ok_or_else(|| Error::corrupted(address, "malformed patricia root record"))?
    } else {
        (0, 0)
    };
    let node = PNode::decode(&data[offset..], address)?;
    Ok((node, loggable.length, size))
}

/// Length of the longest common prefix of two byte strings.
pub(crate) fn common_prefix(a: &[u8], b: &[u8]) -> usize {
    a.iter().zip(b).take_while(|(x, y)| x == y).count()
}

/// Encodes a duplicate pair into its decorator key.
pub(crate) fn encode_dup_key(key: &[u8], value: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(key.len() + value.len() + 5);
    out.extend_from_slice(key);
    out.push(0);
    out.extend_from_slice(value);
    let mut len = [0u8; 4];
    BigEndian::write_u32(&mut len, key.len() as u32);
    out.extend_from_slice(&len);
    out
}

/// Splits a decorator key back into `(key, value)`.
pub(crate) fn decode_dup_key(stored: &[u8]) -> Option<(Vec<u8>, Vec<u8>)> {
    if stored.len() < 5 {
        return None;
    }
    let klen = BigEndian::read_u32(&stored[stored.len() - 4..]) as usize;
    if klen + 1 + 4 > stored.len() || stored[klen] != 0 {
        return None;
    }
    Some((stored[..klen].to_vec(), stored[klen + 1..stored.len() - 4].to_vec()))
}

/// An immutable Patricia tree snapshot rooted at a log address.
pub struct PatriciaTree {
    pub(crate) log: Arc<Log>,
    pub(crate) structure_id: u64,
    pub(crate) root_address: Address,
    pub(crate) size: u64,
    pub(crate) dups: bool,
}

impl PatriciaTree {
    /// Opens a snapshot at `root_address` (pass [`NULL_ADDRESS`] for an
    /// empty tree).
    pub fn open(
        log: Arc<Log>,
        structure_id: u64,
        root_address: Address,
        dups: bool,
    ) -> Result<Self> {
        let size = if root_address == NULL_ADDRESS {
            0
        } else {
            load_node(&log, structure_id, root_address, true)?.2
        };
        Ok(Self { log, structure_id, root_address, size, dups })
    }

    /// Creates an empty tree that has never been saved.
    pub fn empty(log: Arc<Log>, structure_id: u64, dups: bool) -> Self {
        Self { log, structure_id, root_address: NULL_ADDRESS, size: 0, dups }
    }

    /// The log this tree lives in.
    pub fn log(&self) -> &Arc<Log> {
        &self.log
    }

    /// Whether this tree keeps multiple values per key.
    pub fn allows_duplicates(&self) -> bool {
        self.dups
    }

    /// Exact lookup of a stored key.
    pub(crate) fn get_stored(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        if self.root_address == NULL_ADDRESS {
            return Ok(None);
        }
        let mut node = load_node(&self.log, self.structure_id, self.root_address, true)?.0;
        let mut pos = 0;
        loop {
            if !key[pos..].starts_with(&node.prefix) {
                return Ok(None);
            }
            pos += node.prefix.len();
            if pos == key.len() {
                return Ok(node.value);
            }
            let Some(child) = node.child(key[pos]) else { return Ok(None) };
            pos += 1;
            node = load_node(&self.log, self.structure_id, child, false)?.0;
        }
    }

    /// Smallest stored key extending `prefix`, with its value.
    pub(crate) fn min_with_prefix(&self, prefix: &[u8]) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
        if self.root_address == NULL_ADDRESS {
            return Ok(None);
        }
        let mut node = load_node(&self.log, self.structure_id, self.root_address, true)?.0;
        let mut key = Vec::new();
        let mut pos = 0;
        // Descend along the prefix.
        loop {
            let common = common_prefix(&node.prefix, &prefix[pos..]);
            key.extend_from_slice(&node.prefix);
            if pos + common == prefix.len() {
                break;
            }
            if common < node.prefix.len() {
                return Ok(None);
            }
            pos += common;
            let Some(child) = node.child(prefix[pos]) else { return Ok(None) };
            key.push(prefix[pos]);
            pos += 1;
            node = load_node(&self.log, self.structure_id, child, false)?.0;
        }
        // Leftmost descent below the match point.
        loop {
            if let Some(value) = node.value {
                return Ok(Some((key, value)));
            }
            let Some(&(edge, child)) = node.children.first() else { return Ok(None) };
            key.push(edge);
            node = load_node(&self.log, self.structure_id, child, false)?.0;
            key.extend_from_slice(&node.prefix);
        }
    }

    fn collect_addresses(&self, address: Address, root: bool, out: &mut Vec<Address>) -> Result<()> {
        out.push(address);
        let node = load_node(&self.log, self.structure_id, address, root)?.0;
        for (_, child) in &node.children {
            self.collect_addresses(*child, false, out)?;
        }
        Ok(())
    }
}

impl Tree for PatriciaTree {
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
        if self.dups {
            let mut probe = key.to_vec();
            probe.push(0);
            Ok(self
                .min_with_prefix(&probe)?
                .and_then(|(stored, _)| decode_dup_key(&stored))
                .map(|(_, value)| value))
        } else {
            self.get_stored(key)
        }
    }

    fn has_pair(&self, key: &[u8], value: &[u8]) -> Result<bool> {
        if self.dups {
            Ok(self.get_stored(&encode_dup_key(key, value))?.is_some())
        } else {
            Ok(self.get_stored(key)?.as_deref() == Some(value))
        }
    }

    fn open_cursor(&self) -> Box<dyn TreeCursor + '_> {
        Box::new(PatriciaCursor::new(self))
    }

    fn addresses(&self) -> Result<Vec<Address>> {
        let mut out = Vec::new();
        if self.root_address != NULL_ADDRESS {
            self.collect_addresses(self.root_address, true, &mut out)?;
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_node_codec_round_trip() {
        let node = PNode {
            prefix: b"sha".to_vec(),
            value: Some(b"v".to_vec()),
            children: vec![(b'd', 100), (b'r', 2000)],
        };
        let mut encoded = Vec::new();
        node.encode_into(&mut encoded);
        let decoded = PNode::decode(&encoded, 0).unwrap();
        assert_eq!(decoded.prefix, b"sha");
        assert_eq!(decoded.value.as_deref(), Some(&b"v"[..]));
        assert_eq!(decoded.child(b'd'), Some(100));
        assert_eq!(decoded.child(b'r'), Some(2000));
        assert_eq!(decoded.child(b'x'), None);
    }

    #[test]
    fn test_node_codec_no_value() {
        let node = PNode { prefix: Vec::new(), value: None, children: Vec::new() };
        let mut encoded = Vec::new();
        node.encode_into(&mut encoded);
        let decoded = PNode::decode(&encoded, 0).unwrap();
        assert!(decoded.value.is_none());
        assert!(decoded.children.is_empty());
    }

    #[test]
    fn test_node_decode_rejects_unsorted_children() {
        let node = PNode {
            prefix: Vec::new(),
            value: None,
            children: vec![(b'b', 1), (b'a', 2)],
        };
        let mut encoded = Vec::new();
        node.encode_into(&mut encoded);
        assert!(PNode::decode(&encoded, 0).is_err());
    }

    #[test]
    fn test_dup_key_codec() {
        let stored = encode_dup_key(b"key", b"value");
        let (key, value) = decode_dup_key(&stored).unwrap();
        assert_eq!(key, b"key");
        assert_eq!(value, b"value");

        // Ordering groups by key, then value.
        let a = encode_dup_key(b"k", b"a");
        let b = encode_dup_key(b"k", b"b");
        let c = encode_dup_key(b"l", b"a");
        assert!(a < b && b < c);

        assert_eq!(decode_dup_key(b"xx"), None);
    }

    #[test]
    fn test_common_prefix() {
        assert_eq!(common_prefix(b"abcd", b"abxy"), 2);
        assert_eq!(common_prefix(b"", b"abc"), 0);
        assert_eq!(common_prefix(b"abc", b"abc"), 3);
    }
}
