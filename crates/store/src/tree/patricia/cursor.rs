//! Stack-based cursor over an immutable Patricia tree.

use crate::error::{Result, NULL_ADDRESS};
use crate::tree::TreeCursor;

use super::{common_prefix, decode_dup_key, load_node, PNode, PatriciaTree};

struct Frame {
    node: PNode,
    /// Index of the next child to descend into.
    next_child: usize,
    /// Whether this node's own value was already emitted.
    emitted_value: bool,
    /// Accumulated-key length to restore on pop (before the edge byte and
    /// this node's prefix were appended).
    restore_len: usize,
}

/// Cursor yielding pairs in ascending key order; on duplicate-enabled
/// trees the decorator keys are split back into `(key, value)` pairs.
pub struct PatriciaCursor<'a> {
    tree: &'a PatriciaTree,
    stack: Vec<Frame>,
    key: Vec<u8>,
    started: bool,
}

impl<'a> PatriciaCursor<'a> {
    /// Opens a cursor positioned before the first pair.
    pub fn new(tree: &'a PatriciaTree) -> Self {
        Self { tree, stack: Vec::new(), key: Vec::new(), started: false }
    }

    fn push(&mut self, node: PNode, restore_len: usize) {
        self.key.extend_from_slice(&node.prefix);
        self.stack.push(Frame { node, next_child: 0, emitted_value: false, restore_len });
    }

    fn start(&mut self) -> Result<()> {
        self.started = true;
        if self.tree.root_address == NULL_ADDRESS {
            return Ok(());
        }
        let node =
            load_node(&self.tree.log, self.tree.structure_id, self.tree.root_address, true)?.0;
        self.push(node, 0);
        Ok(())
    }

    /// Advances to the next stored pair from the current stack state.
    fn advance(&mut self) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
        loop {
            let Some(frame) = self.stack.last_mut() else { return Ok(None) };
            if !frame.emitted_value {
                frame.emitted_value = true;
                if let Some(value) = frame.node.value.clone() {
                    return Ok(Some((self.key.clone(), value)));
                }
            }
            if frame.next_child < frame.node.children.len() {
                let (edge, child) = frame.node.children[frame.next_child];
                frame.next_child += 1;
                let restore_len = self.key.len();
                self.key.push(edge);
                let node = load_node(&self.tree.log, self.tree.structure_id, child, false)?.0;
                self.push(node, restore_len);
                continue;
            }
            let frame = self.stack.pop().expect("stack checked above");
            self.key.truncate(frame.restore_len);
        }
    }

    fn emit(&self, stored_key: Vec<u8>, value: Vec<u8>) -> Option<(Vec<u8>, Vec<u8>)> {
        if self.tree.dups {
            decode_dup_key(&stored_key)
        } else {
            Some((stored_key, value))
        }
    }
}

impl TreeCursor for PatriciaCursor<'_> {
    fn next(&mut self) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
        if !self.started {
            self.start()?;
        }
        loop {
            match self.advance()? {
                Some((key, value)) => {
                    if let Some(pair) = self.emit(key, value) {
                        return Ok(Some(pair));
                    }
                    // Undecodable decorator keys are skipped.
                }
                None => return Ok(None),
            }
        }
    }

    fn seek_range(&mut self, target: &[u8]) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
        self.stack.clear();
        self.key.clear();
        self.start()?;
        if self.stack.is_empty() {
            return Ok(None);
        }

        let mut pos = 0;
        loop {
            let frame = self.stack.last_mut().expect("descent keeps the stack non-empty");
            let rest = &target[pos..];
            let common = common_prefix(&frame.node.prefix, rest);
            if common < frame.node.prefix.len() {
                if rest.len() <= common || frame.node.prefix[common] > rest[common] {
                    // Everything under this node is greater: emit it all.
                    break;
                }
                // Everything under this node is smaller: skip it.
                frame.emitted_value = true;
                frame.next_child = frame.node.children.len();
                break;
            }
            pos += common;
            if pos == target.len() {
                // This node's key is the boundary.
                break;
            }
            // The node's own key is a proper prefix of the target.
            frame.emitted_value = true;
            let edge = target[pos];
            match frame.node.children.binary_search_by_key(&edge, |(b, _)| *b) {
                Ok(i) => {
                    frame.next_child = i + 1;
                    let (_, child) = frame.node.children[i];
                    let restore_len = self.key.len();
                    self.key.push(edge);
                    let node = load_node(&self.tree.log, self.tree.structure_id, child, false)?.0;
                    self.push(node, restore_len);
                    pos += 1;
                }
                Err(i) => {
                    // No exact edge: children from `i` on are all greater.
                    frame.next_child = i;
                    break;
                }
            }
        }

        loop {
            match self.advance()? {
                Some((key, value)) => {
                    if let Some(pair) = self.emit(key, value) {
                        return Ok(Some(pair));
                    }
                }
                None => return Ok(None),
            }
        }
    }
}
