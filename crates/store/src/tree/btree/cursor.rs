//! Stack-based cursor over an immutable B+-tree.

use crate::error::{Address, Result, NULL_ADDRESS};
use crate::tree::TreeCursor;

use super::{load_leaf, load_page, BTree, NodePage, PageEntry};

/// Walks the bottom entries of one tree level left to right, maintaining
/// an explicit stack of `(page, slot)` frames instead of parent pointers.
struct PageWalker {
    root: Address,
    dup: bool,
    stack: Vec<(NodePage, usize)>,
    started: bool,
}

impl PageWalker {
    fn new(root: Address, dup: bool) -> Self {
        Self { root, dup, stack: Vec::new(), started: false }
    }

    /// Pushes frames from `address` down to the leftmost bottom page.
    fn descend_leftmost(&mut self, tree: &BTree, address: Address, root: bool) -> Result<()> {
        let mut page = load_page(&tree.log, tree.structure_id, address, self.dup, root)?.page;
        loop {
            let bottom = page.bottom;
            let first_child = page.entries.first().map(|e| e.child);
            self.stack.push((page, 0));
            if bottom {
                return Ok(());
            }
            let Some(child) = first_child else { return Ok(()) };
            page = load_page(&tree.log, tree.structure_id, child, self.dup, false)?.page;
        }
    }

    /// Returns the next bottom entry, or `None` when the level is
    /// exhausted.
    fn next_entry(&mut self, tree: &BTree) -> Result<Option<PageEntry>> {
        if !self.started {
            self.started = true;
            if self.root == NULL_ADDRESS {
                return Ok(None);
            }
            self.descend_leftmost(tree, self.root, true)?;
        }
        loop {
            let Some((page, index)) = self.stack.last_mut() else { return Ok(None) };
            if page.bottom {
                if *index < page.entries.len() {
                    let entry = page.entries[*index].clone();
                    *index += 1;
                    return Ok(Some(entry));
                }
                self.stack.pop();
                continue;
            }
            // Internal frame: move to the next child subtree.
            *index += 1;
            if *index < page.entries.len() {
                let child = page.entries[*index].child;
                self.descend_leftmost(tree, child, false)?;
            } else {
                self.stack.pop();
            }
        }
    }

    /// Positions the walker so the next entry is the first one with
    /// `key >= target`.
    fn seek(&mut self, tree: &BTree, target: &[u8]) -> Result<()> {
        self.stack.clear();
        self.started = true;
        if self.root == NULL_ADDRESS {
            return Ok(());
        }
        let mut page = load_page(&tree.log, tree.structure_id, self.root, self.dup, true)?.page;
        loop {
            if page.bottom {
                let index = match page.search(target) {
                    Ok(i) => i,
                    Err(i) => i,
                };
                self.stack.push((page, index));
                return Ok(());
            }
            if page.entries.is_empty() {
                self.stack.push((page, 0));
                return Ok(());
            }
            let index = page.child_index_for(target);
            let child = page.entries[index].child;
            self.stack.push((page, index));
            page = load_page(&tree.log, tree.structure_id, child, self.dup, false)?.page;
        }
    }
}

/// Cursor yielding `(key, value)` pairs in ascending order, duplicates
/// enumerated individually in ascending value order.
pub struct BTreeCursor<'a> {
    tree: &'a BTree,
    walker: PageWalker,
    /// Active duplicate sub-tree iteration: the outer key plus a walker
    /// over the nested level.
    dup: Option<(Vec<u8>, PageWalker)>,
}

impl<'a> BTreeCursor<'a> {
    /// Opens a cursor positioned before the first pair.
    pub fn new(tree: &'a BTree) -> Self {
        Self { tree, walker: PageWalker::new(tree.root_address, false), dup: None }
    }

    fn resolve(&mut self, entry: PageEntry) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
        if entry.dup {
            let mut sub = PageWalker::new(entry.child, true);
            match sub.next_entry(self.tree)? {
                Some(first) => {
                    // Duplicate sub-tree keys are the values.
                    let pair = (entry.key.clone(), first.key);
                    self.dup = Some((entry.key, sub));
                    Ok(Some(pair))
                }
                None => Ok(None),
            }
        } else {
            let (_, value, _) =
                load_leaf(&self.tree.log, self.tree.structure_id, entry.child, false)?;
            Ok(Some((entry.key, value)))
        }
    }
}

impl TreeCursor for BTreeCursor<'_> {
    fn next(&mut self) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
        if let Some((key, sub)) = &mut self.dup {
            if let Some(entry) = sub.next_entry(self.tree)? {
                return Ok(Some((key.clone(), entry.key)));
            }
            self.dup = None;
        }
        match self.walker.next_entry(self.tree)? {
            Some(entry) => self.resolve(entry),
            None => Ok(None),
        }
    }

    fn seek_range(&mut self, target: &[u8]) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
        self.dup = None;
        self.walker.seek(self.tree, target)?;
        match self.walker.next_entry(self.tree)? {
            Some(entry) => self.resolve(entry),
            None => Ok(None),
        }
    }
}
