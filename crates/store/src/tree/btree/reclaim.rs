//! Segment reclaim for the B+-tree.
//!
//! The walk visits each record of the candidate segment in address order
//! and rebuilds the live ones into the mutable tree: a live leaf becomes
//! a dirty value, a live page is copied on write so the save rewrites it
//! forward. Records that are already superseded are skipped. Reaching the
//! tree's own root record terminates the walk; everything before it has
//! been accounted for.
//!
//! Duplicate records cannot be located by key alone (their keys are the
//! values), so a segment containing any duplicate record triggers a
//! targeted sweep: the tree is probed for duplicate sub-trees whose
//! record addresses intersect the segment, and those sub-trees are
//! materialized whole. The probe prunes on addresses — children are
//! always written before their parents, so a subtree rooted below the
//! segment start cannot reach into it.

use crate::error::{Address, Result};
use crate::log::loggable::{
    Loggable, BTREE_BOTTOM, BTREE_BOTTOM_ROOT, BTREE_DUP_BOTTOM, BTREE_DUP_BOTTOM_ROOT,
    BTREE_DUP_INTERNAL, BTREE_DUP_INTERNAL_ROOT, BTREE_DUP_LEAF, BTREE_INTERNAL,
    BTREE_INTERNAL_ROOT, BTREE_LEAF,
};
use crate::log::LogIterator;
use crate::varint;

use super::mutable::{
    child_index, materialize, BTreeMutable, ChildRef, DupTree, LeafSlot, MutNode, OpCtx,
};
use super::{load_leaf, load_page};

impl BTreeMutable {
    pub(crate) fn reclaim_impl(
        &mut self,
        head: &Loggable,
        iter: &mut LogIterator<'_>,
    ) -> Result<bool> {
        let file_length_bound = self.log.file_length_bound();
        let segment = head.address - head.address % file_length_bound;
        let segment_end = segment + file_length_bound;

        let mut any = false;
        let mut dup_seen = false;
        let mut current = Some(head.clone());
        while let Some(loggable) = current {
            if loggable.address >= segment_end {
                break;
            }
            if loggable.structure_id == self.structure_id {
                match loggable.type_id {
                    BTREE_LEAF => {
                        let key = leaf_key(loggable.data());
                        if let Some(key) = key {
                            if self.reclaim_leaf(&key, loggable.address)? {
                                any = true;
                            }
                        }
                    }
                    BTREE_BOTTOM | BTREE_INTERNAL => {
                        let bottom = loggable.type_id == BTREE_BOTTOM;
                        if let Some(min_key) = page_min_key(bottom, loggable.data()) {
                            if self.reclaim_page(&min_key, loggable.address)? {
                                any = true;
                            }
                        }
                    }
                    BTREE_DUP_LEAF | BTREE_DUP_BOTTOM | BTREE_DUP_INTERNAL
                    | BTREE_DUP_BOTTOM_ROOT | BTREE_DUP_INTERNAL_ROOT => {
                        dup_seen = true;
                    }
                    BTREE_BOTTOM_ROOT | BTREE_INTERNAL_ROOT => {
                        if loggable.address == self.orig_root {
                            // Our own root lives in this segment: force a
                            // fresh root record on save, then the walk is
                            // complete.
                            let (mut ctx, root) = self.ctx();
                            materialize(&mut ctx, root, false, true)?;
                            any = true;
                            break;
                        }
                        // A stale root of an earlier tree version.
                    }
                    _ => {}
                }
            }
            current = match iter.next() {
                Some(Ok(loggable)) => Some(loggable),
                Some(Err(e)) => return Err(e),
                None => None,
            };
        }

        if dup_seen && self.reclaim_duplicates(segment, segment_end)? {
            any = true;
        }
        Ok(any)
    }

    /// Rebuilds one leaf record if it is still referenced.
    fn reclaim_leaf(&mut self, key: &[u8], target: Address) -> Result<bool> {
        if !self.leaf_is_live(&self.root, key, target, true)? {
            return Ok(false);
        }
        let (mut ctx, root) = self.ctx();
        let mut node = materialize(&mut ctx, root, false, true)?;
        loop {
            match node {
                MutNode::Bottom(entries) => {
                    let Ok(i) = entries.binary_search_by(|e| e.key.as_slice().cmp(key)) else {
                        return Ok(false);
                    };
                    let entry = &mut entries[i];
                    if let LeafSlot::Addr(address) = entry.slot {
                        if address == target {
                            let (_, value, length) =
                                load_leaf(ctx.log, ctx.structure_id, address, false)?;
                            ctx.expired.add(address, length);
                            entry.slot = LeafSlot::Value(value);
                            return Ok(true);
                        }
                    }
                    return Ok(false);
                }
                MutNode::Internal(entries) => {
                    if entries.is_empty() {
                        return Ok(false);
                    }
                    let i = child_index(entries, key);
                    node = materialize(&mut ctx, &mut entries[i].child, false, false)?;
                }
            }
        }
    }

    /// Read-only probe: is `target` the live leaf record for `key`?
    fn leaf_is_live(
        &self,
        child: &ChildRef,
        key: &[u8],
        target: Address,
        root: bool,
    ) -> Result<bool> {
        match child {
            ChildRef::Node(node) => match node.as_ref() {
                MutNode::Bottom(entries) => {
                    match entries.binary_search_by(|e| e.key.as_slice().cmp(key)) {
                        Ok(i) => Ok(matches!(entries[i].slot, LeafSlot::Addr(a) if a == target)),
                        Err(_) => Ok(false),
                    }
                }
                MutNode::Internal(entries) => {
                    if entries.is_empty() {
                        return Ok(false);
                    }
                    self.leaf_is_live(&entries[child_index(entries, key)].child, key, target, false)
                }
            },
            ChildRef::Addr(address) => {
                let mut page = load_page(&self.log, self.structure_id, *address, false, root)?.page;
                loop {
                    if page.bottom {
                        return Ok(match page.search(key) {
                            Ok(i) => {
                                let entry = &page.entries[i];
                                !entry.dup && entry.child == target
                            }
                            Err(_) => false,
                        });
                    }
                    if page.entries.is_empty() {
                        return Ok(false);
                    }
                    let next = page.entries[page.child_index_for(key)].child;
                    page = load_page(&self.log, self.structure_id, next, false, false)?.page;
                }
            }
        }
    }

    /// Rebuilds one page record if it still sits on the path of its
    /// minimum key.
    fn reclaim_page(&mut self, min_key: &[u8], target: Address) -> Result<bool> {
        if !self.page_is_live(&self.root, min_key, target, true)? {
            return Ok(false);
        }
        let (mut ctx, root) = self.ctx();
        let mut node = materialize(&mut ctx, root, false, true)?;
        loop {
            match node {
                MutNode::Bottom(_) => return Ok(false),
                MutNode::Internal(entries) => {
                    if entries.is_empty() {
                        return Ok(false);
                    }
                    let i = child_index(entries, min_key);
                    let is_target =
                        matches!(entries[i].child, ChildRef::Addr(a) if a == target);
                    node = materialize(&mut ctx, &mut entries[i].child, false, false)?;
                    if is_target {
                        // Materializing expired and rewrote it; children
                        // keep their addresses.
                        return Ok(true);
                    }
                }
            }
        }
    }

    /// Read-only probe: does `target` appear as a child on the path of
    /// `min_key`? Already-materialized children cannot be the target —
    /// their records are expired.
    fn page_is_live(
        &self,
        child: &ChildRef,
        min_key: &[u8],
        target: Address,
        root: bool,
    ) -> Result<bool> {
        match child {
            ChildRef::Node(node) => match node.as_ref() {
                MutNode::Bottom(_) => Ok(false),
                MutNode::Internal(entries) => {
                    if entries.is_empty() {
                        return Ok(false);
                    }
                    let next = &entries[child_index(entries, min_key)].child;
                    if matches!(next, ChildRef::Addr(a) if *a == target) {
                        return Ok(true);
                    }
                    self.page_is_live(next, min_key, target, false)
                }
            },
            ChildRef::Addr(address) => {
                let mut page = load_page(&self.log, self.structure_id, *address, false, root)?.page;
                loop {
                    if page.bottom || page.entries.is_empty() {
                        return Ok(false);
                    }
                    let next = page.entries[page.child_index_for(min_key)].child;
                    if next == target {
                        return Ok(true);
                    }
                    page = load_page(&self.log, self.structure_id, next, false, false)?.page;
                }
            }
        }
    }

    /// Finds and rewrites every duplicate sub-tree whose records intersect
    /// the candidate segment.
    fn reclaim_duplicates(&mut self, seg_start: Address, seg_end: Address) -> Result<bool> {
        let mut keys = Vec::new();
        self.collect_dup_keys(&self.root, true, seg_start, seg_end, &mut keys)?;
        if keys.is_empty() {
            return Ok(false);
        }
        for key in keys {
            self.rewrite_dup_subtree(&key)?;
        }
        Ok(true)
    }

    fn collect_dup_keys(
        &self,
        child: &ChildRef,
        root: bool,
        seg_start: Address,
        seg_end: Address,
        out: &mut Vec<Vec<u8>>,
    ) -> Result<()> {
        match child {
            ChildRef::Node(node) => match node.as_ref() {
                MutNode::Bottom(entries) => {
                    for entry in entries {
                        if let LeafSlot::Dup(dt) = &entry.slot {
                            if self.dup_intersects_ref(&dt.root, true, seg_start, seg_end)? {
                                out.push(entry.key.clone());
                            }
                        }
                    }
                    Ok(())
                }
                MutNode::Internal(entries) => {
                    for entry in entries {
                        self.collect_dup_keys(&entry.child, false, seg_start, seg_end, out)?;
                    }
                    Ok(())
                }
            },
            ChildRef::Addr(address) => {
                if *address < seg_start {
                    // Children are written before parents: the whole
                    // subtree is older than the segment.
                    return Ok(());
                }
                self.collect_dup_keys_addr(*address, root, seg_start, seg_end, out)
            }
        }
    }

    fn collect_dup_keys_addr(
        &self,
        address: Address,
        root: bool,
        seg_start: Address,
        seg_end: Address,
        out: &mut Vec<Vec<u8>>,
    ) -> Result<()> {
        let page = load_page(&self.log, self.structure_id, address, false, root)?.page;
        for entry in &page.entries {
            if page.bottom {
                if entry.dup && self.dup_intersects_addr(entry.child, true, seg_start, seg_end)? {
                    out.push(entry.key.clone());
                }
            } else if entry.child >= seg_start {
                self.collect_dup_keys_addr(entry.child, false, seg_start, seg_end, out)?;
            }
        }
        Ok(())
    }

    fn dup_intersects_ref(
        &self,
        child: &ChildRef,
        root: bool,
        seg_start: Address,
        seg_end: Address,
    ) -> Result<bool> {
        match child {
            ChildRef::Node(node) => match node.as_ref() {
                MutNode::Bottom(entries) => {
                    for entry in entries {
                        if let LeafSlot::Addr(a) = entry.slot {
                            if a >= seg_start && a < seg_end {
                                return Ok(true);
                            }
                        }
                    }
                    Ok(false)
                }
                MutNode::Internal(entries) => {
                    for entry in entries {
                        if self.dup_intersects_ref(&entry.child, false, seg_start, seg_end)? {
                            return Ok(true);
                        }
                    }
                    Ok(false)
                }
            },
            ChildRef::Addr(address) => {
                self.dup_intersects_addr(*address, root, seg_start, seg_end)
            }
        }
    }

    fn dup_intersects_addr(
        &self,
        address: Address,
        root: bool,
        seg_start: Address,
        seg_end: Address,
    ) -> Result<bool> {
        if address < seg_start {
            return Ok(false);
        }
        if address < seg_end {
            return Ok(true);
        }
        let page = load_page(&self.log, self.structure_id, address, true, root)?.page;
        for entry in &page.entries {
            let hit = if page.bottom {
                entry.child >= seg_start && entry.child < seg_end
            } else {
                self.dup_intersects_addr(entry.child, false, seg_start, seg_end)?
            };
            if hit {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Materializes the whole duplicate sub-tree of `key`, resolving all
    /// of its leaves to dirty values so the save rewrites it forward.
    fn rewrite_dup_subtree(&mut self, key: &[u8]) -> Result<()> {
        let (mut ctx, root) = self.ctx();
        let mut node = materialize(&mut ctx, root, false, true)?;
        loop {
            match node {
                MutNode::Bottom(entries) => {
                    let Ok(i) = entries.binary_search_by(|e| e.key.as_slice().cmp(key)) else {
                        return Ok(());
                    };
                    if let LeafSlot::Dup(dt) = &mut entries[i].slot {
                        materialize_dup_fully(&mut ctx, dt)?;
                    }
                    return Ok(());
                }
                MutNode::Internal(entries) => {
                    if entries.is_empty() {
                        return Ok(());
                    }
                    let i = child_index(entries, key);
                    node = materialize(&mut ctx, &mut entries[i].child, false, false)?;
                }
            }
        }
    }
}

fn materialize_dup_fully(ctx: &mut OpCtx<'_>, dt: &mut DupTree) -> Result<()> {
    materialize_dup_ref(ctx, &mut dt.root, true)
}

fn materialize_dup_ref(ctx: &mut OpCtx<'_>, child: &mut ChildRef, root: bool) -> Result<()> {
    let node = materialize(ctx, child, true, root)?;
    match node {
        MutNode::Bottom(entries) => {
            for entry in entries.iter_mut() {
                if let LeafSlot::Addr(address) = entry.slot {
                    let (_, value, length) = load_leaf(ctx.log, ctx.structure_id, address, true)?;
                    ctx.expired.add(address, length);
                    entry.slot = LeafSlot::Value(value);
                }
            }
            Ok(())
        }
        MutNode::Internal(entries) => {
            for entry in entries.iter_mut() {
                materialize_dup_ref(ctx, &mut entry.child, false)?;
            }
            Ok(())
        }
    }
}

/// Key of a leaf record payload.
fn leaf_key(data: &[u8]) -> Option<Vec<u8>> {
    let (klen, n) = varint::read_u64(data)?;
    data.get(n..n + klen as usize).map(|k| k.to_vec())
}

/// Minimum key of an encoded page.
fn page_min_key(bottom: bool, data: &[u8]) -> Option<Vec<u8>> {
    super::NodePage::decode(bottom, data, 0)
        .ok()
        .and_then(|page| page.entries.first().map(|e| e.key.clone()))
}
