//! Copy-on-write mutable B+-tree.
//!
//! A mutable tree wraps an immutable snapshot. Children stay as plain log
//! addresses until a path is first touched; a touched page is decoded
//! into an owned node, its record is added to the expired collection, and
//! the edit proceeds in memory. `save` serializes dirty nodes depth-first
//! (leaves, bottoms, internals, root) and returns the new root address.

use crate::error::{Address, Error, Result, NULL_ADDRESS};
use crate::log::WriteGuard;
use crate::tree::{BalancePolicy, ExpiredLoggableCollection, TreeMutable};
use crate::varint;

use super::{
    encode_leaf, leaf_type, load_leaf, load_page, page_type, BTree, NodePage, PageEntry,
};
use crate::log::Log;
use std::sync::Arc;

/// A child reference: persisted or materialized.
pub(crate) enum ChildRef {
    /// Address of a persisted record.
    Addr(Address),
    /// An owned dirty node.
    Node(Box<MutNode>),
}

/// The slot of a bottom entry.
pub(crate) enum LeafSlot {
    /// Persisted leaf record.
    Addr(Address),
    /// Dirty value.
    Value(Vec<u8>),
    /// Nested duplicates sub-tree.
    Dup(DupTree),
}

/// A duplicates sub-tree: values keyed as the nested tree's keys.
pub(crate) struct DupTree {
    pub root: ChildRef,
    pub size: u64,
}

pub(crate) struct BottomEntry {
    pub key: Vec<u8>,
    pub slot: LeafSlot,
}

pub(crate) struct InternalEntry {
    pub key: Vec<u8>,
    pub child: ChildRef,
}

/// An owned, decoded tree node.
pub(crate) enum MutNode {
    Bottom(Vec<BottomEntry>),
    Internal(Vec<InternalEntry>),
}

impl MutNode {
    pub fn len(&self) -> usize {
        match self {
            MutNode::Bottom(entries) => entries.len(),
            MutNode::Internal(entries) => entries.len(),
        }
    }

    pub fn min_key(&self) -> Option<&[u8]> {
        match self {
            MutNode::Bottom(entries) => entries.first().map(|e| e.key.as_slice()),
            MutNode::Internal(entries) => entries.first().map(|e| e.key.as_slice()),
        }
    }
}

/// Shared pieces of a mutation, threaded through the recursion.
pub(crate) struct OpCtx<'a> {
    pub log: &'a Log,
    pub structure_id: u64,
    pub policy: BalancePolicy,
    pub expired: &'a mut ExpiredLoggableCollection,
}

/// Decodes a persisted child in place, expiring its record, and returns
/// the owned node.
pub(crate) fn materialize<'n>(
    ctx: &mut OpCtx<'_>,
    child: &'n mut ChildRef,
    dup: bool,
    root: bool,
) -> Result<&'n mut MutNode> {
    if let ChildRef::Addr(address) = *child {
        let loaded = load_page(ctx.log, ctx.structure_id, address, dup, root)?;
        ctx.expired.add(address, loaded.length);
        let node = match loaded.page.bottom {
            true => MutNode::Bottom(
                loaded
                    .page
                    .entries
                    .into_iter()
                    .map(|e| BottomEntry {
                        key: e.key,
                        slot: if e.dup {
                            LeafSlot::Dup(DupTree {
                                root: ChildRef::Addr(e.child),
                                size: e.dup_count,
                            })
                        } else {
                            LeafSlot::Addr(e.child)
                        },
                    })
                    .collect(),
            ),
            false => MutNode::Internal(
                loaded
                    .page
                    .entries
                    .into_iter()
                    .map(|e| InternalEntry { key: e.key, child: ChildRef::Addr(e.child) })
                    .collect(),
            ),
        };
        *child = ChildRef::Node(Box::new(node));
    }
    match child {
        ChildRef::Node(node) => Ok(node),
        ChildRef::Addr(_) => unreachable!("child was just materialized"),
    }
}

pub(crate) fn child_index(entries: &[InternalEntry], key: &[u8]) -> usize {
    match entries.binary_search_by(|e| e.key.as_slice().cmp(key)) {
        Ok(i) => i,
        Err(0) => 0,
        Err(i) => i - 1,
    }
}

fn split_bottom(policy: &BalancePolicy, entries: &mut Vec<BottomEntry>) -> Option<(Vec<u8>, MutNode)> {
    if entries.len() <= policy.max_bottom {
        return None;
    }
    let right = entries.split_off(entries.len() / 2);
    Some((right[0].key.clone(), MutNode::Bottom(right)))
}

fn split_internal(
    policy: &BalancePolicy,
    entries: &mut Vec<InternalEntry>,
) -> Option<(Vec<u8>, MutNode)> {
    if entries.len() <= policy.max_internal {
        return None;
    }
    let right = entries.split_off(entries.len() / 2);
    Some((right[0].key.clone(), MutNode::Internal(right)))
}

/// Wraps a split root into a fresh internal root around the two halves.
fn wrap_root(root: &mut ChildRef, separator: Vec<u8>, right: MutNode) {
    let left = std::mem::replace(root, ChildRef::Addr(NULL_ADDRESS));
    let left_min = match &left {
        ChildRef::Node(node) => node.min_key().unwrap_or_default().to_vec(),
        ChildRef::Addr(_) => unreachable!("a split root is always materialized"),
    };
    *root = ChildRef::Node(Box::new(MutNode::Internal(vec![
        InternalEntry { key: left_min, child: left },
        InternalEntry { key: separator, child: ChildRef::Node(Box::new(right)) },
    ])));
}

/// Hoists single-child internal roots.
fn collapse_root(ctx: &mut OpCtx<'_>, root: &mut ChildRef, dup: bool) -> Result<()> {
    loop {
        let single = match root {
            ChildRef::Node(node) => {
                matches!(node.as_ref(), MutNode::Internal(entries) if entries.len() == 1)
            }
            ChildRef::Addr(_) => false,
        };
        if !single {
            return Ok(());
        }
        let ChildRef::Node(node) = root else { unreachable!() };
        let MutNode::Internal(entries) = node.as_mut() else { unreachable!() };
        // The hoisted child becomes the root and must be rewritten as a
        // root record on save.
        materialize(ctx, &mut entries[0].child, dup, false)?;
        let child = entries.remove(0).child;
        *root = child;
    }
}

struct PutOutcome {
    added: bool,
    changed: bool,
}

fn put_node(
    ctx: &mut OpCtx<'_>,
    node: &mut MutNode,
    key: &[u8],
    value: &[u8],
    overwrite: bool,
    dups: bool,
    dup_level: bool,
) -> Result<(PutOutcome, Option<(Vec<u8>, MutNode)>)> {
    match node {
        MutNode::Bottom(entries) => {
            match entries.binary_search_by(|e| e.key.as_slice().cmp(key)) {
                Ok(i) => {
                    if dups {
                        let entry = &mut entries[i];
                        let outcome = match &mut entry.slot {
                            LeafSlot::Dup(dt) => {
                                let added = dup_put(ctx, dt, value)?;
                                PutOutcome { added, changed: added }
                            }
                            slot => {
                                let old = match slot {
                                    LeafSlot::Value(v) => v.clone(),
                                    LeafSlot::Addr(a) => {
                                        let (_, v, len) =
                                            load_leaf(ctx.log, ctx.structure_id, *a, dup_level)?;
                                        ctx.expired.add(*a, len);
                                        v
                                    }
                                    LeafSlot::Dup(_) => unreachable!(),
                                };
                                if old == value {
                                    PutOutcome { added: false, changed: false }
                                } else {
                                    *slot = LeafSlot::Dup(new_dup_tree(old, value.to_vec()));
                                    PutOutcome { added: true, changed: true }
                                }
                            }
                        };
                        Ok((outcome, None))
                    } else if overwrite {
                        let entry = &mut entries[i];
                        if let LeafSlot::Addr(a) = entry.slot {
                            let (_, _, len) = load_leaf(ctx.log, ctx.structure_id, a, dup_level)?;
                            ctx.expired.add(a, len);
                        }
                        entry.slot = LeafSlot::Value(value.to_vec());
                        Ok((PutOutcome { added: false, changed: true }, None))
                    } else {
                        Ok((PutOutcome { added: false, changed: false }, None))
                    }
                }
                Err(i) => {
                    entries.insert(
                        i,
                        BottomEntry { key: key.to_vec(), slot: LeafSlot::Value(value.to_vec()) },
                    );
                    let split = split_bottom(&ctx.policy, entries);
                    Ok((PutOutcome { added: true, changed: true }, split))
                }
            }
        }
        MutNode::Internal(entries) => {
            debug_assert!(!entries.is_empty());
            // Keep the minimum key of the leftmost subtree accurate.
            if key < entries[0].key.as_slice() {
                entries[0].key = key.to_vec();
            }
            let i = child_index(entries, key);
            let child = materialize(ctx, &mut entries[i].child, dup_level, false)?;
            let (outcome, promoted) = put_node(ctx, child, key, value, overwrite, dups, dup_level)?;
            if let Some((separator, right)) = promoted {
                entries.insert(
                    i + 1,
                    InternalEntry { key: separator, child: ChildRef::Node(Box::new(right)) },
                );
            }
            let split = split_internal(&ctx.policy, entries);
            Ok((outcome, split))
        }
    }
}

fn new_dup_tree(a: Vec<u8>, b: Vec<u8>) -> DupTree {
    let (small, large) = if a < b { (a, b) } else { (b, a) };
    DupTree {
        root: ChildRef::Node(Box::new(MutNode::Bottom(vec![
            BottomEntry { key: small, slot: LeafSlot::Value(Vec::new()) },
            BottomEntry { key: large, slot: LeafSlot::Value(Vec::new()) },
        ]))),
        size: 2,
    }
}

/// Inserts `value` into a duplicates sub-tree; `false` if already present.
fn dup_put(ctx: &mut OpCtx<'_>, dt: &mut DupTree, value: &[u8]) -> Result<bool> {
    let root = materialize(ctx, &mut dt.root, true, true)?;
    let (outcome, promoted) = put_node(ctx, root, value, &[], false, false, true)?;
    if let Some((separator, right)) = promoted {
        wrap_root(&mut dt.root, separator, right);
    }
    if outcome.added {
        dt.size += 1;
    }
    Ok(outcome.added)
}

/// Number of pairs a slot contributes.
fn slot_count(slot: &LeafSlot) -> u64 {
    match slot {
        LeafSlot::Dup(dt) => dt.size,
        _ => 1,
    }
}

/// Expires every persisted record reachable from `child`.
fn expire_ref(ctx: &mut OpCtx<'_>, child: &ChildRef, dup: bool, root: bool) -> Result<()> {
    match child {
        ChildRef::Addr(address) => expire_page(ctx, *address, dup, root),
        ChildRef::Node(node) => match node.as_ref() {
            MutNode::Bottom(entries) => {
                for entry in entries {
                    expire_slot(ctx, &entry.slot, dup)?;
                }
                Ok(())
            }
            MutNode::Internal(entries) => {
                for entry in entries {
                    expire_ref(ctx, &entry.child, dup, false)?;
                }
                Ok(())
            }
        },
    }
}

fn expire_page(ctx: &mut OpCtx<'_>, address: Address, dup: bool, root: bool) -> Result<()> {
    let loaded = load_page(ctx.log, ctx.structure_id, address, dup, root)?;
    ctx.expired.add(address, loaded.length);
    for entry in &loaded.page.entries {
        if loaded.page.bottom {
            if entry.dup {
                expire_page(ctx, entry.child, true, true)?;
            } else {
                let (_, _, len) = load_leaf(ctx.log, ctx.structure_id, entry.child, dup)?;
                ctx.expired.add(entry.child, len);
            }
        } else {
            expire_page(ctx, entry.child, dup, false)?;
        }
    }
    Ok(())
}

fn expire_slot(ctx: &mut OpCtx<'_>, slot: &LeafSlot, dup_level: bool) -> Result<()> {
    match slot {
        LeafSlot::Addr(a) => {
            let (_, _, len) = load_leaf(ctx.log, ctx.structure_id, *a, dup_level)?;
            ctx.expired.add(*a, len);
            Ok(())
        }
        LeafSlot::Value(_) => Ok(()),
        LeafSlot::Dup(dt) => expire_ref(ctx, &dt.root, true, true),
    }
}

/// Smallest value in a duplicates sub-tree, through dirty nodes.
fn dup_min(ctx: &OpCtx<'_>, child: &ChildRef, root: bool) -> Result<Vec<u8>> {
    match child {
        ChildRef::Node(node) => match node.as_ref() {
            MutNode::Bottom(entries) => entries
                .first()
                .map(|e| e.key.clone())
                .ok_or_else(|| Error::Internal { reason: "empty duplicates page".to_string() }),
            MutNode::Internal(entries) => dup_min(ctx, &entries[0].child, false),
        },
        ChildRef::Addr(address) => {
            let mut page = load_page(ctx.log, ctx.structure_id, *address, true, root)?.page;
            loop {
                let first = page.entries.first().ok_or_else(|| {
                    Error::corrupted(*address, "empty duplicate sub-tree page")
                })?;
                if page.bottom {
                    return Ok(first.key.clone());
                }
                let child = first.child;
                page = load_page(ctx.log, ctx.structure_id, child, true, false)?.page;
            }
        }
    }
}

fn delete_node(
    ctx: &mut OpCtx<'_>,
    node: &mut MutNode,
    key: &[u8],
    value: Option<&[u8]>,
    dup_level: bool,
) -> Result<u64> {
    match node {
        MutNode::Bottom(entries) => {
            let Ok(i) = entries.binary_search_by(|e| e.key.as_slice().cmp(key)) else {
                return Ok(0);
            };
            match value {
                None => {
                    let removed = slot_count(&entries[i].slot);
                    expire_slot(ctx, &entries[i].slot, dup_level)?;
                    entries.remove(i);
                    Ok(removed)
                }
                Some(v) => {
                    let entry = &mut entries[i];
                    match &mut entry.slot {
                        LeafSlot::Dup(dt) => {
                            if !dup_delete(ctx, dt, v)? {
                                return Ok(0);
                            }
                            // A duplicate sub-tree starts at two values and
                            // shrinks one per deletion, so it always exits
                            // through the inline collapse.
                            if dt.size == 1 {
                                let remaining = dup_min(ctx, &dt.root, true)?;
                                expire_ref(ctx, &dt.root, true, true)?;
                                entry.slot = LeafSlot::Value(remaining);
                            }
                            Ok(1)
                        }
                        slot => {
                            let matches = match slot {
                                LeafSlot::Value(v0) => v0 == v,
                                LeafSlot::Addr(a) => {
                                    let (_, v0, _) =
                                        load_leaf(ctx.log, ctx.structure_id, *a, dup_level)?;
                                    v0 == v
                                }
                                LeafSlot::Dup(_) => unreachable!(),
                            };
                            if !matches {
                                return Ok(0);
                            }
                            expire_slot(ctx, slot, dup_level)?;
                            entries.remove(i);
                            Ok(1)
                        }
                    }
                }
            }
        }
        MutNode::Internal(entries) => {
            let i = child_index(entries, key);
            let removed;
            let child_len;
            let child_min;
            {
                let child = materialize(ctx, &mut entries[i].child, dup_level, false)?;
                removed = delete_node(ctx, child, key, value, dup_level)?;
                child_len = child.len();
                child_min = child.min_key().map(|k| k.to_vec());
            }
            if removed > 0 {
                if child_len == 0 {
                    entries.remove(i);
                } else {
                    if let Some(min) = child_min {
                        entries[i].key = min;
                    }
                    if ctx.policy.needs_merge(child_len) && entries.len() > 1 {
                        rebalance(ctx, entries, i, dup_level)?;
                    }
                }
            }
            Ok(removed)
        }
    }
}

fn dup_delete(ctx: &mut OpCtx<'_>, dt: &mut DupTree, value: &[u8]) -> Result<bool> {
    let root = materialize(ctx, &mut dt.root, true, true)?;
    let removed = delete_node(ctx, root, value, None, true)?;
    collapse_root(ctx, &mut dt.root, true)?;
    if removed > 0 {
        dt.size -= removed;
        Ok(true)
    } else {
        Ok(false)
    }
}

/// Merges or redistributes an underfull child with a sibling.
fn rebalance(
    ctx: &mut OpCtx<'_>,
    entries: &mut Vec<InternalEntry>,
    i: usize,
    dup_level: bool,
) -> Result<()> {
    let sibling = if i > 0 { i - 1 } else { i + 1 };
    let left_idx = i.min(sibling);
    let right_idx = i.max(sibling);

    let (merged, right_min) = {
        let (head, tail) = entries.split_at_mut(right_idx);
        let left = materialize(ctx, &mut head[left_idx].child, dup_level, false)?;
        let right = materialize(ctx, &mut tail[0].child, dup_level, false)?;
        match (left, right) {
            (MutNode::Bottom(l), MutNode::Bottom(r)) => {
                let merged = rebalance_vecs(l, r, ctx.policy.max_bottom);
                (merged, r.first().map(|e| e.key.clone()))
            }
            (MutNode::Internal(l), MutNode::Internal(r)) => {
                let merged = rebalance_vecs(l, r, ctx.policy.max_internal);
                (merged, r.first().map(|e| e.key.clone()))
            }
            _ => {
                return Err(Error::Internal {
                    reason: "sibling pages of different kinds".to_string(),
                })
            }
        }
    };
    if merged {
        entries.remove(right_idx);
    } else if let Some(min) = right_min {
        entries[right_idx].key = min;
    }
    Ok(())
}

/// Returns `true` when everything fit into the left vector.
fn rebalance_vecs<T>(left: &mut Vec<T>, right: &mut Vec<T>, max: usize) -> bool {
    if left.len() + right.len() <= max {
        left.append(right);
        return true;
    }
    let target = (left.len() + right.len()) / 2;
    if left.len() > target {
        let moved = left.split_off(target);
        right.splice(0..0, moved);
    } else {
        let take = target - left.len();
        let moved: Vec<T> = right.drain(0..take).collect();
        left.extend(moved);
    }
    false
}

fn put_right_node(
    ctx: &mut OpCtx<'_>,
    node: &mut MutNode,
    key: &[u8],
    value: &[u8],
    dups: bool,
    dup_level: bool,
) -> Result<Option<(Vec<u8>, MutNode)>> {
    match node {
        MutNode::Bottom(entries) => {
            debug_assert!(entries.last().map_or(true, |e| e.key.as_slice() <= key));
            if dups && entries.last().map_or(false, |e| e.key == key) {
                let entry = entries.last_mut().expect("just checked");
                match &mut entry.slot {
                    LeafSlot::Dup(dt) => {
                        dup_put(ctx, dt, value)?;
                    }
                    slot => {
                        let old = match slot {
                            LeafSlot::Value(v) => v.clone(),
                            LeafSlot::Addr(a) => {
                                let (_, v, len) =
                                    load_leaf(ctx.log, ctx.structure_id, *a, dup_level)?;
                                ctx.expired.add(*a, len);
                                v
                            }
                            LeafSlot::Dup(_) => unreachable!(),
                        };
                        debug_assert!(old.as_slice() < value);
                        *slot = LeafSlot::Dup(new_dup_tree(old, value.to_vec()));
                    }
                }
                return Ok(None);
            }
            debug_assert!(entries.last().map_or(true, |e| e.key.as_slice() < key));
            entries.push(BottomEntry { key: key.to_vec(), slot: LeafSlot::Value(value.to_vec()) });
            Ok(split_bottom(&ctx.policy, entries))
        }
        MutNode::Internal(entries) => {
            let i = entries.len() - 1;
            let child = materialize(ctx, &mut entries[i].child, dup_level, false)?;
            let promoted = put_right_node(ctx, child, key, value, dups, dup_level)?;
            if let Some((separator, right)) = promoted {
                entries.push(InternalEntry {
                    key: separator,
                    child: ChildRef::Node(Box::new(right)),
                });
            }
            Ok(split_internal(&ctx.policy, entries))
        }
    }
}

fn save_ref(
    guard: &mut WriteGuard<'_>,
    structure_id: u64,
    child: &mut ChildRef,
    dup: bool,
    root: bool,
    size: u64,
) -> Result<Address> {
    match child {
        ChildRef::Addr(address) => Ok(*address),
        ChildRef::Node(node) => {
            let page = match node.as_mut() {
                MutNode::Bottom(entries) => {
                    let mut encoded = Vec::with_capacity(entries.len());
                    for entry in entries.iter_mut() {
                        let page_entry = match &mut entry.slot {
                            LeafSlot::Addr(a) => {
                                PageEntry { key: entry.key.clone(), child: *a, dup: false, dup_count: 0 }
                            }
                            LeafSlot::Value(v) => {
                                let address = guard.write(
                                    leaf_type(dup),
                                    structure_id,
                                    &encode_leaf(&entry.key, v),
                                )?;
                                let page_entry = PageEntry {
                                    key: entry.key.clone(),
                                    child: address,
                                    dup: false,
                                    dup_count: 0,
                                };
                                entry.slot = LeafSlot::Addr(address);
                                page_entry
                            }
                            LeafSlot::Dup(dt) => {
                                let address =
                                    save_ref(guard, structure_id, &mut dt.root, true, true, dt.size)?;
                                PageEntry {
                                    key: entry.key.clone(),
                                    child: address,
                                    dup: true,
                                    dup_count: dt.size,
                                }
                            }
                        };
                        encoded.push(page_entry);
                    }
                    NodePage { bottom: true, entries: encoded }
                }
                MutNode::Internal(entries) => {
                    let mut encoded = Vec::with_capacity(entries.len());
                    for entry in entries.iter_mut() {
                        let address =
                            save_ref(guard, structure_id, &mut entry.child, dup, false, 0)?;
                        encoded.push(PageEntry {
                            key: entry.key.clone(),
                            child: address,
                            dup: false,
                            dup_count: 0,
                        });
                    }
                    NodePage { bottom: false, entries: encoded }
                }
            };
            let mut data = Vec::new();
            if root {
                varint::write_u64(&mut data, size);
            }
            data.extend_from_slice(&page.encode());
            let address = guard.write(page_type(page.bottom, root, dup), structure_id, &data)?;
            *child = ChildRef::Addr(address);
            Ok(address)
        }
    }
}

/// A mutable B+-tree over an immutable snapshot.
pub struct BTreeMutable {
    pub(crate) log: Arc<Log>,
    pub(crate) structure_id: u64,
    pub(crate) policy: BalancePolicy,
    pub(crate) dups: bool,
    pub(crate) root: ChildRef,
    pub(crate) size: u64,
    pub(crate) orig_root: Address,
    pub(crate) expired: ExpiredLoggableCollection,
}

impl BTreeMutable {
    /// Starts a mutation over `tree`.
    pub fn new(tree: &BTree) -> Result<Self> {
        let root = if tree.root_address == NULL_ADDRESS {
            ChildRef::Node(Box::new(MutNode::Bottom(Vec::new())))
        } else {
            ChildRef::Addr(tree.root_address)
        };
        Ok(Self {
            log: Arc::clone(&tree.log),
            structure_id: tree.structure_id,
            policy: tree.policy,
            dups: tree.dups,
            root,
            size: tree.size,
            orig_root: tree.root_address,
            expired: ExpiredLoggableCollection::default(),
        })
    }

    /// Whether this tree keeps multiple values per key.
    pub fn allows_duplicates(&self) -> bool {
        self.dups
    }

    /// Root address of the snapshot this mutation started from.
    pub fn orig_root_address(&self) -> Address {
        self.orig_root
    }

    pub(crate) fn ctx(&mut self) -> (OpCtx<'_>, &mut ChildRef) {
        (
            OpCtx {
                log: &self.log,
                structure_id: self.structure_id,
                policy: self.policy,
                expired: &mut self.expired,
            },
            &mut self.root,
        )
    }

    /// First value of `key` through dirty and persisted nodes alike.
    fn get_in<'a>(&self, child: &'a ChildRef, key: &[u8], root: bool) -> Result<Option<LookedUp<'a>>> {
        match child {
            ChildRef::Node(node) => match node.as_ref() {
                MutNode::Bottom(entries) => {
                    match entries.binary_search_by(|e| e.key.as_slice().cmp(key)) {
                        Ok(i) => Ok(Some(match &entries[i].slot {
                            LeafSlot::Value(v) => LookedUp::Inline(v.clone()),
                            LeafSlot::Addr(a) => {
                                let (_, v, _) = load_leaf(&self.log, self.structure_id, *a, false)?;
                                LookedUp::Inline(v)
                            }
                            LeafSlot::Dup(dt) => LookedUp::Dup(DupView::Dirty(dt)),
                        })),
                        Err(_) => Ok(None),
                    }
                }
                MutNode::Internal(entries) => {
                    if entries.is_empty() {
                        return Ok(None);
                    }
                    self.get_in(&entries[child_index(entries, key)].child, key, false)
                }
            },
            ChildRef::Addr(address) => {
                let mut page =
                    load_page(&self.log, self.structure_id, *address, false, root)?.page;
                loop {
                    if page.bottom {
                        return match page.search(key) {
                            Ok(i) => {
                                let entry = &page.entries[i];
                                if entry.dup {
                                    Ok(Some(LookedUp::Dup(DupView::Persisted(entry.child))))
                                } else {
                                    let (_, v, _) =
                                        load_leaf(&self.log, self.structure_id, entry.child, false)?;
                                    Ok(Some(LookedUp::Inline(v)))
                                }
                            }
                            Err(_) => Ok(None),
                        };
                    }
                    if page.entries.is_empty() {
                        return Ok(None);
                    }
                    let child = page.entries[page.child_index_for(key)].child;
                    page = load_page(&self.log, self.structure_id, child, false, false)?.page;
                }
            }
        }
    }

    fn dup_first(&self, view: &DupView<'_>) -> Result<Vec<u8>> {
        match view {
            DupView::Dirty(dt) => {
                // dup_min never expires anything; a scratch collection
                // keeps the borrow local.
                let mut scratch = ExpiredLoggableCollection::default();
                let ctx = OpCtx {
                    log: &self.log,
                    structure_id: self.structure_id,
                    policy: self.policy,
                    expired: &mut scratch,
                };
                dup_min(&ctx, &dt.root, true)
            }
            DupView::Persisted(address) => {
                let mut page = load_page(&self.log, self.structure_id, *address, true, true)?.page;
                loop {
                    let first = page.entries.first().ok_or_else(|| {
                        Error::corrupted(*address, "empty duplicate sub-tree page")
                    })?;
                    if page.bottom {
                        return Ok(first.key.clone());
                    }
                    let child = first.child;
                    page = load_page(&self.log, self.structure_id, child, true, false)?.page;
                }
            }
        }
    }

    fn dup_has(&self, view: &DupView<'_>, value: &[u8]) -> Result<bool> {
        match view {
            DupView::Dirty(dt) => self.dup_has_ref(&dt.root, value, true),
            DupView::Persisted(address) => self.dup_has_addr(*address, value, true),
        }
    }

    fn dup_has_ref(&self, child: &ChildRef, value: &[u8], root: bool) -> Result<bool> {
        match child {
            ChildRef::Node(node) => match node.as_ref() {
                MutNode::Bottom(entries) => {
                    Ok(entries.binary_search_by(|e| e.key.as_slice().cmp(value)).is_ok())
                }
                MutNode::Internal(entries) => {
                    if entries.is_empty() {
                        return Ok(false);
                    }
                    self.dup_has_ref(&entries[child_index(entries, value)].child, value, false)
                }
            },
            ChildRef::Addr(address) => self.dup_has_addr(*address, value, root),
        }
    }

    fn dup_has_addr(&self, address: Address, value: &[u8], root: bool) -> Result<bool> {
        let mut page = load_page(&self.log, self.structure_id, address, true, root)?.page;
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

    /// Whether the exact pair exists, through dirty and persisted nodes.
    pub fn has_pair(&self, key: &[u8], value: &[u8]) -> Result<bool> {
        match self.get_in(&self.root, key, true)? {
            None => Ok(false),
            Some(LookedUp::Inline(v)) => Ok(v == value),
            Some(LookedUp::Dup(view)) => self.dup_has(&view, value),
        }
    }

    // ── Ordered iteration for mutable cursors ───────────────────────────

    fn dup_min_ref(&self, child: &ChildRef, root: bool) -> Result<Vec<u8>> {
        // dup_min never expires anything; a scratch collection keeps the
        // borrow local.
        let mut scratch = ExpiredLoggableCollection::default();
        let ctx = OpCtx {
            log: &self.log,
            structure_id: self.structure_id,
            policy: self.policy,
            expired: &mut scratch,
        };
        dup_min(&ctx, child, root)
    }

    fn dup_min_page(&self, address: Address) -> Result<Vec<u8>> {
        let mut page = load_page(&self.log, self.structure_id, address, true, true)?.page;
        loop {
            let first = page
                .entries
                .first()
                .ok_or_else(|| Error::corrupted(address, "empty duplicate sub-tree page"))?;
            if page.bottom {
                return Ok(first.key.clone());
            }
            let child = first.child;
            page = load_page(&self.log, self.structure_id, child, true, false)?.page;
        }
    }

    /// Smallest value of a dirty slot.
    fn slot_first_value(&self, slot: &LeafSlot) -> Result<Vec<u8>> {
        match slot {
            LeafSlot::Value(v) => Ok(v.clone()),
            LeafSlot::Addr(a) => Ok(load_leaf(&self.log, self.structure_id, *a, false)?.1),
            LeafSlot::Dup(dt) => self.dup_min_ref(&dt.root, true),
        }
    }

    /// Smallest value of a persisted bottom entry.
    fn entry_first_value(&self, entry: &PageEntry) -> Result<Vec<u8>> {
        if entry.dup {
            self.dup_min_page(entry.child)
        } else {
            Ok(load_leaf(&self.log, self.structure_id, entry.child, false)?.1)
        }
    }

    fn min_pair_ref(&self, child: &ChildRef, root: bool) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
        match child {
            ChildRef::Node(node) => match node.as_ref() {
                MutNode::Bottom(entries) => match entries.first() {
                    Some(entry) => {
                        Ok(Some((entry.key.clone(), self.slot_first_value(&entry.slot)?)))
                    }
                    None => Ok(None),
                },
                MutNode::Internal(entries) => {
                    for entry in entries {
                        if let Some(pair) = self.min_pair_ref(&entry.child, false)? {
                            return Ok(Some(pair));
                        }
                    }
                    Ok(None)
                }
            },
            ChildRef::Addr(address) => self.min_pair_addr(*address, root),
        }
    }

    fn min_pair_addr(&self, address: Address, root: bool) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
        let page = load_page(&self.log, self.structure_id, address, false, root)?.page;
        if page.bottom {
            match page.entries.first() {
                Some(entry) => Ok(Some((entry.key.clone(), self.entry_first_value(entry)?))),
                None => Ok(None),
            }
        } else {
            for entry in &page.entries {
                if let Some(pair) = self.min_pair_addr(entry.child, false)? {
                    return Ok(Some(pair));
                }
            }
            Ok(None)
        }
    }

    /// Smallest duplicate value strictly greater than `value`.
    fn dup_after_ref(&self, child: &ChildRef, root: bool, value: &[u8]) -> Result<Option<Vec<u8>>> {
        match child {
            ChildRef::Node(node) => match node.as_ref() {
                MutNode::Bottom(entries) => {
                    let start = match entries.binary_search_by(|e| e.key.as_slice().cmp(value)) {
                        Ok(i) => i + 1,
                        Err(i) => i,
                    };
                    Ok(entries.get(start).map(|e| e.key.clone()))
                }
                MutNode::Internal(entries) => {
                    if entries.is_empty() {
                        return Ok(None);
                    }
                    let idx = child_index(entries, value);
                    if let Some(v) = self.dup_after_ref(&entries[idx].child, false, value)? {
                        return Ok(Some(v));
                    }
                    match entries.get(idx + 1) {
                        Some(next) => Ok(Some(self.dup_min_ref(&next.child, false)?)),
                        None => Ok(None),
                    }
                }
            },
            ChildRef::Addr(address) => self.dup_after_addr(*address, root, value),
        }
    }

    fn dup_after_addr(&self, address: Address, root: bool, value: &[u8]) -> Result<Option<Vec<u8>>> {
        let page = load_page(&self.log, self.structure_id, address, true, root)?.page;
        if page.bottom {
            let start = match page.search(value) {
                Ok(i) => i + 1,
                Err(i) => i,
            };
            Ok(page.entries.get(start).map(|e| e.key.clone()))
        } else {
            if page.entries.is_empty() {
                return Ok(None);
            }
            let idx = page.child_index_for(value);
            if let Some(v) = self.dup_after_addr(page.entries[idx].child, false, value)? {
                return Ok(Some(v));
            }
            match page.entries.get(idx + 1) {
                Some(next) => {
                    let mut sub = load_page(&self.log, self.structure_id, next.child, true, false)?
                        .page;
                    loop {
                        let first = sub.entries.first().ok_or_else(|| {
                            Error::corrupted(next.child, "empty duplicate sub-tree page")
                        })?;
                        if sub.bottom {
                            return Ok(Some(first.key.clone()));
                        }
                        let child = first.child;
                        sub = load_page(&self.log, self.structure_id, child, true, false)?.page;
                    }
                }
                None => Ok(None),
            }
        }
    }

    /// Smallest pair strictly greater than `(key, value)`.
    fn pair_after_ref(
        &self,
        child: &ChildRef,
        root: bool,
        key: &[u8],
        value: &[u8],
    ) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
        match child {
            ChildRef::Node(node) => match node.as_ref() {
                MutNode::Bottom(entries) => {
                    let start = match entries.binary_search_by(|e| e.key.as_slice().cmp(key)) {
                        Ok(i) => i,
                        Err(i) => i,
                    };
                    for entry in &entries[start..] {
                        if entry.key.as_slice() == key {
                            // The key itself is consumed; on multi-valued
                            // trees its remaining larger values follow.
                            if !self.dups {
                                continue;
                            }
                            match &entry.slot {
                                LeafSlot::Dup(dt) => {
                                    if let Some(v) = self.dup_after_ref(&dt.root, true, value)? {
                                        return Ok(Some((entry.key.clone(), v)));
                                    }
                                }
                                slot => {
                                    let v0 = self.slot_first_value(slot)?;
                                    if v0.as_slice() > value {
                                        return Ok(Some((entry.key.clone(), v0)));
                                    }
                                }
                            }
                            continue;
                        }
                        return Ok(Some((entry.key.clone(), self.slot_first_value(&entry.slot)?)));
                    }
                    Ok(None)
                }
                MutNode::Internal(entries) => {
                    if entries.is_empty() {
                        return Ok(None);
                    }
                    let idx = child_index(entries, key);
                    if let Some(pair) = self.pair_after_ref(&entries[idx].child, false, key, value)?
                    {
                        return Ok(Some(pair));
                    }
                    for entry in &entries[idx + 1..] {
                        if let Some(pair) = self.min_pair_ref(&entry.child, false)? {
                            return Ok(Some(pair));
                        }
                    }
                    Ok(None)
                }
            },
            ChildRef::Addr(address) => self.pair_after_addr(*address, root, key, value),
        }
    }

    fn pair_after_addr(
        &self,
        address: Address,
        root: bool,
        key: &[u8],
        value: &[u8],
    ) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
        let page = load_page(&self.log, self.structure_id, address, false, root)?.page;
        if page.bottom {
            let start = match page.search(key) {
                Ok(i) => i,
                Err(i) => i,
            };
            for entry in &page.entries[start..] {
                if entry.key.as_slice() == key {
                    if !self.dups {
                        continue;
                    }
                    if entry.dup {
                        if let Some(v) = self.dup_after_addr(entry.child, true, value)? {
                            return Ok(Some((entry.key.clone(), v)));
                        }
                    } else {
                        let v0 = load_leaf(&self.log, self.structure_id, entry.child, false)?.1;
                        if v0.as_slice() > value {
                            return Ok(Some((entry.key.clone(), v0)));
                        }
                    }
                    continue;
                }
                return Ok(Some((entry.key.clone(), self.entry_first_value(entry)?)));
            }
            Ok(None)
        } else {
            if page.entries.is_empty() {
                return Ok(None);
            }
            let idx = page.child_index_for(key);
            if let Some(pair) = self.pair_after_addr(page.entries[idx].child, false, key, value)? {
                return Ok(Some(pair));
            }
            for entry in &page.entries[idx + 1..] {
                if let Some(pair) = self.min_pair_addr(entry.child, false)? {
                    return Ok(Some(pair));
                }
            }
            Ok(None)
        }
    }
}

enum LookedUp<'a> {
    Inline(Vec<u8>),
    Dup(DupView<'a>),
}

enum DupView<'a> {
    Dirty(&'a DupTree),
    Persisted(Address),
}

impl TreeMutable for BTreeMutable {
    fn structure_id(&self) -> u64 {
        self.structure_id
    }

    fn size(&self) -> u64 {
        self.size
    }

    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        match self.get_in(&self.root, key, true)? {
            None => Ok(None),
            Some(LookedUp::Inline(v)) => Ok(Some(v)),
            Some(LookedUp::Dup(view)) => Ok(Some(self.dup_first(&view)?)),
        }
    }

    fn first_pair(&self) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
        self.min_pair_ref(&self.root, true)
    }

    fn next_pair_after(&self, key: &[u8], value: &[u8]) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
        self.pair_after_ref(&self.root, true, key, value)
    }

    fn put(&mut self, key: &[u8], value: &[u8]) -> Result<bool> {
        let dups = self.dups;
        let (mut ctx, root) = self.ctx();
        let node = materialize(&mut ctx, root, false, true)?;
        let (outcome, promoted) = put_node(&mut ctx, node, key, value, true, dups, false)?;
        if let Some((separator, right)) = promoted {
            wrap_root(root, separator, right);
        }
        if outcome.added {
            self.size += 1;
        }
        Ok(outcome.changed)
    }

    fn add(&mut self, key: &[u8], value: &[u8]) -> Result<bool> {
        let dups = self.dups;
        let (mut ctx, root) = self.ctx();
        let node = materialize(&mut ctx, root, false, true)?;
        let (outcome, promoted) = put_node(&mut ctx, node, key, value, false, dups, false)?;
        if let Some((separator, right)) = promoted {
            wrap_root(root, separator, right);
        }
        if outcome.added {
            self.size += 1;
        }
        Ok(outcome.changed)
    }

    fn put_right(&mut self, key: &[u8], value: &[u8]) -> Result<()> {
        let dups = self.dups;
        let (mut ctx, root) = self.ctx();
        let node = materialize(&mut ctx, root, false, true)?;
        let promoted = put_right_node(&mut ctx, node, key, value, dups, false)?;
        if let Some((separator, right)) = promoted {
            wrap_root(root, separator, right);
        }
        self.size += 1;
        Ok(())
    }

    fn delete(&mut self, key: &[u8]) -> Result<bool> {
        let (mut ctx, root) = self.ctx();
        let node = materialize(&mut ctx, root, false, true)?;
        let removed = delete_node(&mut ctx, node, key, None, false)?;
        collapse_root(&mut ctx, root, false)?;
        self.size -= removed;
        Ok(removed > 0)
    }

    fn delete_value(&mut self, key: &[u8], value: &[u8]) -> Result<bool> {
        let (mut ctx, root) = self.ctx();
        let node = materialize(&mut ctx, root, false, true)?;
        let removed = delete_node(&mut ctx, node, key, Some(value), false)?;
        collapse_root(&mut ctx, root, false)?;
        self.size -= removed;
        Ok(removed > 0)
    }

    fn save(&mut self, guard: &mut WriteGuard<'_>) -> Result<Address> {
        if let ChildRef::Addr(address) = self.root {
            // Nothing was touched.
            return Ok(address);
        }
        save_ref(guard, self.structure_id, &mut self.root, false, true, self.size)
    }

    fn expired(&self) -> &ExpiredLoggableCollection {
        &self.expired
    }

    fn reclaim(
        &mut self,
        head: &crate::log::loggable::Loggable,
        iter: &mut crate::log::LogIterator<'_>,
    ) -> Result<bool> {
        self.reclaim_impl(head, iter)
    }
}
