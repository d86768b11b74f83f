//! Copy-on-write mutable Patricia tree.
//!
//! Mutation follows the B+-tree discipline: persisted nodes stay as
//! addresses until touched, a touched node is decoded into an owned copy
//! and its record expires, and `save` writes dirty nodes bottom-up ending
//! in the root record. Node records carry no key path, so reclaim locates
//! live records by address containment: children are always written
//! before their parents, which allows pruning whole subtrees rooted below
//! the candidate segment.

use std::sync::Arc;

use crate::error::{Address, Result, NULL_ADDRESS};
use crate::log::loggable::{Loggable, PATRICIA_NODE, PATRICIA_ROOT};
use crate::log::{Log, LogIterator, WriteGuard};
use crate::tree::{ExpiredLoggableCollection, TreeMutable};
use crate::varint;

use super::{common_prefix, decode_dup_key, encode_dup_key, load_node, PNode, PatriciaTree};

/// A child reference: persisted or materialized.
pub(crate) enum PRef {
    Addr(Address),
    Node(Box<MutPNode>),
}

/// An owned, decoded node.
pub(crate) struct MutPNode {
    pub prefix: Vec<u8>,
    pub value: Option<Vec<u8>>,
    /// Sorted by edge byte.
    pub children: Vec<(u8, PRef)>,
}

impl MutPNode {
    fn shell() -> Self {
        Self { prefix: Vec::new(), value: None, children: Vec::new() }
    }

    fn from_page(node: PNode) -> Self {
        Self {
            prefix: node.prefix,
            value: node.value,
            children: node.children.into_iter().map(|(b, a)| (b, PRef::Addr(a))).collect(),
        }
    }

    fn child_index(&self, edge: u8) -> std::result::Result<usize, usize> {
        self.children.binary_search_by_key(&edge, |(b, _)| *b)
    }
}

struct PCtx<'a> {
    log: &'a Log,
    structure_id: u64,
    expired: &'a mut ExpiredLoggableCollection,
}

fn pmaterialize<'n>(
    ctx: &mut PCtx<'_>,
    child: &'n mut PRef,
    root: bool,
) -> Result<&'n mut MutPNode> {
    if let PRef::Addr(address) = *child {
        let (node, length, _) = load_node(ctx.log, ctx.structure_id, address, root)?;
        ctx.expired.add(address, length);
        *child = PRef::Node(Box::new(MutPNode::from_page(node)));
    }
    match child {
        PRef::Node(node) => Ok(node),
        PRef::Addr(_) => unreachable!("child was just materialized"),
    }
}

/// Inserts a stored key. Returns `(added, changed)`.
fn insert_ref(
    ctx: &mut PCtx<'_>,
    child: &mut PRef,
    root: bool,
    key: &[u8],
    value: &[u8],
    overwrite: bool,
) -> Result<(bool, bool)> {
    let node = pmaterialize(ctx, child, root)?;
    let common = common_prefix(&node.prefix, key);
    if common < node.prefix.len() {
        // Split: this node keeps the shared prefix; its old contents move
        // into a child holding the suffix past the diverging byte.
        let old_edge = node.prefix[common];
        let old = MutPNode {
            prefix: node.prefix[common + 1..].to_vec(),
            value: node.value.take(),
            children: std::mem::take(&mut node.children),
        };
        node.prefix.truncate(common);
        if key.len() == common {
            node.value = Some(value.to_vec());
            node.children = vec![(old_edge, PRef::Node(Box::new(old)))];
        } else {
            let new_edge = key[common];
            let fresh = MutPNode {
                prefix: key[common + 1..].to_vec(),
                value: Some(value.to_vec()),
                children: Vec::new(),
            };
            node.value = None;
            let mut children = vec![
                (old_edge, PRef::Node(Box::new(old))),
                (new_edge, PRef::Node(Box::new(fresh))),
            ];
            children.sort_by_key(|(b, _)| *b);
            node.children = children;
        }
        return Ok((true, true));
    }

    let rest = &key[common..];
    if rest.is_empty() {
        return Ok(if node.value.is_none() {
            node.value = Some(value.to_vec());
            (true, true)
        } else if overwrite {
            node.value = Some(value.to_vec());
            (false, true)
        } else {
            (false, false)
        });
    }
    match node.child_index(rest[0]) {
        Ok(i) => insert_ref(ctx, &mut node.children[i].1, false, &rest[1..], value, overwrite),
        Err(i) => {
            let fresh = MutPNode {
                prefix: rest[1..].to_vec(),
                value: Some(value.to_vec()),
                children: Vec::new(),
            };
            node.children.insert(i, (rest[0], PRef::Node(Box::new(fresh))));
            Ok((true, true))
        }
    }
}

/// Deletes a stored key. Returns `(removed, prune_me)`; `prune_me` asks
/// the parent to drop this now-empty node.
fn delete_ref(
    ctx: &mut PCtx<'_>,
    child: &mut PRef,
    root: bool,
    key: &[u8],
) -> Result<(bool, bool)> {
    let node = pmaterialize(ctx, child, root)?;
    if !key.starts_with(&node.prefix) {
        return Ok((false, false));
    }
    let rest = &key[node.prefix.len()..];
    let removed = if rest.is_empty() {
        node.value.take().is_some()
    } else {
        match node.child_index(rest[0]) {
            Ok(i) => {
                let (removed, prune) =
                    delete_ref(ctx, &mut node.children[i].1, false, &rest[1..])?;
                if prune {
                    node.children.remove(i);
                }
                removed
            }
            Err(_) => false,
        }
    };
    if !removed {
        return Ok((false, false));
    }
    // Cleanup: a valueless node with no children disappears; with a
    // single child it merges into it.
    if node.value.is_none() {
        match node.children.len() {
            0 => return Ok((true, true)),
            1 => {
                let (edge, mut only) = node.children.pop().expect("length checked");
                let merged = pmaterialize(ctx, &mut only, false)?;
                node.prefix.push(edge);
                node.prefix.append(&mut merged.prefix);
                node.value = merged.value.take();
                node.children = std::mem::take(&mut merged.children);
            }
            _ => {}
        }
    }
    Ok((true, false))
}

/// A traversal step through dirty or persisted nodes.
enum Step<'n> {
    Dirty(&'n MutPNode),
    Persisted(PNode),
}

impl<'n> Step<'n> {
    fn prefix(&self) -> &[u8] {
        match self {
            Step::Dirty(node) => &node.prefix,
            Step::Persisted(node) => &node.prefix,
        }
    }

    fn value_cloned(&self) -> Option<Vec<u8>> {
        match self {
            Step::Dirty(node) => node.value.clone(),
            Step::Persisted(node) => node.value.clone(),
        }
    }

    fn child_count(&self) -> usize {
        match self {
            Step::Dirty(node) => node.children.len(),
            Step::Persisted(node) => node.children.len(),
        }
    }

    fn child_edge(&self, i: usize) -> u8 {
        match self {
            Step::Dirty(node) => node.children[i].0,
            Step::Persisted(node) => node.children[i].0,
        }
    }

    fn find_child(&self, edge: u8) -> std::result::Result<usize, usize> {
        match self {
            Step::Dirty(node) => node.child_index(edge),
            Step::Persisted(node) => node.children.binary_search_by_key(&edge, |(b, _)| *b),
        }
    }

    fn step_child(&self, log: &Log, structure_id: u64, i: usize) -> Result<Step<'n>> {
        match self {
            Step::Dirty(node) => step_into(log, structure_id, &node.children[i].1, false),
            Step::Persisted(node) => {
                Ok(Step::Persisted(load_node(log, structure_id, node.children[i].1, false)?.0))
            }
        }
    }
}

fn step_into<'n>(log: &Log, structure_id: u64, child: &'n PRef, root: bool) -> Result<Step<'n>> {
    Ok(match child {
        PRef::Node(node) => Step::Dirty(node),
        PRef::Addr(address) => Step::Persisted(load_node(log, structure_id, *address, root)?.0),
    })
}

/// Smallest stored key extending `prefix`, through dirty and persisted
/// nodes alike.
fn min_with_prefix_ref(
    log: &Log,
    structure_id: u64,
    root_ref: &PRef,
    prefix: &[u8],
) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
    let mut key = Vec::new();
    let mut pos = 0;
    let mut step = step_into(log, structure_id, root_ref, true)?;
    // Descend along the prefix.
    loop {
        let node_prefix = match &step {
            Step::Dirty(node) => node.prefix.clone(),
            Step::Persisted(node) => node.prefix.clone(),
        };
        let common = common_prefix(&node_prefix, &prefix[pos..]);
        key.extend_from_slice(&node_prefix);
        if pos + common == prefix.len() {
            break;
        }
        if common < node_prefix.len() {
            return Ok(None);
        }
        pos += common;
        let edge = prefix[pos];
        key.push(edge);
        pos += 1;
        step = match step {
            Step::Dirty(node) => match node.child_index(edge) {
                Ok(i) => step_into(log, structure_id, &node.children[i].1, false)?,
                Err(_) => return Ok(None),
            },
            Step::Persisted(node) => match node.child(edge) {
                Some(child) => Step::Persisted(load_node(log, structure_id, child, false)?.0),
                None => return Ok(None),
            },
        };
    }
    // Leftmost descent below the match point.
    loop {
        step = match step {
            Step::Dirty(node) => {
                if let Some(value) = &node.value {
                    return Ok(Some((key, value.clone())));
                }
                let Some((edge, child)) = node.children.first() else { return Ok(None) };
                key.push(*edge);
                let next = step_into(log, structure_id, child, false)?;
                match &next {
                    Step::Dirty(n) => key.extend_from_slice(&n.prefix),
                    Step::Persisted(n) => key.extend_from_slice(&n.prefix),
                }
                next
            }
            Step::Persisted(node) => {
                if let Some(value) = node.value {
                    return Ok(Some((key, value)));
                }
                let Some(&(edge, child)) = node.children.first() else { return Ok(None) };
                key.push(edge);
                let next = load_node(log, structure_id, child, false)?.0;
                key.extend_from_slice(&next.prefix);
                Step::Persisted(next)
            }
        };
    }
}

/// Read-only probe: does the subtree at `address` reference any record
/// inside the segment?
fn persisted_intersects(
    log: &Log,
    structure_id: u64,
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
    let node = load_node(log, structure_id, address, root)?.0;
    for (_, child) in &node.children {
        if persisted_intersects(log, structure_id, *child, false, seg_start, seg_end)? {
            return Ok(true);
        }
    }
    Ok(false)
}

/// Materializes every node whose record (or any descendant's record) lies
/// inside the segment, so the save rewrites them forward.
fn sweep_ref(
    ctx: &mut PCtx<'_>,
    child: &mut PRef,
    root: bool,
    seg_start: Address,
    seg_end: Address,
) -> Result<bool> {
    let mut any = false;
    if let PRef::Addr(address) = *child {
        if address < seg_start {
            return Ok(false);
        }
        if address >= seg_end
            && !persisted_intersects(ctx.log, ctx.structure_id, address, root, seg_start, seg_end)?
        {
            return Ok(false);
        }
        pmaterialize(ctx, child, root)?;
        any = true;
    }
    let PRef::Node(node) = child else { unreachable!() };
    for (_, c) in node.children.iter_mut() {
        if sweep_ref(ctx, c, false, seg_start, seg_end)? {
            any = true;
        }
    }
    Ok(any)
}

fn save_ref(
    guard: &mut WriteGuard<'_>,
    structure_id: u64,
    child: &mut PRef,
    root: bool,
    size: u64,
) -> Result<Address> {
    match child {
        PRef::Addr(address) => Ok(*address),
        PRef::Node(node) => {
            let mut encoded_children = Vec::with_capacity(node.children.len());
            for (edge, child) in node.children.iter_mut() {
                let address = save_ref(guard, structure_id, child, false, 0)?;
                encoded_children.push((*edge, address));
            }
            let page = PNode {
                prefix: node.prefix.clone(),
                value: node.value.clone(),
                children: encoded_children,
            };
            let mut data = Vec::new();
            if root {
                varint::write_u64(&mut data, size);
            }
            page.encode_into(&mut data);
            let type_id = if root { PATRICIA_ROOT } else { PATRICIA_NODE };
            let address = guard.write(type_id, structure_id, &data)?;
            *child = PRef::Addr(address);
            Ok(address)
        }
    }
}

/// A mutable Patricia tree over an immutable snapshot.
pub struct PatriciaTreeMutable {
    log: Arc<Log>,
    structure_id: u64,
    dups: bool,
    root: PRef,
    size: u64,
    orig_root: Address,
    expired: ExpiredLoggableCollection,
}

impl PatriciaTreeMutable {
    /// Starts a mutation over `tree`.
    pub fn new(tree: &PatriciaTree) -> Self {
        let root = if tree.root_address == NULL_ADDRESS {
            PRef::Node(Box::new(MutPNode::shell()))
        } else {
            PRef::Addr(tree.root_address)
        };
        Self {
            log: Arc::clone(&tree.log),
            structure_id: tree.structure_id,
            dups: tree.dups,
            root,
            size: tree.size,
            orig_root: tree.root_address,
            expired: ExpiredLoggableCollection::default(),
        }
    }

    /// Whether this tree keeps multiple values per key.
    pub fn allows_duplicates(&self) -> bool {
        self.dups
    }

    /// Root address of the snapshot this mutation started from.
    pub fn orig_root_address(&self) -> Address {
        self.orig_root
    }

    fn ctx(&mut self) -> (PCtx<'_>, &mut PRef) {
        (
            PCtx { log: &self.log, structure_id: self.structure_id, expired: &mut self.expired },
            &mut self.root,
        )
    }

    fn get_stored(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let mut pos = 0;
        let mut step = step_into(&self.log, self.structure_id, &self.root, true)?;
        loop {
            let (prefix_len, matches) = match &step {
                Step::Dirty(node) => (node.prefix.len(), key[pos..].starts_with(&node.prefix)),
                Step::Persisted(node) => (node.prefix.len(), key[pos..].starts_with(&node.prefix)),
            };
            if !matches {
                return Ok(None);
            }
            pos += prefix_len;
            if pos == key.len() {
                return Ok(match step {
                    Step::Dirty(node) => node.value.clone(),
                    Step::Persisted(node) => node.value,
                });
            }
            let edge = key[pos];
            pos += 1;
            step = match step {
                Step::Dirty(node) => match node.child_index(edge) {
                    Ok(i) => step_into(&self.log, self.structure_id, &node.children[i].1, false)?,
                    Err(_) => return Ok(None),
                },
                Step::Persisted(node) => match node.child(edge) {
                    Some(child) => {
                        Step::Persisted(load_node(&self.log, self.structure_id, child, false)?.0)
                    }
                    None => return Ok(None),
                },
            };
        }
    }

    fn insert_stored(&mut self, key: &[u8], value: &[u8], overwrite: bool) -> Result<(bool, bool)> {
        let (mut ctx, root) = self.ctx();
        let (added, changed) = insert_ref(&mut ctx, root, true, key, value, overwrite)?;
        if added {
            self.size += 1;
        }
        Ok((added, changed))
    }

    fn delete_stored(&mut self, key: &[u8]) -> Result<bool> {
        let (mut ctx, root) = self.ctx();
        let (removed, prune) = delete_ref(&mut ctx, root, true, key)?;
        if prune {
            *root = PRef::Node(Box::new(MutPNode::shell()));
        }
        if removed {
            self.size -= 1;
        }
        Ok(removed)
    }

    fn min_with_prefix(&self, prefix: &[u8]) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
        min_with_prefix_ref(&self.log, self.structure_id, &self.root, prefix)
    }

    /// Leftmost stored pair of the subtree at `step`; `key` holds the
    /// accumulated bytes before the step's prefix.
    fn subtree_min_step(&self, step: Step<'_>, key: Vec<u8>) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
        let mut step = step;
        let mut key = key;
        loop {
            key.extend_from_slice(step.prefix());
            if let Some(value) = step.value_cloned() {
                return Ok(Some((key, value)));
            }
            if step.child_count() == 0 {
                return Ok(None);
            }
            key.push(step.child_edge(0));
            step = step.step_child(&self.log, self.structure_id, 0)?;
        }
    }

    /// Smallest stored key strictly greater than `after` within the
    /// subtree at `step`; `key` holds the accumulated bytes before the
    /// step's prefix, `pos` the matched length of `after`.
    fn successor_step(
        &self,
        step: Step<'_>,
        key: Vec<u8>,
        after: &[u8],
        pos: usize,
    ) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
        let prefix = step.prefix().to_vec();
        let rest = &after[pos..];
        let common = common_prefix(&prefix, rest);
        if common < prefix.len() {
            return if rest.len() <= common || prefix[common] > rest[common] {
                // The whole subtree sorts after the target.
                self.subtree_min_step(step, key)
            } else {
                Ok(None)
            };
        }
        let mut key = key;
        key.extend_from_slice(&prefix);
        let pos = pos + common;
        if pos == after.len() {
            // This node's key equals the target: its successor is the
            // leftmost descendant.
            if step.child_count() == 0 {
                return Ok(None);
            }
            let mut child_key = key;
            child_key.push(step.child_edge(0));
            let child = step.step_child(&self.log, self.structure_id, 0)?;
            return self.subtree_min_step(child, child_key);
        }
        let edge = after[pos];
        let (exact, from) = match step.find_child(edge) {
            Ok(i) => (Some(i), i + 1),
            Err(i) => (None, i),
        };
        if let Some(i) = exact {
            let mut child_key = key.clone();
            child_key.push(edge);
            let child = step.step_child(&self.log, self.structure_id, i)?;
            if let Some(hit) = self.successor_step(child, child_key, after, pos + 1)? {
                return Ok(Some(hit));
            }
        }
        for i in from..step.child_count() {
            let mut child_key = key.clone();
            child_key.push(step.child_edge(i));
            let child = step.step_child(&self.log, self.structure_id, i)?;
            if let Some(hit) = self.subtree_min_step(child, child_key)? {
                return Ok(Some(hit));
            }
        }
        Ok(None)
    }

    /// Smallest stored key strictly greater than `after`, with its value.
    fn stored_successor(&self, after: &[u8]) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
        let step = step_into(&self.log, self.structure_id, &self.root, true)?;
        self.successor_step(step, Vec::new(), after, 0)
    }
}

impl TreeMutable for PatriciaTreeMutable {
    fn structure_id(&self) -> u64 {
        self.structure_id
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

    fn first_pair(&self) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
        if !self.dups {
            return self.min_with_prefix(&[]);
        }
        let mut current = self.min_with_prefix(&[])?;
        loop {
            match current {
                Some((stored, _)) => match decode_dup_key(&stored) {
                    Some(pair) => return Ok(Some(pair)),
                    // Undecodable decorator keys are skipped.
                    None => current = self.stored_successor(&stored)?,
                },
                None => return Ok(None),
            }
        }
    }

    fn next_pair_after(&self, key: &[u8], value: &[u8]) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
        if !self.dups {
            // Keys are unique: the successor by key alone.
            return self.stored_successor(key);
        }
        let mut probe = encode_dup_key(key, value);
        loop {
            match self.stored_successor(&probe)? {
                Some((stored, _)) => match decode_dup_key(&stored) {
                    Some(pair) => return Ok(Some(pair)),
                    None => probe = stored,
                },
                None => return Ok(None),
            }
        }
    }

    fn put(&mut self, key: &[u8], value: &[u8]) -> Result<bool> {
        if self.dups {
            let (added, _) = self.insert_stored(&encode_dup_key(key, value), &[], false)?;
            Ok(added)
        } else {
            let (_, changed) = self.insert_stored(key, value, true)?;
            Ok(changed)
        }
    }

    fn add(&mut self, key: &[u8], value: &[u8]) -> Result<bool> {
        if self.dups {
            let (added, _) = self.insert_stored(&encode_dup_key(key, value), &[], false)?;
            Ok(added)
        } else {
            let (added, _) = self.insert_stored(key, value, false)?;
            Ok(added)
        }
    }

    // The radix insert path is already proportional to the key length, so
    // the rightmost precondition buys nothing here; `put_right` shares the
    // insert path.
    fn put_right(&mut self, key: &[u8], value: &[u8]) -> Result<()> {
        if self.dups {
            self.insert_stored(&encode_dup_key(key, value), &[], false)?;
        } else {
            self.insert_stored(key, value, false)?;
        }
        Ok(())
    }

    fn delete(&mut self, key: &[u8]) -> Result<bool> {
        if self.dups {
            let mut probe = key.to_vec();
            probe.push(0);
            let mut removed = false;
            while let Some((stored, _)) = self.min_with_prefix(&probe)? {
                if !self.delete_stored(&stored)? {
                    break;
                }
                removed = true;
            }
            Ok(removed)
        } else {
            self.delete_stored(key)
        }
    }

    fn delete_value(&mut self, key: &[u8], value: &[u8]) -> Result<bool> {
        if self.dups {
            self.delete_stored(&encode_dup_key(key, value))
        } else {
            if self.get_stored(key)?.as_deref() != Some(value) {
                return Ok(false);
            }
            self.delete_stored(key)
        }
    }

    fn save(&mut self, guard: &mut WriteGuard<'_>) -> Result<Address> {
        if let PRef::Addr(address) = self.root {
            return Ok(address);
        }
        save_ref(guard, self.structure_id, &mut self.root, true, self.size)
    }

    fn expired(&self) -> &ExpiredLoggableCollection {
        &self.expired
    }

    fn reclaim(&mut self, head: &Loggable, iter: &mut LogIterator<'_>) -> Result<bool> {
        let file_length_bound = self.log.file_length_bound();
        let segment = head.address - head.address % file_length_bound;
        let segment_end = segment + file_length_bound;

        let mut own_records = false;
        let mut current = Some(head.clone());
        while let Some(loggable) = current {
            if loggable.address >= segment_end {
                break;
            }
            if loggable.structure_id == self.structure_id {
                match loggable.type_id {
                    PATRICIA_NODE => own_records = true,
                    PATRICIA_ROOT => {
                        if loggable.address == self.orig_root {
                            // Our own root: the walk is complete.
                            own_records = true;
                            break;
                        }
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
        if !own_records {
            return Ok(false);
        }

        let (mut ctx, root) = self.ctx();
        sweep_ref(&mut ctx, root, true, segment, segment_end)
    }
}
