//! The ordered collection of known segments.
//!
//! Modeled as an immutable snapshot plus a copy-on-write builder. Readers
//! hold a snapshot for the duration of a traversal; the writer edits a
//! builder inside its write window and publishes the sealed result with
//! the new high address.

use std::sync::Arc;

/// Immutable snapshot of segment addresses, sorted ascending.
///
/// Invariant: addresses are strictly increasing multiples of the
/// configured file length bound (validated by the log on open and on
/// segment creation).
#[derive(Debug, Clone, Default)]
pub struct BlockSet {
    blocks: Arc<Vec<u64>>,
}

impl BlockSet {
    /// Creates an empty snapshot.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Creates a snapshot from sorted addresses.
    pub(crate) fn from_sorted(blocks: Vec<u64>) -> Self {
        debug_assert!(blocks.windows(2).all(|w| w[0] < w[1]));
        Self { blocks: Arc::new(blocks) }
    }

    /// Number of known segments.
    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    /// Whether the log has no segments.
    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    /// All segment addresses, ascending.
    pub fn addresses(&self) -> &[u64] {
        &self.blocks
    }

    /// Address of the newest (tail) segment.
    pub fn last(&self) -> Option<u64> {
        self.blocks.last().copied()
    }

    /// Address of the oldest segment.
    pub fn first(&self) -> Option<u64> {
        self.blocks.first().copied()
    }

    /// Whether the segment at `address` is known.
    pub fn contains(&self, address: u64) -> bool {
        self.blocks.binary_search(&address).is_ok()
    }

    /// Starts a copy-on-write edit of this snapshot.
    pub fn builder(&self) -> BlockSetBuilder {
        BlockSetBuilder { blocks: self.blocks.as_ref().clone() }
    }
}

/// Mutable builder for a [`BlockSet`].
#[derive(Debug, Clone, Default)]
pub struct BlockSetBuilder {
    blocks: Vec<u64>,
}

impl BlockSetBuilder {
    /// Adds a segment address; ignored if already present.
    pub fn add(&mut self, address: u64) {
        if let Err(pos) = self.blocks.binary_search(&address) {
            self.blocks.insert(pos, address);
        }
    }

    /// Removes a segment address; ignored if absent.
    pub fn remove(&mut self, address: u64) {
        if let Ok(pos) = self.blocks.binary_search(&address) {
            self.blocks.remove(pos);
        }
    }

    /// Address of the newest segment under construction.
    pub fn last(&self) -> Option<u64> {
        self.blocks.last().copied()
    }

    /// Seals the builder into an immutable snapshot.
    pub fn seal(self) -> BlockSet {
        BlockSet::from_sorted(self.blocks)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_round_trip() {
        let empty = BlockSet::empty();
        assert!(empty.is_empty());

        let mut builder = empty.builder();
        builder.add(0x200000);
        builder.add(0);
        builder.add(0x100000);
        builder.add(0x100000); // duplicate ignored

        let set = builder.seal();
        assert_eq!(set.addresses(), &[0, 0x100000, 0x200000]);
        assert_eq!(set.first(), Some(0));
        assert_eq!(set.last(), Some(0x200000));
        assert!(set.contains(0x100000));
        assert!(!set.contains(0x300000));
    }

    #[test]
    fn test_copy_on_write_isolation() {
        let mut builder = BlockSet::empty().builder();
        builder.add(0);
        let snapshot = builder.clone().seal();

        builder.remove(0);
        builder.add(0x100000);
        let edited = builder.seal();

        assert_eq!(snapshot.addresses(), &[0]);
        assert_eq!(edited.addresses(), &[0x100000]);
    }
}
