//! Segment reclaim driver.
//!
//! Reclaim copies the still-live records of an old segment forward into
//! the tail of the log so the segment can be dropped. The driver walks a
//! candidate segment's loggables in address order and hands the first
//! record of the owning tree to that tree's [`TreeMutable::reclaim`],
//! which continues the walk: null and hash records are skipped, foreign
//! roots are ignored, and the tree's own root record terminates it.
//!
//! After the walk the caller saves the mutable tree, commits the new root
//! and may then remove the segment with [`Log::remove_file`].

use crate::error::Result;
use crate::log::loggable::NULL_TYPE;
use crate::log::Log;
use crate::tree::TreeMutable;

/// Walks the segment at `segment_address` and reclaims every record owned
/// by `tree`.
///
/// Returns whether any record was rewritten; when `false`, the segment
/// held nothing live for this tree and can be dropped as soon as no other
/// structure owns records in it.
///
/// # Errors
///
/// Propagates read errors from the walk and from the tree's rebuilds.
pub fn reclaim_segment(tree: &mut dyn TreeMutable, log: &Log, segment_address: u64) -> Result<bool> {
    debug_assert_eq!(segment_address % log.file_length_bound(), 0);
    let mut iter = log.iterator(segment_address);
    let segment_end = segment_address + log.file_length_bound();

    // Find the first record of this structure inside the segment; the
    // tree continues the walk from there.
    loop {
        let Some(loggable) = iter.next() else { return Ok(false) };
        let loggable = loggable?;
        if loggable.address >= segment_end {
            return Ok(false);
        }
        if loggable.type_id == NULL_TYPE {
            continue;
        }
        if loggable.structure_id == tree.structure_id() {
            return tree.reclaim(&loggable, &mut iter);
        }
    }
}
