//! Write barriers keeping the tri-color invariant (no black object points
//! directly at a white one) while the mutator runs interleaved with the
//! incremental collector (§4.6 "Write barriers").

use crate::object::{Header, Table};
use std::ptr::NonNull;

/// Forward barrier: called whenever a black object is about to gain a
/// reference to `to`. If `to` is white, repaint it gray immediately and
/// queue it rather than letting the invariant break (§4.6 "the forward
/// barrier grays the target").
pub(crate) fn barrier_forward(from: &Header, to: Option<NonNull<Header>>, gray: &mut Vec<NonNull<Header>>) {
    if !from.is_black() {
        return;
    }
    let Some(to) = to else { return };
    // SAFETY: `to` is a live pointer into the same heap as `from`.
    let target = unsafe { to.as_ref() };
    if target.is_white() {
        target.mark_gray();
        gray.push(to);
    }
}

/// Backward barrier for tables: rather than graying every value stored
/// into a black table (tables are mutated far more often than most other
/// kinds), repaint the table itself back to gray and defer a full rescan
/// to the atomic phase (§4.6 "A backward variant exists for tables").
pub(crate) fn barrier_backward(table: NonNull<Table>, gray_again: &mut Vec<NonNull<Table>>) {
    // SAFETY: caller holds a live table pointer from this heap.
    let header = unsafe { table.cast::<Header>().as_ref() };
    if header.is_black() {
        header.mark_gray();
        gray_again.push(table);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::ObjectKind;

    #[test]
    fn forward_barrier_grays_white_target_only_when_source_is_black() {
        let from = Header::new(ObjectKind::Closure, 1);
        let mut to_obj = Header::new(ObjectKind::Str, 1);
        let to_ptr = NonNull::from(&mut to_obj);
        let mut gray = Vec::new();

        barrier_forward(&from, Some(to_ptr), &mut gray);
        assert!(gray.is_empty(), "non-black source must not trigger the barrier");

        from.mark_black();
        barrier_forward(&from, Some(to_ptr), &mut gray);
        assert_eq!(gray.len(), 1);
        assert!(to_obj.is_gray());
    }

    #[test]
    fn backward_barrier_regrays_black_table_and_queues_it() {
        let mut table = Table::new(1);
        table.header.mark_black();
        let ptr = NonNull::from(&mut table);
        let mut gray_again = Vec::new();

        barrier_backward(ptr, &mut gray_again);
        assert_eq!(gray_again.len(), 1);
        assert!(table.header.is_gray());
    }
}
