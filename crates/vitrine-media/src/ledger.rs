//! The sort-order ledger: per-model dense attachment sequences.
//!
//! This module defines:
//!
//! - [`LedgerStore`]: the transactional contract every relational backend
//!   implements
//! - [`plan`]: pure shift-window planning shared by all backends
//!
//! ## The dense-sequence invariant
//!
//! For every model, the `sort_order` values of its attachments equal
//! `{1, ..., N}` where `N` is the attachment count - no gaps, no
//! duplicates. The invariant holds after every committed operation; it is
//! maintained actively by the operations below, not by a passive
//! constraint:
//!
//! - **insert**: the upload coordinator appends at `max + 1` while holding
//!   the model's distributed lock (the read-max-then-insert race cannot be
//!   closed by a transaction alone)
//! - **reorder**: shift the window between old and new position by one,
//!   then place the moved attachment
//! - **delete**: remove the attachment, then close the gap by decrementing
//!   every position above it
//!
//! Mid-transaction the shifts briefly duplicate positions, which is why the
//! Postgres backend defers its uniqueness check to commit.

use async_trait::async_trait;

use vitrine_core::{ImageId, ModelId};

use crate::error::Result;
use crate::types::{Attachment, ImageRecord, ImageWithRenditions, RenditionRecord};

/// Transactional store for images, attachments, and renditions.
///
/// Every method is one transaction; implementations guarantee the dense-
/// sequence invariant holds at commit. Backends: [`InMemoryLedger`] for
/// tests and single-process use, `PgLedger` (feature `postgres`) for
/// production.
///
/// [`InMemoryLedger`]: crate::store::memory::InMemoryLedger
#[async_trait]
pub trait LedgerStore: Send + Sync {
    /// Inserts an image and its attachment at the next free slot.
    ///
    /// Reads the model's current maximum sort order and appends at
    /// `max + 1` (or `1` for the first image). The caller must hold the
    /// model's ordering lock.
    ///
    /// Returns the assigned sort order.
    ///
    /// # Errors
    ///
    /// Fails if the image is already attached to a model, or on a storage
    /// failure.
    async fn insert_original(&self, model_id: &ModelId, image: ImageRecord) -> Result<u32>;

    /// Inserts rendition rows for an image, skipping cells that already
    /// exist.
    ///
    /// Renditions are keyed by `(image_id, mime, width)`, which makes this
    /// safe under at-least-once job delivery: a redelivered optimization
    /// job re-inserts nothing.
    ///
    /// Returns the number of rows actually inserted.
    ///
    /// # Errors
    ///
    /// Fails with [`MediaError::ImageNotFound`] if the parent image row no
    /// longer exists (deleted while the job was in flight).
    ///
    /// [`MediaError::ImageNotFound`]: crate::error::MediaError::ImageNotFound
    async fn insert_renditions(
        &self,
        image_id: ImageId,
        renditions: Vec<RenditionRecord>,
    ) -> Result<usize>;

    /// Moves an image to a new position within its model's sequence.
    ///
    /// No-op when the image is already at `new_sort_order`. Otherwise
    /// shifts the affected window by one and places the moved image,
    /// preserving density.
    ///
    /// # Errors
    ///
    /// - [`MediaError::ImageNotFound`] if the image is not attached to the
    ///   model
    /// - [`MediaError::OrderOutOfRange`] unless `1 ≤ new_sort_order ≤ N`
    /// - [`MediaError::TransactionConflict`] if a concurrent mutation
    ///   aborted the transaction (retry the whole operation)
    ///
    /// [`MediaError::ImageNotFound`]: crate::error::MediaError::ImageNotFound
    /// [`MediaError::OrderOutOfRange`]: crate::error::MediaError::OrderOutOfRange
    /// [`MediaError::TransactionConflict`]: crate::error::MediaError::TransactionConflict
    async fn reorder(
        &self,
        model_id: &ModelId,
        image_id: ImageId,
        new_sort_order: u32,
    ) -> Result<()>;

    /// Deletes an image: its attachment, the image row, and all renditions
    /// (cascade), then closes the gap in the model's sequence.
    ///
    /// Returns the deleted image record so callers can clean up blobs.
    ///
    /// # Errors
    ///
    /// - [`MediaError::ImageNotFound`] if the image is not attached to the
    ///   model
    /// - [`MediaError::TransactionConflict`] on concurrent mutation
    ///
    /// [`MediaError::ImageNotFound`]: crate::error::MediaError::ImageNotFound
    /// [`MediaError::TransactionConflict`]: crate::error::MediaError::TransactionConflict
    async fn delete_image(&self, model_id: &ModelId, image_id: ImageId) -> Result<ImageRecord>;

    /// Returns the model's attachments ordered by sort order.
    async fn attachments(&self, model_id: &ModelId) -> Result<Vec<Attachment>>;

    /// Returns an image record, if it exists.
    async fn image(&self, image_id: ImageId) -> Result<Option<ImageRecord>>;

    /// Returns an image's renditions ordered by (mime, width).
    async fn renditions(&self, image_id: ImageId) -> Result<Vec<RenditionRecord>>;

    /// Returns the model's full ordered projection: images with renditions.
    async fn model_images(&self, model_id: &ModelId) -> Result<Vec<ImageWithRenditions>>;

    /// Returns every image across all models, with its owning model.
    ///
    /// Used by the reconciler; not a hot path.
    async fn all_images(&self) -> Result<Vec<(ModelId, ImageRecord)>>;
}

/// Pure planning for the shift-the-window-then-place algorithm.
///
/// Both ledger backends apply the same plan: the in-memory store over its
/// attachment vec, the Postgres store as a ranged `UPDATE`. Keeping the
/// window arithmetic here means the tricky part is tested once, without a
/// store.
pub mod plan {
    /// An inclusive window of sort orders to shift by `delta`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ShiftWindow {
        /// Lowest affected sort order (inclusive).
        pub lo: u32,
        /// Highest affected sort order (inclusive).
        pub hi: u32,
        /// Shift to apply: `-1` for forward moves, `+1` for backward moves.
        pub delta: i32,
    }

    impl ShiftWindow {
        /// Returns whether `sort_order` falls inside the window.
        #[must_use]
        pub const fn contains(&self, sort_order: u32) -> bool {
            self.lo <= sort_order && sort_order <= self.hi
        }
    }

    /// Plans the shifts for moving an attachment from `current` to `new`.
    ///
    /// Returns `None` when the move is a no-op. Otherwise every attachment
    /// inside the returned window shifts by `delta`, after which the moved
    /// attachment is placed at `new`:
    ///
    /// - forward (`new > current`): `(current, new]` shifts down by one
    /// - backward (`new < current`): `[new, current)` shifts up by one
    #[must_use]
    pub const fn reorder_window(current: u32, new: u32) -> Option<ShiftWindow> {
        if new == current {
            None
        } else if new > current {
            Some(ShiftWindow {
                lo: current + 1,
                hi: new,
                delta: -1,
            })
        } else {
            Some(ShiftWindow {
                lo: new,
                hi: current - 1,
                delta: 1,
            })
        }
    }

    /// Checks that `orders` is exactly the dense sequence `1..=len`.
    ///
    /// Test and debug-assertion helper; `orders` need not be sorted.
    #[must_use]
    pub fn is_dense(orders: &[u32]) -> bool {
        let mut sorted: Vec<u32> = orders.to_vec();
        sorted.sort_unstable();
        sorted
            .iter()
            .enumerate()
            .all(|(i, &order)| order == i as u32 + 1)
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn same_position_is_noop() {
            assert_eq!(reorder_window(3, 3), None);
        }

        #[test]
        fn forward_move_shifts_between_down() {
            // Moving 2 -> 4 in a 5-item sequence: 3 and 4 shift down.
            let window = reorder_window(2, 4).unwrap();
            assert_eq!(window, ShiftWindow { lo: 3, hi: 4, delta: -1 });
            assert!(!window.contains(2));
            assert!(window.contains(3));
            assert!(window.contains(4));
            assert!(!window.contains(5));
        }

        #[test]
        fn backward_move_shifts_between_up() {
            // Moving 4 -> 2: 2 and 3 shift up.
            let window = reorder_window(4, 2).unwrap();
            assert_eq!(window, ShiftWindow { lo: 2, hi: 3, delta: 1 });
            assert!(window.contains(2));
            assert!(window.contains(3));
            assert!(!window.contains(4));
        }

        #[test]
        fn adjacent_swap_windows() {
            assert_eq!(
                reorder_window(1, 2),
                Some(ShiftWindow { lo: 2, hi: 2, delta: -1 })
            );
            assert_eq!(
                reorder_window(2, 1),
                Some(ShiftWindow { lo: 1, hi: 1, delta: 1 })
            );
        }

        #[test]
        fn applying_a_window_preserves_density_and_relative_order() {
            // Simulate a full apply over a 5-item sequence for every
            // (current, new) pair, tracking items by identity.
            for current in 1..=5u32 {
                for new in 1..=5u32 {
                    // (item label, sort order); item N starts at order N.
                    let mut items: Vec<(u32, u32)> = (1..=5).map(|i| (i, i)).collect();
                    if let Some(window) = reorder_window(current, new) {
                        for (label, order) in &mut items {
                            if *label == current {
                                continue;
                            }
                            if window.contains(*order) {
                                *order = order.checked_add_signed(window.delta).unwrap();
                            }
                        }
                        items[current as usize - 1].1 = new;
                    }

                    let orders: Vec<u32> = items.iter().map(|(_, o)| *o).collect();
                    assert!(is_dense(&orders), "dense violated for {current} -> {new}: {items:?}");

                    // Moved item lands at `new`; the others keep relative order.
                    assert_eq!(items[current as usize - 1].1, new);
                    let mut rest: Vec<(u32, u32)> = items
                        .iter()
                        .copied()
                        .filter(|(label, _)| *label != current)
                        .collect();
                    rest.sort_by_key(|(_, order)| *order);
                    let labels: Vec<u32> = rest.iter().map(|(label, _)| *label).collect();
                    let mut expected: Vec<u32> = (1..=5).filter(|l| *l != current).collect();
                    expected.sort_unstable();
                    assert_eq!(labels, expected, "relative order broken for {current} -> {new}");
                }
            }
        }

        #[test]
        fn is_dense_detects_gaps_and_duplicates() {
            assert!(is_dense(&[1, 2, 3]));
            assert!(is_dense(&[3, 1, 2]));
            assert!(is_dense(&[]));
            assert!(!is_dense(&[1, 3, 4]));
            assert!(!is_dense(&[1, 2, 2]));
            assert!(!is_dense(&[0, 1, 2]));
        }
    }
}
