//! In-memory ledger store.
//!
//! Thread-safe via a single `RwLock`; every trait method runs atomically
//! under the write lock, which makes it strictly stronger than the
//! serializable transactions of the Postgres backend - the transient
//! duplicate sort orders that occur mid-shift are never visible outside a
//! method call. Suitable for tests and single-process deployments, not for
//! a multi-process fleet.

use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};

use async_trait::async_trait;

use vitrine_core::{Error as CoreError, ImageId, ModelId};

use crate::error::{MediaError, Result};
use crate::ledger::{plan, LedgerStore};
use crate::types::{Attachment, ImageRecord, ImageWithRenditions, RenditionRecord};

/// Internal ledger state protected by a single lock.
#[derive(Debug, Default)]
struct LedgerState {
    /// Per-model attachment sequences. Vecs are kept sorted by sort order.
    models: HashMap<ModelId, Vec<Attachment>>,
    /// Image rows by id.
    images: HashMap<ImageId, ImageRecord>,
    /// Rendition rows by parent image.
    renditions: HashMap<ImageId, Vec<RenditionRecord>>,
    /// Reverse index: which model owns an image.
    owners: HashMap<ImageId, ModelId>,
}

/// In-memory implementation of [`LedgerStore`].
#[derive(Debug, Default)]
pub struct InMemoryLedger {
    state: RwLock<LedgerState>,
}

/// Converts a lock poison error to a core internal error.
fn poison_err<T>(_: PoisonError<T>) -> MediaError {
    MediaError::Core(CoreError::internal("ledger lock poisoned"))
}

impl InMemoryLedger {
    /// Creates a new empty ledger.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the number of images across all models.
    ///
    /// # Errors
    ///
    /// Returns an error if the internal lock is poisoned.
    pub fn image_count(&self) -> Result<usize> {
        Ok(self.state.read().map_err(poison_err)?.images.len())
    }
}

#[async_trait]
impl LedgerStore for InMemoryLedger {
    async fn insert_original(&self, model_id: &ModelId, image: ImageRecord) -> Result<u32> {
        let mut state = self.state.write().map_err(poison_err)?;

        if state.owners.contains_key(&image.id) {
            return Err(MediaError::Core(CoreError::PreconditionFailed {
                message: format!("image {} is already attached to a model", image.id),
            }));
        }

        let image_id = image.id;
        let attachments = state.models.entry(model_id.clone()).or_default();
        let next = attachments
            .iter()
            .map(|a| a.sort_order)
            .max()
            .unwrap_or(0)
            + 1;
        attachments.push(Attachment {
            image_id,
            sort_order: next,
        });

        debug_assert!(plan::is_dense(
            &attachments.iter().map(|a| a.sort_order).collect::<Vec<_>>()
        ));

        state.images.insert(image_id, image);
        state.owners.insert(image_id, model_id.clone());
        drop(state);

        Ok(next)
    }

    async fn insert_renditions(
        &self,
        image_id: ImageId,
        renditions: Vec<RenditionRecord>,
    ) -> Result<usize> {
        let mut state = self.state.write().map_err(poison_err)?;

        if !state.owners.contains_key(&image_id) {
            return Err(MediaError::ImageNotFound { image_id });
        }

        let existing = state.renditions.entry(image_id).or_default();
        let mut inserted = 0;
        for rendition in renditions {
            // Insert-if-absent on the (mime, width) cell: retried jobs
            // must not duplicate rows.
            let duplicate = existing
                .iter()
                .any(|r| r.mime == rendition.mime && r.width == rendition.width);
            if !duplicate {
                existing.push(rendition);
                inserted += 1;
            }
        }
        existing.sort_by_key(|r| (r.mime, r.width));
        drop(state);

        Ok(inserted)
    }

    async fn reorder(
        &self,
        model_id: &ModelId,
        image_id: ImageId,
        new_sort_order: u32,
    ) -> Result<()> {
        let mut state = self.state.write().map_err(poison_err)?;

        let attachments = state
            .models
            .get_mut(model_id)
            .ok_or(MediaError::ImageNotFound { image_id })?;

        let current = attachments
            .iter()
            .find(|a| a.image_id == image_id)
            .map(|a| a.sort_order)
            .ok_or(MediaError::ImageNotFound { image_id })?;

        let len = attachments.len() as u32;
        if new_sort_order < 1 || new_sort_order > len {
            return Err(MediaError::OrderOutOfRange {
                requested: new_sort_order,
                len,
            });
        }

        if let Some(window) = plan::reorder_window(current, new_sort_order) {
            for attachment in attachments.iter_mut() {
                if attachment.image_id == image_id {
                    continue;
                }
                if window.contains(attachment.sort_order) {
                    attachment.sort_order = attachment
                        .sort_order
                        .checked_add_signed(window.delta)
                        .expect("shift within 1..=N cannot wrap");
                }
            }
            let moved = attachments
                .iter_mut()
                .find(|a| a.image_id == image_id)
                .expect("presence checked above");
            moved.sort_order = new_sort_order;
            attachments.sort_by_key(|a| a.sort_order);
        }

        debug_assert!(plan::is_dense(
            &attachments.iter().map(|a| a.sort_order).collect::<Vec<_>>()
        ));
        drop(state);

        Ok(())
    }

    async fn delete_image(&self, model_id: &ModelId, image_id: ImageId) -> Result<ImageRecord> {
        let mut state = self.state.write().map_err(poison_err)?;

        let attachments = state
            .models
            .get_mut(model_id)
            .ok_or(MediaError::ImageNotFound { image_id })?;

        let position = attachments
            .iter()
            .position(|a| a.image_id == image_id)
            .ok_or(MediaError::ImageNotFound { image_id })?;

        let removed = attachments.remove(position);
        for attachment in attachments.iter_mut() {
            if attachment.sort_order > removed.sort_order {
                attachment.sort_order -= 1;
            }
        }

        debug_assert!(plan::is_dense(
            &attachments.iter().map(|a| a.sort_order).collect::<Vec<_>>()
        ));

        // Cascade: image row, renditions, ownership.
        let record = state
            .images
            .remove(&image_id)
            .ok_or_else(|| MediaError::Core(CoreError::internal("attachment without image row")))?;
        state.renditions.remove(&image_id);
        state.owners.remove(&image_id);
        drop(state);

        Ok(record)
    }

    async fn attachments(&self, model_id: &ModelId) -> Result<Vec<Attachment>> {
        let state = self.state.read().map_err(poison_err)?;
        let mut attachments = state.models.get(model_id).cloned().unwrap_or_default();
        attachments.sort_by_key(|a| a.sort_order);
        Ok(attachments)
    }

    async fn image(&self, image_id: ImageId) -> Result<Option<ImageRecord>> {
        let state = self.state.read().map_err(poison_err)?;
        Ok(state.images.get(&image_id).cloned())
    }

    async fn renditions(&self, image_id: ImageId) -> Result<Vec<RenditionRecord>> {
        let state = self.state.read().map_err(poison_err)?;
        Ok(state.renditions.get(&image_id).cloned().unwrap_or_default())
    }

    async fn model_images(&self, model_id: &ModelId) -> Result<Vec<ImageWithRenditions>> {
        let state = self.state.read().map_err(poison_err)?;

        let mut attachments = state.models.get(model_id).cloned().unwrap_or_default();
        attachments.sort_by_key(|a| a.sort_order);

        attachments
            .into_iter()
            .map(|attachment| {
                let image = state
                    .images
                    .get(&attachment.image_id)
                    .cloned()
                    .ok_or_else(|| {
                        MediaError::Core(CoreError::internal("attachment without image row"))
                    })?;
                let renditions = state
                    .renditions
                    .get(&attachment.image_id)
                    .cloned()
                    .unwrap_or_default();
                Ok(ImageWithRenditions {
                    image,
                    sort_order: attachment.sort_order,
                    renditions,
                })
            })
            .collect()
    }

    async fn all_images(&self) -> Result<Vec<(ModelId, ImageRecord)>> {
        let state = self.state.read().map_err(poison_err)?;
        Ok(state
            .owners
            .iter()
            .filter_map(|(image_id, model_id)| {
                state
                    .images
                    .get(image_id)
                    .map(|record| (model_id.clone(), record.clone()))
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use vitrine_core::RenditionId;

    use crate::types::{ImageMime, RenditionMime};

    fn model(id: &str) -> ModelId {
        ModelId::new(id).unwrap()
    }

    fn test_image() -> ImageRecord {
        ImageRecord {
            id: ImageId::generate(),
            original_filename: "facade.jpeg".into(),
            mime: ImageMime::Jpeg,
            size: 1024,
            width: 1600,
            height: 900,
            created_at: Utc::now(),
        }
    }

    fn test_rendition(image_id: ImageId, mime: RenditionMime, width: u32) -> RenditionRecord {
        RenditionRecord {
            id: RenditionId::generate(),
            image_id,
            mime,
            size: 128,
            width,
            height: width * 9 / 16,
            created_at: Utc::now(),
        }
    }

    async fn orders(ledger: &InMemoryLedger, model_id: &ModelId) -> Vec<u32> {
        ledger
            .attachments(model_id)
            .await
            .unwrap()
            .iter()
            .map(|a| a.sort_order)
            .collect()
    }

    #[tokio::test]
    async fn inserts_assign_dense_sequence() {
        let ledger = InMemoryLedger::new();
        let m = model("m1");

        assert_eq!(ledger.insert_original(&m, test_image()).await.unwrap(), 1);
        assert_eq!(ledger.insert_original(&m, test_image()).await.unwrap(), 2);
        assert_eq!(ledger.insert_original(&m, test_image()).await.unwrap(), 3);
        assert_eq!(orders(&ledger, &m).await, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn image_cannot_be_attached_twice() {
        let ledger = InMemoryLedger::new();
        let image = test_image();

        ledger
            .insert_original(&model("m1"), image.clone())
            .await
            .unwrap();
        let err = ledger
            .insert_original(&model("m2"), image)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            MediaError::Core(CoreError::PreconditionFailed { .. })
        ));
    }

    #[tokio::test]
    async fn reorder_to_same_position_is_noop() {
        let ledger = InMemoryLedger::new();
        let m = model("m1");
        let image = test_image();
        let id = image.id;

        ledger.insert_original(&m, image).await.unwrap();
        ledger.insert_original(&m, test_image()).await.unwrap();

        ledger.reorder(&m, id, 1).await.unwrap();
        assert_eq!(orders(&ledger, &m).await, vec![1, 2]);
        let first = ledger.attachments(&m).await.unwrap()[0];
        assert_eq!(first.image_id, id);
    }

    #[tokio::test]
    async fn forward_reorder_shifts_window_down() {
        let ledger = InMemoryLedger::new();
        let m = model("m1");

        let mut ids = Vec::new();
        for _ in 0..5 {
            let image = test_image();
            ids.push(image.id);
            ledger.insert_original(&m, image).await.unwrap();
        }

        // Move position 2 to position 4.
        ledger.reorder(&m, ids[1], 4).await.unwrap();

        let attachments = ledger.attachments(&m).await.unwrap();
        let by_order: Vec<ImageId> = attachments.iter().map(|a| a.image_id).collect();
        // Original 1,2,3,4,5 -> 1,3,4,2,5
        assert_eq!(by_order, vec![ids[0], ids[2], ids[3], ids[1], ids[4]]);
        assert_eq!(orders(&ledger, &m).await, vec![1, 2, 3, 4, 5]);
    }

    #[tokio::test]
    async fn backward_reorder_shifts_window_up() {
        let ledger = InMemoryLedger::new();
        let m = model("m1");

        let mut ids = Vec::new();
        for _ in 0..4 {
            let image = test_image();
            ids.push(image.id);
            ledger.insert_original(&m, image).await.unwrap();
        }

        // Move position 4 to position 2.
        ledger.reorder(&m, ids[3], 2).await.unwrap();

        let by_order: Vec<ImageId> = ledger
            .attachments(&m)
            .await
            .unwrap()
            .iter()
            .map(|a| a.image_id)
            .collect();
        assert_eq!(by_order, vec![ids[0], ids[3], ids[1], ids[2]]);
    }

    #[tokio::test]
    async fn reorder_validates_bounds() {
        let ledger = InMemoryLedger::new();
        let m = model("m1");
        let image = test_image();
        let id = image.id;
        ledger.insert_original(&m, image).await.unwrap();

        for bad in [0, 2, 100_000] {
            let err = ledger.reorder(&m, id, bad).await.unwrap_err();
            assert!(matches!(err, MediaError::OrderOutOfRange { .. }), "{bad}");
        }
    }

    #[tokio::test]
    async fn reorder_unknown_image_fails() {
        let ledger = InMemoryLedger::new();
        let m = model("m1");
        ledger.insert_original(&m, test_image()).await.unwrap();

        let err = ledger.reorder(&m, ImageId::generate(), 1).await.unwrap_err();
        assert!(matches!(err, MediaError::ImageNotFound { .. }));
    }

    #[tokio::test]
    async fn delete_closes_the_gap() {
        let ledger = InMemoryLedger::new();
        let m = model("m1");

        let mut ids = Vec::new();
        for _ in 0..4 {
            let image = test_image();
            ids.push(image.id);
            ledger.insert_original(&m, image).await.unwrap();
        }

        // Delete position 2; the remainder closes to 1..=3 in order.
        ledger.delete_image(&m, ids[1]).await.unwrap();

        let by_order: Vec<ImageId> = ledger
            .attachments(&m)
            .await
            .unwrap()
            .iter()
            .map(|a| a.image_id)
            .collect();
        assert_eq!(by_order, vec![ids[0], ids[2], ids[3]]);
        assert_eq!(orders(&ledger, &m).await, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn delete_cascades_to_renditions() {
        let ledger = InMemoryLedger::new();
        let m = model("m1");
        let image = test_image();
        let id = image.id;

        ledger.insert_original(&m, image).await.unwrap();
        ledger
            .insert_renditions(id, vec![test_rendition(id, RenditionMime::Avif, 400)])
            .await
            .unwrap();

        ledger.delete_image(&m, id).await.unwrap();
        assert!(ledger.image(id).await.unwrap().is_none());
        assert!(ledger.renditions(id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn rendition_insert_is_idempotent_per_cell() {
        let ledger = InMemoryLedger::new();
        let m = model("m1");
        let image = test_image();
        let id = image.id;
        ledger.insert_original(&m, image).await.unwrap();

        let first = ledger
            .insert_renditions(
                id,
                vec![
                    test_rendition(id, RenditionMime::Avif, 400),
                    test_rendition(id, RenditionMime::Webp, 400),
                ],
            )
            .await
            .unwrap();
        assert_eq!(first, 2);

        // Redelivery: same cells, fresh row ids - nothing inserted.
        let second = ledger
            .insert_renditions(
                id,
                vec![
                    test_rendition(id, RenditionMime::Avif, 400),
                    test_rendition(id, RenditionMime::Webp, 400),
                ],
            )
            .await
            .unwrap();
        assert_eq!(second, 0);
        assert_eq!(ledger.renditions(id).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn renditions_for_deleted_image_are_rejected() {
        let ledger = InMemoryLedger::new();
        let m = model("m1");
        let image = test_image();
        let id = image.id;

        ledger.insert_original(&m, image).await.unwrap();
        ledger.delete_image(&m, id).await.unwrap();

        let err = ledger
            .insert_renditions(id, vec![test_rendition(id, RenditionMime::Avif, 400)])
            .await
            .unwrap_err();
        assert!(matches!(err, MediaError::ImageNotFound { .. }));
    }

    #[tokio::test]
    async fn model_images_projection_is_ordered_with_renditions() {
        let ledger = InMemoryLedger::new();
        let m = model("m1");

        let a = test_image();
        let b = test_image();
        let (a_id, b_id) = (a.id, b.id);
        ledger.insert_original(&m, a).await.unwrap();
        ledger.insert_original(&m, b).await.unwrap();

        ledger
            .insert_renditions(
                a_id,
                vec![
                    test_rendition(a_id, RenditionMime::Webp, 800),
                    test_rendition(a_id, RenditionMime::Avif, 400),
                ],
            )
            .await
            .unwrap();

        let projection = ledger.model_images(&m).await.unwrap();
        assert_eq!(projection.len(), 2);
        assert_eq!(projection[0].image.id, a_id);
        assert_eq!(projection[0].sort_order, 1);
        // Renditions sorted by (mime, width): avif before webp.
        assert_eq!(projection[0].renditions[0].mime, RenditionMime::Avif);
        assert_eq!(projection[1].image.id, b_id);
        // No renditions yet - readers fall back to the original.
        assert!(projection[1].renditions.is_empty());
    }

    #[tokio::test]
    async fn models_are_independent() {
        let ledger = InMemoryLedger::new();
        let m1 = model("m1");
        let m2 = model("m2");

        ledger.insert_original(&m1, test_image()).await.unwrap();
        let b = test_image();
        let b_id = b.id;
        ledger.insert_original(&m2, b).await.unwrap();
        ledger.insert_original(&m2, test_image()).await.unwrap();

        ledger.delete_image(&m2, b_id).await.unwrap();
        assert_eq!(orders(&ledger, &m1).await, vec![1]);
        assert_eq!(orders(&ledger, &m2).await, vec![1]);
    }
}
