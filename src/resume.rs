use std::ops::RangeInclusive;

use tracing::info;

use crate::store::ParcelStore;
use crate::{Error, Result};

/// Where the previous scans left off.
///
/// Prefers the committed checkpoint, then the highest stored id (databases written before
/// checkpoints existed), then `fallback`.
pub async fn checkpoint(store: &ParcelStore, fallback: Option<i64>) -> Result<Option<i64>> {
    if let Some(last) = store.checkpoint().await? {
        return Ok(Some(last));
    }
    Ok(store.max_id().await?.or(fallback))
}

/// First id that still needs processing: `max(start_id, checkpoint + 1)`.
pub fn resume_point(start_id: i64, checkpoint: Option<i64>) -> i64 {
    checkpoint.map_or(start_id, |c| start_id.max(c.saturating_add(1)))
}

/// Ids left to scan in `start_id..=end_id`, or `None` when earlier runs already covered it all.
pub async fn remaining_range(
    store: &ParcelStore,
    start_id: i64,
    end_id: i64,
    fallback: Option<i64>,
) -> Result<Option<IdRange>> {
    if start_id > end_id {
        return Err(Error::Config(format!(
            "start_id {start_id} is past end_id {end_id}"
        )));
    }

    let checkpoint = checkpoint(store, fallback).await?;
    let start = resume_point(start_id, checkpoint);
    // `resume_point` saturates, so a checkpoint at `i64::MAX` still lands on `end_id`.
    if start > end_id || checkpoint >= Some(end_id) {
        info!(?checkpoint, end_id, "range already processed, nothing to do");
        return Ok(None);
    }
    if start > start_id {
        info!(?checkpoint, "resuming from id {start}");
    }
    Ok(Some(IdRange::new(start, end_id)))
}

/// Lazy, finite sequence of ids; once drained it stays drained.
#[derive(Debug, Clone)]
pub struct IdRange {
    ids: RangeInclusive<i64>,
}

impl IdRange {
    pub fn new(start: i64, end: i64) -> Self {
        Self { ids: start..=end }
    }

    pub fn start(&self) -> i64 {
        *self.ids.start()
    }

    pub fn end(&self) -> i64 {
        *self.ids.end()
    }
}

impl Iterator for IdRange {
    type Item = i64;

    fn next(&mut self) -> Option<i64> {
        self.ids.next()
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.ids.size_hint()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parse::Parcel;

    async fn temp_store() -> (tempfile::TempDir, ParcelStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = ParcelStore::open(dir.path().join("scan.db")).await.unwrap();
        (dir, store)
    }

    #[test]
    fn test_resume_point() {
        assert_eq!(resume_point(100, None), 100);
        assert_eq!(resume_point(100, Some(50)), 100);
        assert_eq!(resume_point(100, Some(104)), 105);
        assert_eq!(resume_point(0, Some(i64::MAX)), i64::MAX);
    }

    #[test]
    fn test_id_range_is_inclusive_and_not_restartable() {
        let mut range = IdRange::new(100, 103);
        assert_eq!(range.start(), 100);
        assert_eq!(range.end(), 103);
        assert_eq!(range.by_ref().collect::<Vec<_>>(), vec![100, 101, 102, 103]);
        assert_eq!(range.next(), None);
    }

    #[tokio::test]
    async fn test_fresh_store_uses_start() {
        let (_dir, store) = temp_store().await;
        let range = remaining_range(&store, 100, 109, None).await.unwrap().unwrap();
        assert_eq!((range.start(), range.end()), (100, 109));
    }

    #[tokio::test]
    async fn test_fallback_only_when_empty() {
        let (_dir, store) = temp_store().await;
        let range = remaining_range(&store, 100, 109, Some(104)).await.unwrap().unwrap();
        assert_eq!(range.start(), 105);

        store.insert_batch(&[Parcel::bare(101)], None).await.unwrap();
        let range = remaining_range(&store, 100, 109, Some(104)).await.unwrap().unwrap();
        assert_eq!(range.start(), 102);
    }

    #[tokio::test]
    async fn test_checkpoint_wins_over_max_id() {
        let (_dir, store) = temp_store().await;
        // 108 finished out of order, but only ids up to 103 are known complete.
        store
            .insert_batch(&[Parcel::bare(102), Parcel::bare(108)], Some(103))
            .await
            .unwrap();
        let range = remaining_range(&store, 100, 109, None).await.unwrap().unwrap();
        assert_eq!(range.start(), 104);
    }

    #[tokio::test]
    async fn test_completed_range_yields_nothing() {
        let (_dir, store) = temp_store().await;
        store.insert_batch(&[], Some(109)).await.unwrap();
        assert!(remaining_range(&store, 100, 109, None).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_finished_range_at_largest_id_yields_nothing() {
        let (_dir, store) = temp_store().await;
        store.insert_batch(&[], Some(i64::MAX)).await.unwrap();
        assert!(remaining_range(&store, i64::MAX - 5, i64::MAX, None)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_inverted_range_is_config_error() {
        let (_dir, store) = temp_store().await;
        assert!(matches!(
            remaining_range(&store, 10, 5, None).await,
            Err(Error::Config(_))
        ));
    }
}
