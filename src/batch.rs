//! Buffers parsed parcels and flushes them to the store in transactions.
//!
//! Every terminal outcome passes through the writer, failures included, so it can track the
//! contiguous range of finished ids. That low-water mark is committed as the scan checkpoint in
//! the same transaction as the parcels beneath it.

use std::collections::BTreeSet;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::{sleep, sleep_until, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::parse::Parcel;
use crate::store::ParcelStore;
use crate::{Error, Result, FLUSH_ATTEMPTS};

/// Terminal outcome of one work item, as seen by the writer.
#[derive(Debug, Clone, PartialEq)]
pub enum Completion {
    Succeeded(Parcel),
    Failed(i64),
}

impl Completion {
    pub fn id(&self) -> i64 {
        match self {
            Completion::Succeeded(parcel) => parcel.id,
            Completion::Failed(id) => *id,
        }
    }
}

/// Highest id below which every id has reached a terminal state.
///
/// The next expected id is kept wider than `i64` so a range ending at `i64::MAX` can close.
#[derive(Debug, Clone)]
pub struct Watermark {
    first: i128,
    next: i128,
    done: BTreeSet<i64>,
}

impl Watermark {
    pub fn new(first_id: i64) -> Self {
        Self {
            first: first_id.into(),
            next: first_id.into(),
            done: BTreeSet::new(),
        }
    }

    pub fn complete(&mut self, id: i64) {
        if i128::from(id) < self.next {
            return;
        }
        self.done.insert(id);
        while let Ok(next) = i64::try_from(self.next) {
            if !self.done.remove(&next) {
                break;
            }
            self.next += 1;
        }
    }

    pub fn checkpoint(&self) -> Option<i64> {
        if self.next > self.first {
            i64::try_from(self.next - 1).ok()
        } else {
            None
        }
    }

    /// Finished ids still waiting on a gap below them.
    pub fn pending(&self) -> usize {
        self.done.len()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchReport {
    /// Flushes that carried at least one parcel.
    pub batches: u64,
    pub rows: u64,
    pub checkpoint: Option<i64>,
}

pub struct BatchWriter {
    store: ParcelStore,
    batch_size: usize,
    max_age: Duration,
    flush_backoff: Duration,
    buffer: Vec<Parcel>,
    watermark: Watermark,
    dirty_since: Option<Instant>,
    report: BatchReport,
}

impl BatchWriter {
    pub fn new(store: ParcelStore, batch_size: usize, max_age: Duration, first_id: i64) -> Self {
        Self {
            store,
            batch_size,
            max_age,
            flush_backoff: Duration::from_secs(1),
            buffer: Vec::with_capacity(batch_size),
            watermark: Watermark::new(first_id),
            dirty_since: None,
            report: BatchReport::default(),
        }
    }

    pub fn with_flush_backoff(mut self, backoff: Duration) -> Self {
        self.flush_backoff = backoff;
        self
    }

    /// Consumes completions until every sender is gone, then flushes what is left.
    ///
    /// A flush that keeps failing cancels `abort` so no more work is admitted, and the error is
    /// returned with the unwritten buffer still counted.
    pub async fn run(
        mut self,
        mut rx: mpsc::Receiver<Completion>,
        abort: CancellationToken,
    ) -> Result<BatchReport> {
        let res = self.consume(&mut rx).await;
        if let Err(e) = &res {
            error!("batch writer stopped: {e}");
            abort.cancel();
        }
        res
    }

    async fn consume(&mut self, rx: &mut mpsc::Receiver<Completion>) -> Result<BatchReport> {
        loop {
            let deadline = self.dirty_since.map(|since| since + self.max_age);
            tokio::select! {
                msg = rx.recv() => match msg {
                    Some(completion) => {
                        self.accept(completion);
                        if self.buffer.len() >= self.batch_size {
                            self.flush().await?;
                        }
                    }
                    None => break,
                },
                _ = sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                    debug!(buffered = self.buffer.len(), "buffer aged out");
                    self.flush().await?;
                }
            }
        }

        if self.is_dirty() {
            self.flush().await?;
        }
        Ok(self.report)
    }

    fn accept(&mut self, completion: Completion) {
        self.watermark.complete(completion.id());
        if let Completion::Succeeded(parcel) = completion {
            self.buffer.push(parcel);
        }
        if self.dirty_since.is_none() && self.is_dirty() {
            self.dirty_since = Some(Instant::now());
        }
    }

    fn is_dirty(&self) -> bool {
        !self.buffer.is_empty() || self.watermark.checkpoint() > self.report.checkpoint
    }

    /// Writes the whole buffer and the current watermark, retrying with the same batch.
    async fn flush(&mut self) -> Result<()> {
        let checkpoint = self.watermark.checkpoint();
        let mut attempt = 1;
        loop {
            match self.store.insert_batch(&self.buffer, checkpoint).await {
                Ok(()) => break,
                Err(e) if attempt < FLUSH_ATTEMPTS => {
                    warn!(
                        attempt,
                        pending = self.buffer.len(),
                        "flush failed, retrying: {e}"
                    );
                    sleep(self.flush_backoff * attempt).await;
                    attempt += 1;
                }
                Err(source) => {
                    return Err(Error::StorageFlush {
                        pending: self.buffer.len(),
                        source,
                    })
                }
            }
        }

        if !self.buffer.is_empty() {
            self.report.batches += 1;
            self.report.rows += self.buffer.len() as u64;
        }
        debug!(
            rows = self.buffer.len(),
            ?checkpoint,
            waiting = self.watermark.pending(),
            "flushed batch"
        );
        self.report.checkpoint = checkpoint;
        self.buffer.clear();
        self.dirty_since = None;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn temp_store() -> (tempfile::TempDir, ParcelStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = ParcelStore::open(dir.path().join("scan.db")).await.unwrap();
        (dir, store)
    }

    /// Second connection to the store's file that can block parcel inserts until released.
    async fn insert_gate(dir: &tempfile::TempDir) -> sqlx::SqlitePool {
        let options = sqlx::sqlite::SqliteConnectOptions::new()
            .filename(dir.path().join("scan.db"))
            .busy_timeout(Duration::from_secs(30));
        let gate = sqlx::SqlitePool::connect_with(options).await.unwrap();
        for sql in [
            "CREATE TABLE insert_gate (closed INTEGER NOT NULL)",
            "INSERT INTO insert_gate (closed) VALUES (1)",
            "CREATE TRIGGER gate_parcels BEFORE INSERT ON parcels
                WHEN EXISTS (SELECT 1 FROM insert_gate)
                BEGIN SELECT RAISE(ABORT, 'storage unavailable'); END",
        ] {
            sqlx::query(sql).execute(&gate).await.unwrap();
        }
        gate
    }

    #[test]
    fn test_watermark_waits_for_gaps() {
        let mut mark = Watermark::new(100);
        assert_eq!(mark.checkpoint(), None);
        mark.complete(101);
        mark.complete(103);
        assert_eq!(mark.checkpoint(), None);
        mark.complete(100);
        assert_eq!(mark.checkpoint(), Some(101));
        assert_eq!(mark.pending(), 1);
        mark.complete(102);
        assert_eq!(mark.checkpoint(), Some(103));
        assert_eq!(mark.pending(), 0);
        // Repeats and stale ids don't move anything.
        mark.complete(100);
        assert_eq!(mark.checkpoint(), Some(103));
    }

    #[test]
    fn test_watermark_reaches_last_id() {
        let mut mark = Watermark::new(i64::MAX - 2);
        mark.complete(i64::MAX);
        mark.complete(i64::MAX - 2);
        assert_eq!(mark.checkpoint(), Some(i64::MAX - 2));
        mark.complete(i64::MAX - 1);
        assert_eq!(mark.checkpoint(), Some(i64::MAX));
        assert_eq!(mark.pending(), 0);
        mark.complete(i64::MAX);
        assert_eq!(mark.checkpoint(), Some(i64::MAX));
    }

    #[tokio::test]
    async fn test_flushes_on_size_and_close() {
        let (_dir, store) = temp_store().await;
        let writer = BatchWriter::new(store.clone(), 5, Duration::from_secs(3600), 1);
        let (tx, rx) = mpsc::channel(16);
        let handle = tokio::spawn(writer.run(rx, CancellationToken::new()));

        for id in 1..=12 {
            let completion = if id == 6 {
                Completion::Failed(id)
            } else {
                Completion::Succeeded(Parcel::bare(id))
            };
            tx.send(completion).await.unwrap();
        }
        drop(tx);

        let report = handle.await.unwrap().unwrap();
        assert_eq!(report.rows, 11);
        assert_eq!(report.batches, 3);
        assert_eq!(report.checkpoint, Some(12));
        assert_eq!(store.stats().await.unwrap().count, 11);
        assert_eq!(store.checkpoint().await.unwrap(), Some(12));
    }

    #[tokio::test]
    async fn test_flushes_aged_buffer() {
        let (_dir, store) = temp_store().await;
        let writer = BatchWriter::new(store.clone(), 1000, Duration::from_millis(50), 1);
        let (tx, rx) = mpsc::channel(16);
        let handle = tokio::spawn(writer.run(rx, CancellationToken::new()));

        tx.send(Completion::Succeeded(Parcel::bare(1))).await.unwrap();
        tx.send(Completion::Failed(2)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(store.stats().await.unwrap().count, 1);
        assert_eq!(store.checkpoint().await.unwrap(), Some(2));

        drop(tx);
        let report = handle.await.unwrap().unwrap();
        assert_eq!(report.batches, 1);
    }

    #[tokio::test]
    async fn test_failed_flush_retries_same_batch() {
        let (dir, store) = temp_store().await;
        let gate = insert_gate(&dir).await;
        let writer = BatchWriter::new(store.clone(), 3, Duration::from_secs(3600), 1)
            .with_flush_backoff(Duration::from_millis(300));
        let (tx, rx) = mpsc::channel(16);
        let started = Instant::now();
        let handle = tokio::spawn(writer.run(rx, CancellationToken::new()));

        for id in 1..=3 {
            tx.send(Completion::Succeeded(Parcel::bare(id))).await.unwrap();
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(store.stats().await.unwrap().count, 0);
        assert_eq!(store.checkpoint().await.unwrap(), None);

        sqlx::query("DELETE FROM insert_gate")
            .execute(&gate)
            .await
            .unwrap();
        drop(tx);

        let report = handle.await.unwrap().unwrap();
        // Only a retry after the flush backoff could have written the batch.
        assert!(started.elapsed() >= Duration::from_millis(300));
        assert_eq!(report.batches, 1);
        assert_eq!(report.rows, 3);
        assert_eq!(report.checkpoint, Some(3));

        let stats = store.stats().await.unwrap();
        assert_eq!((stats.count, stats.min_id, stats.max_id), (3, Some(1), Some(3)));
        for id in 1..=3 {
            assert!(store.get(id).await.unwrap().is_some());
        }
        assert_eq!(store.checkpoint().await.unwrap(), Some(3));
        gate.close().await;
    }

    #[tokio::test]
    async fn test_storage_failure_is_fatal_and_counted() {
        let (_dir, store) = temp_store().await;
        store.close().await;
        let writer = BatchWriter::new(store, 2, Duration::from_secs(3600), 1)
            .with_flush_backoff(Duration::from_millis(1));
        let (tx, rx) = mpsc::channel(16);
        let abort = CancellationToken::new();
        let handle = tokio::spawn(writer.run(rx, abort.clone()));

        tx.send(Completion::Succeeded(Parcel::bare(1))).await.unwrap();
        tx.send(Completion::Succeeded(Parcel::bare(2))).await.unwrap();

        let res = handle.await.unwrap();
        assert!(matches!(res, Err(Error::StorageFlush { pending: 2, .. })));
        assert!(abort.is_cancelled());
    }
}
