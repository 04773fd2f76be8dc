use std::sync::Arc;

use chrono::Local;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::batch::{BatchWriter, Completion};
use crate::parse::parse_parcel;
use crate::progress::{Event, Outcome, ProgressMonitor, ProgressState};
use crate::rate_limit::Pacer;
use crate::request::FetchRecord;
use crate::resume::{remaining_range, IdRange};
use crate::retry::{RetryPolicy, WorkItem};
use crate::store::ParcelStore;
use crate::{info_time, Config, Error, FetchError, Result};

/// What a finished (or interrupted) scan did.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RunSummary {
    /// First id of this run after resuming, `None` when there was nothing left to do.
    pub resumed_from: Option<i64>,
    pub processed: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub batches: u64,
    pub rows_written: u64,
    pub checkpoint: Option<i64>,
    /// Shutdown was requested before the whole range was admitted.
    pub interrupted: bool,
}

/// One scan over `config.start_id..=config.end_id`.
pub struct Scan {
    config: Config,
    fetcher: Arc<dyn FetchRecord>,
    retry: RetryPolicy,
    shutdown: CancellationToken,
}

impl Scan {
    pub fn new(config: Config, fetcher: Arc<dyn FetchRecord>) -> Self {
        Self {
            retry: RetryPolicy::new(config.retry_limit),
            config,
            fetcher,
            shutdown: CancellationToken::new(),
        }
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Cancelling `shutdown` stops admitting ids; in-flight ones finish and get flushed.
    pub fn with_shutdown(mut self, shutdown: CancellationToken) -> Self {
        self.shutdown = shutdown;
        self
    }

    pub async fn run(self) -> Result<RunSummary> {
        self.config.validate()?;
        let start_time = Local::now();

        let store = ParcelStore::open(&self.config.db_path).await?;
        let stats = store.stats().await?;
        info!(
            rows = stats.count,
            min_id = ?stats.min_id,
            max_id = ?stats.max_id,
            "opened {}",
            self.config.db_path.display()
        );

        let range = remaining_range(
            &store,
            self.config.start_id,
            self.config.end_id,
            self.config.resume_fallback,
        )
        .await?;
        let Some(range) = range else {
            store.close().await;
            return Ok(RunSummary::default());
        };
        let resumed_from = range.start();
        info_time!(
            "Scanning ids {}..={} with {} in flight",
            range.start(),
            range.end(),
            self.config.concurrency_limit
        );

        let capacity = self.config.concurrency_limit.max(16);
        let (done_tx, done_rx) = mpsc::channel(capacity);
        let (event_tx, event_rx) = mpsc::channel(capacity);
        // Cancelled by either a shutdown request or a fatal storage error.
        let stop = self.shutdown.child_token();

        let writer = tokio::spawn({
            let writer = BatchWriter::new(
                store.clone(),
                self.config.batch_size,
                self.config.flush_interval(),
                range.start(),
            );
            writer.run(done_rx, stop.clone())
        });
        let monitor = tokio::spawn({
            let state = ProgressState::new(self.config.start_id, range.end())
                .resumed_from(range.start());
            let monitor = ProgressMonitor::new(
                state,
                self.config.report_every,
                self.config.report_interval(),
            );
            monitor.run(event_rx)
        });

        let worker = Arc::new(Worker {
            fetcher: self.fetcher,
            retry: self.retry,
            pacer: Pacer::new(self.config.rate_limit()),
            done_tx,
            event_tx,
        });
        let admitted = admit(range, worker, self.config.concurrency_limit, &stop).await;

        // A storage failure explains a failed admission, so it wins.
        let report = writer.await??;
        let (fully_admitted, admitted) = admitted?;
        debug!(admitted, "all admitted ids finished");
        let state = monitor.await?;

        let stats = store.stats().await?;
        store.close().await;

        let summary = RunSummary {
            resumed_from: Some(resumed_from),
            processed: state.processed,
            succeeded: state.succeeded,
            failed: state.failed,
            batches: report.batches,
            rows_written: report.rows,
            checkpoint: report.checkpoint,
            interrupted: !fully_admitted,
        };
        if summary.interrupted {
            warn!(checkpoint = ?summary.checkpoint, "scan interrupted, rerun to continue");
        }
        info_time!(
            start_time,
            "Scan finished: {} succeeded, {} failed, {} batches, {} rows in store",
            summary.succeeded,
            summary.failed,
            summary.batches,
            stats.count
        );
        Ok(summary)
    }
}

/// Admits ids through a gate of `limit` permits until the range is drained or `stop` fires,
/// then waits for every admitted id to finish.
///
/// Returns whether the whole range was admitted, and how many ids were.
async fn admit(
    range: IdRange,
    worker: Arc<Worker>,
    limit: usize,
    stop: &CancellationToken,
) -> Result<(bool, u64)> {
    let permits = Arc::new(Semaphore::new(limit));
    let mut tasks = JoinSet::new();
    let mut admitted = 0;
    let mut fully_admitted = true;

    for id in range {
        let permit = tokio::select! {
            biased;
            _ = stop.cancelled() => {
                info!("shutdown requested, no longer admitting ids (next was {id})");
                fully_admitted = false;
                break;
            }
            permit = permits.clone().acquire_owned() => permit.map_err(|_| Error::AdmissionClosed)?,
        };

        tasks.spawn({
            let worker = worker.clone();
            async move {
                // Held until the item is terminal, whichever way it exits.
                let _permit = permit;
                worker.process(id).await
            }
        });
        admitted += 1;

        while let Some(res) = tasks.try_join_next() {
            res??;
        }
    }

    while let Some(res) = tasks.join_next().await {
        res??;
    }
    Ok((fully_admitted, admitted))
}

struct Worker {
    fetcher: Arc<dyn FetchRecord>,
    retry: RetryPolicy,
    pacer: Pacer,
    done_tx: mpsc::Sender<Completion>,
    event_tx: mpsc::Sender<Event>,
}

impl Worker {
    /// Fetches, parses and hands off one id; every id produces exactly one completion.
    async fn process(&self, id: i64) -> Result<()> {
        let mut item = WorkItem::new(id);
        let fetched = self
            .retry
            .run(&mut item, |id| async move {
                self.pacer.until_ready().await;
                self.fetcher.fetch(id).await
            })
            .await;
        debug_assert!(item.state.is_terminal());

        let parsed = fetched.and_then(|payload| {
            parse_parcel(id, &payload).map_err(|e| FetchError::Malformed(e.to_string()))
        });
        let (completion, outcome) = match parsed {
            Ok(parcel) => (Completion::Succeeded(parcel), Outcome::Succeeded),
            Err(err) => {
                debug!(id, attempts = item.attempt, "permanently failed: {err}");
                (Completion::Failed(id), Outcome::PermanentlyFailed)
            }
        };

        self.done_tx.send(completion).await?;
        self.event_tx.send(Event { id, outcome }).await?;
        Ok(())
    }
}
