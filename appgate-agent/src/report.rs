//! The usage reporting pipeline.
//!
//! Enqueuers push events over an unbounded channel; a single consumer
//! buffers them and flushes on a timer or a high-water mark into a bounded
//! submission queue; a submitter posts batches with a mandatory inter-batch
//! delay. Back-pressure never blocks producers: a full buffer drops, a full
//! submission queue leaves the buffer intact, a failed submit re-enqueues.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use prometheus::{Histogram, HistogramOpts, IntCounter, Registry};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use appgate_common::errors::{Error, Result};

/// One usage event submitted by the agent.
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct UsageEvent {
    /// What happened, e.g. `app.session.start`.
    pub event_type: String,
    /// The user the event is attributed to.
    pub user: String,
    /// The application involved.
    pub app_name: String,
}

/// Tuning of a [`UsageReporter`].
#[derive(Debug, Clone)]
pub struct ReporterOptions {
    /// Flush as soon as the buffer holds this many events.
    pub min_batch_size: usize,
    /// Never submit more than this many events per batch.
    pub max_batch_size: usize,
    /// Flush whatever is buffered at least this often.
    pub max_batch_age: Duration,
    /// Drop incoming events once the buffer holds this many.
    pub max_buffer_size: usize,
    /// Bounded submission queue depth.
    pub submission_queue_size: usize,
    /// Mandatory pause between submissions, capping the request rate.
    pub submit_delay: Duration,
}

impl Default for ReporterOptions {
    fn default() -> Self {
        Self {
            min_batch_size: 50,
            max_batch_size: 100,
            max_batch_age: Duration::from_secs(300),
            max_buffer_size: 2500,
            submission_queue_size: 10,
            submit_delay: Duration::from_millis(100),
        }
    }
}

/// Posts one batch to the collector. The transport is a collaborator.
#[async_trait]
pub trait BatchSubmitter<T>: Send + Sync {
    /// Submit one batch; an error re-enqueues the whole batch.
    async fn submit(&self, batch: &[T]) -> Result<()>;
}

/// Pipeline counters, exported via prometheus.
pub struct ReporterMetrics {
    /// Events successfully submitted.
    pub events_submitted: IntCounter,
    /// Batches assembled.
    pub batches_total: IntCounter,
    /// Batches successfully submitted.
    pub batches_submitted: IntCounter,
    /// Batches whose submission failed.
    pub batches_failed: IntCounter,
    /// Events re-enqueued after a failed submission.
    pub events_requeued: IntCounter,
    /// Events dropped due to a full buffer.
    pub events_dropped: IntCounter,
    /// Wall time of submissions.
    pub batch_submission_duration: Histogram,
}

impl ReporterMetrics {
    /// Build and register the counters.
    pub fn new(registry: &Registry) -> Result<Arc<Self>> {
        fn counter(registry: &Registry, name: &str, help: &str) -> Result<IntCounter> {
            let counter = IntCounter::new(name, help)
                .map_err(|e| Error::Internal(anyhow::anyhow!("building counter {name}: {e}")))?;
            registry
                .register(Box::new(counter.clone()))
                .map_err(|e| Error::Internal(anyhow::anyhow!("registering {name}: {e}")))?;
            Ok(counter)
        }

        let batch_submission_duration = Histogram::with_opts(HistogramOpts::new(
            "usage_batch_submission_duration_seconds",
            "Wall time of usage batch submissions",
        ))
        .map_err(|e| Error::Internal(anyhow::anyhow!("building histogram: {e}")))?;
        registry
            .register(Box::new(batch_submission_duration.clone()))
            .map_err(|e| Error::Internal(anyhow::anyhow!("registering histogram: {e}")))?;

        Ok(Arc::new(Self {
            events_submitted: counter(
                registry,
                "usage_events_submitted_total",
                "Events successfully submitted",
            )?,
            batches_total: counter(registry, "usage_batches_total", "Batches assembled")?,
            batches_submitted: counter(
                registry,
                "usage_batches_submitted_total",
                "Batches successfully submitted",
            )?,
            batches_failed: counter(
                registry,
                "usage_batches_failed_total",
                "Batches whose submission failed",
            )?,
            events_requeued: counter(
                registry,
                "usage_events_requeued_total",
                "Events re-enqueued after failed submission",
            )?,
            events_dropped: counter(
                registry,
                "usage_events_dropped_total",
                "Events dropped due to a full buffer",
            )?,
            batch_submission_duration,
        }))
    }
}

/// The batching, back-pressured usage event submitter.
pub struct UsageReporter<T> {
    tx: mpsc::UnboundedSender<T>,
    metrics: Arc<ReporterMetrics>,
    cancel: CancellationToken,
    consumer: JoinHandle<()>,
    submitter: JoinHandle<()>,
}

impl<T: Send + 'static> UsageReporter<T> {
    /// Start the pipeline.
    pub fn start(
        options: ReporterOptions,
        submitter: Arc<dyn BatchSubmitter<T>>,
        metrics: Arc<ReporterMetrics>,
    ) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<T>();
        let (submission_tx, mut submission_rx) =
            mpsc::channel::<Vec<T>>(options.submission_queue_size.max(1));
        let cancel = CancellationToken::new();

        let consumer = {
            let options = options.clone();
            let metrics = metrics.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                let mut buffer: Vec<T> = Vec::new();
                let mut ticker = tokio::time::interval(options.max_batch_age);
                ticker.tick().await; // the first tick is immediate
                loop {
                    tokio::select! {
                        event = rx.recv() => {
                            match event {
                                Some(event) => {
                                    if buffer.len() >= options.max_buffer_size {
                                        metrics.events_dropped.inc();
                                        continue;
                                    }
                                    buffer.push(event);
                                    if buffer.len() >= options.min_batch_size {
                                        flush(&mut buffer, &submission_tx, &options, &metrics);
                                    }
                                }
                                None => return,
                            }
                        }
                        _ = ticker.tick() => {
                            flush(&mut buffer, &submission_tx, &options, &metrics);
                        }
                        _ = cancel.cancelled() => {
                            flush(&mut buffer, &submission_tx, &options, &metrics);
                            return;
                        }
                    }
                }
            })
        };

        let submitter_task = {
            let metrics = metrics.clone();
            let requeue_tx = tx.clone();
            let submit_delay = options.submit_delay;
            tokio::spawn(async move {
                while let Some(batch) = submission_rx.recv().await {
                    let timer = metrics.batch_submission_duration.start_timer();
                    let result = submitter.submit(&batch).await;
                    timer.observe_duration();
                    match result {
                        Ok(()) => {
                            metrics.batches_submitted.inc();
                            metrics.events_submitted.inc_by(batch.len() as u64);
                        }
                        Err(error) => {
                            tracing::warn!(%error, events = batch.len(), "usage batch submission failed");
                            metrics.batches_failed.inc();
                            metrics.events_requeued.inc_by(batch.len() as u64);
                            for event in batch {
                                // Subject to the same buffer overflow policy
                                // on the consumer side.
                                let _ = requeue_tx.send(event);
                            }
                        }
                    }
                    tokio::time::sleep(submit_delay).await;
                }
            })
        };

        Self {
            tx,
            metrics,
            cancel,
            consumer,
            submitter: submitter_task,
        }
    }

    /// Queue one event; never blocks.
    pub fn enqueue(&self, event: T) {
        let _ = self.tx.send(event);
    }

    /// The pipeline counters.
    pub fn metrics(&self) -> &ReporterMetrics {
        &self.metrics
    }

    /// Flush what can be flushed and stop.
    pub fn close(&self) {
        self.cancel.cancel();
    }
}

impl<T> Drop for UsageReporter<T> {
    fn drop(&mut self) {
        self.cancel.cancel();
        self.consumer.abort();
        self.submitter.abort();
    }
}

fn flush<T>(
    buffer: &mut Vec<T>,
    submission_tx: &mpsc::Sender<Vec<T>>,
    options: &ReporterOptions,
    metrics: &ReporterMetrics,
) {
    if buffer.is_empty() {
        return;
    }
    let take = buffer.len().min(options.max_batch_size);
    let batch: Vec<T> = buffer.drain(..take).collect();
    match submission_tx.try_send(batch) {
        Ok(()) => {
            metrics.batches_total.inc();
        }
        Err(mpsc::error::TrySendError::Full(batch))
        | Err(mpsc::error::TrySendError::Closed(batch)) => {
            // Keep the buffer intact and retry on the next tick.
            let mut restored = batch;
            restored.extend(buffer.drain(..));
            *buffer = restored;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Mutex;

    struct CollectingSubmitter {
        batches: Mutex<Vec<Vec<u32>>>,
        fail: AtomicBool,
    }

    impl CollectingSubmitter {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                batches: Mutex::new(Vec::new()),
                fail: AtomicBool::new(false),
            })
        }

        fn submitted(&self) -> usize {
            self.batches.lock().unwrap().iter().map(|b| b.len()).sum()
        }
    }

    #[async_trait]
    impl BatchSubmitter<u32> for CollectingSubmitter {
        async fn submit(&self, batch: &[u32]) -> Result<()> {
            if self.fail.load(Ordering::SeqCst) {
                return Err(Error::connection_problem("collector unavailable"));
            }
            self.batches.lock().unwrap().push(batch.to_vec());
            Ok(())
        }
    }

    fn options() -> ReporterOptions {
        ReporterOptions {
            min_batch_size: 5,
            max_batch_size: 10,
            max_batch_age: Duration::from_millis(50),
            max_buffer_size: 20,
            submission_queue_size: 2,
            submit_delay: Duration::from_millis(1),
        }
    }

    async fn wait_until(mut check: impl FnMut() -> bool) {
        for _ in 0..100 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition never became true");
    }

    #[tokio::test]
    async fn flushes_on_high_water_mark() {
        let submitter = CollectingSubmitter::new();
        let metrics = ReporterMetrics::new(&Registry::new()).unwrap();
        let reporter = UsageReporter::start(options(), submitter.clone(), metrics);

        for i in 0..5 {
            reporter.enqueue(i);
        }
        wait_until(|| submitter.submitted() == 5).await;
        assert_eq!(reporter.metrics().batches_submitted.get(), 1);
        assert_eq!(reporter.metrics().events_submitted.get(), 5);
    }

    #[tokio::test]
    async fn flushes_on_age() {
        let submitter = CollectingSubmitter::new();
        let metrics = ReporterMetrics::new(&Registry::new()).unwrap();
        let reporter = UsageReporter::start(options(), submitter.clone(), metrics);

        reporter.enqueue(1);
        reporter.enqueue(2);
        wait_until(|| submitter.submitted() == 2).await;
    }

    #[tokio::test]
    async fn failed_batches_are_requeued_and_retried() {
        let submitter = CollectingSubmitter::new();
        submitter.fail.store(true, Ordering::SeqCst);
        let metrics = ReporterMetrics::new(&Registry::new()).unwrap();
        let reporter = UsageReporter::start(options(), submitter.clone(), metrics);

        for i in 0..5 {
            reporter.enqueue(i);
        }
        wait_until(|| reporter.metrics().batches_failed.get() >= 1).await;
        assert!(reporter.metrics().events_requeued.get() >= 5);

        submitter.fail.store(false, Ordering::SeqCst);
        wait_until(|| submitter.submitted() >= 5).await;
    }

    #[tokio::test]
    async fn overflow_drops_and_counts() {
        let submitter = CollectingSubmitter::new();
        submitter.fail.store(true, Ordering::SeqCst);
        let metrics = ReporterMetrics::new(&Registry::new()).unwrap();
        let mut opts = options();
        opts.min_batch_size = 1000; // flush only by ticker
        opts.max_batch_age = Duration::from_secs(3600);
        opts.max_buffer_size = 10;
        let reporter = UsageReporter::start(opts, submitter.clone(), metrics);

        for i in 0..50 {
            reporter.enqueue(i);
        }
        wait_until(|| reporter.metrics().events_dropped.get() >= 40).await;
        assert_eq!(submitter.submitted(), 0);
    }
}
