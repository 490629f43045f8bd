use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::runtime::Handle;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::config::Config;
use crate::export::{encode_line, Exporter, Record};
use crate::stats::{add, bump, AgentStats};
use crate::transport::{BackoffConfig, Transport};

// covers a flusher that is still starting when shutdown begins
const SHUTDOWN_GRACE: Duration = Duration::from_millis(250);

/// PipelineConfig bounds the memory and time the export pipeline may use.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct PipelineConfig {
    pub flush_interval: Duration,
    pub max_batch_event_count: usize,
    pub max_batch_bytes: usize,
    pub max_queue_event_count: usize,
    pub max_retries: u32,
    pub backoff: BackoffConfig,
    pub shutdown_timeout: Duration,
}

impl PipelineConfig {
    pub fn from_config(config: &Config) -> Self {
        PipelineConfig {
            flush_interval: config.flush_interval,
            max_batch_event_count: config.max_batch_event_count.max(1),
            max_batch_bytes: config.max_batch_bytes,
            max_queue_event_count: config.max_queue_event_count.max(1),
            max_retries: config.max_retries,
            backoff: BackoffConfig {
                base: config.retry_backoff,
                ..BackoffConfig::default()
            },
            shutdown_timeout: config.shutdown_timeout,
        }
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        PipelineConfig::from_config(&Config::default())
    }
}

/// ExportPipeline hands ended segments to a background flusher that batches
/// them and sends them through a [`Transport`].
///
/// Enqueueing never blocks: when the queue is full the newest record is
/// dropped and counted. The flusher runs on the caller's tokio runtime when
/// there is one, otherwise on a dedicated thread.
pub struct ExportPipeline {
    tx: mpsc::Sender<Record>,
    cancel: CancellationToken,
    done: Mutex<Option<oneshot::Receiver<()>>>,
    stats: Arc<AgentStats>,
    shutdown_timeout: Duration,
}

impl ExportPipeline {
    pub fn start(config: PipelineConfig, transport: Arc<dyn Transport>, stats: Arc<AgentStats>) -> Self {
        let (tx, rx) = mpsc::channel(config.max_queue_event_count.max(1));
        let cancel = CancellationToken::new();
        let (done_tx, done_rx) = oneshot::channel();

        let flusher = Flusher {
            rx,
            transport,
            config,
            stats: Arc::clone(&stats),
            cancel: cancel.clone(),
            batch: Batch::default(),
        };
        let task = async move {
            flusher.run().await;
            let _ = done_tx.send(());
        };

        match Handle::try_current() {
            Ok(handle) => {
                handle.spawn(task);
            }
            Err(_) => {
                let spawned = std::thread::Builder::new()
                    .name("apm-flusher".to_string())
                    .spawn(move || {
                        match tokio::runtime::Builder::new_current_thread()
                            .enable_all()
                            .build()
                        {
                            Ok(runtime) => runtime.block_on(task),
                            Err(e) => error!("failed to build flusher runtime: {e}"),
                        }
                    });
                if let Err(e) = spawned {
                    error!("failed to spawn flusher thread: {e}");
                }
            }
        }

        ExportPipeline {
            tx,
            cancel,
            done: Mutex::new(Some(done_rx)),
            stats,
            shutdown_timeout: config.shutdown_timeout,
        }
    }

    /// enqueue offers `record` to the flusher without waiting.
    pub fn enqueue(&self, record: Record) {
        if self.cancel.is_cancelled() {
            bump(&self.stats.rejected_after_shutdown);
            return;
        }
        match self.tx.try_send(record) {
            Ok(()) => {}
            Err(TrySendError::Full(record)) => {
                bump(&self.stats.queue_dropped);
                debug!("export queue full, dropping {}", record.id());
            }
            Err(TrySendError::Closed(_)) => bump(&self.stats.rejected_after_shutdown),
        }
    }

    pub fn is_shut_down(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// shutdown stops accepting records and waits, up to the shutdown
    /// timeout, for queued records to be sent. Whatever is left is counted as
    /// discarded.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let done = self.done.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(done) = done {
            if tokio::time::timeout(self.shutdown_timeout + SHUTDOWN_GRACE, done)
                .await
                .is_err()
            {
                warn!("export pipeline did not stop in time");
            }
        }
    }

    /// shutdown_blocking is [`shutdown`](Self::shutdown) for callers outside
    /// of an async runtime. It must not be called from async code.
    pub fn shutdown_blocking(&self) {
        self.cancel.cancel();
        let done = self.done.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(done) = done {
            let _ = done.blocking_recv();
        }
    }
}

impl Exporter for ExportPipeline {
    fn export(&self, record: Record) {
        self.enqueue(record)
    }
}

impl Drop for ExportPipeline {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

#[derive(Default)]
struct Batch {
    lines: Vec<u8>,
    count: usize,
}

impl Batch {
    fn push(&mut self, line: &[u8]) {
        self.lines.extend_from_slice(line);
        self.count += 1;
    }

    fn clear(&mut self) {
        self.lines.clear();
        self.count = 0;
    }
}

enum Delivery {
    Sent,
    Failed,
    Cancelled,
}

struct Flusher {
    rx: mpsc::Receiver<Record>,
    transport: Arc<dyn Transport>,
    config: PipelineConfig,
    stats: Arc<AgentStats>,
    cancel: CancellationToken,
    batch: Batch,
}

impl Flusher {
    async fn run(mut self) {
        let period = self.config.flush_interval.max(Duration::from_millis(1));
        let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                record = self.rx.recv() => match record {
                    Some(record) => self.add(record, false).await,
                    None => break,
                },
                _ = ticker.tick() => self.flush(false).await,
            }
        }
        self.drain().await;
    }

    async fn add(&mut self, record: Record, draining: bool) {
        let mut line = Vec::new();
        if let Err(e) = encode_line(&record, &mut line) {
            error!("failed to encode {}: {e}", record.id());
            bump(&self.stats.failed_records);
            return;
        }
        if line.len() > self.config.max_batch_bytes {
            bump(&self.stats.oversize_dropped);
            debug!("dropping {} of {} bytes", record.id(), line.len());
            return;
        }
        if self.batch.lines.len() + line.len() > self.config.max_batch_bytes {
            self.flush(draining).await;
        }
        self.batch.push(&line);
        if self.batch.count >= self.config.max_batch_event_count {
            self.flush(draining).await;
        }
    }

    async fn flush(&mut self, draining: bool) {
        if self.batch.count == 0 {
            return;
        }
        let count = self.batch.count as u64;
        let delivery = self.deliver(&self.batch.lines, draining).await;
        match delivery {
            Delivery::Sent => {
                add(&self.stats.sent_records, count);
                bump(&self.stats.sent_batches);
                self.batch.clear();
            }
            Delivery::Failed => {
                add(&self.stats.failed_records, count);
                bump(&self.stats.failed_batches);
                self.batch.clear();
            }
            // kept for the final drain
            Delivery::Cancelled => {}
        }
    }

    /// deliver sends one batch, retrying transient failures with backoff.
    /// Outside of the final drain a shutdown interrupts the attempt.
    async fn deliver(&self, lines: &[u8], draining: bool) -> Delivery {
        let mut retries = 0;
        loop {
            let result = if draining {
                self.transport.send(lines).await
            } else {
                tokio::select! {
                    biased;
                    _ = self.cancel.cancelled() => return Delivery::Cancelled,
                    result = self.transport.send(lines) => result,
                }
            };

            match result {
                Ok(()) => return Delivery::Sent,
                Err(e) if e.is_retryable() && retries < self.config.max_retries => {
                    retries += 1;
                    bump(&self.stats.transport_retries);
                    let delay = self.config.backoff.delay(retries);
                    warn!("sending batch failed, retry {retries} in {delay:?}: {e}");
                    if draining {
                        tokio::time::sleep(delay).await;
                    } else {
                        tokio::select! {
                            biased;
                            _ = self.cancel.cancelled() => return Delivery::Cancelled,
                            _ = tokio::time::sleep(delay) => {}
                        }
                    }
                }
                Err(e) => {
                    error!("dropping batch after {} attempts: {e}", retries + 1);
                    return Delivery::Failed;
                }
            }
        }
    }

    async fn drain(&mut self) {
        let deadline = Instant::now() + self.config.shutdown_timeout;
        let drained = tokio::time::timeout_at(deadline, async {
            while let Ok(record) = self.rx.try_recv() {
                self.add(record, true).await;
            }
            self.flush(true).await;
        })
        .await;
        if drained.is_err() {
            warn!("shutdown deadline reached with records still queued");
        }

        self.rx.close();
        let mut discarded = self.batch.count as u64;
        while self.rx.try_recv().is_ok() {
            discarded += 1;
        }
        self.batch.clear();
        if discarded > 0 {
            add(&self.stats.shutdown_discarded, discarded);
            warn!("discarded {discarded} records at shutdown");
        }
    }
}
