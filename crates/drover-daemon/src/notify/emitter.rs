//! Non-blocking notification emitter.
//!
//! Callers hand records over with [`NotificationEmitter::emit`], which never
//! waits: a bounded channel feeds a single writer task that appends to the
//! sink with a small retry budget. [`NotificationEmitter::flush`] waits until
//! everything queued before it has been written or dropped.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::{NotificationRecord, NotificationSink};

/// Default number of records buffered between callers and the writer.
const DEFAULT_BUFFER: usize = 256;

/// Exponential backoff for sink writes.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Delay after the first failed attempt.
    pub initial_delay: Duration,
    /// Upper bound for a single delay.
    pub max_delay: Duration,
    /// Multiplier applied to the delay after each failed attempt.
    pub multiplier: f64,
    /// Total attempts per record, including the first.
    pub max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(5),
            multiplier: 2.0,
            max_attempts: 3,
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (0-indexed).
    #[allow(
        clippy::cast_precision_loss,
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss,
        clippy::cast_possible_wrap
    )]
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let base_ms = self.initial_delay.as_millis() as f64;
        let delay_ms = base_ms * self.multiplier.powi(attempt as i32);
        let capped_ms = delay_ms.min(self.max_delay.as_millis() as f64);
        Duration::from_millis(capped_ms as u64)
    }
}

/// Emitter settings.
#[derive(Debug, Clone)]
pub struct EmitterConfig {
    pub buffer: usize,
    pub retry: RetryPolicy,
}

impl Default for EmitterConfig {
    fn default() -> Self {
        Self {
            buffer: DEFAULT_BUFFER,
            retry: RetryPolicy::default(),
        }
    }
}

enum Command {
    Record(NotificationRecord),
    Flush(oneshot::Sender<()>),
}

/// Cloneable handle to the background notification writer.
///
/// The writer task exits once every handle has been dropped and the buffer
/// is drained.
#[derive(Clone)]
pub struct NotificationEmitter {
    tx: mpsc::Sender<Command>,
}

impl NotificationEmitter {
    /// Start the writer task over `sink`.
    pub fn spawn(sink: Arc<dyn NotificationSink>, config: EmitterConfig) -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(config.buffer.max(1));
        let handle = tokio::spawn(run_writer(sink, config.retry, rx));
        (Self { tx }, handle)
    }

    /// Queue a record without waiting.
    ///
    /// Returns `false` if the record was dropped because the buffer is full
    /// or the writer has stopped.
    pub fn emit(&self, record: NotificationRecord) -> bool {
        match self.tx.try_send(Command::Record(record)) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(Command::Record(record))) => {
                warn!(
                    title = %record.title,
                    key = %record.idempotency_key,
                    "Notification buffer full, dropping record"
                );
                false
            }
            Err(_) => {
                warn!("Notification writer stopped, dropping record");
                false
            }
        }
    }

    /// Wait until every record queued before this call has been handled.
    pub async fn flush(&self) {
        let (ack_tx, ack_rx) = oneshot::channel();
        if self.tx.send(Command::Flush(ack_tx)).await.is_err() {
            return;
        }
        let _ = ack_rx.await;
    }
}

async fn run_writer(
    sink: Arc<dyn NotificationSink>,
    retry: RetryPolicy,
    mut rx: mpsc::Receiver<Command>,
) {
    while let Some(command) = rx.recv().await {
        match command {
            Command::Record(record) => write_with_retry(sink.as_ref(), &retry, &record).await,
            Command::Flush(ack) => {
                let _ = ack.send(());
            }
        }
    }
    debug!("Notification writer stopped");
}

async fn write_with_retry(
    sink: &dyn NotificationSink,
    retry: &RetryPolicy,
    record: &NotificationRecord,
) {
    let attempts = retry.max_attempts.max(1);
    for attempt in 0..attempts {
        match sink.append(record).await {
            Ok(true) => {
                debug!(key = %record.idempotency_key, kind = record.kind.as_str(), "Notification written");
                return;
            }
            Ok(false) => {
                debug!(key = %record.idempotency_key, "Duplicate notification ignored");
                return;
            }
            Err(e) if attempt + 1 < attempts => {
                let delay = retry.delay_for_attempt(attempt);
                warn!(
                    error = %e,
                    attempt,
                    delay_ms = delay.as_millis(),
                    "Notification write failed, retrying"
                );
                tokio::time::sleep(delay).await;
            }
            Err(e) => {
                warn!(
                    error = %e,
                    key = %record.idempotency_key,
                    title = %record.title,
                    "Notification dropped after retries"
                );
            }
        }
    }
}
