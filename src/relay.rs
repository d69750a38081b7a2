//! Relays a job's container output to the dispatch service.
//!
//! Raw output bytes accumulate in a buffer that is drained on a fixed
//! cadence and once more when the job ends. Text is decoded at flush time;
//! a multi-byte character cut off at the end of the buffer waits for the
//! next flush. A send that fails loses that batch; there is no retry and no
//! backlog.

use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::dispatch::DispatchApi;

#[derive(Clone)]
pub struct LogRelay {
    inner: Arc<RelayInner>,
}

struct RelayInner {
    job_id: String,
    dispatch: Arc<dyn DispatchApi>,
    buffer: Mutex<Vec<u8>>,
}

impl LogRelay {
    pub fn new(job_id: impl Into<String>, dispatch: Arc<dyn DispatchApi>) -> Self {
        Self {
            inner: Arc::new(RelayInner {
                job_id: job_id.into(),
                dispatch,
                buffer: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn push(&self, chunk: &[u8]) {
        self.buffer().extend_from_slice(chunk);
    }

    /// Buffered bytes not yet sent.
    pub fn pending(&self) -> usize {
        self.buffer().len()
    }

    /// Send whatever is buffered, holding back an incomplete trailing
    /// character. An empty batch sends nothing. Returns true if a batch
    /// was delivered.
    pub async fn flush(&self) -> bool {
        let batch = self.take_batch(false);
        self.send(batch).await
    }

    /// Final flush: everything buffered is sent, a dangling partial
    /// character included.
    pub async fn finish(&self) -> bool {
        let batch = self.take_batch(true);
        self.send(batch).await
    }

    fn take_batch(&self, everything: bool) -> String {
        let mut buffer = self.buffer();
        let mut bytes = std::mem::take(&mut *buffer);
        if !everything {
            let cut = incomplete_tail(&bytes);
            *buffer = bytes.split_off(cut);
        }
        drop(buffer);
        String::from_utf8_lossy(&bytes).into_owned()
    }

    async fn send(&self, batch: String) -> bool {
        if batch.is_empty() {
            return false;
        }

        match self.inner.dispatch.send_log(&self.inner.job_id, &batch).await {
            Ok(()) => {
                debug!(job_id = %self.inner.job_id, bytes = batch.len(), "Relayed output");
                true
            }
            Err(e) => {
                warn!(job_id = %self.inner.job_id, bytes = batch.len(), "Failed to send log, batch dropped: {}", e);
                false
            }
        }
    }

    /// Flush every `every` until the returned ticker is stopped or dropped.
    /// The first flush happens one period after the call.
    pub fn spawn_ticker(&self, every: Duration) -> FlushTicker {
        let cancel = CancellationToken::new();
        let relay = self.clone();
        let token = cancel.clone();

        let handle = tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + every, every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        relay.flush().await;
                    }
                }
            }
        });

        FlushTicker {
            cancel,
            handle: Some(handle),
        }
    }

    fn buffer(&self) -> std::sync::MutexGuard<'_, Vec<u8>> {
        self.inner
            .buffer
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Start of a UTF-8 sequence that is cut off at the end of `bytes`, or
/// `bytes.len()` if the buffer ends on a character boundary. Invalid bytes
/// are not held back; they decode lossily.
fn incomplete_tail(bytes: &[u8]) -> usize {
    // A sequence is at most 4 bytes, so only the last 3 can start a cut one.
    let floor = bytes.len().saturating_sub(3);
    for start in (floor..bytes.len()).rev() {
        if let Err(e) = std::str::from_utf8(&bytes[start..]) {
            if e.valid_up_to() == 0 && e.error_len().is_none() {
                return start;
            }
        }
    }
    bytes.len()
}

/// Handle to a running flush cadence.
pub struct FlushTicker {
    cancel: CancellationToken,
    handle: Option<JoinHandle<()>>,
}

impl FlushTicker {
    /// Cancel the cadence and wait for an in-progress flush to finish, so a
    /// following final flush cannot overtake it. Safe to call repeatedly.
    pub async fn stop(&mut self) {
        self.cancel.cancel();
        if let Some(handle) = self.handle.take() {
            let _ = handle.await;
        }
    }
}

impl Drop for FlushTicker {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

#[cfg(test)]
#[path = "./relay_tests.rs"]
mod tests;
