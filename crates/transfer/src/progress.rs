use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;

use crate::checkpoint::Checkpoint;
use crate::error::TransferError;
use crate::session::TransferOutcome;

/// Snapshot emitted after every settled part.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Progress {
    pub session_id: String,
    /// 0.0 to 100.0.
    pub percent: f64,
    pub transferred_bytes: u64,
    pub total_bytes: u64,
    pub bytes_per_second: f64,
    /// Estimated seconds left at the current rate; absent until a rate is known.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub eta_seconds: Option<f64>,
    pub checkpoint: Checkpoint,
}

impl Progress {
    pub fn new(checkpoint: Checkpoint, transferred_bytes: u64, bytes_per_second: f64) -> Self {
        let total_bytes = checkpoint.total_size;
        let percent = if total_bytes == 0 {
            if transferred_bytes == 0 && checkpoint.done_parts() == checkpoint.parts.len() {
                100.0
            } else {
                0.0
            }
        } else {
            transferred_bytes as f64 * 100.0 / total_bytes as f64
        };
        Self {
            session_id: checkpoint.session_id.clone(),
            percent,
            transferred_bytes,
            total_bytes,
            bytes_per_second,
            eta_seconds: None,
            checkpoint,
        }
    }

    pub fn with_eta(mut self, eta: Option<Duration>) -> Self {
        self.eta_seconds = eta.map(|d| d.as_secs_f64());
        self
    }

    pub fn remaining_bytes(&self) -> u64 {
        self.total_bytes.saturating_sub(self.transferred_bytes)
    }
}

/// Callback invoked with session progress.
pub type ProgressCallback = Arc<dyn Fn(&Progress) + Send + Sync>;

/// Callback invoked once when a session succeeds.
pub type SuccessCallback = Box<dyn FnOnce(&TransferOutcome) + Send>;

/// Callback invoked once when a session fails.
pub type FailureCallback = Box<dyn FnOnce(&TransferError) + Send>;

enum Terminal {
    Succeeded(TransferOutcome),
    Failed(Arc<TransferError>),
    Cancelled,
}

/// Per-session callback registrations.
///
/// Success and failure fire at most once in total. Registering after the
/// session settled fires the callback immediately.
#[derive(Default)]
pub(crate) struct Callbacks {
    inner: Mutex<CallbacksInner>,
}

#[derive(Default)]
struct CallbacksInner {
    progress: Vec<ProgressCallback>,
    success: Vec<SuccessCallback>,
    failure: Vec<FailureCallback>,
    terminal: Option<Terminal>,
    silenced: bool,
}

impl Callbacks {
    pub(crate) fn on_progress(&self, callback: ProgressCallback) {
        let mut inner = self.inner.lock().unwrap();
        if inner.terminal.is_none() {
            inner.progress.push(callback);
        }
    }

    pub(crate) fn on_success(&self, callback: SuccessCallback) {
        let mut inner = self.inner.lock().unwrap();
        match &inner.terminal {
            None => inner.success.push(callback),
            Some(Terminal::Succeeded(outcome)) => {
                let outcome = outcome.clone();
                drop(inner);
                callback(&outcome);
            }
            Some(_) => {}
        }
    }

    pub(crate) fn on_failure(&self, callback: FailureCallback) {
        let mut inner = self.inner.lock().unwrap();
        match &inner.terminal {
            None => inner.failure.push(callback),
            Some(Terminal::Failed(err)) => {
                let err = Arc::clone(err);
                drop(inner);
                callback(&err);
            }
            Some(_) => {}
        }
    }

    pub(crate) fn emit_progress(&self, progress: &Progress) {
        let callbacks = {
            let inner = self.inner.lock().unwrap();
            if inner.silenced || inner.terminal.is_some() {
                return;
            }
            inner.progress.clone()
        };
        for cb in callbacks {
            cb(progress);
        }
    }

    /// Stops progress delivery; used while a cancel is in progress.
    pub(crate) fn silence(&self) {
        self.inner.lock().unwrap().silenced = true;
    }

    pub(crate) fn succeed(&self, outcome: TransferOutcome) {
        let callbacks = {
            let mut inner = self.inner.lock().unwrap();
            if inner.terminal.is_some() {
                return;
            }
            inner.terminal = Some(Terminal::Succeeded(outcome.clone()));
            inner.progress.clear();
            inner.failure.clear();
            std::mem::take(&mut inner.success)
        };
        for cb in callbacks {
            cb(&outcome);
        }
    }

    pub(crate) fn fail(&self, error: TransferError) {
        let error = Arc::new(error);
        let callbacks = {
            let mut inner = self.inner.lock().unwrap();
            if inner.terminal.is_some() {
                return;
            }
            inner.terminal = Some(Terminal::Failed(Arc::clone(&error)));
            inner.progress.clear();
            inner.success.clear();
            std::mem::take(&mut inner.failure)
        };
        for cb in callbacks {
            cb(&error);
        }
    }

    /// Drops every registration; nothing fires afterwards.
    pub(crate) fn cancel(&self) {
        let mut inner = self.inner.lock().unwrap();
        if inner.terminal.is_none() {
            inner.terminal = Some(Terminal::Cancelled);
        }
        inner.progress.clear();
        inner.success.clear();
        inner.failure.clear();
    }

    /// The failure a session ended with, if it failed.
    pub(crate) fn failure(&self) -> Option<Arc<TransferError>> {
        match &self.inner.lock().unwrap().terminal {
            Some(Terminal::Failed(err)) => Some(Arc::clone(err)),
            _ => None,
        }
    }

    pub(crate) fn outcome(&self) -> Option<TransferOutcome> {
        match &self.inner.lock().unwrap().terminal {
            Some(Terminal::Succeeded(outcome)) => Some(outcome.clone()),
            _ => None,
        }
    }
}

/// A part that settled inside the current window.
struct Settled {
    index: usize,
    bytes: u64,
    at: Instant,
}

struct ThroughputInner {
    window: Duration,
    /// Start of the current run; the rate is never measured from earlier.
    anchor: Instant,
    settled: VecDeque<Settled>,
}

/// Session throughput measured over the parts settled in a trailing
/// time window.
///
/// Each settled part is recorded once under its index; a part settling
/// again (after a retry round) replaces its earlier entry.
pub struct Throughput {
    inner: Mutex<ThroughputInner>,
}

impl Default for Throughput {
    fn default() -> Self {
        Self::new(Duration::from_secs(5))
    }
}

impl Throughput {
    pub fn new(window: Duration) -> Self {
        Self {
            inner: Mutex::new(ThroughputInner {
                window,
                anchor: Instant::now(),
                settled: VecDeque::new(),
            }),
        }
    }

    /// Records that part `index` settled having moved `bytes`.
    pub fn record(&self, index: usize, bytes: u64) {
        let mut inner = self.inner.lock().unwrap();
        let now = Instant::now();
        inner.settled.retain(|s| s.index != index);
        inner.settled.push_back(Settled {
            index,
            bytes,
            at: now,
        });
        inner.expire(now);
    }

    /// Bytes per second over the window; 0.0 until time has passed.
    pub fn bytes_per_second(&self) -> f64 {
        let mut inner = self.inner.lock().unwrap();
        let now = Instant::now();
        inner.expire(now);

        let since = now
            .checked_sub(inner.window)
            .map_or(inner.anchor, |cutoff| cutoff.max(inner.anchor));
        let span = now.saturating_duration_since(since);
        if span.is_zero() {
            return 0.0;
        }
        let bytes: u64 = inner.settled.iter().map(|s| s.bytes).sum();
        bytes as f64 / span.as_secs_f64()
    }

    /// Time left for `remaining_bytes` at the current rate.
    pub fn eta(&self, remaining_bytes: u64) -> Option<Duration> {
        let rate = self.bytes_per_second();
        (rate > 0.0).then(|| Duration::from_secs_f64(remaining_bytes as f64 / rate))
    }

    /// Forgets all samples and starts measuring from now.
    pub fn restart(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.settled.clear();
        inner.anchor = Instant::now();
    }
}

impl ThroughputInner {
    fn expire(&mut self, now: Instant) {
        let Some(cutoff) = now.checked_sub(self.window) else {
            return;
        };
        while self.settled.front().is_some_and(|s| s.at < cutoff) {
            self.settled.pop_front();
        }
    }
}
