//! Status poller: keeps the status indicator in sync with the active backend.
//!
//! One loop per session. It probes, renders, then sleeps with an adaptive
//! backoff: `when_ready` after a `Ready` probe; while not ready the delay
//! doubles for every repeat of the same `(status, message)` (capped at twice
//! `when_ready`) and falls back to `when_not_ready` as soon as it changes.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use log::{debug, error, info};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::coordinator::BackendHandle;
use crate::status::{BackendStatus, PollIntervals, StatusReport};

/// Surface the poller renders to (status bar, terminal, ...).
pub trait StatusDisplay: Send + Sync {
    fn render(&self, report: &StatusReport);
    fn set_visible(&self, visible: bool);
}

/// Logs the indicator whenever the status changes.
#[derive(Default)]
pub struct LogDisplay {
    last: Mutex<Option<BackendStatus>>,
    hidden: AtomicBool,
}

impl StatusDisplay for LogDisplay {
    fn render(&self, report: &StatusReport) {
        let mut last = self.last.lock().unwrap_or_else(|e| e.into_inner());
        let changed = *last != Some(report.status);
        *last = Some(report.status);

        if changed && !self.hidden.load(Ordering::Relaxed) {
            info!("{} {}", report.status.indicator_text(), report.message);
        } else {
            debug!("{} {}", report.status.indicator_text(), report.message);
        }
    }

    fn set_visible(&self, visible: bool) {
        self.hidden.store(!visible, Ordering::Relaxed);
    }
}

/// Poll state: the previous report and the current not-ready interval.
#[derive(Debug, Clone, Default)]
pub struct Backoff {
    last: Option<StatusReport>,
    interval: Duration,
}

impl Backoff {
    /// Delay before the next probe, given the report just rendered.
    pub fn next_delay(&mut self, report: &StatusReport, intervals: PollIntervals) -> Duration {
        let delay = if report.is_ready() {
            intervals.when_ready
        } else {
            self.interval = if self.last.as_ref() == Some(report) {
                (self.interval * 2).min(intervals.backoff_cap())
            } else {
                intervals.when_not_ready
            };
            self.interval
        };
        self.last = Some(report.clone());
        delay
    }
}

/// Handle of the running poll loop.
///
/// Stopping consumes the poller; polling again means starting a new one.
/// Dropping it cancels the loop without waiting for it.
pub struct StatusPoller {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl StatusPoller {
    /// Spawn the poll loop. The first probe runs immediately.
    pub fn start(handle: BackendHandle, display: Arc<dyn StatusDisplay>) -> Self {
        let cancel = CancellationToken::new();
        let task = tokio::spawn(run(handle, display, cancel.clone()));
        debug!("Status poller started");
        Self { cancel, task }
    }

    /// Stop the loop. A probe in flight completes first; a pending sleep is cut short.
    pub async fn stop(mut self) {
        self.cancel.cancel();
        if let Err(e) = (&mut self.task).await {
            error!("Status poller task failed: {}", e);
        }
        debug!("Status poller stopped");
    }
}

impl Drop for StatusPoller {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn run(handle: BackendHandle, display: Arc<dyn StatusDisplay>, cancel: CancellationToken) {
    let mut backoff = Backoff::default();

    while !cancel.is_cancelled() {
        let backend = handle.current();
        let report = backend.status().await;
        display.render(&report);
        let delay = backoff.next_delay(&report, backend.poll_intervals());
        drop(backend);

        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(delay) => {}
        }
    }
}
