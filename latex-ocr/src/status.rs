use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Readiness of the active backend, shared by the local server and the inference API.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, strum::Display, strum::EnumIter,
)]
#[serde(rename_all = "camelCase")]
pub enum BackendStatus {
    /// Accepts requests now
    Ready,
    /// Process or model is initializing
    Loading,
    /// Model weights are being fetched before loading can start
    Downloading,
    /// No answer before the probe deadline; expected to resolve on retry
    Unreachable,
    /// Needs user action (interpreter missing, invalid API key, ...)
    Misconfigured,
}

impl BackendStatus {
    /// Status bar glyph. One per status, never shared.
    pub fn glyph(self) -> &'static str {
        match self {
            BackendStatus::Ready => "✅",
            BackendStatus::Loading => "⚙️",
            BackendStatus::Downloading => "🌐",
            BackendStatus::Unreachable => "❌",
            BackendStatus::Misconfigured => "🔧",
        }
    }

    /// Full status bar text, e.g. `LatexOCR ✅`.
    pub fn indicator_text(self) -> String {
        format!("LatexOCR {}", self.glyph())
    }

    /// Transient states are expected to resolve without user action.
    pub fn is_transient(self) -> bool {
        matches!(
            self,
            BackendStatus::Loading | BackendStatus::Downloading | BackendStatus::Unreachable
        )
    }
}

/// One status probe result: the status plus a human readable message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusReport {
    pub status: BackendStatus,
    pub message: String,
}

impl StatusReport {
    pub fn new(status: BackendStatus, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    pub fn is_ready(&self) -> bool {
        self.status == BackendStatus::Ready
    }
}

/// Base cadence of the status poller for one backend kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollIntervals {
    /// Delay after a probe that did not report `Ready`
    pub when_not_ready: Duration,
    /// Delay after a `Ready` probe; twice this value caps the backoff
    pub when_ready: Duration,
}

impl PollIntervals {
    pub const LOCAL: Self = Self {
        when_not_ready: Duration::from_millis(300),
        when_ready: Duration::from_millis(5000),
    };

    pub const REMOTE: Self = Self {
        when_not_ready: Duration::from_millis(5000),
        when_ready: Duration::from_millis(15000),
    };

    pub fn backoff_cap(&self) -> Duration {
        self.when_ready * 2
    }
}
