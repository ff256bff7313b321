//! User-facing notifications raised by the backends.
//!
//! Backends never own UI. They describe what happened with a [`Notice`] and
//! hand it to whatever [`Notifier`] the host installed (toasts, a CLI, logs).
//! Uses a tagged enum so hosts can serialize notices as-is.

use std::time::Duration;

use log::{error, info};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum Notice {
    /// An OCR request is in progress; stays visible until `RequestFinished`
    #[serde(rename_all = "camelCase")]
    RequestStarted { request_id: Uuid, file_name: String },
    /// Replaces the in-progress text while the inference API provisions the model
    #[serde(rename_all = "camelCase")]
    WaitingForProvisioning { request_id: Uuid, file_name: String },
    /// Hide the in-progress notice of this request
    #[serde(rename_all = "camelCase")]
    RequestFinished { request_id: Uuid },
    ServerStarting,
    ServerStopped,
    /// The local server could not be spawned. `diagnostic` holds the
    /// interpreter check result when that check failed too.
    ServerStartFailed {
        error: String,
        diagnostic: Option<String>,
    },
}

impl Notice {
    /// Text shown to the user.
    pub fn text(&self) -> String {
        match self {
            Notice::RequestStarted { file_name, .. } => {
                format!("⚙️ Generating Latex for {}...", file_name)
            }
            Notice::WaitingForProvisioning { file_name, .. } => format!(
                "⚙️ Generating Latex for {}... (waiting for the inference API to load the model)",
                file_name
            ),
            Notice::RequestFinished { .. } => String::new(),
            Notice::ServerStarting => "⚙️ Starting server...".to_string(),
            Notice::ServerStopped => "⚙️ Server stopped".to_string(),
            Notice::ServerStartFailed {
                error,
                diagnostic: Some(diagnostic),
            } => format!("❌ {}\n❌ {}", error, diagnostic),
            Notice::ServerStartFailed {
                error,
                diagnostic: None,
            } => format!("❌ {}", error),
        }
    }

    /// How long the notice stays up; `None` until explicitly replaced or hidden.
    pub fn timeout(&self) -> Option<Duration> {
        match self {
            Notice::RequestStarted { .. } | Notice::WaitingForProvisioning { .. } => None,
            Notice::RequestFinished { .. } => Some(Duration::from_secs(1)),
            Notice::ServerStarting => Some(Duration::from_secs(5)),
            Notice::ServerStopped => Some(Duration::from_secs(2)),
            Notice::ServerStartFailed { .. } => Some(Duration::from_secs(10)),
        }
    }
}

/// Side channel for notices. Must not block.
pub trait Notifier: Send + Sync {
    fn notify(&self, notice: Notice);
}

/// Writes notices to the log. Default for headless use.
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn notify(&self, notice: Notice) {
        match &notice {
            Notice::ServerStartFailed { .. } => error!("{}", notice.text()),
            Notice::RequestFinished { request_id } => {
                log::debug!("Request {} finished", request_id)
            }
            _ => info!("{}", notice.text()),
        }
    }
}
