mod error;
mod local;
mod remote;

pub use error::OcrError;
pub use local::{
    check_interpreter, server_args, InterpreterError, LocalBackend, STATUS_PROBE_DEADLINE,
};
pub use remote::{RemoteBackend, RemoteEndpoints, DEFAULT_INFERENCE_URL, DEFAULT_WHOAMI_URL};

use std::path::Path;
use std::sync::Arc;

use crate::config::{BackendKind, Settings};
use crate::notice::Notifier;
use crate::secret_store::SecretStore;
use crate::status::{PollIntervals, StatusReport};

/// Collaborators a backend is built with.
#[derive(Clone)]
pub struct BackendDeps {
    pub notifier: Arc<dyn Notifier>,
    pub secrets: Arc<dyn SecretStore>,
    pub endpoints: RemoteEndpoints,
}

/// The active OCR backend.
///
/// Each variant keeps its own state; the methods below are the one
/// dispatch surface shared by the orchestrator and the status poller.
pub enum Backend {
    Local(LocalBackend),
    Remote(RemoteBackend),
}

impl Backend {
    /// Build the backend selected by `settings.use_local_model`.
    pub fn from_settings(settings: Arc<Settings>, deps: &BackendDeps) -> Self {
        match settings.backend_kind() {
            BackendKind::Local => {
                Backend::Local(LocalBackend::new(settings, deps.notifier.clone()))
            }
            BackendKind::Remote => Backend::Remote(RemoteBackend::new(
                settings,
                deps.secrets.clone(),
                deps.endpoints.clone(),
                deps.notifier.clone(),
            )),
        }
    }

    pub fn kind(&self) -> BackendKind {
        match self {
            Backend::Local(_) => BackendKind::Local,
            Backend::Remote(_) => BackendKind::Remote,
        }
    }

    pub fn poll_intervals(&self) -> PollIntervals {
        match self {
            Backend::Local(local) => local.poll_intervals(),
            Backend::Remote(remote) => remote.poll_intervals(),
        }
    }

    pub fn settings(&self) -> Arc<Settings> {
        match self {
            Backend::Local(local) => local.settings(),
            Backend::Remote(remote) => remote.settings(),
        }
    }

    /// Takes effect on the next operation; calls in flight keep their snapshot.
    pub fn reload_settings(&self, settings: Arc<Settings>) {
        match self {
            Backend::Local(local) => local.reload_settings(settings),
            Backend::Remote(remote) => remote.reload_settings(settings),
        }
    }

    pub async fn load(&self) {
        match self {
            Backend::Local(local) => local.load().await,
            Backend::Remote(remote) => remote.load().await,
        }
    }

    pub async fn start(&self) {
        match self {
            Backend::Local(local) => local.start().await,
            Backend::Remote(remote) => remote.start().await,
        }
    }

    /// Idempotent.
    pub async fn unload(&self) {
        match self {
            Backend::Local(local) => local.unload().await,
            Backend::Remote(remote) => remote.unload().await,
        }
    }

    pub async fn status(&self) -> StatusReport {
        match self {
            Backend::Local(local) => local.status().await,
            Backend::Remote(remote) => remote.status().await,
        }
    }

    pub async fn image_to_latex(&self, path: &Path) -> Result<String, OcrError> {
        match self {
            Backend::Local(local) => local.image_to_latex(path).await,
            Backend::Remote(remote) => remote.image_to_latex(path).await,
        }
    }

    pub fn as_local(&self) -> Option<&LocalBackend> {
        match self {
            Backend::Local(local) => Some(local),
            Backend::Remote(_) => None,
        }
    }
}
