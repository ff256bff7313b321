//! The OCR orchestrator: owns the active backend and the status poller.

use std::path::Path;
use std::sync::{Arc, Mutex, RwLock};

use log::{info, warn};

use crate::backends::{Backend, BackendDeps, OcrError};
use crate::config::{BackendKind, Settings};
use crate::notice::Notice;
use crate::poller::{StatusDisplay, StatusPoller};
use crate::secret_store::{obfuscate_api_key, seal_api_key, ApiKeyMaterial};
use crate::status::{BackendStatus, StatusReport};

/// Shared reference to the active backend.
///
/// Readers clone the inner `Arc` and keep using it for the whole call, so a
/// swap never changes the backend under an operation in flight.
#[derive(Clone)]
pub struct BackendHandle {
    inner: Arc<RwLock<Arc<Backend>>>,
}

impl BackendHandle {
    pub fn new(backend: Backend) -> Self {
        Self {
            inner: Arc::new(RwLock::new(Arc::new(backend))),
        }
    }

    pub fn current(&self) -> Arc<Backend> {
        self.inner
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Install `backend`, returning the one it replaces.
    fn replace(&self, backend: Backend) -> Arc<Backend> {
        let mut current = self.inner.write().unwrap_or_else(|e| e.into_inner());
        std::mem::replace(&mut *current, Arc::new(backend))
    }
}

/// Plugin core: routes OCR requests to the active backend, applies settings
/// changes and controls the local server.
pub struct LatexOcr {
    settings: Mutex<Arc<Settings>>,
    handle: BackendHandle,
    deps: BackendDeps,
    display: Arc<dyn StatusDisplay>,
    poller: tokio::sync::Mutex<Option<StatusPoller>>,
    /// Serializes backend swaps and server control
    writer: tokio::sync::Mutex<()>,
}

impl LatexOcr {
    /// Build the backend from `settings`, auto-start the local server when
    /// configured to, and start polling.
    pub async fn new(
        settings: Settings,
        deps: BackendDeps,
        display: Arc<dyn StatusDisplay>,
    ) -> Self {
        let settings = Arc::new(settings);
        let backend = Backend::from_settings(settings.clone(), &deps);
        info!("Using {} backend", backend.kind());
        backend.load().await;

        if backend.kind() == BackendKind::Local && settings.start_server_on_load {
            deps.notifier.notify(Notice::ServerStarting);
            backend.start().await;
        }

        let handle = BackendHandle::new(backend);
        display.set_visible(settings.show_status_bar);
        let poller = StatusPoller::start(handle.clone(), display.clone());

        Self {
            settings: Mutex::new(settings),
            handle,
            deps,
            display,
            poller: tokio::sync::Mutex::new(Some(poller)),
            writer: tokio::sync::Mutex::new(()),
        }
    }

    pub fn settings(&self) -> Arc<Settings> {
        self.settings
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn backend(&self) -> Arc<Backend> {
        self.handle.current()
    }

    pub fn backend_handle(&self) -> BackendHandle {
        self.handle.clone()
    }

    /// Concurrent calls are allowed; each one is independent.
    pub async fn image_to_latex(&self, path: &Path) -> Result<String, OcrError> {
        self.handle.current().image_to_latex(path).await
    }

    pub async fn status(&self) -> StatusReport {
        self.handle.current().status().await
    }

    /// Status as a one-line notice, e.g. `🔧 Api key required`.
    pub async fn check_status(&self) -> String {
        let report = self.status().await;
        match report.status {
            BackendStatus::Ready => "✅ The server is reachable!".to_string(),
            status => format!("{} {}", status.glyph(), report.message),
        }
    }

    /// Apply new settings. Toggling the local model swaps backends: the old
    /// one is unloaded before the new one is built, so at most one server
    /// process is ever alive. Other changes are hot-reloaded and the port,
    /// interpreter and cache directory apply on the next server start.
    pub async fn update_settings(&self, settings: Settings) {
        let _writer = self.writer.lock().await;
        let settings = Arc::new(settings);
        let previous = std::mem::replace(
            &mut *self.settings.lock().unwrap_or_else(|e| e.into_inner()),
            settings.clone(),
        );

        if previous.show_status_bar != settings.show_status_bar {
            self.display.set_visible(settings.show_status_bar);
        }

        let current = self.handle.current();
        if current.kind() == settings.backend_kind() {
            current.reload_settings(settings);
            return;
        }

        info!(
            "Switching backend from {} to {}",
            current.kind(),
            settings.backend_kind()
        );
        current.unload().await;
        drop(current);

        let backend = Backend::from_settings(settings, &self.deps);
        backend.load().await;
        self.handle.replace(backend);
    }

    /// Seal and store a new inference API key, then reload the backend.
    /// The entry behind a previously sealed key is dropped from the store.
    /// Returns the settings to persist.
    pub async fn set_api_key(&self, key: &str) -> Settings {
        let mut settings = (*self.settings()).clone();
        let previous = std::mem::replace(
            &mut settings.api_key,
            seal_api_key(key, self.deps.secrets.as_ref()),
        );
        settings.obfuscated_key = obfuscate_api_key(key);
        info!("API key saved ({})", settings.obfuscated_key);

        self.update_settings(settings.clone()).await;

        if let ApiKeyMaterial::Sealed(blob) = previous {
            if let Err(e) = self.deps.secrets.forget(&blob) {
                warn!("Could not remove the previous API key: {}", e);
            }
        }
        settings
    }

    /// Unload, load and start the active backend.
    pub async fn restart_server(&self) {
        let _writer = self.writer.lock().await;
        let backend = self.handle.current();
        self.deps.notifier.notify(Notice::ServerStarting);
        backend.unload().await;
        backend.load().await;
        backend.start().await;
    }

    pub async fn stop_server(&self) {
        let _writer = self.writer.lock().await;
        let backend = self.handle.current();
        if backend.kind() != BackendKind::Local {
            warn!("No server to stop for the {} backend", backend.kind());
            return;
        }
        backend.unload().await;
        self.deps.notifier.notify(Notice::ServerStopped);
    }

    pub fn set_status_bar_visible(&self, visible: bool) {
        let mut settings = self.settings.lock().unwrap_or_else(|e| e.into_inner());
        let mut updated = (**settings).clone();
        updated.show_status_bar = visible;
        *settings = Arc::new(updated);
        self.display.set_visible(visible);
    }

    /// Stop the poller, then unload the backend. Safe to call more than once.
    ///
    /// Dropping without calling this still ends the poll loop, and the
    /// server process dies with the last reference to the backend.
    pub async fn shutdown(&self) {
        if let Some(poller) = self.poller.lock().await.take() {
            poller.stop().await;
        }
        let _writer = self.writer.lock().await;
        self.handle.current().unload().await;
        info!("LatexOCR shut down");
    }
}
