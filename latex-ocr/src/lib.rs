//! Model status and lifecycle coordinator for LaTeX OCR.
//!
//! Images are converted either by a local `latex_ocr_server` process reached
//! over gRPC or by a hosted inference API. [`LatexOcr`] owns the active
//! backend, swaps it when the settings change and keeps a status indicator
//! up to date through a [`StatusPoller`].

pub mod backends;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod image;
pub mod logging;
pub mod notice;
pub mod poller;
pub mod secret_store;
pub mod status;

pub use backends::{Backend, BackendDeps, OcrError, RemoteEndpoints};
pub use config::{BackendKind, ConfigKey, ConfigStore, JsonFileStore, Settings};
pub use coordinator::{BackendHandle, LatexOcr};
pub use error::Error;
pub use notice::{LogNotifier, Notice, Notifier};
pub use poller::{LogDisplay, StatusDisplay, StatusPoller};
pub use status::{BackendStatus, PollIntervals, StatusReport};
