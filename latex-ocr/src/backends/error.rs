use std::path::PathBuf;

use crate::status::BackendStatus;

#[derive(Debug, thiserror::Error)]
pub enum OcrError {
    #[error("Unsupported image extension {0:?}")]
    UnsupportedExtension(String),
    #[error("Image file does not exist: {0}")]
    FileNotFound(PathBuf),
    #[error("Image file is empty: {0}")]
    EmptyFile(PathBuf),
    #[error("Cannot access image file: {0}")]
    Io(#[from] std::io::Error),
    #[error("{message}")]
    NotReady {
        status: BackendStatus,
        message: String,
    },
    // Local server errors
    #[error("Error getting response from latex_ocr_server: {0}")]
    Rpc(#[from] latex_ocr_rpc::RpcError),
    #[error("Server returned empty or invalid response: {0}")]
    MalformedResponse(String),
    // Inference API errors
    #[error("API key not configured")]
    ApiKeyMissing,
    #[error("Unauthorized API key")]
    Unauthorized,
    #[error("Inference API is being provisioned, please try again in a few seconds")]
    Provisioning,
    #[error("Rate limit reached: {0}")]
    RateLimited(String),
    #[error("Got {status}: {message}")]
    Api { status: u16, message: String },
    #[error("Request failed: {0}")]
    Request(#[from] reqwest::Error),
}

impl OcrError {
    /// Whether the request never reached a backend.
    pub fn is_precondition(&self) -> bool {
        matches!(
            self,
            OcrError::UnsupportedExtension(_)
                | OcrError::FileNotFound(_)
                | OcrError::EmptyFile(_)
                | OcrError::Io(_)
        )
    }

    /// Returns a user-friendly error message suitable for a transient notice
    pub fn user_message(&self) -> String {
        match self {
            OcrError::UnsupportedExtension(ext) => {
                format!("Unsupported image extension {:?}.", ext)
            }
            OcrError::FileNotFound(path) => {
                format!("Image file does not exist: {}", path.display())
            }
            OcrError::EmptyFile(path) => format!("Image file is empty: {}", path.display()),
            OcrError::Io(e) => format!("Cannot read image file: {}", e),
            OcrError::NotReady { status, message } => {
                format!("{} {}", status.glyph(), message)
            }
            OcrError::Rpc(e) => format!("The local server failed: {}", e),
            OcrError::MalformedResponse(_) => {
                "The server returned an empty result. Try a sharper image.".to_string()
            }
            OcrError::ApiKeyMissing => {
                "API key not configured. Please add it in the settings.".to_string()
            }
            OcrError::Unauthorized => "Invalid API key. Check your settings.".to_string(),
            OcrError::Provisioning => {
                "Inference API is being provisioned, please try again in a few seconds"
                    .to_string()
            }
            OcrError::RateLimited(_) => "Rate limit reached. Please wait and retry.".to_string(),
            OcrError::Api { status, message } => format!("Got {}: {}", status, message),
            OcrError::Request(e) if e.is_timeout() => {
                "The inference API took too long to answer. Try again.".to_string()
            }
            OcrError::Request(e) => format!("Inference API unreachable: {}", e),
        }
    }
}
