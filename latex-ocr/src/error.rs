use derive_more::{Display, From};

use crate::backends::OcrError;
use crate::config::ConfigError;
use crate::secret_store::SecretStoreError;

/// Top-level error of the host binary.
#[derive(Debug, Display, From)]
pub enum Error {
    #[from]
    #[display("{_0}")]
    Ocr(OcrError),

    #[from]
    #[display("{_0}")]
    Config(ConfigError),

    #[from]
    #[display("{_0}")]
    SecretStore(SecretStoreError),

    #[from]
    #[display("{_0}")]
    Io(std::io::Error),
}

impl std::error::Error for Error {}

impl Error {
    /// Text for the user; OCR failures get their friendly form.
    pub fn user_message(&self) -> String {
        match self {
            Error::Ocr(e) => e.user_message(),
            other => other.to_string(),
        }
    }
}
