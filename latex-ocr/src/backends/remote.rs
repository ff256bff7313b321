//! Remote backend: the hosted inference API.
//!
//! No process is owned, so `load`, `start` and `unload` only log.

use std::path::Path;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use log::{debug, error, info, warn};
use reqwest::StatusCode;
use secrecy::{ExposeSecret, SecretString};

use crate::config::Settings;
use crate::image::{validate_image, wrap_latex, ImageFile};
use crate::notice::{Notice, Notifier};
use crate::secret_store::{resolve_api_key, SecretStore};
use crate::status::{BackendStatus, PollIntervals, StatusReport};

use super::error::OcrError;

pub const DEFAULT_INFERENCE_URL: &str =
    "https://api-inference.huggingface.co/models/Norm/nougat-latex-base";
pub const DEFAULT_WHOAMI_URL: &str = "https://huggingface.co/api/whoami-v2";

/// Makes the provider hold the request until the model is loaded
const WAIT_FOR_MODEL_HEADER: &str = "X-Wait-For-Model";
/// Provider error text while the model is being provisioned
const PROVISIONING_MARKER: &str = "is currently loading";

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const STATUS_TIMEOUT: Duration = Duration::from_secs(10);
const INFERENCE_TIMEOUT: Duration = Duration::from_secs(60);
/// A provisioning wait can take minutes
const WAIT_FOR_MODEL_TIMEOUT: Duration = Duration::from_secs(300);

/// Where the inference and identity-check requests go.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteEndpoints {
    pub inference_url: String,
    pub whoami_url: String,
}

impl Default for RemoteEndpoints {
    fn default() -> Self {
        Self {
            inference_url: DEFAULT_INFERENCE_URL.to_string(),
            whoami_url: DEFAULT_WHOAMI_URL.to_string(),
        }
    }
}

pub struct RemoteBackend {
    settings: RwLock<Arc<Settings>>,
    api_key: RwLock<SecretString>,
    secrets: Arc<dyn SecretStore>,
    endpoints: RemoteEndpoints,
    http: reqwest::Client,
    notifier: Arc<dyn Notifier>,
}

impl RemoteBackend {
    pub fn new(
        settings: Arc<Settings>,
        secrets: Arc<dyn SecretStore>,
        endpoints: RemoteEndpoints,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        let http = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .unwrap_or_else(|e| {
                warn!("Failed to build HTTP client, using defaults: {}", e);
                reqwest::Client::new()
            });
        let api_key = resolve_api_key(&settings.api_key, secrets.as_ref());

        Self {
            settings: RwLock::new(settings),
            api_key: RwLock::new(api_key),
            secrets,
            endpoints,
            http,
            notifier,
        }
    }

    pub fn poll_intervals(&self) -> PollIntervals {
        PollIntervals::REMOTE
    }

    pub fn settings(&self) -> Arc<Settings> {
        self.settings
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Swap in new settings and resolve the credential again.
    pub fn reload_settings(&self, settings: Arc<Settings>) {
        let api_key = resolve_api_key(&settings.api_key, self.secrets.as_ref());
        *self.api_key.write().unwrap_or_else(|e| e.into_inner()) = api_key;
        *self.settings.write().unwrap_or_else(|e| e.into_inner()) = settings;
    }

    pub async fn load(&self) {
        info!("Inference API backend loaded ({})", self.endpoints.inference_url);
    }

    pub async fn start(&self) {
        debug!("Inference API backend has no server to start");
    }

    pub async fn unload(&self) {
        debug!("Inference API backend unloaded");
    }

    fn api_key(&self) -> SecretString {
        self.api_key
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Credential check against the identity endpoint. Never uploads an image.
    pub async fn status(&self) -> StatusReport {
        let api_key = self.api_key();
        if api_key.expose_secret().is_empty() {
            return StatusReport::new(BackendStatus::Misconfigured, "Api key required");
        }

        let response = self
            .http
            .get(&self.endpoints.whoami_url)
            .bearer_auth(api_key.expose_secret())
            .timeout(STATUS_TIMEOUT)
            .send()
            .await;

        match response {
            Ok(response) if response.status().is_success() => StatusReport::new(
                BackendStatus::Ready,
                "Inference API is ready and accepting images",
            ),
            Ok(response) if is_unauthorized(response.status()) => StatusReport::new(
                BackendStatus::Misconfigured,
                "Unauthorized: check your API key in the settings",
            ),
            Ok(response) => {
                let status = response.status();
                warn!("Identity check returned {}", status);
                StatusReport::new(BackendStatus::Unreachable, status_line(status))
            }
            Err(e) => {
                warn!("Identity check failed: {}", e);
                StatusReport::new(
                    BackendStatus::Unreachable,
                    format!("Inference API unreachable: {}", e),
                )
            }
        }
    }

    pub async fn image_to_latex(&self, path: &Path) -> Result<String, OcrError> {
        let image = validate_image(path)?;
        let api_key = self.api_key();
        if api_key.expose_secret().is_empty() {
            return Err(OcrError::ApiKeyMissing);
        }

        let settings = self.settings();
        let bytes = tokio::fs::read(&image.path).await?;
        let request_id = uuid::Uuid::new_v4();
        self.notifier.notify(Notice::RequestStarted {
            request_id,
            file_name: image.file_name(),
        });

        let result = self.infer(&image, bytes, &api_key, request_id).await;
        self.notifier.notify(Notice::RequestFinished { request_id });

        let latex = result?;
        if settings.debug {
            debug!("Inference API response: {}", latex);
        }
        Ok(wrap_latex(&settings.delimiters, &latex))
    }

    /// One attempt, plus exactly one retry in wait-for-model mode while the
    /// provider provisions the model.
    async fn infer(
        &self,
        image: &ImageFile,
        bytes: Vec<u8>,
        api_key: &SecretString,
        request_id: uuid::Uuid,
    ) -> Result<String, OcrError> {
        match self.post_image(bytes.clone(), api_key, false).await {
            Err(OcrError::Provisioning) => {
                info!("Inference API is provisioning the model, retrying once");
                self.notifier.notify(Notice::WaitingForProvisioning {
                    request_id,
                    file_name: image.file_name(),
                });
                self.post_image(bytes, api_key, true).await
            }
            result => result,
        }
    }

    async fn post_image(
        &self,
        bytes: Vec<u8>,
        api_key: &SecretString,
        wait_for_model: bool,
    ) -> Result<String, OcrError> {
        let mut request = self
            .http
            .post(&self.endpoints.inference_url)
            .bearer_auth(api_key.expose_secret())
            .body(bytes);
        request = if wait_for_model {
            request
                .header(WAIT_FOR_MODEL_HEADER, "true")
                .timeout(WAIT_FOR_MODEL_TIMEOUT)
        } else {
            request.timeout(INFERENCE_TIMEOUT)
        };

        let response = request.send().await.map_err(|e| {
            error!("Inference API request error: {}", e);
            OcrError::Request(e)
        })?;

        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            error!("Inference API error response ({}): {}", status, body);
            return Err(classify_failure(status, &body));
        }

        parse_generated_text(&body)
    }
}

fn is_unauthorized(status: StatusCode) -> bool {
    status == StatusCode::BAD_REQUEST || status == StatusCode::UNAUTHORIZED
}

/// `Got 500: Internal Server Error`
fn status_line(status: StatusCode) -> String {
    format!(
        "Got {}: {}",
        status.as_u16(),
        status.canonical_reason().unwrap_or("Unknown status")
    )
}

/// Map a non-2xx inference reply to an error.
pub fn classify_failure(status: StatusCode, body: &str) -> OcrError {
    let message = error_text(body);
    if status == StatusCode::SERVICE_UNAVAILABLE
        || message
            .as_deref()
            .is_some_and(|m| m.contains(PROVISIONING_MARKER))
    {
        return OcrError::Provisioning;
    }
    if is_unauthorized(status) {
        return OcrError::Unauthorized;
    }
    if status == StatusCode::TOO_MANY_REQUESTS {
        return OcrError::RateLimited(message.unwrap_or_else(|| status_line(status)));
    }
    OcrError::Api {
        status: status.as_u16(),
        message: message.unwrap_or_else(|| {
            status
                .canonical_reason()
                .unwrap_or("Unknown status")
                .to_string()
        }),
    }
}

/// Provider error bodies look like `{"error": "..."}`.
fn error_text(body: &str) -> Option<String> {
    let value: serde_json::Value = serde_json::from_str(body).ok()?;
    value["error"].as_str().map(str::to_string)
}

/// Extract `generated_text` from `[{"generated_text": "..."}]`.
pub fn parse_generated_text(body: &str) -> Result<String, OcrError> {
    let json: serde_json::Value = serde_json::from_str(body)
        .map_err(|e| OcrError::MalformedResponse(format!("{}: {}", e, body)))?;

    let entry = if json.is_array() { &json[0] } else { &json };
    match entry["generated_text"].as_str() {
        Some(latex) if !latex.trim().is_empty() => Ok(latex.to_string()),
        _ => Err(OcrError::MalformedResponse(body.to_string())),
    }
}
