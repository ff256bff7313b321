mod common;

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::routing::{get, post};
use axum::Router;
use common::{write_image, RecordingNotifier};
use latex_ocr_lib::backends::{RemoteBackend, RemoteEndpoints};
use latex_ocr_lib::secret_store::{ApiKeyMaterial, PlaintextStore};
use latex_ocr_lib::{BackendStatus, Notice, OcrError, Settings};

/// In-process stand-in for the hosted inference API.
#[derive(Clone)]
struct Provider {
    inference_calls: Arc<AtomicUsize>,
    whoami_calls: Arc<AtomicUsize>,
    /// Whether each inference call asked to wait for the model
    waited: Arc<Mutex<Vec<bool>>>,
    replies: Arc<Mutex<VecDeque<(StatusCode, &'static str)>>>,
    whoami_status: StatusCode,
}

impl Provider {
    fn new(replies: Vec<(StatusCode, &'static str)>, whoami_status: StatusCode) -> Self {
        Self {
            inference_calls: Arc::new(AtomicUsize::new(0)),
            whoami_calls: Arc::new(AtomicUsize::new(0)),
            waited: Arc::new(Mutex::new(Vec::new())),
            replies: Arc::new(Mutex::new(replies.into())),
            whoami_status,
        }
    }

    async fn serve(&self) -> RemoteEndpoints {
        let app = Router::new()
            .route("/models/test", post(inference))
            .route("/api/whoami-v2", get(whoami))
            .with_state(self.clone());

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr: SocketAddr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        RemoteEndpoints {
            inference_url: format!("http://{}/models/test", addr),
            whoami_url: format!("http://{}/api/whoami-v2", addr),
        }
    }
}

async fn inference(
    State(provider): State<Provider>,
    headers: HeaderMap,
    body: Bytes,
) -> (StatusCode, &'static str) {
    provider.inference_calls.fetch_add(1, Ordering::SeqCst);
    assert_eq!(headers["authorization"], "Bearer hf_test_key");
    assert!(!body.is_empty());
    provider
        .waited
        .lock()
        .unwrap()
        .push(headers.get("x-wait-for-model").is_some_and(|v| v == "true"));
    provider
        .replies
        .lock()
        .unwrap()
        .pop_front()
        .unwrap_or((StatusCode::SERVICE_UNAVAILABLE, r#"{"error": "loading"}"#))
}

async fn whoami(State(provider): State<Provider>, headers: HeaderMap) -> StatusCode {
    provider.whoami_calls.fetch_add(1, Ordering::SeqCst);
    assert_eq!(headers["authorization"], "Bearer hf_test_key");
    provider.whoami_status
}

fn backend(
    api_key: &str,
    endpoints: RemoteEndpoints,
    notifier: Arc<RecordingNotifier>,
) -> RemoteBackend {
    let settings = Settings {
        api_key: ApiKeyMaterial::Plain(api_key.to_string()),
        ..Settings::default()
    };
    RemoteBackend::new(
        Arc::new(settings),
        Arc::new(PlaintextStore),
        endpoints,
        notifier,
    )
}

#[tokio::test]
async fn test_provisioning_is_retried_exactly_once() {
    let provider = Provider::new(
        vec![
            (StatusCode::SERVICE_UNAVAILABLE, r#"{"error": "Model is currently loading"}"#),
            (StatusCode::OK, r#"[{"generated_text": "x^2"}]"#),
        ],
        StatusCode::OK,
    );
    let notifier = Arc::new(RecordingNotifier::default());
    let backend = backend("hf_test_key", provider.serve().await, notifier.clone());
    let dir = tempfile::tempdir().unwrap();
    let image = write_image(dir.path(), "formula.png");

    let latex = backend.image_to_latex(&image).await.unwrap();

    assert_eq!(latex, "$$x^2$$");
    assert_eq!(provider.inference_calls.load(Ordering::SeqCst), 2);
    assert_eq!(*provider.waited.lock().unwrap(), vec![false, true]);

    let notices = notifier.take();
    assert_eq!(notices.len(), 3);
    assert!(matches!(notices[0], Notice::RequestStarted { .. }));
    assert!(matches!(notices[1], Notice::WaitingForProvisioning { .. }));
    assert!(matches!(notices[2], Notice::RequestFinished { .. }));
}

#[tokio::test]
async fn test_second_provisioning_reply_fails() {
    let provider = Provider::new(vec![], StatusCode::OK);
    let notifier = Arc::new(RecordingNotifier::default());
    let backend = backend("hf_test_key", provider.serve().await, notifier.clone());
    let dir = tempfile::tempdir().unwrap();
    let image = write_image(dir.path(), "formula.png");

    let err = backend.image_to_latex(&image).await.unwrap_err();

    assert!(matches!(err, OcrError::Provisioning));
    assert_eq!(provider.inference_calls.load(Ordering::SeqCst), 2);
    // The in-progress notice is always hidden
    assert!(matches!(
        notifier.take().last(),
        Some(Notice::RequestFinished { .. })
    ));
}

#[tokio::test]
async fn test_provider_errors_are_surfaced() {
    let test_cases: Vec<(StatusCode, &'static str, fn(&OcrError) -> bool)> = vec![
        (StatusCode::UNAUTHORIZED, "{}", |e| matches!(e, OcrError::Unauthorized)),
        (StatusCode::BAD_REQUEST, "{}", |e| matches!(e, OcrError::Unauthorized)),
        (StatusCode::TOO_MANY_REQUESTS, r#"{"error": "Rate limit reached"}"#, |e| {
            matches!(e, OcrError::RateLimited(_))
        }),
        (StatusCode::INTERNAL_SERVER_ERROR, "", |e| {
            matches!(e, OcrError::Api { status: 500, .. })
        }),
        (StatusCode::OK, r#"[{"generated_text": ""}]"#, |e| {
            matches!(e, OcrError::MalformedResponse(_))
        }),
    ];

    let dir = tempfile::tempdir().unwrap();
    let image = write_image(dir.path(), "formula.png");
    for (status, body, expected) in test_cases {
        let provider = Provider::new(vec![(status, body)], StatusCode::OK);
        let notifier = Arc::new(RecordingNotifier::default());
        let backend = backend("hf_test_key", provider.serve().await, notifier);

        let err = backend.image_to_latex(&image).await.unwrap_err();
        assert!(expected(&err), "{}: unexpected error {:?}", status, err);
        assert_eq!(provider.inference_calls.load(Ordering::SeqCst), 1);
    }
}

#[tokio::test]
async fn test_empty_key_never_touches_the_network() {
    let provider = Provider::new(vec![], StatusCode::OK);
    let notifier = Arc::new(RecordingNotifier::default());
    let backend = backend("", provider.serve().await, notifier.clone());
    let dir = tempfile::tempdir().unwrap();
    let image = write_image(dir.path(), "formula.png");

    let report = backend.status().await;
    assert_eq!(report.status, BackendStatus::Misconfigured);
    assert_eq!(report.message, "Api key required");

    let err = backend.image_to_latex(&image).await.unwrap_err();
    assert!(matches!(err, OcrError::ApiKeyMissing));

    assert_eq!(provider.whoami_calls.load(Ordering::SeqCst), 0);
    assert_eq!(provider.inference_calls.load(Ordering::SeqCst), 0);
    assert!(notifier.take().is_empty());
}

#[tokio::test]
async fn test_status_from_identity_check() {
    let test_cases = vec![
        (StatusCode::OK, BackendStatus::Ready, None),
        (StatusCode::UNAUTHORIZED, BackendStatus::Misconfigured, None),
        (StatusCode::BAD_REQUEST, BackendStatus::Misconfigured, None),
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            BackendStatus::Unreachable,
            Some("Got 500: Internal Server Error"),
        ),
    ];

    for (whoami_status, expected, message) in test_cases {
        let provider = Provider::new(vec![], whoami_status);
        let notifier = Arc::new(RecordingNotifier::default());
        let backend = backend("hf_test_key", provider.serve().await, notifier);

        let report = backend.status().await;
        assert_eq!(report.status, expected, "{}", whoami_status);
        if let Some(message) = message {
            assert_eq!(report.message, message);
        }
        assert_eq!(provider.whoami_calls.load(Ordering::SeqCst), 1);
        assert_eq!(provider.inference_calls.load(Ordering::SeqCst), 0);
    }
}

#[tokio::test]
async fn test_reload_settings_resolves_new_key() {
    let provider = Provider::new(vec![], StatusCode::OK);
    let notifier = Arc::new(RecordingNotifier::default());
    let backend = backend("", provider.serve().await, notifier);
    assert_eq!(backend.status().await.status, BackendStatus::Misconfigured);

    backend.reload_settings(Arc::new(Settings {
        api_key: ApiKeyMaterial::Plain("hf_test_key".to_string()),
        ..Settings::default()
    }));
    assert_eq!(backend.status().await.status, BackendStatus::Ready);
}

#[tokio::test]
async fn test_unsupported_extension_fails_before_upload() {
    let provider = Provider::new(vec![], StatusCode::OK);
    let notifier = Arc::new(RecordingNotifier::default());
    let backend = backend("hf_test_key", provider.serve().await, notifier);
    let dir = tempfile::tempdir().unwrap();
    let notes = write_image(dir.path(), "notes.txt");

    let err = backend.image_to_latex(&notes).await.unwrap_err();
    assert!(matches!(&err, OcrError::UnsupportedExtension(ext) if ext == ".txt"));
    assert!(err.is_precondition());
    assert_eq!(provider.inference_calls.load(Ordering::SeqCst), 0);
}
