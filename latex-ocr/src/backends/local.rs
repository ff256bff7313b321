//! Local backend: a `latex_ocr_server` process reached over gRPC.
//!
//! State diagram:
//! ```text
//! NotStarted ──start()──> Spawning ──spawned──> Connecting ──channel up──> Loading ──> Ready
//!     │                      │                      │                        │
//!     │                 [spawn error]          [probe deadline]         ["downloading"
//!     │                      ↓                      ↓                  seen in output]
//!     │                 Misconfigured          Unreachable                   ↓
//!     │                (interpreter check      (interpreter ok)          Downloading ──> Ready
//!     └── unload() ◄──── fails) ────────────── any state
//! ```
//!
//! Only the channel probe and the `IsReady` call decide `Ready`/`Loading`.
//! `Downloading` is inferred from the server's output, which is a heuristic:
//! without a download line the status falls back to `Loading`.

use std::path::Path;
use std::process::Stdio;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use latex_ocr_rpc::{LatexOcrClient, RpcError, ServerConfig};
use log::{debug, error, info, warn};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use uuid::Uuid;

use crate::config::Settings;
use crate::image::{validate_image, wrap_latex};
use crate::notice::{Notice, Notifier};
use crate::status::{BackendStatus, PollIntervals, StatusReport};

use super::error::OcrError;

/// Python module providing the server entry point
const SERVER_MODULE: &str = "latex_ocr_server";
/// Oldest server version this client speaks to
const MIN_SERVER_VERSION: (u32, u32, u32) = (0, 1, 0);
/// Case-insensitive marker of model download activity in the server output
const DOWNLOAD_MARKER: &str = "downloading";

/// Deadline of the channel probe and of the readiness call in `status()`
pub const STATUS_PROBE_DEADLINE: Duration = Duration::from_millis(200);
/// Deadline of the interpreter check run from `status()`
const INTERPRETER_CHECK_DEADLINE: Duration = Duration::from_millis(200);
/// The check after a spawn failure only enriches an error message, so it may take longer
const DIAGNOSTIC_DEADLINE: Duration = Duration::from_secs(10);
/// Upper bound for a single `GenerateLatex` call (inference on CPU is slow)
const GENERATE_TIMEOUT: Duration = Duration::from_secs(120);

#[derive(Debug, thiserror::Error)]
pub enum InterpreterError {
    #[error("Couldn't locate python install, please change it in the plugin settings: {0}")]
    NotFound(String),
    #[error("latex_ocr_server isn't installed for {0}")]
    PackageMissing(String),
    #[error("Interpreter check did not finish within {}ms", .0.as_millis())]
    Timeout(Duration),
    #[error("Failed to run {path}: {source}")]
    Spawn {
        path: String,
        source: std::io::Error,
    },
}

struct ServerProcess {
    child: Child,
    pid: Option<u32>,
}

struct RpcHandle {
    port: u16,
    client: LatexOcrClient,
}

pub struct LocalBackend {
    settings: RwLock<Arc<Settings>>,
    rpc: Mutex<Option<RpcHandle>>,
    server: Mutex<Option<ServerProcess>>,
    /// Most recent output line mentioning a download
    last_download_update: Arc<Mutex<Option<String>>>,
    notifier: Arc<dyn Notifier>,
}

impl LocalBackend {
    pub fn new(settings: Arc<Settings>, notifier: Arc<dyn Notifier>) -> Self {
        Self {
            settings: RwLock::new(settings),
            rpc: Mutex::new(None),
            server: Mutex::new(None),
            last_download_update: Arc::new(Mutex::new(None)),
            notifier,
        }
    }

    pub fn poll_intervals(&self) -> PollIntervals {
        PollIntervals::LOCAL
    }

    pub fn settings(&self) -> Arc<Settings> {
        self.settings
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn reload_settings(&self, settings: Arc<Settings>) {
        *self.settings.write().unwrap_or_else(|e| e.into_inner()) = settings;
    }

    /// Open the RPC channel handle. Does not wait for the server.
    ///
    /// Reopens the channel if the configured port changed since the last load.
    pub async fn load(&self) {
        let port = self.settings().port;
        let mut rpc = self.rpc.lock().unwrap_or_else(|e| e.into_inner());
        if rpc.as_ref().is_some_and(|handle| handle.port == port) {
            return;
        }

        info!("Initializing RPC client at port {}", port);
        match LatexOcrClient::connect_lazy(port) {
            Ok(client) => *rpc = Some(RpcHandle { port, client }),
            Err(e) => error!("Failed to initialize RPC client: {}", e),
        }
    }

    /// Spawn the server process.
    ///
    /// A server started earlier by this backend is stopped first, so at most
    /// one process is ever alive. Failures are reported through the notifier.
    pub async fn start(&self) {
        if self.is_running() {
            warn!("latex_ocr_server already running, restarting it");
            self.unload().await;
        }

        let settings = self.settings();
        info!("Starting local latex_ocr_server");
        *self
            .last_download_update
            .lock()
            .unwrap_or_else(|e| e.into_inner()) = None;

        match self.spawn_server(&settings) {
            Ok(process) => {
                info!("latex_ocr_server spawned (pid {:?})", process.pid);
                let previous = self
                    .server
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .replace(process);
                // A concurrent start() won the race; never leave its process unmanaged
                if let Some(previous) = previous {
                    warn!("Stopping overlapping server (pid {:?})", previous.pid);
                    stop_in_background(previous);
                }
            }
            Err(e) => {
                error!("Failed to start latex_ocr_server: {}", e);
                let diagnostic = check_interpreter(&settings, DIAGNOSTIC_DEADLINE)
                    .await
                    .err()
                    .map(|check_err| {
                        error!("Interpreter check failed: {}", check_err);
                        check_err.to_string()
                    });
                self.notifier.notify(Notice::ServerStartFailed {
                    error: e.to_string(),
                    diagnostic,
                });
            }
        }
    }

    /// Kill the server process, if any, and drop the RPC channel.
    /// Safe to call repeatedly or before `start()`.
    pub async fn unload(&self) {
        self.rpc.lock().unwrap_or_else(|e| e.into_inner()).take();

        let process = self.server.lock().unwrap_or_else(|e| e.into_inner()).take();
        let Some(mut process) = process else {
            debug!("No latex_ocr_server process to stop");
            return;
        };

        info!("Stopping latex_ocr_server (pid {:?})", process.pid);
        if let Err(e) = process.child.kill().await {
            warn!("Failed to kill latex_ocr_server: {}", e);
        }
    }

    /// Whether a process started by this backend is still alive.
    pub fn is_running(&self) -> bool {
        let mut server = self.server.lock().unwrap_or_else(|e| e.into_inner());
        match server.as_mut().map(|p| p.child.try_wait()) {
            Some(Ok(None)) => true,
            Some(Ok(Some(exit))) => {
                info!("latex_ocr_server: closed ({})", exit);
                server.take();
                false
            }
            Some(Err(e)) => {
                warn!("Failed to poll latex_ocr_server: {}", e);
                true
            }
            None => false,
        }
    }

    pub fn process_id(&self) -> Option<u32> {
        if !self.is_running() {
            return None;
        }
        self.server
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .and_then(|p| p.pid)
    }

    /// Latest download progress line seen in the server output.
    pub fn last_download_update(&self) -> Option<String> {
        self.last_download_update
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// One bounded probe; resolves within roughly twice [`STATUS_PROBE_DEADLINE`].
    pub async fn status(&self) -> StatusReport {
        let settings = self.settings();
        // Logs and forgets a process that exited on its own
        self.is_running();

        let mut client = match LatexOcrClient::connect(settings.port, STATUS_PROBE_DEADLINE).await
        {
            Ok(client) => client,
            Err(e) => {
                debug!("Channel probe failed: {}", e);
                return self.diagnose_unreachable(&settings).await;
            }
        };

        match tokio::time::timeout(STATUS_PROBE_DEADLINE, client.is_ready()).await {
            Ok(Ok(true)) => StatusReport::new(BackendStatus::Ready, "Server ready"),
            Ok(reply) => {
                if let Err(e) = reply {
                    debug!("IsReady failed: {}", e);
                }
                match self.last_download_update() {
                    Some(update) => StatusReport::new(
                        BackendStatus::Downloading,
                        format!("The server is still downloading the model: {}", update),
                    ),
                    None => StatusReport::new(
                        BackendStatus::Loading,
                        "The server is still loading the model",
                    ),
                }
            }
            Err(_) => StatusReport::new(
                BackendStatus::Unreachable,
                format!(
                    "The server didn't answer the readiness check before the deadline ({}ms)",
                    STATUS_PROBE_DEADLINE.as_millis()
                ),
            ),
        }
    }

    /// The channel is down: blame the environment if the interpreter check
    /// fails, otherwise the server is just not up (yet).
    async fn diagnose_unreachable(&self, settings: &Settings) -> StatusReport {
        match check_interpreter(settings, INTERPRETER_CHECK_DEADLINE).await {
            Ok(_) | Err(InterpreterError::Timeout(_)) => StatusReport::new(
                BackendStatus::Unreachable,
                format!(
                    "The server wasn't reachable before the deadline ({}ms)",
                    STATUS_PROBE_DEADLINE.as_millis()
                ),
            ),
            Err(e) => StatusReport::new(BackendStatus::Misconfigured, e.to_string()),
        }
    }

    pub async fn image_to_latex(&self, path: &Path) -> Result<String, OcrError> {
        let image = validate_image(path)?;
        let settings = self.settings();
        if settings.debug {
            debug!("Processing image at path: {:?} ({} bytes)", path, image.size_bytes);
        }

        let report = self.status().await;
        if !report.is_ready() {
            return Err(OcrError::NotReady {
                status: report.status,
                message: report.message,
            });
        }

        let mut client = self.client().await?;
        let image_path = std::fs::canonicalize(&image.path).unwrap_or(image.path.clone());
        let request_id = Uuid::new_v4();
        self.notifier.notify(Notice::RequestStarted {
            request_id,
            file_name: image.file_name(),
        });

        if settings.debug {
            debug!("Sending GenerateLatex request with imagePath: {:?}", image_path);
        }
        let result = tokio::time::timeout(
            GENERATE_TIMEOUT,
            client.generate_latex(&image_path.to_string_lossy()),
        )
        .await
        .unwrap_or(Err(RpcError::Timeout(GENERATE_TIMEOUT)));
        self.notifier.notify(Notice::RequestFinished { request_id });

        let latex = result?;
        if settings.debug {
            debug!("latex_ocr_server response: {}", latex);
        }
        latex_from_reply(latex, &settings.delimiters)
    }

    /// `GetConfig`: device and cache directory the server actually uses.
    pub async fn server_config(&self) -> Result<ServerConfig, OcrError> {
        let mut client = self.client().await?;
        let config = tokio::time::timeout(STATUS_PROBE_DEADLINE, client.get_config())
            .await
            .unwrap_or(Err(RpcError::Timeout(STATUS_PROBE_DEADLINE)))?;
        Ok(config)
    }

    async fn client(&self) -> Result<LatexOcrClient, OcrError> {
        self.load().await;
        self.rpc
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .map(|handle| handle.client.clone())
            .ok_or_else(|| OcrError::NotReady {
                status: BackendStatus::Misconfigured,
                message: format!("Invalid server port {}", self.settings().port),
            })
    }

    fn spawn_server(&self, settings: &Settings) -> std::io::Result<ServerProcess> {
        let args = server_args(settings);
        if settings.debug {
            debug!(
                "Starting server with the following command: {} {}",
                settings.python_path,
                args.join(" ")
            );
        }

        let mut child = Command::new(&settings.python_path)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        if let Some(stdout) = child.stdout.take() {
            watch_output(stdout, "stdout", self.last_download_update.clone(), settings.debug);
        }
        if let Some(stderr) = child.stderr.take() {
            watch_output(stderr, "stderr", self.last_download_update.clone(), settings.debug);
        }

        let pid = child.id();
        Ok(ServerProcess { child, pid })
    }
}

/// Command line of the server process.
pub fn server_args(settings: &Settings) -> Vec<String> {
    let mut args = vec![
        "-m".to_string(),
        SERVER_MODULE.to_string(),
        "start".to_string(),
        "-d".to_string(),
        "--port".to_string(),
        settings.port.to_string(),
    ];
    if !settings.cache_dir.as_os_str().is_empty() {
        args.push("--cache_dir".to_string());
        args.push(settings.cache_dir.to_string_lossy().to_string());
    }
    args
}

/// Wrap a `GenerateLatex` reply. An empty reply is an error, never an empty formula.
pub fn latex_from_reply(latex: String, delimiter: &str) -> Result<String, OcrError> {
    if latex.trim().is_empty() {
        return Err(OcrError::MalformedResponse(format!("{:?}", latex)));
    }
    Ok(wrap_latex(delimiter, &latex))
}

/// Check that the interpreter runs and has the server package.
///
/// Returns the reported server version, if it could be parsed.
pub async fn check_interpreter(
    settings: &Settings,
    deadline: Duration,
) -> Result<Option<String>, InterpreterError> {
    let python = settings.python_path.clone();
    let output = Command::new(&python)
        .args(["-m", SERVER_MODULE, "--version"])
        .stdin(Stdio::null())
        .kill_on_drop(true)
        .output();

    let output = match tokio::time::timeout(deadline, output).await {
        Err(_) => return Err(InterpreterError::Timeout(deadline)),
        Ok(Err(e)) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(InterpreterError::NotFound(python))
        }
        Ok(Err(source)) => return Err(InterpreterError::Spawn { path: python, source }),
        Ok(Ok(output)) => output,
    };

    if settings.debug && !output.stderr.is_empty() {
        debug!("{}", String::from_utf8_lossy(&output.stderr));
    }
    if !output.status.success() {
        return Err(InterpreterError::PackageMissing(python));
    }

    let stdout = String::from_utf8_lossy(&output.stdout);
    let version = stdout.split_whitespace().nth(1).map(str::to_string);
    match version.as_deref().and_then(parse_version) {
        Some(found) if found < MIN_SERVER_VERSION => warn!(
            "latex_ocr_server {} is older than the supported minimum {:?}",
            stdout.trim(),
            MIN_SERVER_VERSION
        ),
        Some(_) => debug!("{} (min version: {:?})", stdout.trim(), MIN_SERVER_VERSION),
        None => debug!("Unrecognized version output: {:?}", stdout.trim()),
    }
    Ok(version)
}

fn parse_version(version: &str) -> Option<(u32, u32, u32)> {
    let mut parts = version.trim().split('.').map(|p| p.parse::<u32>().ok());
    Some((parts.next()??, parts.next()??, parts.next().flatten().unwrap_or(0)))
}

fn stop_in_background(mut process: ServerProcess) {
    if let Err(e) = process.child.start_kill() {
        warn!("Failed to kill latex_ocr_server: {}", e);
    }
    tokio::spawn(async move {
        let _ = process.child.wait().await;
    });
}

/// Splits process output into lines on `\n` and `\r`, so progress bars
/// that redraw with carriage returns still yield one line per update.
///
/// Buffers raw bytes and decodes whole lines, so a character split across
/// two reads survives.
#[derive(Debug, Default)]
pub struct LineSplitter {
    partial: Vec<u8>,
}

impl LineSplitter {
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.partial.extend_from_slice(chunk);
        let mut lines = Vec::new();
        while let Some(pos) = self.partial.iter().position(|b| matches!(b, b'\n' | b'\r')) {
            let line: Vec<u8> = self.partial.drain(..=pos).collect();
            if let Some(line) = decode_line(&line[..pos]) {
                lines.push(line);
            }
        }
        lines
    }

    pub fn finish(&mut self) -> Option<String> {
        let rest = std::mem::take(&mut self.partial);
        decode_line(&rest)
    }
}

fn decode_line(bytes: &[u8]) -> Option<String> {
    let line = String::from_utf8_lossy(bytes);
    (!line.trim().is_empty()).then(|| line.into_owned())
}

pub fn is_download_line(line: &str) -> bool {
    line.to_lowercase().contains(DOWNLOAD_MARKER)
}

fn watch_output<R>(
    mut reader: R,
    stream: &'static str,
    last_download_update: Arc<Mutex<Option<String>>>,
    verbose: bool,
) where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut splitter = LineSplitter::default();
        let mut buf = [0u8; 4096];
        loop {
            let (lines, eof) = match reader.read(&mut buf).await {
                Ok(0) | Err(_) => (splitter.finish().into_iter().collect(), true),
                Ok(n) => (splitter.push(&buf[..n]), false),
            };
            for line in &lines {
                if is_download_line(line) {
                    *last_download_update
                        .lock()
                        .unwrap_or_else(|e| e.into_inner()) = Some(line.trim().to_string());
                }
                if verbose {
                    debug!("latex_ocr_server ({}): {}", stream, line);
                }
            }
            if eof {
                break;
            }
        }
        debug!("latex_ocr_server {} closed", stream);
    });
}
