//! Headless host for the LatexOCR coordinator.

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use latex_ocr_lib::backends::{BackendDeps, RemoteEndpoints};
use latex_ocr_lib::config::{load_settings, ConfigKey, ConfigStore, JsonFileStore, Settings};
use latex_ocr_lib::secret_store::KeyringStore;
use latex_ocr_lib::{logging, BackendStatus, Error, LatexOcr, LogDisplay, LogNotifier};
use log::{error, info};

#[derive(Parser, Debug)]
#[command(name = "latex-ocr")]
#[command(about = "Convert formula images to LaTeX with a local server or the inference API")]
#[command(version)]
struct Cli {
    /// Settings file (JSON)
    #[arg(long, short = 'c', default_value = "latex-ocr.json", env = "LATEX_OCR_CONFIG")]
    config: PathBuf,

    #[command(flatten)]
    overrides: Overrides,

    #[command(subcommand)]
    command: Command,
}

/// One-off overrides of the stored settings. Never persisted.
#[derive(Args, Debug)]
struct Overrides {
    /// Use the local latex_ocr_server
    #[arg(long, conflicts_with = "remote")]
    local: bool,

    /// Use the hosted inference API
    #[arg(long)]
    remote: bool,

    /// Python interpreter with latex_ocr_server installed
    #[arg(long, env = "LATEX_OCR_PYTHON")]
    python: Option<String>,

    /// Port of the local server
    #[arg(long)]
    port: Option<u16>,

    /// Verbose logging of requests and server output
    #[arg(long)]
    debug: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print the LaTeX of each image
    Convert {
        #[arg(required = true)]
        images: Vec<PathBuf>,

        /// Seconds to wait for the backend to become ready
        #[arg(long, default_value = "60")]
        wait: u64,
    },
    /// Print the backend status once
    Status {
        /// Print the report as JSON
        #[arg(long)]
        json: bool,
    },
    /// Follow the backend status until Ctrl-C
    Watch,
    /// Store the inference API key
    SetKey {
        #[arg(env = "LATEX_OCR_API_KEY", hide_env_values = true)]
        key: String,
    },
    /// Run the local server until Ctrl-C
    Serve,
}

impl Overrides {
    fn apply(&self, settings: &mut Settings) {
        if self.local {
            settings.use_local_model = true;
        }
        if self.remote {
            settings.use_local_model = false;
        }
        if let Some(python) = &self.python {
            settings.python_path = python.clone();
        }
        if let Some(port) = self.port {
            settings.port = port;
        }
        settings.debug |= self.debug;
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    logging::init(cli.overrides.debug);

    match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            error!("{:?}", e);
            eprintln!("⚠️ {}", e.user_message());
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<ExitCode, Error> {
    let store = JsonFileStore::open(&cli.config)?;
    let mut stored = load_settings(&store);
    let data_dir = settings_dir(store.path());
    if stored.resolve_cache_dir(&data_dir) {
        store.set(&ConfigKey::SETTINGS, stored.clone())?;
    }

    let mut settings = stored.clone();
    cli.overrides.apply(&mut settings);
    if matches!(cli.command, Command::Status { .. } | Command::SetKey { .. }) {
        settings.start_server_on_load = false;
    }
    if matches!(cli.command, Command::Serve) {
        settings.use_local_model = true;
        settings.start_server_on_load = true;
    }

    let deps = BackendDeps {
        notifier: Arc::new(LogNotifier),
        secrets: Arc::new(KeyringStore),
        endpoints: RemoteEndpoints::default(),
    };
    let ocr = LatexOcr::new(settings, deps, Arc::new(LogDisplay::default())).await;

    // Errors must not skip the shutdown, which stops the local server
    let result = execute(&ocr, cli.command, &store, stored).await;
    ocr.shutdown().await;
    result
}

async fn execute(
    ocr: &LatexOcr,
    command: Command,
    store: &JsonFileStore,
    mut stored: Settings,
) -> Result<ExitCode, Error> {
    match command {
        Command::Convert { images, wait } => convert(ocr, &images, Duration::from_secs(wait)).await,
        Command::Status { json } => {
            if json {
                let report = ocr.status().await;
                println!("{}", serde_json::to_string_pretty(&report).map_err(std::io::Error::from)?);
            } else {
                println!("{}", ocr.check_status().await);
            }
            Ok(ExitCode::SUCCESS)
        }
        Command::Watch | Command::Serve => {
            tokio::signal::ctrl_c().await?;
            info!("Interrupted");
            Ok(ExitCode::SUCCESS)
        }
        Command::SetKey { key } => {
            let updated = ocr.set_api_key(key.trim()).await;
            // Only the key changes on disk; overrides stay one-off
            stored.api_key = updated.api_key;
            stored.obfuscated_key = updated.obfuscated_key;
            store.set(&ConfigKey::SETTINGS, stored)?;
            println!("🔧 Api key saved");
            Ok(ExitCode::SUCCESS)
        }
    }
}

async fn convert(ocr: &LatexOcr, images: &[PathBuf], wait: Duration) -> Result<ExitCode, Error> {
    wait_until_ready(ocr, wait).await;

    let mut failed = false;
    for image in images {
        match ocr.image_to_latex(image).await {
            Ok(latex) => println!("{}", latex),
            Err(e) => {
                failed = true;
                error!("{}: {}", image.display(), e);
                eprintln!("⚠️ {}: {}", image.display(), e.user_message());
            }
        }
    }

    Ok(if failed {
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    })
}

/// Poll until the backend is ready, it needs configuration, or `wait` runs out.
async fn wait_until_ready(ocr: &LatexOcr, wait: Duration) {
    let deadline = tokio::time::Instant::now() + wait;
    loop {
        let report = ocr.status().await;
        if report.is_ready() || report.status == BackendStatus::Misconfigured {
            return;
        }
        if tokio::time::Instant::now() >= deadline {
            return;
        }
        info!("{} {}", report.status.indicator_text(), report.message);
        tokio::time::sleep(Duration::from_millis(500)).await;
    }
}

fn settings_dir(config_path: &Path) -> PathBuf {
    match config_path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    }
}
