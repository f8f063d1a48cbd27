//! Keyward - local credential broker for LLM applications.
//!
//! One daemon per user:
//! - HTTP API on the loopback interface (registration, dashboard, gateway)
//! - Service descriptor so clients can find the running instance
//! - Optional autostart at login

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use keyward_core::auth::{local_username, AuthManager};
use keyward_core::discovery::{default_data_dir, Detection, Discovery, ROOT_ENV};
use keyward_core::external::{ExternalUi, HeadlessUi, ServiceInstaller, SystemBrowser};
use keyward_server::{AppState, Server, ServerConfig, DEFAULT_PORT, DEFAULT_UI_URL};
use keyward_storage::{Database, DB_FILE};
use keyward_app::Autostart;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Keyward - local credential broker for LLM applications
#[derive(Parser, Debug)]
#[command(name = "keyward", version, about)]
struct Args {
    #[command(subcommand)]
    command: Option<Command>,

    /// Enable debug logging
    #[arg(long, global = true)]
    debug: bool,

    /// Set log level (error, warn, info, debug, trace)
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    /// Port for the local API
    #[arg(long, global = true, env = "KEYWARD_PORT", default_value_t = DEFAULT_PORT)]
    port: u16,

    /// Data directory (database, service descriptor, logs)
    #[arg(long, global = true, env = ROOT_ENV)]
    data_dir: Option<PathBuf>,

    /// Base URL of the dashboard UI
    #[arg(long, global = true, env = "KEYWARD_UI_URL", default_value = DEFAULT_UI_URL)]
    ui_url: String,

    /// Seconds to wait for a consent decision (5-60)
    #[arg(long, global = true, default_value_t = 60)]
    consent_timeout: u64,

    /// Log consent and dashboard URLs instead of opening a browser
    #[arg(long, global = true, env = "KEYWARD_NO_BROWSER")]
    no_browser: bool,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
enum Command {
    /// Run the daemon (default)
    Run {
        /// Started by autostart; log to file only
        #[arg(long)]
        background: bool,
    },
    /// Start at login and launch the daemon now
    Install,
    /// Stop starting at login
    Uninstall,
    /// Show the service descriptor and whether the daemon answers
    Status,
    /// Print the version
    Version,
}

impl Args {
    fn command(&self) -> Command {
        self.command
            .clone()
            .unwrap_or(Command::Run { background: false })
    }

    fn data_dir(&self) -> anyhow::Result<PathBuf> {
        match &self.data_dir {
            Some(dir) => Ok(dir.clone()),
            None => default_data_dir().context("resolving data directory"),
        }
    }

    fn server_config(&self) -> ServerConfig {
        ServerConfig::default()
            .with_port(self.port)
            .with_ui_url(&self.ui_url)
            .with_consent_timeout(Duration::from_secs(self.consent_timeout))
    }

    fn external_ui(&self) -> Arc<dyn ExternalUi> {
        if self.no_browser {
            Arc::new(HeadlessUi::new())
        } else {
            Arc::new(SystemBrowser)
        }
    }

    fn console_logging(&self) -> bool {
        self.debug || !matches!(self.command(), Command::Run { background: true })
    }
}

/// Initialize logging with file rotation under `<data dir>/logs`.
fn init_logging(args: &Args, data_dir: &Path) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let log_level = if args.debug { "debug" } else { &args.log_level };

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!(
            "keyward={level},keyward_app={level},keyward_core={level},keyward_server={level},\
             keyward_proxy={level},keyward_storage={level},warn",
            level = log_level
        ))
    });

    let log_dir = data_dir.join("logs");
    if std::fs::create_dir_all(&log_dir).is_ok() {
        let file_appender = RollingFileAppender::builder()
            .rotation(Rotation::DAILY)
            .max_log_files(5)
            .filename_prefix("keyward")
            .filename_suffix("log")
            .build(&log_dir)
            .ok();

        if let Some(appender) = file_appender {
            let (non_blocking, guard) = tracing_appender::non_blocking(appender);

            if args.console_logging() {
                tracing_subscriber::registry()
                    .with(env_filter)
                    .with(fmt::layer().with_writer(std::io::stderr))
                    .with(fmt::layer().with_writer(non_blocking).with_ansi(false))
                    .init();
            } else {
                tracing_subscriber::registry()
                    .with(env_filter)
                    .with(fmt::layer().with_writer(non_blocking).with_ansi(false))
                    .init();
            }

            tracing::info!("Logging to {:?}", log_dir);
            return Some(guard);
        }
    }

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .init();

    tracing::warn!("File logging unavailable, using console only");
    None
}

/// Resolves on Ctrl-C, or SIGTERM on Unix.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::warn!("Ctrl-C handler unavailable: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::warn!("SIGTERM handler unavailable: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("Shutdown signal received");
}

/// Run the daemon unless another instance already serves this user.
async fn run_daemon(args: &Args, data_dir: &Path) -> anyhow::Result<()> {
    let discovery = Discovery::in_dir(data_dir)?;
    if let Detection::Active(url) = discovery.claim_or_detect().await {
        println!("Keyward is already running at {url}");
        return Ok(());
    }

    let db = Database::with_path(data_dir.join(DB_FILE)).context("opening database")?;

    let config = args.server_config();
    let local_url = config.local_url();
    let auth = AuthManager::new(local_username());
    let state = AppState::new(config.clone(), db, auth, args.external_ui())?;
    let server = Server::with_state(config, state)?;

    let listener = match server.bind() {
        Ok(listener) => listener,
        Err(e) => {
            if e.is_addr_in_use() && discovery.probe(&local_url).await {
                tracing::info!("Another instance won the port at {}", local_url);
                println!("Keyward is already running at {local_url}");
                return Ok(());
            }
            return Err(e.into());
        }
    };

    if let Err(e) = discovery.announce(&local_url) {
        tracing::warn!("Failed to write service descriptor: {}", e);
    }

    let result = server.serve(listener, shutdown_signal()).await;

    if let Err(e) = discovery.retire() {
        tracing::warn!("Failed to retire service descriptor: {}", e);
    }

    result.map_err(Into::into)
}

async fn install(data_dir: &Path) -> anyhow::Result<()> {
    let autostart = Autostart::new()?;
    autostart.elevated_install()?;
    println!("Autostart enabled: {}", autostart.command());

    let discovery = Discovery::in_dir(data_dir)?;
    match discovery.claim_or_detect().await {
        Detection::Active(url) => println!("Keyward is already running at {url}"),
        Detection::ShouldStart => {
            autostart.launch_persistent_process()?;
            println!("Keyward started in the background");
        }
    }
    Ok(())
}

fn uninstall() -> anyhow::Result<()> {
    let autostart = Autostart::new()?;
    autostart.uninstall()?;
    println!("Autostart disabled");
    Ok(())
}

async fn status(data_dir: &Path) -> anyhow::Result<()> {
    let discovery = Discovery::in_dir(data_dir)?;

    let Some(record) = discovery.read() else {
        println!("No service descriptor at {}", discovery.path().display());
        return Ok(());
    };
    println!("{}", serde_json::to_string_pretty(&record)?);

    match record.url.as_deref().filter(|u| !u.is_empty()) {
        Some(url) if discovery.probe(url).await => println!("running at {url}"),
        Some(url) => println!("not answering at {url}"),
        None => println!("stopped"),
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    if args.command() == Command::Version {
        println!("keyward {}", keyward_core::VERSION);
        return Ok(());
    }

    let data_dir = args.data_dir()?;

    // Keep the guard alive for the duration of the program
    let _log_guard = init_logging(&args, &data_dir);

    tracing::debug!("Args: {:?}", args);

    match args.command() {
        Command::Run { background } => {
            tracing::info!(background, "Starting Keyward {}", keyward_core::VERSION);
            run_daemon(&args, &data_dir).await?;
            tracing::info!("Keyward shutting down");
        }
        Command::Install => install(&data_dir).await?,
        Command::Uninstall => uninstall()?,
        Command::Status => status(&data_dir).await?,
        Command::Version => {}
    }

    Ok(())
}
