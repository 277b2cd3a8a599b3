//! SC-D70 bridge
//!
//! Forward MIDI from a host input to a Roland SC-D70 over raw USB.

use anyhow::Result;
use clap::Parser;
use parking_lot::Mutex;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use scd70_bridge::cli::{self, ConsoleCommand};
use scd70_bridge::input::{InputProvider, MidirProvider};
use scd70_bridge::observer::{ChannelObserver, StatusEvent, StatusObserver, TracingObserver};
use scd70_bridge::paths::AppPaths;
use scd70_bridge::prefs::{JsonPreferenceStore, PreferenceStore};
use scd70_bridge::usb::RusbBackend;
use scd70_bridge::{AppConfig, Supervisor};

/// SC-D70 Bridge - forward MIDI input to a Roland SC-D70 over USB
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long)]
    config: Option<String>,

    /// Log level (error, warn, info, debug, trace)
    #[arg(short, long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// List available MIDI inputs
    #[arg(long)]
    list_inputs: bool,

    /// List USB devices and highlight the SC-D70
    #[arg(long)]
    list_devices: bool,

    /// MIDI input id to use (saved for next time)
    #[arg(short, long)]
    input: Option<String>,

    /// Run without the interactive console
    #[arg(long)]
    no_console: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load environment variables
    dotenvy::dotenv().ok();

    let args = Args::parse();

    let mut paths = AppPaths::detect();
    if let Some(config) = &args.config {
        paths = paths.with_config(config);
    }
    paths.ensure_directories()?;

    let _log_guard = init_logging(&args.log_level, &paths.logs_dir)?;

    info!("Starting SC-D70 bridge v{}...", env!("CARGO_PKG_VERSION"));
    info!("Configuration file: {}", paths.config.display());

    let config = AppConfig::load_or_default(&paths.config)?;
    let prefs = JsonPreferenceStore::new(&paths.preferences);

    if args.list_inputs {
        let selected = prefs.load().selected_input;
        cli::print_inputs(&MidirProvider::new().list(), selected.as_deref());
        return Ok(());
    }

    if args.list_devices {
        let devices = RusbBackend::new().list_devices()?;
        cli::print_devices(&devices, config.device.vendor_id, config.device.product_id);
        return Ok(());
    }

    if let Some(id) = &args.input {
        let mut saved = prefs.load();
        saved.selected_input = Some(id.clone());
        prefs.save(&saved)?;
        info!("MIDI input set to {}", id);
    }

    let (observer, status_rx) = ChannelObserver::new();
    let supervisor = Supervisor::new(
        config,
        Arc::new(RusbBackend::new()),
        Arc::new(MidirProvider::new()),
        Arc::new(observer),
        Box::new(prefs),
    );

    run_app(Arc::new(Mutex::new(supervisor)), status_rx, !args.no_console).await?;

    info!("SC-D70 bridge shutdown complete");
    Ok(())
}

/// Run `f` against the supervisor off the async runtime; its operations block
async fn with_supervisor<T, F>(supervisor: &Arc<Mutex<Supervisor>>, f: F) -> Result<T>
where
    F: FnOnce(&mut Supervisor) -> T + Send + 'static,
    T: Send + 'static,
{
    let supervisor = Arc::clone(supervisor);
    Ok(tokio::task::spawn_blocking(move || f(&mut supervisor.lock())).await?)
}

async fn run_app(
    supervisor: Arc<Mutex<Supervisor>>,
    mut status_rx: mpsc::UnboundedReceiver<StatusEvent>,
    console: bool,
) -> Result<()> {
    let (command_tx, mut command_rx) = mpsc::unbounded_channel();
    if console {
        cli::spawn_console(command_tx.clone())?;
        println!("{}", cli::HELP);
    }
    // Keeps the channel open when there is no console
    let _command_tx = command_tx;

    // Failures are reported through the observer and retried by tick
    with_supervisor(&supervisor, |s| {
        let _ = s.start();
    })
    .await?;

    let logger = TracingObserver;
    let mut ticker = tokio::time::interval(Duration::from_secs(1));
    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            Some(command) = command_rx.recv() => match command {
                ConsoleCommand::Quit => {
                    info!("Quit requested");
                    break;
                }
                ConsoleCommand::Help => println!("{}", cli::HELP),
                ConsoleCommand::Status => {
                    let report = with_supervisor(&supervisor, |s| s.status()).await?;
                    cli::print_status(&report);
                }
                ConsoleCommand::Inputs => {
                    let (inputs, selected) = with_supervisor(&supervisor, |s| {
                        (s.list_inputs(), s.selected_input().map(str::to_string))
                    })
                    .await?;
                    cli::print_inputs(&inputs, selected.as_deref());
                }
                ConsoleCommand::Bridge(command) => {
                    if let Err(e) = with_supervisor(&supervisor, move |s| s.handle(command)).await? {
                        warn!("{}: {}", e.label(), e);
                    }
                }
            },

            Some(event) = status_rx.recv() => match event {
                StatusEvent::StateChanged { state, detail } => logger.on_state_changed(state, &detail),
                StatusEvent::Heartbeat { event_count } => logger.on_heartbeat(event_count),
            },

            _ = ticker.tick() => {
                with_supervisor(&supervisor, |s| s.tick()).await?;
            }

            _ = &mut shutdown => {
                info!("Shutdown signal received, stopping bridge");
                break;
            }
        }
    }

    info!("Shutting down...");
    with_supervisor(&supervisor, |s| s.shutdown()).await?;
    while let Ok(event) = status_rx.try_recv() {
        if let StatusEvent::StateChanged { state, detail } = event {
            logger.on_state_changed(state, &detail);
        }
    }

    Ok(())
}

fn init_logging(level: &str, logs_dir: &Path) -> Result<WorkerGuard> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));

    let file_appender = tracing_appender::rolling::daily(logs_dir, "bridge.log");
    let (file_writer, guard) = tracing_appender::non_blocking(file_appender);

    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_thread_ids(false)
                .with_thread_names(false),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_thread_names(true)
                .with_writer(file_writer),
        )
        .init();

    Ok(guard)
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("Failed to install Ctrl+C handler: {}", e);
        std::future::pending::<()>().await;
    }
}
