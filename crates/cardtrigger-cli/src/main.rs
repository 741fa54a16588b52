//! `cardtrigger`: run configured actions when smartcards come and go.
//!
//! ```text
//! cardtrigger --config /etc/cardtrigger.toml
//! cardtrigger --config /etc/cardtrigger.toml --check
//! ```
//!
//! Card monitoring needs the `hardware-pcsc` feature. Without it only
//! `--check` is available.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use cardtrigger_actions::{ActionCatalog, ActionDispatcher, ExecutionMode};
use cardtrigger_core::CardTriggerConfig;
use clap::Parser;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "cardtrigger")]
#[command(about = "Run actions when smartcards are inserted or removed")]
#[command(version)]
struct Args {
    /// Path to the configuration file
    #[arg(short, long, default_value = "cardtrigger.toml")]
    config: PathBuf,

    /// Log filter used when RUST_LOG is not set
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Validate the configuration and exit
    #[arg(long)]
    check: bool,
}

fn main() -> Result<ExitCode> {
    let args = Args::parse();

    // RUST_LOG wins over --log-level; an invalid filter falls back to info.
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&args.log_level))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    let config = CardTriggerConfig::from_file(&args.config)
        .with_context(|| format!("failed to load {}", args.config.display()))?;
    let catalog = Arc::new(ActionCatalog::with_builtin_actions().context("failed to build action catalog")?);
    let dispatcher = ActionDispatcher::new(config.policy.clone(), Arc::clone(&catalog))
        .context("invalid certificate policy")?
        .with_mode(ExecutionMode::from_background(config.monitor.background_execution));

    if args.check {
        print_summary(&config, &catalog);
        return Ok(ExitCode::SUCCESS);
    }

    run(config, dispatcher)
}

fn print_summary(config: &CardTriggerConfig, catalog: &ActionCatalog) {
    println!("Configuration OK");
    println!("  actions available: {}", catalog.ids().join(", "));
    println!("  card types: {}", config.card_types.patterns().len());
    for entry in config.policy.entries() {
        println!("  {}", entry.subject());
        for action in entry.actions() {
            let pin = if action.require_pin() { ", PIN" } else { "" };
            println!("    on {} -> {}{pin}", action.on(), action.target());
        }
    }
}

#[cfg(not(feature = "hardware-pcsc"))]
fn run(_config: CardTriggerConfig, _dispatcher: ActionDispatcher) -> Result<ExitCode> {
    anyhow::bail!("built without the hardware-pcsc feature, only --check is supported")
}

#[cfg(feature = "hardware-pcsc")]
fn run(config: CardTriggerConfig, dispatcher: ActionDispatcher) -> Result<ExitCode> {
    use cardtrigger_hardware::{PcscSubsystem, TrackerConfig};

    let runtime = tokio::runtime::Runtime::new().context("failed to create Tokio runtime")?;
    let subsystem = Arc::new(PcscSubsystem::new(config.card_types.clone()));
    let result = runtime.block_on(daemon::serve(
        subsystem,
        TrackerConfig::from(&config.monitor),
        dispatcher,
    ));

    // A PIN prompt may still be blocked on the terminal.
    runtime.shutdown_background();
    result
}

#[cfg(feature = "hardware-pcsc")]
mod daemon {
    use std::io::{self, BufRead, Write};
    use std::process::ExitCode;
    use std::sync::Arc;

    use anyhow::{Context, Result};
    use cardtrigger_actions::{ActionDispatcher, PinHandoff, PinRequest, PinRequests};
    use cardtrigger_hardware::{CardSubsystem, ReaderStateTracker, TrackerConfig};
    use secrecy::SecretString;
    use tokio::task;
    use tokio_util::sync::CancellationToken;
    use tracing::{error, info, warn};

    /// Monitor readers until Ctrl-C or a fatal monitor error.
    pub async fn serve<S: CardSubsystem>(
        subsystem: Arc<S>,
        config: TrackerConfig,
        dispatcher: ActionDispatcher,
    ) -> Result<ExitCode> {
        let (pins, requests) = PinHandoff::new();
        let dispatcher = dispatcher.with_pin_handoff(pins);
        let prompts = tokio::spawn(serve_pins(requests));

        let mut tracker =
            ReaderStateTracker::new(subsystem, config).context("failed to open the smartcard subsystem")?;
        info!(readers = ?tracker.readers(), "Smartcard subsystem ready");

        // Cards already present are handled while starting, which can block
        // on a PIN prompt.
        let shutdown = CancellationToken::new();
        let token = shutdown.clone();
        let (mut tracker, started) = task::spawn_blocking(move || {
            let started = tracker.start_monitoring(&token, dispatcher);
            (tracker, started)
        })
        .await
        .context("monitor start task failed")?;
        started.context("failed to start monitoring")?;

        let exit = tracker.exit_signal();
        let interrupted = tokio::select! {
            signal = tokio::signal::ctrl_c() => {
                if let Err(e) = signal {
                    warn!(error = %e, "Failed to listen for Ctrl-C");
                }
                info!("Shutting down");
                true
            }
            () = exit.cancelled() => false,
        };

        shutdown.cancel();
        prompts.abort();
        let stopped = task::spawn_blocking(move || tracker.stop_monitoring())
            .await
            .context("monitor stop task failed")?;

        match stopped {
            Ok(()) if interrupted => Ok(ExitCode::SUCCESS),
            Ok(()) => {
                error!("Monitoring stopped unexpectedly");
                Ok(ExitCode::FAILURE)
            }
            Err(e) => {
                error!(error = %e, "Monitoring failed");
                Ok(ExitCode::FAILURE)
            }
        }
    }

    async fn serve_pins(mut requests: PinRequests) {
        while let Some(request) = requests.recv().await {
            answer(request).await;
        }
    }

    async fn answer(request: PinRequest) {
        let reader = request.reader().to_string();
        match task::spawn_blocking(move || prompt(&reader)).await {
            Ok(Ok(Some(pin))) => {
                if !request.supply_pin(pin) {
                    warn!("PIN arrived after the request was abandoned");
                }
            }
            Ok(Ok(None)) => {
                info!(reader = %request.reader(), "PIN entry declined");
                request.cancel();
            }
            Ok(Err(e)) => {
                warn!(error = %e, "Failed to read PIN");
                request.cancel();
            }
            Err(e) => {
                warn!(error = %e, "PIN prompt task failed");
                request.cancel();
            }
        }
    }

    /// Prompt on the terminal. An empty line declines.
    fn prompt(reader: &str) -> io::Result<Option<SecretString>> {
        let mut stderr = io::stderr().lock();
        write!(stderr, "PIN for card in {reader} (empty to skip): ")?;
        stderr.flush()?;

        let mut line = String::new();
        io::stdin().lock().read_line(&mut line)?;
        let pin = line.trim_end_matches(['\r', '\n']);
        if pin.is_empty() {
            return Ok(None);
        }
        Ok(Some(SecretString::from(pin.to_string())))
    }
}
