/*
[INPUT]:  CLI arguments, YAML configuration file, OS shutdown signals
[OUTPUT]: Running gateway sessions with graceful shutdown; process exit code
[POS]:    Binary entry point
[UPDATE]: When changing CLI flags, startup flow, or shutdown handling
*/

mod cli;

use anyhow::{Context, Result, anyhow};
use clap::Parser;
use std::path::Path;
use std::process::ExitCode;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::prelude::*;
use tracing_subscriber::{EnvFilter, fmt};

use cli::{Cli, Command};
use pricestream_adapter::SessionFrame;
use pricestream_consumer::{ConsumerConfig, Coordinator};

const LOG_FILE_PREFIX: &str = "pricestream.log";
const FRAME_BUFFER: usize = 256;

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    match run(cli).await {
        Ok(code) => code,
        Err(err) => {
            eprintln!("error: {err:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<ExitCode> {
    if let Some(Command::Init { output, defaults }) = &cli.command {
        cli::init::run_init(output, *defaults)?;
        return Ok(ExitCode::SUCCESS);
    }

    let args = cli.run;
    let _guard = init_tracing(&args.log_level, args.log_dir.as_deref())?;

    let mut config = match &args.config_path {
        Some(path) => load_config(path)?,
        None => ConsumerConfig::default(),
    };
    args.apply(&mut config);
    config.validate().context("invalid configuration")?;

    info!(
        auth_mode = ?config.auth.mode,
        hot_standby = config.discovery.hot_standby,
        explicit_host = config.discovery.host.as_deref().unwrap_or("-"),
        items = ?config.session.rics,
        dry_run = args.dry_run,
        "starting pricestream"
    );

    if args.dry_run {
        info!("dry-run requested; configuration validated");
        return Ok(ExitCode::SUCCESS);
    }

    let shutdown = CancellationToken::new();
    setup_signal_handlers(shutdown.clone());

    let (frames_tx, frames_rx) = mpsc::channel(FRAME_BUFFER);
    let frame_logger = tokio::spawn(log_frames(frames_rx));

    let coordinator = Coordinator::from_config(&config, shutdown.clone())
        .context("build coordinator")?
        .with_observer(frames_tx);
    let outcome = coordinator.run().await;

    if let Err(err) = frame_logger.await {
        warn!(error = %err, "frame logger failed");
    }

    match outcome {
        Ok(()) => {
            info!("shutdown complete");
            Ok(ExitCode::SUCCESS)
        }
        Err(err) => {
            error!(error = %err, "stopped on fatal error");
            Ok(ExitCode::FAILURE)
        }
    }
}

/// Console logging, plus daily rolling files when `log_dir` is set.
fn init_tracing(log_level: &str, log_dir: Option<&Path>) -> Result<Option<WorkerGuard>> {
    let filter = EnvFilter::try_new(log_level).context("invalid log level")?;

    let (file_layer, guard) = match log_dir {
        Some(dir) => {
            let appender = RollingFileAppender::builder()
                .rotation(Rotation::DAILY)
                .filename_prefix(LOG_FILE_PREFIX)
                .build(dir)
                .with_context(|| format!("open log directory {}", dir.display()))?;
            let (writer, guard) = tracing_appender::non_blocking(appender);
            (
                Some(fmt::layer().with_ansi(false).with_writer(writer)),
                Some(guard),
            )
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer())
        .with(file_layer)
        .try_init()
        .map_err(|err| anyhow!(err))
        .context("initialize tracing subscriber")?;
    Ok(guard)
}

fn load_config(path: &Path) -> Result<ConsumerConfig> {
    ConsumerConfig::from_file(path).context("load config")
}

async fn log_frames(mut frames: mpsc::Receiver<SessionFrame>) {
    while let Some(frame) = frames.recv().await {
        info!(
            session = %frame.session_id,
            kind = frame.message.kind(),
            message = ?frame.message,
            "gateway message"
        );
    }
}

fn setup_signal_handlers(shutdown: CancellationToken) {
    let shutdown_clone = shutdown.clone();
    tokio::spawn(async move {
        if let Err(err) = tokio::signal::ctrl_c().await {
            warn!(error = %err, "failed to install SIGINT handler");
            return;
        }
        info!("received SIGINT");
        shutdown_clone.cancel();
    });

    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        let shutdown_clone = shutdown.clone();
        tokio::spawn(async move {
            match signal(SignalKind::terminate()) {
                Ok(mut stream) => {
                    stream.recv().await;
                    info!("received SIGTERM");
                    shutdown_clone.cancel();
                }
                Err(err) => {
                    warn!(error = %err, "failed to install SIGTERM handler");
                }
            }
        });
    }
}
