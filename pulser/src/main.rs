use std::sync::Arc;

use chrono::TimeDelta;
use clap::Parser;
use eyre::{Context, Result};
use tokio::sync::mpsc;
use tracing::{info, warn};

use pulser::cli::{Backend, Cli};
use pulser::config::{Config, ExecutionMode, RelaySettings};
use pulser::{
    BatchHandler, Clock, InMemoryQueue, LambdaRuntime, MessageRouter, Poller, QueueClient, SqsJsonClient, SystemClock, local,
};

fn setup_logging(level: Option<&str>) -> Result<()> {
    let filter = match level {
        Some(level) => tracing_subscriber::EnvFilter::try_new(level.to_lowercase())
            .context(format!("Invalid log level: {}", level))?,
        None => tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
    };

    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(filter)
        .init();

    Ok(())
}

fn build_client(config: &Config, clock: Arc<dyn Clock>) -> Result<Arc<dyn QueueClient>> {
    match config.backend {
        Backend::Sqs => {
            let client = SqsJsonClient::new(&config.endpoint).context("Failed to create queue client")?;
            info!(endpoint = %config.endpoint, "Using SQS backend");
            Ok(Arc::new(client))
        }
        Backend::Memory => {
            let visibility = TimeDelta::seconds(i64::from(config.visibility_timeout_seconds));
            let queue = InMemoryQueue::new(clock)
                .with_visibility_timeout(visibility)
                .with_send_log(false);
            for name in [&config.inbound.name, &config.outbound.name].into_iter().flatten() {
                queue.create_queue(name);
            }
            info!("Using in-memory backend");
            Ok(Arc::new(queue))
        }
    }
}

/// Feed stdin into the inbound queue and copy released messages to stdout
///
/// Returns the drain task and the sender that stops it.
fn spawn_local_io(
    client: Arc<dyn QueueClient>,
    settings: &RelaySettings,
) -> (tokio::task::JoinHandle<pulser::Result<usize>>, mpsc::Sender<()>) {
    let inbound = settings.inbound_queue_url.clone();
    let feed_client = client.clone();
    tokio::spawn(async move {
        let stdin = tokio::io::BufReader::new(tokio::io::stdin());
        if let Err(e) = local::feed_lines(stdin, feed_client.as_ref(), &inbound).await {
            warn!(error = %e, "Reading stdin failed");
        }
    });

    let outbound = settings.outbound_queue_url.clone();
    let wait_time_seconds = settings.wait_time_seconds;
    let (drain_tx, drain_rx) = mpsc::channel::<()>(1);
    let drain = tokio::spawn(async move {
        let mut stdout = tokio::io::stdout();
        local::drain_outbound(client.as_ref(), &outbound, wait_time_seconds, &mut stdout, drain_rx).await
    });

    (drain, drain_tx)
}

/// Forward SIGINT/SIGTERM/SIGHUP to the shutdown channel
fn spawn_signal_handler(shutdown_tx: mpsc::Sender<()>) -> Result<()> {
    use tokio::signal::unix::{SignalKind, signal};

    let mut sighup = signal(SignalKind::hangup()).context("Failed to install SIGHUP handler")?;
    let mut sigint = signal(SignalKind::interrupt()).context("Failed to install SIGINT handler")?;
    let mut sigterm = signal(SignalKind::terminate()).context("Failed to install SIGTERM handler")?;

    tokio::spawn(async move {
        tokio::select! {
            _ = sighup.recv() => warn!("SIGHUP received"),
            _ = sigint.recv() => warn!("SIGINT received"),
            _ = sigterm.recv() => warn!("SIGTERM received"),
        }
        let _ = shutdown_tx.send(()).await;
    });

    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // CLI level wins over the config file, which wins over RUST_LOG
    let log_level = cli
        .log_level
        .clone()
        .or_else(|| Config::load_log_level(cli.config.as_ref()));
    setup_logging(log_level.as_deref()).context("Failed to setup logging")?;

    let mut config = Config::load(cli.config.as_ref()).context("Failed to load configuration")?;
    config.apply_cli(&cli);
    config.validate().context("Invalid configuration")?;

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let mode = ExecutionMode::detect();
    if let Some(warning) = config.mode_warning(mode) {
        warn!("{}", warning);
    }

    let client = build_client(&config, clock.clone())?;
    let settings = config
        .resolve(client.as_ref())
        .await
        .context("Failed to resolve queues")?;

    info!(
        inbound = %settings.inbound_queue_url,
        outbound = %settings.outbound_queue_url,
        interval = %settings.emit_interval,
        offset = %settings.offset,
        "pulser starting"
    );

    let settings = Arc::new(settings);
    let router = MessageRouter::new(client.clone(), settings.clone(), clock);

    let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>(1);
    spawn_signal_handler(shutdown_tx)?;

    match mode {
        ExecutionMode::Lambda => {
            info!("Running under the Lambda runtime");
            let runtime = LambdaRuntime::from_env(BatchHandler::new(router)).context("Failed to start Lambda runtime")?;
            runtime.run(shutdown_rx).await?;
        }
        ExecutionMode::Poll => {
            info!("Running poll loop");
            let local_io = (config.backend == Backend::Memory).then(|| {
                info!("Reading messages from stdin, writing released messages to stdout");
                spawn_local_io(client, &settings)
            });

            let stats = Poller::new(router).run(shutdown_rx).await;

            if let Some((drain, drain_tx)) = local_io {
                drop(drain_tx);
                match drain.await {
                    Ok(Ok(released)) => info!(released, "Output closed"),
                    Ok(Err(e)) => warn!(error = %e, "Writing stdout failed"),
                    Err(e) => warn!(error = %e, "Output task failed"),
                }
            }
            info!(
                received = stats.received,
                emitted = stats.emitted,
                requeued = stats.requeued,
                failed = stats.failed,
                "pulser stopped"
            );
        }
    }

    Ok(())
}
