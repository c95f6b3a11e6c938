//! SessionTrace - session lifecycle events to distributed traces
//!
//! Listens for logon/logoff events from a forwarder, turns each into a span
//! and ships batches to an OpenTelemetry collector.

use anyhow::Context;
use clap::{Parser, Subcommand, ValueEnum};
use sessiontrace_core::config::{ConfigLoader, PipelineSettings, ServiceConfig};
use sessiontrace_core::metrics::create_metrics;
use sessiontrace_core::pipeline::{Pipeline, PipelineConfig};
use sessiontrace_core::plugins::{CorrelationSink, NoopCorrelation};
use sessiontrace_core::SERVICE_VERSION;
use sessiontrace_correlate::{spawn_writer, InfluxLineBackend, WriterConfig, WriterHandle};
use sessiontrace_export::{
    BreakerConfig, CircuitBreaker, OtlpExporter, OtlpHttpTransport, RetryPolicy, TransportConfig,
};
use sessiontrace_ingest::{ListenerConfig, SessionListener};
use sessiontrace_web::MetricsServer;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::{oneshot, watch};
use tokio::time::{timeout_at, Instant};
use tracing::{debug, error, info, warn, Level};
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

#[derive(Parser)]
#[command(name = "sessiontrace")]
#[command(version)]
#[command(about = "Turn session logon/logoff events into distributed traces", long_about = None)]
struct Cli {
    /// Increase verbosity
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Log output format
    #[arg(long, global = true, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    /// Path to configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the service (default)
    Run,

    /// Print the effective configuration as TOML
    Config,

    /// Stream a JSONL file of events to a running listener
    Send {
        /// Input file (JSONL)
        #[arg(short, long)]
        input: PathBuf,

        /// Listener address
        #[arg(short, long, default_value = "127.0.0.1:5000")]
        addr: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let command = cli.command.unwrap_or(Commands::Run);

    if let Commands::Send { input, addr } = &command {
        init_logging(cli.verbose, false, cli.log_format)?;
        return send_command(input, addr).await;
    }

    // Load configuration before logging so DEBUG_MODE can pick the level
    let loaded = ConfigLoader::new().with_cli_path(cli.config).load_settings();
    let debug_mode = loaded.as_ref().map(|(_, s)| s.debug_mode).unwrap_or(false);
    init_logging(cli.verbose, debug_mode, cli.log_format)?;

    let (config, settings) = loaded.context("Invalid configuration")?;

    match command {
        Commands::Config => config_command(&config),
        _ => run_command(&config, settings).await,
    }
}

fn init_logging(verbose: u8, debug_mode: bool, format: LogFormat) -> anyhow::Result<()> {
    let level = match verbose {
        0 if debug_mode => Level::DEBUG,
        0 => Level::INFO,
        1 => Level::DEBUG,
        _ => Level::TRACE,
    };

    // RUST_LOG, when set, wins over the flags
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::default().add_directive(LevelFilter::from_level(level).into()));

    let builder = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false);

    match format {
        LogFormat::Text => tracing::subscriber::set_global_default(builder.finish())?,
        LogFormat::Json => tracing::subscriber::set_global_default(builder.json().finish())?,
    }
    Ok(())
}

fn config_command(config: &ServiceConfig) -> anyhow::Result<()> {
    print!("{}", config.redacted().to_toml()?);
    Ok(())
}

async fn run_command(config: &ServiceConfig, settings: PipelineSettings) -> anyhow::Result<()> {
    info!("Starting SessionTrace {}...", SERVICE_VERSION);
    debug!("Effective configuration:\n{}", config.redacted().to_toml()?);

    let metrics = create_metrics();

    // Both sockets are bound before anything starts; failure is fatal
    let metrics_server = MetricsServer::bind(
        settings.metrics_addr,
        metrics.clone(),
        settings.service_name.clone(),
    )
    .await
    .with_context(|| format!("Failed to bind metrics endpoint on {}", settings.metrics_addr))?;
    let listener = SessionListener::bind(ListenerConfig::from(&settings), metrics.clone())
        .await
        .with_context(|| format!("Failed to bind listener on {}", settings.listen_addr))?;

    // Export path
    let breaker = Arc::new(CircuitBreaker::new(
        BreakerConfig::from(&settings),
        metrics.clone(),
    ));
    let transport = OtlpHttpTransport::new(TransportConfig::from(&settings))?;
    let exporter = Arc::new(OtlpExporter::new(
        transport,
        breaker,
        RetryPolicy::from(&settings),
        metrics.clone(),
    ));
    info!("Exporting spans to {}", settings.export_endpoint);

    // Correlation side channel
    let (correlation, writer): (Arc<dyn CorrelationSink>, Option<WriterHandle>) =
        match &settings.correlation {
            Some(store) => {
                let backend = Arc::new(InfluxLineBackend::new(store)?);
                info!("Writing correlation records to {}", backend.write_url());
                let (sink, handle) = spawn_writer(WriterConfig::from(store), backend, metrics.clone());
                (Arc::new(sink), Some(handle))
            }
            None => {
                info!("Correlation store disabled");
                (Arc::new(NoopCorrelation), None)
            }
        };

    let pipeline = Pipeline::start(
        PipelineConfig::from(&settings),
        exporter,
        correlation,
        metrics.clone(),
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut listener_task = tokio::spawn(listener.serve(pipeline.producer()?, shutdown_rx));

    let (metrics_stop_tx, metrics_stop_rx) = oneshot::channel::<()>();
    let mut metrics_task = tokio::spawn(metrics_server.serve(async move {
        let _ = metrics_stop_rx.await;
    }));

    info!("SessionTrace running, press Ctrl+C to stop");
    let metrics_finished = tokio::select! {
        signal = wait_for_signal() => {
            signal?;
            info!("Shutdown signal received");
            false
        }
        result = &mut metrics_task => {
            match result {
                Ok(Ok(())) => error!("Metrics server exited unexpectedly"),
                Ok(Err(e)) => error!("Metrics server failed: {}", e),
                Err(e) => error!("Metrics server task failed: {}", e),
            }
            true
        }
    };

    // Listener first so no new events arrive, then drain the pipeline.
    // Every stage shares one grace deadline.
    let deadline = Instant::now() + settings.shutdown_grace;
    let _ = shutdown_tx.send(true);
    match timeout_at(deadline, &mut listener_task).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!("Listener task failed: {}", e),
        Err(_) => {
            warn!("Listener did not stop within the grace period, aborting");
            listener_task.abort();
        }
    }

    let report = pipeline.shutdown_until(deadline).await;
    if report.discarded > 0 {
        warn!("Discarded {} queued events at shutdown", report.discarded);
    }

    if let Some(writer) = writer {
        writer
            .finish(deadline.saturating_duration_since(Instant::now()))
            .await;
    }

    if !metrics_finished {
        let _ = metrics_stop_tx.send(());
        match metrics_task.await {
            Ok(Err(e)) => warn!("Metrics server error during shutdown: {}", e),
            Err(e) => warn!("Metrics server task failed: {}", e),
            Ok(Ok(())) => {}
        }
    }

    info!("SessionTrace stopped");
    Ok(())
}

/// Resolve on Ctrl+C, or SIGTERM on unix
async fn wait_for_signal() -> anyhow::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut terminate = signal(SignalKind::terminate())?;
        tokio::select! {
            result = tokio::signal::ctrl_c() => result?,
            _ = terminate.recv() => {}
        }
    }

    #[cfg(not(unix))]
    tokio::signal::ctrl_c().await?;

    Ok(())
}

async fn send_command(input: &Path, addr: &str) -> anyhow::Result<()> {
    let file = tokio::fs::File::open(input)
        .await
        .with_context(|| format!("Failed to open {}", input.display()))?;
    let mut stream = TcpStream::connect(addr)
        .await
        .with_context(|| format!("Failed to connect to {}", addr))?;

    let sent = stream_lines(BufReader::new(file), &mut stream).await?;
    stream.shutdown().await?;

    info!("Sent {} events to {}", sent, addr);
    Ok(())
}

/// Copy non-blank lines, newline-terminated
async fn stream_lines<R, W>(reader: R, writer: &mut W) -> std::io::Result<usize>
where
    R: tokio::io::AsyncBufRead + Unpin,
    W: tokio::io::AsyncWrite + Unpin,
{
    let mut lines = reader.lines();
    let mut sent = 0;
    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        writer.write_all(line.as_bytes()).await?;
        writer.write_all(b"\n").await?;
        sent += 1;
    }
    writer.flush().await?;
    Ok(sent)
}
