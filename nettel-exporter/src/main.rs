//! Prometheus exporter for ntopng.

use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio::sync::watch;
use tracing::{error, info};

use nettel_common::init_tracing;
use nettel_exporter::{
    ExporterConfig, HttpServer, HttpTransport, MetricCollector, ReconcilingPoller,
    ResilientFetcher, TokioClock,
};

/// Prometheus exporter for ntopng ZMQ statistics.
#[derive(Parser, Debug)]
#[command(name = "nettel-exporter")]
#[command(about = "Export ntopng ZMQ interface counters as Prometheus metrics")]
#[command(version)]
struct Args {
    /// Path to configuration file (JSON5 format).
    #[arg(short, long)]
    config: Option<String>,

    /// HTTP listen address, e.g. 0.0.0.0:8888 (overrides config).
    #[arg(long)]
    listen: Option<String>,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Load configuration
    let mut config = if let Some(config_path) = &args.config {
        ExporterConfig::load_from_file(config_path)
            .with_context(|| format!("Failed to load config from {}", config_path))?
    } else {
        ExporterConfig::default()
    };

    if let Some(level) = &args.log_level {
        config.logging.level = level.clone();
    }

    init_tracing(&config.logging).context("Failed to initialize tracing")?;

    info!(pid = std::process::id(), "Starting nettel exporter");

    config.apply_env()?;
    if let Some(listen) = &args.listen {
        config.prometheus.set_listen(listen)?;
    }

    let listen_addr = config.prometheus.listen_addr()?;

    info!(
        ntopng = %config.ntopng.base_url(),
        listen = %listen_addr,
        path = %config.prometheus.path,
        "Configuration loaded"
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let collector = Arc::new(MetricCollector::new(
        &config.prometheus.prefix,
        &config.poller.metrics,
    ));

    let fetcher = ResilientFetcher::new(
        HttpTransport::new(config.ntopng.credential()),
        TokioClock,
        config.retry.policy()?,
        config.ntopng.endpoints(),
    );
    let poller = ReconcilingPoller::new(
        fetcher,
        collector.clone(),
        config.poller.hostname_source(),
        config.poller.settings(),
    );
    let http_server = HttpServer::new(
        collector.clone(),
        listen_addr,
        config.prometheus.path.clone(),
    );

    // Start HTTP server
    let http_shutdown = shutdown_rx.clone();
    let mut http_task = tokio::spawn(http_server.run(http_shutdown));

    // Start poller
    let mut poller_task = tokio::spawn(poller.run(shutdown_rx.clone()));

    let mut fatal = None;
    let mut poller_done = false;
    let mut http_done = false;

    // Wait for shutdown signal, poller exit or HTTP server exit
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down...");
        }
        _ = terminate_signal() => {
            info!("Received SIGTERM, shutting down...");
        }
        result = &mut poller_task => {
            poller_done = true;
            match result {
                Ok(Ok(())) => info!("Poller exited, shutting down..."),
                Ok(Err(e)) => {
                    error!(error = %e, "Poller failed");
                    fatal = Some(anyhow::Error::new(e));
                }
                Err(e) => {
                    error!(error = %e, "Poller task panicked");
                    fatal = Some(anyhow::Error::new(e));
                }
            }
        }
        result = &mut http_task => {
            http_done = true;
            match result {
                Ok(Ok(())) => info!("HTTP server exited, shutting down..."),
                Ok(Err(e)) => {
                    error!(error = %e, "HTTP server failed");
                    fatal = Some(e);
                }
                Err(e) => {
                    error!(error = %e, "HTTP server task panicked");
                    fatal = Some(anyhow::Error::new(e));
                }
            }
        }
    }

    // Signal shutdown
    let _ = shutdown_tx.send(true);

    // Best effort: an in-flight poll cycle may outlive the grace period
    let grace = config.shutdown.grace_period();
    if tokio::time::timeout(grace, async {
        if !http_done {
            let _ = http_task.await;
        }
        if !poller_done {
            let _ = poller_task.await;
        }
    })
    .await
    .is_err()
    {
        info!(grace_secs = grace.as_secs(), "Grace period elapsed, exiting anyway");
    }

    let stats = collector.stats();
    info!(
        cycles = stats.cycles,
        updates = stats.updates,
        fetch_failures = stats.fetch_failures,
        skipped = stats.skipped,
        upstream_resets = stats.upstream_resets,
        "Final statistics"
    );

    if let Some(e) = fatal {
        return Err(e);
    }

    info!("Exporter stopped");
    Ok(())
}

/// Resolves when SIGTERM is received; never on non-unix platforms.
async fn terminate_signal() {
    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        std::future::pending::<()>().await;
    }
}
