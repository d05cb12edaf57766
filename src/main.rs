// Copyright (c) 2025 Nikolay Denev <ndenev@gmail.com>
// SPDX-License-Identifier: BSD-3-Clause

mod cli;
mod progress;

use anyhow::{Context, Result};
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_rolling_file::{RollingConditionBase, RollingFileAppenderBase};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::prelude::*;

use cli::Args;
use k8s_replicator::config::{self, Config};
use k8s_replicator::kubernetes::{self, ApiFilters, Client};

const LOG_FILE_MAX_BYTES: u64 = 10 * 1024 * 1024;
const LOG_FILES_KEPT: usize = 5;

/// Rolling log file under ~/.k8s-replicator/log, rotated daily and by size
///
/// Returns None (after a note on stderr) when the file cannot be opened; the
/// process then logs to stderr only if `--verbose` was given.
fn log_file_writer() -> Option<impl for<'w> MakeWriter<'w> + Send + Sync + 'static> {
    let log_dir = match config::base_dir() {
        Ok(dir) => dir.join("log"),
        Err(e) => {
            eprintln!("Warning: {e}, file logging disabled");
            return None;
        }
    };
    if let Err(e) = std::fs::create_dir_all(&log_dir) {
        eprintln!("Warning: Could not create {}: {e}", log_dir.display());
        return None;
    }

    let rotation = RollingConditionBase::new()
        .daily()
        .max_size(LOG_FILE_MAX_BYTES);
    let appender = RollingFileAppenderBase::new(
        log_dir.join("k8s-replicator.log"),
        rotation,
        LOG_FILES_KEPT,
    )
    .inspect_err(|e| eprintln!("Warning: Could not open log file: {e}"))
    .ok()?;

    let (writer, flush_guard) = appender.get_non_blocking_appender();
    // The writer thread must outlive main
    std::mem::forget(flush_guard);
    Some(writer)
}

fn init_logging(verbose: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("k8s_replicator={default_level}")));

    let file_layer = log_file_writer().map(|writer| {
        tracing_subscriber::fmt::layer()
            .with_writer(writer)
            .with_ansi(false)
    });
    let stderr_layer =
        verbose.then(|| tracing_subscriber::fmt::layer().with_writer(std::io::stderr));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(file_layer)
        .with(stderr_layer)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    // Install rustls crypto provider (aws-lc-rs)
    rustls::crypto::aws_lc_rs::default_provider()
        .install_default()
        .expect("Failed to install rustls crypto provider");

    let args = Args::parse();
    init_logging(args.verbose);

    let mut config = Config::load()?;
    args.apply_to(&mut config);
    if args.save_config {
        config.save()?;
        info!(path = %Config::config_path()?.display(), "Saved configuration");
    }

    run(config).await
}

async fn run(config: Config) -> Result<()> {
    let kinds = config.tracked_kinds()?;
    let transport = kubernetes::connect(config.context.as_deref()).await?;

    let mut client = Client::with_resync_period(
        transport,
        config.resource_requirements()?,
        config.namespace_requirements()?,
        config.resync_period()?,
    );

    let namespaces = client.watch_namespaces()?;
    let mut stores = Vec::with_capacity(kinds.len());
    for kind in &kinds {
        stores.push(kind.watch(&mut client, ApiFilters::default())?);
    }

    let cancel = CancellationToken::new();
    let shutdown = cancel.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("Shutdown requested"),
            Err(e) => warn!(error = %e, "Failed to listen for Ctrl-C, shutting down"),
        }
        shutdown.cancel();
    });

    let spinner = progress::track_startup(client.subscribe());
    let started = client.start(cancel.clone()).await;
    if let Err(e) = spinner.await {
        warn!(error = %e, "Progress reporting task failed");
    }

    match started {
        Ok(()) => {
            info!(namespaces = namespaces.state().len(), "Namespace cache ready");
            for store in &stores {
                info!(kind = %store.kind(), objects = store.len(), "Resource cache ready");
            }
            eprintln!(
                "Caches synced: {} namespaces, {} resource kinds",
                namespaces.state().len(),
                stores.len()
            );
        }
        Err(e) if e.is_cancelled() => {
            info!("Stopped before caches were synced");
            client.wait_stopped().await;
            return Ok(());
        }
        Err(e) => {
            cancel.cancel();
            client.wait_stopped().await;
            return Err(e).context("Failed to synchronize caches");
        }
    }

    cancel.cancelled().await;
    client.wait_stopped().await;
    info!("All cache tasks stopped");
    Ok(())
}
