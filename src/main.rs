//! `musicdl-watch`: follow download tasks on a music download backend.
//!
//! Usage: `musicdl-watch [--config <file>] [--playlist <id>]`
//!
//! Connects the push channel, polls the task list once and logs every task
//! change until Ctrl-C. With `--playlist`, an async playlist download is
//! submitted first.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context};
use tokio::sync::broadcast::error::RecvError;
use tracing_subscriber::EnvFilter;

use musicdl_tasks::api::{PlaylistDownloadRequest, ReauthHook};
use musicdl_tasks::task::TaskChange;
use musicdl_tasks::{ClientConfig, TaskTracker};

#[derive(Debug, Default)]
struct Args {
    config: Option<PathBuf>,
    playlist: Option<String>,
}

fn parse_args() -> anyhow::Result<Args> {
    let mut args = Args::default();
    let mut iter = std::env::args().skip(1);
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "--config" => {
                let path = iter.next().context("--config needs a file path")?;
                args.config = Some(PathBuf::from(path));
            }
            "--playlist" => {
                args.playlist = Some(iter.next().context("--playlist needs a playlist id")?);
            }
            "-h" | "--help" => {
                println!("Usage: musicdl-watch [--config <file>] [--playlist <id>]");
                std::process::exit(0);
            }
            other => bail!("Unknown argument: {}", other),
        }
    }
    Ok(args)
}

fn log_change(change: &TaskChange) {
    match change {
        TaskChange::Upserted(task) => tracing::info!(
            task_id = %task.id,
            kind = task.kind.as_str(),
            status = %task.status,
            percent = task.progress.percent,
            items = %format!("{}/{}", task.progress.processed_items, task.progress.total_items),
            error = task.error.as_ref().map(|e| e.message.as_str()).unwrap_or(""),
            "Task update"
        ),
        TaskChange::Removed(id) => tracing::info!(task_id = %id, "Task removed"),
        TaskChange::Cleared => tracing::info!("Task list cleared"),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("musicdl_tasks=info,musicdl_watch=info")),
        )
        .init();

    let args = parse_args()?;
    let config = match &args.config {
        Some(path) => ClientConfig::load(path)
            .with_context(|| format!("Failed to load config from {}", path.display()))?,
        None => ClientConfig::from_env(),
    };
    config.validate().context("Invalid configuration")?;

    let reauth: Arc<dyn ReauthHook> = Arc::new(|message: &str| {
        tracing::error!("Backend login expired, sign in again on the server: {}", message);
    });
    let tracker = TaskTracker::new(&config, Some(reauth)).context("Failed to build tracker")?;
    let mut changes = tracker.changes();

    match tracker.api().health().await {
        Ok(health) => tracing::info!(
            service = %health.service,
            cookie_valid = health.cookie_valid(),
            version = health.version.as_deref().unwrap_or("-"),
            "Backend reachable"
        ),
        Err(e) => tracing::warn!("Health check failed: {}", e),
    }

    tracker.start();
    if let Err(e) = tracker.poll_all().await {
        tracing::warn!("Initial poll failed: {}", e);
    }

    if let Some(playlist) = &args.playlist {
        let id = tracker
            .submit_playlist(PlaylistDownloadRequest::new(playlist.as_str()))
            .await
            .with_context(|| format!("Failed to submit playlist {}", playlist))?;
        tracing::info!(task_id = %id, playlist = %playlist, "Playlist download queued");
    }

    loop {
        tokio::select! {
            change = changes.recv() => match change {
                Ok(change) => log_change(&change),
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped = skipped, "Change log fell behind");
                }
                Err(RecvError::Closed) => break,
            },
            signal = tokio::signal::ctrl_c() => {
                signal.context("Failed to listen for Ctrl-C")?;
                tracing::info!("Shutting down");
                break;
            }
        }
    }

    tracker.shutdown();
    Ok(())
}
