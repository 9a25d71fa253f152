//! Upload run: ingest the given paths, drive the manager, report results.

use std::path::PathBuf;
use std::sync::Arc;

use uplink_protocol::{UploadSnapshot, UploadStatus};
use uplink_upload::{HttpChunkTransport, Selection, UploadEvent, UploadManager};

use crate::config::Config;

/// Outcome counts of a finished run.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Summary {
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
}

impl Summary {
    pub fn from_snapshot(snapshot: &UploadSnapshot) -> Self {
        let mut summary = Self::default();
        for progress in snapshot.per_file.values() {
            match progress.status {
                UploadStatus::Completed => summary.completed += 1,
                UploadStatus::Error => summary.failed += 1,
                UploadStatus::Cancelled => summary.cancelled += 1,
                _ => {}
            }
        }
        summary
    }
}

/// Uploads `paths` until everything settles or Ctrl-C cancels the run.
pub async fn run(config: Config, paths: Vec<PathBuf>) -> anyhow::Result<Summary> {
    let transport = Arc::new(HttpChunkTransport::new(
        config.endpoint.clone(),
        config.token.as_deref(),
    )?);
    let manager = UploadManager::new(config.upload_config(), transport)?;
    let mut events = manager
        .take_events()
        .ok_or_else(|| anyhow::anyhow!("event stream already taken"))?;

    for selection in selections(paths) {
        let names = manager.upload(selection).await?;
        tracing::debug!(files = names.len(), "selection enqueued");
    }

    let mut snapshots = manager.subscribe();
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    while !snapshots.borrow_and_update().is_idle() {
        tokio::select! {
            _ = &mut ctrl_c => {
                tracing::info!("SIGINT received, cancelling uploads");
                manager.cancel_all();
                break;
            }
            Some(event) = events.recv() => log_event(&event),
            changed = snapshots.changed() => {
                if changed.is_err() {
                    break;
                }
            }
        }
    }
    while let Ok(event) = events.try_recv() {
        log_event(&event);
    }

    let snapshot = manager.snapshot();
    for (name, progress) in &snapshot.per_file {
        if let Some(failure) = &progress.failure {
            tracing::error!(
                file = %name,
                chunk = failure.chunk_index,
                offset = failure.offset,
                attempts = failure.attempts,
                error = %failure.message,
                "upload failed"
            );
        }
    }
    Ok(Summary::from_snapshot(&snapshot))
}

/// Plain files become one file selection; each directory its own folder
/// selection.
fn selections(paths: Vec<PathBuf>) -> Vec<Selection> {
    let (folders, files): (Vec<PathBuf>, Vec<PathBuf>) =
        paths.into_iter().partition(|p| p.is_dir());

    let mut selections = Vec::with_capacity(folders.len() + 1);
    if !files.is_empty() {
        selections.push(Selection::Files(files));
    }
    selections.extend(folders.into_iter().map(Selection::Folder));
    selections
}

fn log_event(event: &UploadEvent) {
    match event {
        UploadEvent::StatusChanged { name, status } => {
            tracing::info!(file = %name, status = %status, "status changed");
        }
        UploadEvent::Progress {
            name,
            percent,
            bytes_acknowledged,
        } => {
            tracing::info!(
                file = %name,
                progress = format_args!("{percent:.1}%"),
                bytes = bytes_acknowledged,
                "progress"
            );
        }
        UploadEvent::ChunkRetry {
            name,
            chunk_index,
            attempt,
            ..
        } => {
            tracing::debug!(file = %name, chunk = chunk_index, attempt, "retrying chunk");
        }
        UploadEvent::Failed { name, failure } => {
            tracing::warn!(file = %name, chunk = failure.chunk_index, "file failed");
        }
    }
}
