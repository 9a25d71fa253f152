//! Ingestion: turns user selections into file descriptors.
//!
//! Folders are walked recursively. Names are relative to the selected
//! folder's parent and use `/` as separator on every platform, so picking
//! `/home/me/photos` yields `photos/2024/a.jpg`.

use std::fs;
use std::path::{Path, PathBuf};

use tracing::debug;
use uplink_transfer::normalize_upload_name;

use crate::error::IngestError;
use crate::types::FileDescriptor;

/// A user selection, in any of the shapes a front end can produce.
#[derive(Debug, Clone)]
pub enum Selection {
    /// Individually picked files.
    Files(Vec<PathBuf>),
    /// A picked folder, uploaded with its whole tree.
    Folder(PathBuf),
    /// A drag-and-drop payload.
    Dropped(Vec<DroppedItem>),
}

/// One entry of a drop.
#[derive(Debug, Clone)]
pub enum DroppedItem {
    File(PathBuf),
    Directory(PathBuf),
    /// Bytes without a backing file.
    Blob { name: String, data: Vec<u8> },
}

/// Flattens `selection` into descriptors, in selection order.
///
/// Directory placeholders are discarded. Entries within a directory are
/// visited in name order. Symlinks inside a folder are followed only when
/// they point at a file.
pub fn collect(selection: Selection) -> Result<Vec<FileDescriptor>, IngestError> {
    let mut files = Vec::new();
    match selection {
        Selection::Files(paths) => {
            for path in paths {
                add_file(&path, &mut files)?;
            }
        }
        Selection::Folder(path) => add_folder(&path, &mut files)?,
        Selection::Dropped(items) => {
            for item in items {
                match item {
                    DroppedItem::File(path) => add_file(&path, &mut files)?,
                    DroppedItem::Directory(path) => add_folder(&path, &mut files)?,
                    DroppedItem::Blob { name, data } => {
                        files.push(FileDescriptor::from_bytes(normalize_upload_name(&name)?, data));
                    }
                }
            }
        }
    }
    Ok(files)
}

/// Runs [`collect`] on the blocking pool.
pub async fn collect_async(selection: Selection) -> Result<Vec<FileDescriptor>, IngestError> {
    tokio::task::spawn_blocking(move || collect(selection))
        .await
        .map_err(|e| IngestError::Join(e.to_string()))?
}

fn add_file(path: &Path, files: &mut Vec<FileDescriptor>) -> Result<(), IngestError> {
    let metadata = fs::metadata(path).map_err(|e| IngestError::io(path, e))?;
    if metadata.is_dir() {
        debug!(path = %path.display(), "skipping directory in file selection");
        return Ok(());
    }
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    files.push(FileDescriptor::from_path(
        normalize_upload_name(&name)?,
        path,
        metadata.len(),
    ));
    Ok(())
}

fn add_folder(root: &Path, files: &mut Vec<FileDescriptor>) -> Result<(), IngestError> {
    let prefix = folder_name(root)?;
    let before = files.len();
    walk_dir(root, root, &prefix, files)?;
    debug!(
        folder = %root.display(),
        files = files.len() - before,
        "folder scanned"
    );
    Ok(())
}

/// Last component of the folder, resolving `.` and friends.
fn folder_name(root: &Path) -> Result<String, IngestError> {
    if let Some(name) = root.file_name() {
        return Ok(name.to_string_lossy().into_owned());
    }
    let resolved = fs::canonicalize(root).map_err(|e| IngestError::io(root, e))?;
    Ok(resolved
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default())
}

fn walk_dir(
    root: &Path,
    current: &Path,
    prefix: &str,
    files: &mut Vec<FileDescriptor>,
) -> Result<(), IngestError> {
    let mut entries = fs::read_dir(current)
        .map_err(|e| IngestError::io(current, e))?
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| IngestError::io(current, e))?;
    entries.sort_by_key(|e| e.file_name());

    for entry in entries {
        let path = entry.path();
        let file_type = entry.file_type().map_err(|e| IngestError::io(&path, e))?;

        if file_type.is_dir() {
            walk_dir(root, &path, prefix, files)?;
            continue;
        }
        let metadata = if file_type.is_symlink() {
            match fs::metadata(&path) {
                Ok(target) if target.is_file() => target,
                _ => {
                    debug!(path = %path.display(), "skipping symlink");
                    continue;
                }
            }
        } else {
            entry.metadata().map_err(|e| IngestError::io(&path, e))?
        };

        if metadata.is_file() {
            let rel_path = path
                .strip_prefix(root)
                .map_err(|e| IngestError::io(&path, std::io::Error::other(e)))?;
            let rel = rel_path.to_string_lossy();
            let name = if prefix.is_empty() {
                normalize_upload_name(&rel)?
            } else {
                normalize_upload_name(&format!("{prefix}/{rel}"))?
            };
            files.push(FileDescriptor::from_path(name, &path, metadata.len()));
        }
    }

    Ok(())
}
