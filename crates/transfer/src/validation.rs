use crate::TransferError;

/// Validates an upload name and returns its normalized form.
///
/// Names are relative paths such as `folder/sub/file.bin`. Backslashes are
/// treated as separators, `.` and empty segments are dropped, and the result
/// is joined with `/`.
///
/// Rejects:
/// - Empty names (or names made only of separators and `.`)
/// - Absolute paths (`/x`, `\x`, `C:\x`, `C:/x`)
/// - Parent directory traversal (`..`)
/// - NUL bytes
pub fn normalize_upload_name(name: &str) -> Result<String, TransferError> {
    if name.contains('\0') {
        return Err(TransferError::InvalidName(format!(
            "name contains NUL byte: {name:?}"
        )));
    }

    let unified = name.replace('\\', "/");

    if unified.starts_with('/') {
        return Err(TransferError::InvalidName(format!(
            "absolute path not allowed: {name}"
        )));
    }

    let mut segments = Vec::new();
    for segment in unified.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                return Err(TransferError::InvalidName(format!(
                    "parent directory traversal not allowed: {name}"
                )));
            }
            s if segments.is_empty() && is_drive_prefix(s) => {
                return Err(TransferError::InvalidName(format!(
                    "path prefix not allowed: {name}"
                )));
            }
            s => segments.push(s),
        }
    }

    if segments.is_empty() {
        return Err(TransferError::InvalidName("empty name".into()));
    }

    Ok(segments.join("/"))
}

fn is_drive_prefix(segment: &str) -> bool {
    let bytes = segment.as_bytes();
    bytes.len() == 2 && bytes[0].is_ascii_alphabetic() && bytes[1] == b':'
}
