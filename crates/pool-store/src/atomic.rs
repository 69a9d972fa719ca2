use std::path::Path;
use std::time::SystemTime;

use tracing::debug;

use crate::error::{Error, Result};

/// Write `contents` to `path` via temp file + rename.
///
/// The temp file sits in the target's directory so the rename stays on one
/// filesystem. Permissions are 0600 on unix since both documents can carry
/// session tokens. Returns the mtime of the written file.
pub(crate) async fn write_atomic(path: &Path, contents: &str) -> Result<Option<SystemTime>> {
    let dir = match path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir,
        Some(_) => Path::new("."),
        None => return Err(Error::Io("document path has no parent directory".into())),
    };
    let file_name = path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("document");
    let tmp_path = dir.join(format!(".{file_name}.tmp.{}", uuid::Uuid::new_v4()));

    if let Err(e) = tokio::fs::write(&tmp_path, contents.as_bytes()).await {
        return Err(Error::Io(format!("writing temp file: {e}")));
    }

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let perms = std::fs::Permissions::from_mode(0o600);
        if let Err(e) = tokio::fs::set_permissions(&tmp_path, perms).await {
            let _ = tokio::fs::remove_file(&tmp_path).await;
            return Err(Error::Io(format!("setting file permissions: {e}")));
        }
    }

    if let Err(e) = tokio::fs::rename(&tmp_path, path).await {
        let _ = tokio::fs::remove_file(&tmp_path).await;
        return Err(Error::Io(format!("renaming temp file: {e}")));
    }

    debug!(path = %path.display(), "persisted document");
    Ok(modified_at(path).await)
}

/// File mtime, or `None` when the file is missing or the platform has no mtime.
pub(crate) async fn modified_at(path: &Path) -> Option<SystemTime> {
    tokio::fs::metadata(path)
        .await
        .ok()
        .and_then(|m| m.modified().ok())
}
