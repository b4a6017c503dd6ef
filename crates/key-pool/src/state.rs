//! State file for user-added keys
//!
//! A pretty-printed JSON array of key records. Writes go to a temp file in the
//! same directory and are renamed over the target, so a crash mid-write leaves
//! the previous record intact.

use std::path::Path;

use tracing::debug;

use crate::error::{Error, Result};
use crate::key::Key;

/// Read the state file. `Ok(None)` when it does not exist.
pub(crate) async fn read(path: &Path) -> Result<Option<Vec<Key>>> {
    let contents = match tokio::fs::read_to_string(path).await {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(Error::Io(format!("reading state file: {e}"))),
    };
    let keys: Vec<Key> = serde_json::from_str(&contents)
        .map_err(|e| Error::StateParse(format!("parsing state file: {e}")))?;
    Ok(Some(keys))
}

/// Replace the state file with `keys`.
///
/// Sets file permissions to 0600 on unix since the file holds credentials.
pub(crate) async fn write_atomic(path: &Path, keys: &[Key]) -> Result<()> {
    let json = serde_json::to_string_pretty(keys)
        .map_err(|e| Error::StateParse(format!("serializing keys: {e}")))?;

    let dir = match path.parent() {
        Some(d) if !d.as_os_str().is_empty() => d,
        _ => Path::new("."),
    };
    let tmp_path = dir.join(format!(".state.tmp.{}", std::process::id()));

    tokio::fs::write(&tmp_path, json.as_bytes())
        .await
        .map_err(|e| Error::Io(format!("writing temp state file: {e}")))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let perms = std::fs::Permissions::from_mode(0o600);
        tokio::fs::set_permissions(&tmp_path, perms)
            .await
            .map_err(|e| Error::Io(format!("setting state file permissions: {e}")))?;
    }

    tokio::fs::rename(&tmp_path, path)
        .await
        .map_err(|e| Error::Io(format!("renaming temp state file: {e}")))?;

    debug!(path = %path.display(), keys = keys.len(), "persisted key state");
    Ok(())
}
