// Atomic file replacement and the status snapshot for external monitoring
//!
//! Every file the warden owns (daemon config, ledgers, status snapshot) is
//! replaced through [`write_atomic`], so a crash mid-write leaves either the
//! old or the new contents, never a truncated file.

use crate::error::{Error, Result};
use crate::types::PeerState;
use std::fs;
use std::io::Write;
use std::path::Path;
use std::time::SystemTime;

/// Replace `path` with `contents` via a temp file in the same directory and a rename
pub fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    let dir = match path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir,
        _ => Path::new("."),
    };

    // Create directory if it doesn't exist
    if !dir.exists() {
        fs::create_dir_all(dir)?;
    }

    let mut temp = tempfile::NamedTempFile::new_in(dir)?;
    temp.write_all(contents.as_bytes())?;
    temp.as_file().sync_all()?;

    // Keep the mode of the file being replaced (daemon configs are usually 0600)
    if let Ok(metadata) = fs::metadata(path) {
        fs::set_permissions(temp.path(), metadata.permissions())?;
    }

    temp.persist(path).map_err(|e| Error::Io(e.error))?;
    Ok(())
}

/// Write the per-peer state snapshot
pub fn write_status(path: &Path, peers: &[(String, PeerState)]) -> Result<()> {
    let timestamp = SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);

    let mut content = String::new();
    for (name, state) in peers {
        content.push_str(&format!("{}={}\n", name, state.as_str()));
    }
    content.push_str(&format!("TIMESTAMP={}\n", timestamp));

    write_atomic(path, &content)
}

/// Remove a runtime file (status snapshot, control socket) on shutdown
pub fn cleanup(path: &Path) {
    let _ = fs::remove_file(path);
}
