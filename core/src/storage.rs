//! Owner-only file persistence shared by the identity and trust stores.

use crate::error::{RemoteError, Result};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::warn;

/// Default storage directory (`<config dir>/utm-remote`).
pub fn default_storage_dir() -> Result<PathBuf> {
    dirs::config_dir()
        .map(|dir| dir.join("utm-remote"))
        .ok_or_else(|| RemoteError::Io(std::io::Error::other("Could not find config dir")))
}

pub fn unix_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Create `dir` if needed and restrict it to the current user.
pub fn ensure_private_dir(dir: &Path) -> Result<()> {
    if !dir.exists() {
        std::fs::create_dir_all(dir)?;
    }

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        if let Err(e) = std::fs::set_permissions(dir, std::fs::Permissions::from_mode(0o700)) {
            warn!("Failed to set storage directory permissions: {}", e);
        }
    }
    #[cfg(windows)]
    restrict_to_current_user(dir);

    Ok(())
}

/// Atomically replace `path` with `data`: temp file, owner-only permissions, fsync, rename.
pub fn write_private_file(path: &Path, data: &[u8]) -> Result<()> {
    let mut tmp_name = path.as_os_str().to_owned();
    tmp_name.push(".tmp");
    let tmp_path = PathBuf::from(tmp_name);

    std::fs::write(&tmp_path, data)?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&tmp_path, std::fs::Permissions::from_mode(0o600))?;
    }
    #[cfg(windows)]
    restrict_to_current_user(&tmp_path);

    {
        let f = std::fs::File::open(&tmp_path)?;
        f.sync_all()?;
    }

    std::fs::rename(&tmp_path, path)?;
    Ok(())
}

/// Warn when a file holding key material is readable by other users.
#[cfg(unix)]
pub fn check_private_permissions(path: &Path) {
    use std::os::unix::fs::PermissionsExt;
    if let Ok(metadata) = std::fs::metadata(path) {
        let mode = metadata.permissions().mode() & 0o777;
        if mode & 0o077 != 0 {
            warn!(
                "{:?} has overly permissive permissions ({:o}), expected 0600",
                path, mode
            );
        }
    }
}

#[cfg(not(unix))]
pub fn check_private_permissions(_path: &Path) {}

/// Move an unreadable file aside so the next write starts clean.
pub fn quarantine_corrupt(path: &Path) {
    let stem = path
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("store")
        .to_string();
    let corrupt = path.with_file_name(format!("{}.corrupt.{}.json", stem, unix_timestamp()));
    if let Err(e) = std::fs::rename(path, &corrupt) {
        warn!("Failed to move corrupt file to {}: {}", corrupt.display(), e);
    }
}

/// Grant the current user (and SYSTEM) full control, then strip inherited ACEs.
///
/// The grant runs first so the object is never left with an empty DACL.
#[cfg(windows)]
fn restrict_to_current_user(path: &Path) {
    use std::process::{Command, Stdio};

    let Some(path_str) = path.to_str() else {
        warn!("Cannot restrict ACLs for {:?}: path is not valid UTF-8", path);
        return;
    };
    let username = match std::env::var("USERNAME") {
        Ok(u) if !u.is_empty() => u,
        _ => {
            warn!("Cannot restrict ACLs: %USERNAME% not set");
            return;
        }
    };

    let inherit = if path.is_dir() { "(OI)(CI)" } else { "" };
    let steps = [
        vec!["/grant".to_string(), format!("{}:{}(F)", username, inherit)],
        vec!["/grant".to_string(), format!("SYSTEM:{}(F)", inherit)],
        vec!["/inheritance:r".to_string()],
    ];

    for args in steps {
        let status = Command::new("icacls")
            .arg(path_str)
            .args(&args)
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status();
        match status {
            Ok(s) if s.success() => {}
            Ok(s) => {
                warn!("icacls {:?} failed for {:?} ({:?})", args, path, s.code());
                return;
            }
            Err(e) => {
                warn!("Failed to run icacls for {:?}: {}", path, e);
                return;
            }
        }
    }
}
