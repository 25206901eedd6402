//! Filesystem primitives for the persisted state.
//!
//! - `atomic_write`: temp file (`<name>.tmp.<pid>.<attempt>`, O_EXCL, up to
//!   16 attempts) → write-all → fsync(file) → rename → fsync(parent dir).
//!   The target is never opened for truncation.
//! - `ExclusiveLock`: single-writer invariant on the state directory;
//!   `flock(LOCK_EX | LOCK_NB)` on POSIX, share-nothing open on Windows.
//!   Busy means another instance owns the state and the session must fail.
//! - permission hardening: secret-carrying files end up owner-only.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::error::ClientError;

const ATOMIC_ATTEMPTS: u32 = 16;

pub fn atomic_write(path: &Path, data: &[u8]) -> Result<(), ClientError> {
    let dir = path.parent().filter(|p| !p.as_os_str().is_empty());
    if let Some(dir) = dir {
        std::fs::create_dir_all(dir)
            .map_err(|e| ClientError::Resource(format!("create dir: {e}")))?;
    }
    let base = path
        .file_name()
        .ok_or_else(|| ClientError::Resource("atomic write: empty file name".into()))?
        .to_string_lossy()
        .into_owned();
    let pid = std::process::id();

    for attempt in 0..ATOMIC_ATTEMPTS {
        let tmp: PathBuf = match dir {
            Some(d) => d.join(format!("{base}.tmp.{pid}.{attempt}")),
            None => PathBuf::from(format!("{base}.tmp.{pid}.{attempt}")),
        };
        let mut open = OpenOptions::new();
        open.write(true).create_new(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            open.mode(0o600);
        }
        let mut file = match open.open(&tmp) {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => continue,
            Err(e) => return Err(ClientError::Resource(format!("open temp: {e}"))),
        };

        let result = file
            .write_all(data)
            .and_then(|()| file.sync_all())
            .map_err(|e| ClientError::Resource(format!("write temp: {e}")));
        drop(file);
        if let Err(e) = result {
            let _ = std::fs::remove_file(&tmp);
            return Err(e);
        }

        if let Err(e) = std::fs::rename(&tmp, path) {
            let _ = std::fs::remove_file(&tmp);
            return Err(ClientError::Resource(format!("rename: {e}")));
        }

        // fsync the containing directory so the rename is durable
        #[cfg(unix)]
        if let Some(d) = dir {
            if let Ok(dirfd) = File::open(d) {
                let _ = dirfd.sync_all();
            }
        }
        return Ok(());
    }
    Err(ClientError::Resource("atomic write: temp names exhausted".into()))
}

/// Tighten a secret-carrying file to owner read/write only.
pub fn restrict_permissions(path: &Path) -> Result<(), ClientError> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))
            .map_err(|e| ClientError::Resource(format!("chmod: {e}")))?;
    }
    #[cfg(not(unix))]
    {
        let _ = path;
    }
    Ok(())
}

/// Refuse to touch secret files sitting on a world-writable path.
pub fn check_not_world_writable(path: &Path) -> Result<(), ClientError> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        if let Ok(meta) = std::fs::metadata(path) {
            if meta.permissions().mode() & 0o002 != 0 {
                return Err(ClientError::Resource(format!(
                    "{} is world-writable",
                    path.display()
                )));
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = path;
    }
    Ok(())
}

/// Held for the process lifetime; dropping releases the lock.
pub struct ExclusiveLock {
    _file: File,
    path: PathBuf,
}

impl ExclusiveLock {
    pub fn acquire(path: &Path) -> Result<Self, ClientError> {
        if let Some(dir) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(dir)
                .map_err(|e| ClientError::Resource(format!("create dir: {e}")))?;
        }

        #[cfg(unix)]
        {
            use std::os::fd::AsRawFd;
            let file = OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .truncate(false)
                .open(path)
                .map_err(|e| ClientError::Resource(format!("open lock: {e}")))?;
            let rc = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
            if rc != 0 {
                return Err(ClientError::Resource(
                    "state directory locked by another instance".into(),
                ));
            }
            Ok(Self {
                _file: file,
                path: path.to_path_buf(),
            })
        }

        #[cfg(windows)]
        {
            use std::os::windows::fs::OpenOptionsExt;
            // share_mode(0): no other open succeeds while we hold this.
            let file = OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .share_mode(0)
                .open(path)
                .map_err(|_| {
                    ClientError::Resource("state directory locked by another instance".into())
                })?;
            Ok(Self {
                _file: file,
                path: path.to_path_buf(),
            })
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn atomic_write_replaces_content() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("state.bin");
        atomic_write(&path, b"first").unwrap();
        atomic_write(&path, b"second").unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), b"second");
        // no temp files left behind
        let leftovers: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().contains(".tmp."))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn atomic_write_creates_parent_dirs() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested/deeper/state.bin");
        atomic_write(&path, b"x").unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), b"x");
    }

    #[cfg(unix)]
    #[test]
    fn lock_excludes_second_holder() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("lock");
        let first = ExclusiveLock::acquire(&path).unwrap();
        assert!(ExclusiveLock::acquire(&path).is_err());
        drop(first);
        ExclusiveLock::acquire(&path).unwrap();
    }

    #[cfg(unix)]
    #[test]
    fn world_writable_refused() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempdir().unwrap();
        let path = dir.path().join("secret.bin");
        std::fs::write(&path, b"s").unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o666)).unwrap();
        assert!(check_not_world_writable(&path).is_err());
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o600)).unwrap();
        check_not_world_writable(&path).unwrap();
    }
}
