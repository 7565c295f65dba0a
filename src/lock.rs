use std::fs::{File, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use tracing::warn;

use crate::error::HarvestError;

/// Exclusive marker file held for one whole pipeline run.
///
/// Holds the owner's pid. A file whose pid no longer names a live process is
/// reclaimed; an unreadable pid counts as held.
pub struct RunLock {
    path: PathBuf,
}

impl RunLock {
    pub fn acquire(path: &Path) -> Result<Self, HarvestError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(HarvestError::Lock)?;
        }

        match create(path) {
            Ok(lock) => return Ok(lock),
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {}
            Err(e) => return Err(HarvestError::Lock(e)),
        }

        let holder = std::fs::read_to_string(path).map_err(HarvestError::Lock)?;
        match holder.trim().parse::<u32>() {
            Ok(pid) if !process_exists(pid) => {
                warn!("Reclaiming stale run lock {:?} left by pid {}", path, pid);
                std::fs::remove_file(path).map_err(HarvestError::Lock)?;
            }
            _ => return Err(HarvestError::Busy(path.to_path_buf())),
        }

        match create(path) {
            Ok(lock) => Ok(lock),
            Err(e) if e.kind() == ErrorKind::AlreadyExists => Err(HarvestError::Busy(path.to_path_buf())),
            Err(e) => Err(HarvestError::Lock(e)),
        }
    }
}

fn create(path: &Path) -> std::io::Result<RunLock> {
    let mut file: File = OpenOptions::new().write(true).create_new(true).open(path)?;
    let lock = RunLock {
        path: path.to_path_buf(),
    };
    writeln!(file, "{}", std::process::id())?;
    Ok(lock)
}

fn process_exists(pid: u32) -> bool {
    #[cfg(unix)]
    {
        // signal 0 only checks that the pid exists; EPERM means it does
        let rc = unsafe { libc::kill(pid as libc::pid_t, 0) };
        rc == 0 || std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
    }

    #[cfg(not(unix))]
    {
        let _ = pid;
        true
    }
}

impl Drop for RunLock {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            warn!("Failed to release run lock {:?}: {}", self.path, e);
        }
    }
}
