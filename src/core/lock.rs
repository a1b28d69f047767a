//! Advisory file locks.
//!
//! Holding the lock is a precondition of correctness for a run, so
//! contention is a terminal state: it logs an error and exits the whole
//! process with code 2 rather than surfacing an error the pipeline might be
//! tempted to handle.

use std::fs::{File, OpenOptions};
use std::os::fd::AsRawFd;
use std::path::{Path, PathBuf};
use std::process;

use log::{error, info};

use crate::error::{Error, Result};

/// Exit code used when a lock is already held elsewhere.
pub const CONTENTION_EXIT_CODE: i32 = 2;

/// One `--lock` argument: `PATH` for exclusive, `PATH,r` for shared.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct LockSpec {
    pub path: PathBuf,
    pub shared: bool,
}

impl LockSpec {
    pub fn parse(value: &str) -> Self {
        match value.strip_suffix(",r") {
            Some(path) => LockSpec {
                path: PathBuf::from(path),
                shared: true,
            },
            None => LockSpec {
                path: PathBuf::from(value),
                shared: false,
            },
        }
    }
}

/// Held lock; released (and logged) on drop.
pub struct LockGuard {
    file: File,
    path: PathBuf,
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        info!("unlocking {}", self.path.display());
        unsafe {
            libc::flock(self.file.as_raw_fd(), libc::LOCK_UN);
        }
    }
}

fn flock_nonblocking(file: &File, shared: bool) -> std::result::Result<(), std::io::Error> {
    let mode = if shared { libc::LOCK_SH } else { libc::LOCK_EX };
    let rv = unsafe { libc::flock(file.as_raw_fd(), mode | libc::LOCK_NB) };
    if rv == 0 {
        Ok(())
    } else {
        Err(std::io::Error::last_os_error())
    }
}

/// Acquire a single lock, exiting the process with code 2 on contention.
pub fn acquire(spec: &LockSpec) -> Result<LockGuard> {
    let file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(false)
        .open(&spec.path)
        .map_err(|err| Error::io("Failed to open lock file", &spec.path, err))?;

    info!("locking {}", spec.path.display());
    if let Err(err) = flock_nonblocking(&file, spec.shared) {
        if err.raw_os_error() == Some(libc::EWOULDBLOCK) {
            error!("{} is already locked, exiting", spec.path.display());
            process::exit(CONTENTION_EXIT_CODE);
        }
        return Err(Error::io("Failed to lock", &spec.path, err));
    }

    Ok(LockGuard {
        file,
        path: spec.path.clone(),
    })
}

/// Acquire every requested lock in sorted path order (avoids cross-run
/// deadlock when two invocations name the same files differently ordered).
pub fn acquire_all(specs: &[LockSpec]) -> Result<Vec<LockGuard>> {
    let mut sorted: Vec<&LockSpec> = specs.iter().collect();
    sorted.sort();
    sorted.into_iter().map(acquire).collect()
}

/// Probe used by tests and by the prepare tool to check whether `path` is
/// currently locked, without blocking.
pub fn try_exclusive(path: &Path) -> Result<bool> {
    let file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(false)
        .open(path)
        .map_err(|err| Error::io("Failed to open lock file", path, err))?;
    match flock_nonblocking(&file, false) {
        Ok(()) => {
            unsafe {
                libc::flock(file.as_raw_fd(), libc::LOCK_UN);
            }
            Ok(true)
        }
        Err(err) if err.raw_os_error() == Some(libc::EWOULDBLOCK) => Ok(false),
        Err(err) => Err(Error::io("Failed to lock", path, err)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_shared_suffix() {
        let spec = LockSpec::parse("/tmp/deploy.lock,r");
        assert_eq!(spec.path, PathBuf::from("/tmp/deploy.lock"));
        assert!(spec.shared);

        let spec = LockSpec::parse("/tmp/deploy.lock");
        assert!(!spec.shared);
    }

    #[test]
    fn exclusive_guard_blocks_second_taker() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("lock");
        let spec = LockSpec {
            path: path.clone(),
            shared: false,
        };

        let guard = acquire(&spec).unwrap();
        assert!(!try_exclusive(&path).unwrap());
        drop(guard);
        assert!(try_exclusive(&path).unwrap());
    }

    #[test]
    fn shared_guards_coexist() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("lock");
        let spec = LockSpec {
            path: path.clone(),
            shared: true,
        };

        let first = acquire(&spec).unwrap();
        let second = acquire(&spec).unwrap();
        assert!(!try_exclusive(&path).unwrap());
        drop(first);
        drop(second);
        assert!(try_exclusive(&path).unwrap());
    }

    #[test]
    fn locks_acquire_in_sorted_order() {
        let dir = tempfile::tempdir().unwrap();
        let b = LockSpec {
            path: dir.path().join("b"),
            shared: false,
        };
        let a = LockSpec {
            path: dir.path().join("a"),
            shared: false,
        };
        let guards = acquire_all(&[b.clone(), a.clone()]).unwrap();
        assert_eq!(guards[0].path, a.path);
        assert_eq!(guards[1].path, b.path);
    }
}
