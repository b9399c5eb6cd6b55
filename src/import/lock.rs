use chrono::Utc;
use log::{debug, warn};
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, SystemTime};
use thiserror::Error;

const POLL_INTERVAL: Duration = Duration::from_millis(50);

#[derive(Debug, Error)]
pub enum LockError {
    #[error("lock {0} is held by another run")]
    Busy(PathBuf),
    #[error("lock file error: {0}")]
    Io(#[from] io::Error),
}

/// Held for the duration of a run; the lock file is removed on drop if it is
/// still ours.
#[derive(Debug)]
pub struct RunLockGuard {
    path: PathBuf,
    token: String,
}

impl Drop for RunLockGuard {
    fn drop(&mut self) {
        match fs::read_to_string(&self.path) {
            Ok(content) if content.trim() == self.token => match fs::remove_file(&self.path) {
                Ok(()) => debug!("released run lock {}", self.path.display()),
                Err(e) => warn!("could not release run lock {}: {e}", self.path.display()),
            },
            Ok(_) => warn!(
                "run lock {} was taken over by another run; leaving it",
                self.path.display()
            ),
            Err(e) => warn!("could not read run lock {}: {e}", self.path.display()),
        }
    }
}

pub fn acquire(
    path: &Path,
    timeout: Duration,
    stale_after: Duration,
) -> Result<RunLockGuard, LockError> {
    let deadline = SystemTime::now() + timeout;
    loop {
        match OpenOptions::new().write(true).create_new(true).open(path) {
            Ok(mut file) => {
                let now = Utc::now();
                let token = format!(
                    "{} {} {}",
                    std::process::id(),
                    now.timestamp(),
                    now.timestamp_subsec_nanos()
                );
                let guard = RunLockGuard {
                    path: path.to_path_buf(),
                    token,
                };
                writeln!(file, "{}", guard.token)?;
                debug!("acquired run lock {}", path.display());
                return Ok(guard);
            }
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                if is_stale(path, stale_after) {
                    take_over_stale(path, stale_after)?;
                    continue;
                }
                if SystemTime::now() >= deadline {
                    return Err(LockError::Busy(path.to_path_buf()));
                }
                thread::sleep(POLL_INTERVAL);
            }
            Err(e) => return Err(e.into()),
        }
    }
}

/// Move the lock aside with an atomic rename, then delete it only if the
/// file we moved is still the stale one. A fresh lock moved by mistake is put
/// back unless another run already holds the path.
fn take_over_stale(path: &Path, stale_after: Duration) -> io::Result<()> {
    let aside = path.with_extension(format!("stale.{}", std::process::id()));
    match fs::rename(path, &aside) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e),
    }

    if is_stale(&aside, stale_after) {
        warn!("took over stale run lock {}", path.display());
        return fs::remove_file(&aside);
    }

    let restored = fs::hard_link(&aside, path);
    fs::remove_file(&aside)?;
    match restored {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::AlreadyExists => Ok(()),
        Err(e) => Err(e),
    }
}

fn is_stale(path: &Path, stale_after: Duration) -> bool {
    let acquired_at = fs::read_to_string(path)
        .ok()
        .and_then(|s| s.split_whitespace().nth(1)?.parse::<i64>().ok());

    let age_secs = match acquired_at {
        Some(ts) => Utc::now().timestamp() - ts,
        None => match fs::metadata(path).and_then(|m| m.modified()) {
            Ok(modified) => SystemTime::now()
                .duration_since(modified)
                .map(|d| d.as_secs() as i64)
                .unwrap_or(0),
            Err(_) => return false,
        },
    };
    age_secs > stale_after.as_secs() as i64
}
