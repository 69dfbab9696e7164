//! Cross-process exclusion for `Device` endpoints via a PID lockfile.
//!
//! Grounded on the teacher's `src/serial.rs` (`TIOCEXCL`, exclusive
//! open) for the "claim the device before anyone else can" shape, with
//! the actual naming/staleness rules taken from `original_source`
//! (`mdevlockname`, the `LCK..`/SVR4 `LK.` schemes).
use std::fs::{self, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use nix::sys::signal::kill;
use nix::unistd::Pid;
use thiserror::Error;
use tracing::{info, warn};

use crate::diag::DiagnosableError;

#[derive(Debug, Error)]
pub enum LockError {
    #[error("Device {0} is locked.")]
    Locked(String),
    #[error("Failed to read lockfile {}: {1}", .0.display())]
    ReadFailed(PathBuf, #[source] std::io::Error),
    #[error("Failed to create lockfile {}: {1}", .0.display())]
    CreateFailed(PathBuf, #[source] std::io::Error),
    #[error("Failed to remove lockfile {}: {1}", .0.display())]
    RemoveFailed(PathBuf, #[source] std::io::Error),
}

impl DiagnosableError for LockError {
    fn diagnose(&self) -> Vec<String> {
        match self {
            LockError::Locked(dev) => vec![format!(
                "Another process holds the lock on {dev}. If that process is gone, \
                 its lockfile will be treated as stale and overridden automatically."
            )],
            _ => vec![],
        }
    }
}

/// Derives the name a lockfile would have for `device_path`, mirroring
/// `mdevlockname`: strip a leading `/dev/` and replace the remaining
/// path separators with `_`; outside of `/dev/`, just take the
/// basename.
pub fn device_lock_name(device_path: &str) -> String {
    let stripped = device_path.strip_prefix("/dev/");
    let raw = match stripped {
        Some(rest) => rest.to_string(),
        None => device_path
            .rsplit('/')
            .next()
            .unwrap_or(device_path)
            .to_string(),
    };

    if stripped.is_some() {
        raw.replace('/', "_")
    } else {
        raw
    }
}

pub fn lock_path(lock_dir: &Path, device_path: &str) -> PathBuf {
    lock_dir.join(format!("LCK..{}", device_lock_name(device_path)))
}

/// SVR4-style name, keyed off major/minor rather than path, per
/// spec.md §4.2. `major`/`minor` follow glibc's `gnu_dev_{major,minor}`
/// bit layout for a `dev_t`.
pub fn svr4_lock_path(lock_dir: &Path, rdev: u64) -> PathBuf {
    let major = ((rdev >> 8) & 0xfff) | ((rdev >> 32) & !0xfff);
    let minor = (rdev & 0xff) | ((rdev >> 12) & !0xff);
    lock_dir.join(format!("LK.{:03}.{:03}", major, minor))
}

pub struct Lockfile {
    path: PathBuf,
}

impl Lockfile {
    /// Acquires the lockfile for `device_path` under `lock_dir`,
    /// overriding a stale one if found. Returns `None` if `lock_dir`
    /// does not exist (lockfiles are then simply not used, per
    /// spec.md §4.1 step 1).
    pub fn acquire(lock_dir: &Path, device_path: &str) -> Result<Option<Self>, LockError> {
        if !lock_dir.exists() {
            return Ok(None);
        }

        let path = lock_path(lock_dir, device_path);
        if let Some(pid) = read_lockfile(&path)? {
            if process_alive(pid) {
                return Err(LockError::Locked(device_path.to_string()));
            }
            warn!(path = %path.display(), pid, "lockfile is stale, overriding it");
            eprintln!("Lockfile is stale. Overriding it..");
            std::thread::sleep(std::time::Duration::from_secs(1));
            fs::remove_file(&path).map_err(|e| LockError::RemoveFailed(path.clone(), e))?;
        }

        let mut file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .map_err(|e| LockError::CreateFailed(path.clone(), e))?;
        write!(file, "{}", std::process::id()).map_err(|e| LockError::CreateFailed(path.clone(), e))?;
        info!(path = %path.display(), pid = std::process::id(), "acquired lockfile");

        Ok(Some(Lockfile { path }))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for Lockfile {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.path);
    }
}

/// Reads a PID out of a lockfile, accepting both the ASCII-decimal and
/// 4-byte native-endian (Kermit) encodings, per spec.md §3/§4.2.
fn read_lockfile(path: &Path) -> Result<Option<i32>, LockError> {
    let mut file = match fs::File::open(path) {
        Ok(f) => f,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(LockError::ReadFailed(path.to_path_buf(), e)),
    };

    let mut buf = Vec::new();
    file.read_to_end(&mut buf)
        .map_err(|e| LockError::ReadFailed(path.to_path_buf(), e))?;

    if buf.is_empty() {
        return Ok(None);
    }

    if buf.len() == 4 {
        let pid = i32::from_ne_bytes([buf[0], buf[1], buf[2], buf[3]]);
        return Ok(Some(pid));
    }

    let text = String::from_utf8_lossy(&buf);
    let digits: String = text.trim().chars().take_while(|c| c.is_ascii_digit()).collect();
    Ok(digits.parse::<i32>().ok())
}

/// `kill(pid, 0)` staleness probe: ESRCH means the process is gone and
/// the lock is stale; anything else (including EPERM, a live process
/// owned by someone else) means it's still live.
fn process_alive(pid: i32) -> bool {
    if pid <= 0 {
        return true;
    }
    match kill(Pid::from_raw(pid), None) {
        Err(nix::errno::Errno::ESRCH) => false,
        _ => true,
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn dev_path_name() {
        assert_eq!(device_lock_name("/dev/ttyUSB0"), "LCK..ttyUSB0".trim_start_matches("LCK.."));
        assert_eq!(device_lock_name("/dev/ttyUSB0"), "ttyUSB0");
    }

    #[test]
    fn dev_subdirectory_name() {
        assert_eq!(
            device_lock_name("/dev/serial/by-id/foo/bar"),
            "serial_by-id_foo_bar"
        );
    }

    #[test]
    fn non_dev_path_uses_basename() {
        assert_eq!(device_lock_name("/run/my-serial/port0"), "port0");
    }

    #[test]
    fn lock_path_matches_scenario_s1() {
        let path = lock_path(Path::new("/var/lock"), "/dev/ttyUSB0");
        assert_eq!(path, Path::new("/var/lock/LCK..ttyUSB0"));
    }

    #[test]
    fn svr4_name_is_zero_padded() {
        let path = svr4_lock_path(Path::new("/var/lock"), (4u64 << 8) | 2u64);
        assert_eq!(path, Path::new("/var/lock/LK.004.002"));
    }

    #[test]
    fn stale_pid_detected() {
        // PID 1 is conventionally alive (init/systemd); a PID far
        // beyond any plausible allocation is reliably absent.
        assert!(process_alive(1));
        assert!(!process_alive(i32::MAX - 1));
    }

    #[test]
    fn acquire_without_lock_dir_is_noop() {
        let missing = Path::new("/nonexistent-comterm-lock-dir");
        assert!(Lockfile::acquire(missing, "/dev/ttyUSB0").unwrap().is_none());
    }

    #[test]
    fn acquire_then_drop_removes_file() {
        let dir = std::env::temp_dir().join(format!("comterm-lock-test-{}", std::process::id()));
        fs::create_dir_all(&dir).unwrap();

        let device = "/dev/comterm-test-lock";
        let lock = Lockfile::acquire(&dir, device).unwrap().unwrap();
        let path = lock.path().to_path_buf();
        assert!(path.exists());
        let contents = fs::read_to_string(&path).unwrap();
        assert_eq!(contents, std::process::id().to_string());

        drop(lock);
        assert!(!path.exists());

        fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn stale_lock_is_overridden() {
        let dir = std::env::temp_dir().join(format!("comterm-lock-stale-{}", std::process::id()));
        fs::create_dir_all(&dir).unwrap();

        let device = "/dev/comterm-test-stale";
        let path = lock_path(&dir, device);
        fs::write(&path, format!("{}", i32::MAX - 1)).unwrap();

        let lock = Lockfile::acquire(&dir, device).unwrap().unwrap();
        let contents = fs::read_to_string(lock.path()).unwrap();
        assert_eq!(contents, std::process::id().to_string());

        drop(lock);
        fs::remove_dir_all(&dir).ok();
    }
}
