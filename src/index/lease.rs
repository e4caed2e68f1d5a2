//! Writer exclusion across processes sharing the index volume.
//!
//! The lease is a small JSON file next to the index. It is created with
//! `hard_link`, which fails when the target exists, so the record is always
//! complete once visible. An expired (or unreadable) record may be broken by
//! any waiting writer; a crashed holder therefore blocks others for at most
//! one lease duration.

use std::fs::{self, File};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use uuid::Uuid;

use super::error::{IndexError, IndexResult};
use super::{now_ms, write_atomic};

pub(crate) const LOCK_FILE: &str = "write.lock";

#[derive(Debug, Clone)]
pub struct LeaseConfig {
    pub duration: Duration,
    pub acquire_timeout: Duration,
    pub poll_interval: Duration,
}

impl Default for LeaseConfig {
    fn default() -> Self {
        Self {
            duration: Duration::from_secs(600),
            acquire_timeout: Duration::from_secs(10),
            poll_interval: Duration::from_millis(50),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct LeaseRecord {
    pub holder: String,
    pub token: String,
    pub acquired_at_ms: i64,
    pub expires_at_ms: i64,
}

impl LeaseRecord {
    fn is_expired(&self, now: i64) -> bool {
        self.expires_at_ms <= now
    }
}

enum Observed {
    Absent,
    Held(LeaseRecord),
    Unreadable,
}

/// Exclusive write lease on one index directory. Released on drop.
#[derive(Debug)]
pub struct Lease {
    path: PathBuf,
    record: LeaseRecord,
    duration: Duration,
    released: bool,
}

impl Lease {
    pub fn acquire(root: &Path, holder: &str, config: &LeaseConfig) -> IndexResult<Lease> {
        let path = root.join(LOCK_FILE);
        let started = Instant::now();

        loop {
            if let Some(lease) = Self::try_create(&path, holder, config.duration)? {
                debug!(holder, waited_ms = started.elapsed().as_millis() as u64, "Index lease acquired");
                return Ok(lease);
            }

            match observe(&path)? {
                Observed::Absent => continue,
                Observed::Held(record) if record.is_expired(now_ms()) => {
                    warn!(
                        stale_holder = %record.holder,
                        expired_at_ms = record.expires_at_ms,
                        "Breaking expired index lease"
                    );
                    break_lease(&path, Some(&record))?;
                    continue;
                }
                Observed::Unreadable => {
                    warn!("Breaking unreadable index lease");
                    break_lease(&path, None)?;
                    continue;
                }
                Observed::Held(_) => {}
            }

            if started.elapsed() >= config.acquire_timeout {
                return Err(IndexError::LockTimeout(config.acquire_timeout));
            }
            thread::sleep(config.poll_interval);
        }
    }

    fn try_create(path: &Path, holder: &str, duration: Duration) -> IndexResult<Option<Lease>> {
        let now = now_ms();
        let record = LeaseRecord {
            holder: holder.to_string(),
            token: Uuid::new_v4().to_string(),
            acquired_at_ms: now,
            expires_at_ms: now + duration.as_millis() as i64,
        };

        let staging = path.with_file_name(format!(".{LOCK_FILE}.{}.tmp", record.token));
        {
            let mut file = File::create(&staging)?;
            file.write_all(&serde_json::to_vec(&record)?)?;
            file.sync_all()?;
        }

        let linked = fs::hard_link(&staging, path);
        let _ = fs::remove_file(&staging);

        match linked {
            Ok(()) => Ok(Some(Lease {
                path: path.to_path_buf(),
                record,
                duration,
                released: false,
            })),
            Err(e) if e.kind() == ErrorKind::AlreadyExists => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    pub fn holder(&self) -> &str {
        &self.record.holder
    }

    pub fn expires_at_ms(&self) -> i64 {
        self.record.expires_at_ms
    }

    /// Fails with `LeaseLost` unless this lease is still on disk and unexpired.
    pub fn verify(&self) -> IndexResult<()> {
        match observe(&self.path)? {
            Observed::Held(record)
                if record.token == self.record.token && !record.is_expired(now_ms()) =>
            {
                Ok(())
            }
            _ => Err(IndexError::LeaseLost),
        }
    }

    /// Pushes the expiry one full lease duration into the future.
    pub fn renew(&mut self) -> IndexResult<()> {
        self.verify()?;
        let mut record = self.record.clone();
        record.expires_at_ms = now_ms() + self.duration.as_millis() as i64;
        write_atomic(&self.path, &serde_json::to_vec(&record)?)?;
        self.record = record;
        Ok(())
    }

    pub fn release(mut self) -> IndexResult<()> {
        self.released = true;
        self.remove_if_owned()
    }

    fn remove_if_owned(&self) -> IndexResult<()> {
        match observe(&self.path)? {
            Observed::Held(record) if record.token == self.record.token => {
                match fs::remove_file(&self.path) {
                    Ok(()) => Ok(()),
                    Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
                    Err(e) => Err(e.into()),
                }
            }
            _ => Ok(()),
        }
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        if !self.released {
            if let Err(e) = self.remove_if_owned() {
                warn!("Failed to release index lease: {}", e);
            }
        }
    }
}

fn observe(path: &Path) -> IndexResult<Observed> {
    match fs::read(path) {
        Ok(bytes) => Ok(match serde_json::from_slice::<LeaseRecord>(&bytes) {
            Ok(record) => Observed::Held(record),
            Err(_) => Observed::Unreadable,
        }),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(Observed::Absent),
        Err(e) => Err(e.into()),
    }
}

/// Moves the lock file aside. When the file moved is not the record we
/// judged expired, another writer took over in between and the file is put
/// back.
fn break_lease(path: &Path, expected: Option<&LeaseRecord>) -> IndexResult<()> {
    let aside = path.with_file_name(format!(".{LOCK_FILE}.{}.broken", Uuid::new_v4()));

    match fs::rename(path, &aside) {
        Ok(()) => {}
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e.into()),
    }

    let moved = fs::read(&aside)
        .ok()
        .and_then(|bytes| serde_json::from_slice::<LeaseRecord>(&bytes).ok());

    let took_live_lease = match (expected, moved.as_ref()) {
        (Some(expected), Some(moved)) => moved.token != expected.token,
        (None, Some(moved)) => !moved.is_expired(now_ms()),
        _ => false,
    };

    if took_live_lease {
        match fs::hard_link(&aside, path) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {}
            Err(e) => return Err(e.into()),
        }
    }

    let _ = fs::remove_file(&aside);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn quick(duration_ms: u64, timeout_ms: u64) -> LeaseConfig {
        LeaseConfig {
            duration: Duration::from_millis(duration_ms),
            acquire_timeout: Duration::from_millis(timeout_ms),
            poll_interval: Duration::from_millis(5),
        }
    }

    #[test]
    fn second_writer_times_out_while_lease_is_held() {
        let dir = tempfile::tempdir().unwrap();
        let held = Lease::acquire(dir.path(), "a", &quick(60_000, 100)).unwrap();

        let err = Lease::acquire(dir.path(), "b", &quick(60_000, 100)).unwrap_err();
        assert!(matches!(err, IndexError::LockTimeout(_)));
        assert!(err.is_transient());

        held.release().unwrap();
        Lease::acquire(dir.path(), "b", &quick(60_000, 100)).unwrap();
    }

    #[test]
    fn expired_lease_of_crashed_holder_is_broken() {
        let dir = tempfile::tempdir().unwrap();
        let crashed = Lease::acquire(dir.path(), "crashed", &quick(20, 100)).unwrap();
        // A crashed process never runs its destructor.
        std::mem::forget(crashed);

        thread::sleep(Duration::from_millis(40));
        let lease = Lease::acquire(dir.path(), "next", &quick(60_000, 500)).unwrap();
        assert_eq!(lease.holder(), "next");
        lease.verify().unwrap();
    }

    #[test]
    fn unreadable_lock_file_is_broken() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join(LOCK_FILE), b"half-writ").unwrap();

        let lease = Lease::acquire(dir.path(), "w", &quick(60_000, 500)).unwrap();
        lease.verify().unwrap();
    }

    #[test]
    fn holder_notices_lost_lease() {
        let dir = tempfile::tempdir().unwrap();
        let first = Lease::acquire(dir.path(), "slow", &quick(20, 100)).unwrap();
        thread::sleep(Duration::from_millis(40));

        let _second = Lease::acquire(dir.path(), "fast", &quick(60_000, 500)).unwrap();
        assert!(matches!(first.verify(), Err(IndexError::LeaseLost)));

        // Dropping the stale holder must not remove the new lease.
        drop(first);
        assert!(dir.path().join(LOCK_FILE).exists());
    }

    #[test]
    fn renew_extends_expiry() {
        let dir = tempfile::tempdir().unwrap();
        let mut lease = Lease::acquire(dir.path(), "w", &quick(200, 100)).unwrap();
        let before = lease.expires_at_ms();
        thread::sleep(Duration::from_millis(10));
        lease.renew().unwrap();
        assert!(lease.expires_at_ms() > before);
        lease.verify().unwrap();
    }

    #[test]
    fn drop_releases_lease() {
        let dir = tempfile::tempdir().unwrap();
        {
            let _lease = Lease::acquire(dir.path(), "w", &quick(60_000, 100)).unwrap();
            assert!(dir.path().join(LOCK_FILE).exists());
        }
        assert!(!dir.path().join(LOCK_FILE).exists());
    }

    #[test]
    fn contending_threads_never_overlap() {
        let dir = tempfile::tempdir().unwrap();
        let root = Arc::new(dir.path().to_path_buf());
        let inside = Arc::new(AtomicUsize::new(0));
        let max_inside = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..6)
            .map(|i| {
                let root = root.clone();
                let inside = inside.clone();
                let max_inside = max_inside.clone();
                thread::spawn(move || {
                    for _ in 0..5 {
                        let lease =
                            Lease::acquire(&root, &format!("w{i}"), &quick(60_000, 10_000)).unwrap();
                        let now = inside.fetch_add(1, Ordering::SeqCst) + 1;
                        max_inside.fetch_max(now, Ordering::SeqCst);
                        thread::sleep(Duration::from_millis(2));
                        inside.fetch_sub(1, Ordering::SeqCst);
                        lease.release().unwrap();
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(max_inside.load(Ordering::SeqCst), 1);
    }
}
