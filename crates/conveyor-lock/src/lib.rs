//! The global-lock + invocation-nonce protocol.
//!
//! Unlike a conventional single-owner file lock (PID + hostname, released on
//! `Drop`), ownership here is the pair `(run_id, invocation_id)`: two
//! concurrent invocations of the *same* run must not both believe they hold
//! the lock. The lock is a TTL lease that must be renewed before every state
//! write; it is never released on yield, only when the orchestrator reaches
//! a true terminal state. The record is persisted as JSON via the same
//! atomic tmp-file + rename discipline used for run-record writes, so a
//! crash mid-write can never leave a torn lock file on disk.

use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use conveyor_types::LockRecord;
use thiserror::Error;
use uuid::Uuid;

pub const LOCK_FILE: &str = "lock.json";
pub const LOCK_NAME: &str = "global_sync";
pub const DEFAULT_LOCK_TTL_SECONDS: u64 = 120;

#[derive(Debug, Error)]
pub enum LockError {
    #[error("io error accessing lock file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to serialize lock record: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("lock ownership lost: expected run_id={expected_run}/invocation_id={expected_inv}, found {found:?}")]
    OwnershipLost {
        expected_run: Uuid,
        expected_inv: Uuid,
        found: Option<LockRecord>,
    },
}

pub fn lock_path(state_dir: &Path) -> PathBuf {
    state_dir.join(LOCK_FILE)
}

/// Persistent store for the single named lock row.
///
/// There is exactly one lock record system-wide (`lock_name = "global_sync"`);
/// the file at `state_dir/lock.json` *is* that row. `state_dir` here is a
/// process-wide root, not the per-run state directory.
pub struct LockStore {
    path: PathBuf,
}

impl LockStore {
    pub fn new(root_state_dir: &Path) -> Self {
        Self {
            path: lock_path(root_state_dir),
        }
    }

    fn io_err(&self, source: std::io::Error) -> LockError {
        LockError::Io {
            path: self.path.clone(),
            source,
        }
    }

    pub fn read(&self) -> Result<Option<LockRecord>, LockError> {
        if !self.path.exists() {
            return Ok(None);
        }
        let data = fs::read_to_string(&self.path).map_err(|e| self.io_err(e))?;
        if data.trim().is_empty() {
            return Ok(None);
        }
        let record: LockRecord = serde_json::from_str(&data)?;
        Ok(Some(record))
    }

    fn write_atomic(&self, record: &LockRecord) -> Result<(), LockError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(|e| self.io_err(e))?;
        }
        let tmp_path = self.path.with_extension("json.tmp");
        let json = serde_json::to_string_pretty(record)?;
        {
            let mut f = File::create(&tmp_path).map_err(|e| self.io_err(e))?;
            f.write_all(json.as_bytes()).map_err(|e| self.io_err(e))?;
            f.sync_all().map_err(|e| self.io_err(e))?;
        }
        fs::rename(&tmp_path, &self.path).map_err(|e| self.io_err(e))?;
        if let Some(parent) = self.path.parent() {
            if let Ok(dir) = File::open(parent) {
                let _ = dir.sync_all();
            }
        }
        Ok(())
    }

    fn delete(&self) -> Result<bool, LockError> {
        if !self.path.exists() {
            return Ok(false);
        }
        fs::remove_file(&self.path).map_err(|e| self.io_err(e))?;
        Ok(true)
    }

    /// `try_acquire_sync_lock`: succeeds only if the row is absent or its
    /// lease has expired. A successful call always installs `invocation_id`
    /// as the new owner with a fresh lease.
    pub fn try_acquire(
        &self,
        run_id: Uuid,
        invocation_id: Uuid,
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> Result<bool, LockError> {
        let current = self.read()?;
        let admits = match &current {
            None => true,
            Some(existing) => existing.lease_until < now,
        };
        if !admits {
            return Ok(false);
        }
        let record = LockRecord {
            run_id,
            invocation_id,
            lease_until: now + chrono::Duration::from_std(ttl).unwrap_or_default(),
            updated_at: now,
        };
        self.write_atomic(&record)?;
        Ok(true)
    }

    /// Atomically extend the lease for an existing `(run_id, invocation_id)`
    /// owner. Returns `false` (without mutating anything) if the row does
    /// not match that exact pair, so the caller can fall back to
    /// [`LockStore::try_acquire`].
    pub fn renew(
        &self,
        run_id: Uuid,
        invocation_id: Uuid,
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> Result<bool, LockError> {
        let current = self.read()?;
        match current {
            Some(existing) if existing.run_id == run_id && existing.invocation_id == invocation_id => {
                let record = LockRecord {
                    run_id,
                    invocation_id,
                    lease_until: now + chrono::Duration::from_std(ttl).unwrap_or_default(),
                    updated_at: now,
                };
                self.write_atomic(&record)?;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    /// Acquire-or-renew in one call: the step every tick takes before a
    /// write.
    pub fn acquire_or_renew(
        &self,
        run_id: Uuid,
        invocation_id: Uuid,
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> Result<bool, LockError> {
        if self.renew(run_id, invocation_id, ttl, now)? {
            return Ok(true);
        }
        self.try_acquire(run_id, invocation_id, ttl, now)
    }

    /// `assert_owned`: every state write is preceded by this check.
    pub fn assert_owned(&self, run_id: Uuid, invocation_id: Uuid, now: DateTime<Utc>) -> Result<(), LockError> {
        let current = self.read()?;
        match &current {
            Some(existing)
                if existing.run_id == run_id
                    && existing.invocation_id == invocation_id
                    && existing.lease_until >= now =>
            {
                Ok(())
            }
            other => Err(LockError::OwnershipLost {
                expected_run: run_id,
                expected_inv: invocation_id,
                found: other.clone(),
            }),
        }
    }

    /// `release_sync_lock`: only called on the orchestrator's true-finish
    /// path, never on yield.
    pub fn release(&self, run_id: Uuid) -> Result<bool, LockError> {
        match self.read()? {
            Some(existing) if existing.run_id == run_id => self.delete(),
            _ => Ok(false),
        }
    }

    pub fn is_locked(&self, now: DateTime<Utc>) -> Result<bool, LockError> {
        Ok(matches!(self.read()?, Some(r) if r.lease_until >= now))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn try_acquire_succeeds_on_empty_lock() {
        let td = tempdir().unwrap();
        let store = LockStore::new(td.path());
        let now = Utc::now();
        assert!(store.try_acquire(Uuid::new_v4(), Uuid::new_v4(), Duration::from_secs(120), now).unwrap());
    }

    #[test]
    fn try_acquire_fails_while_lease_is_live() {
        let td = tempdir().unwrap();
        let store = LockStore::new(td.path());
        let now = Utc::now();
        let run_a = Uuid::new_v4();
        assert!(store.try_acquire(run_a, Uuid::new_v4(), Duration::from_secs(120), now).unwrap());

        let run_b = Uuid::new_v4();
        assert!(!store.try_acquire(run_b, Uuid::new_v4(), Duration::from_secs(120), now).unwrap());
    }

    #[test]
    fn try_acquire_succeeds_after_lease_expires() {
        let td = tempdir().unwrap();
        let store = LockStore::new(td.path());
        let now = Utc::now();
        let run_a = Uuid::new_v4();
        assert!(store.try_acquire(run_a, Uuid::new_v4(), Duration::from_secs(10), now).unwrap());

        let later = now + chrono::Duration::seconds(11);
        let run_b = Uuid::new_v4();
        assert!(store.try_acquire(run_b, Uuid::new_v4(), Duration::from_secs(120), later).unwrap());
    }

    #[test]
    fn renew_requires_exact_pair_match() {
        let td = tempdir().unwrap();
        let store = LockStore::new(td.path());
        let now = Utc::now();
        let run_id = Uuid::new_v4();
        let inv_a = Uuid::new_v4();
        assert!(store.try_acquire(run_id, inv_a, Duration::from_secs(120), now).unwrap());

        // a second invocation of the same run must not be able to renew
        let inv_b = Uuid::new_v4();
        assert!(!store.renew(run_id, inv_b, Duration::from_secs(120), now).unwrap());

        // the true owner can
        assert!(store.renew(run_id, inv_a, Duration::from_secs(120), now).unwrap());
    }

    #[test]
    fn assert_owned_fails_once_another_invocation_takes_over() {
        let td = tempdir().unwrap();
        let store = LockStore::new(td.path());
        let now = Utc::now();
        let run_id = Uuid::new_v4();
        let inv_a = Uuid::new_v4();
        store.try_acquire(run_id, inv_a, Duration::from_secs(1), now).unwrap();

        let later = now + chrono::Duration::seconds(2);
        let inv_b = Uuid::new_v4();
        assert!(store.try_acquire(run_id, inv_b, Duration::from_secs(120), later).unwrap());

        assert!(store.assert_owned(run_id, inv_a, later).is_err());
        assert!(store.assert_owned(run_id, inv_b, later).is_ok());
    }

    #[test]
    fn release_only_clears_the_matching_run() {
        let td = tempdir().unwrap();
        let store = LockStore::new(td.path());
        let now = Utc::now();
        let run_id = Uuid::new_v4();
        let inv = Uuid::new_v4();
        store.try_acquire(run_id, inv, Duration::from_secs(120), now).unwrap();

        assert!(!store.release(Uuid::new_v4()).unwrap());
        assert!(store.is_locked(now).unwrap());
        assert!(store.release(run_id).unwrap());
        assert!(!store.is_locked(now).unwrap());
    }

    #[test]
    fn acquire_or_renew_falls_back_to_try_acquire_after_expiry() {
        let td = tempdir().unwrap();
        let store = LockStore::new(td.path());
        let now = Utc::now();
        let run_a = Uuid::new_v4();
        store.try_acquire(run_a, Uuid::new_v4(), Duration::from_secs(1), now).unwrap();

        let later = now + chrono::Duration::seconds(5);
        let run_b = Uuid::new_v4();
        let inv_b = Uuid::new_v4();
        assert!(store.acquire_or_renew(run_b, inv_b, Duration::from_secs(120), later).unwrap());
        assert!(store.assert_owned(run_b, inv_b, later).is_ok());
    }
}
