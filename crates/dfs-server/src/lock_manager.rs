//! Lock Manager for write leases
//!
//! Grants at most one exclusive write lock per filename. Every lock is a
//! lease: it expires on its own if the holder crashes or is partitioned,
//! so a lost writer never blocks other clients for good.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use thiserror::Error;
use tracing::{debug, info, warn};

use dfs_core::{ClientId, DEFAULT_LEASE_SECS};

/// Lock hold information
#[derive(Clone, Debug)]
pub struct LockHold {
    /// Client holding the lock
    pub holder: ClientId,
    /// When the lock was acquired
    pub acquired_at: Instant,
    /// When the lease runs out unless renewed
    pub expires_at: Instant,
}

impl LockHold {
    /// Check if this lock is expired
    pub fn is_expired(&self) -> bool {
        Instant::now() >= self.expires_at
    }

    /// Time remaining until expiration
    pub fn time_remaining(&self) -> Duration {
        self.expires_at.saturating_duration_since(Instant::now())
    }
}

/// Lock errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LockError {
    #[error("write lock held by client {holder}, retry after {retry_after:?}")]
    Conflict {
        holder: ClientId,
        retry_after: Duration,
    },
    #[error("write lock not held")]
    NotHeld,
}

/// Lock manager for coordinating write access per filename
pub struct LockManager {
    /// Active locks by filename
    locks: RwLock<HashMap<String, LockHold>>,
    /// Lease granted on acquire and on every renewal
    lease: Duration,
}

impl LockManager {
    pub fn new(lease: Duration) -> Self {
        Self {
            locks: RwLock::new(HashMap::new()),
            lease,
        }
    }

    pub fn lease(&self) -> Duration {
        self.lease
    }

    /// Acquire the write lock on `filename` for `holder`
    pub fn acquire(&self, filename: &str, holder: ClientId) -> Result<LockHold, LockError> {
        let mut locks = self.locks.write();

        if let Some(existing) = locks.get(filename) {
            if !existing.is_expired() {
                return Err(LockError::Conflict {
                    holder: existing.holder,
                    retry_after: existing.time_remaining(),
                });
            }
            warn!(
                "Expired write lock: file={}, holder={}",
                filename, existing.holder
            );
        }

        let now = Instant::now();
        let hold = LockHold {
            holder,
            acquired_at: now,
            expires_at: now + self.lease,
        };
        locks.insert(filename.to_string(), hold.clone());
        info!("Write lock acquired: file={}, holder={}", filename, holder);
        Ok(hold)
    }

    /// Release the lock on `filename` if `holder` still owns it
    pub fn release(&self, filename: &str, holder: ClientId) -> Result<(), LockError> {
        let mut locks = self.locks.write();
        match locks.get(filename) {
            Some(hold) if hold.holder == holder => {
                let expired = hold.is_expired();
                locks.remove(filename);
                if expired {
                    debug!("Released already-expired lock: file={}", filename);
                    Err(LockError::NotHeld)
                } else {
                    info!("Write lock released: file={}, holder={}", filename, holder);
                    Ok(())
                }
            }
            _ => Err(LockError::NotHeld),
        }
    }

    /// Extend a live lease by a full lease period
    pub fn renew(&self, filename: &str, holder: ClientId) -> Result<Instant, LockError> {
        let mut locks = self.locks.write();
        match locks.get_mut(filename) {
            Some(hold) if hold.holder == holder && !hold.is_expired() => {
                hold.expires_at = Instant::now() + self.lease;
                debug!("Lease renewed: file={}, ttl={:?}", filename, self.lease);
                Ok(hold.expires_at)
            }
            _ => Err(LockError::NotHeld),
        }
    }

    /// Drop every expired lease, returning how many were removed
    pub fn cleanup_expired(&self) -> usize {
        let mut locks = self.locks.write();
        let before = locks.len();
        locks.retain(|filename, hold| {
            if hold.is_expired() {
                warn!(
                    "Expired write lock: file={}, holder={}",
                    filename, hold.holder
                );
                false
            } else {
                true
            }
        });
        before - locks.len()
    }

    /// Release all locks held by a specific client
    pub fn release_all_by_holder(&self, holder: ClientId) -> usize {
        let mut locks = self.locks.write();
        let before = locks.len();
        locks.retain(|_, hold| hold.holder != holder);
        let released = before - locks.len();
        if released > 0 {
            info!("Released {} write locks for client {}", released, holder);
        }
        released
    }
}

impl Default for LockManager {
    fn default() -> Self {
        Self::new(Duration::from_secs(DEFAULT_LEASE_SECS))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn conflict_holder(lm: &LockManager, filename: &str, client: ClientId) -> Option<ClientId> {
        match lm.acquire(filename, client) {
            Err(LockError::Conflict { holder, .. }) => Some(holder),
            Err(LockError::NotHeld) => panic!("acquire never reports NotHeld"),
            Ok(_) => None,
        }
    }

    #[test]
    fn test_exclusive_write_lock() {
        let lm = LockManager::default();
        lm.acquire("abc", 1).unwrap();

        assert_eq!(conflict_holder(&lm, "abc", 2), Some(1));

        // Different file is independent
        assert!(lm.acquire("other", 2).is_ok());

        lm.release("abc", 1).unwrap();
        assert!(lm.acquire("abc", 2).is_ok());
    }

    #[test]
    fn test_holder_cannot_reacquire() {
        let lm = LockManager::default();
        lm.acquire("abc", 1).unwrap();
        assert_eq!(conflict_holder(&lm, "abc", 1), Some(1));
    }

    #[test]
    fn test_release_requires_holder() {
        let lm = LockManager::default();
        lm.acquire("abc", 1).unwrap();

        assert_eq!(lm.release("abc", 2), Err(LockError::NotHeld));
        assert_eq!(conflict_holder(&lm, "abc", 3), Some(1));
        assert_eq!(lm.release("missing", 1), Err(LockError::NotHeld));
    }

    #[test]
    fn test_renew() {
        let lm = LockManager::new(Duration::from_secs(10));
        let hold = lm.acquire("abc", 1).unwrap();

        let renewed = lm.renew("abc", 1).unwrap();
        assert!(renewed >= hold.expires_at);
        assert_eq!(lm.renew("abc", 2), Err(LockError::NotHeld));
        assert_eq!(lm.renew("xyz", 1), Err(LockError::NotHeld));
    }

    #[test]
    fn test_lock_expiration() {
        let lm = LockManager::new(Duration::from_millis(10));
        lm.acquire("abc", 1).unwrap();

        std::thread::sleep(Duration::from_millis(20));

        assert_eq!(lm.renew("abc", 1), Err(LockError::NotHeld));

        // Another client can take over an expired lease
        assert!(lm.acquire("abc", 2).is_ok());
        assert_eq!(conflict_holder(&lm, "abc", 1), Some(2));

        // The lapsed holder's release does not free the new lease
        assert_eq!(lm.release("abc", 1), Err(LockError::NotHeld));
        assert_eq!(conflict_holder(&lm, "abc", 3), Some(2));
    }

    #[test]
    fn test_release_after_expiry_reports_not_held() {
        let lm = LockManager::new(Duration::from_millis(10));
        lm.acquire("abc", 1).unwrap();
        std::thread::sleep(Duration::from_millis(20));

        assert_eq!(lm.release("abc", 1), Err(LockError::NotHeld));
        assert!(lm.acquire("abc", 2).is_ok());
    }

    #[test]
    fn test_cleanup_expired() {
        let lm = LockManager::new(Duration::from_millis(10));
        lm.acquire("a", 1).unwrap();
        lm.acquire("b", 2).unwrap();

        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(lm.cleanup_expired(), 2);
        assert_eq!(lm.cleanup_expired(), 0);
    }

    #[test]
    fn test_release_by_holder() {
        let lm = LockManager::default();
        lm.acquire("a", 1).unwrap();
        lm.acquire("b", 1).unwrap();
        lm.acquire("c", 2).unwrap();

        assert_eq!(lm.release_all_by_holder(1), 2);

        assert_eq!(conflict_holder(&lm, "a", 3), None);
        assert_eq!(conflict_holder(&lm, "b", 3), None);
        assert_eq!(conflict_holder(&lm, "c", 3), Some(2));
    }
}
