//! Run guard: a short-lived marker that collapses duplicate reconciliation
//! triggers for the same migration.
//!
//! The marker is not authoritative. Losing it costs at most one redundant
//! pass, so every cache failure is logged and treated as "not run yet".

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::error::ReconError;

/// Five minutes plus a five second grace period.
pub const DEFAULT_GUARD_TTL_SECS: u64 = 305;

pub fn cache_id(migration_id: &str) -> String {
    format!("reconcile:{migration_id}")
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GuardToken {
    pub migration_id: String,
    pub timestamp: DateTime<Utc>,
    pub ttl_secs: u64,
}

impl GuardToken {
    /// Saturates at the latest representable instant for oversized TTLs.
    pub fn expires_at(&self) -> DateTime<Utc> {
        i64::try_from(self.ttl_secs)
            .ok()
            .and_then(Duration::try_seconds)
            .and_then(|ttl| self.timestamp.checked_add_signed(ttl))
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }

    pub fn is_live(&self, now: DateTime<Utc>) -> bool {
        now < self.expires_at()
    }
}

// ---------------------------------------------------------------------------
// Clock
// ---------------------------------------------------------------------------

pub trait Clock {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self { now: Mutex::new(start) }
    }

    pub fn advance(&self, secs: i64) {
        let mut now = self.now.lock();
        *now += Duration::seconds(secs);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock()
    }
}

impl<C: Clock + ?Sized> Clock for Arc<C> {
    fn now(&self) -> DateTime<Utc> {
        (**self).now()
    }
}

// ---------------------------------------------------------------------------
// Cache
// ---------------------------------------------------------------------------

/// Volatile key/value cache with expiry.
pub trait GuardCache {
    /// Live token for `cid`; expired tokens are invisible.
    fn get(&self, cid: &str, now: DateTime<Utc>) -> Result<Option<GuardToken>, ReconError>;

    fn set(&self, cid: &str, token: &GuardToken) -> Result<(), ReconError>;

    fn delete(&self, cid: &str) -> Result<(), ReconError>;
}

#[derive(Debug, Default)]
pub struct MemoryGuardCache {
    entries: Mutex<HashMap<String, GuardToken>>,
}

impl MemoryGuardCache {
    pub fn new() -> Self {
        Self::default()
    }
}

impl GuardCache for MemoryGuardCache {
    fn get(&self, cid: &str, now: DateTime<Utc>) -> Result<Option<GuardToken>, ReconError> {
        let mut entries = self.entries.lock();
        match entries.get(cid) {
            Some(token) if token.is_live(now) => Ok(Some(token.clone())),
            Some(_) => {
                entries.remove(cid);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    fn set(&self, cid: &str, token: &GuardToken) -> Result<(), ReconError> {
        self.entries.lock().insert(cid.to_string(), token.clone());
        Ok(())
    }

    fn delete(&self, cid: &str) -> Result<(), ReconError> {
        self.entries.lock().remove(cid);
        Ok(())
    }
}

impl<G: GuardCache + ?Sized> GuardCache for Arc<G> {
    fn get(&self, cid: &str, now: DateTime<Utc>) -> Result<Option<GuardToken>, ReconError> {
        (**self).get(cid, now)
    }

    fn set(&self, cid: &str, token: &GuardToken) -> Result<(), ReconError> {
        (**self).set(cid, token)
    }

    fn delete(&self, cid: &str) -> Result<(), ReconError> {
        (**self).delete(cid)
    }
}

// ---------------------------------------------------------------------------
// Guard
// ---------------------------------------------------------------------------

pub struct RunGuard {
    cache: Box<dyn GuardCache>,
    clock: Box<dyn Clock>,
}

impl RunGuard {
    pub fn new(cache: Box<dyn GuardCache>, clock: Box<dyn Clock>) -> Self {
        Self { cache, clock }
    }

    /// In-memory guard on the system clock.
    pub fn in_memory() -> Self {
        Self::new(Box::new(MemoryGuardCache::new()), Box::new(SystemClock))
    }

    /// Whether a reconciliation for `migration_id` ran within its window.
    pub fn should_skip(&self, migration_id: &str) -> bool {
        match self.cache.get(&cache_id(migration_id), self.clock.now()) {
            Ok(token) => token.is_some(),
            Err(e) => {
                log::warn!("run guard read failed for '{migration_id}', proceeding: {e}");
                false
            }
        }
    }

    pub fn mark_run(&self, migration_id: &str, ttl_secs: u64) {
        let token = GuardToken {
            migration_id: migration_id.to_string(),
            timestamp: self.clock.now(),
            ttl_secs,
        };
        if let Err(e) = self.cache.set(&cache_id(migration_id), &token) {
            log::warn!("run guard write failed for '{migration_id}': {e}");
        }
    }

    pub fn clear(&self, migration_id: &str) {
        if let Err(e) = self.cache.delete(&cache_id(migration_id)) {
            log::warn!("run guard clear failed for '{migration_id}': {e}");
        }
    }
}
