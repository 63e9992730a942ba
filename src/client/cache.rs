//! Process-wide license cache.
//!
//! Holds the last known [`LicenseStatus`] with the time it was fetched.
//! Reads are synchronous and never touch the network or the disk; writes
//! and invalidations replace the whole entry and are mirrored into a
//! [`CacheStore`] so the entry survives restarts.
//!
//! Expiry is lazy: an entry older than the TTL is reported absent by
//! [`LicenseCache::read`] but stays in place, so it can still serve as
//! last-known-good data through [`LicenseCache::read_stale`] while the
//! server is unreachable.
//!
//! Every [`LicenseCache::invalidate`] bumps a generation counter. Writers
//! that started before an invalidation use [`LicenseCache::write_if_current`]
//! and lose, which keeps a slow pre-activation fetch from resurrecting stale
//! truth.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use crate::client::license::LicenseStatus;
use crate::client::storage::CacheStore;
use crate::clock::Clock;
use crate::errors::{LicenseError, LicenseResult};

/// Where an answer came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CacheSource {
    /// Fetched from the server just now.
    Network,
    /// Served from the cache within its TTL.
    SessionCache,
    /// Served from a stale entry because the server was unreachable.
    Fallback,
}

/// One cached answer. Always replaced wholesale.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheEntry {
    pub status: LicenseStatus,
    pub fetched_at: DateTime<Utc>,
    pub source: CacheSource,
}

impl CacheEntry {
    pub fn new(status: LicenseStatus, fetched_at: DateTime<Utc>, source: CacheSource) -> Self {
        Self {
            status,
            fetched_at,
            source,
        }
    }

    /// Age at `now`. Entries stamped in the future have no valid age.
    fn age_at(&self, now: DateTime<Utc>) -> Option<Duration> {
        let age = now - self.fetched_at;
        (age >= Duration::zero()).then_some(age)
    }
}

#[derive(Debug, Default)]
struct Slot {
    entry: Option<CacheEntry>,
    generation: u64,
}

pub struct LicenseCache {
    ttl: Duration,
    clock: Arc<dyn Clock>,
    store: Arc<dyn CacheStore>,
    slot: RwLock<Slot>,
    // Serializes store I/O so the persisted record follows the slot's
    // write order. Never held by readers.
    io: Mutex<()>,
}

impl std::fmt::Debug for LicenseCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LicenseCache")
            .field("ttl", &self.ttl)
            .field("generation", &self.generation())
            .finish_non_exhaustive()
    }
}

impl LicenseCache {
    /// Open the cache, loading whatever `store` kept from a previous run.
    ///
    /// A stored record that cannot be read (wrong device, tampered,
    /// outdated format) is discarded.
    pub fn open(ttl: Duration, clock: Arc<dyn Clock>, store: Arc<dyn CacheStore>) -> Self {
        let entry = match store.load() {
            Ok(Some(raw)) => match serde_json::from_str::<CacheEntry>(&raw) {
                Ok(entry) => Some(entry),
                Err(e) => {
                    tracing::warn!(error = %e, "Discarding unreadable persisted license cache");
                    let _ = store.clear();
                    None
                }
            },
            Ok(None) => None,
            Err(e) => {
                tracing::warn!(error = %e, "Persisted license cache could not be opened");
                let _ = store.clear();
                None
            }
        };

        Self {
            ttl,
            clock,
            store,
            slot: RwLock::new(Slot {
                entry,
                generation: 0,
            }),
            io: Mutex::new(()),
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// The entry, if it is younger than the TTL.
    pub fn read(&self) -> Option<CacheEntry> {
        let now = self.clock.now();
        let slot = self.slot.read().unwrap_or_else(PoisonError::into_inner);
        let entry = slot.entry.as_ref()?;

        match entry.age_at(now) {
            Some(age) if age <= self.ttl => {
                let mut hit = entry.clone();
                hit.source = CacheSource::SessionCache;
                Some(hit)
            }
            _ => None,
        }
    }

    /// The entry regardless of TTL, if it is younger than `max_age`.
    pub fn read_stale(&self, max_age: Duration) -> Option<CacheEntry> {
        let now = self.clock.now();
        let slot = self.slot.read().unwrap_or_else(PoisonError::into_inner);
        let entry = slot.entry.as_ref()?;

        match entry.age_at(now) {
            Some(age) if age <= max_age => {
                let mut stale = entry.clone();
                stale.source = CacheSource::Fallback;
                Some(stale)
            }
            _ => None,
        }
    }

    /// The stored entry with no age check at all.
    pub fn peek(&self) -> Option<CacheEntry> {
        self.slot
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .entry
            .clone()
    }

    /// Current invalidation generation.
    pub fn generation(&self) -> u64 {
        self.slot
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .generation
    }

    /// Replace the entry unconditionally.
    pub fn write(&self, entry: CacheEntry) {
        let raw = encode(&entry);
        let _io = self.io.lock().unwrap_or_else(PoisonError::into_inner);
        self.slot
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entry = Some(entry);
        self.persist(raw);
    }

    /// Replace the entry only if no invalidation happened since `generation`
    /// was observed. Returns whether the write took place.
    pub fn write_if_current(&self, entry: CacheEntry, generation: u64) -> bool {
        let raw = encode(&entry);
        let _io = self.io.lock().unwrap_or_else(PoisonError::into_inner);
        {
            let mut slot = self.slot.write().unwrap_or_else(PoisonError::into_inner);
            if slot.generation != generation {
                return false;
            }
            slot.entry = Some(entry);
        }
        self.persist(raw);
        true
    }

    /// Drop the entry. Every read issued after this returns sees nothing.
    pub fn invalidate(&self) {
        let _io = self.io.lock().unwrap_or_else(PoisonError::into_inner);
        {
            let mut slot = self.slot.write().unwrap_or_else(PoisonError::into_inner);
            slot.entry = None;
            slot.generation += 1;
        }
        if let Err(e) = self.store.clear() {
            tracing::warn!(error = %e, "Failed to clear persisted license cache");
        }
    }

    /// Invalidate only if no invalidation happened since `generation` was
    /// observed. Returns whether it did.
    pub fn invalidate_if_current(&self, generation: u64) -> bool {
        let _io = self.io.lock().unwrap_or_else(PoisonError::into_inner);
        {
            let mut slot = self.slot.write().unwrap_or_else(PoisonError::into_inner);
            if slot.generation != generation {
                return false;
            }
            slot.entry = None;
            slot.generation += 1;
        }
        if let Err(e) = self.store.clear() {
            tracing::warn!(error = %e, "Failed to clear persisted license cache");
        }
        true
    }

    // Persistence is best effort: the in-memory entry is authoritative for
    // this process, and a failed mirror only costs a network call after a
    // restart. Runs with the slot unlocked so keyring and file latency
    // never stall `read`.
    fn persist(&self, raw: LicenseResult<String>) {
        if let Err(e) = raw.and_then(|raw| self.store.save(&raw)) {
            tracing::warn!(error = %e, "Failed to persist license cache");
        }
    }
}

fn encode(entry: &CacheEntry) -> LicenseResult<String> {
    serde_json::to_string(entry).map_err(|e| LicenseError::Storage(e.to_string()))
}
