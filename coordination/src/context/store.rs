//! Versioned shared context with per-key locking and TTL-classed caching
//!
//! The store is the single source of truth for shared state: consensus
//! rounds commit decisions here, agents read preferences from here. Writes
//! are optimistic (expected-version check), versions per key strictly
//! increase, and every commit lands in the audit log before the cache is
//! touched.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, RwLock};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::audit::{AuditRecord, SharedAuditLog};
use crate::config::CoordinationConfig;
use crate::events::{CoordinationEvent, SharedEventBus};
use crate::types::AgentId;

/// Error type for context store operations
#[derive(Debug, thiserror::Error)]
pub enum ContextError {
    #[error("Stale write on '{key}': expected version {expected}, store at {current}")]
    StaleWrite {
        key: String,
        expected: u64,
        current: u64,
    },

    #[error("Key not found: {0}")]
    KeyNotFound(String),

    #[error("Audit error: {0}")]
    Audit(#[from] crate::audit::AuditError),

    #[error("Lock poisoned")]
    LockPoisoned,
}

/// Result type for context store operations
pub type ContextResult<T> = Result<T, ContextError>;

/// Staleness budget class for a cached entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TtlClass {
    /// ~60s budget, hot working state
    L1,
    /// ~300s budget, session-scoped state
    L2,
    /// ~3600s budget, slow-moving preferences
    L3,
    /// Never expires from cache; always durable
    Persistent,
}

/// Freshness of a value returned by `get`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Freshness {
    /// Within the TTL budget of the given class
    Fresh(TtlClass),
    /// Cached copy outlived its TTL class; revalidate with a strict read
    Stale,
}

/// A versioned piece of shared state
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextEntry {
    pub key: String,
    pub value: serde_json::Value,
    pub version: u64,
    pub writer: AgentId,
    pub written_at: DateTime<Utc>,
    pub ttl_class: TtlClass,
}

/// Per-key slot: the committed entry plus its cache validation stamp
///
/// `cache_stamp` is `None` right after a write (full invalidation); the
/// next read populates it (read-through).
#[derive(Default)]
struct KeySlot {
    entry: Option<ContextEntry>,
    cache_stamp: Option<DateTime<Utc>>,
}

/// Shared reference to ContextStore
pub type SharedContextStore = Arc<ContextStore>;

/// Versioned context store with fine-grained per-key locking
///
/// The outer map lock only guards slot lookup/creation; all value access
/// serializes on the slot's own mutex, so writers to different keys never
/// contend.
pub struct ContextStore {
    slots: RwLock<HashMap<String, Arc<Mutex<KeySlot>>>>,
    config: CoordinationConfig,
    bus: SharedEventBus,
    audit: Option<SharedAuditLog>,
}

impl ContextStore {
    /// Create an empty store
    pub fn new(config: CoordinationConfig, bus: SharedEventBus) -> Self {
        Self {
            slots: RwLock::new(HashMap::new()),
            config,
            bus,
            audit: None,
        }
    }

    /// Enable durable audit logging of every committed write
    pub fn with_audit(mut self, audit: SharedAuditLog) -> Self {
        self.audit = Some(audit);
        self
    }

    /// Create a shared reference to this store
    pub fn shared(self) -> SharedContextStore {
        Arc::new(self)
    }

    fn slot(&self, key: &str) -> ContextResult<Arc<Mutex<KeySlot>>> {
        {
            let slots = self.slots.read().map_err(|_| ContextError::LockPoisoned)?;
            if let Some(slot) = slots.get(key) {
                return Ok(slot.clone());
            }
        }
        let mut slots = self.slots.write().map_err(|_| ContextError::LockPoisoned)?;
        Ok(slots.entry(key.to_string()).or_default().clone())
    }

    /// Read a key, reporting cache freshness
    ///
    /// A cache miss reads through and stamps the entry fresh; a hit older
    /// than its TTL class returns the latest committed value with an
    /// explicit `Stale` marker.
    pub fn get(&self, key: &str, now: DateTime<Utc>) -> ContextResult<(serde_json::Value, u64, Freshness)> {
        let slot = self.slot(key)?;
        let mut slot = slot.lock().map_err(|_| ContextError::LockPoisoned)?;

        let entry = slot
            .entry
            .clone()
            .ok_or_else(|| ContextError::KeyNotFound(key.to_string()))?;

        let freshness = match slot.cache_stamp {
            None => {
                // Read-through population after a write or first access
                slot.cache_stamp = Some(now);
                Freshness::Fresh(entry.ttl_class)
            }
            Some(stamp) => match self.config.ttl_for(entry.ttl_class) {
                Some(budget) if now - stamp > budget => Freshness::Stale,
                _ => Freshness::Fresh(entry.ttl_class),
            },
        };

        Ok((entry.value, entry.version, freshness))
    }

    /// Strict read: bypass the cache and validate against the durable tier
    pub fn get_strict(&self, key: &str, now: DateTime<Utc>) -> ContextResult<(serde_json::Value, u64)> {
        let slot = self.slot(key)?;
        let mut slot = slot.lock().map_err(|_| ContextError::LockPoisoned)?;

        let entry = slot
            .entry
            .clone()
            .ok_or_else(|| ContextError::KeyNotFound(key.to_string()))?;
        slot.cache_stamp = Some(now);
        Ok((entry.value, entry.version))
    }

    /// Commit a write under optimistic concurrency
    ///
    /// `expected_version` of `None` is an unconditional overwrite; `Some(v)`
    /// fails with `StaleWrite` unless the store is currently at `v` (0 for
    /// an absent key). The new version is returned. A successful put
    /// invalidates the cache entry entirely.
    pub fn put(
        &self,
        key: &str,
        value: serde_json::Value,
        writer: AgentId,
        expected_version: Option<u64>,
        ttl_class: TtlClass,
        now: DateTime<Utc>,
    ) -> ContextResult<u64> {
        let slot = self.slot(key)?;
        let mut slot = slot.lock().map_err(|_| ContextError::LockPoisoned)?;

        let current = slot.entry.as_ref().map(|e| e.version).unwrap_or(0);
        if let Some(expected) = expected_version {
            if expected != current {
                debug!(key, expected, current, "Stale write rejected");
                return Err(ContextError::StaleWrite {
                    key: key.to_string(),
                    expected,
                    current,
                });
            }
        }

        let version = current + 1;
        let entry = ContextEntry {
            key: key.to_string(),
            value,
            version,
            writer,
            written_at: now,
            ttl_class,
        };

        // Durability before visibility
        if let Some(audit) = &self.audit {
            audit.append(&AuditRecord::ContextWrite {
                key: entry.key.clone(),
                value: entry.value.clone(),
                version,
                writer,
                written_at: now,
                ttl_class,
            })?;
        }

        slot.entry = Some(entry);
        slot.cache_stamp = None;
        info!(key, version, writer = %writer, "Context written");
        self.bus.publish(CoordinationEvent::ContextWritten {
            key: key.to_string(),
            version,
            writer,
            timestamp: now,
        });
        Ok(version)
    }

    /// Current version of a key (0 when absent)
    pub fn version(&self, key: &str) -> ContextResult<u64> {
        let slot = self.slot(key)?;
        let slot = slot.lock().map_err(|_| ContextError::LockPoisoned)?;
        Ok(slot.entry.as_ref().map(|e| e.version).unwrap_or(0))
    }

    /// Apply replayed audit records to rebuild store contents
    ///
    /// Idempotent: a record at a version at or below the key's current
    /// version is skipped, so replaying the same log twice converges to the
    /// same state. Replay never re-appends to the audit log.
    pub fn restore(&self, records: &[AuditRecord]) -> ContextResult<usize> {
        let mut applied = 0;
        for record in records {
            let AuditRecord::ContextWrite {
                key,
                value,
                version,
                writer,
                written_at,
                ttl_class,
            } = record
            else {
                continue;
            };

            let slot = self.slot(key)?;
            let mut slot = slot.lock().map_err(|_| ContextError::LockPoisoned)?;
            let current = slot.entry.as_ref().map(|e| e.version).unwrap_or(0);
            if *version <= current {
                continue;
            }
            slot.entry = Some(ContextEntry {
                key: key.clone(),
                value: value.clone(),
                version: *version,
                writer: *writer,
                written_at: *written_at,
                ttl_class: *ttl_class,
            });
            slot.cache_stamp = None;
            applied += 1;
        }
        info!(applied, "Context restored from audit records");
        Ok(applied)
    }

    /// Deterministic snapshot of committed contents, for comparison
    pub fn contents(&self) -> ContextResult<BTreeMap<String, (serde_json::Value, u64)>> {
        let slots = self.slots.read().map_err(|_| ContextError::LockPoisoned)?;
        let mut out = BTreeMap::new();
        for (key, slot) in slots.iter() {
            let slot = slot.lock().map_err(|_| ContextError::LockPoisoned)?;
            if let Some(entry) = &slot.entry {
                out.insert(key.clone(), (entry.value.clone(), entry.version));
            }
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventBus;
    use chrono::Duration;
    use serde_json::json;
    use uuid::Uuid;

    fn test_store() -> ContextStore {
        ContextStore::new(CoordinationConfig::default(), EventBus::new().shared())
    }

    #[test]
    fn test_put_get_versioning() {
        let store = test_store();
        let writer = Uuid::new_v4();
        let now = Utc::now();

        let v1 = store.put("pref", json!("morning"), writer, Some(0), TtlClass::L2, now).unwrap();
        assert_eq!(v1, 1);
        let v2 = store.put("pref", json!("evening"), writer, Some(1), TtlClass::L2, now).unwrap();
        assert_eq!(v2, 2);

        let (value, version, freshness) = store.get("pref", now).unwrap();
        assert_eq!(value, json!("evening"));
        assert_eq!(version, 2);
        assert_eq!(freshness, Freshness::Fresh(TtlClass::L2));
    }

    #[test]
    fn test_stale_write_rejected() {
        let store = test_store();
        let writer = Uuid::new_v4();
        let now = Utc::now();

        store.put("k", json!(1), writer, Some(0), TtlClass::L1, now).unwrap();
        let err = store.put("k", json!(2), writer, Some(0), TtlClass::L1, now).unwrap_err();
        assert!(matches!(err, ContextError::StaleWrite { expected: 0, current: 1, .. }));

        // Unconditional overwrite still bumps the version
        let v = store.put("k", json!(3), writer, None, TtlClass::L1, now).unwrap();
        assert_eq!(v, 2);
    }

    #[test]
    fn test_ttl_staleness_and_strict_read() {
        let store = test_store();
        let writer = Uuid::new_v4();
        let t0 = Utc::now();

        store.put("k", json!(1), writer, None, TtlClass::L1, t0).unwrap();
        // Read-through populates the cache stamp at t0
        let (_, _, freshness) = store.get("k", t0).unwrap();
        assert_eq!(freshness, Freshness::Fresh(TtlClass::L1));

        // Past the 60s L1 budget the cached copy is stale
        let later = t0 + Duration::seconds(61);
        let (value, version, freshness) = store.get("k", later).unwrap();
        assert_eq!(freshness, Freshness::Stale);
        assert_eq!((value, version), (json!(1), 1));

        // Strict read revalidates
        store.get_strict("k", later).unwrap();
        let (_, _, freshness) = store.get("k", later).unwrap();
        assert_eq!(freshness, Freshness::Fresh(TtlClass::L1));
    }

    #[test]
    fn test_persistent_class_never_stale() {
        let store = test_store();
        let t0 = Utc::now();
        store.put("k", json!(1), Uuid::new_v4(), None, TtlClass::Persistent, t0).unwrap();
        store.get("k", t0).unwrap();

        let (_, _, freshness) = store.get("k", t0 + Duration::days(30)).unwrap();
        assert_eq!(freshness, Freshness::Fresh(TtlClass::Persistent));
    }

    #[test]
    fn test_put_invalidates_cache() {
        let store = test_store();
        let writer = Uuid::new_v4();
        let t0 = Utc::now();

        store.put("k", json!(1), writer, None, TtlClass::L1, t0).unwrap();
        store.get("k", t0).unwrap();

        // A write invalidates; the next read re-populates fresh even though
        // the old stamp would have expired
        let later = t0 + Duration::seconds(120);
        store.put("k", json!(2), writer, None, TtlClass::L1, later).unwrap();
        let (value, _, freshness) = store.get("k", later).unwrap();
        assert_eq!(value, json!(2));
        assert_eq!(freshness, Freshness::Fresh(TtlClass::L1));
    }

    #[test]
    fn test_missing_key() {
        let store = test_store();
        let err = store.get("absent", Utc::now()).unwrap_err();
        assert!(matches!(err, ContextError::KeyNotFound(_)));
    }

    #[test]
    fn test_concurrent_optimistic_writers_one_wins() {
        let store = Arc::new(test_store());
        let now = Utc::now();
        store.put("k", json!(0), Uuid::new_v4(), None, TtlClass::L2, now).unwrap();

        let mut handles = Vec::new();
        for _ in 0..8 {
            let store = store.clone();
            handles.push(std::thread::spawn(move || {
                store.put("k", json!("mine"), Uuid::new_v4(), Some(1), TtlClass::L2, Utc::now())
            }));
        }

        let outcomes: Vec<bool> = handles
            .into_iter()
            .map(|h| h.join().unwrap().is_ok())
            .collect();
        assert_eq!(outcomes.iter().filter(|ok| **ok).count(), 1);
        assert_eq!(store.version("k").unwrap(), 2);
    }
}
