//! Shared key-value cache abstraction
//!
//! Coordination only ever talks to the cache through the atomic primitives
//! below. [`MemoryCache`] is an in-process implementation with the same
//! expiry semantics; several coordinators sharing one `Arc<MemoryCache>`
//! behave like several hosts sharing one cache server.

use crate::error::{CacheError, CacheResult};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Atomic operations required from the shared cache
pub trait KvCache: Send + Sync {
    /// Read a key, `None` if absent or expired
    fn get(&self, key: &str) -> CacheResult<Option<String>>;

    /// Unconditionally store a value with a TTL
    fn set(&self, key: &str, value: &str, ttl: Duration) -> CacheResult<()>;

    /// Store a value only if the key is absent. Returns whether it was stored.
    fn add(&self, key: &str, value: &str, ttl: Duration) -> CacheResult<bool>;

    /// Atomically increment an integer key, returning the new value
    fn incr(&self, key: &str) -> CacheResult<i64>;

    /// Atomically decrement an integer key, returning the new value
    fn decr(&self, key: &str) -> CacheResult<i64>;

    /// Delete a key. Returns whether it existed.
    fn delete(&self, key: &str) -> CacheResult<bool>;

    /// Refresh the TTL of an existing key. Returns whether the key existed.
    fn touch(&self, key: &str, ttl: Duration) -> CacheResult<bool>;
}

#[derive(Debug, Clone)]
struct Slot {
    value: String,
    expires_at: Option<Instant>,
}

impl Slot {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.map(|at| now < at).unwrap_or(true)
    }
}

/// In-process cache with TTL expiry
#[derive(Debug, Default)]
pub struct MemoryCache {
    slots: Mutex<HashMap<String, Slot>>,
    offline: AtomicBool,
}

impl MemoryCache {
    /// Create an empty cache
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate the cache server becoming unreachable (or reachable again)
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// Number of live keys
    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.slots
            .lock()
            .map(|slots| slots.values().filter(|s| s.is_live(now)).count())
            .unwrap_or(0)
    }

    /// True if no live keys remain
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn with_slots<T>(
        &self,
        op: &'static str,
        f: impl FnOnce(&mut HashMap<String, Slot>, Instant) -> CacheResult<T>,
    ) -> CacheResult<T> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(CacheError::OperationFailed {
                op,
                reason: "cache offline".into(),
            });
        }

        let mut slots = self.slots.lock().map_err(|_| CacheError::OperationFailed {
            op,
            reason: "cache lock poisoned".into(),
        })?;

        let now = Instant::now();
        slots.retain(|_, slot| slot.is_live(now));
        f(&mut slots, now)
    }

    fn step(&self, op: &'static str, key: &str, delta: i64) -> CacheResult<i64> {
        self.with_slots(op, |slots, _| {
            let slot = slots.entry(key.to_string()).or_insert_with(|| Slot {
                value: "0".into(),
                expires_at: None,
            });

            let current: i64 = slot.value.parse().map_err(|_| CacheError::InvalidValue {
                key: key.to_string(),
                value: slot.value.clone(),
            })?;

            let next = current + delta;
            slot.value = next.to_string();
            Ok(next)
        })
    }
}

impl KvCache for MemoryCache {
    fn get(&self, key: &str) -> CacheResult<Option<String>> {
        self.with_slots("get", |slots, _| Ok(slots.get(key).map(|s| s.value.clone())))
    }

    fn set(&self, key: &str, value: &str, ttl: Duration) -> CacheResult<()> {
        self.with_slots("set", |slots, now| {
            slots.insert(
                key.to_string(),
                Slot {
                    value: value.to_string(),
                    expires_at: Some(now + ttl),
                },
            );
            Ok(())
        })
    }

    fn add(&self, key: &str, value: &str, ttl: Duration) -> CacheResult<bool> {
        self.with_slots("add", |slots, now| {
            if slots.contains_key(key) {
                return Ok(false);
            }
            slots.insert(
                key.to_string(),
                Slot {
                    value: value.to_string(),
                    expires_at: Some(now + ttl),
                },
            );
            Ok(true)
        })
    }

    fn incr(&self, key: &str) -> CacheResult<i64> {
        self.step("incr", key, 1)
    }

    fn decr(&self, key: &str) -> CacheResult<i64> {
        self.step("decr", key, -1)
    }

    fn delete(&self, key: &str) -> CacheResult<bool> {
        self.with_slots("delete", |slots, _| Ok(slots.remove(key).is_some()))
    }

    fn touch(&self, key: &str, ttl: Duration) -> CacheResult<bool> {
        self.with_slots("touch", |slots, now| match slots.get_mut(key) {
            Some(slot) => {
                slot.expires_at = Some(now + ttl);
                Ok(true)
            }
            None => Ok(false),
        })
    }
}
