//! Distributed coordination
//!
//! Several hosts can share one run by pointing at the same cache. Every
//! process keeps a [`Coordinator`]; the first to join becomes the master and
//! the rest join as nodes. Devices are leased through add-if-absent keys so
//! each one is checked by a single host.
//!
//! ```text
//!   ┌──────────┐      ┌──────────┐      ┌──────────┐
//!   │  master  │      │  node 1  │      │  node N  │
//!   └────┬─────┘      └────┬─────┘      └────┬─────┘
//!        │ claim/refresh   │ incr/touch      │
//!        │ lease/cleanup   │ lease/decr      │
//!        ▼                 ▼                 ▼
//!   ┌─────────────────────────────────────────────┐
//!   │                  KvCache                    │
//!   │  {p}.master  {p}.nodes  {p}.device.{id}     │
//!   └─────────────────────────────────────────────┘
//! ```

mod cache;
mod coordinator;
mod redis_cache;

pub use cache::{KvCache, MemoryCache};
pub use coordinator::{CleanupReport, CoordinationConfig, Coordinator, Heartbeat, LeaseOutcome, Role};
pub use redis_cache::{RedisCache, RedisCacheConfig};
