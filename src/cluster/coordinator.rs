//! Cluster coordination over the shared cache
//!
//! One coordinator lives in every process of a distributed run. The first
//! process to claim the master key becomes the master; every later process
//! joins as a node. Devices are leased one key at a time, so two processes
//! never check the same device while its lease is live.
//!
//! ```text
//!              join()
//!  Unclaimed ──────────┬──────────────► Master   (claimed master key)
//!      │               │
//!      │ cache down    └──────────────► Node     (master held by another host)
//!      ▼
//!  Disabled ◄──── lost cache mid-run (master only)
//! ```
//!
//! The master keeps bookkeeping alive through [`Coordinator::heartbeat`] and
//! sweeps all device leases in [`Coordinator::finish`] once every node has
//! reported completion.

use crate::cluster::cache::KvCache;
use crate::devices::DeviceId;
use crate::error::{CacheError, CoordinationError};

use std::sync::atomic::{AtomicI64, AtomicU8, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Coordination timing and key layout
#[derive(Debug, Clone)]
pub struct CoordinationConfig {
    /// Prefix for every key this run touches
    pub key_prefix: String,
    /// TTL of a per-device lease
    pub lease_ttl: Duration,
    /// TTL of the master key, refreshed on every heartbeat
    pub master_ttl: Duration,
    /// TTL given to the node counter when the master initializes it
    pub node_count_ttl: Duration,
    /// TTL a node heartbeat puts on the node counter
    pub presence_ttl: Duration,
    /// TTL of a liveness probe marker
    pub ping_ttl: Duration,
    /// Interval between heartbeats
    pub heartbeat_interval: Duration,
    /// Poll interval while the master waits for nodes to finish
    pub drain_poll: Duration,
}

impl Default for CoordinationConfig {
    fn default() -> Self {
        Self {
            key_prefix: "service".to_string(),
            lease_ttl: Duration::from_secs(300),
            master_ttl: Duration::from_secs(10),
            node_count_ttl: Duration::from_secs(300),
            presence_ttl: Duration::from_secs(10),
            ping_ttl: Duration::from_secs(60),
            heartbeat_interval: Duration::from_secs(1),
            drain_poll: Duration::from_secs(1),
        }
    }
}

impl CoordinationConfig {
    /// Key holding the master identity
    pub fn master_key(&self) -> String {
        format!("{}.master", self.key_prefix)
    }

    /// Key holding the node count
    pub fn nodes_key(&self) -> String {
        format!("{}.nodes", self.key_prefix)
    }

    /// Lease key for one device
    pub fn device_key(&self, device: DeviceId) -> String {
        format!("{}.device.{}", self.key_prefix, device)
    }

    fn ping_key(&self, marker: &str) -> String {
        format!("{}.ping.{}", self.key_prefix, marker)
    }
}

/// Coordination state of this process
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Role {
    /// Local-only mode; every coordination call is a no-op
    Disabled = 0,
    /// Distributed mode configured but not yet joined
    Unclaimed = 1,
    /// Owns the master key
    Master = 2,
    /// Joined another host's run
    Node = 3,
}

impl Role {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => Role::Unclaimed,
            2 => Role::Master,
            3 => Role::Node,
            _ => Role::Disabled,
        }
    }

    /// True for the roles that take part in leasing
    pub fn is_active(self) -> bool {
        matches!(self, Role::Master | Role::Node)
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Role::Disabled => "disabled",
            Role::Unclaimed => "unclaimed",
            Role::Master => "master",
            Role::Node => "node",
        };
        f.write_str(name)
    }
}

/// Result of a lease attempt for one device
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LeaseOutcome {
    /// Coordination is off; check the device without a lease
    Unsynchronized,
    /// This process holds the lease
    Granted,
    /// Another process holds the lease
    Contended { owner: Option<String> },
    /// This node lost the cache; leave the device to the master
    Abandoned,
}

impl LeaseOutcome {
    /// True if the caller should run the check
    pub fn should_check(&self) -> bool {
        matches!(self, LeaseOutcome::Unsynchronized | LeaseOutcome::Granted)
    }
}

/// What a heartbeat observed
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Heartbeat {
    /// Coordination inactive, nothing done
    Idle,
    /// Master refreshed its key; `nodes` is the current node count
    Master { nodes: Option<i64>, changed: bool },
    /// Node refreshed its presence
    Node,
    /// Master lost the cache and switched to local-only mode
    LostCache,
}

/// Summary of the end-of-run cleanup
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CleanupReport {
    /// Role the cleanup ran as
    pub role: Option<Role>,
    /// Lease keys deleted by the master
    pub leases_cleared: u64,
    /// Node count after a node's decrement
    pub remaining_nodes: Option<i64>,
}

/// Coordinates one process with the rest of the cluster
pub struct Coordinator {
    cache: Option<Arc<dyn KvCache>>,
    identity: String,
    config: CoordinationConfig,
    role: AtomicU8,
    /// Role obtained at join; survives a mid-run switch to `Disabled`
    joined_as: AtomicU8,
    last_nodes: AtomicI64,
}

impl Coordinator {
    /// Coordinator for local-only runs
    pub fn disabled() -> Self {
        Self {
            cache: None,
            identity: String::new(),
            config: CoordinationConfig::default(),
            role: AtomicU8::new(Role::Disabled as u8),
            joined_as: AtomicU8::new(Role::Disabled as u8),
            last_nodes: AtomicI64::new(0),
        }
    }

    /// Coordinator for a distributed run; call [`Coordinator::join`] next
    pub fn new(cache: Arc<dyn KvCache>, identity: impl Into<String>, config: CoordinationConfig) -> Self {
        Self {
            cache: Some(cache),
            identity: identity.into(),
            config,
            role: AtomicU8::new(Role::Unclaimed as u8),
            joined_as: AtomicU8::new(Role::Disabled as u8),
            last_nodes: AtomicI64::new(0),
        }
    }

    /// Current role
    pub fn role(&self) -> Role {
        Role::from_u8(self.role.load(Ordering::SeqCst))
    }

    /// True while leasing is in effect
    pub fn is_active(&self) -> bool {
        self.role().is_active()
    }

    /// Coordination settings
    pub fn config(&self) -> &CoordinationConfig {
        &self.config
    }

    fn set_role(&self, role: Role) {
        self.role.store(role as u8, Ordering::SeqCst);
    }

    /// Round-trip a unique marker through the cache
    pub fn probe(&self) -> bool {
        let Some(cache) = &self.cache else {
            return false;
        };

        let marker = uuid::Uuid::new_v4().to_string();
        let key = self.config.ping_key(&marker);

        let alive = cache
            .set(&key, &marker, self.config.ping_ttl)
            .and_then(|_| cache.get(&key))
            .map(|value| value.as_deref() == Some(marker.as_str()))
            .unwrap_or(false);

        if alive {
            let _ = cache.delete(&key);
        }
        alive
    }

    /// Join the cluster: claim the master key or register as a node
    pub fn join(&self) -> Result<Role, CoordinationError> {
        let Some(cache) = &self.cache else {
            return Ok(Role::Disabled);
        };

        if self.role() != Role::Unclaimed {
            return Ok(self.role());
        }

        if !self.probe() {
            warn!("Could not reach the shared cache, disabling distributed checks");
            self.set_role(Role::Disabled);
            return Ok(Role::Disabled);
        }

        let master_key = self.config.master_key();
        let claimed = match cache.add(&master_key, &self.identity, self.config.master_ttl) {
            Ok(claimed) => claimed,
            Err(e) => return Ok(self.join_failed(&e)),
        };

        if claimed {
            if let Err(e) = cache.set(&self.config.nodes_key(), "0", self.config.node_count_ttl) {
                // Release the claim so a restart is not taken for a stale master
                let _ = cache.delete(&master_key);
                return Ok(self.join_failed(&e));
            }
            info!(identity = %self.identity, "Registered as master");
            self.set_role(Role::Master);
            self.joined_as.store(Role::Master as u8, Ordering::SeqCst);
            return Ok(Role::Master);
        }

        let master = match cache.get(&master_key) {
            Ok(master) => master,
            Err(e) => return Ok(self.join_failed(&e)),
        };
        if master.as_deref() == Some(self.identity.as_str()) {
            return Err(CoordinationError::StaleMaster {
                identity: self.identity.clone(),
            });
        }

        let nodes = match cache.incr(&self.config.nodes_key()) {
            Ok(nodes) => nodes,
            Err(e) => return Ok(self.join_failed(&e)),
        };
        info!(
            identity = %self.identity,
            master = master.as_deref().unwrap_or("unknown"),
            nodes = nodes,
            "Registered as node"
        );
        self.set_role(Role::Node);
        self.joined_as.store(Role::Node as u8, Ordering::SeqCst);
        Ok(Role::Node)
    }

    fn join_failed(&self, error: &CacheError) -> Role {
        warn!(error = %error, "Cache failed while joining, disabling distributed checks");
        self.set_role(Role::Disabled);
        Role::Disabled
    }

    /// Try to take the lease on a device before checking it
    pub fn try_lease(&self, device: DeviceId) -> LeaseOutcome {
        let role = self.role();
        let cache = match (&self.cache, role.is_active()) {
            (Some(cache), true) => cache,
            _ => return LeaseOutcome::Unsynchronized,
        };

        let key = self.config.device_key(device);
        match cache.add(&key, &self.identity, self.config.lease_ttl) {
            Ok(true) => {}
            Ok(false) => {
                let owner = cache.get(&key).ok().flatten();
                info!(
                    device = device,
                    owner = owner.as_deref().unwrap_or("unknown"),
                    "Device is being checked by another node"
                );
                return LeaseOutcome::Contended { owner };
            }
            Err(e) => return self.lease_failed(device, role, &e),
        }

        if role == Role::Node && !self.probe() {
            warn!(device = device, "Lost cache, not checking device as node; master will check it");
            return LeaseOutcome::Abandoned;
        }

        debug!(device = device, "Lease granted");
        LeaseOutcome::Granted
    }

    fn lease_failed(&self, device: DeviceId, role: Role, error: &CacheError) -> LeaseOutcome {
        match role {
            Role::Master => {
                warn!(device = device, error = %error, "Lost cache while leasing, taking over all devices");
                self.set_role(Role::Disabled);
                LeaseOutcome::Unsynchronized
            }
            _ => {
                warn!(device = device, error = %error, "Lost cache, not checking device as node; master will check it");
                LeaseOutcome::Abandoned
            }
        }
    }

    /// Periodic bookkeeping, driven by the result reporter
    pub fn heartbeat(&self) -> Heartbeat {
        let Some(cache) = &self.cache else {
            return Heartbeat::Idle;
        };

        match self.role() {
            Role::Master => {
                let _ = cache.touch(&self.config.master_key(), self.config.master_ttl);

                let nodes = match cache.get(&self.config.nodes_key()) {
                    Ok(value) => value.and_then(|v| v.parse::<i64>().ok()),
                    Err(_) => None,
                };

                if nodes.is_none() && !self.probe() {
                    warn!("Lost cache, taking over all devices; nodes will quit shortly");
                    self.set_role(Role::Disabled);
                    return Heartbeat::LostCache;
                }

                let current = nodes.unwrap_or(0);
                let previous = self.last_nodes.swap(current, Ordering::SeqCst);
                let changed = previous != current;
                if changed {
                    info!(nodes = current, "Node count changed");
                }
                Heartbeat::Master { nodes, changed }
            }
            Role::Node => {
                if let Err(e) = cache.touch(&self.config.nodes_key(), self.config.presence_ttl) {
                    debug!(error = %e, "Node heartbeat failed");
                }
                Heartbeat::Node
            }
            Role::Disabled | Role::Unclaimed => Heartbeat::Idle,
        }
    }

    /// End-of-run sequence: master drains the cluster and clears locks,
    /// a node signs off.
    pub fn finish(&self, range: Option<(DeviceId, DeviceId)>) -> CleanupReport {
        let Some(cache) = &self.cache else {
            return CleanupReport::default();
        };

        let joined_as = Role::from_u8(self.joined_as.load(Ordering::SeqCst));
        if !joined_as.is_active() {
            return CleanupReport::default();
        }

        // A master that lost the cache mid-run still cleans up if it is back
        if !self.is_active() && !self.probe() {
            warn!("Cache still unreachable, skipping cluster cleanup");
            return CleanupReport::default();
        }

        match joined_as {
            Role::Master => self.finish_master(cache.as_ref(), range),
            _ => self.finish_node(cache.as_ref()),
        }
    }

    fn finish_master(&self, cache: &dyn KvCache, range: Option<(DeviceId, DeviceId)>) -> CleanupReport {
        let master_key = self.config.master_key();
        let nodes_key = self.config.nodes_key();

        info!("Waiting for all nodes to finish");
        loop {
            match cache.get(&nodes_key) {
                Ok(value) => match value.and_then(|v| v.parse::<i64>().ok()) {
                    Some(n) if n > 0 => debug!(nodes = n, "Nodes still running"),
                    _ => break,
                },
                Err(e) => debug!(error = %e, "Could not read node count, retrying"),
            }

            let _ = cache.touch(&master_key, self.config.master_ttl);
            thread::sleep(self.config.drain_poll);
        }

        let mut cleared = 0u64;
        if let Some((min, max)) = range {
            info!(min = min, max = max, "Clearing locks");
            for device in min..=max {
                match cache.delete(&self.config.device_key(device)) {
                    Ok(_) => cleared += 1,
                    Err(e) => debug!(device = device, error = %e, "Failed to clear lock"),
                }
            }
        }
        info!(locks = cleared, "Locks cleared");

        let _ = cache.delete(&nodes_key);
        let _ = cache.delete(&master_key);
        info!("Cleared cluster keys");

        CleanupReport {
            role: Some(Role::Master),
            leases_cleared: cleared,
            remaining_nodes: None,
        }
    }

    fn finish_node(&self, cache: &dyn KvCache) -> CleanupReport {
        let remaining = match cache.decr(&self.config.nodes_key()) {
            Ok(n) => Some(n),
            Err(e) => {
                warn!(error = %e, "Failed to sign off from master");
                None
            }
        };

        info!(nodes = remaining.unwrap_or(0), "Node finished");
        CleanupReport {
            role: Some(Role::Node),
            leases_cleared: 0,
            remaining_nodes: remaining,
        }
    }
}
