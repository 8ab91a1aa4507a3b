//! Integration tests for check-runner
//!
//! Distributed runs are simulated with several coordinators sharing one
//! in-memory cache. No Redis server is required.

use check_runner::cluster::{CoordinationConfig, Coordinator, KvCache, LeaseOutcome, MemoryCache, Role};
use check_runner::devices::{CheckExecutor, DeviceId, DeviceSource, SqliteDeviceSource, StaticDeviceSource};
use check_runner::error::{CacheError, CheckError};
use check_runner::runner::{Advisory, Severity, Supervisor};
use rusqlite::Connection;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Barrier, Mutex};
use std::thread;
use std::time::Duration;
use tempfile::tempdir;

/// Records every device it is asked to check
struct RecordingExecutor {
    delay: Duration,
    seen: Mutex<Vec<DeviceId>>,
}

impl RecordingExecutor {
    fn new(delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            delay,
            seen: Mutex::new(Vec::new()),
        })
    }

    fn seen(&self) -> Vec<DeviceId> {
        let mut seen = self.seen.lock().unwrap().clone();
        seen.sort_unstable();
        seen
    }
}

impl CheckExecutor for RecordingExecutor {
    fn check(&self, device: DeviceId, _debug: bool) -> Result<(), CheckError> {
        thread::sleep(self.delay);
        self.seen.lock().unwrap().push(device);
        Ok(())
    }
}

fn shared_coordinator(cache: &Arc<MemoryCache>, name: &str) -> Arc<Coordinator> {
    let config = CoordinationConfig {
        heartbeat_interval: Duration::from_millis(20),
        drain_poll: Duration::from_millis(10),
        ..Default::default()
    };
    Arc::new(Coordinator::new(cache.clone() as Arc<dyn KvCache>, name, config))
}

#[test]
fn test_local_run_reports_each_device_once() {
    let exec = RecordingExecutor::new(Duration::from_millis(5));
    let supervisor = Supervisor::new(
        2,
        Box::new(StaticDeviceSource::new([1, 2, 3])),
        exec.clone(),
        Arc::new(Coordinator::disabled()),
    );

    let report = supervisor.run().unwrap();

    assert!(report.completed);
    assert_eq!(report.summary.processed, 3);
    assert_eq!(report.summary.failed, 0);
    assert_eq!(
        report.summary.per_device.keys().copied().collect::<HashSet<_>>(),
        HashSet::from([1, 2, 3])
    );
    assert_eq!(exec.seen(), vec![1, 2, 3]);
}

#[test]
fn test_two_nodes_split_devices_without_duplicates() {
    let cache = Arc::new(MemoryCache::new());
    let master = shared_coordinator(&cache, "poller-a");
    let node = shared_coordinator(&cache, "poller-b");

    // Join up front so the roles are fixed before either run starts
    assert_eq!(master.join().unwrap(), Role::Master);
    assert_eq!(node.join().unwrap(), Role::Node);

    let exec_a = RecordingExecutor::new(Duration::from_millis(20));
    let exec_b = RecordingExecutor::new(Duration::from_millis(20));

    let start = Arc::new(Barrier::new(2));
    let handles: Vec<_> = [(master, exec_a.clone()), (node, exec_b.clone())]
        .into_iter()
        .map(|(coordinator, exec)| {
            let start = Arc::clone(&start);
            thread::spawn(move || {
                let supervisor = Supervisor::new(2, Box::new(StaticDeviceSource::new(1..=5)), exec, coordinator);
                start.wait();
                supervisor.run().unwrap()
            })
        })
        .collect();

    let reports: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();

    let mut all = exec_a.seen();
    all.extend(exec_b.seen());
    let unique: HashSet<_> = all.iter().copied().collect();
    assert_eq!(all.len(), 5);
    assert_eq!(unique, (1..=5).collect::<HashSet<_>>());

    let processed: u64 = reports.iter().map(|r| r.summary.processed).sum();
    let skipped: u64 = reports.iter().map(|r| r.summary.skipped).sum();
    assert_eq!(processed, 5);
    assert_eq!(skipped, 5);

    // The master cleared every lease and the cluster keys
    assert!(cache.is_empty());
}

#[test]
fn test_concurrent_leases_are_exclusive() {
    let cache = Arc::new(MemoryCache::new());
    let coordinators: Vec<_> = (0..4)
        .map(|i| shared_coordinator(&cache, &format!("poller-{}", i)))
        .collect();
    for c in &coordinators {
        c.join().unwrap();
    }

    let barrier = Arc::new(Barrier::new(coordinators.len()));
    let handles: Vec<_> = coordinators
        .into_iter()
        .map(|c| {
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                (1..=50)
                    .filter(|&d| c.try_lease(d) == LeaseOutcome::Granted)
                    .collect::<Vec<DeviceId>>()
            })
        })
        .collect();

    let mut granted = Vec::new();
    for handle in handles {
        granted.extend(handle.join().unwrap());
    }
    granted.sort_unstable();
    assert_eq!(granted, (1..=50).collect::<Vec<_>>());
}

#[test]
fn test_second_master_claim_fails() {
    let cache = Arc::new(MemoryCache::new());
    assert!(cache.add("service.master", "poller-a", Duration::from_secs(10)).unwrap());
    assert!(!cache.add("service.master", "poller-b", Duration::from_secs(10)).unwrap());

    let late = shared_coordinator(&cache, "poller-b");
    assert_eq!(late.join().unwrap(), Role::Node);
    assert_eq!(cache.get("service.master").unwrap().as_deref(), Some("poller-a"));
}

#[test]
fn test_unreachable_cache_runs_locally() {
    let cache = Arc::new(MemoryCache::new());
    cache.set_offline(true);

    let exec = RecordingExecutor::new(Duration::ZERO);
    let supervisor = Supervisor::new(
        3,
        Box::new(StaticDeviceSource::new([4, 8, 15, 16])),
        exec.clone(),
        shared_coordinator(&cache, "poller-a"),
    );

    let report = supervisor.run().unwrap();
    assert_eq!(report.role, Role::Disabled);
    assert_eq!(report.summary.processed, 4);
    assert_eq!(exec.seen(), vec![4, 8, 15, 16]);
}

/// Shared cache that answers the liveness probe but refuses master claims
struct ClaimRefusingCache {
    inner: MemoryCache,
}

impl KvCache for ClaimRefusingCache {
    fn get(&self, key: &str) -> Result<Option<String>, CacheError> {
        self.inner.get(key)
    }

    fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), CacheError> {
        self.inner.set(key, value, ttl)
    }

    fn add(&self, _key: &str, _value: &str, _ttl: Duration) -> Result<bool, CacheError> {
        Err(CacheError::OperationFailed {
            op: "add",
            reason: "timeout".into(),
        })
    }

    fn incr(&self, key: &str) -> Result<i64, CacheError> {
        self.inner.incr(key)
    }

    fn decr(&self, key: &str) -> Result<i64, CacheError> {
        self.inner.decr(key)
    }

    fn delete(&self, key: &str) -> Result<bool, CacheError> {
        self.inner.delete(key)
    }

    fn touch(&self, key: &str, ttl: Duration) -> Result<bool, CacheError> {
        self.inner.touch(key, ttl)
    }
}

#[test]
fn test_cache_error_during_join_runs_locally() {
    let cache = Arc::new(ClaimRefusingCache {
        inner: MemoryCache::new(),
    });
    let coordinator = Coordinator::new(cache.clone() as Arc<dyn KvCache>, "poller-a", CoordinationConfig::default());

    let exec = RecordingExecutor::new(Duration::ZERO);
    let supervisor = Supervisor::new(2, Box::new(StaticDeviceSource::new([3, 1, 2])), exec.clone(), Arc::new(coordinator));

    let report = supervisor.run().unwrap();
    assert!(report.completed);
    assert_eq!(report.role, Role::Disabled);
    assert_eq!(report.summary.processed, 3);
    assert_eq!(exec.seen(), vec![1, 2, 3]);
    assert!(cache.inner.is_empty());
}

#[test]
fn test_severity_classification() {
    assert_eq!(Severity::classify(Duration::from_secs(310)), Severity::Slow);
    assert_eq!(Severity::classify(Duration::from_secs(290)), Severity::Normal);
}

#[test]
fn test_advisory_recommendation_and_suppression() {
    let fast: HashMap<DeviceId, Duration> = [(1, Duration::from_secs(120)), (2, Duration::from_secs(300))]
        .into_iter()
        .collect();
    assert_eq!(
        Advisory::evaluate(Duration::from_secs(400), 3, &fast),
        Advisory::Recommend { workers: 5 }
    );

    let slow: HashMap<DeviceId, Duration> = [(1, Duration::from_secs(120)), (2, Duration::from_secs(310))]
        .into_iter()
        .collect();
    assert_eq!(
        Advisory::evaluate(Duration::from_secs(400), 3, &slow),
        Advisory::CannotRecommend { slow_devices: vec![2] }
    );
}

fn device_database(path: &std::path::Path) {
    let conn = Connection::open(path).unwrap();
    conn.execute_batch(
        "CREATE TABLE devices (device_id INTEGER PRIMARY KEY, disabled INTEGER NOT NULL, poller_group INTEGER NOT NULL);
         CREATE TABLE services (service_id INTEGER PRIMARY KEY, device_id INTEGER NOT NULL);
         INSERT INTO devices VALUES (1, 0, 0), (2, 0, 1), (3, 1, 1), (4, 0, 2), (5, 0, 1);
         INSERT INTO services (device_id) VALUES (1), (2), (2), (3), (4), (9);",
    )
    .unwrap();
}

#[test]
fn test_sqlite_source_filters_devices() {
    let dir = tempdir().unwrap();
    let db = dir.path().join("devices.db");
    device_database(&db);

    // Disabled device 3, service-less device 5 and orphan service 9 are left out
    let source = SqliteDeviceSource::new(&db);
    let mut devices = source.devices().unwrap();
    devices.sort_unstable();
    assert_eq!(devices, vec![1, 2, 4]);

    let grouped = SqliteDeviceSource::new(&db).with_poller_groups(vec![1, 2]);
    let mut devices = grouped.devices().unwrap();
    devices.sort_unstable();
    assert_eq!(devices, vec![2, 4]);

    // The cleanup range comes from every service row
    assert_eq!(source.id_range().unwrap(), Some((1, 9)));
}

#[cfg(unix)]
#[test]
fn test_command_executor_end_to_end() {
    use check_runner::devices::CommandExecutor;

    let dir = tempdir().unwrap();
    let exec = Arc::new(CommandExecutor::new(
        "/bin/sh",
        vec!["-c".into(), "[ \"$2\" != 2 ]".into(), "sh".into()],
        dir.path(),
    ));

    let supervisor = Supervisor::new(
        2,
        Box::new(StaticDeviceSource::new([1, 2, 3])),
        exec,
        Arc::new(Coordinator::disabled()),
    );

    let report = supervisor.run().unwrap();
    assert_eq!(report.summary.processed, 3);
    assert_eq!(report.summary.failed, 1);
}
