//! Supervising registry of running device groups
//!
//! [`GroupRegistry::reconcile`] brings the running groups in line with a
//! freshly built topology:
//! - new groups are spawned
//! - groups whose membership changed are stopped and spawned again with
//!   a fresh restart budget
//! - groups no longer configured are stopped
//! - unchanged live groups are left alone and keep their identity
//! - unchanged groups whose process died are respawned, at most
//!   `max_restarts` times, after which they are given up for good

use std::collections::BTreeMap;
use std::time::Instant;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use daq_runtime::{RestartPolicy, Supervisor};

use crate::error::DaqResult;
use crate::topology::DeviceGroupSpec;

/// Starts and stops group processes
#[async_trait]
pub trait GroupSpawner: Send + Sync {
    async fn spawn(&self, spec: &DeviceGroupSpec) -> DaqResult<()>;

    async fn stop(&self, key: &str) -> DaqResult<()>;

    fn is_alive(&self, key: &str) -> bool;

    /// Forget groups whose process has exited; returns their keys
    fn reap(&self) -> Vec<String>;
}

/// Supervising record of one group
#[derive(Debug)]
pub struct GroupRecord {
    pub spec: DeviceGroupSpec,
    /// Identity kept for as long as the membership is unchanged
    pub process_uid: Uuid,
    pub started_at: DateTime<Utc>,
    supervisor: Supervisor,
    next_attempt: Option<Instant>,
    given_up: bool,
}

impl GroupRecord {
    fn new(spec: DeviceGroupSpec, policy: &RestartPolicy) -> Self {
        Self {
            spec,
            process_uid: Uuid::new_v4(),
            started_at: Utc::now(),
            supervisor: Supervisor::new(policy.clone()),
            next_attempt: None,
            given_up: false,
        }
    }

    pub fn respawns(&self) -> u32 {
        self.supervisor.restart_count()
    }

    pub fn is_given_up(&self) -> bool {
        self.given_up
    }

    /// Take on a new membership under a fresh identity and restart budget
    fn recreate(&mut self, spec: DeviceGroupSpec) {
        self.spec = spec;
        self.process_uid = Uuid::new_v4();
        self.started_at = Utc::now();
        self.supervisor.reset();
        self.next_attempt = None;
        self.given_up = false;
    }
}

/// What one reconciliation pass did
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileReport {
    pub spawned: Vec<String>,
    pub recreated: Vec<String>,
    pub stopped: Vec<String>,
    pub respawned: Vec<String>,
    pub given_up: Vec<String>,
    pub unchanged: Vec<String>,
}

pub struct GroupRegistry<S: GroupSpawner> {
    spawner: S,
    policy: RestartPolicy,
    records: BTreeMap<String, GroupRecord>,
}

impl<S: GroupSpawner> GroupRegistry<S> {
    pub fn new(spawner: S) -> Self {
        Self::with_policy(spawner, RestartPolicy::default())
    }

    pub fn with_policy(spawner: S, policy: RestartPolicy) -> Self {
        Self {
            spawner,
            policy,
            records: BTreeMap::new(),
        }
    }

    pub fn spawner(&self) -> &S {
        &self.spawner
    }

    pub fn record(&self, key: &str) -> Option<&GroupRecord> {
        self.records.get(key)
    }

    pub fn keys(&self) -> Vec<String> {
        self.records.keys().cloned().collect()
    }

    /// Reconcile the running groups with `specs`
    pub async fn reconcile(&mut self, specs: Vec<DeviceGroupSpec>) -> ReconcileReport {
        let mut report = ReconcileReport::default();

        for key in self.spawner.reap() {
            if self.records.contains_key(&key) {
                tracing::warn!(group = %key, "Device group process exited");
            }
        }

        let removed: Vec<String> = self
            .records
            .keys()
            .filter(|key| !specs.iter().any(|s| &s.key == *key))
            .cloned()
            .collect();
        for key in removed {
            self.records.remove(&key);
            if let Err(e) = self.spawner.stop(&key).await {
                tracing::warn!(group = %key, error = %e, "Failed to stop removed group");
            }
            tracing::info!(group = %key, "Device group removed");
            report.stopped.push(key);
        }

        for spec in specs {
            let key = spec.key.clone();
            let changed = match self.records.get(&key) {
                None => None,
                Some(record) => Some(record.spec != spec),
            };

            match changed {
                None => {
                    self.spawn_new(spec).await;
                    report.spawned.push(key);
                }
                Some(true) => {
                    if let Err(e) = self.spawner.stop(&key).await {
                        tracing::warn!(group = %key, error = %e, "Failed to stop changed group");
                    }
                    tracing::info!(group = %key, "Device group membership changed, recreating");
                    self.respawn_changed(spec).await;
                    report.recreated.push(key);
                }
                Some(false) => self.supervise(&key, &mut report).await,
            }
        }

        report
    }

    async fn spawn_new(&mut self, spec: DeviceGroupSpec) {
        let key = spec.key.clone();
        if let Err(e) = self.spawner.spawn(&spec).await {
            // Treated like a death on the next pass
            tracing::error!(group = %key, kind = ?e.kind(), error = %e, "Failed to spawn device group");
        }
        let record = GroupRecord::new(spec, &self.policy);
        tracing::info!(group = %key, uid = %record.process_uid, "Device group spawned");
        self.records.insert(key, record);
    }

    async fn respawn_changed(&mut self, spec: DeviceGroupSpec) {
        let Some(record) = self.records.get_mut(&spec.key) else {
            return self.spawn_new(spec).await;
        };
        if let Err(e) = self.spawner.spawn(&spec).await {
            tracing::error!(group = %spec.key, kind = ?e.kind(), error = %e, "Failed to spawn device group");
        }
        record.recreate(spec);
        tracing::info!(group = %record.spec.key, uid = %record.process_uid, "Device group spawned");
    }

    /// Respawn a dead group within its restart budget
    async fn supervise(&mut self, key: &str, report: &mut ReconcileReport) {
        if self.spawner.is_alive(key) {
            report.unchanged.push(key.to_string());
            return;
        }
        let Some(record) = self.records.get_mut(key) else {
            return;
        };
        if record.given_up {
            return;
        }
        if record.next_attempt.is_some_and(|at| Instant::now() < at) {
            return;
        }

        match record.supervisor.on_crash() {
            Some(backoff) => {
                tracing::warn!(
                    group = %key,
                    uid = %record.process_uid,
                    attempt = record.supervisor.restart_count(),
                    "Device group process died, respawning"
                );
                if let Err(e) = self.spawner.spawn(&record.spec).await {
                    tracing::error!(group = %key, error = %e, "Respawn failed");
                }
                record.next_attempt = Some(Instant::now() + backoff);
                report.respawned.push(key.to_string());
            }
            None => {
                record.given_up = true;
                tracing::error!(
                    group = %key,
                    uid = %record.process_uid,
                    respawns = record.supervisor.restart_count(),
                    "Device group keeps dying, giving up; operator action required"
                );
                report.given_up.push(key.to_string());
            }
        }
    }

    /// Stop every group and forget all records
    pub async fn stop_all(&mut self) {
        let keys: Vec<String> = self.records.keys().cloned().collect();
        for key in keys {
            if let Err(e) = self.spawner.stop(&key).await {
                tracing::warn!(group = %key, error = %e, "Failed to stop group");
            }
        }
        self.records.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DaqConfig;
    use crate::topology::build_groups;
    use parking_lot::Mutex;
    use std::collections::HashSet;
    use std::sync::Arc;
    use std::time::Duration;

    #[derive(Clone, Default)]
    struct FakeSpawner {
        spawns: Arc<Mutex<Vec<String>>>,
        stops: Arc<Mutex<Vec<String>>>,
        alive: Arc<Mutex<HashSet<String>>>,
        exited: Arc<Mutex<Vec<String>>>,
    }

    impl FakeSpawner {
        fn kill(&self, key: &str) {
            self.alive.lock().remove(key);
            self.exited.lock().push(key.to_string());
        }

        fn spawn_count(&self, key: &str) -> usize {
            self.spawns.lock().iter().filter(|k| *k == key).count()
        }
    }

    #[async_trait]
    impl GroupSpawner for FakeSpawner {
        async fn spawn(&self, spec: &DeviceGroupSpec) -> DaqResult<()> {
            self.spawns.lock().push(spec.key.clone());
            self.alive.lock().insert(spec.key.clone());
            Ok(())
        }

        async fn stop(&self, key: &str) -> DaqResult<()> {
            self.stops.lock().push(key.to_string());
            self.alive.lock().remove(key);
            Ok(())
        }

        fn is_alive(&self, key: &str) -> bool {
            self.alive.lock().contains(key)
        }

        fn reap(&self) -> Vec<String> {
            std::mem::take(&mut *self.exited.lock())
        }
    }

    const FLEET: &str = r#"
        [[gateways]]
        id = 1
        address = "192.168.1.10/24"

        [[gateways]]
        id = 2
        address = "192.168.2.10/24"

        [[remote_devices]]
        id = 3
        gateway_id = 1
        address = "192.168.1.20"
        device_instance = 50
    "#;

    const GROUP_1: &str = "1-192.168.1.10:47808";
    const GROUP_2: &str = "2-192.168.2.10:47808";

    fn groups(toml: &str) -> Vec<DeviceGroupSpec> {
        build_groups(&DaqConfig::from_toml_str(toml).unwrap()).unwrap()
    }

    fn immediate_policy() -> RestartPolicy {
        RestartPolicy {
            initial_backoff: Duration::ZERO,
            max_backoff: Duration::ZERO,
            ..RestartPolicy::default()
        }
    }

    #[tokio::test]
    async fn test_unchanged_topology_is_idempotent() {
        let spawner = FakeSpawner::default();
        let mut registry = GroupRegistry::new(spawner.clone());

        let first = registry.reconcile(groups(FLEET)).await;
        assert_eq!(first.spawned, vec![GROUP_1, GROUP_2]);
        let uid = registry.record(GROUP_1).unwrap().process_uid;

        let second = registry.reconcile(groups(FLEET)).await;
        assert!(second.spawned.is_empty());
        assert!(second.recreated.is_empty());
        assert_eq!(second.unchanged, vec![GROUP_1, GROUP_2]);
        assert_eq!(spawner.spawns.lock().len(), 2);
        assert_eq!(registry.record(GROUP_1).unwrap().process_uid, uid);
    }

    #[tokio::test]
    async fn test_changed_group_is_recreated_and_removed_group_stopped() {
        let spawner = FakeSpawner::default();
        let mut registry = GroupRegistry::new(spawner.clone());
        registry.reconcile(groups(FLEET)).await;
        let uid = registry.record(GROUP_1).unwrap().process_uid;

        let changed = r#"
            [[gateways]]
            id = 1
            address = "192.168.1.10/24"

            [[remote_devices]]
            id = 3
            gateway_id = 1
            address = "192.168.1.20"
            device_instance = 51
        "#;
        let report = registry.reconcile(groups(changed)).await;

        assert_eq!(report.recreated, vec![GROUP_1]);
        assert_eq!(report.stopped, vec![GROUP_2]);
        assert_ne!(registry.record(GROUP_1).unwrap().process_uid, uid);
        assert_eq!(registry.keys(), vec![GROUP_1]);
        assert!(!spawner.is_alive(GROUP_2));
    }

    #[tokio::test]
    async fn test_respawn_ceiling() {
        let spawner = FakeSpawner::default();
        let mut registry = GroupRegistry::with_policy(spawner.clone(), immediate_policy());
        registry.reconcile(groups(FLEET)).await;
        assert_eq!(spawner.spawn_count(GROUP_1), 1);

        for death in 1..=3 {
            spawner.kill(GROUP_1);
            let report = registry.reconcile(groups(FLEET)).await;
            assert_eq!(report.respawned, vec![GROUP_1], "death {}", death);
        }
        assert_eq!(spawner.spawn_count(GROUP_1), 4);

        spawner.kill(GROUP_1);
        let report = registry.reconcile(groups(FLEET)).await;
        assert_eq!(report.given_up, vec![GROUP_1]);
        assert!(report.respawned.is_empty());

        // Terminal: nothing further on later passes
        let report = registry.reconcile(groups(FLEET)).await;
        assert!(report.given_up.is_empty());
        assert_eq!(spawner.spawn_count(GROUP_1), 4);
        assert_eq!(registry.record(GROUP_1).unwrap().respawns(), 3);
        assert!(registry.record(GROUP_1).unwrap().is_given_up());
        // The healthy sibling is unaffected
        assert_eq!(report.unchanged, vec![GROUP_2]);
    }

    #[tokio::test]
    async fn test_exited_groups_are_reaped_before_supervision() {
        let spawner = FakeSpawner::default();
        let mut registry = GroupRegistry::with_policy(spawner.clone(), immediate_policy());
        registry.reconcile(groups(FLEET)).await;

        spawner.kill(GROUP_1);
        let report = registry.reconcile(groups(FLEET)).await;
        assert!(spawner.exited.lock().is_empty());
        assert_eq!(report.respawned, vec![GROUP_1]);
    }

    #[tokio::test]
    async fn test_recreated_group_gets_fresh_restart_budget() {
        let spawner = FakeSpawner::default();
        let mut registry = GroupRegistry::with_policy(spawner.clone(), immediate_policy());
        registry.reconcile(groups(FLEET)).await;
        for _ in 0..4 {
            spawner.kill(GROUP_1);
            registry.reconcile(groups(FLEET)).await;
        }
        assert!(registry.record(GROUP_1).unwrap().is_given_up());

        let changed = FLEET.replace("device_instance = 50", "device_instance = 51");
        let report = registry.reconcile(groups(&changed)).await;
        assert_eq!(report.recreated, vec![GROUP_1]);
        let record = registry.record(GROUP_1).unwrap();
        assert!(!record.is_given_up());
        assert_eq!(record.respawns(), 0);
        assert!(spawner.is_alive(GROUP_1));

        spawner.kill(GROUP_1);
        let report = registry.reconcile(groups(&changed)).await;
        assert_eq!(report.respawned, vec![GROUP_1]);
        assert_eq!(registry.record(GROUP_1).unwrap().respawns(), 1);
    }

    #[tokio::test]
    async fn test_backoff_delays_respawn() {
        let spawner = FakeSpawner::default();
        let policy = RestartPolicy {
            initial_backoff: Duration::from_secs(60),
            ..RestartPolicy::default()
        };
        let mut registry = GroupRegistry::with_policy(spawner.clone(), policy);
        registry.reconcile(groups(FLEET)).await;

        spawner.kill(GROUP_1);
        registry.reconcile(groups(FLEET)).await;
        spawner.kill(GROUP_1);
        let report = registry.reconcile(groups(FLEET)).await;

        assert!(report.respawned.is_empty());
        assert_eq!(spawner.spawn_count(GROUP_1), 2);
    }

    #[test]
    fn test_stop_all() {
        let spawner = FakeSpawner::default();
        let mut registry = GroupRegistry::new(spawner.clone());
        tokio_test::block_on(registry.reconcile(groups(FLEET)));

        tokio_test::block_on(registry.stop_all());
        assert!(registry.keys().is_empty());
        assert_eq!(spawner.stops.lock().len(), 2);
    }
}
