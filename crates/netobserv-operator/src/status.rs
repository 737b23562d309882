//! Readiness of the operator components
//!
//! Every component reconciler reports into one shared [`StatusManager`].
//! [`StatusManager::commit`] turns the collected states into FlowCollector
//! conditions: one aggregated `Ready` condition plus one `<Component>Ready`
//! condition per component.

use crate::crd::{FlowCollectorCondition, FLOW_COLLECTOR_NAME};
use crate::error::Result;
use crate::store::ObjectStore;
use chrono::Utc;
use k8s_openapi::api::apps::v1::{DaemonSet, Deployment};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::fmt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Attempts at writing the status before giving up
const MAX_STATUS_ATTEMPTS: usize = 5;

/// Component reporting a readiness state
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Component {
    /// The FlowCollector reconciler itself
    Parent,
    Monolith,
    Transformer,
    Ingester,
    InProcess,
}

impl Component {
    pub const ALL: [Component; 5] = [
        Component::Parent,
        Component::Monolith,
        Component::Transformer,
        Component::Ingester,
        Component::InProcess,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Component::Parent => "FLPParent",
            Component::Monolith => "FLPMonolith",
            Component::Transformer => "FLPTransformer",
            Component::Ingester => "FLPIngester",
            Component::InProcess => "FLPInProcess",
        }
    }

    pub fn condition_type(&self) -> String {
        format!("{}Ready", self.name())
    }
}

impl fmt::Display for Component {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ComponentState {
    Unknown,
    InProgress,
    Ready,
    Failure,
    Unused,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ComponentStatus {
    pub component: Component,
    pub state: ComponentState,
    pub reason: Option<String>,
    pub message: Option<String>,
}

impl ComponentStatus {
    fn new(component: Component, state: ComponentState) -> Self {
        Self {
            component,
            state,
            reason: None,
            message: None,
        }
    }

    fn with(mut self, reason: &str, message: impl Into<String>) -> Self {
        self.reason = Some(reason.to_string());
        self.message = Some(message.into());
        self
    }

    fn to_condition(&self) -> FlowCollectorCondition {
        let (status, reason) = match self.state {
            ComponentState::Ready => ("True", self.reason.clone().unwrap_or_else(|| "Ready".to_string())),
            ComponentState::Failure | ComponentState::InProgress => (
                "False",
                self.reason.clone().unwrap_or_else(|| "NotReady".to_string()),
            ),
            ComponentState::Unused => ("Unknown", "ComponentUnused".to_string()),
            ComponentState::Unknown => (
                "Unknown",
                self.reason.clone().unwrap_or_else(|| "Unknown".to_string()),
            ),
        };
        FlowCollectorCondition {
            condition_type: self.component.condition_type(),
            status: status.to_string(),
            reason: Some(reason),
            message: self.message.clone(),
            last_transition_time: None,
        }
    }
}

/// Set `cond` in `conditions`, keeping the transition time when the status
/// does not change
pub fn set_condition(conditions: &mut Vec<FlowCollectorCondition>, mut cond: FlowCollectorCondition) {
    let now = Utc::now().to_rfc3339();
    match conditions
        .iter_mut()
        .find(|c| c.condition_type == cond.condition_type)
    {
        Some(existing) => {
            cond.last_transition_time = if existing.status == cond.status {
                existing.last_transition_time.clone().or(Some(now))
            } else {
                Some(now)
            };
            *existing = cond;
        }
        None => {
            cond.last_transition_time = Some(now);
            conditions.push(cond);
        }
    }
}

/// Shared register of component states
#[derive(Debug)]
pub struct StatusManager {
    statuses: Mutex<BTreeMap<Component, ComponentStatus>>,
    deployed_namespace: Mutex<Option<String>>,
}

impl Default for StatusManager {
    fn default() -> Self {
        Self::new()
    }
}

impl StatusManager {
    pub fn new() -> Self {
        let statuses = Component::ALL
            .into_iter()
            .map(|c| (c, ComponentStatus::new(c, ComponentState::Unknown)))
            .collect();
        Self {
            statuses: Mutex::new(statuses),
            deployed_namespace: Mutex::new(None),
        }
    }

    fn store(&self, status: ComponentStatus) {
        debug!(component = %status.component, state = ?status.state, "Component status");
        self.statuses.lock().insert(status.component, status);
    }

    pub fn status(&self, component: Component) -> Option<ComponentStatus> {
        self.statuses.lock().get(&component).cloned()
    }

    pub fn state(&self, component: Component) -> ComponentState {
        self.status(component)
            .map(|s| s.state)
            .unwrap_or(ComponentState::Unknown)
    }

    pub fn set_ready(&self, component: Component) {
        self.store(ComponentStatus::new(component, ComponentState::Ready));
    }

    pub fn set_in_progress(&self, component: Component, reason: &str, message: impl Into<String>) {
        self.store(ComponentStatus::new(component, ComponentState::InProgress).with(reason, message));
    }

    pub fn set_failure(&self, component: Component, reason: &str, message: impl Into<String>) {
        self.store(ComponentStatus::new(component, ComponentState::Failure).with(reason, message));
    }

    pub fn set_unused(&self, component: Component, message: impl Into<String>) {
        self.store(
            ComponentStatus::new(component, ComponentState::Unused).with("ComponentUnused", message),
        );
    }

    pub fn set_creating_daemon_set(&self, component: Component, name: &str) {
        self.set_in_progress(
            component,
            "CreatingDaemonSet",
            format!("Creating daemon set {}", name),
        );
    }

    pub fn set_creating_deployment(&self, component: Component, name: &str) {
        self.set_in_progress(
            component,
            "CreatingDeployment",
            format!("Creating deployment {}", name),
        );
    }

    /// Ready once every scheduled pod runs the latest template
    pub fn check_daemon_set_progress(&self, component: Component, ds: Option<&DaemonSet>) {
        let Some(ds) = ds else {
            self.set_in_progress(component, "DaemonSetNotCreated", "DaemonSet not created");
            return;
        };
        let (updated, desired) = ds
            .status
            .as_ref()
            .map(|s| (s.updated_number_scheduled.unwrap_or(0), s.desired_number_scheduled))
            .unwrap_or((0, 0));
        if updated < desired {
            self.set_in_progress(
                component,
                "DaemonSetNotReady",
                format!(
                    "DaemonSet {} not ready: {}/{}",
                    ds.metadata.name.as_deref().unwrap_or_default(),
                    updated,
                    desired
                ),
            );
        } else {
            self.set_ready(component);
        }
    }

    /// Ready once the `Available` condition is true
    pub fn check_deployment_progress(&self, component: Component, deployment: Option<&Deployment>) {
        let Some(deployment) = deployment else {
            self.set_in_progress(component, "DeploymentNotCreated", "Deployment not created");
            return;
        };
        let status = deployment.status.as_ref();
        let available = status
            .and_then(|s| s.conditions.as_ref())
            .and_then(|conds| conds.iter().find(|c| c.type_ == "Available"));
        match available {
            Some(cond) if cond.status != "True" => {
                let (updated, replicas) = status
                    .map(|s| (s.updated_replicas.unwrap_or(0), s.replicas.unwrap_or(0)))
                    .unwrap_or((0, 0));
                self.set_in_progress(
                    component,
                    "DeploymentNotReady",
                    format!(
                        "Deployment {} not ready: {}/{} ({})",
                        deployment.metadata.name.as_deref().unwrap_or_default(),
                        updated,
                        replicas,
                        cond.message.as_deref().unwrap_or_default()
                    ),
                );
            }
            _ => self.set_ready(component),
        }
    }

    pub fn set_deployed_namespace(&self, namespace: &str) {
        *self.deployed_namespace.lock() = Some(namespace.to_string());
    }

    pub fn deployed_namespace(&self) -> Option<String> {
        self.deployed_namespace.lock().clone()
    }

    /// Aggregated `Ready` condition followed by one condition per component
    pub fn conditions(&self) -> Vec<FlowCollectorCondition> {
        let statuses = self.statuses.lock();
        let count = |state: ComponentState| statuses.values().filter(|s| s.state == state).count();
        let (ready, failures, pending) = (
            count(ComponentState::Ready),
            count(ComponentState::Failure),
            count(ComponentState::InProgress),
        );
        let (status, reason) = if failures > 0 {
            ("False", "SomeFailures")
        } else if pending > 0 {
            ("False", "Pending")
        } else {
            ("True", "Ready")
        };
        let global = FlowCollectorCondition {
            condition_type: "Ready".to_string(),
            status: status.to_string(),
            reason: Some(reason.to_string()),
            message: Some(format!(
                "{} ready components, {} with failure, {} pending",
                ready, failures, pending
            )),
            last_transition_time: None,
        };
        std::iter::once(global)
            .chain(statuses.values().map(ComponentStatus::to_condition))
            .collect()
    }

    /// Write the conditions to the FlowCollector status
    ///
    /// Conflicts are retried on a fresh copy; failures are only logged.
    pub async fn commit(&self, store: &dyn ObjectStore, cancel: &CancellationToken) {
        if let Err(e) = self.try_commit(store, cancel).await {
            error!(error = %e, "Failed to update FlowCollector status");
        }
    }

    /// Same as [`StatusManager::commit`], returning the error
    pub async fn try_commit(&self, store: &dyn ObjectStore, cancel: &CancellationToken) -> Result<()> {
        let conditions = self.conditions();
        let namespace = self.deployed_namespace();
        let mut attempt = 0;
        loop {
            attempt += 1;
            let Some(mut fc) = store.get_flow_collector(FLOW_COLLECTOR_NAME, cancel).await? else {
                // Being deleted, nothing to report on
                return Ok(());
            };
            let previous = fc.status.clone();
            let status = fc.status.get_or_insert_with(Default::default);
            for cond in &conditions {
                set_condition(&mut status.conditions, cond.clone());
            }
            if namespace.is_some() {
                status.namespace = namespace.clone();
            }
            if fc.status == previous {
                debug!("FlowCollector status unchanged");
                return Ok(());
            }
            match store.update_flow_collector_status(&fc, cancel).await {
                Ok(()) => {
                    info!(attempt, "Updated FlowCollector status");
                    return Ok(());
                }
                Err(e) if e.is_conflict() && attempt < MAX_STATUS_ATTEMPTS => {
                    warn!(attempt, "Conflict on FlowCollector status, retrying");
                }
                Err(e) if e.is_not_found() => return Ok(()),
                Err(e) => return Err(e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::{FlowCollector, FlowCollectorSpec};
    use crate::store::memory::MemoryStore;
    use k8s_openapi::api::apps::v1::{DaemonSetStatus, DeploymentCondition, DeploymentStatus};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

    fn create_test_flow_collector() -> FlowCollector {
        let spec: FlowCollectorSpec = serde_json::from_str("{}").unwrap();
        let mut fc = FlowCollector::new(FLOW_COLLECTOR_NAME, spec);
        fc.metadata.resource_version = Some("1".to_string());
        fc
    }

    fn find<'a>(conds: &'a [FlowCollectorCondition], t: &str) -> &'a FlowCollectorCondition {
        conds.iter().find(|c| c.condition_type == t).unwrap()
    }

    #[test]
    fn test_global_condition() {
        let manager = StatusManager::new();
        let conds = manager.conditions();
        assert_eq!(conds.len(), 1 + Component::ALL.len());
        assert_eq!(conds[0].status, "True");

        manager.set_ready(Component::Monolith);
        manager.set_in_progress(Component::Transformer, "CreatingDeployment", "x");
        let conds = manager.conditions();
        assert_eq!(conds[0].reason.as_deref(), Some("Pending"));
        assert_eq!(
            conds[0].message.as_deref(),
            Some("1 ready components, 0 with failure, 1 pending")
        );

        manager.set_failure(Component::Ingester, "FLPReconcileError", "boom");
        let conds = manager.conditions();
        assert_eq!(conds[0].status, "False");
        assert_eq!(conds[0].reason.as_deref(), Some("SomeFailures"));
        let ingester = find(&conds, "FLPIngesterReady");
        assert_eq!(ingester.status, "False");
        assert_eq!(ingester.message.as_deref(), Some("boom"));
        assert_eq!(manager.state(Component::Ingester), ComponentState::Failure);
    }

    #[test]
    fn test_unused_reported_as_unknown() {
        let manager = StatusManager::new();
        manager.set_unused(Component::InProcess, "not embedded");
        let conds = manager.conditions();
        let cond = find(&conds, "FLPInProcessReady");
        assert_eq!(cond.status, "Unknown");
        assert_eq!(cond.reason.as_deref(), Some("ComponentUnused"));
        assert_eq!(conds[0].status, "True");
    }

    #[test]
    fn test_daemon_set_progress() {
        let manager = StatusManager::new();
        manager.check_daemon_set_progress(Component::Monolith, None);
        assert_eq!(manager.state(Component::Monolith), ComponentState::InProgress);

        let mut ds = DaemonSet {
            metadata: ObjectMeta {
                name: Some("flowlogs-pipeline".to_string()),
                ..Default::default()
            },
            status: Some(DaemonSetStatus {
                desired_number_scheduled: 3,
                updated_number_scheduled: Some(1),
                ..Default::default()
            }),
            ..Default::default()
        };
        manager.check_daemon_set_progress(Component::Monolith, Some(&ds));
        let status = manager.status(Component::Monolith).unwrap();
        assert_eq!(status.reason.as_deref(), Some("DaemonSetNotReady"));
        assert_eq!(
            status.message.as_deref(),
            Some("DaemonSet flowlogs-pipeline not ready: 1/3")
        );

        ds.status.as_mut().unwrap().updated_number_scheduled = Some(3);
        manager.check_daemon_set_progress(Component::Monolith, Some(&ds));
        assert_eq!(manager.state(Component::Monolith), ComponentState::Ready);
    }

    #[test]
    fn test_deployment_progress() {
        let manager = StatusManager::new();
        let mut deployment = Deployment {
            metadata: ObjectMeta {
                name: Some("flowlogs-pipeline-transformer".to_string()),
                ..Default::default()
            },
            status: Some(DeploymentStatus {
                replicas: Some(3),
                updated_replicas: Some(2),
                conditions: Some(vec![DeploymentCondition {
                    type_: "Available".to_string(),
                    status: "False".to_string(),
                    message: Some("minimum replicas unavailable".to_string()),
                    ..Default::default()
                }]),
                ..Default::default()
            }),
            ..Default::default()
        };
        manager.check_deployment_progress(Component::Transformer, Some(&deployment));
        let status = manager.status(Component::Transformer).unwrap();
        assert_eq!(status.reason.as_deref(), Some("DeploymentNotReady"));
        assert!(status.message.unwrap().contains("2/3"));

        deployment.status.as_mut().unwrap().conditions.as_mut().unwrap()[0].status =
            "True".to_string();
        manager.check_deployment_progress(Component::Transformer, Some(&deployment));
        assert_eq!(manager.state(Component::Transformer), ComponentState::Ready);
    }

    #[test]
    fn test_set_condition_keeps_transition_time() {
        let mut conds = vec![FlowCollectorCondition {
            condition_type: "Ready".to_string(),
            status: "True".to_string(),
            reason: Some("Ready".to_string()),
            message: None,
            last_transition_time: Some("2024-01-01T00:00:00+00:00".to_string()),
        }];
        let mut cond = conds[0].clone();
        cond.message = Some("updated".to_string());
        cond.last_transition_time = None;
        set_condition(&mut conds, cond.clone());
        assert_eq!(
            conds[0].last_transition_time.as_deref(),
            Some("2024-01-01T00:00:00+00:00")
        );
        assert_eq!(conds[0].message.as_deref(), Some("updated"));

        cond.status = "False".to_string();
        set_condition(&mut conds, cond);
        assert_ne!(
            conds[0].last_transition_time.as_deref(),
            Some("2024-01-01T00:00:00+00:00")
        );
        assert_eq!(conds.len(), 1);
    }

    #[tokio::test]
    async fn test_commit_retries_conflicts() {
        let store = MemoryStore::new();
        let cancel = CancellationToken::new();
        store.put_flow_collector(create_test_flow_collector());
        store.force_status_conflicts(2);

        let manager = StatusManager::new();
        manager.set_ready(Component::Monolith);
        manager.set_deployed_namespace("netobserv");
        manager.commit(&store, &cancel).await;

        assert_eq!(store.status_writes(), 1);
        let status = store.flow_collector(FLOW_COLLECTOR_NAME).unwrap().status.unwrap();
        assert_eq!(status.namespace.as_deref(), Some("netobserv"));
        assert_eq!(find(&status.conditions, "FLPMonolithReady").status, "True");
    }

    #[tokio::test]
    async fn test_commit_skips_unchanged_status() {
        let store = MemoryStore::new();
        let cancel = CancellationToken::new();
        store.put_flow_collector(create_test_flow_collector());

        let manager = StatusManager::new();
        manager.set_ready(Component::Monolith);
        manager.commit(&store, &cancel).await;
        manager.commit(&store, &cancel).await;
        assert_eq!(store.status_writes(), 1);

        manager.set_failure(Component::Monolith, "FLPReconcileError", "boom");
        manager.commit(&store, &cancel).await;
        assert_eq!(store.status_writes(), 2);
    }

    #[tokio::test]
    async fn test_commit_gives_up_after_max_attempts() {
        let store = MemoryStore::new();
        let cancel = CancellationToken::new();
        store.put_flow_collector(create_test_flow_collector());
        store.force_status_conflicts(MAX_STATUS_ATTEMPTS);

        StatusManager::new().commit(&store, &cancel).await;
        assert_eq!(store.status_writes(), 0);
    }

    #[tokio::test]
    async fn test_commit_ignores_missing_flow_collector() {
        let store = MemoryStore::new();
        let cancel = CancellationToken::new();
        StatusManager::new().commit(&store, &cancel).await;
        assert_eq!(store.status_writes(), 0);
    }
}
