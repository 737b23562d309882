//! Object store used by the reconcilers
//!
//! Reconcilers never talk to the API server directly: every read and write
//! goes through [`ObjectStore`], which takes an explicit cancellation token
//! on each call. [`KubeStore`] is the `kube::Client` backed implementation.
//! Objects travel as [`DynamicObject`] so one store covers core kinds and
//! Prometheus operator kinds alike.

use crate::crd::{FlowCollector, FlowMetric};
use crate::error::{OperatorError, Result};
use async_trait::async_trait;
use kube::api::{Api, DeleteParams, DynamicObject, ListParams, Patch, PatchParams, PostParams};
use kube::discovery::ApiResource;
use kube::Client;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fmt;
use std::future::Future;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Kinds of objects owned by the operator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ObjectKind {
    ConfigMap,
    Secret,
    Service,
    ServiceAccount,
    ClusterRole,
    ClusterRoleBinding,
    DaemonSet,
    Deployment,
    HorizontalPodAutoscaler,
    ServiceMonitor,
    PrometheusRule,
}

impl ObjectKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ObjectKind::ConfigMap => "ConfigMap",
            ObjectKind::Secret => "Secret",
            ObjectKind::Service => "Service",
            ObjectKind::ServiceAccount => "ServiceAccount",
            ObjectKind::ClusterRole => "ClusterRole",
            ObjectKind::ClusterRoleBinding => "ClusterRoleBinding",
            ObjectKind::DaemonSet => "DaemonSet",
            ObjectKind::Deployment => "Deployment",
            ObjectKind::HorizontalPodAutoscaler => "HorizontalPodAutoscaler",
            ObjectKind::ServiceMonitor => "ServiceMonitor",
            ObjectKind::PrometheusRule => "PrometheusRule",
        }
    }

    pub fn from_kind(kind: &str) -> Option<Self> {
        let k = match kind {
            "ConfigMap" => ObjectKind::ConfigMap,
            "Secret" => ObjectKind::Secret,
            "Service" => ObjectKind::Service,
            "ServiceAccount" => ObjectKind::ServiceAccount,
            "ClusterRole" => ObjectKind::ClusterRole,
            "ClusterRoleBinding" => ObjectKind::ClusterRoleBinding,
            "DaemonSet" => ObjectKind::DaemonSet,
            "Deployment" => ObjectKind::Deployment,
            "HorizontalPodAutoscaler" => ObjectKind::HorizontalPodAutoscaler,
            "ServiceMonitor" => ObjectKind::ServiceMonitor,
            "PrometheusRule" => ObjectKind::PrometheusRule,
            _ => return None,
        };
        Some(k)
    }

    pub fn is_namespaced(&self) -> bool {
        !matches!(self, ObjectKind::ClusterRole | ObjectKind::ClusterRoleBinding)
    }

    pub fn api_resource(&self) -> ApiResource {
        let (group, version, plural) = match self {
            ObjectKind::ConfigMap => ("", "v1", "configmaps"),
            ObjectKind::Secret => ("", "v1", "secrets"),
            ObjectKind::Service => ("", "v1", "services"),
            ObjectKind::ServiceAccount => ("", "v1", "serviceaccounts"),
            ObjectKind::ClusterRole => ("rbac.authorization.k8s.io", "v1", "clusterroles"),
            ObjectKind::ClusterRoleBinding => {
                ("rbac.authorization.k8s.io", "v1", "clusterrolebindings")
            }
            ObjectKind::DaemonSet => ("apps", "v1", "daemonsets"),
            ObjectKind::Deployment => ("apps", "v1", "deployments"),
            ObjectKind::HorizontalPodAutoscaler => {
                ("autoscaling", "v2", "horizontalpodautoscalers")
            }
            ObjectKind::ServiceMonitor => ("monitoring.coreos.com", "v1", "servicemonitors"),
            ObjectKind::PrometheusRule => ("monitoring.coreos.com", "v1", "prometheusrules"),
        };
        let api_version = if group.is_empty() {
            version.to_string()
        } else {
            format!("{}/{}", group, version)
        };
        ApiResource {
            group: group.to_string(),
            version: version.to_string(),
            api_version,
            kind: self.as_str().to_string(),
            plural: plural.to_string(),
        }
    }
}

impl fmt::Display for ObjectKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identity of an object in the cluster
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectKey {
    pub kind: ObjectKind,
    /// `None` for cluster-scoped kinds
    pub namespace: Option<String>,
    pub name: String,
}

impl ObjectKey {
    pub fn new(kind: ObjectKind, namespace: &str, name: &str) -> Self {
        Self {
            kind,
            namespace: kind.is_namespaced().then(|| namespace.to_string()),
            name: name.to_string(),
        }
    }

    /// Key of an object built by the operator
    pub fn of(obj: &DynamicObject) -> Result<Self> {
        let kind_name = obj.types.as_ref().map(|t| t.kind.as_str()).unwrap_or_default();
        let kind = ObjectKind::from_kind(kind_name).ok_or_else(|| {
            OperatorError::Internal(format!("unsupported object kind '{}'", kind_name))
        })?;
        let name = obj
            .metadata
            .name
            .as_deref()
            .ok_or_else(|| OperatorError::Internal(format!("{} missing metadata.name", kind)))?;
        Ok(Self::new(
            kind,
            obj.metadata.namespace.as_deref().unwrap_or_default(),
            name,
        ))
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{} {}/{}", self.kind, ns, self.name),
            None => write!(f, "{} {}", self.kind, self.name),
        }
    }
}

/// Convert a typed object into its dynamic form
pub fn to_dynamic<K: Serialize>(obj: &K) -> Result<DynamicObject> {
    Ok(serde_json::from_value(serde_json::to_value(obj)?)?)
}

/// Convert a dynamic object into a typed one
pub fn from_dynamic<K: DeserializeOwned>(obj: &DynamicObject) -> Result<K> {
    Ok(serde_json::from_value(serde_json::to_value(obj)?)?)
}

/// Run `fut` unless `cancel` fires first
pub async fn with_cancel<T>(
    cancel: &CancellationToken,
    op: &str,
    fut: impl Future<Output = Result<T>>,
) -> Result<T> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(OperatorError::Cancelled(op.to_string())),
        res = fut => res,
    }
}

/// Cluster access needed by the reconcilers
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Fetch an object; `Ok(None)` when it does not exist
    async fn get(&self, key: &ObjectKey, cancel: &CancellationToken)
        -> Result<Option<DynamicObject>>;

    async fn create(&self, obj: &DynamicObject, cancel: &CancellationToken)
        -> Result<DynamicObject>;

    async fn update(&self, obj: &DynamicObject, cancel: &CancellationToken)
        -> Result<DynamicObject>;

    async fn delete(&self, key: &ObjectKey, cancel: &CancellationToken) -> Result<()>;

    async fn get_flow_collector(
        &self,
        name: &str,
        cancel: &CancellationToken,
    ) -> Result<Option<FlowCollector>>;

    /// Write the status of `fc`, failing with a conflict when its resource
    /// version is stale
    async fn update_flow_collector_status(
        &self,
        fc: &FlowCollector,
        cancel: &CancellationToken,
    ) -> Result<()>;

    async fn list_flow_metrics(
        &self,
        namespace: &str,
        cancel: &CancellationToken,
    ) -> Result<Vec<FlowMetric>>;
}

/// [`ObjectStore`] backed by the Kubernetes API
pub struct KubeStore {
    client: Client,
}

impl KubeStore {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn api(&self, kind: ObjectKind, namespace: Option<&str>) -> Api<DynamicObject> {
        let ar = kind.api_resource();
        match namespace {
            Some(ns) if kind.is_namespaced() => Api::namespaced_with(self.client.clone(), ns, &ar),
            _ => Api::all_with(self.client.clone(), &ar),
        }
    }
}

#[async_trait]
impl ObjectStore for KubeStore {
    async fn get(
        &self,
        key: &ObjectKey,
        cancel: &CancellationToken,
    ) -> Result<Option<DynamicObject>> {
        let api = self.api(key.kind, key.namespace.as_deref());
        with_cancel(cancel, "get", async {
            api.get_opt(&key.name).await.map_err(OperatorError::from)
        })
        .await
    }

    async fn create(
        &self,
        obj: &DynamicObject,
        cancel: &CancellationToken,
    ) -> Result<DynamicObject> {
        let key = ObjectKey::of(obj)?;
        debug!(object = %key, "Creating object");
        let api = self.api(key.kind, key.namespace.as_deref());
        with_cancel(cancel, "create", async {
            api.create(&PostParams::default(), obj)
                .await
                .map_err(OperatorError::from)
        })
        .await
    }

    async fn update(
        &self,
        obj: &DynamicObject,
        cancel: &CancellationToken,
    ) -> Result<DynamicObject> {
        let key = ObjectKey::of(obj)?;
        debug!(object = %key, "Updating object");
        let api = self.api(key.kind, key.namespace.as_deref());
        with_cancel(cancel, "update", async {
            api.replace(&key.name, &PostParams::default(), obj)
                .await
                .map_err(OperatorError::from)
        })
        .await
    }

    async fn delete(&self, key: &ObjectKey, cancel: &CancellationToken) -> Result<()> {
        debug!(object = %key, "Deleting object");
        let api = self.api(key.kind, key.namespace.as_deref());
        with_cancel(cancel, "delete", async {
            api.delete(&key.name, &DeleteParams::default())
                .await
                .map(|_| ())
                .map_err(OperatorError::from)
        })
        .await
    }

    async fn get_flow_collector(
        &self,
        name: &str,
        cancel: &CancellationToken,
    ) -> Result<Option<FlowCollector>> {
        let api: Api<FlowCollector> = Api::all(self.client.clone());
        with_cancel(cancel, "get FlowCollector", async {
            api.get_opt(name).await.map_err(OperatorError::from)
        })
        .await
    }

    async fn update_flow_collector_status(
        &self,
        fc: &FlowCollector,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let api: Api<FlowCollector> = Api::all(self.client.clone());
        let name = fc
            .metadata
            .name
            .as_deref()
            .ok_or_else(|| OperatorError::Internal("FlowCollector missing name".to_string()))?;
        // The resource version makes the merge patch fail with 409 when stale
        let patch = serde_json::json!({
            "metadata": { "resourceVersion": fc.metadata.resource_version },
            "status": fc.status,
        });
        with_cancel(cancel, "update FlowCollector status", async {
            api.patch_status(name, &PatchParams::default(), &Patch::Merge(&patch))
                .await
                .map(|_| ())
                .map_err(OperatorError::from)
        })
        .await
    }

    async fn list_flow_metrics(
        &self,
        namespace: &str,
        cancel: &CancellationToken,
    ) -> Result<Vec<FlowMetric>> {
        let api: Api<FlowMetric> = Api::namespaced(self.client.clone(), namespace);
        with_cancel(cancel, "list FlowMetrics", async {
            api.list(&ListParams::default())
                .await
                .map(|l| l.items)
                .map_err(OperatorError::from)
        })
        .await
    }
}

/// In-memory store for reconciler tests
#[cfg(test)]
pub mod memory {
    use super::*;
    use parking_lot::Mutex;
    use std::collections::BTreeMap;

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub enum WriteOp {
        Create,
        Update,
        Delete,
    }

    #[derive(Default)]
    struct State {
        objects: BTreeMap<ObjectKey, DynamicObject>,
        flow_collectors: BTreeMap<String, FlowCollector>,
        flow_metrics: Vec<FlowMetric>,
        writes: Vec<(WriteOp, ObjectKey)>,
        status_writes: usize,
        forced_status_conflicts: usize,
        version: u64,
    }

    impl State {
        fn next_version(&mut self) -> String {
            self.version += 1;
            self.version.to_string()
        }
    }

    #[derive(Default)]
    pub struct MemoryStore {
        state: Mutex<State>,
    }

    impl MemoryStore {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn put_flow_collector(&self, mut fc: FlowCollector) {
            let mut state = self.state.lock();
            fc.metadata.resource_version = Some(state.next_version());
            let name = fc.metadata.name.clone().unwrap_or_default();
            state.flow_collectors.insert(name, fc);
        }

        pub fn flow_collector(&self, name: &str) -> Option<FlowCollector> {
            self.state.lock().flow_collectors.get(name).cloned()
        }

        pub fn set_flow_metrics(&self, metrics: Vec<FlowMetric>) {
            self.state.lock().flow_metrics = metrics;
        }

        pub fn insert(&self, obj: DynamicObject) {
            let key = ObjectKey::of(&obj).unwrap();
            self.state.lock().objects.insert(key, obj);
        }

        pub fn object(&self, key: &ObjectKey) -> Option<DynamicObject> {
            self.state.lock().objects.get(key).cloned()
        }

        pub fn keys(&self) -> Vec<ObjectKey> {
            self.state.lock().objects.keys().cloned().collect()
        }

        pub fn writes(&self) -> Vec<(WriteOp, ObjectKey)> {
            self.state.lock().writes.clone()
        }

        pub fn clear_writes(&self) {
            self.state.lock().writes.clear();
        }

        pub fn status_writes(&self) -> usize {
            self.state.lock().status_writes
        }

        /// Make the next `n` status writes fail with a conflict
        pub fn force_status_conflicts(&self, n: usize) {
            self.state.lock().forced_status_conflicts = n;
        }
    }

    fn cancelled(cancel: &CancellationToken, op: &str) -> Result<()> {
        if cancel.is_cancelled() {
            return Err(OperatorError::Cancelled(op.to_string()));
        }
        Ok(())
    }

    #[async_trait]
    impl ObjectStore for MemoryStore {
        async fn get(
            &self,
            key: &ObjectKey,
            cancel: &CancellationToken,
        ) -> Result<Option<DynamicObject>> {
            cancelled(cancel, "get")?;
            Ok(self.state.lock().objects.get(key).cloned())
        }

        async fn create(
            &self,
            obj: &DynamicObject,
            cancel: &CancellationToken,
        ) -> Result<DynamicObject> {
            cancelled(cancel, "create")?;
            let key = ObjectKey::of(obj)?;
            let mut state = self.state.lock();
            if state.objects.contains_key(&key) {
                return Err(OperatorError::Conflict {
                    kind: key.kind.to_string(),
                    name: key.name,
                });
            }
            let mut stored = obj.clone();
            stored.metadata.resource_version = Some(state.next_version());
            state.objects.insert(key.clone(), stored.clone());
            state.writes.push((WriteOp::Create, key));
            Ok(stored)
        }

        async fn update(
            &self,
            obj: &DynamicObject,
            cancel: &CancellationToken,
        ) -> Result<DynamicObject> {
            cancelled(cancel, "update")?;
            let key = ObjectKey::of(obj)?;
            let mut state = self.state.lock();
            if !state.objects.contains_key(&key) {
                return Err(OperatorError::NotFound {
                    kind: key.kind.to_string(),
                    name: key.name,
                    namespace: key.namespace.unwrap_or_default(),
                });
            }
            let mut stored = obj.clone();
            stored.metadata.resource_version = Some(state.next_version());
            state.objects.insert(key.clone(), stored.clone());
            state.writes.push((WriteOp::Update, key));
            Ok(stored)
        }

        async fn delete(&self, key: &ObjectKey, cancel: &CancellationToken) -> Result<()> {
            cancelled(cancel, "delete")?;
            let mut state = self.state.lock();
            if state.objects.remove(key).is_none() {
                return Err(OperatorError::NotFound {
                    kind: key.kind.to_string(),
                    name: key.name.clone(),
                    namespace: key.namespace.clone().unwrap_or_default(),
                });
            }
            state.writes.push((WriteOp::Delete, key.clone()));
            Ok(())
        }

        async fn get_flow_collector(
            &self,
            name: &str,
            cancel: &CancellationToken,
        ) -> Result<Option<FlowCollector>> {
            cancelled(cancel, "get FlowCollector")?;
            Ok(self.state.lock().flow_collectors.get(name).cloned())
        }

        async fn update_flow_collector_status(
            &self,
            fc: &FlowCollector,
            cancel: &CancellationToken,
        ) -> Result<()> {
            cancelled(cancel, "update FlowCollector status")?;
            let name = fc.metadata.name.clone().unwrap_or_default();
            let mut state = self.state.lock();
            let conflict = OperatorError::Conflict {
                kind: "FlowCollector".to_string(),
                name: name.clone(),
            };
            if state.forced_status_conflicts > 0 {
                state.forced_status_conflicts -= 1;
                // Simulate a concurrent writer bumping the version
                let version = state.next_version();
                if let Some(current) = state.flow_collectors.get_mut(&name) {
                    current.metadata.resource_version = Some(version);
                }
                return Err(conflict);
            }
            let version = state.next_version();
            let current = state.flow_collectors.get_mut(&name).ok_or_else(|| {
                OperatorError::NotFound {
                    kind: "FlowCollector".to_string(),
                    name: name.clone(),
                    namespace: String::new(),
                }
            })?;
            if current.metadata.resource_version != fc.metadata.resource_version {
                return Err(conflict);
            }
            current.status = fc.status.clone();
            current.metadata.resource_version = Some(version);
            state.status_writes += 1;
            Ok(())
        }

        async fn list_flow_metrics(
            &self,
            namespace: &str,
            cancel: &CancellationToken,
        ) -> Result<Vec<FlowMetric>> {
            cancelled(cancel, "list FlowMetrics")?;
            Ok(self
                .state
                .lock()
                .flow_metrics
                .iter()
                .filter(|m| m.metadata.namespace.as_deref() == Some(namespace))
                .cloned()
                .collect())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::memory::{MemoryStore, WriteOp};
    use super::*;
    use k8s_openapi::api::core::v1::ConfigMap;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

    fn create_test_config_map(ns: &str, name: &str) -> DynamicObject {
        to_dynamic(&ConfigMap {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some(ns.to_string()),
                ..Default::default()
            },
            ..Default::default()
        })
        .unwrap()
    }

    #[test]
    fn test_object_key_of_typed_object() {
        let obj = create_test_config_map("netobserv", "flowlogs-pipeline-config");
        let key = ObjectKey::of(&obj).unwrap();
        assert_eq!(key.kind, ObjectKind::ConfigMap);
        assert_eq!(key.namespace.as_deref(), Some("netobserv"));
        assert_eq!(key.to_string(), "ConfigMap netobserv/flowlogs-pipeline-config");
    }

    #[test]
    fn test_cluster_scoped_key_drops_namespace() {
        let key = ObjectKey::new(ObjectKind::ClusterRoleBinding, "netobserv", "flp-role");
        assert!(key.namespace.is_none());
        assert_eq!(key.to_string(), "ClusterRoleBinding flp-role");
    }

    #[test]
    fn test_api_resources() {
        let ar = ObjectKind::HorizontalPodAutoscaler.api_resource();
        assert_eq!(ar.api_version, "autoscaling/v2");
        assert_eq!(ar.plural, "horizontalpodautoscalers");
        assert_eq!(ObjectKind::Service.api_resource().api_version, "v1");
        assert_eq!(
            ObjectKind::from_kind("ServiceMonitor"),
            Some(ObjectKind::ServiceMonitor)
        );
        assert_eq!(ObjectKind::from_kind("Pod"), None);
    }

    #[test]
    fn test_typed_round_trip_keeps_data() {
        let mut cm = ConfigMap::default();
        cm.metadata.name = Some("cm".to_string());
        cm.data = Some([("k".to_string(), "v".to_string())].into());
        let dynamic = to_dynamic(&cm).unwrap();
        let back: ConfigMap = from_dynamic(&dynamic).unwrap();
        assert_eq!(back.data, cm.data);
    }

    #[tokio::test]
    async fn test_with_cancel() {
        let cancel = CancellationToken::new();
        let ok = with_cancel(&cancel, "op", async { Ok(1) }).await.unwrap();
        assert_eq!(ok, 1);

        cancel.cancel();
        let err = with_cancel(&cancel, "op", std::future::pending::<Result<()>>())
            .await
            .unwrap_err();
        assert!(matches!(err, OperatorError::Cancelled(_)));
    }

    #[tokio::test]
    async fn test_memory_store_writes() {
        let store = MemoryStore::new();
        let cancel = CancellationToken::new();
        let obj = create_test_config_map("ns", "a");
        let key = ObjectKey::of(&obj).unwrap();

        assert!(store.get(&key, &cancel).await.unwrap().is_none());
        store.create(&obj, &cancel).await.unwrap();
        assert!(store.create(&obj, &cancel).await.unwrap_err().is_conflict());
        store.update(&obj, &cancel).await.unwrap();
        store.delete(&key, &cancel).await.unwrap();
        assert!(store.delete(&key, &cancel).await.unwrap_err().is_not_found());

        let ops: Vec<WriteOp> = store.writes().into_iter().map(|(op, _)| op).collect();
        assert_eq!(ops, vec![WriteOp::Create, WriteOp::Update, WriteOp::Delete]);
    }
}
