//! FlowCollector Controller
//!
//! This module implements the Kubernetes controller pattern for the
//! `FlowCollector` singleton. Every change of the FlowCollector, of a
//! `FlowMetric`, of an owned object or of a watched certificate triggers a
//! full reconcile of the flowlogs-pipeline stack, followed by a status
//! update.

use crate::crd::{FlowCollector, FlowMetric, MountableType, FLOW_COLLECTOR_NAME};
use crate::error::{OperatorError, Result};
use crate::flp::{FlpConfig, FlpReconciler};
use crate::status::{Component, StatusManager};
use crate::store::{KubeStore, ObjectStore};
use crate::watcher::Watcher;
use futures::StreamExt;
use k8s_openapi::api::apps::v1::{DaemonSet, Deployment};
use k8s_openapi::api::core::v1::{ConfigMap, Secret, Service};
use kube::api::Api;
use kube::runtime::controller::{Action, Controller};
use kube::runtime::finalizer::{self, finalizer, Event as FinalizerEvent};
use kube::runtime::reflector::ObjectRef;
use kube::runtime::watcher::Config;
use kube::{Client, ResourceExt};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};
use validator::Validate;

/// Finalizer name for cleanup operations
pub const FINALIZER_NAME: &str = "flows.netobserv.io/finalizer";

/// Default requeue interval for successful reconciliations
const DEFAULT_REQUEUE_SECONDS: u64 = 300; // 5 minutes

/// Requeue interval for error cases (base for exponential backoff)
const ERROR_REQUEUE_SECONDS: u64 = 30;

/// Maximum requeue delay for error backoff
const MAX_ERROR_REQUEUE_SECONDS: u64 = 600;

/// Reconcile logic, independent from the controller runtime
pub struct FlowCollectorReconciler {
    store: Arc<dyn ObjectStore>,
    status: Arc<StatusManager>,
    watcher: Arc<Watcher>,
    flp: FlpReconciler,
}

impl FlowCollectorReconciler {
    pub fn new(store: Arc<dyn ObjectStore>, config: FlpConfig, namespace: &str) -> Self {
        let status = Arc::new(StatusManager::new());
        let watcher = Arc::new(Watcher::new());
        let flp = FlpReconciler::new(config, namespace, Arc::clone(&status), Arc::clone(&watcher));
        Self {
            store,
            status,
            watcher,
            flp,
        }
    }

    pub fn status(&self) -> &StatusManager {
        &self.status
    }

    pub fn watcher(&self) -> Arc<Watcher> {
        Arc::clone(&self.watcher)
    }

    /// Reconcile the stack and commit the resulting status
    #[instrument(skip_all, fields(namespace = %fc.spec.namespace))]
    pub async fn reconcile(&self, fc: &FlowCollector, cancel: &CancellationToken) -> Result<()> {
        let result = self.reconcile_stack(fc, cancel).await;
        self.status.commit(self.store.as_ref(), cancel).await;
        result
    }

    async fn reconcile_stack(&self, fc: &FlowCollector, cancel: &CancellationToken) -> Result<()> {
        let store = self.store.as_ref();
        let namespace = fc.spec.namespace.as_str();

        if let Err(errors) = fc.spec.validate() {
            let err = OperatorError::ValidationError(errors.to_string());
            self.status
                .set_failure(Component::Parent, "InvalidSpec", err.to_string());
            return Err(err);
        }

        self.watcher.reset(namespace);

        let previous = fc
            .status
            .as_ref()
            .and_then(|s| s.namespace.clone())
            .or_else(|| self.status.deployed_namespace());
        if previous.as_deref() != Some(namespace) {
            if let Some(previous) = &previous {
                info!(from = %previous, to = %namespace, "Operator namespace changed");
                self.flp.cleanup_namespace(store, previous, cancel).await;
            }
            self.status.set_deployed_namespace(namespace);
            if let Err(e) = self.status.try_commit(store, cancel).await {
                self.status
                    .set_failure(Component::Parent, "ChangeNamespaceError", e.to_string());
                return Err(e);
            }
        }

        let flow_metrics = match store.list_flow_metrics(namespace, cancel).await {
            Ok(metrics) => metrics,
            Err(e) => {
                self.status
                    .set_failure(Component::Parent, "CantListFlowMetrics", e.to_string());
                return Err(e);
            }
        };
        let user_metrics: Vec<_> = flow_metrics.into_iter().map(|fm| fm.spec).collect();
        debug!(count = user_metrics.len(), "Loaded FlowMetrics");

        self.status.set_ready(Component::Parent);
        self.flp.reconcile(store, fc, &user_metrics, cancel).await
    }

    /// Delete everything the operator created; best effort
    pub async fn cleanup(&self, cancel: &CancellationToken) {
        self.flp.delete_all(self.store.as_ref(), cancel).await;
    }
}

/// Context passed to the controller
pub struct ControllerContext {
    /// Kubernetes client
    pub client: Client,
    pub reconciler: FlowCollectorReconciler,
    /// Metrics recorder (optional)
    pub metrics: Option<ControllerMetrics>,
    /// Per-object error retry counts for exponential backoff
    pub error_counts: dashmap::DashMap<String, u32>,
    /// Cancels in-flight API calls on shutdown
    pub cancel: CancellationToken,
}

/// Metrics for the controller
#[derive(Clone)]
pub struct ControllerMetrics {
    /// Counter for reconciliation attempts
    pub reconciliations: metrics::Counter,
    /// Counter for reconciliation errors
    pub errors: metrics::Counter,
    /// Histogram for reconciliation duration
    pub duration: metrics::Histogram,
}

impl ControllerMetrics {
    /// Create new controller metrics
    pub fn new() -> Self {
        Self {
            reconciliations: metrics::counter!("netobserv_operator_reconciliations_total"),
            errors: metrics::counter!("netobserv_operator_reconciliation_errors_total"),
            duration: metrics::histogram!("netobserv_operator_reconciliation_duration_seconds"),
        }
    }
}

impl Default for ControllerMetrics {
    fn default() -> Self {
        Self::new()
    }
}

fn flow_collector_ref() -> ObjectRef<FlowCollector> {
    ObjectRef::new(FLOW_COLLECTOR_NAME)
}

/// Start the FlowCollector controller
pub async fn run_controller(
    client: Client,
    config: FlpConfig,
    namespace: String,
    cancel: CancellationToken,
) -> Result<()> {
    let store: Arc<dyn ObjectStore> = Arc::new(KubeStore::new(client.clone()));
    let reconciler = FlowCollectorReconciler::new(store, config, &namespace);
    let watcher = reconciler.watcher();

    let ctx = Arc::new(ControllerContext {
        client: client.clone(),
        reconciler,
        metrics: Some(ControllerMetrics::new()),
        error_counts: dashmap::DashMap::new(),
        cancel,
    });

    info!(namespace = %namespace, "Starting FlowCollector controller");

    let secret_watcher = Arc::clone(&watcher);
    let config_map_watcher = watcher;

    Controller::new(Api::<FlowCollector>::all(client.clone()), Config::default())
        .owns(Api::<DaemonSet>::all(client.clone()), Config::default())
        .owns(Api::<Deployment>::all(client.clone()), Config::default())
        .owns(Api::<Service>::all(client.clone()), Config::default())
        .owns(Api::<ConfigMap>::all(client.clone()), Config::default())
        .watches(
            Api::<FlowMetric>::all(client.clone()),
            Config::default(),
            |_| Some(flow_collector_ref()),
        )
        .watches(
            Api::<Secret>::all(client.clone()),
            Config::default(),
            move |secret| {
                let namespace = secret.namespace().unwrap_or_default();
                secret_watcher
                    .is_watched(MountableType::Secret, &namespace, &secret.name_any())
                    .then(flow_collector_ref)
            },
        )
        .watches(
            Api::<ConfigMap>::all(client),
            Config::default(),
            move |cm| {
                let namespace = cm.namespace().unwrap_or_default();
                config_map_watcher
                    .is_watched(MountableType::ConfigMap, &namespace, &cm.name_any())
                    .then(flow_collector_ref)
            },
        )
        .run(reconcile, error_policy, ctx)
        .for_each(|result| async move {
            match result {
                Ok((obj, action)) => {
                    debug!(name = obj.name, ?action, "Reconciliation completed");
                }
                Err(e) => {
                    error!(error = %e, "Reconciliation failed");
                }
            }
        })
        .await;

    Ok(())
}

/// Main reconciliation function
#[instrument(skip(fc, ctx), fields(name = %fc.name_any()))]
async fn reconcile(fc: Arc<FlowCollector>, ctx: Arc<ControllerContext>) -> Result<Action> {
    let start = std::time::Instant::now();

    if let Some(ref metrics) = ctx.metrics {
        metrics.reconciliations.increment(1);
    }

    let name = fc.name_any();
    let api: Api<FlowCollector> = Api::all(ctx.client.clone());

    let result = finalizer(&api, FINALIZER_NAME, fc, |event| async {
        match event {
            FinalizerEvent::Apply(fc) => apply_flow_collector(fc, ctx.clone()).await,
            FinalizerEvent::Cleanup(fc) => cleanup_flow_collector(fc, ctx.clone()).await,
        }
    })
    .await;

    if let Some(ref metrics) = ctx.metrics {
        metrics.duration.record(start.elapsed().as_secs_f64());
    }

    // Reset error backoff counter on success
    if result.is_ok() {
        ctx.error_counts.remove(&name);
    }

    result.map_err(|e| {
        if let Some(ref metrics) = ctx.metrics {
            metrics.errors.increment(1);
        }
        unwrap_finalizer_error(e)
    })
}

/// Hand the reconcile error itself to the error policy, so that its
/// requeue delay applies
fn unwrap_finalizer_error(err: finalizer::Error<OperatorError>) -> OperatorError {
    match err {
        finalizer::Error::ApplyFailed(e) | finalizer::Error::CleanupFailed(e) => e,
        finalizer::Error::AddFinalizer(e) | finalizer::Error::RemoveFinalizer(e) => {
            OperatorError::KubeError(e)
        }
        other => OperatorError::ReconcileFailed(other.to_string()),
    }
}

async fn apply_flow_collector(
    fc: Arc<FlowCollector>,
    ctx: Arc<ControllerContext>,
) -> Result<Action> {
    if fc.name_any() != FLOW_COLLECTOR_NAME {
        warn!(
            name = %fc.name_any(),
            "Only the FlowCollector named '{}' is reconciled", FLOW_COLLECTOR_NAME
        );
        return Ok(Action::await_change());
    }

    info!("Reconciling FlowCollector");
    ctx.reconciler.reconcile(&fc, &ctx.cancel).await?;
    info!("Reconciliation complete");

    Ok(Action::requeue(Duration::from_secs(DEFAULT_REQUEUE_SECONDS)))
}

/// Owner references garbage-collect most objects, but not across
/// namespaces nor for cluster-scoped ones; delete explicitly
async fn cleanup_flow_collector(
    fc: Arc<FlowCollector>,
    ctx: Arc<ControllerContext>,
) -> Result<Action> {
    if fc.name_any() == FLOW_COLLECTOR_NAME {
        info!("Cleaning up FlowCollector resources");
        ctx.reconciler.cleanup(&ctx.cancel).await;
    }
    Ok(Action::await_change())
}

/// Error policy for the controller, with exponential backoff
fn error_policy(
    fc: Arc<FlowCollector>,
    error: &OperatorError,
    ctx: Arc<ControllerContext>,
) -> Action {
    let key = fc.name_any();
    let retries = {
        let mut entry = ctx.error_counts.entry(key.clone()).or_insert(0);
        *entry += 1;
        *entry
    };

    // 30s → 60s → 120s → 240s → 480s → 600s (capped)
    let delay = error.requeue_delay().unwrap_or_else(|| backoff(retries));

    warn!(
        error = %error,
        retry = retries,
        delay_secs = delay.as_secs(),
        "Reconciliation error for '{}', will retry",
        key
    );

    Action::requeue(delay)
}

fn backoff(retries: u32) -> Duration {
    let base = Duration::from_secs(ERROR_REQUEUE_SECONDS);
    let delay = base * 2u32.saturating_pow(retries.saturating_sub(1).min(5));
    delay.min(Duration::from_secs(MAX_ERROR_REQUEUE_SECONDS))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::{
        AgentType, AutoscalerStatus, DeploymentModel, FlowCollectorCondition, FlowCollectorSpec,
        FlowMetricSpec,
    };
    use crate::status::ComponentState;
    use crate::store::memory::{MemoryStore, WriteOp};
    use crate::store::{ObjectKey, ObjectKind};

    fn create_test_flow_collector(model: DeploymentModel) -> FlowCollector {
        let mut spec: FlowCollectorSpec = serde_json::from_str("{}").unwrap();
        spec.deployment_model = model;
        spec.kafka.address = "kafka:9092".to_string();
        spec.kafka.topic = "network-flows".to_string();
        let mut fc = FlowCollector::new(FLOW_COLLECTOR_NAME, spec);
        fc.metadata.uid = Some("fc-uid".to_string());
        fc
    }

    fn create_test_reconciler(model: DeploymentModel) -> (FlowCollectorReconciler, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        store.put_flow_collector(create_test_flow_collector(model));
        let reconciler = FlowCollectorReconciler::new(
            store.clone() as Arc<dyn ObjectStore>,
            FlpConfig::default(),
            "netobserv",
        );
        (reconciler, store)
    }

    /// One pass on the stored FlowCollector, as the controller would run it
    async fn run(reconciler: &FlowCollectorReconciler, store: &MemoryStore) -> Result<()> {
        let fc = store.flow_collector(FLOW_COLLECTOR_NAME).unwrap();
        reconciler.reconcile(&fc, &CancellationToken::new()).await
    }

    fn edit(store: &MemoryStore, f: impl FnOnce(&mut FlowCollectorSpec)) {
        let mut fc = store.flow_collector(FLOW_COLLECTOR_NAME).unwrap();
        f(&mut fc.spec);
        store.put_flow_collector(fc);
    }

    fn conditions(store: &MemoryStore) -> Vec<FlowCollectorCondition> {
        store
            .flow_collector(FLOW_COLLECTOR_NAME)
            .unwrap()
            .status
            .unwrap()
            .conditions
    }

    fn condition(store: &MemoryStore, condition_type: &str) -> FlowCollectorCondition {
        conditions(store)
            .into_iter()
            .find(|c| c.condition_type == condition_type)
            .unwrap()
    }

    fn key(kind: ObjectKind, namespace: &str, name: &str) -> ObjectKey {
        ObjectKey::new(kind, namespace, name)
    }

    #[tokio::test]
    async fn test_direct_to_kafka() {
        let (reconciler, store) = create_test_reconciler(DeploymentModel::Direct);

        run(&reconciler, &store).await.unwrap();
        assert_eq!(condition(&store, "Ready").reason.as_deref(), Some("Pending"));
        run(&reconciler, &store).await.unwrap();
        assert_eq!(condition(&store, "Ready").status, "True");
        assert!(store
            .object(&key(ObjectKind::DaemonSet, "netobserv", "flowlogs-pipeline"))
            .is_some());

        edit(&store, |spec| spec.deployment_model = DeploymentModel::Kafka);
        run(&reconciler, &store).await.unwrap();
        run(&reconciler, &store).await.unwrap();

        assert!(store
            .object(&key(ObjectKind::DaemonSet, "netobserv", "flowlogs-pipeline"))
            .is_none());
        assert!(store
            .object(&key(ObjectKind::ConfigMap, "netobserv", "flowlogs-pipeline-config"))
            .is_none());
        assert!(store
            .object(&key(
                ObjectKind::Deployment,
                "netobserv",
                "flowlogs-pipeline-transformer"
            ))
            .is_some());
        let ready = condition(&store, "Ready");
        assert_eq!(ready.status, "True", "{:?}", ready.message);
        let monolith = condition(&store, "FLPMonolithReady");
        assert_eq!(monolith.status, "Unknown");
        assert_eq!(monolith.reason.as_deref(), Some("ComponentUnused"));
        assert_eq!(reconciler.status().state(Component::Transformer), ComponentState::Ready);
    }

    #[tokio::test]
    async fn test_ipfix_direct_to_kafka_with_autoscaler() {
        let (reconciler, store) = create_test_reconciler(DeploymentModel::Direct);
        edit(&store, |spec| spec.agent.agent_type = AgentType::Ipfix);
        run(&reconciler, &store).await.unwrap();
        run(&reconciler, &store).await.unwrap();
        assert!(store
            .object(&key(ObjectKind::DaemonSet, "netobserv", "flowlogs-pipeline"))
            .is_some());

        edit(&store, |spec| {
            spec.deployment_model = DeploymentModel::Kafka;
            spec.processor.kafka_consumer_autoscaler.status = AutoscalerStatus::Enabled;
        });
        run(&reconciler, &store).await.unwrap();
        run(&reconciler, &store).await.unwrap();

        for gone in [
            key(ObjectKind::DaemonSet, "netobserv", "flowlogs-pipeline"),
            key(ObjectKind::ConfigMap, "netobserv", "flowlogs-pipeline-config"),
            key(ObjectKind::ClusterRoleBinding, "", "flowlogs-pipeline-role"),
        ] {
            assert!(store.object(&gone).is_none(), "{} still exists", gone);
        }
        for created in [
            key(ObjectKind::DaemonSet, "netobserv", "flowlogs-pipeline-ingester"),
            key(ObjectKind::ClusterRoleBinding, "", "flowlogs-pipeline-ingester-role"),
            key(ObjectKind::Deployment, "netobserv", "flowlogs-pipeline-transformer"),
            key(ObjectKind::ClusterRoleBinding, "", "flowlogs-pipeline-transformer-role"),
            key(
                ObjectKind::HorizontalPodAutoscaler,
                "netobserv",
                "flowlogs-pipeline-transformer",
            ),
            key(ObjectKind::ClusterRole, "", "flowlogs-pipeline"),
        ] {
            assert!(store.object(&created).is_some(), "{} missing", created);
        }
        let ingester_config = store
            .object(&key(
                ObjectKind::ConfigMap,
                "netobserv",
                "flowlogs-pipeline-ingester-config",
            ))
            .unwrap();
        assert!(ingester_config.data.to_string().contains("kafka-write"));

        assert_eq!(condition(&store, "FLPIngesterReady").status, "True");
        assert_eq!(condition(&store, "FLPTransformerReady").status, "True");
        let monolith = condition(&store, "FLPMonolithReady");
        assert_eq!(monolith.reason.as_deref(), Some("ComponentUnused"));
        assert_eq!(condition(&store, "Ready").status, "True");
    }

    #[tokio::test]
    async fn test_namespace_change_moves_objects() {
        let (reconciler, store) = create_test_reconciler(DeploymentModel::Direct);
        run(&reconciler, &store).await.unwrap();

        edit(&store, |spec| spec.namespace = "netobserv-b".to_string());
        run(&reconciler, &store).await.unwrap();

        let keys = store.keys();
        assert!(!keys.is_empty());
        assert!(keys
            .iter()
            .all(|k| k.namespace.as_deref().map_or(true, |ns| ns == "netobserv-b")));
        assert!(store
            .object(&key(ObjectKind::DaemonSet, "netobserv-b", "flowlogs-pipeline"))
            .is_some());
        let status = store.flow_collector(FLOW_COLLECTOR_NAME).unwrap().status.unwrap();
        assert_eq!(status.namespace.as_deref(), Some("netobserv-b"));
    }

    #[tokio::test]
    async fn test_loki_change_only_rolls_config_and_workload() {
        let (reconciler, store) = create_test_reconciler(DeploymentModel::Direct);
        run(&reconciler, &store).await.unwrap();
        run(&reconciler, &store).await.unwrap();
        let ds_key = key(ObjectKind::DaemonSet, "netobserv", "flowlogs-pipeline");
        let digest = |store: &MemoryStore| {
            store.object(&ds_key).unwrap().data["spec"]["template"]["metadata"]["annotations"]
                [crate::comparators::CONFIG_DIGEST_ANNOTATION]
                .clone()
        };
        let before = digest(&store);
        store.clear_writes();

        edit(&store, |spec| spec.loki.max_retries += 1);
        run(&reconciler, &store).await.unwrap();

        let cm_key = key(ObjectKind::ConfigMap, "netobserv", "flowlogs-pipeline-config");
        assert_eq!(
            store.writes(),
            vec![(WriteOp::Update, cm_key), (WriteOp::Update, ds_key.clone())]
        );
        assert_ne!(digest(&store), before);
    }

    #[tokio::test]
    async fn test_unchanged_spec_writes_nothing() {
        let (reconciler, store) = create_test_reconciler(DeploymentModel::Kafka);
        run(&reconciler, &store).await.unwrap();
        run(&reconciler, &store).await.unwrap();
        let status_writes = store.status_writes();
        store.clear_writes();

        run(&reconciler, &store).await.unwrap();

        assert!(store.writes().is_empty());
        assert_eq!(store.status_writes(), status_writes);
    }

    #[tokio::test]
    async fn test_invalid_metric_fails_component() {
        let (reconciler, store) = create_test_reconciler(DeploymentModel::Direct);
        let spec: FlowMetricSpec = serde_json::from_value(serde_json::json!({
            "metricName": "my_histo",
            "type": "Histogram",
            "buckets": ["x"],
        }))
        .unwrap();
        let mut metric = FlowMetric::new("my-histo", spec);
        metric.metadata.namespace = Some("netobserv".to_string());
        store.set_flow_metrics(vec![metric]);

        let err = run(&reconciler, &store).await.unwrap_err();
        assert!(err.to_string().contains("my_histo"));

        let ready = condition(&store, "Ready");
        assert_eq!(ready.reason.as_deref(), Some("SomeFailures"));
        let monolith = condition(&store, "FLPMonolithReady");
        assert_eq!(monolith.reason.as_deref(), Some("FLPReconcileError"));
        assert!(monolith.message.unwrap().contains("my_histo"));
    }

    #[tokio::test]
    async fn test_cleanup_deletes_everything() {
        let (reconciler, store) = create_test_reconciler(DeploymentModel::Kafka);
        run(&reconciler, &store).await.unwrap();
        assert!(!store.keys().is_empty());

        reconciler.cleanup(&CancellationToken::new()).await;
        assert!(store.keys().is_empty());
    }

    #[test]
    fn test_finalizer_errors_keep_requeue_delay() {
        let conflict = unwrap_finalizer_error(finalizer::Error::ApplyFailed(OperatorError::Conflict {
            kind: "FlowCollector".to_string(),
            name: FLOW_COLLECTOR_NAME.to_string(),
        }));
        assert!(conflict.is_conflict());
        assert_eq!(conflict.requeue_delay(), Some(Duration::from_secs(1)));

        let invalid = unwrap_finalizer_error(finalizer::Error::CleanupFailed(
            OperatorError::InvalidConfig("bad".to_string()),
        ));
        assert!(matches!(invalid, OperatorError::InvalidConfig(_)));
        assert!(invalid.requeue_delay().is_none());

        let unnamed = unwrap_finalizer_error(finalizer::Error::UnnamedObject);
        assert!(matches!(unnamed, OperatorError::ReconcileFailed(_)));
    }

    #[test]
    fn test_backoff() {
        assert_eq!(backoff(1), Duration::from_secs(30));
        assert_eq!(backoff(2), Duration::from_secs(60));
        assert_eq!(backoff(5), Duration::from_secs(480));
        assert_eq!(backoff(6), Duration::from_secs(600));
        assert_eq!(backoff(20), Duration::from_secs(600));
    }
}
