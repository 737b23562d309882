//! flowlogs-pipeline reconcilers
//!
//! One [`ComponentReconciler`] per [`Topology`], each owning the registry of
//! its objects. [`FlpReconciler`] runs them concurrently and manages the
//! ClusterRole they share.
//!
//! Per component, objects are written in dependency order: configuration,
//! permissions, services and monitoring, watched certificates, workload,
//! then autoscaler. The first failed write aborts the component's pass.

use crate::comparators::ChangeReport;
use crate::crd::{
    ClientTls, ExporterType, FlowCollector, FlowCollectorSpec, FlowMetricSpec, KafkaSpec,
    SaslType, ServerTlsType,
};
use crate::error::{OperatorError, Result};
use crate::managed::{Handle, ManagedObjects};
use crate::reconcilers::Writer;
use crate::resources::{build_cluster_role, ResourceBuilder};
use crate::status::{Component, StatusManager};
use crate::store::{ObjectKind, ObjectStore};
use crate::topology::{Topology, WorkloadKind, FLP_NAME};
use crate::watcher::{self, Watcher};
use futures::future::join_all;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument};

/// Reason reported on a component whose pass failed
pub const RECONCILE_ERROR_REASON: &str = "FLPReconcileError";

/// Settings that do not come from the FlowCollector
#[derive(Debug, Clone)]
pub struct FlpConfig {
    /// flowlogs-pipeline image
    pub image: String,
    /// Cluster identifier added to flows in multi-cluster deployments
    pub cluster_id: Option<String>,
    /// Whether ServiceMonitor and PrometheusRule are managed
    pub monitoring: bool,
}

impl Default for FlpConfig {
    fn default() -> Self {
        Self {
            image: "quay.io/netobserv/flowlogs-pipeline:main".to_string(),
            cluster_id: None,
            monitoring: true,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Handles {
    config_map: Handle,
    service_account: Handle,
    cluster_role_binding: Handle,
    prom_service: Handle,
    service_monitor: Handle,
    prometheus_rule: Handle,
    workload: Option<Handle>,
    autoscaler: Option<Handle>,
}

/// Reconciler of one topology
pub struct ComponentReconciler {
    topology: Topology,
    managed: ManagedObjects,
    handles: Handles,
    config: Arc<FlpConfig>,
    status: Arc<StatusManager>,
    watcher: Arc<Watcher>,
}

impl ComponentReconciler {
    pub fn new(
        topology: Topology,
        namespace: &str,
        config: Arc<FlpConfig>,
        status: Arc<StatusManager>,
        watcher: Arc<Watcher>,
    ) -> Self {
        let mut managed = ManagedObjects::new(topology.namespace_in(namespace));
        let app = topology.app_name();
        let workload = topology.workload_kind().map(|kind| match kind {
            WorkloadKind::DaemonSet => managed.register(ObjectKind::DaemonSet, app),
            WorkloadKind::Deployment => managed.register(ObjectKind::Deployment, app),
        });
        let handles = Handles {
            config_map: managed.register(ObjectKind::ConfigMap, topology.config_map_name()),
            service_account: managed
                .register(ObjectKind::ServiceAccount, topology.service_account_name()),
            cluster_role_binding: managed.register(
                ObjectKind::ClusterRoleBinding,
                topology.cluster_role_binding_name(),
            ),
            prom_service: managed.register(ObjectKind::Service, topology.prom_service_name()),
            service_monitor: managed
                .register(ObjectKind::ServiceMonitor, topology.service_monitor_name()),
            prometheus_rule: managed
                .register(ObjectKind::PrometheusRule, topology.prometheus_rule_name()),
            workload,
            autoscaler: (topology == Topology::KafkaTransformer)
                .then(|| managed.register(ObjectKind::HorizontalPodAutoscaler, app)),
        };
        Self {
            topology,
            managed,
            handles,
            config,
            status,
            watcher,
        }
    }

    pub fn component(&self) -> Component {
        self.topology.component()
    }

    /// Delete what this component left in a previous operator namespace
    pub async fn cleanup_namespace(
        &self,
        store: &dyn ObjectStore,
        previous: &str,
        cancel: &CancellationToken,
    ) {
        let namespace = self.topology.namespace_in(previous);
        self.managed
            .cleanup_namespace(store, &namespace, cancel)
            .await;
    }

    /// Delete every object of the component from its current namespace
    pub async fn delete_all(&mut self, store: &dyn ObjectStore, cancel: &CancellationToken) {
        if let Err(e) = self.managed.fetch_all(store, cancel).await {
            debug!(topology = %self.topology, error = %e, "Fetch before deletion failed");
        }
        self.managed.try_delete_all(store, cancel).await;
    }

    #[instrument(skip_all, fields(topology = %self.topology))]
    pub async fn reconcile(
        &mut self,
        store: &dyn ObjectStore,
        fc: &FlowCollector,
        user_metrics: &[FlowMetricSpec],
        cancel: &CancellationToken,
    ) -> Result<()> {
        let spec = &fc.spec;
        let component = self.component();
        self.managed.set_namespace(&self.topology.namespace(spec));
        self.managed.fetch_all(store, cancel).await?;

        if !self.topology.is_active(spec) {
            self.status
                .set_unused(component, self.topology.unused_message());
            self.managed.try_delete_all(store, cancel).await;
            return Ok(());
        }

        // Overridden below when a workload is pending or a write fails
        self.status.set_ready(component);

        let config = Arc::clone(&self.config);
        let builder = ResourceBuilder::new(
            fc,
            self.topology,
            &config.image,
            user_metrics,
            config.cluster_id.as_deref(),
        )?;
        let writer = Writer::new(store, cancel);
        let h = self.handles;

        let mut report = ChangeReport::new(format!("{} config", self.topology.app_name()));
        writer
            .reconcile_config_map(&mut self.managed, h.config_map, &builder.build_config_map(), &mut report)
            .await?;
        report.log();

        let Some(workload_kind) = self.topology.workload_kind() else {
            // The agent runs the pipeline and picks up the ConfigMap
            return Ok(());
        };

        self.reconcile_permissions(&writer, &builder).await?;
        self.reconcile_monitoring(&writer, &builder).await?;

        let watched = self
            .watched_annotations(store, spec, builder.namespace(), cancel)
            .await?;
        let annotations = builder.pod_annotations(&watched);

        let mut report = ChangeReport::new(format!("{} workload", self.topology.app_name()));
        if let Some(handle) = h.workload {
            match workload_kind {
                WorkloadKind::DaemonSet => {
                    writer
                        .reconcile_daemon_set(
                            &mut self.managed,
                            handle,
                            &builder.build_daemon_set(&annotations),
                            &self.status,
                            component,
                            &mut report,
                        )
                        .await?;
                }
                WorkloadKind::Deployment => {
                    writer
                        .reconcile_deployment(
                            &mut self.managed,
                            handle,
                            &builder.build_deployment(&annotations),
                            spec.autoscaler_enabled(),
                            &self.status,
                            component,
                            &mut report,
                        )
                        .await?;
                }
            }
        }
        report.log();

        if let Some(handle) = h.autoscaler {
            let mut report = ChangeReport::new(format!("{} autoscaler", self.topology.app_name()));
            let hpa = spec.autoscaler_enabled().then(|| builder.build_autoscaler());
            writer
                .reconcile_autoscaler(&mut self.managed, handle, hpa.as_ref(), &mut report)
                .await?;
            report.log();
        }

        Ok(())
    }

    async fn reconcile_permissions(
        &mut self,
        writer: &Writer<'_>,
        builder: &ResourceBuilder<'_>,
    ) -> Result<()> {
        let mut report = ChangeReport::new(format!("{} permissions", self.topology.app_name()));
        writer
            .reconcile_service_account(
                &mut self.managed,
                self.handles.service_account,
                &builder.build_service_account(),
            )
            .await?;
        writer
            .reconcile_cluster_role_binding(
                &mut self.managed,
                self.handles.cluster_role_binding,
                &builder.build_cluster_role_binding(),
                &mut report,
            )
            .await?;
        report.log();
        Ok(())
    }

    async fn reconcile_monitoring(
        &mut self,
        writer: &Writer<'_>,
        builder: &ResourceBuilder<'_>,
    ) -> Result<()> {
        let mut report = ChangeReport::new(format!("{} prometheus service", self.topology.app_name()));
        writer
            .reconcile_service(
                &mut self.managed,
                self.handles.prom_service,
                &builder.build_prom_service(),
                &mut report,
            )
            .await?;
        if self.config.monitoring {
            writer
                .reconcile_monitoring(
                    &mut self.managed,
                    self.handles.service_monitor,
                    &builder.build_service_monitor(),
                    &mut report,
                )
                .await?;
            match builder.build_prometheus_rule() {
                Some(rule) => {
                    writer
                        .reconcile_monitoring(
                            &mut self.managed,
                            self.handles.prometheus_rule,
                            &rule,
                            &mut report,
                        )
                        .await?;
                }
                None => {
                    self.managed
                        .try_delete(writer.store, self.handles.prometheus_rule, writer.cancel)
                        .await;
                }
            }
        }
        report.log();
        Ok(())
    }

    /// Resolve the certificates mounted by the pipeline pods; the digests
    /// roll the pods when a certificate changes
    async fn watched_annotations(
        &self,
        store: &dyn ObjectStore,
        spec: &FlowCollectorSpec,
        namespace: &str,
        cancel: &CancellationToken,
    ) -> Result<BTreeMap<String, String>> {
        let mut annotations = BTreeMap::new();
        if spec.uses_kafka() && self.topology != Topology::Monolith {
            self.annotate_kafka_certs(store, &spec.kafka, "kafka", namespace, cancel, &mut annotations)
                .await?;
        }
        if !self.topology.processes_flows() {
            return Ok(annotations);
        }
        if spec.loki_enabled() {
            // Loki certificates are reloaded by the pipeline, no restart needed
            self.watch_ca(store, &spec.loki.tls, namespace, cancel).await?;
        }
        for (i, exporter) in spec.exporters.iter().enumerate() {
            if exporter.exporter_type == ExporterType::Kafka {
                let prefix = format!("kafka-export-{}", i);
                self.annotate_kafka_certs(store, &exporter.kafka, &prefix, namespace, cancel, &mut annotations)
                    .await?;
            }
        }
        let server_tls = &spec.processor.metrics.server.tls;
        if server_tls.tls_type == ServerTlsType::Provided {
            let cert = server_tls.provided.as_ref().ok_or_else(|| {
                OperatorError::InvalidConfig(
                    "processor metrics TLS is Provided but no certificate is set".to_string(),
                )
            })?;
            self.watcher
                .process_cert_ref(store, cert, namespace, cancel)
                .await?;
        }
        Ok(annotations)
    }

    async fn watch_ca(
        &self,
        store: &dyn ObjectStore,
        tls: &ClientTls,
        namespace: &str,
        cancel: &CancellationToken,
    ) -> Result<()> {
        self.watcher
            .process_ca_cert(store, tls, namespace, cancel)
            .await
            .map(|_| ())
    }

    async fn annotate_kafka_certs(
        &self,
        store: &dyn ObjectStore,
        kafka: &KafkaSpec,
        prefix: &str,
        namespace: &str,
        cancel: &CancellationToken,
        annotations: &mut BTreeMap<String, String>,
    ) -> Result<()> {
        let (ca, user) = self
            .watcher
            .process_mtls_certs(store, &kafka.tls, namespace, cancel)
            .await?;
        if let Some(ca) = ca {
            annotations.insert(watcher::annotation(&format!("{}-ca", prefix)), ca);
        }
        if let Some(user) = user {
            annotations.insert(watcher::annotation(&format!("{}-user", prefix)), user);
        }
        if kafka.sasl.sasl_type != SaslType::Disabled {
            let (id, secret) = self
                .watcher
                .process_sasl(store, &kafka.sasl, namespace, cancel)
                .await?;
            annotations.insert(watcher::annotation(&format!("{}-sd1", prefix)), id);
            annotations.insert(watcher::annotation(&format!("{}-sd2", prefix)), secret);
        }
        Ok(())
    }
}

/// Runs every topology and owns the shared ClusterRole
pub struct FlpReconciler {
    components: Vec<Mutex<ComponentReconciler>>,
    shared: Mutex<(ManagedObjects, Handle)>,
    status: Arc<StatusManager>,
}

impl FlpReconciler {
    pub fn new(
        config: FlpConfig,
        namespace: &str,
        status: Arc<StatusManager>,
        watcher: Arc<Watcher>,
    ) -> Self {
        let config = Arc::new(config);
        let components = Topology::ALL
            .into_iter()
            .map(|topology| {
                Mutex::new(ComponentReconciler::new(
                    topology,
                    namespace,
                    Arc::clone(&config),
                    Arc::clone(&status),
                    Arc::clone(&watcher),
                ))
            })
            .collect();
        let mut shared = ManagedObjects::new(namespace);
        let role = shared.register(ObjectKind::ClusterRole, FLP_NAME);
        Self {
            components,
            shared: Mutex::new((shared, role)),
            status,
        }
    }

    /// Reconcile every topology
    ///
    /// Failed components are reported in the status; the first error is
    /// returned once all components ran.
    pub async fn reconcile(
        &self,
        store: &dyn ObjectStore,
        fc: &FlowCollector,
        user_metrics: &[FlowMetricSpec],
        cancel: &CancellationToken,
    ) -> Result<()> {
        self.reconcile_cluster_role(store, fc, cancel).await?;

        let results = join_all(self.components.iter().map(|component| async move {
            let mut component = component.lock().await;
            let result = component.reconcile(store, fc, user_metrics, cancel).await;
            if let Err(e) = &result {
                self.status
                    .set_failure(component.component(), RECONCILE_ERROR_REASON, e.to_string());
            }
            result
        }))
        .await;
        results.into_iter().collect::<Result<Vec<()>>>().map(|_| ())
    }

    async fn reconcile_cluster_role(
        &self,
        store: &dyn ObjectStore,
        fc: &FlowCollector,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let mut guard = self.shared.lock().await;
        let (managed, role) = &mut *guard;
        managed.fetch_all(store, cancel).await?;
        let needed = Topology::active(&fc.spec)
            .iter()
            .any(|t| t.workload_kind().is_some());
        if !needed {
            managed.try_delete(store, *role, cancel).await;
            return Ok(());
        }
        let mut report = ChangeReport::new("flowlogs-pipeline cluster role");
        Writer::new(store, cancel)
            .reconcile_cluster_role(managed, *role, &build_cluster_role(fc), &mut report)
            .await?;
        report.log();
        Ok(())
    }

    /// Remove the namespaced objects left in `previous`
    pub async fn cleanup_namespace(
        &self,
        store: &dyn ObjectStore,
        previous: &str,
        cancel: &CancellationToken,
    ) {
        info!(namespace = %previous, "Cleaning up previous namespace");
        for component in &self.components {
            component
                .lock()
                .await
                .cleanup_namespace(store, previous, cancel)
                .await;
        }
    }

    /// Delete everything the reconcilers created
    pub async fn delete_all(&self, store: &dyn ObjectStore, cancel: &CancellationToken) {
        for component in &self.components {
            component.lock().await.delete_all(store, cancel).await;
        }
        let mut guard = self.shared.lock().await;
        let (managed, role) = &mut *guard;
        if managed.fetch_all(store, cancel).await.is_ok() {
            managed.try_delete(store, *role, cancel).await;
        }
    }
}
