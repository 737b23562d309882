//! Create-or-update helpers shared by the component reconcilers
//!
//! Each helper compares the desired object with the one found by the last
//! [`ManagedObjects::fetch_all`] and issues at most one write. Write errors
//! abort the pass and are returned to the caller.

use crate::comparators::{self, decide, ChangeDecision, ChangeReport};
use crate::error::Result;
use crate::managed::{Handle, ManagedObjects};
use crate::resources::CONTAINER_NAME;
use crate::status::{Component, StatusManager};
use crate::store::{to_dynamic, ObjectStore};
use k8s_openapi::api::apps::v1::{DaemonSet, Deployment};
use k8s_openapi::api::autoscaling::v2::HorizontalPodAutoscaler;
use k8s_openapi::api::core::v1::{ConfigMap, Service, ServiceAccount};
use k8s_openapi::api::rbac::v1::{ClusterRole, ClusterRoleBinding};
use kube::api::DynamicObject;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Store access for one reconcile pass
#[derive(Clone, Copy)]
pub struct Writer<'a> {
    pub store: &'a dyn ObjectStore,
    pub cancel: &'a CancellationToken,
}

impl<'a> Writer<'a> {
    pub fn new(store: &'a dyn ObjectStore, cancel: &'a CancellationToken) -> Self {
        Self { store, cancel }
    }

    async fn create<K: Serialize>(
        &self,
        managed: &mut ManagedObjects,
        handle: Handle,
        desired: &K,
    ) -> Result<()> {
        let obj = to_dynamic(desired)?;
        info!(object = %managed.key(handle), "Creating object");
        let created = self.store.create(&obj, self.cancel).await?;
        managed.set(handle, Some(created));
        Ok(())
    }

    /// Replace the live object, keeping its resource version
    async fn update<K: Serialize>(
        &self,
        managed: &mut ManagedObjects,
        handle: Handle,
        desired: &K,
    ) -> Result<()> {
        let mut obj = to_dynamic(desired)?;
        obj.metadata.resource_version = managed
            .get(handle)
            .and_then(|live| live.metadata.resource_version.clone());
        info!(object = %managed.key(handle), "Updating object");
        let updated = self.store.update(&obj, self.cancel).await?;
        managed.set(handle, Some(updated));
        Ok(())
    }

    async fn apply<K: Serialize>(
        &self,
        managed: &mut ManagedObjects,
        handle: Handle,
        decision: ChangeDecision,
        desired: &K,
    ) -> Result<ChangeDecision> {
        match decision {
            ChangeDecision::Create => self.create(managed, handle, desired).await?,
            ChangeDecision::Update => self.update(managed, handle, desired).await?,
            ChangeDecision::NoOp => {}
        }
        Ok(decision)
    }

    pub async fn reconcile_config_map(
        &self,
        managed: &mut ManagedObjects,
        handle: Handle,
        desired: &ConfigMap,
        report: &mut ChangeReport,
    ) -> Result<ChangeDecision> {
        let old: Option<ConfigMap> = managed.get_typed(handle)?;
        let decision = decide(old.as_ref(), |old| {
            comparators::config_map_changed(old, desired, report)
        });
        self.apply(managed, handle, decision, desired).await
    }

    /// Created when missing, never updated: only the name is configured
    pub async fn reconcile_service_account(
        &self,
        managed: &mut ManagedObjects,
        handle: Handle,
        desired: &ServiceAccount,
    ) -> Result<ChangeDecision> {
        let decision = if managed.exists(handle) {
            ChangeDecision::NoOp
        } else {
            ChangeDecision::Create
        };
        self.apply(managed, handle, decision, desired).await
    }

    pub async fn reconcile_cluster_role(
        &self,
        managed: &mut ManagedObjects,
        handle: Handle,
        desired: &ClusterRole,
        report: &mut ChangeReport,
    ) -> Result<ChangeDecision> {
        let old: Option<ClusterRole> = managed.get_typed(handle)?;
        let decision = decide(old.as_ref(), |old| {
            report.check("Rules changed", old.rules != desired.rules)
        });
        self.apply(managed, handle, decision, desired).await
    }

    pub async fn reconcile_cluster_role_binding(
        &self,
        managed: &mut ManagedObjects,
        handle: Handle,
        desired: &ClusterRoleBinding,
        report: &mut ChangeReport,
    ) -> Result<ChangeDecision> {
        let old: Option<ClusterRoleBinding> = managed.get_typed(handle)?;
        let decision = decide(old.as_ref(), |old| {
            comparators::role_binding_changed(old, desired, report)
        });
        self.apply(managed, handle, decision, desired).await
    }

    /// Services are updated from the live object so that platform-assigned
    /// fields such as the cluster IP survive
    pub async fn reconcile_service(
        &self,
        managed: &mut ManagedObjects,
        handle: Handle,
        desired: &Service,
        report: &mut ChangeReport,
    ) -> Result<ChangeDecision> {
        let old: Option<Service> = managed.get_typed(handle)?;
        match old {
            None => self.apply(managed, handle, ChangeDecision::Create, desired).await,
            Some(old) if comparators::service_changed(&old, desired, report) => {
                let update = comparators::service_for_update(&old, desired);
                self.apply(managed, handle, ChangeDecision::Update, &update).await
            }
            Some(_) => Ok(ChangeDecision::NoOp),
        }
    }

    /// ServiceMonitor or PrometheusRule
    pub async fn reconcile_monitoring(
        &self,
        managed: &mut ManagedObjects,
        handle: Handle,
        desired: &DynamicObject,
        report: &mut ChangeReport,
    ) -> Result<ChangeDecision> {
        let decision = decide(managed.get(handle), |old| {
            comparators::monitoring_changed(old, desired, report)
        });
        self.apply(managed, handle, decision, desired).await
    }

    pub async fn reconcile_daemon_set(
        &self,
        managed: &mut ManagedObjects,
        handle: Handle,
        desired: &DaemonSet,
        status: &StatusManager,
        component: Component,
        report: &mut ChangeReport,
    ) -> Result<ChangeDecision> {
        let old: Option<DaemonSet> = managed.get_typed(handle)?;
        let Some(old) = old else {
            status.set_creating_daemon_set(
                component,
                desired.metadata.name.as_deref().unwrap_or_default(),
            );
            return self.apply(managed, handle, ChangeDecision::Create, desired).await;
        };
        status.check_daemon_set_progress(component, Some(&old));
        let decision = decide(Some(&old), |old| {
            comparators::daemon_set_changed(old, desired, CONTAINER_NAME, report)
        });
        self.apply(managed, handle, decision, desired).await
    }

    /// With `autoscaled`, the live replica count is kept
    pub async fn reconcile_deployment(
        &self,
        managed: &mut ManagedObjects,
        handle: Handle,
        desired: &Deployment,
        autoscaled: bool,
        status: &StatusManager,
        component: Component,
        report: &mut ChangeReport,
    ) -> Result<ChangeDecision> {
        let old: Option<Deployment> = managed.get_typed(handle)?;
        let Some(old) = old else {
            status.set_creating_deployment(
                component,
                desired.metadata.name.as_deref().unwrap_or_default(),
            );
            return self.apply(managed, handle, ChangeDecision::Create, desired).await;
        };
        status.check_deployment_progress(component, Some(&old));
        let mut desired = desired.clone();
        if autoscaled {
            if let (Some(new_spec), Some(old_spec)) = (desired.spec.as_mut(), old.spec.as_ref()) {
                new_spec.replicas = old_spec.replicas;
            }
        }
        let decision = decide(Some(&old), |old| {
            comparators::deployment_changed(old, &desired, CONTAINER_NAME, autoscaled, report)
        });
        self.apply(managed, handle, decision, &desired).await
    }

    /// Created or updated when enabled, deleted otherwise
    pub async fn reconcile_autoscaler(
        &self,
        managed: &mut ManagedObjects,
        handle: Handle,
        desired: Option<&HorizontalPodAutoscaler>,
        report: &mut ChangeReport,
    ) -> Result<ChangeDecision> {
        let Some(desired) = desired else {
            managed.try_delete(self.store, handle, self.cancel).await;
            return Ok(ChangeDecision::NoOp);
        };
        let old: Option<HorizontalPodAutoscaler> = managed.get_typed(handle)?;
        let decision = decide(old.as_ref(), |old| {
            comparators::autoscaler_changed(old, desired, report)
        });
        self.apply(managed, handle, decision, desired).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::status::ComponentState;
    use crate::store::memory::{MemoryStore, WriteOp};
    use crate::store::ObjectKind;
    use k8s_openapi::api::apps::v1::{DaemonSetSpec, DeploymentSpec};
    use k8s_openapi::api::autoscaling::v2::HorizontalPodAutoscalerSpec;
    use k8s_openapi::api::core::v1::{
        Container, PodSpec, PodTemplateSpec, ServicePort, ServiceSpec,
    };
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
    use std::collections::BTreeMap;

    fn meta(name: &str) -> ObjectMeta {
        ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some("netobserv".to_string()),
            ..Default::default()
        }
    }

    fn create_test_template(image: &str) -> PodTemplateSpec {
        PodTemplateSpec {
            metadata: None,
            spec: Some(PodSpec {
                containers: vec![Container {
                    name: CONTAINER_NAME.to_string(),
                    image: Some(image.to_string()),
                    ..Default::default()
                }],
                ..Default::default()
            }),
        }
    }

    fn create_test_config_map(config: &str) -> ConfigMap {
        ConfigMap {
            metadata: meta("flowlogs-pipeline-config"),
            data: Some(BTreeMap::from([("config.json".to_string(), config.to_string())])),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_config_map_create_noop_update() {
        let store = MemoryStore::new();
        let cancel = CancellationToken::new();
        let writer = Writer::new(&store, &cancel);
        let mut managed = ManagedObjects::new("netobserv");
        let h = managed.register(ObjectKind::ConfigMap, "flowlogs-pipeline-config");
        let mut report = ChangeReport::new("config");

        managed.fetch_all(&store, &cancel).await.unwrap();
        let d = writer
            .reconcile_config_map(&mut managed, h, &create_test_config_map("{}"), &mut report)
            .await
            .unwrap();
        assert_eq!(d, ChangeDecision::Create);

        managed.fetch_all(&store, &cancel).await.unwrap();
        let d = writer
            .reconcile_config_map(&mut managed, h, &create_test_config_map("{}"), &mut report)
            .await
            .unwrap();
        assert_eq!(d, ChangeDecision::NoOp);

        let d = writer
            .reconcile_config_map(&mut managed, h, &create_test_config_map("{\"a\":1}"), &mut report)
            .await
            .unwrap();
        assert_eq!(d, ChangeDecision::Update);
        assert_eq!(report.changes(), &["Data changed".to_string()]);
        assert_eq!(store.writes().len(), 2);
    }

    #[tokio::test]
    async fn test_update_keeps_resource_version() {
        let store = MemoryStore::new();
        let cancel = CancellationToken::new();
        let writer = Writer::new(&store, &cancel);
        let mut managed = ManagedObjects::new("netobserv");
        let h = managed.register(ObjectKind::ConfigMap, "flowlogs-pipeline-config");
        let mut report = ChangeReport::new("config");
        writer
            .reconcile_config_map(&mut managed, h, &create_test_config_map("{}"), &mut report)
            .await
            .unwrap();
        let version = managed.get(h).unwrap().metadata.resource_version.clone();
        assert!(version.is_some());

        writer
            .reconcile_config_map(&mut managed, h, &create_test_config_map("[]"), &mut report)
            .await
            .unwrap();
        assert_ne!(managed.get(h).unwrap().metadata.resource_version, version);
    }

    #[tokio::test]
    async fn test_service_update_keeps_cluster_ip() {
        let store = MemoryStore::new();
        let cancel = CancellationToken::new();
        let writer = Writer::new(&store, &cancel);
        let mut managed = ManagedObjects::new("netobserv");
        let h = managed.register(ObjectKind::Service, "flowlogs-pipeline-prom");
        let svc = |port: i32| Service {
            metadata: meta("flowlogs-pipeline-prom"),
            spec: Some(ServiceSpec {
                ports: Some(vec![ServicePort {
                    port,
                    ..Default::default()
                }]),
                ..Default::default()
            }),
            ..Default::default()
        };
        let mut live = svc(9401);
        live.spec.as_mut().unwrap().cluster_ip = Some("10.0.0.1".to_string());
        store.insert(to_dynamic(&live).unwrap());
        managed.fetch_all(&store, &cancel).await.unwrap();

        let mut report = ChangeReport::new("svc");
        let d = writer
            .reconcile_service(&mut managed, h, &svc(9401), &mut report)
            .await
            .unwrap();
        assert_eq!(d, ChangeDecision::NoOp);

        let d = writer
            .reconcile_service(&mut managed, h, &svc(9402), &mut report)
            .await
            .unwrap();
        assert_eq!(d, ChangeDecision::Update);
        let updated: Service = managed.get_typed(h).unwrap().unwrap();
        let spec = updated.spec.unwrap();
        assert_eq!(spec.cluster_ip.as_deref(), Some("10.0.0.1"));
        assert_eq!(spec.ports.unwrap()[0].port, 9402);
    }

    #[tokio::test]
    async fn test_daemon_set_sets_status() {
        let store = MemoryStore::new();
        let cancel = CancellationToken::new();
        let writer = Writer::new(&store, &cancel);
        let status = StatusManager::new();
        let mut managed = ManagedObjects::new("netobserv");
        let h = managed.register(ObjectKind::DaemonSet, "flowlogs-pipeline");
        let ds = |image: &str| DaemonSet {
            metadata: meta("flowlogs-pipeline"),
            spec: Some(DaemonSetSpec {
                template: create_test_template(image),
                ..Default::default()
            }),
            ..Default::default()
        };
        let mut report = ChangeReport::new("ds");

        writer
            .reconcile_daemon_set(&mut managed, h, &ds("v1"), &status, Component::Monolith, &mut report)
            .await
            .unwrap();
        let s = status.status(Component::Monolith).unwrap();
        assert_eq!(s.reason.as_deref(), Some("CreatingDaemonSet"));

        managed.fetch_all(&store, &cancel).await.unwrap();
        let d = writer
            .reconcile_daemon_set(&mut managed, h, &ds("v1"), &status, Component::Monolith, &mut report)
            .await
            .unwrap();
        assert_eq!(d, ChangeDecision::NoOp);
        assert_eq!(status.state(Component::Monolith), ComponentState::Ready);

        let d = writer
            .reconcile_daemon_set(&mut managed, h, &ds("v2"), &status, Component::Monolith, &mut report)
            .await
            .unwrap();
        assert_eq!(d, ChangeDecision::Update);
        assert!(report.to_string().contains("Image changed"));
    }

    #[tokio::test]
    async fn test_autoscaled_deployment_keeps_replicas() {
        let store = MemoryStore::new();
        let cancel = CancellationToken::new();
        let writer = Writer::new(&store, &cancel);
        let status = StatusManager::new();
        let mut managed = ManagedObjects::new("netobserv");
        let h = managed.register(ObjectKind::Deployment, "flowlogs-pipeline-transformer");
        let deployment = |replicas: i32| Deployment {
            metadata: meta("flowlogs-pipeline-transformer"),
            spec: Some(DeploymentSpec {
                replicas: Some(replicas),
                template: create_test_template("v1"),
                ..Default::default()
            }),
            ..Default::default()
        };
        store.insert(to_dynamic(&deployment(7)).unwrap());
        managed.fetch_all(&store, &cancel).await.unwrap();

        let mut report = ChangeReport::new("deployment");
        let d = writer
            .reconcile_deployment(
                &mut managed,
                h,
                &deployment(3),
                true,
                &status,
                Component::Transformer,
                &mut report,
            )
            .await
            .unwrap();
        assert_eq!(d, ChangeDecision::NoOp);

        let d = writer
            .reconcile_deployment(
                &mut managed,
                h,
                &deployment(3),
                false,
                &status,
                Component::Transformer,
                &mut report,
            )
            .await
            .unwrap();
        assert_eq!(d, ChangeDecision::Update);
    }

    #[tokio::test]
    async fn test_autoscaler_deleted_when_disabled() {
        let store = MemoryStore::new();
        let cancel = CancellationToken::new();
        let writer = Writer::new(&store, &cancel);
        let mut managed = ManagedObjects::new("netobserv");
        let h = managed.register(ObjectKind::HorizontalPodAutoscaler, "flowlogs-pipeline-transformer");
        let hpa = HorizontalPodAutoscaler {
            metadata: meta("flowlogs-pipeline-transformer"),
            spec: Some(HorizontalPodAutoscalerSpec {
                max_replicas: 3,
                ..Default::default()
            }),
            ..Default::default()
        };
        let mut report = ChangeReport::new("hpa");
        writer
            .reconcile_autoscaler(&mut managed, h, Some(&hpa), &mut report)
            .await
            .unwrap();
        assert!(managed.exists(h));

        writer
            .reconcile_autoscaler(&mut managed, h, None, &mut report)
            .await
            .unwrap();
        assert!(!managed.exists(h));
        assert_eq!(store.writes().last().unwrap().0, WriteOp::Delete);
    }
}
