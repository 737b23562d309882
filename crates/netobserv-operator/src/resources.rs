//! Kubernetes Resource Builders
//!
//! This module generates the manifests of one flowlogs-pipeline topology
//! (workload, ConfigMap, Services, RBAC, autoscaler, monitoring) from a
//! FlowCollector and its compiled pipeline.

use crate::comparators::{digest, CONFIG_DIGEST_ANNOTATION};
use crate::crd::{FlowCollector, FlowCollectorSpec, FlowMetricSpec, ProcessorAlert, ServerTlsType};
use crate::error::{OperatorError, Result};
use crate::pipeline::{self, CompiledPipeline, PipelineContext};
use crate::store::ObjectKind;
use crate::topology::{Topology, FLP_NAME};
use k8s_openapi::api::apps::v1::{DaemonSet, DaemonSetSpec, Deployment, DeploymentSpec};
use k8s_openapi::api::autoscaling::v2::{
    CrossVersionObjectReference, HorizontalPodAutoscaler, HorizontalPodAutoscalerSpec,
};
use k8s_openapi::api::core::v1::{
    Capabilities, ConfigMap, ConfigMapVolumeSource, Container, ContainerPort, EnvVar,
    HTTPGetAction, PodSpec, PodTemplateSpec, Probe, SecurityContext, Service, ServiceAccount,
    ServicePort, ServiceSpec, Volume, VolumeMount,
};
use k8s_openapi::api::rbac::v1::{ClusterRole, ClusterRoleBinding, PolicyRule, RoleRef, Subject};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta, OwnerReference};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::api::DynamicObject;
use kube::Resource;
use serde_json::json;
use std::collections::BTreeMap;

pub const CONTAINER_NAME: &str = FLP_NAME;
pub const CONFIG_VOLUME: &str = "config-volume";
pub const CONFIG_PATH: &str = "/etc/flowlogs-pipeline";
pub const CONFIG_FILE: &str = "config.json";
/// ConfigMap key read by the eBPF agent for the embedded pipeline
pub const IN_PROCESS_CONFIG_KEY: &str = "FLP_CONFIG";

const FLOWS_PORT_NAME: &str = "flp";
const HEALTH_PORT_NAME: &str = "health";
const PROMETHEUS_PORT_NAME: &str = "prometheus";
const PROFILE_PORT_NAME: &str = "pprof";
const HEALTH_TIMEOUT_SECONDS: i32 = 5;
const LIVENESS_PERIOD_SECONDS: i32 = 10;
const STARTUP_PERIOD_SECONDS: i32 = 10;
const STARTUP_FAILURE_THRESHOLD: i32 = 5;
const SERVING_CERT_ANNOTATION: &str = "service.beta.openshift.io/serving-cert-secret-name";

/// Builder for the objects of one topology
pub struct ResourceBuilder<'a> {
    fc: &'a FlowCollector,
    topology: Topology,
    namespace: String,
    image: &'a str,
    pipeline: CompiledPipeline,
    config: String,
}

impl<'a> ResourceBuilder<'a> {
    /// Compile the pipeline and prepare the builder
    pub fn new(
        fc: &'a FlowCollector,
        topology: Topology,
        image: &'a str,
        user_metrics: &[FlowMetricSpec],
        cluster_id: Option<&str>,
    ) -> Result<Self> {
        if fc.metadata.name.is_none() {
            return Err(OperatorError::InvalidConfig(
                "FlowCollector name is required".to_string(),
            ));
        }
        let ctx = PipelineContext {
            topology,
            cluster_id,
        };
        let pipeline = pipeline::compile(&fc.spec, &ctx, user_metrics)?;
        let config = pipeline.config_json(&fc.spec)?;
        Ok(Self {
            fc,
            topology,
            namespace: topology.namespace(&fc.spec),
            image,
            pipeline,
            config,
        })
    }

    fn spec(&self) -> &FlowCollectorSpec {
        &self.fc.spec
    }

    fn app(&self) -> &'static str {
        self.topology.app_name()
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn pipeline(&self) -> &CompiledPipeline {
        &self.pipeline
    }

    /// Digest of the generated configuration, rolled into the pod template
    pub fn config_digest(&self) -> String {
        digest(self.config.as_bytes())
    }

    fn metadata(&self, name: impl Into<String>, namespaced: bool) -> ObjectMeta {
        ObjectMeta {
            name: Some(name.into()),
            namespace: namespaced.then(|| self.namespace.clone()),
            labels: Some(self.spec().get_labels(self.app())),
            owner_references: Some(vec![owner_reference(self.fc)]),
            ..Default::default()
        }
    }

    /// ConfigMap holding the configuration document
    pub fn build_config_map(&self) -> ConfigMap {
        let key = match self.topology {
            Topology::InProcess => IN_PROCESS_CONFIG_KEY,
            _ => CONFIG_FILE,
        };
        ConfigMap {
            metadata: self.metadata(self.topology.config_map_name(), true),
            data: Some(BTreeMap::from([(key.to_string(), self.config.clone())])),
            ..Default::default()
        }
    }

    /// Pod template; `annotations` carries the config and watched digests
    pub fn build_pod_template(&self, annotations: &BTreeMap<String, String>) -> PodTemplateSpec {
        let spec = self.spec();
        let processor = &spec.processor;
        let host_network = self.topology.ingests_from_agents();

        let mut ports = Vec::new();
        if self.topology.ingests_from_agents() {
            ports.push(ContainerPort {
                name: Some(FLOWS_PORT_NAME.to_string()),
                container_port: processor.port,
                host_port: Some(processor.port),
                protocol: Some("TCP".to_string()),
                ..Default::default()
            });
        }
        ports.push(ContainerPort {
            name: Some(HEALTH_PORT_NAME.to_string()),
            container_port: processor.health_port,
            ..Default::default()
        });
        ports.push(ContainerPort {
            name: Some(PROMETHEUS_PORT_NAME.to_string()),
            container_port: processor.metrics.server.port,
            ..Default::default()
        });
        if let Some(port) = processor.profile_port {
            ports.push(ContainerPort {
                name: Some(PROFILE_PORT_NAME.to_string()),
                container_port: port,
                protocol: Some("TCP".to_string()),
                ..Default::default()
            });
        }

        let mut volumes = vec![Volume {
            name: CONFIG_VOLUME.to_string(),
            config_map: Some(ConfigMapVolumeSource {
                name: self.topology.config_map_name(),
                ..Default::default()
            }),
            ..Default::default()
        }];
        volumes.extend(self.pipeline.volumes.volumes());
        let mut mounts = vec![VolumeMount {
            name: CONFIG_VOLUME.to_string(),
            mount_path: CONFIG_PATH.to_string(),
            ..Default::default()
        }];
        mounts.extend(self.pipeline.volumes.mounts());

        // BTreeMap iteration keeps the env order stable
        let mut env: Vec<EnvVar> = processor
            .env
            .iter()
            .map(|(name, value)| EnvVar {
                name: name.clone(),
                value: Some(value.clone()),
                ..Default::default()
            })
            .collect();
        env.push(EnvVar {
            name: "GODEBUG".to_string(),
            value: Some("http2server=0".to_string()),
            ..Default::default()
        });

        let probe = |path: &str, period: i32, failure_threshold: Option<i32>| Probe {
            http_get: Some(HTTPGetAction {
                path: Some(path.to_string()),
                port: IntOrString::String(HEALTH_PORT_NAME.to_string()),
                ..Default::default()
            }),
            timeout_seconds: Some(HEALTH_TIMEOUT_SECONDS),
            period_seconds: Some(period),
            failure_threshold,
            ..Default::default()
        };
        let (liveness_probe, startup_probe) = if processor.enable_kube_probes {
            (
                Some(probe("/live", LIVENESS_PERIOD_SECONDS, None)),
                Some(probe(
                    "/ready",
                    STARTUP_PERIOD_SECONDS,
                    Some(STARTUP_FAILURE_THRESHOLD),
                )),
            )
        } else {
            (None, None)
        };

        let container = Container {
            name: CONTAINER_NAME.to_string(),
            image: Some(self.image.to_string()),
            image_pull_policy: Some(processor.image_pull_policy.clone()),
            args: Some(vec![format!("--config={}/{}", CONFIG_PATH, CONFIG_FILE)]),
            resources: processor.resources.clone(),
            volume_mounts: Some(mounts),
            ports: Some(ports),
            env: Some(env),
            liveness_probe,
            startup_probe,
            security_context: Some(SecurityContext {
                allow_privilege_escalation: Some(false),
                read_only_root_filesystem: Some(true),
                run_as_non_root: Some(true),
                capabilities: Some(Capabilities {
                    drop: Some(vec!["ALL".to_string()]),
                    ..Default::default()
                }),
                ..Default::default()
            }),
            ..Default::default()
        };

        let mut pod_annotations = annotations.clone();
        pod_annotations.insert("prometheus.io/scrape".to_string(), "true".to_string());
        pod_annotations.insert(
            "prometheus.io/scrape_port".to_string(),
            processor.metrics.server.port.to_string(),
        );

        PodTemplateSpec {
            metadata: Some(ObjectMeta {
                labels: Some(spec.get_labels(self.app())),
                annotations: Some(pod_annotations),
                ..Default::default()
            }),
            spec: Some(PodSpec {
                containers: vec![container],
                volumes: Some(volumes),
                service_account_name: Some(self.topology.service_account_name().to_string()),
                host_network: Some(host_network),
                dns_policy: Some(
                    if host_network {
                        "ClusterFirstWithHostNet"
                    } else {
                        "ClusterFirst"
                    }
                    .to_string(),
                ),
                ..Default::default()
            }),
        }
    }

    /// Annotations of the pod template: config digest plus watched digests
    pub fn pod_annotations(&self, watched: &BTreeMap<String, String>) -> BTreeMap<String, String> {
        let mut annotations = watched.clone();
        annotations.insert(CONFIG_DIGEST_ANNOTATION.to_string(), self.config_digest());
        annotations
    }

    pub fn build_daemon_set(&self, annotations: &BTreeMap<String, String>) -> DaemonSet {
        DaemonSet {
            metadata: self.metadata(self.app(), true),
            spec: Some(DaemonSetSpec {
                selector: self.selector(),
                template: self.build_pod_template(annotations),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    pub fn build_deployment(&self, annotations: &BTreeMap<String, String>) -> Deployment {
        Deployment {
            metadata: self.metadata(self.app(), true),
            spec: Some(DeploymentSpec {
                replicas: Some(self.spec().processor.kafka_consumer_replicas),
                selector: self.selector(),
                template: self.build_pod_template(annotations),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn selector(&self) -> LabelSelector {
        LabelSelector {
            match_labels: Some(self.spec().get_selector_labels(self.app())),
            ..Default::default()
        }
    }

    /// Service exposing the metrics endpoint
    pub fn build_prom_service(&self) -> Service {
        let port = self.spec().processor.metrics.server.port;
        let mut metadata = self.metadata(self.topology.prom_service_name(), true);
        if self.spec().processor.metrics.server.tls.tls_type == ServerTlsType::Auto {
            metadata.annotations = Some(BTreeMap::from([(
                SERVING_CERT_ANNOTATION.to_string(),
                self.topology.prom_tls_secret_name(),
            )]));
        }
        Service {
            metadata,
            spec: Some(ServiceSpec {
                selector: Some(self.spec().get_selector_labels(self.app())),
                ports: Some(vec![ServicePort {
                    name: Some(PROMETHEUS_PORT_NAME.to_string()),
                    port,
                    protocol: Some("TCP".to_string()),
                    // Set explicitly so the live object compares equal
                    target_port: Some(IntOrString::Int(port)),
                    ..Default::default()
                }]),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    pub fn build_service_account(&self) -> ServiceAccount {
        ServiceAccount {
            metadata: self.metadata(self.topology.service_account_name(), true),
            ..Default::default()
        }
    }

    pub fn build_cluster_role_binding(&self) -> ClusterRoleBinding {
        ClusterRoleBinding {
            metadata: self.metadata(self.topology.cluster_role_binding_name(), false),
            role_ref: RoleRef {
                api_group: "rbac.authorization.k8s.io".to_string(),
                kind: "ClusterRole".to_string(),
                name: self.topology.cluster_role_name().to_string(),
            },
            subjects: Some(vec![Subject {
                kind: "ServiceAccount".to_string(),
                name: self.topology.service_account_name().to_string(),
                namespace: Some(self.namespace.clone()),
                ..Default::default()
            }]),
        }
    }

    /// Autoscaler of the Kafka consumers
    pub fn build_autoscaler(&self) -> HorizontalPodAutoscaler {
        let autoscaler = &self.spec().processor.kafka_consumer_autoscaler;
        HorizontalPodAutoscaler {
            metadata: self.metadata(self.app(), true),
            spec: Some(HorizontalPodAutoscalerSpec {
                scale_target_ref: CrossVersionObjectReference {
                    api_version: Some("apps/v1".to_string()),
                    kind: "Deployment".to_string(),
                    name: self.app().to_string(),
                },
                min_replicas: autoscaler.min_replicas,
                max_replicas: autoscaler.max_replicas,
                metrics: (!autoscaler.metrics.is_empty()).then(|| autoscaler.metrics.clone()),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn dynamic(&self, kind: ObjectKind, name: String, spec: serde_json::Value) -> DynamicObject {
        let mut obj = DynamicObject::new(&name, &kind.api_resource()).data(json!({ "spec": spec }));
        obj.metadata = self.metadata(name, true);
        obj
    }

    pub fn build_service_monitor(&self) -> DynamicObject {
        let tls = &self.spec().processor.metrics.server.tls;
        let service = self.topology.prom_service_name();
        let mut endpoint = json!({
            "port": PROMETHEUS_PORT_NAME,
            "interval": "15s",
            "scheme": "http",
            "honorLabels": true,
        });
        if tls.tls_type != ServerTlsType::Disabled {
            endpoint["scheme"] = json!("https");
            endpoint["tlsConfig"] = json!({
                "serverName": format!("{}.{}.svc", service, self.namespace),
                "insecureSkipVerify": tls.insecure_skip_verify,
            });
        }
        self.dynamic(
            ObjectKind::ServiceMonitor,
            self.topology.service_monitor_name(),
            json!({
                "endpoints": [endpoint],
                "namespaceSelector": { "matchNames": [self.namespace] },
                "selector": { "matchLabels": self.spec().get_selector_labels(self.app()) },
            }),
        )
    }

    /// PrometheusRule with the enabled alerts; `None` when all are disabled
    pub fn build_prometheus_rule(&self) -> Option<DynamicObject> {
        let rules: Vec<_> = [ProcessorAlert::NetObservNoFlows, ProcessorAlert::NetObservLokiError]
            .into_iter()
            .filter(|a| self.spec().alert_enabled(*a))
            .filter(|a| *a != ProcessorAlert::NetObservLokiError || self.spec().loki_enabled())
            .map(alert_rule)
            .collect();
        if rules.is_empty() {
            return None;
        }
        Some(self.dynamic(
            ObjectKind::PrometheusRule,
            self.topology.prometheus_rule_name(),
            json!({
                "groups": [{ "name": "NetObservFlowLogsPipeline", "rules": rules }],
            }),
        ))
    }
}

/// Owner reference on the FlowCollector; garbage collection removes the
/// objects with it
pub fn owner_reference(fc: &FlowCollector) -> OwnerReference {
    OwnerReference {
        api_version: FlowCollector::api_version(&()).to_string(),
        kind: FlowCollector::kind(&()).to_string(),
        name: fc.metadata.name.clone().unwrap_or_default(),
        uid: fc.metadata.uid.clone().unwrap_or_default(),
        controller: Some(true),
        block_owner_deletion: Some(true),
    }
}

/// Informer permissions shared by every topology
pub fn build_cluster_role(fc: &FlowCollector) -> ClusterRole {
    let rule = |groups: &[&str], resources: &[&str]| PolicyRule {
        api_groups: Some(groups.iter().map(|s| s.to_string()).collect()),
        resources: Some(resources.iter().map(|s| s.to_string()).collect()),
        verbs: vec!["get".to_string(), "list".to_string(), "watch".to_string()],
        ..Default::default()
    };
    ClusterRole {
        metadata: ObjectMeta {
            name: Some(FLP_NAME.to_string()),
            labels: Some(fc.spec.get_labels(FLP_NAME)),
            owner_references: Some(vec![owner_reference(fc)]),
            ..Default::default()
        },
        rules: Some(vec![
            rule(&[""], &["pods", "services", "nodes"]),
            rule(&["apps"], &["replicasets"]),
            rule(&["autoscaling"], &["horizontalpodautoscalers"]),
            rule(&["discovery.k8s.io"], &["endpointslices"]),
        ]),
        ..Default::default()
    }
}

fn alert_rule(alert: ProcessorAlert) -> serde_json::Value {
    let (summary, description, expr) = match alert {
        ProcessorAlert::NetObservNoFlows => (
            "NetObserv flowlogs-pipeline is not receiving any flow",
            "NetObserv flowlogs-pipeline is not receiving any flow, this is either a connection issue with the agent, or an agent issue",
            "sum(rate(netobserv_ingest_flows_processed[1m])) == 0",
        ),
        ProcessorAlert::NetObservLokiError => (
            "NetObserv flowlogs-pipeline is dropping flows because of Loki errors",
            "NetObserv flowlogs-pipeline is dropping flows because of Loki errors, Loki may be down or having issues ingesting every flows. Please check Loki and flowlogs-pipeline logs.",
            "sum(rate(netobserv_loki_dropped_entries_total[1m])) > 0",
        ),
    };
    let name = match alert {
        ProcessorAlert::NetObservNoFlows => "NetObservNoFlows",
        ProcessorAlert::NetObservLokiError => "NetObservLokiError",
    };
    json!({
        "alert": name,
        "annotations": { "summary": summary, "description": description },
        "expr": expr,
        "for": "10m",
        "labels": { "severity": "warning", "app": "netobserv" },
    })
}
