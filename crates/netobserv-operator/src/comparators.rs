//! Change detection between live and desired objects
//!
//! Most comparisons use *derivative* equality over the JSON form of objects:
//! every field set on the desired object must match the live one, while
//! fields left unset on the desired side are ignored. This keeps defaults
//! filled in by the API server from triggering updates. Environment
//! variables are the exception and compare exactly, so that removing a
//! variable is noticed.

use k8s_openapi::api::apps::v1::{DaemonSet, Deployment};
use k8s_openapi::api::autoscaling::v2::{HorizontalPodAutoscaler, HorizontalPodAutoscalerSpec};
use k8s_openapi::api::core::v1::{ConfigMap, Container, PodTemplateSpec, Probe, Service};
use k8s_openapi::api::rbac::v1::ClusterRoleBinding;
use kube::api::DynamicObject;
use serde::Serialize;
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fmt;
use tracing::info;

/// Prefix of annotations owned by the operator
pub const ANNOTATION_DOMAIN: &str = "flows.netobserv.io/";

/// Pod template annotation carrying the digest of the generated configuration
pub const CONFIG_DIGEST_ANNOTATION: &str = "flows.netobserv.io/config-digest";

/// What to do with an object
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeDecision {
    NoOp,
    Create,
    Update,
}

/// Decide from the live object, if any, and a change predicate
pub fn decide<T>(old: Option<&T>, changed: impl FnOnce(&T) -> bool) -> ChangeDecision {
    match old {
        None => ChangeDecision::Create,
        Some(old) if changed(old) => ChangeDecision::Update,
        Some(_) => ChangeDecision::NoOp,
    }
}

/// Reasons collected while comparing objects, logged once per sub-task
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChangeReport {
    title: String,
    changes: Vec<String>,
}

impl ChangeReport {
    pub fn new(title: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            changes: Vec::new(),
        }
    }

    pub fn add(&mut self, change: impl Into<String>) {
        self.changes.push(change.into());
    }

    /// Record `change` when `changed` holds and pass `changed` through
    pub fn check(&mut self, change: &str, changed: bool) -> bool {
        if changed {
            self.add(change);
        }
        changed
    }

    pub fn changes(&self) -> &[String] {
        &self.changes
    }

    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    pub fn log(&self) {
        if !self.is_empty() {
            info!(report = %self, "Changes detected");
        }
    }
}

impl fmt::Display for ChangeReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.changes.is_empty() {
            write!(f, "{}: no change", self.title)
        } else {
            write!(f, "{}: {}", self.title, self.changes.join(", "))
        }
    }
}

/// Hex SHA-256 of some content
pub fn digest(content: &[u8]) -> String {
    hex::encode(Sha256::digest(content))
}

/// Derivative equality: everything set on `new` equals `old`
pub fn derivative(new: &Value, old: &Value) -> bool {
    match new {
        Value::Null => true,
        Value::String(s) if s.is_empty() => true,
        Value::Array(a) if a.is_empty() => true,
        Value::Object(m) if m.is_empty() => true,
        Value::Array(a) => match old {
            Value::Array(b) => a.len() == b.len() && a.iter().zip(b).all(|(x, y)| derivative(x, y)),
            _ => false,
        },
        Value::Object(m) => match old {
            Value::Object(o) => m
                .iter()
                .all(|(k, v)| derivative(v, o.get(k).unwrap_or(&Value::Null))),
            _ => false,
        },
        _ => new == old,
    }
}

fn json<T: Serialize>(v: &T) -> Value {
    serde_json::to_value(v).unwrap_or_default()
}

fn derivative_of<T: Serialize>(new: &T, old: &T) -> bool {
    derivative(&json(new), &json(old))
}

/// Every label of `new` is present with the same value in `old`
pub fn is_subset(
    old: Option<&BTreeMap<String, String>>,
    new: Option<&BTreeMap<String, String>>,
) -> bool {
    let Some(new) = new else { return true };
    let empty = BTreeMap::new();
    let old = old.unwrap_or(&empty);
    new.iter().all(|(k, v)| old.get(k) == Some(v))
}

fn domain_annotations(tpl: &PodTemplateSpec) -> BTreeMap<&str, &str> {
    tpl.metadata
        .as_ref()
        .and_then(|m| m.annotations.as_ref())
        .map(|a| {
            a.iter()
                .filter(|(k, _)| k.starts_with(ANNOTATION_DOMAIN))
                .map(|(k, v)| (k.as_str(), v.as_str()))
                .collect()
        })
        .unwrap_or_default()
}

fn find_container<'a>(tpl: &'a PodTemplateSpec, name: &str) -> Option<&'a Container> {
    tpl.spec
        .as_ref()
        .and_then(|s| s.containers.iter().find(|c| c.name == name))
}

fn probe_changed(old: &Option<Probe>, new: &Option<Probe>) -> bool {
    old.is_some() != new.is_some()
}

/// Exact comparison of env vars; a missing list equals an empty one
pub fn env_changed(old: &Container, new: &Container) -> bool {
    old.env.as_deref().unwrap_or_default() != new.env.as_deref().unwrap_or_default()
}

fn container_changed(old: &Container, new: &Container, report: &mut ChangeReport) -> bool {
    report.check("Image changed", new.image != old.image)
        || report.check("Pull policy changed", new.image_pull_policy != old.image_pull_policy)
        || report.check("Args changed", !derivative_of(&new.args, &old.args))
        || report.check("Resources req/limit changed", !derivative_of(&new.resources, &old.resources))
        || report.check("Liveness probe changed", probe_changed(&old.liveness_probe, &new.liveness_probe))
        || report.check("Startup probe changed", probe_changed(&old.startup_probe, &new.startup_probe))
        || report.check("Env changed", env_changed(old, new))
}

/// Pod template predicate shared by DaemonSets and Deployments
pub fn pod_changed(
    old: &PodTemplateSpec,
    new: &PodTemplateSpec,
    container: &str,
    report: &mut ChangeReport,
) -> bool {
    if report.check(
        "Annotations changed",
        domain_annotations(old) != domain_annotations(new),
    ) {
        return true;
    }
    let old_volumes = old.spec.as_ref().map(|s| &s.volumes);
    let new_volumes = new.spec.as_ref().map(|s| &s.volumes);
    if report.check("Volumes changed", !derivative_of(&new_volumes, &old_volumes)) {
        return true;
    }
    let Some(old_container) = find_container(old, container) else {
        report.add("Old container not found");
        return true;
    };
    let Some(new_container) = find_container(new, container) else {
        report.add("New container not found");
        return true;
    };
    container_changed(old_container, new_container, report)
}

pub fn daemon_set_changed(
    old: &DaemonSet,
    new: &DaemonSet,
    container: &str,
    report: &mut ChangeReport,
) -> bool {
    let (Some(old_spec), Some(new_spec)) = (&old.spec, &new.spec) else {
        return report.check("Spec changed", old.spec.is_some() != new.spec.is_some());
    };
    report.check(
        "Labels changed",
        !is_subset(old.metadata.labels.as_ref(), new.metadata.labels.as_ref()),
    ) || report.check("Selector changed", !derivative_of(&new_spec.selector, &old_spec.selector))
        || pod_changed(&old_spec.template, &new_spec.template, container, report)
}

/// Replicas are only compared when no autoscaler governs them
pub fn deployment_changed(
    old: &Deployment,
    new: &Deployment,
    container: &str,
    autoscaled: bool,
    report: &mut ChangeReport,
) -> bool {
    let (Some(old_spec), Some(new_spec)) = (&old.spec, &new.spec) else {
        return report.check("Spec changed", old.spec.is_some() != new.spec.is_some());
    };
    report.check(
        "Labels changed",
        !is_subset(old.metadata.labels.as_ref(), new.metadata.labels.as_ref()),
    ) || pod_changed(&old_spec.template, &new_spec.template, container, report)
        || (!autoscaled && report.check("Replicas changed", old_spec.replicas != new_spec.replicas))
}

pub fn service_changed(old: &Service, new: &Service, report: &mut ChangeReport) -> bool {
    report.check(
        "Service annotations changed",
        !derivative_of(&new.metadata.annotations, &old.metadata.annotations),
    ) || report.check(
        "Service labels changed",
        !derivative_of(&new.metadata.labels, &old.metadata.labels),
    ) || report.check("Service spec changed", !derivative_of(&new.spec, &old.spec))
}

/// Update request for a service: the live object with ports and annotations
/// taken from the desired one, so platform-assigned fields stay untouched
pub fn service_for_update(old: &Service, new: &Service) -> Service {
    let mut svc = old.clone();
    svc.metadata.annotations = new.metadata.annotations.clone();
    let ports = new.spec.as_ref().and_then(|s| s.ports.clone());
    svc.spec.get_or_insert_with(Default::default).ports = ports;
    svc
}

pub fn config_map_changed(old: &ConfigMap, new: &ConfigMap, report: &mut ChangeReport) -> bool {
    report.check(
        "Labels changed",
        !is_subset(old.metadata.labels.as_ref(), new.metadata.labels.as_ref()),
    ) || report.check("Data changed", old.data != new.data)
}

pub fn role_binding_changed(
    old: &ClusterRoleBinding,
    new: &ClusterRoleBinding,
    report: &mut ChangeReport,
) -> bool {
    report.check(
        "Labels changed",
        !is_subset(old.metadata.labels.as_ref(), new.metadata.labels.as_ref()),
    ) || report.check("Role ref changed", old.role_ref != new.role_ref)
        || report.check("Subjects changed", old.subjects != new.subjects)
}

/// Min replicas the API server assumes when none is set
const DEFAULT_MIN_REPLICAS: i32 = 1;

/// Exact min / max comparison, derivative metrics
///
/// The API server fills in a minimum and a CPU metric when they are unset.
pub fn autoscaler_changed(
    old: &HorizontalPodAutoscaler,
    new: &HorizontalPodAutoscaler,
    report: &mut ChangeReport,
) -> bool {
    let (Some(old_spec), Some(new_spec)) = (&old.spec, &new.spec) else {
        return report.check("Spec changed", old.spec.is_some() != new.spec.is_some());
    };
    let min = |spec: &HorizontalPodAutoscalerSpec| spec.min_replicas.unwrap_or(DEFAULT_MIN_REPLICAS);
    report.check("Max replicas changed", old_spec.max_replicas != new_spec.max_replicas)
        || report.check("Min replicas changed", min(old_spec) != min(new_spec))
        || report.check(
            "Metrics changed",
            !derivative_of(&new_spec.metrics, &old_spec.metrics),
        )
}

/// ServiceMonitor and PrometheusRule: labels and derivative spec
pub fn monitoring_changed(
    old: &DynamicObject,
    new: &DynamicObject,
    report: &mut ChangeReport,
) -> bool {
    report.check(
        "Labels changed",
        !is_subset(old.metadata.labels.as_ref(), new.metadata.labels.as_ref()),
    ) || report.check(
        "Spec changed",
        !derivative(&new.data["spec"], &old.data["spec"]),
    )
}
