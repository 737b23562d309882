//! Custom Resource Definitions for the network observability operator
//!
//! This module defines the cluster-scoped `FlowCollector` CRD, which describes
//! the whole flow collection stack, and the namespaced `FlowMetric` CRD, which
//! lets users declare additional metrics computed from flow records.

use k8s_openapi::api::autoscaling::v2::MetricSpec;
use k8s_openapi::api::core::v1::ResourceRequirements;
use kube::CustomResource;
use regex::Regex;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::LazyLock;
use validator::{Validate, ValidationError};

/// Name of the singleton `FlowCollector` the operator reconciles
pub const FLOW_COLLECTOR_NAME: &str = "cluster";

/// Value of the `app.kubernetes.io/managed-by` label on every owned object
pub const MANAGED_BY: &str = "netobserv-operator";

/// Ports that flowlogs-pipeline must never listen on (VXLAN, Geneve, IKE, IPsec NAT-T)
pub const BLOCKED_PORTS: [i32; 4] = [4789, 6081, 500, 4500];

/// Regex for validating Kubernetes names (RFC 1123 subdomain)
static NAME_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-z0-9]([-a-z0-9]*[a-z0-9])?$").unwrap());

/// Regex for Prometheus metric names
static METRIC_NAME_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-zA-Z_][a-zA-Z0-9_]*$").unwrap());

/// Flow record fields that carry string or enum values
const FLOW_FIELDS: &[&str] = &[
    "SrcK8S_Name",
    "SrcK8S_Type",
    "SrcK8S_OwnerName",
    "SrcK8S_OwnerType",
    "SrcK8S_Namespace",
    "SrcK8S_HostIP",
    "SrcK8S_HostName",
    "SrcK8S_Zone",
    "SrcSubnetLabel",
    "DstK8S_Name",
    "DstK8S_Type",
    "DstK8S_OwnerName",
    "DstK8S_OwnerType",
    "DstK8S_Namespace",
    "DstK8S_HostIP",
    "DstK8S_HostName",
    "DstK8S_Zone",
    "DstSubnetLabel",
    "K8S_FlowLayer",
    "K8S_ClusterName",
    "SrcAddr",
    "DstAddr",
    "SrcMac",
    "DstMac",
    "SrcPort",
    "DstPort",
    "Proto",
    "Etype",
    "Dscp",
    "Flags",
    "IcmpType",
    "IcmpCode",
    "AgentIP",
    "Interfaces",
    "IfDirections",
    "FlowDirection",
    "IfDirection",
    "Duplicate",
    "Sampling",
    "DnsId",
    "DnsFlags",
    "DnsFlagsResponseCode",
    "PktDropLatestState",
    "PktDropLatestDropCause",
    "PktDropLatestFlags",
    "_RecordType",
];

/// Flow record fields that hold numbers and can be used as a metric value
const NUMERIC_FLOW_FIELDS: &[&str] = &[
    "Bytes",
    "Packets",
    "Bytes_AB",
    "Bytes_BA",
    "Packets_AB",
    "Packets_BA",
    "numFlowLogs",
    "PktDropBytes",
    "PktDropPackets",
    "TimeFlowRttNs",
    "MaxTimeFlowRttNs",
    "DnsLatencyMs",
    "TimeFlowStartMs",
    "TimeFlowEndMs",
    "TimeReceived",
];

/// Check whether `field` names a known flow field.
///
/// Nested fields such as `NetworkEvents>Name` are checked on the part before `>`.
/// When `numeric` is set only numeric fields are accepted.
pub fn is_known_flow_field(field: &str, numeric: bool) -> bool {
    let base = field.split('>').next().unwrap_or(field);
    if NUMERIC_FLOW_FIELDS.contains(&base) {
        return true;
    }
    !numeric && FLOW_FIELDS.contains(&base)
}

/// Validate a Kubernetes name (RFC 1123 subdomain)
fn validate_k8s_name(value: &str) -> Result<(), ValidationError> {
    if value.is_empty() {
        return Ok(()); // Empty is allowed for optional fields
    }
    if value.len() > 63 {
        return Err(
            ValidationError::new("name_too_long").with_message("name exceeds 63 characters".into())
        );
    }
    if !NAME_REGEX.is_match(value) {
        return Err(ValidationError::new("invalid_name").with_message(
            format!("'{}' is not a valid Kubernetes name (RFC 1123)", value).into(),
        ));
    }
    Ok(())
}

/// Validate image pull policy
fn validate_pull_policy(policy: &str) -> Result<(), ValidationError> {
    match policy {
        "Always" | "IfNotPresent" | "Never" => Ok(()),
        _ => Err(ValidationError::new("invalid_pull_policy")
            .with_message("imagePullPolicy must be Always, IfNotPresent, or Never".into())),
    }
}

/// Validate flowlogs-pipeline log level
fn validate_log_level(level: &str) -> Result<(), ValidationError> {
    match level {
        "trace" | "debug" | "info" | "warn" | "error" | "fatal" | "panic" => Ok(()),
        _ => Err(ValidationError::new("invalid_log_level")
            .with_message(format!("'{}' is not a valid log level", level).into())),
    }
}

/// Validate a Go-style duration (e.g., "30s", "1m", "5m30s")
fn validate_duration(duration: &str) -> Result<(), ValidationError> {
    static DURATION_REGEX: LazyLock<Regex> =
        LazyLock::new(|| Regex::new(r"^([0-9]+(ms|[smh]))+$").unwrap());
    if !DURATION_REGEX.is_match(duration) {
        return Err(ValidationError::new("invalid_duration").with_message(
            format!("'{}' is not a valid duration (e.g., 30s, 1m)", duration).into(),
        ));
    }
    Ok(())
}

/// Reject ports used by the node network stack
fn validate_processor_port(port: i32) -> Result<(), ValidationError> {
    if BLOCKED_PORTS.contains(&port) {
        return Err(ValidationError::new("blocked_port").with_message(
            format!(
                "port {} is reserved for cluster networking and cannot be used by flowlogs-pipeline",
                port
            )
            .into(),
        ));
    }
    Ok(())
}

/// Validate a Prometheus metric name
fn validate_metric_name(name: &str) -> Result<(), ValidationError> {
    if !METRIC_NAME_REGEX.is_match(name) {
        return Err(ValidationError::new("invalid_metric_name")
            .with_message(format!("'{}' is not a valid metric name", name).into()));
    }
    Ok(())
}

/// Validate a list of flow fields used as labels or flattened fields
fn validate_flow_fields(fields: &[String]) -> Result<(), ValidationError> {
    for field in fields {
        if !is_known_flow_field(field, false) {
            return Err(ValidationError::new("invalid_flow_field")
                .with_message(format!("invalid flow field: {}", field).into()));
        }
    }
    Ok(())
}

/// Validate a single filter field
fn validate_flow_field(field: &str) -> Result<(), ValidationError> {
    if !is_known_flow_field(field, false) {
        return Err(ValidationError::new("invalid_flow_field")
            .with_message(format!("invalid filter field: {}", field).into()));
    }
    Ok(())
}

/// Validate the metric value field, which must be numeric
fn validate_value_field(field: &str) -> Result<(), ValidationError> {
    if !is_known_flow_field(field, true) {
        return Err(ValidationError::new("invalid_value_field")
            .with_message(format!("invalid value field: {}", field).into()));
    }
    Ok(())
}

/// Validate histogram buckets
fn validate_buckets(buckets: &[String]) -> Result<(), ValidationError> {
    for bucket in buckets {
        if bucket.parse::<f64>().is_err() {
            return Err(ValidationError::new("invalid_bucket")
                .with_message(format!("could not parse bucket as float: '{}'", bucket).into()));
        }
    }
    Ok(())
}

/// Validate the optional value divider
fn validate_divider(divider: &str) -> Result<(), ValidationError> {
    match divider.parse::<f64>() {
        Ok(v) if v != 0.0 => Ok(()),
        _ => Err(ValidationError::new("invalid_divider")
            .with_message(format!("divider must be a non-zero number: '{}'", divider).into())),
    }
}

// ============================================================================
// FlowCollector
// ============================================================================

/// FlowCollector custom resource specification
#[derive(CustomResource, Debug, Clone, Deserialize, Serialize, JsonSchema, Validate)]
#[kube(
    group = "flows.netobserv.io",
    version = "v1beta2",
    kind = "FlowCollector",
    plural = "flowcollectors",
    shortname = "fc",
    status = "FlowCollectorStatus",
    printcolumn = r#"{"name":"Agent","type":"string","jsonPath":".spec.agent.type"}"#,
    printcolumn = r#"{"name":"Deployment Model","type":"string","jsonPath":".spec.deploymentModel"}"#,
    printcolumn = r#"{"name":"Status","type":"string","jsonPath":".status.conditions[?(@.type==\"Ready\")].reason"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct FlowCollectorSpec {
    /// Namespace where the flow collection stack is deployed
    #[serde(default = "default_namespace")]
    #[validate(custom(function = "validate_k8s_name"))]
    pub namespace: String,

    /// How flows travel from the agents to the processor
    #[serde(default)]
    pub deployment_model: DeploymentModel,

    /// Flow collection agent
    #[serde(default)]
    #[validate(nested)]
    pub agent: AgentSpec,

    /// flowlogs-pipeline settings
    #[serde(default)]
    #[validate(nested)]
    pub processor: ProcessorSpec,

    /// Loki storage for flow logs
    #[serde(default)]
    #[validate(nested)]
    pub loki: LokiSpec,

    /// Kafka transport, used with the Kafka deployment model
    #[serde(default)]
    pub kafka: KafkaSpec,

    /// Additional destinations for enriched flows
    #[serde(default)]
    #[validate(nested)]
    pub exporters: Vec<ExporterSpec>,
}

fn default_namespace() -> String {
    "netobserv".to_string()
}

/// How flows travel from agents to processors
#[derive(Debug, Clone, Copy, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum DeploymentModel {
    /// Agents send flows straight to a flowlogs-pipeline DaemonSet
    #[default]
    Direct,
    /// Flows go through Kafka and are consumed by a flowlogs-pipeline Deployment
    Kafka,
    /// The processing pipeline runs inside the eBPF agent process
    Embedded,
}

/// Kind of flow collection agent
#[derive(Debug, Clone, Copy, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum AgentType {
    #[default]
    #[serde(rename = "eBPF")]
    Ebpf,
    #[serde(rename = "IPFIX")]
    Ipfix,
}

/// Optional eBPF agent features
#[derive(Debug, Clone, Copy, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum AgentFeature {
    PacketDrop,
    #[serde(rename = "DNSTracking")]
    DnsTracking,
    #[serde(rename = "FlowRTT")]
    FlowRtt,
}

/// Agent-side flow deduplication
#[derive(Debug, Clone, Copy, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum DedupMode {
    Disabled,
    /// Duplicates are dropped by the agent
    #[default]
    Drop,
    /// Duplicates are kept and flagged with `Duplicate=true`
    JustMark,
}

/// Agent configuration
#[derive(Debug, Clone, Default, Deserialize, Serialize, JsonSchema, Validate)]
#[serde(rename_all = "camelCase")]
pub struct AgentSpec {
    /// Agent kind
    #[serde(default, rename = "type")]
    pub agent_type: AgentType,

    /// eBPF agent settings
    #[serde(default)]
    #[validate(nested)]
    pub ebpf: EbpfAgentSpec,
}

/// eBPF agent settings that affect the processor
#[derive(Debug, Clone, Default, Deserialize, Serialize, JsonSchema, Validate)]
#[serde(rename_all = "camelCase")]
pub struct EbpfAgentSpec {
    /// Sampling rate applied by the agent
    #[serde(default)]
    #[validate(range(min = 0, message = "sampling must be non-negative"))]
    pub sampling: Option<i32>,

    /// Enabled agent features
    #[serde(default)]
    pub features: Vec<AgentFeature>,

    /// Deduplication mode
    #[serde(default)]
    pub dedup_mode: DedupMode,
}

/// Which flow logs the processor writes
#[derive(Debug, Clone, Copy, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum LogTypes {
    #[default]
    Flows,
    Conversations,
    EndedConversations,
    All,
}

/// flowlogs-pipeline configuration
#[derive(Debug, Clone, Deserialize, Serialize, JsonSchema, Validate)]
#[serde(rename_all = "camelCase")]
pub struct ProcessorSpec {
    /// Image pull policy
    #[serde(default = "default_pull_policy")]
    #[validate(custom(function = "validate_pull_policy"))]
    pub image_pull_policy: String,

    /// Log level of flowlogs-pipeline; `trace` also prints flows to stdout
    #[serde(default = "default_log_level")]
    #[validate(custom(function = "validate_log_level"))]
    pub log_level: String,

    /// Resource requirements
    #[serde(default)]
    pub resources: Option<ResourceRequirements>,

    /// Collector port (gRPC for eBPF, IPFIX collector otherwise)
    #[serde(default = "default_processor_port")]
    #[validate(range(min = 1025, max = 65535, message = "port must be between 1025 and 65535"))]
    #[validate(custom(function = "validate_processor_port"))]
    pub port: i32,

    /// Health and probes port
    #[serde(default = "default_health_port")]
    #[validate(range(min = 1, max = 65535, message = "healthPort must be between 1 and 65535"))]
    pub health_port: i32,

    /// Go pprof port, disabled when unset
    #[serde(default)]
    #[validate(range(min = 1, max = 65535, message = "profilePort must be between 1 and 65535"))]
    pub profile_port: Option<i32>,

    /// Wire liveness and startup probes
    #[serde(default = "default_true")]
    pub enable_kube_probes: bool,

    /// Drop fields unused by the stack (IPFIX only)
    #[serde(default = "default_true")]
    pub drop_unused_fields: bool,

    /// Which records are produced
    #[serde(default)]
    pub log_types: LogTypes,

    /// Cluster name reported in `K8S_ClusterName`
    #[serde(default)]
    pub cluster_name: String,

    /// Add `K8S_ClusterName` to every flow
    #[serde(default)]
    pub multi_cluster_deployment: bool,

    /// Add availability zone information
    #[serde(default)]
    pub add_zone: bool,

    /// Subnet labelling
    #[serde(default)]
    #[validate(nested)]
    pub subnet_labels: SubnetLabels,

    /// Heartbeat interval of conversation tracking
    #[serde(default = "default_heartbeat_interval")]
    #[validate(custom(function = "validate_duration"))]
    pub conversation_heartbeat_interval: String,

    /// Time after which a conversation is considered ended
    #[serde(default = "default_end_timeout")]
    #[validate(custom(function = "validate_duration"))]
    pub conversation_end_timeout: String,

    /// Time to wait after a FIN before ending a conversation
    #[serde(default = "default_terminating_timeout")]
    #[validate(custom(function = "validate_duration"))]
    pub conversation_terminating_timeout: String,

    /// Replicas of the Kafka consumer when the autoscaler is disabled
    #[serde(default = "default_kafka_consumer_replicas")]
    #[validate(range(min = 0, message = "kafkaConsumerReplicas must be non-negative"))]
    pub kafka_consumer_replicas: i32,

    /// Autoscaler of the Kafka consumer
    #[serde(default)]
    #[validate(nested)]
    pub kafka_consumer_autoscaler: AutoscalerSpec,

    /// Capacity of the Kafka consumer queue
    #[serde(default = "default_queue_capacity")]
    #[validate(range(min = 1, message = "kafkaConsumerQueueCapacity must be positive"))]
    pub kafka_consumer_queue_capacity: i32,

    /// Maximum bytes pulled from Kafka per batch
    #[serde(default = "default_batch_size")]
    #[validate(range(min = 1, message = "kafkaConsumerBatchSize must be positive"))]
    pub kafka_consumer_batch_size: i64,

    /// Filter rule sets
    #[serde(default)]
    #[validate(nested)]
    pub filters: Vec<FilterSet>,

    /// Metrics produced by the processor
    #[serde(default)]
    #[validate(nested)]
    pub metrics: ProcessorMetricsSpec,

    /// Extra environment variables for the processor container
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

fn default_pull_policy() -> String {
    "IfNotPresent".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_processor_port() -> i32 {
    2055
}

fn default_health_port() -> i32 {
    8080
}

fn default_true() -> bool {
    true
}

fn default_heartbeat_interval() -> String {
    "30s".to_string()
}

fn default_end_timeout() -> String {
    "10s".to_string()
}

fn default_terminating_timeout() -> String {
    "5s".to_string()
}

fn default_kafka_consumer_replicas() -> i32 {
    3
}

fn default_queue_capacity() -> i32 {
    1000
}

fn default_batch_size() -> i64 {
    10 * 1024 * 1024
}

impl Default for ProcessorSpec {
    fn default() -> Self {
        Self {
            image_pull_policy: default_pull_policy(),
            log_level: default_log_level(),
            resources: None,
            port: default_processor_port(),
            health_port: default_health_port(),
            profile_port: None,
            enable_kube_probes: true,
            drop_unused_fields: true,
            log_types: LogTypes::default(),
            cluster_name: String::new(),
            multi_cluster_deployment: false,
            add_zone: false,
            subnet_labels: SubnetLabels::default(),
            conversation_heartbeat_interval: default_heartbeat_interval(),
            conversation_end_timeout: default_end_timeout(),
            conversation_terminating_timeout: default_terminating_timeout(),
            kafka_consumer_replicas: default_kafka_consumer_replicas(),
            kafka_consumer_autoscaler: AutoscalerSpec::default(),
            kafka_consumer_queue_capacity: default_queue_capacity(),
            kafka_consumer_batch_size: default_batch_size(),
            filters: Vec::new(),
            metrics: ProcessorMetricsSpec::default(),
            env: BTreeMap::new(),
        }
    }
}

/// Subnet labelling configuration
#[derive(Debug, Clone, Default, Deserialize, Serialize, JsonSchema, Validate)]
#[serde(rename_all = "camelCase")]
pub struct SubnetLabels {
    /// Labels applied to flows whose address falls into one of the CIDRs
    #[serde(default)]
    pub custom_labels: Vec<SubnetLabel>,
}

/// A named group of CIDRs
#[derive(Debug, Clone, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SubnetLabel {
    pub name: String,
    pub cidrs: Vec<String>,
}

/// Autoscaler state
#[derive(Debug, Clone, Copy, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum AutoscalerStatus {
    #[default]
    Disabled,
    Enabled,
}

/// HorizontalPodAutoscaler settings
#[derive(Debug, Clone, Deserialize, Serialize, JsonSchema, Validate)]
#[serde(rename_all = "camelCase")]
pub struct AutoscalerSpec {
    #[serde(default)]
    pub status: AutoscalerStatus,

    #[serde(default)]
    #[validate(range(min = 1, message = "minReplicas must be at least 1"))]
    pub min_replicas: Option<i32>,

    #[serde(default = "default_max_replicas")]
    #[validate(range(min = 1, message = "maxReplicas must be at least 1"))]
    pub max_replicas: i32,

    /// Autoscaling metrics, as in `autoscaling/v2`
    #[serde(default)]
    pub metrics: Vec<MetricSpec>,
}

fn default_max_replicas() -> i32 {
    3
}

impl Default for AutoscalerSpec {
    fn default() -> Self {
        Self {
            status: AutoscalerStatus::Disabled,
            min_replicas: None,
            max_replicas: default_max_replicas(),
            metrics: Vec::new(),
        }
    }
}

/// How a filter predicate compares a field
#[derive(Debug, Clone, Copy, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum MatchType {
    #[default]
    Equal,
    NotEqual,
    Presence,
    Absence,
    MatchRegex,
    NotMatchRegex,
}

/// Single field predicate
#[derive(Debug, Clone, Deserialize, Serialize, JsonSchema, Validate, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct FilterMatch {
    #[validate(custom(function = "validate_flow_field"))]
    pub field: String,

    /// Ignored for Presence and Absence
    #[serde(default)]
    pub value: String,

    #[serde(default, rename = "matchType")]
    pub match_type: MatchType,
}

/// Where filtered flows go
#[derive(Debug, Clone, Copy, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum FilterTarget {
    /// Every consumer downstream of the filter
    #[default]
    #[serde(rename = "")]
    All,
    /// Only the Loki writer
    Loki,
}

/// A rule set: flows are kept when all predicates hold
#[derive(Debug, Clone, Default, Deserialize, Serialize, JsonSchema, Validate)]
#[serde(rename_all = "camelCase")]
pub struct FilterSet {
    #[serde(default)]
    #[validate(nested)]
    pub all_of: Vec<FilterMatch>,

    #[serde(default)]
    pub output_target: FilterTarget,

    /// Keep one flow out of `sampling`; 0 or 1 keeps every flow
    #[serde(default)]
    #[validate(range(min = 0, message = "sampling must be non-negative"))]
    pub sampling: i32,
}

/// Alerts shipped with the processor metrics
#[derive(Debug, Clone, Copy, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum ProcessorAlert {
    NetObservNoFlows,
    NetObservLokiError,
}

/// Processor metrics
#[derive(Debug, Clone, Default, Deserialize, Serialize, JsonSchema, Validate)]
#[serde(rename_all = "camelCase")]
pub struct ProcessorMetricsSpec {
    #[serde(default)]
    #[validate(nested)]
    pub server: MetricsServerConfig,

    /// Predefined metrics to produce; a default list applies when unset
    #[serde(default)]
    pub include_list: Option<Vec<String>>,

    #[serde(default)]
    pub disable_alerts: Vec<ProcessorAlert>,
}

/// Metrics endpoint of the processor
#[derive(Debug, Clone, Deserialize, Serialize, JsonSchema, Validate)]
#[serde(rename_all = "camelCase")]
pub struct MetricsServerConfig {
    #[serde(default = "default_metrics_port")]
    #[validate(range(min = 1, max = 65535, message = "port must be between 1 and 65535"))]
    pub port: i32,

    #[serde(default)]
    pub tls: ServerTls,
}

fn default_metrics_port() -> i32 {
    9401
}

impl Default for MetricsServerConfig {
    fn default() -> Self {
        Self {
            port: default_metrics_port(),
            tls: ServerTls::default(),
        }
    }
}

/// TLS mode of a server endpoint
#[derive(Debug, Clone, Copy, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum ServerTlsType {
    #[default]
    Disabled,
    /// Certificate generated by the platform service CA
    Auto,
    /// Certificate provided by the user
    Provided,
}

/// Server TLS configuration
#[derive(Debug, Clone, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ServerTls {
    #[serde(default, rename = "type")]
    pub tls_type: ServerTlsType,

    /// Certificate and key, required with `Provided`
    #[serde(default)]
    pub provided: Option<CertificateReference>,

    /// Skip verification of the server certificate by scrapers
    #[serde(default)]
    pub insecure_skip_verify: bool,

    /// CA used by scrapers to verify the provided certificate
    #[serde(default)]
    pub provided_ca_file: Option<FileReference>,
}

/// Loki authentication mode
#[derive(Debug, Clone, Copy, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum LokiAuthToken {
    #[default]
    Disabled,
    /// The processor authenticates with its own service account token
    Host,
    /// The user token is forwarded by the console; the processor uses its own
    Forward,
}

/// Loki configuration
#[derive(Debug, Clone, Deserialize, Serialize, JsonSchema, Validate)]
#[serde(rename_all = "camelCase")]
pub struct LokiSpec {
    #[serde(default = "default_true")]
    pub enable: bool,

    #[serde(default = "default_loki_url")]
    pub url: String,

    #[serde(default, rename = "tenantID")]
    pub tenant_id: String,

    #[serde(default)]
    pub auth_token: LokiAuthToken,

    #[serde(default)]
    pub tls: ClientTls,

    #[serde(default = "default_batch_wait")]
    #[validate(custom(function = "validate_duration"))]
    pub batch_wait: String,

    #[serde(default = "default_loki_batch_size")]
    #[validate(range(min = 1, message = "batchSize must be positive"))]
    pub batch_size: i64,

    #[serde(default = "default_loki_timeout")]
    #[validate(custom(function = "validate_duration"))]
    pub timeout: String,

    #[serde(default = "default_min_backoff")]
    #[validate(custom(function = "validate_duration"))]
    pub min_backoff: String,

    #[serde(default = "default_max_backoff")]
    #[validate(custom(function = "validate_duration"))]
    pub max_backoff: String,

    #[serde(default = "default_max_retries")]
    #[validate(range(min = 0, message = "maxRetries must be non-negative"))]
    pub max_retries: i32,

    #[serde(default = "default_static_labels")]
    pub static_labels: BTreeMap<String, String>,

    /// Labels removed from the default Loki index
    #[serde(default)]
    pub exclude_labels: Vec<String>,
}

fn default_loki_url() -> String {
    "http://loki:3100/".to_string()
}

fn default_batch_wait() -> String {
    "1s".to_string()
}

fn default_loki_batch_size() -> i64 {
    100 * 1024
}

fn default_loki_timeout() -> String {
    "10s".to_string()
}

fn default_min_backoff() -> String {
    "1s".to_string()
}

fn default_max_backoff() -> String {
    "5s".to_string()
}

fn default_max_retries() -> i32 {
    2
}

fn default_static_labels() -> BTreeMap<String, String> {
    BTreeMap::from([("app".to_string(), "netobserv-flowcollector".to_string())])
}

impl Default for LokiSpec {
    fn default() -> Self {
        Self {
            enable: true,
            url: default_loki_url(),
            tenant_id: String::new(),
            auth_token: LokiAuthToken::default(),
            tls: ClientTls::default(),
            batch_wait: default_batch_wait(),
            batch_size: default_loki_batch_size(),
            timeout: default_loki_timeout(),
            min_backoff: default_min_backoff(),
            max_backoff: default_max_backoff(),
            max_retries: default_max_retries(),
            static_labels: default_static_labels(),
            exclude_labels: Vec::new(),
        }
    }
}

/// Kafka connection
#[derive(Debug, Clone, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct KafkaSpec {
    /// Bootstrap address
    #[serde(default)]
    pub address: String,

    #[serde(default)]
    pub topic: String,

    #[serde(default)]
    pub tls: ClientTls,

    #[serde(default)]
    pub sasl: SaslConfig,
}

/// Kind of object a reference points to
#[derive(Debug, Clone, Copy, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq, Hash)]
pub enum MountableType {
    #[default]
    #[serde(rename = "secret")]
    Secret,
    #[serde(rename = "configmap")]
    ConfigMap,
}

impl MountableType {
    /// Kubernetes kind of the referenced object
    pub fn kind(&self) -> &'static str {
        match self {
            MountableType::Secret => "Secret",
            MountableType::ConfigMap => "ConfigMap",
        }
    }
}

/// Reference to a certificate stored in a Secret or ConfigMap
#[derive(Debug, Clone, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct CertificateReference {
    #[serde(default, rename = "type")]
    pub ref_type: MountableType,

    #[serde(default)]
    pub name: String,

    /// Namespace of the object; empty means the deployment namespace
    #[serde(default)]
    pub namespace: String,

    #[serde(default)]
    pub cert_file: String,

    /// Private key file, for client certificates
    #[serde(default)]
    pub cert_key: String,
}

/// Reference to a single file stored in a Secret or ConfigMap
#[derive(Debug, Clone, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct FileReference {
    #[serde(default, rename = "type")]
    pub ref_type: MountableType,

    #[serde(default)]
    pub name: String,

    #[serde(default)]
    pub namespace: String,

    #[serde(default)]
    pub file: String,
}

/// Client-side TLS configuration
#[derive(Debug, Clone, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ClientTls {
    #[serde(default)]
    pub enable: bool,

    #[serde(default)]
    pub insecure_skip_verify: bool,

    #[serde(default)]
    pub ca_cert: CertificateReference,

    /// Client certificate for mutual TLS
    #[serde(default)]
    pub user_cert: CertificateReference,
}

/// SASL mechanism
#[derive(Debug, Clone, Copy, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum SaslType {
    #[default]
    Disabled,
    Plain,
    #[serde(rename = "ScramSHA512")]
    ScramSha512,
}

/// SASL authentication
#[derive(Debug, Clone, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SaslConfig {
    #[serde(default, rename = "type")]
    pub sasl_type: SaslType,

    #[serde(default, rename = "clientIDReference")]
    pub client_id_reference: FileReference,

    #[serde(default)]
    pub client_secret_reference: FileReference,
}

/// Exporter kind
#[derive(Debug, Clone, Copy, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum ExporterType {
    Kafka,
    #[serde(rename = "IPFIX")]
    Ipfix,
}

/// IPFIX receiver
#[derive(Debug, Clone, Default, Deserialize, Serialize, JsonSchema, Validate)]
#[serde(rename_all = "camelCase")]
pub struct IpfixReceiverSpec {
    #[serde(default)]
    pub target_host: String,

    #[serde(default)]
    #[validate(range(min = 0, max = 65535, message = "targetPort must be between 0 and 65535"))]
    pub target_port: i32,

    /// `UDP` or `TCP`; anything else means TCP
    #[serde(default)]
    pub transport: String,
}

/// Additional flow destination
#[derive(Debug, Clone, Deserialize, Serialize, JsonSchema, Validate)]
#[serde(rename_all = "camelCase")]
pub struct ExporterSpec {
    #[serde(rename = "type")]
    pub exporter_type: ExporterType,

    #[serde(default)]
    pub kafka: KafkaSpec,

    #[serde(default)]
    #[validate(nested)]
    pub ipfix: IpfixReceiverSpec,
}

/// FlowCollector status
#[derive(Debug, Clone, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct FlowCollectorStatus {
    /// Aggregated and per-component conditions
    #[serde(default)]
    pub conditions: Vec<FlowCollectorCondition>,

    /// Namespace where the stack is currently deployed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
}

/// Condition describing an aspect of the stack state
#[derive(Debug, Clone, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct FlowCollectorCondition {
    /// Type of condition (`Ready` or `<Component>Ready`)
    #[serde(rename = "type")]
    pub condition_type: String,

    /// Status of the condition (True, False, Unknown)
    pub status: String,

    /// Machine-readable reason
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,

    /// Human-readable message
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,

    /// Last time the condition transitioned
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_transition_time: Option<String>,
}

impl FlowCollectorSpec {
    pub fn uses_kafka(&self) -> bool {
        self.deployment_model == DeploymentModel::Kafka
    }

    pub fn uses_ebpf(&self) -> bool {
        self.agent.agent_type == AgentType::Ebpf
    }

    pub fn uses_ipfix(&self) -> bool {
        self.agent.agent_type == AgentType::Ipfix
    }

    pub fn loki_enabled(&self) -> bool {
        self.loki.enable
    }

    /// Connection tracking runs for every log type but `Flows`
    pub fn uses_conntrack(&self) -> bool {
        self.processor.log_types != LogTypes::Flows
    }

    pub fn zone_enabled(&self) -> bool {
        self.processor.add_zone
    }

    pub fn multi_cluster_enabled(&self) -> bool {
        self.processor.multi_cluster_deployment
    }

    /// Check an eBPF agent feature; always false for IPFIX
    pub fn has_feature(&self, feature: AgentFeature) -> bool {
        self.uses_ebpf() && self.agent.ebpf.features.contains(&feature)
    }

    /// Duplicates are kept and marked rather than dropped
    pub fn dedup_just_mark(&self) -> bool {
        self.uses_ebpf() && self.agent.ebpf.dedup_mode == DedupMode::JustMark
    }

    pub fn autoscaler_enabled(&self) -> bool {
        self.processor.kafka_consumer_autoscaler.status == AutoscalerStatus::Enabled
    }

    pub fn alert_enabled(&self, alert: ProcessorAlert) -> bool {
        !self.processor.metrics.disable_alerts.contains(&alert)
    }

    /// Namespace of privileged workloads (agents, in-process pipeline)
    pub fn privileged_namespace(&self) -> String {
        format!("{}-privileged", self.namespace)
    }

    /// Get labels for managed resources
    pub fn get_labels(&self, app: &str) -> BTreeMap<String, String> {
        let mut labels = self.get_selector_labels(app);
        labels.insert(
            "app.kubernetes.io/name".to_string(),
            "netobserv".to_string(),
        );
        labels.insert(
            "app.kubernetes.io/component".to_string(),
            app.to_string(),
        );
        labels.insert(
            "app.kubernetes.io/managed-by".to_string(),
            MANAGED_BY.to_string(),
        );
        labels
    }

    /// Get selector labels for managed resources
    pub fn get_selector_labels(&self, app: &str) -> BTreeMap<String, String> {
        let mut labels = BTreeMap::new();
        labels.insert("app".to_string(), app.to_string());
        labels
    }
}

// ============================================================================
// FlowMetric
// ============================================================================

/// Metric type
#[derive(Debug, Clone, Copy, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum FlowMetricType {
    #[default]
    Counter,
    Histogram,
}

/// Flow direction a metric applies to
#[derive(Debug, Clone, Copy, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum MetricDirection {
    #[default]
    Any,
    Egress,
    Ingress,
}

/// Filter of a user-defined metric
#[derive(Debug, Clone, Deserialize, Serialize, JsonSchema, Validate, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct MetricFilter {
    #[validate(custom(function = "validate_flow_field"))]
    pub field: String,

    #[serde(default)]
    pub value: String,

    #[serde(default)]
    pub match_type: MatchType,
}

/// FlowMetric custom resource specification
#[derive(CustomResource, Debug, Clone, Deserialize, Serialize, JsonSchema, Validate)]
#[kube(
    group = "flows.netobserv.io",
    version = "v1alpha1",
    kind = "FlowMetric",
    plural = "flowmetrics",
    shortname = "fm",
    namespaced,
    status = "FlowMetricStatus",
    printcolumn = r#"{"name":"Metric","type":"string","jsonPath":".spec.metricName"}"#,
    printcolumn = r#"{"name":"Type","type":"string","jsonPath":".spec.type"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
#[validate(schema(function = "validate_remap"))]
pub struct FlowMetricSpec {
    /// Metric name, without the `netobserv_` prefix
    #[validate(custom(function = "validate_metric_name"))]
    pub metric_name: String,

    #[serde(default, rename = "type")]
    pub metric_type: FlowMetricType,

    /// Numeric flow field to accumulate; counts flows when unset
    #[serde(default)]
    #[validate(custom(function = "validate_value_field"))]
    pub value_field: Option<String>,

    #[serde(default)]
    #[validate(nested)]
    pub filters: Vec<MetricFilter>,

    /// Flow fields used as metric labels
    #[serde(default)]
    #[validate(custom(function = "validate_flow_fields"))]
    pub labels: Vec<String>,

    /// Array fields flattened into one sample per item
    #[serde(default)]
    pub flatten: Vec<String>,

    /// Label renames, keyed by flow field
    #[serde(default)]
    pub remap: BTreeMap<String, String>,

    #[serde(default)]
    pub direction: MetricDirection,

    #[serde(default)]
    pub include_duplicates: bool,

    /// Histogram buckets
    #[serde(default)]
    #[validate(custom(function = "validate_buckets"))]
    pub buckets: Vec<String>,

    /// Value divider, e.g. "1000000000" to report nanoseconds as seconds
    #[serde(default)]
    #[validate(custom(function = "validate_divider"))]
    pub divider: Option<String>,
}

/// Only fields declared as labels can be remapped
fn validate_remap(spec: &FlowMetricSpec) -> Result<(), ValidationError> {
    let invalid: Vec<&str> = spec
        .remap
        .keys()
        .filter(|k| !spec.labels.contains(k))
        .map(|k| k.as_str())
        .collect();
    if !invalid.is_empty() {
        return Err(ValidationError::new("invalid_remap").with_message(
            format!(
                "some fields defined for remapping are not defined as labels: {:?}",
                invalid
            )
            .into(),
        ));
    }
    Ok(())
}

/// FlowMetric status
#[derive(Debug, Clone, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct FlowMetricStatus {
    #[serde(default)]
    pub conditions: Vec<FlowCollectorCondition>,
}
