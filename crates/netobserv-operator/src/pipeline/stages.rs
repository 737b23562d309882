//! Stage parameters consumed by flowlogs-pipeline
//!
//! Each stage of a compiled pipeline carries exactly one [`StageParams`]
//! value. Parameters serialize to the JSON layout flowlogs-pipeline reads:
//! `{"name": <stage>, <kind>: {"type": <type>, <type>: {...}}}`.

use crate::error::Result;
use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::BTreeMap;

/// Parameters of one pipeline stage
#[derive(Debug, Clone, PartialEq)]
pub enum StageParams {
    Ingest(Ingest),
    TransformFilter(TransformFilter),
    TransformNetwork(TransformNetwork),
    ConnTrack(ConnTrack),
    EncodePrometheus(PromEncode),
    WriteLoki(WriteLoki),
    WriteStdout,
    EncodeKafka(KafkaEncode),
    WriteIpfix(WriteIpfix),
}

impl StageParams {
    /// Top-level parameter key (`ingest`, `transform`, `extract`, `encode`, `write`)
    pub fn kind(&self) -> &'static str {
        match self {
            StageParams::Ingest(_) => "ingest",
            StageParams::TransformFilter(_) | StageParams::TransformNetwork(_) => "transform",
            StageParams::ConnTrack(_) => "extract",
            StageParams::EncodePrometheus(_) | StageParams::EncodeKafka(_) => "encode",
            StageParams::WriteLoki(_) | StageParams::WriteStdout | StageParams::WriteIpfix(_) => {
                "write"
            }
        }
    }

    /// Type of the stage within its kind
    pub fn type_name(&self) -> &'static str {
        match self {
            StageParams::Ingest(Ingest::Grpc { .. }) => "grpc",
            StageParams::Ingest(Ingest::Collector { .. }) => "collector",
            StageParams::Ingest(Ingest::Kafka(_)) => "kafka",
            StageParams::Ingest(Ingest::InProcess) => "inProcess",
            StageParams::TransformFilter(_) => "filter",
            StageParams::TransformNetwork(_) => "network",
            StageParams::ConnTrack(_) => "conntrack",
            StageParams::EncodePrometheus(_) => "prom",
            StageParams::WriteLoki(_) => "loki",
            StageParams::WriteStdout => "stdout",
            StageParams::EncodeKafka(_) => "kafka",
            StageParams::WriteIpfix(_) => "ipfix",
        }
    }

    fn body(&self) -> Result<Option<Value>> {
        let body = match self {
            StageParams::Ingest(Ingest::Grpc { port }) => serde_json::json!({ "port": port }),
            StageParams::Ingest(Ingest::Collector { port }) => {
                serde_json::json!({ "hostName": "0.0.0.0", "port": port })
            }
            StageParams::Ingest(Ingest::Kafka(k)) => serde_json::to_value(k)?,
            StageParams::Ingest(Ingest::InProcess) => return Ok(None),
            StageParams::TransformFilter(f) => serde_json::to_value(f)?,
            StageParams::TransformNetwork(n) => serde_json::to_value(n)?,
            StageParams::ConnTrack(c) => serde_json::to_value(c)?,
            StageParams::EncodePrometheus(p) => serde_json::to_value(p)?,
            StageParams::WriteLoki(l) => serde_json::to_value(l)?,
            StageParams::WriteStdout => serde_json::json!({ "format": "json" }),
            StageParams::EncodeKafka(k) => serde_json::to_value(k)?,
            StageParams::WriteIpfix(i) => serde_json::to_value(i)?,
        };
        Ok(Some(body))
    }

    /// Serialize into a `parameters` entry for the stage named `name`
    pub fn to_parameter(&self, name: &str) -> Result<Value> {
        let type_name = self.type_name();
        let mut inner = Map::new();
        inner.insert("type".to_string(), Value::String(type_name.to_string()));
        if let Some(body) = self.body()? {
            inner.insert(type_name.to_string(), body);
        }
        let mut entry = Map::new();
        entry.insert("name".to_string(), Value::String(name.to_string()));
        entry.insert(self.kind().to_string(), Value::Object(inner));
        Ok(Value::Object(entry))
    }
}

// ============================================================================
// Ingest
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
pub enum Ingest {
    /// eBPF agents push protobuf flows over gRPC
    Grpc { port: i32 },
    /// IPFIX / NetFlow collector
    Collector { port: i32 },
    Kafka(KafkaIngest),
    /// Flows handed over inside the agent process
    InProcess,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct KafkaIngest {
    pub brokers: Vec<String>,
    pub topic: String,
    #[serde(rename = "groupid")]
    pub group_id: String,
    pub decoder: Decoder,
    pub pull_queue_capacity: i32,
    pub pull_max_bytes: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tls: Option<ClientTlsParams>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sasl: Option<SaslParams>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Decoder {
    #[serde(rename = "type")]
    pub decoder_type: String,
}

impl Decoder {
    pub fn protobuf() -> Self {
        Self {
            decoder_type: "protobuf".to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientTlsParams {
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub insecure_skip_verify: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ca_cert_path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_cert_path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_key_path: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SaslParams {
    #[serde(rename = "type")]
    pub sasl_type: String,
    #[serde(rename = "clientIDPath")]
    pub client_id_path: String,
    #[serde(rename = "clientSecretPath")]
    pub client_secret_path: String,
}

// ============================================================================
// Transform: filter
// ============================================================================

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TransformFilter {
    pub rules: Vec<FilterRule>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sampling_field: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GenericRule {
    pub input: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
}

impl GenericRule {
    pub fn field(input: &str) -> Self {
        Self {
            input: input.to_string(),
            value: None,
        }
    }

    pub fn with_value(input: &str, value: impl Into<Value>) -> Self {
        Self {
            input: input.to_string(),
            value: Some(value.into()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FilterRule {
    RemoveField {
        #[serde(rename = "removeField")]
        remove_field: GenericRule,
    },
    AddFieldIfDoesntExist {
        #[serde(rename = "addFieldIfDoesntExist")]
        add_field_if_doesnt_exist: GenericRule,
    },
    KeepEntryAllSatisfied {
        #[serde(rename = "keepEntryAllSatisfied")]
        keep_entry_all_satisfied: Vec<KeepEntryRule>,
        #[serde(rename = "keepEntrySampling", skip_serializing_if = "Option::is_none")]
        keep_entry_sampling: Option<u16>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum KeepEntryType {
    KeepEntryIfEqual,
    KeepEntryIfNotEqual,
    KeepEntryIfExists,
    KeepEntryIfDoesntExist,
    KeepEntryIfRegexMatch,
    KeepEntryIfNotRegexMatch,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct KeepEntryRule {
    #[serde(rename = "type")]
    pub rule_type: KeepEntryType,
    #[serde(rename = "keepEntry")]
    pub keep_entry: GenericRule,
}

// ============================================================================
// Transform: network
// ============================================================================

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TransformNetwork {
    pub rules: Vec<NetworkRule>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub direction_info: Option<DirectionInfo>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub subnet_labels: Vec<SubnetLabelParams>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum NetworkRule {
    AddKubernetes {
        kubernetes: K8sRule,
    },
    ReinterpretDirection,
    AddKubernetesInfra {
        kubernetes_infra: K8sInfraRule,
    },
    AddSubnetLabel {
        add_subnet_label: NetworkGenericRule,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct K8sRule {
    #[serde(rename = "ipField")]
    pub ip_field: String,
    pub output: String,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub add_zone: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct K8sReference {
    pub namespace: String,
    pub name: String,
}

impl K8sReference {
    pub fn new(namespace: &str, name: &str) -> Self {
        Self {
            namespace: namespace.to_string(),
            name: name.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct K8sInfraRule {
    #[serde(rename = "namespaceNameFields")]
    pub namespace_name_fields: Vec<K8sReference>,
    pub output: String,
    pub infra_prefixes: Vec<String>,
    pub infra_refs: Vec<K8sReference>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NetworkGenericRule {
    pub input: String,
    pub output: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DirectionInfo {
    #[serde(rename = "reporterIPField")]
    pub reporter_ip_field: String,
    pub src_host_field: String,
    pub dst_host_field: String,
    pub flow_direction_field: String,
    pub if_direction_field: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SubnetLabelParams {
    pub name: String,
    pub cidrs: Vec<String>,
}

// ============================================================================
// Extract: conntrack
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnTrack {
    pub key_definition: KeyDefinition,
    pub output_record_types: Vec<String>,
    pub output_fields: Vec<OutputField>,
    pub scheduling: Vec<SchedulingGroup>,
    pub tcp_flags: TcpFlags,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct KeyDefinition {
    pub field_groups: Vec<FieldGroup>,
    pub hash: ConnTrackHash,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FieldGroup {
    pub name: String,
    pub fields: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnTrackHash {
    pub field_group_refs: Vec<String>,
    #[serde(rename = "fieldGroupARef")]
    pub field_group_a_ref: String,
    #[serde(rename = "fieldGroupBRef")]
    pub field_group_b_ref: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OutputField {
    pub name: String,
    pub operation: String,
    #[serde(rename = "splitAB", skip_serializing_if = "std::ops::Not::not")]
    pub split_ab: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub input: Option<String>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub report_missing: bool,
}

impl OutputField {
    pub fn new(name: &str, operation: &str) -> Self {
        Self {
            name: name.to_string(),
            operation: operation.to_string(),
            split_ab: false,
            input: None,
            report_missing: false,
        }
    }

    pub fn split_ab(mut self) -> Self {
        self.split_ab = true;
        self
    }

    pub fn report_missing(mut self) -> Self {
        self.report_missing = true;
        self
    }

    pub fn from_input(mut self, input: &str) -> Self {
        self.input = Some(input.to_string());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SchedulingGroup {
    pub heartbeat_interval: String,
    pub end_connection_timeout: String,
    pub terminating_timeout: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TcpFlags {
    pub field_name: String,
    pub detect_end_connection: bool,
    #[serde(rename = "swapAB")]
    pub swap_ab: bool,
}

// ============================================================================
// Encode: prometheus
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PromEncode {
    pub metrics: Vec<MetricItem>,
    pub prefix: String,
}

/// One metric computed by flowlogs-pipeline
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricItem {
    pub name: String,
    #[serde(rename = "type")]
    pub metric_type: String,
    pub filters: Vec<MetricFilterParams>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value_key: Option<String>,
    pub labels: Vec<String>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub remap: BTreeMap<String, String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub flatten: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub buckets: Vec<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value_scale: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MetricFilterParams {
    pub key: String,
    pub value: String,
    #[serde(rename = "type")]
    pub filter_type: String,
}

// ============================================================================
// Write: loki
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WriteLoki {
    pub url: String,
    #[serde(rename = "tenantID", skip_serializing_if = "String::is_empty")]
    pub tenant_id: String,
    pub batch_wait: String,
    pub batch_size: i64,
    pub timeout: String,
    pub min_backoff: String,
    pub max_backoff: String,
    pub max_retries: i32,
    pub labels: Vec<String>,
    pub static_labels: BTreeMap<String, String>,
    pub timestamp_label: String,
    pub timestamp_scale: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_config: Option<LokiClientConfig>,
}

/// HTTP client configuration in Prometheus common-config layout
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct LokiClientConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub authorization: Option<Authorization>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tls_config: Option<HttpTlsConfig>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Authorization {
    #[serde(rename = "type")]
    pub auth_type: String,
    pub credentials_file: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct HttpTlsConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ca_file: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cert_file: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key_file: Option<String>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub insecure_skip_verify: bool,
}

// ============================================================================
// Exporters
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct KafkaEncode {
    pub address: String,
    pub topic: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tls: Option<ClientTlsParams>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sasl: Option<SaslParams>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WriteIpfix {
    pub target_host: String,
    pub target_port: i32,
    pub transport: String,
    pub enterprise_id: i32,
}
