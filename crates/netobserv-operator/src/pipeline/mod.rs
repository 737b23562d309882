//! Pipeline compiler
//!
//! Turns a `FlowCollector` spec and the user `FlowMetric` definitions into the
//! ordered stage graph and parameters consumed by flowlogs-pipeline.
//!
//! The graph is built with a [`PipelineBuilder`]: a stage can only be attached
//! after a [`StageRef`] handed out by the same builder, so every `follows`
//! reference names a stage declared earlier. Parameters live inside their
//! stage, which keeps exactly one parameter entry per stage.
//!
//! Compilation is a pure function of its inputs. The generated JSON is
//! byte-identical for identical inputs since objects serialize with sorted
//! keys.

pub mod filters;
pub mod metrics;
pub mod stages;
pub mod volumes;

use crate::crd::{
    ClientTls, CertificateReference, ExporterType, FilterTarget, FlowCollectorSpec,
    FlowMetricSpec, KafkaSpec, LogTypes, LokiAuthToken, MountableType, SaslConfig, SaslType,
    ServerTlsType,
};
use crate::error::{OperatorError, Result};
use crate::topology::{Topology, FLP_NAME};
use serde_json::{json, Map, Value};
use stages::{
    Authorization, ClientTlsParams, ConnTrack, ConnTrackHash, Decoder, DirectionInfo,
    FieldGroup, HttpTlsConfig, Ingest, K8sInfraRule, K8sReference, K8sRule, KafkaEncode,
    KafkaIngest, KeyDefinition, LokiClientConfig, MetricItem, NetworkGenericRule, NetworkRule,
    OutputField, PromEncode, SaslParams, SchedulingGroup, StageParams, SubnetLabelParams,
    TcpFlags, TransformFilter, TransformNetwork, WriteIpfix, WriteLoki,
};
use volumes::Volumes;

/// Labels indexed by Loki for every deployment
pub const LOKI_INDEX_FIELDS: &[&str] = &[
    "SrcK8S_Namespace",
    "SrcK8S_OwnerName",
    "SrcK8S_Type",
    "DstK8S_Namespace",
    "DstK8S_OwnerName",
    "DstK8S_Type",
    "K8S_FlowLayer",
    "FlowDirection",
];

/// Volume holding a user-provided metrics server certificate
const METRICS_CERTS_VOLUME: &str = "flp-metrics-certs";

/// One stage of the pipeline with its parameters
#[derive(Debug, Clone, PartialEq)]
pub struct Stage {
    pub name: String,
    pub follows: Option<String>,
    pub params: StageParams,
}

/// Handle on a declared stage, only obtainable from a [`PipelineBuilder`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StageRef {
    index: usize,
}

/// Builds a stage graph rooted at an ingest stage
#[derive(Debug)]
pub struct PipelineBuilder {
    stages: Vec<Stage>,
}

impl PipelineBuilder {
    /// Start a pipeline with its ingest stage
    pub fn new(name: &str, ingest: Ingest) -> (Self, StageRef) {
        let builder = Self {
            stages: vec![Stage {
                name: name.to_string(),
                follows: None,
                params: StageParams::Ingest(ingest),
            }],
        };
        (builder, StageRef { index: 0 })
    }

    /// Declare a stage downstream of `after`
    pub fn next(&mut self, after: StageRef, name: &str, params: StageParams) -> StageRef {
        let follows = self.stages[after.index].name.clone();
        self.stages.push(Stage {
            name: name.to_string(),
            follows: Some(follows),
            params,
        });
        StageRef {
            index: self.stages.len() - 1,
        }
    }

    pub fn build(self) -> Vec<Stage> {
        self.stages
    }
}

/// Inputs to compilation that do not come from the FlowCollector itself
#[derive(Debug, Clone, Copy)]
pub struct PipelineContext<'a> {
    pub topology: Topology,
    /// Platform cluster id, used as cluster name when none is configured
    pub cluster_id: Option<&'a str>,
}

/// TLS files of the metrics server
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetricsTls {
    pub cert_path: String,
    pub key_path: String,
}

/// Result of compilation
#[derive(Debug, Clone, PartialEq)]
pub struct CompiledPipeline {
    pub stages: Vec<Stage>,
    /// Volumes the workload must mount for the referenced files
    pub volumes: Volumes,
    pub metrics_tls: Option<MetricsTls>,
}

impl CompiledPipeline {
    pub fn stage(&self, name: &str) -> Option<&Stage> {
        self.stages.iter().find(|s| s.name == name)
    }

    pub fn stage_names(&self) -> Vec<&str> {
        self.stages.iter().map(|s| s.name.as_str()).collect()
    }

    /// Names of stages directly downstream of `name`
    pub fn downstream_of(&self, name: &str) -> Vec<&str> {
        self.stages
            .iter()
            .filter(|s| s.follows.as_deref() == Some(name))
            .map(|s| s.name.as_str())
            .collect()
    }

    /// Metrics encoded by the `prometheus` stage
    pub fn metric_items(&self) -> &[MetricItem] {
        match self.stage("prometheus").map(|s| &s.params) {
            Some(StageParams::EncodePrometheus(p)) => &p.metrics,
            _ => &[],
        }
    }

    /// The `pipeline` section: stage names and predecessors
    pub fn pipeline_json(&self) -> Value {
        Value::Array(
            self.stages
                .iter()
                .map(|s| {
                    let mut entry = Map::new();
                    entry.insert("name".to_string(), Value::String(s.name.clone()));
                    if let Some(follows) = &s.follows {
                        entry.insert("follows".to_string(), Value::String(follows.clone()));
                    }
                    Value::Object(entry)
                })
                .collect(),
        )
    }

    /// The `parameters` section, in stage order
    pub fn parameters_json(&self) -> Result<Value> {
        let params = self
            .stages
            .iter()
            .map(|s| s.params.to_parameter(&s.name))
            .collect::<Result<Vec<_>>>()?;
        Ok(Value::Array(params))
    }

    /// Full flowlogs-pipeline configuration document
    pub fn config_document(&self, spec: &FlowCollectorSpec) -> Result<Value> {
        let processor = &spec.processor;
        let mut metrics_settings = json!({
            "port": processor.metrics.server.port,
            "prefix": metrics::METRICS_PREFIX,
            "noPanic": true,
        });
        if let Some(tls) = &self.metrics_tls {
            metrics_settings["tls"] = json!({
                "certPath": tls.cert_path,
                "keyPath": tls.key_path,
            });
        }
        let mut doc = json!({
            "log-level": processor.log_level,
            "health": { "port": processor.health_port },
            "pipeline": self.pipeline_json(),
            "parameters": self.parameters_json()?,
            "metricsSettings": metrics_settings,
        });
        if let Some(port) = processor.profile_port {
            doc["profile"] = json!({ "port": port });
        }
        Ok(doc)
    }

    /// Serialized configuration document
    pub fn config_json(&self, spec: &FlowCollectorSpec) -> Result<String> {
        Ok(serde_json::to_string(&self.config_document(spec)?)?)
    }
}

/// Compile the pipeline of one topology
pub fn compile(
    spec: &FlowCollectorSpec,
    ctx: &PipelineContext<'_>,
    user_metrics: &[FlowMetricSpec],
) -> Result<CompiledPipeline> {
    let mut volumes = Volumes::new();
    let metrics_tls = metrics_tls(spec, ctx.topology, &mut volumes)?;

    let (ingest_name, ingest) = ingest_stage(spec, ctx.topology, &mut volumes);
    let (mut builder, mut last) = PipelineBuilder::new(ingest_name, ingest);

    if !ctx.topology.processes_flows() {
        let encode = kafka_encode(&spec.kafka, "kafka-cert", "kafka-write", &mut volumes);
        builder.next(last, "kafka-write", StageParams::EncodeKafka(encode));
        return Ok(CompiledPipeline {
            stages: builder.build(),
            volumes,
            metrics_tls,
        });
    }

    let rules = filters::preprocessing_rules(spec, ctx.cluster_id);
    if !rules.is_empty() {
        last = builder.next(
            last,
            "filter",
            StageParams::TransformFilter(TransformFilter {
                rules,
                sampling_field: None,
            }),
        );
    }

    if spec.uses_conntrack() {
        last = builder.next(last, "extract_conntrack", StageParams::ConnTrack(conntrack(spec)));
    }

    let enrich = builder.next(last, "enrich", StageParams::TransformNetwork(enrich(spec)));

    let mut main = enrich;
    if let Some(filter) = filters::user_filter(&spec.processor.filters, FilterTarget::All) {
        main = builder.next(enrich, "filters", StageParams::TransformFilter(filter));
    }

    if spec.loki_enabled() {
        let mut loki_from = main;
        if let Some(filter) = filters::user_filter(&spec.processor.filters, FilterTarget::Loki) {
            loki_from = builder.next(main, "filters-loki", StageParams::TransformFilter(filter));
        }
        builder.next(
            loki_from,
            "loki",
            StageParams::WriteLoki(write_loki(spec, &mut volumes)),
        );
    }

    if spec.processor.log_level == "trace" {
        builder.next(enrich, "stdout", StageParams::WriteStdout);
    }

    let items = metrics::metric_items(spec, user_metrics)?;
    if !items.is_empty() {
        builder.next(
            main,
            "prometheus",
            StageParams::EncodePrometheus(PromEncode {
                metrics: items,
                prefix: metrics::METRICS_PREFIX.to_string(),
            }),
        );
    }

    for (i, exporter) in spec.exporters.iter().enumerate() {
        match exporter.exporter_type {
            ExporterType::Kafka => {
                let name = format!("kafka-export-{}", i);
                let encode = kafka_encode(&exporter.kafka, &name, &name, &mut volumes);
                builder.next(enrich, &name, StageParams::EncodeKafka(encode));
            }
            ExporterType::Ipfix => {
                let name = format!("IPFIX-export-{}", i);
                let ipfix = &exporter.ipfix;
                builder.next(
                    enrich,
                    &name,
                    StageParams::WriteIpfix(WriteIpfix {
                        target_host: ipfix.target_host.clone(),
                        target_port: ipfix.target_port,
                        transport: ipfix_transport(&ipfix.transport).to_string(),
                        enterprise_id: 2,
                    }),
                );
            }
        }
    }

    Ok(CompiledPipeline {
        stages: builder.build(),
        volumes,
        metrics_tls,
    })
}

fn ingest_stage(
    spec: &FlowCollectorSpec,
    topology: Topology,
    volumes: &mut Volumes,
) -> (&'static str, Ingest) {
    let port = spec.processor.port;
    match topology {
        Topology::Monolith | Topology::KafkaIngester => {
            if spec.uses_ebpf() {
                ("grpc", Ingest::Grpc { port })
            } else {
                ("ipfix", Ingest::Collector { port })
            }
        }
        Topology::KafkaTransformer => {
            let kafka = &spec.kafka;
            let decoder = if spec.uses_ebpf() {
                Decoder::protobuf()
            } else {
                Decoder {
                    decoder_type: "json".to_string(),
                }
            };
            (
                "kafka-read",
                Ingest::Kafka(KafkaIngest {
                    brokers: vec![kafka.address.clone()],
                    topic: kafka.topic.clone(),
                    group_id: topology.app_name().to_string(),
                    decoder,
                    pull_queue_capacity: spec.processor.kafka_consumer_queue_capacity,
                    pull_max_bytes: spec.processor.kafka_consumer_batch_size,
                    tls: client_tls(&kafka.tls, "kafka-cert", volumes),
                    sasl: sasl(&kafka.sasl, "kafka-ingest", volumes),
                }),
            )
        }
        Topology::InProcess => ("inprocess", Ingest::InProcess),
    }
}

fn client_tls(tls: &ClientTls, prefix: &str, volumes: &mut Volumes) -> Option<ClientTlsParams> {
    if !tls.enable {
        return None;
    }
    let paths = volumes.add_mutual_tls(tls, prefix);
    Some(ClientTlsParams {
        insecure_skip_verify: tls.insecure_skip_verify,
        ca_cert_path: paths.ca,
        user_cert_path: paths.user_cert,
        user_key_path: paths.user_key,
    })
}

fn sasl(config: &SaslConfig, prefix: &str, volumes: &mut Volumes) -> Option<SaslParams> {
    let sasl_type = match config.sasl_type {
        SaslType::Disabled => return None,
        SaslType::Plain => "plain",
        SaslType::ScramSha512 => "scramSHA512",
    };
    Some(SaslParams {
        sasl_type: sasl_type.to_string(),
        client_id_path: volumes
            .add_file(&config.client_id_reference, &format!("{}-sasl-id", prefix)),
        client_secret_path: volumes
            .add_file(&config.client_secret_reference, &format!("{}-sasl-secret", prefix)),
    })
}

fn kafka_encode(kafka: &KafkaSpec, tls_prefix: &str, sasl_prefix: &str, volumes: &mut Volumes) -> KafkaEncode {
    KafkaEncode {
        address: kafka.address.clone(),
        topic: kafka.topic.clone(),
        tls: client_tls(&kafka.tls, tls_prefix, volumes),
        sasl: sasl(&kafka.sasl, sasl_prefix, volumes),
    }
}

/// Only `UDP` selects UDP; anything else falls back to TCP
fn ipfix_transport(transport: &str) -> &'static str {
    match transport {
        "UDP" => "udp",
        _ => "tcp",
    }
}

fn metrics_tls(
    spec: &FlowCollectorSpec,
    topology: Topology,
    volumes: &mut Volumes,
) -> Result<Option<MetricsTls>> {
    let tls = &spec.processor.metrics.server.tls;
    let (cert, volume_name) = match tls.tls_type {
        ServerTlsType::Disabled => return Ok(None),
        ServerTlsType::Auto => (
            CertificateReference {
                ref_type: MountableType::Secret,
                name: topology.prom_tls_secret_name(),
                namespace: String::new(),
                cert_file: "tls.crt".to_string(),
                cert_key: "tls.key".to_string(),
            },
            topology.prom_tls_secret_name(),
        ),
        ServerTlsType::Provided => match &tls.provided {
            Some(cert) if !cert.name.is_empty() => {
                (cert.clone(), METRICS_CERTS_VOLUME.to_string())
            }
            _ => {
                return Err(OperatorError::InvalidConfig(
                    "processor metrics TLS is set to Provided but no certificate is configured"
                        .to_string(),
                ))
            }
        },
    };
    let paths = volumes.add_certificate(&cert, &volume_name);
    match (paths.cert, paths.key) {
        (Some(cert_path), Some(key_path)) => Ok(Some(MetricsTls {
            cert_path,
            key_path,
        })),
        _ => Err(OperatorError::InvalidConfig(
            "processor metrics TLS certificate requires both certFile and certKey".to_string(),
        )),
    }
}

fn conntrack(spec: &FlowCollectorSpec) -> ConnTrack {
    let mut output_fields = vec![
        OutputField::new("Bytes", "sum"),
        OutputField::new("Bytes", "sum").split_ab(),
        OutputField::new("Packets", "sum"),
        OutputField::new("Packets", "sum").split_ab(),
        OutputField::new("numFlowLogs", "count"),
        OutputField::new("TimeFlowStartMs", "min").report_missing(),
        OutputField::new("TimeFlowEndMs", "max").report_missing(),
        OutputField::new("FlowDirection", "first").report_missing(),
        OutputField::new("IfDirection", "first").report_missing(),
        OutputField::new("AgentIP", "first").report_missing(),
    ];
    if spec.has_feature(crate::crd::AgentFeature::PacketDrop) {
        output_fields.extend([
            OutputField::new("PktDropBytes", "sum"),
            OutputField::new("PktDropBytes", "sum").split_ab(),
            OutputField::new("PktDropPackets", "sum"),
            OutputField::new("PktDropPackets", "sum").split_ab(),
            OutputField::new("PktDropLatestState", "last"),
            OutputField::new("PktDropLatestDropCause", "last"),
        ]);
    }
    if spec.has_feature(crate::crd::AgentFeature::DnsTracking) {
        output_fields.extend([
            OutputField::new("DnsFlagsResponseCode", "last"),
            OutputField::new("DnsLatencyMs", "max"),
        ]);
    }
    if spec.has_feature(crate::crd::AgentFeature::FlowRtt) {
        output_fields.push(OutputField::new("MaxTimeFlowRttNs", "max").from_input("TimeFlowRttNs"));
    }

    let record_types: &[&str] = match spec.processor.log_types {
        LogTypes::Flows => &[],
        LogTypes::Conversations => &["newConnection", "heartbeat", "endConnection"],
        LogTypes::EndedConversations => &["endConnection"],
        LogTypes::All => &["newConnection", "heartbeat", "endConnection", "flowLog"],
    };

    let group = |name: &str, fields: &[&str]| FieldGroup {
        name: name.to_string(),
        fields: fields.iter().map(|f| f.to_string()).collect(),
    };

    ConnTrack {
        key_definition: KeyDefinition {
            field_groups: vec![
                group("src", &["SrcAddr", "SrcPort"]),
                group("dst", &["DstAddr", "DstPort"]),
                group("common", &["Proto"]),
            ],
            hash: ConnTrackHash {
                field_group_refs: vec!["common".to_string()],
                field_group_a_ref: "src".to_string(),
                field_group_b_ref: "dst".to_string(),
            },
        },
        output_record_types: record_types.iter().map(|r| r.to_string()).collect(),
        output_fields,
        scheduling: vec![SchedulingGroup {
            heartbeat_interval: spec.processor.conversation_heartbeat_interval.clone(),
            end_connection_timeout: spec.processor.conversation_end_timeout.clone(),
            terminating_timeout: spec.processor.conversation_terminating_timeout.clone(),
        }],
        tcp_flags: TcpFlags {
            field_name: "Flags".to_string(),
            detect_end_connection: true,
            swap_ab: true,
        },
    }
}

fn enrich(spec: &FlowCollectorSpec) -> TransformNetwork {
    let add_zone = spec.zone_enabled();
    let mut rules = vec![
        NetworkRule::AddKubernetes {
            kubernetes: K8sRule {
                ip_field: "SrcAddr".to_string(),
                output: "SrcK8S".to_string(),
                add_zone,
            },
        },
        NetworkRule::AddKubernetes {
            kubernetes: K8sRule {
                ip_field: "DstAddr".to_string(),
                output: "DstK8S".to_string(),
                add_zone,
            },
        },
        NetworkRule::ReinterpretDirection,
        NetworkRule::AddKubernetesInfra {
            kubernetes_infra: K8sInfraRule {
                namespace_name_fields: vec![
                    K8sReference::new("SrcK8S_Namespace", "SrcK8S_Name"),
                    K8sReference::new("DstK8S_Namespace", "DstK8S_Name"),
                ],
                output: "K8S_FlowLayer".to_string(),
                infra_prefixes: vec![spec.namespace.clone(), "openshift".to_string()],
                infra_refs: vec![
                    K8sReference::new("default", "kubernetes"),
                    K8sReference::new("default", "openshift"),
                ],
            },
        },
    ];

    let labels = &spec.processor.subnet_labels.custom_labels;
    if !labels.is_empty() {
        for (input, output) in [("SrcAddr", "SrcSubnetLabel"), ("DstAddr", "DstSubnetLabel")] {
            rules.push(NetworkRule::AddSubnetLabel {
                add_subnet_label: NetworkGenericRule {
                    input: input.to_string(),
                    output: output.to_string(),
                },
            });
        }
    }

    TransformNetwork {
        rules,
        direction_info: Some(DirectionInfo {
            reporter_ip_field: "AgentIP".to_string(),
            src_host_field: "SrcK8S_HostIP".to_string(),
            dst_host_field: "DstK8S_HostIP".to_string(),
            flow_direction_field: "FlowDirection".to_string(),
            if_direction_field: "IfDirection".to_string(),
        }),
        subnet_labels: labels
            .iter()
            .map(|l| SubnetLabelParams {
                name: l.name.clone(),
                cidrs: l.cidrs.clone(),
            })
            .collect(),
    }
}

/// Loki index labels for the FlowCollector
pub fn loki_labels(spec: &FlowCollectorSpec) -> Vec<String> {
    let mut labels: Vec<String> = LOKI_INDEX_FIELDS.iter().map(|s| s.to_string()).collect();
    if spec.uses_conntrack() {
        labels.push("_RecordType".to_string());
    }
    if spec.multi_cluster_enabled() {
        labels.push(filters::CLUSTER_NAME_FIELD.to_string());
    }
    if spec.zone_enabled() {
        labels.push("SrcK8S_Zone".to_string());
        labels.push("DstK8S_Zone".to_string());
    }
    if spec.dedup_just_mark() {
        labels.push("Duplicate".to_string());
    }
    labels.retain(|l| !spec.loki.exclude_labels.contains(l));
    labels
}

fn write_loki(spec: &FlowCollectorSpec, volumes: &mut Volumes) -> WriteLoki {
    let loki = &spec.loki;

    let authorization = match loki.auth_token {
        LokiAuthToken::Host | LokiAuthToken::Forward => Some(Authorization {
            auth_type: "Bearer".to_string(),
            credentials_file: volumes.add_token(FLP_NAME),
        }),
        LokiAuthToken::Disabled => None,
    };

    let tls_config = if !loki.tls.enable {
        None
    } else if loki.tls.insecure_skip_verify {
        Some(HttpTlsConfig {
            insecure_skip_verify: true,
            ..Default::default()
        })
    } else {
        let paths = volumes.add_mutual_tls(&loki.tls, "loki-certs");
        Some(HttpTlsConfig {
            ca_file: paths.ca,
            cert_file: paths.user_cert,
            key_file: paths.user_key,
            insecure_skip_verify: false,
        })
    };

    let client_config = (authorization.is_some() || tls_config.is_some()).then(|| LokiClientConfig {
        authorization,
        tls_config,
    });

    WriteLoki {
        url: loki.url.clone(),
        tenant_id: loki.tenant_id.clone(),
        batch_wait: loki.batch_wait.clone(),
        batch_size: loki.batch_size,
        timeout: loki.timeout.clone(),
        min_backoff: loki.min_backoff.clone(),
        max_backoff: loki.max_backoff.clone(),
        max_retries: loki.max_retries,
        labels: loki_labels(spec),
        static_labels: loki.static_labels.clone(),
        timestamp_label: "TimeFlowEndMs".to_string(),
        timestamp_scale: "1ms".to_string(),
        client_config,
    }
}
