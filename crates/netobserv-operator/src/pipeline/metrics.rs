//! Prometheus metrics computed by flowlogs-pipeline
//!
//! Two sources feed the `prometheus` stage: the predefined catalogue, narrowed
//! by the FlowCollector include list and enabled features, and user
//! `FlowMetric` resources. Both go through [`to_metric_item`].

use super::stages::{MetricFilterParams, MetricItem};
use crate::crd::{
    AgentFeature, FlowCollectorSpec, FlowMetricSpec, FlowMetricType, LogTypes, MatchType,
    MetricDirection, MetricFilter,
};
use crate::error::{OperatorError, Result};
use std::sync::LazyLock;

/// Prefix of every metric exposed by flowlogs-pipeline
pub const METRICS_PREFIX: &str = "netobserv_";

const LATENCY_BUCKETS: &[&str] = &[
    ".005", ".01", ".02", ".03", ".04", ".05", ".075", ".1", ".25", "1",
];

const NODE_LABELS: &[&str] = &[
    "K8S_ClusterName",
    "SrcK8S_Zone",
    "DstK8S_Zone",
    "SrcK8S_HostName",
    "DstK8S_HostName",
];

const NAMESPACE_LABELS: &[&str] = &[
    "K8S_ClusterName",
    "SrcK8S_Zone",
    "DstK8S_Zone",
    "SrcK8S_Namespace",
    "DstK8S_Namespace",
    "K8S_FlowLayer",
    "SrcSubnetLabel",
    "DstSubnetLabel",
];

const WORKLOAD_LABELS: &[&str] = &[
    "K8S_ClusterName",
    "SrcK8S_Zone",
    "DstK8S_Zone",
    "SrcK8S_Namespace",
    "DstK8S_Namespace",
    "K8S_FlowLayer",
    "SrcSubnetLabel",
    "DstSubnetLabel",
    "SrcK8S_OwnerName",
    "DstK8S_OwnerName",
    "SrcK8S_OwnerType",
    "DstK8S_OwnerType",
    "SrcK8S_Type",
    "DstK8S_Type",
];

/// Metrics enabled when the include list is unset and Loki is enabled
pub const DEFAULT_INCLUDE_LIST: &[&str] = &[
    "node_ingress_bytes_total",
    "node_egress_bytes_total",
    "workload_sampling",
    "workload_ingress_bytes_total",
    "workload_egress_bytes_total",
    "namespace_flows_total",
    "namespace_drop_packets_total",
    "namespace_rtt_seconds",
    "namespace_dns_latency_seconds",
];

/// Wider default used when flows are not stored in Loki
pub const DEFAULT_INCLUDE_LIST_LOKI_DISABLED: &[&str] = &[
    "node_ingress_bytes_total",
    "node_egress_bytes_total",
    "workload_ingress_bytes_total",
    "workload_egress_bytes_total",
    "workload_sampling",
    "workload_ingress_packets_total",
    "workload_egress_packets_total",
    "workload_flows_total",
    "workload_drop_bytes_total",
    "workload_drop_packets_total",
    "workload_rtt_seconds",
    "workload_dns_latency_seconds",
];

/// A catalogue entry
#[derive(Debug, Clone)]
struct PredefinedMetric {
    spec: FlowMetricSpec,
    /// Reported as a gauge whatever the declared metric type
    gauge: bool,
}

fn strings(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

fn presence(field: &str) -> MetricFilter {
    MetricFilter {
        field: field.to_string(),
        value: String::new(),
        match_type: MatchType::Presence,
    }
}

fn base_spec(name: String, labels: Vec<String>) -> FlowMetricSpec {
    FlowMetricSpec {
        metric_name: name,
        metric_type: FlowMetricType::Counter,
        value_field: None,
        filters: vec![],
        labels,
        flatten: vec![],
        remap: Default::default(),
        direction: MetricDirection::Any,
        include_duplicates: false,
        buckets: vec![],
        divider: None,
    }
}

static PREDEFINED_METRICS: LazyLock<Vec<PredefinedMetric>> = LazyLock::new(build_catalogue);

fn build_catalogue() -> Vec<PredefinedMetric> {
    let groups: [(&str, &[&str]); 3] = [
        ("node", NODE_LABELS),
        ("namespace", NAMESPACE_LABELS),
        ("workload", WORKLOAD_LABELS),
    ];
    let mut catalogue = Vec::new();

    for (group, labels) in groups {
        for (value_type, value_field) in [("bytes", "Bytes"), ("packets", "Packets")] {
            for (dir, direction) in [
                ("egress", MetricDirection::Egress),
                ("ingress", MetricDirection::Ingress),
            ] {
                let mut spec = base_spec(
                    format!("{}_{}_{}_total", group, dir, value_type),
                    strings(labels),
                );
                spec.value_field = Some(value_field.to_string());
                spec.direction = direction;
                catalogue.push(PredefinedMetric { spec, gauge: false });
            }
        }
        let mut sampling = base_spec(format!("{}_sampling", group), strings(labels));
        sampling.value_field = Some("Sampling".to_string());
        catalogue.push(PredefinedMetric {
            spec: sampling,
            gauge: true,
        });
        catalogue.push(PredefinedMetric {
            spec: base_spec(format!("{}_flows_total", group), strings(labels)),
            gauge: false,
        });
    }

    for (group, labels) in groups {
        let mut rtt = base_spec(format!("{}_rtt_seconds", group), strings(labels));
        rtt.metric_type = FlowMetricType::Histogram;
        rtt.value_field = Some("TimeFlowRttNs".to_string());
        rtt.filters = vec![presence("TimeFlowRttNs")];
        rtt.divider = Some("1000000000".to_string());
        rtt.buckets = strings(LATENCY_BUCKETS);
        catalogue.push(PredefinedMetric {
            spec: rtt,
            gauge: false,
        });
    }

    for (group, labels) in groups {
        let mut drop_labels = strings(labels);
        drop_labels.extend(strings(&["PktDropLatestState", "PktDropLatestDropCause"]));
        for (unit, field) in [("packets", "PktDropPackets"), ("bytes", "PktDropBytes")] {
            let mut spec = base_spec(
                format!("{}_drop_{}_total", group, unit),
                drop_labels.clone(),
            );
            spec.value_field = Some(field.to_string());
            spec.filters = vec![presence(field)];
            catalogue.push(PredefinedMetric { spec, gauge: false });
        }
    }

    for (group, labels) in groups {
        let mut dns_labels = strings(labels);
        dns_labels.push("DnsFlagsResponseCode".to_string());
        let mut dns = base_spec(format!("{}_dns_latency_seconds", group), dns_labels);
        dns.metric_type = FlowMetricType::Histogram;
        dns.value_field = Some("DnsLatencyMs".to_string());
        dns.filters = vec![presence("DnsId")];
        dns.divider = Some("1000".to_string());
        dns.buckets = strings(LATENCY_BUCKETS);
        catalogue.push(PredefinedMetric {
            spec: dns,
            gauge: false,
        });
    }

    catalogue
}

/// Names of every predefined metric
pub fn all_predefined_names() -> Vec<String> {
    PREDEFINED_METRICS
        .iter()
        .map(|m| m.spec.metric_name.clone())
        .collect()
}

/// True when some processor filter samples flows
fn has_filter_sampling(spec: &FlowCollectorSpec) -> bool {
    spec.processor.filters.iter().any(|f| f.sampling > 1)
}

/// Effective include list: configured or default, minus metrics of disabled features
pub fn include_list(spec: &FlowCollectorSpec) -> Vec<String> {
    let mut list = match &spec.processor.metrics.include_list {
        Some(list) => list.clone(),
        None if spec.loki_enabled() => strings(DEFAULT_INCLUDE_LIST),
        None => strings(DEFAULT_INCLUDE_LIST_LOKI_DISABLED),
    };
    let removals = [
        (!spec.has_feature(AgentFeature::PacketDrop), "_drop_"),
        (!spec.has_feature(AgentFeature::FlowRtt), "_rtt_"),
        (!spec.has_feature(AgentFeature::DnsTracking), "_dns_"),
        (!has_filter_sampling(spec), "_sampling"),
    ];
    for (remove, pattern) in removals {
        if remove {
            list.retain(|m| !m.contains(pattern));
        }
    }
    list
}

/// Predefined metrics selected for this FlowCollector, adjusted to its features
pub fn predefined_definitions(spec: &FlowCollectorSpec) -> Vec<(FlowMetricSpec, bool)> {
    let names = include_list(spec);

    let mut labels_to_remove: Vec<&str> = Vec::new();
    if !spec.zone_enabled() {
        labels_to_remove.extend(["SrcK8S_Zone", "DstK8S_Zone"]);
    }
    if !spec.multi_cluster_enabled() {
        labels_to_remove.push("K8S_ClusterName");
    }

    let record_type = match spec.processor.log_types {
        LogTypes::Flows | LogTypes::EndedConversations => None,
        LogTypes::Conversations => Some("endConnection"),
        LogTypes::All => Some("flowLog"),
    };

    PREDEFINED_METRICS
        .iter()
        .filter(|m| names.contains(&m.spec.metric_name))
        .map(|m| {
            let mut def = m.spec.clone();
            def.labels.retain(|l| !labels_to_remove.contains(&l.as_str()));
            if let Some(value) = record_type {
                def.filters.push(MetricFilter {
                    field: "_RecordType".to_string(),
                    value: value.to_string(),
                    match_type: MatchType::Equal,
                });
            }
            (def, m.gauge)
        })
        .collect()
}

fn filter_type(match_type: MatchType) -> &'static str {
    match match_type {
        MatchType::Equal => "equal",
        MatchType::NotEqual => "not_equal",
        MatchType::Presence => "presence",
        MatchType::Absence => "absence",
        MatchType::MatchRegex => "match_regex",
        MatchType::NotMatchRegex => "not_match_regex",
    }
}

fn filter_params(f: &MetricFilter) -> MetricFilterParams {
    MetricFilterParams {
        key: f.field.clone(),
        value: f.value.clone(),
        filter_type: filter_type(f.match_type).to_string(),
    }
}

/// Explicit filters followed by the implicit duplicate and direction filters
pub fn effective_filters(spec: &FlowMetricSpec) -> Vec<MetricFilterParams> {
    let mut filters: Vec<MetricFilterParams> = spec.filters.iter().map(filter_params).collect();
    if !spec.include_duplicates {
        filters.push(MetricFilterParams {
            key: "Duplicate".to_string(),
            value: "false".to_string(),
            filter_type: filter_type(MatchType::Equal).to_string(),
        });
    }
    let direction = match spec.direction {
        MetricDirection::Any => None,
        MetricDirection::Egress => Some("1|2"),
        MetricDirection::Ingress => Some("0|2"),
    };
    if let Some(pattern) = direction {
        filters.push(MetricFilterParams {
            key: "FlowDirection".to_string(),
            value: pattern.to_string(),
            filter_type: filter_type(MatchType::MatchRegex).to_string(),
        });
    }
    filters
}

fn parse_float(raw: &str) -> Option<f64> {
    raw.parse::<f64>().ok()
}

/// Map a metric definition to the item flowlogs-pipeline evaluates
///
/// `gauge` overrides the declared type for predefined gauges.
pub fn to_metric_item(spec: &FlowMetricSpec, gauge: bool) -> Result<MetricItem> {
    let invalid = |reason: String| OperatorError::InvalidMetric {
        metric: spec.metric_name.clone(),
        reason,
    };

    let metric_type = if gauge {
        "gauge".to_string()
    } else {
        match spec.metric_type {
            FlowMetricType::Counter => "counter".to_string(),
            FlowMetricType::Histogram => "histogram".to_string(),
        }
    };

    let mut buckets = Vec::with_capacity(spec.buckets.len());
    for b in &spec.buckets {
        let value = parse_float(b)
            .ok_or_else(|| invalid(format!("could not parse metric buckets as floats: '{}'", b)))?;
        buckets.push(value);
    }

    let value_scale = match spec.divider.as_deref().filter(|d| !d.is_empty()) {
        Some(d) => Some(
            parse_float(d)
                .ok_or_else(|| invalid(format!("could not parse metric divider as float: '{}'", d)))?,
        ),
        None => None,
    };

    Ok(MetricItem {
        name: spec.metric_name.clone(),
        metric_type,
        filters: effective_filters(spec),
        value_key: spec.value_field.clone().filter(|v| !v.is_empty()),
        labels: spec.labels.clone(),
        remap: spec.remap.clone(),
        flatten: spec.flatten.clone(),
        buckets,
        value_scale,
    })
}

/// All metric items: predefined first, then user metrics in the given order
pub fn metric_items(spec: &FlowCollectorSpec, user: &[FlowMetricSpec]) -> Result<Vec<MetricItem>> {
    let mut items = Vec::new();
    for (def, gauge) in predefined_definitions(spec) {
        items.push(to_metric_item(&def, gauge)?);
    }
    for def in user {
        items.push(to_metric_item(def, false)?);
    }
    Ok(items)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::FilterSet;

    fn create_test_spec() -> FlowCollectorSpec {
        serde_json::from_str("{}").unwrap()
    }

    fn create_test_metric(name: &str) -> FlowMetricSpec {
        base_spec(name.to_string(), vec!["SrcK8S_Namespace".to_string()])
    }

    #[test]
    fn test_catalogue_contents() {
        let names = all_predefined_names();
        assert!(names.contains(&"node_egress_bytes_total".to_string()));
        assert!(names.contains(&"workload_ingress_packets_total".to_string()));
        assert!(names.contains(&"namespace_rtt_seconds".to_string()));
        assert!(names.contains(&"workload_drop_bytes_total".to_string()));
        assert!(names.contains(&"node_dns_latency_seconds".to_string()));
        assert!(names.contains(&"namespace_sampling".to_string()));
        // 3 groups x (4 traffic + sampling + flows + rtt + 2 drops + dns)
        assert_eq!(names.len(), 30);
    }

    #[test]
    fn test_default_include_list_drops_disabled_features() {
        let spec = create_test_spec();
        let list = include_list(&spec);
        assert_eq!(
            list,
            vec![
                "node_ingress_bytes_total",
                "node_egress_bytes_total",
                "workload_ingress_bytes_total",
                "workload_egress_bytes_total",
                "namespace_flows_total",
            ]
        );
    }

    #[test]
    fn test_include_list_with_features() {
        let mut spec = create_test_spec();
        spec.agent.ebpf.features = vec![AgentFeature::FlowRtt, AgentFeature::PacketDrop];
        spec.processor.filters = vec![FilterSet {
            sampling: 10,
            ..Default::default()
        }];
        let list = include_list(&spec);
        assert!(list.contains(&"namespace_rtt_seconds".to_string()));
        assert!(list.contains(&"namespace_drop_packets_total".to_string()));
        assert!(list.contains(&"workload_sampling".to_string()));
        assert!(!list.contains(&"namespace_dns_latency_seconds".to_string()));
    }

    #[test]
    fn test_loki_disabled_include_list() {
        let mut spec = create_test_spec();
        spec.loki.enable = false;
        let list = include_list(&spec);
        assert!(list.contains(&"workload_flows_total".to_string()));
        assert!(list.contains(&"workload_egress_packets_total".to_string()));
    }

    #[test]
    fn test_explicit_empty_include_list() {
        let mut spec = create_test_spec();
        spec.processor.metrics.include_list = Some(vec![]);
        assert!(predefined_definitions(&spec).is_empty());
    }

    #[test]
    fn test_predefined_labels_stripped() {
        let spec = create_test_spec();
        let defs = predefined_definitions(&spec);
        for (def, _) in &defs {
            assert!(!def.labels.contains(&"K8S_ClusterName".to_string()));
            assert!(!def.labels.contains(&"SrcK8S_Zone".to_string()));
        }

        let mut spec = create_test_spec();
        spec.processor.add_zone = true;
        spec.processor.multi_cluster_deployment = true;
        let defs = predefined_definitions(&spec);
        assert!(defs[0].0.labels.contains(&"K8S_ClusterName".to_string()));
        assert!(defs[0].0.labels.contains(&"SrcK8S_Zone".to_string()));
    }

    #[test]
    fn test_record_type_filter_for_conversations() {
        let mut spec = create_test_spec();
        spec.processor.log_types = LogTypes::Conversations;
        let defs = predefined_definitions(&spec);
        let last = defs[0].0.filters.last().unwrap();
        assert_eq!(last.field, "_RecordType");
        assert_eq!(last.value, "endConnection");

        spec.processor.log_types = LogTypes::All;
        let defs = predefined_definitions(&spec);
        assert_eq!(defs[0].0.filters.last().unwrap().value, "flowLog");

        spec.processor.log_types = LogTypes::EndedConversations;
        let defs = predefined_definitions(&spec);
        assert!(defs[0].0.filters.iter().all(|f| f.field != "_RecordType"));
    }

    #[test]
    fn test_counter_with_regex_and_egress() {
        let mut metric = create_test_metric("my_counter");
        metric.filters = vec![MetricFilter {
            field: "DstPort".to_string(),
            value: "^443$".to_string(),
            match_type: MatchType::MatchRegex,
        }];
        metric.direction = MetricDirection::Egress;

        let item = to_metric_item(&metric, false).unwrap();
        assert_eq!(item.metric_type, "counter");
        assert_eq!(
            item.filters,
            vec![
                MetricFilterParams {
                    key: "DstPort".to_string(),
                    value: "^443$".to_string(),
                    filter_type: "match_regex".to_string(),
                },
                MetricFilterParams {
                    key: "Duplicate".to_string(),
                    value: "false".to_string(),
                    filter_type: "equal".to_string(),
                },
                MetricFilterParams {
                    key: "FlowDirection".to_string(),
                    value: "1|2".to_string(),
                    filter_type: "match_regex".to_string(),
                },
            ]
        );
    }

    #[test]
    fn test_include_duplicates_and_ingress() {
        let mut metric = create_test_metric("m");
        metric.include_duplicates = true;
        metric.direction = MetricDirection::Ingress;
        let filters = effective_filters(&metric);
        assert_eq!(filters.len(), 1);
        assert_eq!(filters[0].value, "0|2");
    }

    #[test]
    fn test_histogram_buckets() {
        let mut metric = create_test_metric("my_histo");
        metric.metric_type = FlowMetricType::Histogram;
        metric.buckets = strings(&["1", "5", "10", "50", "100"]);
        metric.divider = Some("1000".to_string());
        let item = to_metric_item(&metric, false).unwrap();
        assert_eq!(item.metric_type, "histogram");
        assert_eq!(item.buckets, vec![1.0, 5.0, 10.0, 50.0, 100.0]);
        assert_eq!(item.value_scale, Some(1000.0));
    }

    #[test]
    fn test_bad_bucket_names_metric() {
        let mut metric = create_test_metric("my_histo");
        metric.metric_type = FlowMetricType::Histogram;
        metric.buckets = strings(&["x"]);
        let err = to_metric_item(&metric, false).unwrap_err();
        match &err {
            OperatorError::InvalidMetric { metric, reason } => {
                assert_eq!(metric, "my_histo");
                assert!(reason.contains("'x'"));
            }
            other => panic!("unexpected error {:?}", other),
        }
        assert!(err.to_string().contains("my_histo"));
    }

    #[test]
    fn test_bucket_with_whitespace_rejected() {
        let mut metric = create_test_metric("my_histo");
        metric.metric_type = FlowMetricType::Histogram;
        metric.buckets = strings(&["1", " 5"]);
        let err = to_metric_item(&metric, false).unwrap_err();
        assert!(err.to_string().contains("' 5'"));
    }

    #[test]
    fn test_bad_divider() {
        let mut metric = create_test_metric("m");
        metric.divider = Some("ten".to_string());
        assert!(to_metric_item(&metric, false).is_err());
    }

    #[test]
    fn test_sampling_is_gauge() {
        let mut spec = create_test_spec();
        spec.processor.metrics.include_list = Some(vec!["workload_sampling".to_string()]);
        spec.processor.filters = vec![FilterSet {
            sampling: 2,
            ..Default::default()
        }];
        let items = metric_items(&spec, &[]).unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].metric_type, "gauge");
        assert_eq!(items[0].value_key.as_deref(), Some("Sampling"));
    }

    #[test]
    fn test_user_metrics_follow_predefined() {
        let spec = create_test_spec();
        let items = metric_items(&spec, &[create_test_metric("custom")]).unwrap();
        assert_eq!(items.last().unwrap().name, "custom");
        assert_eq!(items.len(), include_list(&spec).len() + 1);
    }
}
