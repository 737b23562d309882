//! Filter rules derived from the FlowCollector processor settings

use super::stages::{FilterRule, GenericRule, KeepEntryRule, KeepEntryType, TransformFilter};
use crate::crd::{FilterMatch, FilterSet, FilterTarget, FlowCollectorSpec, MatchType};

/// Field holding the cluster name in multi-cluster deployments
pub const CLUSTER_NAME_FIELD: &str = "K8S_ClusterName";

/// Field used by flowlogs-pipeline to account for sampling
pub const SAMPLING_FIELD: &str = "Sampling";

/// IPFIX fields produced by OVS / goflow that nothing downstream reads
const OVS_GOFLOW_UNUSED_FIELDS: &[&str] = &[
    "BiFlowDirection",
    "CustomBytes_1",
    "CustomBytes_2",
    "CustomBytes_3",
    "CustomBytes_4",
    "CustomBytes_5",
    "CustomInteger_1",
    "CustomInteger_2",
    "CustomInteger_3",
    "CustomInteger_4",
    "CustomInteger_5",
    "CustomList_1",
    "DstAS",
    "DstNet",
    "DstVlan",
    "EgressVrfID",
    "ForwardingStatus",
    "FragmentId",
    "FragmentOffset",
    "HasMPLS",
    "IPTTL",
    "IPTos",
    "IPv6FlowLabel",
    "IngressVrfID",
    "MPLS1Label",
    "MPLS1TTL",
    "MPLS2Label",
    "MPLS2TTL",
    "MPLS3Label",
    "MPLS3TTL",
    "MPLSCount",
    "MPLSLastLabel",
    "MPLSLastTTL",
    "NextHop",
    "NextHopAS",
    "SamplerAddress",
    "SequenceNum",
    "SrcAS",
    "SrcNet",
    "SrcVlan",
    "VlanId",
];

/// Rules of the optional `filter` stage placed right after ingest
pub fn preprocessing_rules(spec: &FlowCollectorSpec, cluster_id: Option<&str>) -> Vec<FilterRule> {
    let mut rules = Vec::new();
    if spec.multi_cluster_enabled() {
        let cluster_name = if spec.processor.cluster_name.is_empty() {
            cluster_id.unwrap_or_default()
        } else {
            spec.processor.cluster_name.as_str()
        };
        if !cluster_name.is_empty() {
            rules.push(FilterRule::AddFieldIfDoesntExist {
                add_field_if_doesnt_exist: GenericRule::with_value(CLUSTER_NAME_FIELD, cluster_name),
            });
        }
    }
    if spec.processor.drop_unused_fields && spec.uses_ipfix() {
        rules.extend(OVS_GOFLOW_UNUSED_FIELDS.iter().map(|f| FilterRule::RemoveField {
            remove_field: GenericRule::field(f),
        }));
    }
    rules
}

/// Build the filter stage for the rule sets that declare `target`
///
/// Returns `None` when no rule set targets it.
pub fn user_filter(sets: &[FilterSet], target: FilterTarget) -> Option<TransformFilter> {
    let rules: Vec<FilterRule> = sets
        .iter()
        .filter(|s| s.output_target == target)
        .map(rule_set_to_rule)
        .collect();
    if rules.is_empty() {
        return None;
    }
    Some(TransformFilter {
        rules,
        sampling_field: Some(SAMPLING_FIELD.to_string()),
    })
}

fn rule_set_to_rule(set: &FilterSet) -> FilterRule {
    FilterRule::KeepEntryAllSatisfied {
        keep_entry_all_satisfied: set.all_of.iter().map(predicate).collect(),
        keep_entry_sampling: (set.sampling > 1).then(|| set.sampling.min(u16::MAX as i32) as u16),
    }
}

fn predicate(m: &FilterMatch) -> KeepEntryRule {
    let rule_type = match m.match_type {
        MatchType::Equal => KeepEntryType::KeepEntryIfEqual,
        MatchType::NotEqual => KeepEntryType::KeepEntryIfNotEqual,
        MatchType::Presence => KeepEntryType::KeepEntryIfExists,
        MatchType::Absence => KeepEntryType::KeepEntryIfDoesntExist,
        MatchType::MatchRegex => KeepEntryType::KeepEntryIfRegexMatch,
        MatchType::NotMatchRegex => KeepEntryType::KeepEntryIfNotRegexMatch,
    };
    let keep_entry = match m.match_type {
        MatchType::Presence | MatchType::Absence => GenericRule::field(&m.field),
        _ => GenericRule::with_value(&m.field, m.value.as_str()),
    };
    KeepEntryRule {
        rule_type,
        keep_entry,
    }
}
