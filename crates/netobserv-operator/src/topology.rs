//! Deployment topologies of flowlogs-pipeline
//!
//! A deployment model resolves to one or more topologies. Each topology owns
//! a fixed set of object names and one status component.

use crate::crd::{DeploymentModel, FlowCollectorSpec};
use crate::status::Component;
use std::fmt;

pub const FLP_NAME: &str = "flowlogs-pipeline";
pub const FLP_TRANSFORMER_NAME: &str = "flowlogs-pipeline-transformer";
pub const FLP_INGESTER_NAME: &str = "flowlogs-pipeline-ingester";
pub const EBPF_AGENT_NAME: &str = "netobserv-ebpf-agent";

/// Kind of workload running a topology
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkloadKind {
    DaemonSet,
    Deployment,
}

/// How flowlogs-pipeline is deployed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Topology {
    /// One DaemonSet ingesting, enriching and writing flows
    Monolith,
    /// Deployment consuming flows from Kafka
    KafkaTransformer,
    /// DaemonSet collecting IPFIX and writing to Kafka
    KafkaIngester,
    /// Pipeline embedded in the eBPF agent
    InProcess,
}

impl Topology {
    pub const ALL: [Topology; 4] = [
        Topology::Monolith,
        Topology::KafkaTransformer,
        Topology::KafkaIngester,
        Topology::InProcess,
    ];

    /// Application name, used as object name and `app` label
    pub fn app_name(&self) -> &'static str {
        match self {
            Topology::Monolith => FLP_NAME,
            Topology::KafkaTransformer => FLP_TRANSFORMER_NAME,
            Topology::KafkaIngester => FLP_INGESTER_NAME,
            Topology::InProcess => EBPF_AGENT_NAME,
        }
    }

    pub fn component(&self) -> Component {
        match self {
            Topology::Monolith => Component::Monolith,
            Topology::KafkaTransformer => Component::Transformer,
            Topology::KafkaIngester => Component::Ingester,
            Topology::InProcess => Component::InProcess,
        }
    }

    /// Workload created by the operator; the in-process pipeline has none
    pub fn workload_kind(&self) -> Option<WorkloadKind> {
        match self {
            Topology::Monolith | Topology::KafkaIngester => Some(WorkloadKind::DaemonSet),
            Topology::KafkaTransformer => Some(WorkloadKind::Deployment),
            Topology::InProcess => None,
        }
    }

    /// Whether the topology receives flows directly from agents
    pub fn ingests_from_agents(&self) -> bool {
        matches!(self, Topology::Monolith | Topology::KafkaIngester)
    }

    /// Whether the topology runs the full enrichment pipeline
    pub fn processes_flows(&self) -> bool {
        !matches!(self, Topology::KafkaIngester)
    }

    /// Whether this topology is required by the FlowCollector
    pub fn is_active(&self, spec: &FlowCollectorSpec) -> bool {
        match self {
            Topology::Monolith => match spec.deployment_model {
                DeploymentModel::Direct => true,
                // IPFIX agents cannot embed the pipeline
                DeploymentModel::Embedded => spec.uses_ipfix(),
                DeploymentModel::Kafka => false,
            },
            Topology::KafkaTransformer => spec.uses_kafka(),
            Topology::KafkaIngester => spec.uses_kafka() && spec.uses_ipfix(),
            Topology::InProcess => {
                spec.deployment_model == DeploymentModel::Embedded && spec.uses_ebpf()
            }
        }
    }

    /// Status message reported when the topology is not active
    pub fn unused_message(&self) -> &'static str {
        match self {
            Topology::Monolith => "Monolith is only used with the Direct deployment model",
            Topology::KafkaTransformer => {
                "Transformer is only used with the Kafka deployment model"
            }
            Topology::KafkaIngester => {
                "Ingester is only used with the Kafka deployment model and the IPFIX agent"
            }
            Topology::InProcess => {
                "In-process pipeline is only used with the Embedded deployment model and the eBPF agent"
            }
        }
    }

    /// Namespace the topology's objects live in
    pub fn namespace(&self, spec: &FlowCollectorSpec) -> String {
        match self {
            Topology::InProcess => spec.privileged_namespace(),
            _ => spec.namespace.clone(),
        }
    }

    /// Namespace of the topology for a given base namespace
    pub fn namespace_in(&self, base: &str) -> String {
        match self {
            Topology::InProcess => format!("{}-privileged", base),
            _ => base.to_string(),
        }
    }

    /// Topologies required by the FlowCollector
    pub fn active(spec: &FlowCollectorSpec) -> Vec<Topology> {
        Self::ALL.into_iter().filter(|t| t.is_active(spec)).collect()
    }

    pub fn config_map_name(&self) -> String {
        format!("{}-config", self.app_name())
    }

    pub fn prom_service_name(&self) -> String {
        format!("{}-prom", self.app_name())
    }

    pub fn service_monitor_name(&self) -> String {
        format!("{}-monitor", self.app_name())
    }

    pub fn prometheus_rule_name(&self) -> String {
        format!("{}-alert", self.app_name())
    }

    /// Secret holding the metrics server certificate in `Auto` TLS mode
    pub fn prom_tls_secret_name(&self) -> String {
        format!("{}-prom-tls", self.app_name())
    }

    pub fn service_account_name(&self) -> &'static str {
        self.app_name()
    }

    pub fn cluster_role_binding_name(&self) -> String {
        format!("{}-role", self.app_name())
    }

    pub fn cluster_role_name(&self) -> &'static str {
        FLP_NAME
    }
}

impl fmt::Display for Topology {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Topology::Monolith => "monolith",
            Topology::KafkaTransformer => "transformer",
            Topology::KafkaIngester => "ingester",
            Topology::InProcess => "in-process",
        };
        f.write_str(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::AgentType;

    fn create_test_spec(model: DeploymentModel, agent: AgentType) -> FlowCollectorSpec {
        let mut spec: FlowCollectorSpec = serde_json::from_str("{}").unwrap();
        spec.deployment_model = model;
        spec.agent.agent_type = agent;
        spec
    }

    #[test]
    fn test_direct_uses_monolith() {
        let spec = create_test_spec(DeploymentModel::Direct, AgentType::Ebpf);
        assert_eq!(Topology::active(&spec), vec![Topology::Monolith]);
    }

    #[test]
    fn test_kafka_with_ebpf_uses_transformer_only() {
        let spec = create_test_spec(DeploymentModel::Kafka, AgentType::Ebpf);
        assert_eq!(Topology::active(&spec), vec![Topology::KafkaTransformer]);
    }

    #[test]
    fn test_kafka_with_ipfix_adds_ingester() {
        let spec = create_test_spec(DeploymentModel::Kafka, AgentType::Ipfix);
        assert_eq!(
            Topology::active(&spec),
            vec![Topology::KafkaTransformer, Topology::KafkaIngester]
        );
    }

    #[test]
    fn test_embedded() {
        let spec = create_test_spec(DeploymentModel::Embedded, AgentType::Ebpf);
        assert_eq!(Topology::active(&spec), vec![Topology::InProcess]);
        assert_eq!(
            Topology::InProcess.namespace(&spec),
            "netobserv-privileged"
        );

        let spec = create_test_spec(DeploymentModel::Embedded, AgentType::Ipfix);
        assert_eq!(Topology::active(&spec), vec![Topology::Monolith]);
    }

    #[test]
    fn test_object_names() {
        assert_eq!(Topology::Monolith.config_map_name(), "flowlogs-pipeline-config");
        assert_eq!(
            Topology::KafkaTransformer.prom_service_name(),
            "flowlogs-pipeline-transformer-prom"
        );
        assert_eq!(
            Topology::KafkaIngester.service_monitor_name(),
            "flowlogs-pipeline-ingester-monitor"
        );
        assert_eq!(Topology::Monolith.prometheus_rule_name(), "flowlogs-pipeline-alert");
        assert_eq!(
            Topology::KafkaTransformer.workload_kind(),
            Some(WorkloadKind::Deployment)
        );
        assert_eq!(Topology::InProcess.workload_kind(), None);
    }
}
