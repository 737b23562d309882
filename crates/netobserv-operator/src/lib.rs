//! # Network Observability Kubernetes Operator
//!
//! Kubernetes operator deploying the network flow collection stack: eBPF or
//! IPFIX agents feed flows to flowlogs-pipeline, which enriches them and
//! writes them to Loki, Prometheus metrics, Kafka or IPFIX exporters.
//!
//! The operator reconciles one cluster-scoped `FlowCollector` named
//! `cluster`, plus namespaced `FlowMetric` resources declaring custom
//! metrics.
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use netobserv_operator::prelude::*;
//! use kube::Client;
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let client = Client::try_default().await?;
//!     run_controller(client, FlpConfig::default(), "netobserv".into(), CancellationToken::new())
//!         .await
//! }
//! ```
//!
//! ## Architecture
//!
//! 1. **Compile**: the FlowCollector and the FlowMetrics are compiled into a
//!    flowlogs-pipeline configuration per [`topology::Topology`]
//! 2. **Build**: [`resources`] turns the configuration into manifests
//! 3. **Compare**: [`comparators`] decides between create, update and no-op
//! 4. **Write**: [`reconcilers`] issues the writes through an
//!    [`store::ObjectStore`]
//! 5. **Status**: [`status`] aggregates the component states into the
//!    FlowCollector conditions
//!
//! ## Modules
//!
//! - [`crd`] - Custom Resource Definition types with validation
//! - [`pipeline`] - flowlogs-pipeline configuration compiler
//! - [`topology`] - deployment topologies of the pipeline
//! - [`resources`] - Kubernetes resource builders
//! - [`comparators`] - change detection and content digests
//! - [`managed`] - registry of the objects owned by a component
//! - [`watcher`] - certificate and secret watcher
//! - [`status`] - component status aggregation
//! - [`store`] - Kubernetes API access
//! - [`reconcilers`] - create-or-update helpers
//! - [`flp`] - per-topology reconcilers
//! - [`controller`] - FlowCollector controller setup
//! - [`error`] - Error types for operator operations
//!
//! ## Custom Resource Definitions
//!
//! ### FlowCollector
//!
//! ```yaml
//! apiVersion: flows.netobserv.io/v1beta2
//! kind: FlowCollector
//! metadata:
//!   name: cluster
//! spec:
//!   namespace: netobserv
//!   deploymentModel: Kafka
//!   agent:
//!     type: eBPF
//!   kafka:
//!     address: kafka-cluster-kafka-bootstrap.netobserv
//!     topic: network-flows
//!   loki:
//!     enable: true
//! ```
//!
//! ### FlowMetric
//!
//! ```yaml
//! apiVersion: flows.netobserv.io/v1alpha1
//! kind: FlowMetric
//! metadata:
//!   name: flows-by-port
//!   namespace: netobserv
//! spec:
//!   metricName: flows_by_port_total
//!   type: Counter
//!   labels: [DstPort]
//!   filters:
//!     - field: Proto
//!       value: "6"
//! ```
//!
//! ## Metrics
//!
//! The operator exposes Prometheus metrics:
//!
//! - `netobserv_operator_reconciliations_total` - Total reconciliation attempts
//! - `netobserv_operator_reconciliation_errors_total` - Reconciliation errors
//! - `netobserv_operator_reconciliation_duration_seconds` - Reconciliation latency

pub mod comparators;
pub mod controller;
pub mod crd;
pub mod error;
pub mod flp;
pub mod managed;
pub mod pipeline;
pub mod reconcilers;
pub mod resources;
pub mod status;
pub mod store;
pub mod topology;
pub mod watcher;

pub mod prelude {
    //! Re-exports for convenient usage
    pub use crate::controller::{
        run_controller, ControllerContext, ControllerMetrics, FlowCollectorReconciler,
    };
    pub use crate::crd::{
        DeploymentModel, FlowCollector, FlowCollectorSpec, FlowCollectorStatus, FlowMetric,
        FlowMetricSpec, FLOW_COLLECTOR_NAME,
    };
    pub use crate::error::{OperatorError, Result};
    pub use crate::flp::FlpConfig;
    pub use crate::pipeline::{compile, CompiledPipeline, PipelineContext};
    pub use crate::resources::ResourceBuilder;
    pub use crate::status::{Component, StatusManager};
    pub use crate::store::{KubeStore, ObjectStore};
    pub use crate::topology::Topology;
}
