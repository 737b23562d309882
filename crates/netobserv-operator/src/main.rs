//! Network Observability Kubernetes Operator
//!
//! This operator reconciles the FlowCollector custom resource, deploying and
//! configuring flowlogs-pipeline for the network flow collection stack.

use anyhow::{Context, Result};
use clap::Parser;
use kube::Client;
use netobserv_operator::controller;
use netobserv_operator::crd::{FlowCollector, FlowMetric};
use netobserv_operator::flp::FlpConfig;
use std::net::SocketAddr;
use tokio_util::sync::CancellationToken;
use tracing::{info, Level};
use tracing_subscriber::fmt::format::FmtSpan;

/// Network Observability Kubernetes Operator
#[derive(Parser, Debug)]
#[command(name = "netobserv-operator")]
#[command(about = "Kubernetes operator for the network observability flow collection stack")]
#[command(version)]
struct Args {
    /// Metrics server address
    #[arg(long, env = "METRICS_ADDR", default_value = "0.0.0.0:8080")]
    metrics_addr: SocketAddr,

    /// Health probe address
    #[arg(long, env = "HEALTH_ADDR", default_value = "0.0.0.0:8081")]
    health_addr: SocketAddr,

    /// Namespace used until a FlowCollector sets one
    #[arg(long, env = "NAMESPACE", default_value = "netobserv")]
    namespace: String,

    /// flowlogs-pipeline image
    #[arg(
        long,
        env = "RELATED_IMAGE_FLOWLOGS_PIPELINE",
        default_value = "quay.io/netobserv/flowlogs-pipeline:main"
    )]
    flowlogs_pipeline_image: String,

    /// Cluster identifier added to flows in multi-cluster deployments
    #[arg(long, env = "CLUSTER_ID")]
    cluster_id: Option<String>,

    /// Disable ServiceMonitor and PrometheusRule management, for clusters
    /// without the Prometheus operator
    #[arg(long, env = "DISABLE_MONITORING", default_value = "false")]
    disable_monitoring: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: Level,

    /// Enable JSON log format
    #[arg(long, env = "LOG_JSON", default_value = "false")]
    log_json: bool,

    /// Print CRD YAML and exit
    #[arg(long)]
    print_crd: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Handle CRD printing
    if args.print_crd {
        print_crd()?;
        return Ok(());
    }

    // Initialize logging
    init_logging(&args)?;

    info!(
        version = env!("CARGO_PKG_VERSION"),
        namespace = %args.namespace,
        image = %args.flowlogs_pipeline_image,
        "Starting Network Observability Operator"
    );

    // Initialize metrics
    let metrics_addr = args.metrics_addr;
    tokio::spawn(async move {
        if let Err(e) = start_metrics_server(metrics_addr).await {
            tracing::error!(error = %e, "Metrics server failed");
        }
    });

    // Start health server
    let health_addr = args.health_addr;
    tokio::spawn(async move {
        if let Err(e) = start_health_server(health_addr).await {
            tracing::error!(error = %e, "Health server failed");
        }
    });

    // Create Kubernetes client
    let client = Client::try_default()
        .await
        .context("Failed to create Kubernetes client")?;

    let cancel = CancellationToken::new();
    let shutdown = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Shutdown requested");
            shutdown.cancel();
        }
    });

    let config = FlpConfig {
        image: args.flowlogs_pipeline_image,
        cluster_id: args.cluster_id,
        monitoring: !args.disable_monitoring,
    };

    // Run the controller until the watch streams end or shutdown is requested
    tokio::select! {
        result = controller::run_controller(client, config, args.namespace, cancel.clone()) => {
            result.context("Controller failed")?;
        }
        _ = cancel.cancelled() => {}
    }

    Ok(())
}

/// Initialize logging subsystem
fn init_logging(args: &Args) -> Result<()> {
    let subscriber = tracing_subscriber::fmt()
        .with_max_level(args.log_level)
        .with_span_events(FmtSpan::CLOSE)
        .with_target(true)
        .with_thread_ids(false)
        .with_line_number(false);

    if args.log_json {
        subscriber.json().init();
    } else {
        subscriber.init();
    }

    Ok(())
}

/// Start the Prometheus metrics server
async fn start_metrics_server(addr: SocketAddr) -> Result<()> {
    use metrics_exporter_prometheus::PrometheusBuilder;

    info!(address = %addr, "Starting metrics server");

    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .context("Failed to install Prometheus exporter")?;

    // Keep the server running
    std::future::pending::<()>().await;

    Ok(())
}

/// Start the health probe server
async fn start_health_server(addr: SocketAddr) -> Result<()> {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    info!(address = %addr, "Starting health server");

    let listener = TcpListener::bind(addr)
        .await
        .context("Failed to bind health server")?;

    loop {
        let (mut socket, _) = listener.accept().await?;

        tokio::spawn(async move {
            let mut buf = [0; 1024];
            if socket.read(&mut buf).await.is_ok() {
                let response = "HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nOK";
                let _ = socket.write_all(response.as_bytes()).await;
            }
        });
    }
}

/// Print both CRDs as a multi-document YAML stream
fn print_crd() -> Result<()> {
    use kube::CustomResourceExt;

    for crd in [FlowCollector::crd(), FlowMetric::crd()] {
        println!("---");
        print!("{}", serde_yaml::to_string(&crd)?);
    }

    Ok(())
}
