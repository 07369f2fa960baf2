//! devgate Transport Node
//!
//! Runs the transport service for one node:
//! 1. Loads configuration and initializes logging and metrics
//! 2. Wires the queue endpoints and the transport API backend
//! 3. Starts the notification consumer and periodic tasks
//! 4. Shuts down cleanly on Ctrl+C

use anyhow::Context;
use devgate_common::msg::{ToCoreMsg, ToRuleEngineMsg, ToTransportMsg, TransportApiRequest, TransportApiResponse};
use devgate_common::queue::{InMemoryQueue, RequestTemplate, TopicPartitionInfo};
use devgate_common::{config::AppConfig, metrics, SystemClock, VERSION};
use devgate_transport::{QueueTransportApi, TransportQueues, TransportService};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

fn main() -> anyhow::Result<()> {
    // Load environment variables
    dotenvy::dotenv().ok();

    let config = AppConfig::load().context("Failed to load configuration")?;
    init_tracing(&config);

    info!("Starting devgate transport node v{}", VERSION);

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(config.executor.scheduler_threads.max(1))
        .thread_name("transport-scheduler")
        .enable_all()
        .build()
        .context("Failed to build runtime")?;

    runtime.block_on(run(Arc::new(config)))
}

fn init_tracing(config: &AppConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.observability.log_level));
    let builder = tracing_subscriber::fmt().with_env_filter(filter).with_target(true);
    if config.observability.json_logging {
        builder.json().init();
    } else {
        builder.init();
    }
}

async fn run(config: Arc<AppConfig>) -> anyhow::Result<()> {
    // Initialize metrics
    if config.observability.metrics_port > 0 {
        let addr = SocketAddr::from(([0, 0, 0, 0], config.observability.metrics_port));
        PrometheusBuilder::new()
            .with_http_listener(addr)
            .install()
            .context("Failed to install Prometheus exporter")?;
        info!(%addr, "Metrics exporter listening");
    }
    metrics::register_metrics();

    // In-process broker; every stage attached to this node shares it
    let core_queue: InMemoryQueue<ToCoreMsg> = InMemoryQueue::new();
    let rule_engine_queue: InMemoryQueue<ToRuleEngineMsg> = InMemoryQueue::new();
    let notifications_queue: InMemoryQueue<ToTransportMsg> = InMemoryQueue::new();
    let api_requests: InMemoryQueue<TransportApiRequest> = InMemoryQueue::new();
    let api_responses: InMemoryQueue<TransportApiResponse> = InMemoryQueue::new();

    let template = Arc::new(RequestTemplate::new(
        Arc::new(api_requests.producer(config.queue.api_requests_topic.clone())),
        Arc::new(api_responses.consumer(config.api_responses_topic(), config.queue.max_poll_records)),
        TopicPartitionInfo::new(config.queue.api_requests_topic.clone(), None),
        config.api_request_timeout(),
        config.poll_interval(),
    ));
    let api = Arc::new(QueueTransportApi::new(template));

    let cancel = CancellationToken::new();
    let api_task = {
        let api = api.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move { api.run(cancel).await })
    };

    let service = TransportService::new(
        config.clone(),
        api,
        TransportQueues {
            core: Arc::new(core_queue.producer(config.queue.core_topic.clone())),
            rule_engine: Arc::new(rule_engine_queue.producer(config.queue.rule_engine_topic.clone())),
            notifications: Arc::new(
                notifications_queue.consumer(config.notifications_topic(), config.queue.max_poll_records),
            ),
        },
        Arc::new(SystemClock),
    )?;
    service.init();

    info!(
        service_id = %config.service.service_id,
        notifications = %config.notifications_topic(),
        "Transport node ready"
    );

    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("Shutdown signal received"),
        Err(e) => warn!(error = %e, "Failed to listen for shutdown signal"),
    }

    service.shutdown().await;
    cancel.cancel();
    if let Err(e) = api_task.await {
        warn!(error = %e, "Transport API consumer failed");
    }

    info!("Transport node stopped");
    Ok(())
}
