//! Media job worker binary.
//!
//! Usage: `mediaflow-worker <downloader|transcoder>`

use std::sync::Arc;

use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use mediaflow_media::{FfmpegEncoder, FfprobeInspector};
use mediaflow_models::ProfileCatalog;
use mediaflow_queue::{ConsumerConfig, QueueConsumer, RedisWorkQueue, WorkQueue};
use mediaflow_storage::ObjectStoreClient;
use mediaflow_store::StoreBackend;
use mediaflow_worker::{
    action_for_role, metrics, JobHandler, PipelineExecutor, SlackNotifier, WorkerConfig,
    WorkerResult,
};

#[tokio::main]
async fn main() {
    // Install rustls crypto provider (required for TLS/HTTPS)
    rustls::crypto::ring::default_provider()
        .install_default()
        .expect("Failed to install rustls crypto provider");

    // Load environment variables
    dotenvy::dotenv().ok();

    // Initialize tracing with colored output for dev, JSON for production
    let use_json = std::env::var("LOG_FORMAT")
        .map(|v| v.to_lowercase() == "json")
        .unwrap_or(false);

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("mediaflow=info,aws_config=warn"));

    if use_json {
        tracing_subscriber::registry()
            .with(fmt::layer().json())
            .with(env_filter)
            .init();
    } else {
        tracing_subscriber::registry()
            .with(
                fmt::layer()
                    .with_ansi(true)
                    .with_target(true)
                    .with_thread_ids(false)
                    .with_file(false)
                    .with_line_number(false),
            )
            .with(env_filter)
            .init();
    }

    let role = std::env::args().nth(1).unwrap_or_default();
    if let Err(e) = run(&role).await {
        error!("Worker error: {}", e);
        std::process::exit(1);
    }

    info!("Worker shutdown complete");
}

async fn run(role: &str) -> WorkerResult<()> {
    let action = action_for_role(role)?;
    let config = WorkerConfig::from_env();
    let queue_name = config.queue_name(action)?;
    info!("Starting mediaflow-worker as {} on queue '{}'", role, queue_name);
    info!("Worker config: {:?}", config);

    metrics::init_exporter(config.metrics_port)?;

    let profiles = match &config.profiles_path {
        Some(path) => ProfileCatalog::from_file(path)?,
        None => ProfileCatalog::builtin(),
    };
    info!("Loaded {} encode profiles", profiles.len());

    let store = StoreBackend::from_env()?.connect()?;
    let queue = Arc::new(RedisWorkQueue::from_env()?);
    let storage = Arc::new(ObjectStoreClient::from_env().await?);
    let notifier = Arc::new(SlackNotifier::new(config.slack_webhook_url.clone())?);

    let executor = PipelineExecutor::new(
        store,
        storage,
        Arc::new(FfprobeInspector),
        Arc::new(FfmpegEncoder),
        notifier,
        Arc::new(profiles),
        &config,
    );
    let handler = Arc::new(JobHandler::new(Arc::new(executor)));

    let consumer = Arc::new(QueueConsumer::new(
        Arc::clone(&queue) as Arc<dyn WorkQueue>,
        ConsumerConfig::from_env(),
    ));

    // Setup signal handler
    let signal_consumer = Arc::clone(&consumer);
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("Received shutdown signal");
        signal_consumer.shutdown();
    });

    if config.oneshot {
        let served = consumer.consume_one(&queue_name, handler).await?;
        info!(
            job_name = config.job_name.as_deref().unwrap_or("-"),
            served, "Oneshot worker finished"
        );
        if config.is_dedicated() {
            queue.retire(&queue_name).await?;
        }
    } else {
        consumer
            .consume(&queue_name, config.concurrency, handler)
            .await?;
    }
    Ok(())
}
