//! Dispatcher binary: Pub/Sub ingress in front of the work queues.

use std::sync::Arc;

use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use mediaflow_dispatcher::{
    metrics, DispatchResult, DispatcherConfig, IngestionRouter, Ingress, PubSubClient,
};
use mediaflow_provisioner::{InClusterClient, Provisioner, ProvisionerConfig, ResourceTier};
use mediaflow_queue::RedisWorkQueue;
use mediaflow_store::StoreBackend;

#[tokio::main]
async fn main() {
    // Load environment variables
    dotenvy::dotenv().ok();

    // Install rustls crypto provider (required for rustls 0.23+)
    rustls::crypto::ring::default_provider()
        .install_default()
        .expect("Failed to install rustls crypto provider");

    // Initialize tracing with colored output for dev, JSON for production
    let use_json = std::env::var("LOG_FORMAT")
        .map(|v| v.to_lowercase() == "json")
        .unwrap_or(false);

    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("mediaflow=info"));

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

    info!("Starting mediaflow-dispatcher");

    if let Err(e) = run().await {
        error!("Dispatcher error: {}", e);
        std::process::exit(1);
    }

    info!("Dispatcher shutdown complete");
}

async fn run() -> DispatchResult<()> {
    let config = DispatcherConfig::from_env();
    info!("Dispatcher config: {:?}", config);

    metrics::init_exporter(config.metrics_port)?;

    let store = StoreBackend::from_env()?.connect()?;
    let queue = Arc::new(RedisWorkQueue::from_env()?);
    let mut router = IngestionRouter::new(store, queue);

    if let Some(provisioner) = provisioner().await {
        router = router.with_provisioner(provisioner, ResourceTier::from_env());
    }

    let client = PubSubClient::new(config.pubsub.clone())?;
    let ingress = Arc::new(Ingress::new(
        client,
        Arc::new(router),
        config.concurrency,
        config.idle_backoff,
    ));

    // Setup signal handler
    let signal_ingress = Arc::clone(&ingress);
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("Received shutdown signal");
        signal_ingress.shutdown();
    });

    ingress.run().await;
    Ok(())
}

/// Dedicated-worker provisioning, when enabled and credentials are present.
async fn provisioner() -> Option<Arc<Provisioner>> {
    let config = ProvisionerConfig::from_env();
    if !config.enabled {
        info!("Worker provisioning disabled");
        return None;
    }

    match InClusterClient::from_env().await {
        Ok(client) => {
            info!(namespace = %config.namespace, image = %config.image, "Worker provisioning enabled");
            Some(Arc::new(Provisioner::new(Arc::new(client), config)))
        }
        Err(e) => {
            warn!("Worker provisioning unavailable, transcodes use the shared pool: {}", e);
            None
        }
    }
}
