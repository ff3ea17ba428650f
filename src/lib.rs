pub mod catalog;
pub mod config;
pub mod errors;
pub mod forwarder;
pub mod queue;
pub mod receiver;
pub mod rules;
pub mod store;
pub mod supervisor;

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing_subscriber::{self, prelude::*, EnvFilter};

use crate::catalog::Catalog;
use crate::config::GatewayConfig;
use crate::forwarder::ForwarderWorker;
use crate::queue::JobQueue;
use crate::receiver::ReceiverService;
use crate::store::ObjectStore;
use crate::supervisor::Supervisor;
use dimse::StoreScp;

pub async fn run(config: GatewayConfig) {
    let config = Arc::new(config);

    // Initialise logging
    let filter = || {
        EnvFilter::try_new(&config.logging.log_level)
            .unwrap_or_else(|_| EnvFilter::new("info"))
    };
    if config.logging.log_to_file {
        let file_appender = tracing_subscriber::fmt::layer()
            .with_file(true)
            .with_line_number(true)
            .with_writer(std::fs::File::create(&config.logging.log_file_path).unwrap());

        let stdout_appender = tracing_subscriber::fmt::layer()
            .with_file(true)
            .with_line_number(true);

        tracing_subscriber::registry()
            .with(filter())
            .with(file_appender)
            .with(stdout_appender)
            .try_init()
            .expect("Failed to initialise logging");
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter())
            .with_file(true)
            .with_line_number(true)
            .init();
    }

    tracing::info!("🔧 Starting gantry '{}'", config.gateway.instance_id);

    // One identity per process run; leases and the scratch partition hang
    // off it.
    let worker_id = supervisor::worker_identity(&config.gateway.instance_id);

    let catalog = Arc::new(
        Catalog::connect(&config.database)
            .await
            .expect("Failed to connect to the catalog database"),
    );
    let store = Arc::new(
        ObjectStore::open(&config.storage.data_root, &worker_id)
            .expect("Failed to open the object store"),
    );
    let queue = Arc::new(JobQueue::new(
        catalog.pool().clone(),
        config.forwarder.queue_settings(),
    ));

    let shutdown = CancellationToken::new();
    let mut handles = Vec::new();

    // Receiver (SCP)
    let receiver = ReceiverService::new(store.clone(), catalog.clone());
    let scp = StoreScp::new(config.scp.clone(), receiver);
    let listener = scp.bind().await.expect("Failed to bind the DIMSE listener");
    {
        let shutdown = shutdown.clone();
        handles.push(tokio::spawn(async move {
            if let Err(e) = scp.run(listener, shutdown).await {
                tracing::error!("SCP terminated with error: {}", e);
            }
        }));
    }

    // Forwarder workers (SCU)
    for index in 0..config.forwarder.workers {
        let worker = ForwarderWorker::new(
            format!("{worker_id}-fwd{index}"),
            &config.scp.local_aet,
            queue.clone(),
            catalog.clone(),
            store.clone(),
            config.forwarder.clone(),
        );
        tracing::info!("🚀 Started forwarder worker '{}'", worker.worker_id());
        handles.push(tokio::spawn(worker.run(shutdown.clone())));
    }

    // Supervisor
    let supervisor = Supervisor::new(
        queue.clone(),
        store.clone(),
        config.supervisor.clone(),
        config.storage.sweep_horizon(),
    );
    handles.push(tokio::spawn(supervisor.run(shutdown.clone())));

    tracing::info!("✓ All components started. Press Ctrl+C to shutdown.");
    tokio::signal::ctrl_c()
        .await
        .expect("Failed to listen for ctrl-c signal");

    tracing::info!("⏳ Shutting down...");
    shutdown.cancel();

    // Drain: in-flight jobs get the configured deadline, then the process
    // leaves and lease recovery hands their work to another worker.
    let drain = config.supervisor.drain_deadline();
    for handle in handles {
        if tokio::time::timeout(drain, handle).await.is_err() {
            tracing::warn!("Component did not stop within the drain deadline");
        }
    }

    tracing::info!("✓ Gantry shut down gracefully.");
}
