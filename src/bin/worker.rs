use garde::Validate;
use metrics_exporter_prometheus::PrometheusBuilder;
use parking_occupancy::{
    config::AppConfig,
    db::{self, PgStore},
    services::{
        detection::{DetectionAdapter, HttpDetector},
        media::LocalMediaOpener,
        processor::VideoProcessor,
        queue::RedisJobQueue,
        scheduler::WorkerScheduler,
    },
};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::watch;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    // Initialize structured logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .json()
        .init();

    tracing::info!("Starting parking occupancy worker");

    let config = AppConfig::from_env().expect("Failed to load configuration");
    let pipeline = config.pipeline();
    pipeline.validate().expect("Invalid pipeline configuration");
    let scheduler_config = config.scheduler();

    let metrics_addr: SocketAddr = config
        .metrics_addr
        .parse()
        .expect("Invalid METRICS_ADDR");
    PrometheusBuilder::new()
        .with_http_listener(metrics_addr)
        .install()
        .expect("Failed to install Prometheus exporter");
    describe_metrics();

    tracing::info!("Connecting to PostgreSQL");
    let db_pool = db::init_pool(&config.database_url, scheduler_config.workers as u32 + 1)
        .await
        .expect("Failed to connect to database");
    let store = Arc::new(PgStore::new(db_pool));

    tracing::info!("Connecting to Redis job queue");
    let queue = Arc::new(RedisJobQueue::new(&config.redis_url).expect("Failed to initialize job queue"));

    let detector = Arc::new(HttpDetector::new(&config.detector_url, config.detector_api_token.clone()));
    let media = Arc::new(LocalMediaOpener::new(&config.video_storage_path));

    let processor = VideoProcessor::new(
        store.clone(),
        queue.clone(),
        media,
        DetectionAdapter::new(detector, config.detection()),
        pipeline,
    );
    let scheduler = WorkerScheduler::new(processor, store, queue, scheduler_config);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for shutdown signal");
            return;
        }
        tracing::info!("Shutdown requested, finishing current frames");
        let _ = shutdown_tx.send(true);
        // Keep the sender alive so workers observe the final value.
        std::future::pending::<()>().await;
    });

    tracing::info!("Worker ready, starting job processing loop");
    scheduler.run(shutdown_rx).await;
    tracing::info!("Worker shut down");
}

fn describe_metrics() {
    metrics::describe_counter!("frames_processed_total", "Sampled frames run through detection");
    metrics::describe_counter!("frame_gaps_total", "Sampled frames skipped, by reason");
    metrics::describe_counter!("occupancy_events_total", "Confirmed slot transitions, by status");
    metrics::describe_counter!("detection_retries_total", "Detection calls retried after a transient error");
    metrics::describe_counter!("video_jobs_completed_total", "Videos processed to completion");
    metrics::describe_counter!("video_jobs_failed_total", "Videos marked failed, by error kind");
    metrics::describe_counter!("video_jobs_retried_total", "Video jobs rescheduled with backoff");
    metrics::describe_histogram!("video_processing_seconds", "Wall time of one job run");
    metrics::describe_histogram!("detection_call_seconds", "Latency of a single detection call");
    metrics::describe_gauge!("video_queue_depth", "Jobs waiting for or holding a worker lease");
}
