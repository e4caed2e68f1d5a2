use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::anyhow;
use dotenvy::dotenv;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};
use uuid::Uuid;

mod app;
mod common;
mod config;
mod docs;
mod index;
mod infrastructure;
mod modules;
mod routes;
mod state;
mod workers;

#[cfg(test)]
mod testing;

use crate::common::retry::RetryConfig;
use crate::config::settings::AppConfig;
use crate::index::{IndexReader, IndexWriter, IndexWriterConfig, LeaseConfig};
use crate::infrastructure::db::pool::{connect_to_db, migrate};
use crate::infrastructure::external::frames::FfmpegFrameExtractor;
use crate::infrastructure::external::transcription::HttpTranscriptionClient;
use crate::infrastructure::external::translation::HttpTranslationClient;
use crate::infrastructure::queue::rabbitmq::RabbitMqService;
use crate::infrastructure::queue::{
    Destination, MessageBus, PIPELINE_EVENTS_DLQ, Publisher, Route, SUBTITLE_JOBS, SUBTITLE_RESULTS,
};
use crate::infrastructure::storage::ObjectStore;
use crate::infrastructure::storage::cdn::PlaybackLinks;
use crate::infrastructure::storage::s3::StorageService;
use crate::modules::asset::repository::{AssetRepository, AssetStore};
use crate::modules::pipeline::service::{PipelineService, PipelineSettings};
use crate::modules::search::indexing::IndexingService;
use crate::modules::search::service::SearchService;
use crate::state::AppState;
use crate::workers::indexer::IndexWorker;
use crate::workers::subtitle::{SubtitleWorker, SubtitleWorkerSettings};
use crate::workers::{MessageHandler, RetryPolicy, run_consumer};

#[tokio::main]
async fn main() {
    dotenv().ok();

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true))
        .with(env_filter)
        .init();

    if let Err(e) = run().await {
        error!("Fatal: {:#}", e);
        std::process::exit(1);
    }
}

/// Runs one consumer and trips `shutdown` if it dies, so the process exits
/// instead of idling without a worker.
fn spawn_consumer<H: MessageHandler + 'static>(
    workers: &mut JoinSet<anyhow::Result<()>>,
    rabbit: &RabbitMqService,
    route: &Route,
    handler: Arc<H>,
    policy: RetryPolicy,
    tag: String,
    shutdown: &CancellationToken,
) {
    let rabbit = rabbit.clone();
    let route = route.clone();
    let shutdown = shutdown.clone();
    workers.spawn(async move {
        let result = run_consumer(rabbit, route, handler, policy, tag.clone(), shutdown.clone()).await;
        if let Err(e) = &result {
            error!(tag = %tag, "Consumer stopped: {:#}", e);
            shutdown.cancel();
        }
        result
    });
}

async fn run() -> anyhow::Result<()> {
    let config = AppConfig::new()?;
    info!(roles = ?config.roles, "Starting subtitle-search");

    let pool = connect_to_db(&config.database_url).await?;
    migrate(&pool).await?;
    info!("Database migrations applied");
    let assets: Arc<dyn AssetStore> = Arc::new(AssetRepository::new(pool));

    let rabbit = RabbitMqService::new(&config.rabbitmq_url).await?;
    let jobs_route = Route::for_queue(SUBTITLE_JOBS);
    let index_route = Route::for_subscriber(SUBTITLE_RESULTS, "indexer");
    rabbit.declare_route(&jobs_route, config.queue.retry_delay).await?;
    rabbit
        .subscribe(SUBTITLE_RESULTS, &index_route, config.queue.retry_delay)
        .await?;
    rabbit.declare_plain_queue(PIPELINE_EVENTS_DLQ).await?;
    let bus: Arc<dyn MessageBus> = Arc::new(rabbit.clone());

    let storage: Arc<dyn ObjectStore> = Arc::new(
        StorageService::new(
            &config.minio_url,
            &config.minio_bucket,
            &config.minio_access_key,
            &config.minio_secret_key,
        )
        .await,
    );
    let links = PlaybackLinks::new(&config.cdn_base_url)
        .map_err(|e| anyhow!("Invalid CDN base URL {}: {}", config.cdn_base_url, e))?;
    let transcription = Arc::new(HttpTranscriptionClient::new(
        &config.transcribe_api_url,
        config.external_timeout,
    )?);
    let translation = Arc::new(HttpTranslationClient::new(
        &config.translate_api_url,
        config.external_timeout,
    )?);
    let frames = Arc::new(FfmpegFrameExtractor::new(
        storage.clone(),
        &config.ffmpeg_path,
        &config.ffprobe_path,
    ));

    let jobs = Publisher::new(bus.clone(), Destination::queue(SUBTITLE_JOBS));
    let results = Publisher::new(bus.clone(), Destination::exchange(SUBTITLE_RESULTS));

    let writer_config = IndexWriterConfig {
        lease: LeaseConfig {
            duration: config.index.lease,
            acquire_timeout: config.index.lock_timeout,
            poll_interval: Duration::from_millis(50),
        },
        max_segments: config.index.max_segments,
        ..IndexWriterConfig::for_holder(format!("writer-{}", Uuid::new_v4().simple()))
    };
    let writer = Arc::new(IndexWriter::open(config.index.mount.clone(), writer_config)?);
    let reader = Arc::new(IndexReader::open(
        config.index.mount.clone(),
        config.index.refresh_interval,
    ));
    info!(mount = %config.index.mount.display(), "Search index mounted");

    let pipeline = Arc::new(PipelineService::new(
        assets.clone(),
        storage.clone(),
        transcription,
        frames,
        jobs,
        results.clone(),
        PipelineSettings {
            target_languages: config.subtitles.target_languages.clone(),
            default_source_language: config.subtitles.default_source_language.clone(),
            frame_timeout: config.frame_timeout,
        },
    ));
    let indexing = Arc::new(IndexingService::new(storage.clone(), writer));
    let search = Arc::new(SearchService::new(reader, assets.clone(), links.clone()));

    let shutdown = CancellationToken::new();
    let mut workers = JoinSet::new();
    let policy = RetryPolicy {
        max_retries: config.queue.max_retries,
    };

    if config.roles.subtitle {
        let worker = Arc::new(SubtitleWorker::new(
            assets.clone(),
            storage.clone(),
            translation,
            results,
            SubtitleWorkerSettings {
                required_languages: config.subtitles.required_languages.clone(),
                translate_retry: RetryConfig::with_retries(config.subtitles.translate_retries),
                policy,
            },
        ));
        for slot in 0..config.queue.worker_slots.max(1) {
            spawn_consumer(
                &mut workers,
                &rabbit,
                &jobs_route,
                worker.clone(),
                policy,
                format!("subtitle-{slot}"),
                &shutdown,
            );
        }
    }

    if config.roles.indexer {
        if let Some(report) = indexing.ensure_ready().await? {
            info!(
                generation = report.generation,
                documents = report.documents,
                skipped = report.skipped,
                "Search index rebuilt at startup"
            );
        }
        let worker = Arc::new(IndexWorker::new(indexing.clone()));
        spawn_consumer(
            &mut workers,
            &rabbit,
            &index_route,
            worker,
            policy,
            "indexer".to_string(),
            &shutdown,
        );
    }

    let signal = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Received shutdown signal");
        }
        signal.cancel();
    });

    if config.roles.api {
        let state = AppState::new(assets, bus, pipeline, search, indexing, links);
        let app = app::create_app(state);

        let addr = SocketAddr::from(([0, 0, 0, 0], config.server_port));
        let listener = tokio::net::TcpListener::bind(addr).await?;
        info!("Server running on http://{}", addr);

        let token = shutdown.clone();
        axum::serve(listener, app)
            .with_graceful_shutdown(async move { token.cancelled().await })
            .await?;
    } else {
        shutdown.cancelled().await;
    }

    shutdown.cancel();
    while let Some(joined) = workers.join_next().await {
        if let Err(e) = joined {
            error!("Worker task panicked: {}", e);
        }
    }

    info!("Shutdown complete");
    Ok(())
}
