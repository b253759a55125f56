use std::sync::Arc;

use anyhow::Context;

use streamgate::api::{self, ApiState};
use streamgate::auth::{TokenStore, TokenStoreConfig};
use streamgate::config::Config;
use streamgate::hls::{Segmenter, SegmenterConfig};
use streamgate::registry::StreamRegistry;
use streamgate::server::IngestServer;
use streamgate::storage::{LocalStorage, Storage};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "streamgate=info".into()),
        )
        .init();

    let config = Arc::new(Config::from_env());
    tracing::info!(
        http = %config.http_addr,
        rtmp = %config.rtmp_addr,
        storage = %config.storage_dir.display(),
        segment_secs = config.segment_duration.as_secs(),
        window = config.max_segments,
        "starting streamgate"
    );

    let storage: Arc<dyn Storage> = Arc::new(
        LocalStorage::new(config.storage_dir.clone())
            .await
            .context("initializing storage")?,
    );

    let registry = Arc::new(StreamRegistry::new(config.max_viewers_per_stream));

    let tokens = Arc::new(TokenStore::new(TokenStoreConfig {
        default_ttl: config.default_token_ttl,
        max_ttl: config.max_token_ttl,
        bind_publisher_ip: false,
    }));
    let _sweeper = tokens.spawn_sweeper();

    let segmenter = Arc::new(Segmenter::new(
        Arc::clone(&storage),
        Arc::clone(&registry),
        SegmenterConfig {
            segment_duration: config.segment_duration,
            max_segments: config.max_segments,
            subscriber_buffer: config.subscriber_buffer,
            ..Default::default()
        },
    ));

    let ingest = IngestServer::new(
        Arc::clone(&config),
        Arc::clone(&registry),
        Arc::clone(&tokens),
        Arc::clone(&segmenter),
    );

    let app = api::router(Arc::new(ApiState {
        config: Arc::clone(&config),
        registry,
        tokens,
        segmenter,
        storage,
    }));
    let http_listener = tokio::net::TcpListener::bind(config.http_addr)
        .await
        .with_context(|| format!("binding HTTP on {}", config.http_addr))?;
    tracing::info!(addr = %config.http_addr, "HTTP listening");

    tokio::select! {
        result = ingest.run() => {
            result.context("RTMP ingest server failed")?;
        }
        result = axum::serve(http_listener, app) => {
            result.context("HTTP server failed")?;
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("shutdown signal received");
        }
    }

    Ok(())
}
