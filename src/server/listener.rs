//! RTMP listener: accept loop and connection spawning

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::sync::Semaphore;

use super::connection::Connection;
use crate::auth::TokenStore;
use crate::config::Config;
use crate::error::Result;
use crate::hls::Segmenter;
use crate::registry::StreamRegistry;

/// RTMP ingest endpoint
pub struct IngestServer {
    config: Arc<Config>,
    registry: Arc<StreamRegistry>,
    tokens: Arc<TokenStore>,
    segmenter: Arc<Segmenter>,
    next_session_id: AtomicU64,
    connection_limit: Option<Arc<Semaphore>>,
}

impl IngestServer {
    pub fn new(
        config: Arc<Config>,
        registry: Arc<StreamRegistry>,
        tokens: Arc<TokenStore>,
        segmenter: Arc<Segmenter>,
    ) -> Self {
        let connection_limit = if config.max_concurrent_streams > 0 {
            Some(Arc::new(Semaphore::new(config.max_concurrent_streams)))
        } else {
            None
        };
        Self {
            config,
            registry,
            tokens,
            segmenter,
            next_session_id: AtomicU64::new(1),
            connection_limit,
        }
    }

    /// Accept connections until the task is cancelled.
    pub async fn run(&self) -> Result<()> {
        let listener = TcpListener::bind(self.config.rtmp_addr).await?;
        tracing::info!(addr = %self.config.rtmp_addr, "RTMP ingest listening");

        loop {
            match listener.accept().await {
                Ok((socket, peer_addr)) => {
                    let permit = match &self.connection_limit {
                        Some(sem) => match Arc::clone(sem).try_acquire_owned() {
                            Ok(permit) => Some(permit),
                            Err(_) => {
                                tracing::warn!(peer = %peer_addr, "connection rejected: stream limit reached");
                                continue;
                            }
                        },
                        None => None,
                    };

                    let session_id = self.next_session_id.fetch_add(1, Ordering::Relaxed);
                    if let Err(e) = socket.set_nodelay(true) {
                        tracing::debug!(error = %e, "failed to set TCP_NODELAY");
                    }

                    let connection = Connection::new(
                        session_id,
                        peer_addr,
                        Arc::clone(&self.config),
                        Arc::clone(&self.registry),
                        Arc::clone(&self.tokens),
                        Arc::clone(&self.segmenter),
                    );

                    tokio::spawn(async move {
                        let _permit = permit;
                        tracing::debug!(session_id, peer = %peer_addr, "connection accepted");
                        if let Err(e) = connection.run(socket).await {
                            tracing::debug!(session_id, error = %e, "connection ended with error");
                        }
                        tracing::debug!(session_id, "connection closed");
                    });
                }
                Err(e) => {
                    tracing::error!(error = %e, "accept failed");
                }
            }
        }
    }
}
