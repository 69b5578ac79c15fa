//! API Server
//!
//! Binds the REST router and serves it until shutdown.

use crate::error::{Error, Result};
use crate::raid::RaidManager;
use std::net::SocketAddr;
use tokio::sync::broadcast;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

use super::rest::RestRouter;

// =============================================================================
// Server Configuration
// =============================================================================

/// Configuration for the API server
#[derive(Debug, Clone)]
pub struct ApiServerConfig {
    /// REST API bind address
    pub rest_addr: SocketAddr,
}

impl Default for ApiServerConfig {
    fn default() -> Self {
        Self {
            rest_addr: "127.0.0.1:8090".parse().unwrap(),
        }
    }
}

// =============================================================================
// API Server
// =============================================================================

pub struct ApiServer {
    config: ApiServerConfig,
    manager: RaidManager,
    shutdown_tx: broadcast::Sender<()>,
}

impl ApiServer {
    pub fn new(config: ApiServerConfig, manager: RaidManager) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            config,
            manager,
            shutdown_tx,
        }
    }

    /// Serve the REST API until `shutdown` is called
    pub async fn run(&self) -> Result<()> {
        let app = RestRouter::new(self.manager.clone())
            .build()
            .layer(TraceLayer::new_for_http())
            .layer(CorsLayer::permissive());

        info!("REST API listening on {}", self.config.rest_addr);

        let listener = tokio::net::TcpListener::bind(self.config.rest_addr)
            .await
            .map_err(|e| Error::Internal(format!("failed to bind REST server: {e}")))?;

        let mut shutdown_rx = self.shutdown_tx.subscribe();
        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let _ = shutdown_rx.recv().await;
                info!("REST server shutting down");
            })
            .await
            .map_err(|e| Error::Internal(format!("REST server error: {e}")))?;

        Ok(())
    }

    /// Trigger graceful shutdown
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }
}
