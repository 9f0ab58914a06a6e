//! API Server
//!
//! Router assembly, middleware stack and graceful shutdown.
//!
//! The server does not authenticate players. It expects to sit behind a
//! gateway that verifies the caller and sets `x-account-id`; anything that can
//! reach the port directly can act as any account. Operator endpoints are the
//! exception and always require `x-api-key`.

use super::{
    handlers::AppState,
    middleware::{create_cors_layer, request_id_middleware},
    routes::create_router,
};
use crate::config::ServerConfig;
use std::{net::SocketAddr, sync::Arc, time::Duration};
use tokio::signal;
use tower_http::{timeout::TimeoutLayer, trace::TraceLayer};
use tracing::{info, warn};

pub struct ApiServer {
    config: ServerConfig,
    state: Arc<AppState>,
}

impl ApiServer {
    pub fn new(config: ServerConfig, state: Arc<AppState>) -> Self {
        Self { config, state }
    }

    /// Serve until Ctrl+C or SIGTERM
    pub async fn run(self) -> Result<(), Box<dyn std::error::Error>> {
        let app = self.create_app();
        let addr = self.get_socket_addr()?;

        info!("🌐 Starting Stakeroom API Server (HTTP)");
        info!("   Listen: http://{}", addr);
        self.log_server_info();

        let listener = tokio::net::TcpListener::bind(addr).await?;
        info!("✅ API Server running");

        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown_signal())
            .await?;

        info!("🛑 API Server stopped gracefully");
        Ok(())
    }

    /// Create the application with its middleware stack
    pub fn create_app(&self) -> axum::Router {
        create_router(self.state.clone())
            // Request ID middleware (first for tracing)
            .layer(axum::middleware::from_fn(request_id_middleware))
            // CORS layer (before timeout to handle preflight)
            .layer(create_cors_layer(self.config.allowed_origins.clone()))
            .layer(TimeoutLayer::new(Duration::from_secs(self.config.request_timeout_secs)))
            // Tracing layer (last for complete request tracing)
            .layer(TraceLayer::new_for_http())
    }

    fn get_socket_addr(&self) -> Result<SocketAddr, Box<dyn std::error::Error>> {
        Ok(SocketAddr::from((
            self.config.host.parse::<std::net::IpAddr>()?,
            self.config.port,
        )))
    }

    fn log_server_info(&self) {
        info!("📋 Server Configuration:");
        info!("   Version: {}", self.state.version);
        info!("   CORS: {:?}", self.config.allowed_origins);
        info!("   Request timeout: {}s", self.config.request_timeout_secs);
        if self.state.admin_api_key.as_deref().map_or(true, str::is_empty) {
            warn!("⚠️  No admin API key set; admin endpoints will reject every request");
        }

        info!("📊 Available endpoints:");
        info!("   GET  /health                 - Health check");
        info!("   POST /accounts               - Open account");
        info!("   GET  /balance                - Balance (x-account-id)");
        info!("   POST /balance/deposit        - Request a deposit");
        info!("   POST /wagers                 - Place prediction bet");
        info!("   POST /rooms                  - Create room");
        info!("   POST /rooms/:id/join         - Join room");
        info!("   GET  /referrals              - Referral rewards");
        info!("   POST /lottery/entries        - Enter the lottery");
        info!("   POST /prices                 - Oracle price push (admin)");
        info!("   POST /rooms/:id/result       - Game result intake (admin)");
        info!("   POST /deposits/:id/confirm   - Confirm a deposit (admin)");
        info!("   POST /lottery/close          - Draw or refund the lottery (admin)");
        info!("   GET  /metrics                - Prometheus metrics");
    }
}

/// Wait for shutdown signal
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                warn!("Failed to install signal handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C signal");
        },
        _ = terminate => {
            info!("Received terminate signal");
        },
    }
}
