//! HTTP surface for Scopekeeper
//!
//! Wires the registry, binding middleware, expiration sweeper and handlers
//! into an axum application and runs it until Ctrl-C.

pub mod drafter;
pub mod middleware;
pub mod routes;

use crate::config::Config;
use crate::error::Result;
use crate::scope::{ScopeFactory, ServiceCollection};
use crate::session::{ExpirationSweeper, SessionRegistry};
use axum::routing::{get, post};
use axum::Router;
use middleware::{bind_session, SessionBinding};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{error, info};

/// State shared by handlers
#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<SessionRegistry>,
    pub max_degree_of_parallelism: usize,
    /// Cancelled on shutdown; background order runs use child tokens
    pub shutdown: CancellationToken,
    /// Background order runs, awaited on shutdown
    pub tasks: TaskTracker,
}

/// A wired application, not yet serving
pub struct App {
    pub state: AppState,
    pub router: Router,
    pub sweeper: ExpirationSweeper,
}

/// Build the application from configuration and a service collection
///
/// # Errors
///
/// Returns an error if the session header name is invalid.
pub fn build_app(config: &Config, services: ServiceCollection) -> Result<App> {
    let scopes = Arc::new(ScopeFactory::new(services.build()));
    let registry = Arc::new(SessionRegistry::from_config(scopes, &config.session));
    let binding = Arc::new(SessionBinding::new(Arc::clone(&registry), &config.session)?);

    let state = AppState {
        registry: Arc::clone(&registry),
        max_degree_of_parallelism: config.fanout.max_degree_of_parallelism,
        shutdown: CancellationToken::new(),
        tasks: TaskTracker::new(),
    };
    let router = build_router(state.clone(), binding);
    let sweeper = ExpirationSweeper::from_config(registry, &config.sweeper);

    Ok(App {
        state,
        router,
        sweeper,
    })
}

/// Routes with the session binding middleware applied
pub fn build_router(state: AppState, binding: Arc<SessionBinding>) -> Router {
    Router::new()
        .route("/health", get(routes::health))
        .route("/api/session", get(routes::current_session))
        .route(
            "/api/conversations/:conversation_id/messages",
            post(routes::append_message),
        )
        .route("/api/orders", post(routes::create_order))
        .route("/api/orders/:job_id", get(routes::order_status))
        .layer(axum::middleware::from_fn_with_state(binding, bind_session))
        .with_state(state)
}

/// Serve until Ctrl-C, then drain background work and end idle sessions
///
/// # Errors
///
/// Returns an error if the listener cannot be bound or the server fails.
pub async fn serve(config: Config) -> Result<()> {
    let app = build_app(&config, drafter::default_services())?;
    let sweeper = app.sweeper.spawn();

    let listener = TcpListener::bind(&config.server.bind_address).await?;
    info!(
        server.bind_address = %config.server.bind_address,
        "Scopekeeper listening"
    );

    axum::serve(listener, app.router)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    app.state.shutdown.cancel();
    app.state.tasks.close();
    app.state.tasks.wait().await;
    sweeper.shutdown().await;
    app.state.registry.shutdown().await;

    info!("Scopekeeper stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "Failed to listen for Ctrl-C");
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}
