use std::future::Future;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::{
    Router,
    http::{HeaderValue, Method, header},
    routing::get,
};
use tokio::net::TcpListener;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use super::api::{self, AppState, SharedState};
use super::db::{DbHandle, TaskifyDb};
use super::realtime::socket;
use crate::config::TaskifyConfig;
use crate::integrations::{CalendarClient, GoogleCalendar, Mailer, NoopMailer, SendGridMailer};

/// Build the full application router: REST API, the `/socket` upgrade
/// endpoint, request tracing and CORS.
pub fn build_router(state: SharedState) -> Result<Router> {
    let cors = cors_layer(&state.config)?;
    Ok(api::api_router()
        .route("/socket", get(socket::socket_handler))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state))
}

/// Any origin in dev mode; otherwise only the front end, with cookies.
fn cors_layer(config: &TaskifyConfig) -> Result<CorsLayer> {
    if config.server.dev_mode {
        return Ok(CorsLayer::very_permissive());
    }
    let origin = HeaderValue::from_str(config.server.frontend_url.trim_end_matches('/'))
        .with_context(|| format!("Invalid frontend_url '{}'", config.server.frontend_url))?;
    Ok(CorsLayer::new()
        .allow_origin(origin)
        .allow_credentials(true)
        .allow_methods([
            Method::GET,
            Method::POST,
            Method::PATCH,
            Method::PUT,
            Method::DELETE,
        ])
        .allow_headers([header::CONTENT_TYPE, header::AUTHORIZATION]))
}

/// Assemble the shared state from configuration: open the database and
/// pick the mailer and calendar client.
pub fn build_state(config: TaskifyConfig) -> Result<SharedState> {
    if let Some(parent) = config.database.path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent).context("Failed to create database directory")?;
        }
    }
    let db = TaskifyDb::new(&config.database.path).context("Failed to initialize database")?;

    let mailer: Arc<dyn Mailer> = match &config.email.sendgrid_api_key {
        Some(key) => Arc::new(SendGridMailer::new(key.clone(), config.email.from.clone())),
        None => {
            info!("SENDGRID_API_KEY not set; emails will be logged only");
            Arc::new(NoopMailer)
        }
    };
    let calendar = GoogleCalendar::from_config(&config.google)
        .map(|c| Arc::new(c) as Arc<dyn CalendarClient>);
    if calendar.is_none() {
        info!("Google OAuth not configured; calendar sync disabled");
    }

    Ok(Arc::new(AppState::new(DbHandle::new(db), config, mailer, calendar)?))
}

/// Serve on an already bound listener until `shutdown` resolves.
///
/// Shutdown stops accepting, then closes every socket so the graceful
/// drain is not held open by long-lived connections.
pub async fn serve<F>(listener: TcpListener, state: SharedState, shutdown: F) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let app = build_router(state.clone())?;
    let rooms = state.rooms.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown.await;
            rooms.close_all().await;
        })
        .await
        .context("Server error")
}

/// Start the Taskify server and block until Ctrl+C or SIGTERM.
pub async fn start_server(config: TaskifyConfig) -> Result<()> {
    let addr = format!("{}:{}", config.server.host, config.server.port);
    let dev_mode = config.server.dev_mode;
    let state = build_state(config)?;

    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;
    let local_addr = listener.local_addr()?;
    info!(address = %local_addr, dev_mode, "taskify listening");

    serve(listener, state, shutdown_signal()).await?;

    info!("server shut down gracefully");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("shutting down");
}
