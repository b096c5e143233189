//! Documentation of the engagement backend for the trip-planning community feed.
//!
//! Trips, stops, activities, expenses and the places proxy live in their own services.
//! This one owns a single thing: users marking/unmarking interest in a community post,
//! and the per-post counter that has to match.
//!
//!
//!
//! # General Infrastructure
//! - User hits the public reverse proxy, which authenticates and forwards to this container
//! - Either the proxy stamps a trusted user header, or the frontend sends a bearer session
//!   token that we resolve through Redis
//! - SQLite holds content items (written by the CRUD service) and engagement records
//!
//!
//!
//! # Endpoints
//!
//! | Method | Path | Response |
//! |---|---|---|
//! | `POST` | `/items/{item_id}/engagement` | toggle, `{ count, isEngaged }` |
//! | `GET` | `/items/{item_id}/engagement` | current state, `{ count, isEngaged }` |
//! | `GET` | `/health` | `ok` |
//!
//! `401` without a resolvable identity, `404` for an unknown item, `500` otherwise.
//!
//!
//!
//! # Why Not A Mutex
//! Two taps on the like button can land on two different containers. Any lock we hold in
//! process means nothing to the other one. The database is the only thing both see, so the
//! uniqueness constraint on (item, user) decides who wins and the counter moves in the same
//! transaction as the row. See [`engagement`].
//!
//!
//!
//! # Setup
//!
//! View current docs.
//! ```sh
//! cargo doc --open
//! ```
//!
//! Run against a throwaway in-process store.
//! ```sh
//! DATABASE_URL=memory RUST_LOG=info cargo run -p trips
//! ```
//!
//! Log every applied toggle.
//! ```sh
//! cargo run -p trips --features verbose
//! ```
use std::{sync::Arc, time::Duration};

use axum::{
    Router,
    http::{
        Method,
        header::{AUTHORIZATION, CONTENT_TYPE},
    },
    routing::{get, post},
};

use signal::{
    ctrl_c,
    unix::{SignalKind, signal},
};
use tokio::{net::TcpListener, signal};
use tower_http::cors::CorsLayer;
use tracing::info;
use tracing_subscriber::{EnvFilter, fmt};

pub mod config;
pub mod database;
pub mod engagement;
pub mod error;
pub mod identity;
pub mod routes;
pub mod state;

use config::Config;
use error::ServerError;
use routes::{health_handler, status_handler, toggle_handler};
use state::State;

pub fn router(state: Arc<State>) -> Router {
    let cors = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([CONTENT_TYPE, AUTHORIZATION])
        .max_age(Duration::from_secs(60 * 60));

    Router::new()
        .route(
            "/items/{item_id}/engagement",
            post(toggle_handler).get(status_handler),
        )
        .route("/health", get(health_handler))
        .layer(cors)
        .with_state(state)
}

pub async fn start_server() -> Result<(), ServerError> {
    fmt().with_env_filter(EnvFilter::from_default_env()).init();

    info!("Loading config...");
    let config = Config::load()?;

    info!("Initializing state...");
    let state = State::new(config).await?;

    info!("Starting server...");

    let address = format!("0.0.0.0:{}", state.config.port);
    info!("Binding to {address}");

    let listener = TcpListener::bind(&address).await?;
    info!("Server running on {address}");

    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Server shutting down...");

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        ctrl_c().await.expect("Failed to install Ctrl+C handler");

        info!("Received Ctrl+C, shutting down");
    };

    #[cfg(unix)]
    let terminate = async {
        signal(SignalKind::terminate())
            .expect("Failed to install signal handler")
            .recv()
            .await;

        info!("Received terminate signal, shutting down");
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
