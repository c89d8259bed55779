//! Converge Server - state reconciliation service.
//!
//! Hosts the adapters (in-memory, PostgreSQL, scheduling provider), the run
//! state machine and an HTTP surface for starting, confirming, cancelling
//! and inspecting reconciliation runs. Diffing itself lives in
//! `converge-engine`.

pub mod adapters;
pub mod auth;
pub mod config;
pub mod db;
pub mod error;
pub mod journal;
pub mod registry;
pub mod routes;
pub mod runner;

use crate::config::Config;
use crate::registry::RunRegistry;
use crate::runner::Runner;
use axum::Router;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub runner: Runner,
    pub runs: Arc<RunRegistry>,
}

impl AppState {
    pub fn new(config: Config, runner: Runner) -> Self {
        let runs = Arc::new(RunRegistry::with_retention(config.retained_runs));
        Self {
            config: Arc::new(config),
            runner,
            runs,
        }
    }
}

/// Build the router with tracing and CORS layers.
pub fn app(state: AppState) -> Router {
    Router::new()
        .merge(routes::create_routes())
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .with_state(state)
}
