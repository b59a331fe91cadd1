//! # Tracklist Server
//!
//! HTTP surface for the album artwork cache: URL resolution with graceful
//! fallback, rate-limited manual refresh, cleanup and integrity maintenance,
//! and background task status. Cached files are served statically under the
//! configured web prefix.

pub mod handlers;
pub mod infra;
pub mod routes;

pub use infra::app_state::AppState;

use axum::Router;
use tower_http::{cors::CorsLayer, services::ServeDir, trace::TraceLayer};

pub fn create_app(state: AppState) -> Router {
    let mut app = routes::create_api_router();

    let prefix = state.config().cache.web_prefix.trim_end_matches('/');
    if prefix.starts_with('/') && prefix.len() > 1 {
        app = app.nest_service(prefix, ServeDir::new(state.layout.root()));
    }

    app.layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
