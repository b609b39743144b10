pub mod appresult;
pub mod chat;
pub mod config;
pub mod db;
pub mod error;
pub mod rooms;
pub mod store;

use std::sync::Arc;

use axum::{Router, extract::FromRef};
use tower_http::{cors::CorsLayer, trace::TraceLayer};

pub use appresult::{AppError, AppResult};
use chat::ChatHub;
use store::SqliteStore;

#[derive(Clone, FromRef)]
pub struct AppState {
    pub store: SqliteStore,
    pub hub: Arc<ChatHub>,
}

pub fn app(app_state: AppState) -> Router {
    Router::new()
        .merge(rooms::router())
        .with_state(app_state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}
