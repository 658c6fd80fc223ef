//! HTTP surface of the sync service.

pub mod connection;
pub mod error;
pub mod handlers;
pub mod routing;
pub mod writer;

use std::sync::Arc;

use axum::{
    Router,
    http::HeaderMap,
    routing::{delete, get, post, put},
};
use tokio::net::TcpListener;
use tracing::info;

use crate::config::Config;
use crate::db::postgres::PgConnector;
use connection::{ConnectionManager, ScopedConnection};
use error::ApiError;
use routing::{ConnectionParams, resolve};

#[derive(thiserror::Error, Debug)]
pub enum ServerError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

#[derive(Clone)]
pub struct AppState {
    pub fallback: ConnectionParams,
    pub connections: ConnectionManager,
}

impl AppState {
    /// Route the request to its tenant and open a connection for it.
    ///
    /// Incomplete parameters are rejected before any connection is attempted.
    pub async fn open(&self, headers: &HeaderMap) -> Result<ScopedConnection, ApiError> {
        let request = ConnectionParams::from_headers(headers);
        let descriptor = resolve(&request, &self.fallback)?;
        Ok(self.connections.open(&descriptor).await?)
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/status", get(handlers::status))
        .route("/api/test-db-connection", post(handlers::test_db_connection))
        .route(
            "/api/project-complete/{id}",
            put(handlers::save_project_complete),
        )
        .route(
            "/api/projects",
            get(handlers::list_projects).post(handlers::create_project),
        )
        .route(
            "/api/projects/{id}",
            get(handlers::get_project)
                .put(handlers::update_project)
                .delete(handlers::delete_project),
        )
        .route(
            "/api/{collection}",
            get(handlers::list_children).post(handlers::create_child),
        )
        .route("/api/{collection}/{id}", delete(handlers::delete_child))
        .with_state(state)
}

pub async fn serve(config: &Config) -> Result<(), ServerError> {
    let state = AppState {
        fallback: config.fallback_params(),
        connections: ConnectionManager::new(Arc::new(PgConnector), config.connect_timeout()),
    };
    let app = router(state);

    let addr = config.listen_addr();
    let listener = TcpListener::bind(&addr).await?;
    info!(%addr, "listening");
    axum::serve(listener, app).await?;
    Ok(())
}
