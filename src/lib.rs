pub mod config;
pub mod db;
pub mod error;
pub mod handlers;
pub mod middleware;
pub mod models;
pub mod services;
pub mod storage;

#[cfg(test)]
mod test_support;

use axum::{
    extract::DefaultBodyLimit,
    routing::{delete, get, patch, post, put},
    Router,
};
use std::path::Path;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::config::Config;
use crate::db::Database;
use crate::error::Result;
use crate::services::{
    AuditSink, BlobStore, ContentHasher, DomainEvent, EventBroker, MimeSniffer, QuotaLedger,
    SignatureSniffer, TracingAuditSink,
};
use crate::storage::LocalStorage;

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub db: Database,
    pub config: Arc<Config>,
    pub blobs: Arc<BlobStore>,
    pub quota: Arc<QuotaLedger>,
    pub hasher: ContentHasher,
    pub sniffer: Arc<dyn MimeSniffer>,
    pub events: EventBroker,
    pub audit: Arc<dyn AuditSink>,
}

impl AppState {
    /// Open the catalog, run migrations and wire the default collaborators
    pub async fn new(config: Config) -> Result<Self> {
        let db = Database::new(&config.database).await?;
        db.run_migrations().await?;

        let content_root = Path::new(&config.storage.content_root);
        let sink = Arc::new(LocalStorage::new(content_root));

        Ok(Self {
            db,
            blobs: Arc::new(BlobStore::new(sink)),
            quota: Arc::new(QuotaLedger::new(config.quota.default_ceiling)),
            hasher: ContentHasher::new(
                content_root.join(".staging"),
                config.upload.max_file_size_bytes(),
            ),
            sniffer: Arc::new(SignatureSniffer),
            events: EventBroker::new(config.events.channel_capacity),
            audit: Arc::new(TracingAuditSink),
            config: Arc::new(config),
        })
    }

    /// Record an audit entry and publish a committed change
    pub fn emit(&self, actor: &str, event: DomainEvent) {
        self.audit.record(event.audit_entry(actor));
        self.events.publish(event);
    }
}

pub fn create_router(state: AppState) -> Router {
    // CORS configuration
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let routes = Router::new()
        // Files
        .route("/files", get(handlers::file::list_files))
        // Part sizes are bounded while spooling
        .route(
            "/files/upload",
            post(handlers::file::upload_file).layer(DefaultBodyLimit::disable()),
        )
        .route(
            "/files/batch",
            post(handlers::file::upload_batch).layer(DefaultBodyLimit::disable()),
        )
        .route("/files/:id", delete(handlers::trash::delete_file))
        .route("/files/:id/download", get(handlers::file::download_file))
        .route("/files/:id/tags", patch(handlers::file::update_tags))
        .route("/files/:id/trash", patch(handlers::trash::trash_file))
        .route("/files/:id/restore", patch(handlers::trash::restore_file))
        .route("/files/:id/versions", get(handlers::file::list_versions))
        .route(
            "/files/:id/versions/:version/restore",
            post(handlers::file::restore_version),
        )
        // Trash
        .route(
            "/trash",
            get(handlers::trash::list_trash).delete(handlers::trash::empty_trash),
        )
        // Folders
        .route("/folders", post(handlers::folder::create_folder))
        .route("/folders/:id", delete(handlers::folder::delete_folder))
        .route("/folders/:id/trash", patch(handlers::folder::trash_folder))
        .route("/folders/:id/restore", patch(handlers::folder::restore_folder))
        // Usage and quotas
        .route("/usage", get(handlers::usage::get_usage))
        .route("/stats", get(handlers::usage::get_stats))
        .route("/quota/:owner", put(handlers::usage::set_quota))
        .layer(axum::middleware::from_fn_with_state(
            state.clone(),
            middleware::auth::owner_middleware,
        ));

    Router::new()
        .nest("/api/v1", routes)
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}
