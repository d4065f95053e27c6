#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions, clippy::cargo_common_metadata)]

//! Actix-Web API server for the civic map.
//!
//! Serves pin searches and report reads through a look-aside cache,
//! forwards writes to the report data service and invalidates the cache
//! entries they made stale, and streams invalidation notifications to
//! connected map clients over Server-Sent Events at `/api/events`.

pub mod config;
mod handlers;
pub mod repository;

use std::sync::Arc;
use std::time::Duration;

use actix_cors::Cors;
use actix_files::Files;
use actix_web::{App, HttpServer, middleware, web};
use civic_map_cache::{CacheStore, KeyValueStore, MemoryStore, RestStore, TieredStore};
use civic_map_events::EventBroker;
use civic_map_invalidation::MutationInvalidator;

use crate::config::{CacheConfig, ServerConfig};
use crate::repository::{ReportRepository, RestReportRepository};

/// Shared application state.
pub struct AppState {
    /// Look-aside cache in front of the repository.
    pub cache: Arc<CacheStore>,
    /// Source of truth.
    pub repository: Arc<dyn ReportRepository>,
    /// Invalidates the cache after writes.
    pub invalidator: MutationInvalidator,
    /// Fans notifications out to `/api/events` clients.
    pub broker: EventBroker,
}

impl AppState {
    /// Wires the invalidator to `cache` and `broker`.
    #[must_use]
    pub fn new(
        cache: Arc<CacheStore>,
        repository: Arc<dyn ReportRepository>,
        broker: EventBroker,
    ) -> Self {
        Self {
            invalidator: MutationInvalidator::new(Arc::clone(&cache), broker.clone()),
            cache,
            repository,
            broker,
        }
    }
}

/// Registers the `/api` routes.
pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.service(
        web::scope("/api")
            .route("/health", web::get().to(handlers::health))
            .route("/bounds-search", web::get().to(handlers::bounds_search))
            .route("/reports", web::post().to(handlers::create_report))
            .route("/reports/{id}", web::get().to(handlers::report))
            .route("/reports/{id}", web::patch().to(handlers::update_report))
            .route("/reports/{id}", web::delete().to(handlers::delete_report))
            .route("/reports/{id}/comments", web::get().to(handlers::comments))
            .route(
                "/reports/{id}/comments",
                web::post().to(handlers::create_comment),
            )
            .route("/reports/{id}/save", web::post().to(handlers::save_report))
            .route(
                "/reports/{id}/save",
                web::delete().to(handlers::unsave_report),
            )
            .route("/users/{id}/reports", web::get().to(handlers::user_reports))
            .route(
                "/users/{id}/saved-reports",
                web::get().to(handlers::saved_reports),
            )
            .route("/mutations", web::post().to(handlers::mutations))
            .route("/events", web::get().to(handlers::events)),
    );
}

/// Builds the cache described by `config`.
///
/// Returns the cache and its in-process layer, which the caller sweeps.
/// Without a remote URL the in-process layer is the whole cache.
#[must_use]
pub fn build_cache(config: &CacheConfig) -> (Arc<CacheStore>, Arc<MemoryStore>) {
    let local = Arc::new(MemoryStore::new());

    let backend: Arc<dyn KeyValueStore> = match &config.rest_url {
        Some(url) => {
            log::info!("Using remote cache at {url}");
            let remote = RestStore::new(url.clone(), config.rest_token.clone().unwrap_or_default());
            Arc::new(
                TieredStore::new(Arc::clone(&local), Arc::new(remote))
                    .with_local_ttl(Duration::from_secs(config.local_ttl_secs)),
            )
        }
        None => {
            log::info!("No remote cache configured, using in-process cache only");
            local.clone()
        }
    };

    (Arc::new(CacheStore::new(backend)), local)
}

/// Starts the civic map API server.
///
/// Builds the cache, the data service client and the event broker, then
/// runs the Actix-Web HTTP server until it stops. The caller provides the
/// async runtime (e.g. via `#[actix_web::main]`).
///
/// # Errors
///
/// Returns an `std::io::Result` error if the HTTP server fails to bind or
/// encounters a runtime error.
pub async fn run_server(config: ServerConfig) -> std::io::Result<()> {
    let (cache, local) = build_cache(&config.cache);
    let sweeper = local.spawn_sweeper(Duration::from_secs(config.cache.sweep_interval_secs));

    log::info!("Using report data service at {}", config.backend.url);
    let repository: Arc<dyn ReportRepository> = Arc::new(RestReportRepository::new(
        config.backend.url.clone(),
        config.backend.api_key.clone(),
    ));

    let state = web::Data::new(AppState::new(cache, repository, EventBroker::new()));
    let static_dir = config.static_dir.clone();

    log::info!("Starting server on {}:{}", config.bind_addr, config.port);

    let result = HttpServer::new(move || {
        let cors = Cors::permissive();

        let app = App::new()
            .wrap(cors)
            .wrap(middleware::Logger::default())
            .app_data(state.clone())
            .configure(configure);

        match &static_dir {
            // Serve frontend static files (production)
            Some(dir) => app.service(Files::new("/", dir).index_file("index.html")),
            None => app,
        }
    })
    .bind((config.bind_addr.as_str(), config.port))?
    .run()
    .await;

    sweeper.abort();
    result
}
