//! HTTP handler functions for the civic map API.
//!
//! Reads go through the cache first (look-aside): a hit is served as-is, a
//! miss is loaded from the repository and written back with the key's TTL.
//! Writes go straight to the repository and, once it succeeds, invalidate
//! whatever they made stale.

use actix_web::http::StatusCode;
use actix_web::{HttpResponse, web};
use civic_map_cache::CacheKey;
use civic_map_invalidation::Mutation;
use civic_map_report_models::Pin;
use civic_map_server_models::{
    ApiError, ApiHealth, BoundsSearchParams, CreateCommentRequest, CreateReportRequest, ReportRow,
    SaveReportRequest, SavedReportsParams, UpdateReportRequest,
};
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::AppState;
use crate::repository::RepositoryError;

const DEFAULT_PAGE_SIZE: u32 = 10;
const MAX_PAGE_SIZE: u32 = 100;

fn error_response(status: StatusCode, error: ApiError) -> HttpResponse {
    HttpResponse::build(status).json(error)
}

fn repository_failure(context: &str, e: &RepositoryError) -> HttpResponse {
    log::error!("{context}: {e}");
    error_response(
        StatusCode::BAD_GATEWAY,
        ApiError::new(context).with_details(e.to_string()),
    )
}

fn not_found(what: &str) -> HttpResponse {
    error_response(StatusCode::NOT_FOUND, ApiError::new(format!("{what} not found")))
}

/// Serves `key` from the cache, or loads and caches it. With `bypass` the
/// cached value is ignored but the loaded one still replaces it.
async fn cache_aside<T, F>(
    state: &AppState,
    key: &CacheKey,
    bypass: bool,
    load: F,
) -> Result<T, RepositoryError>
where
    T: Serialize + DeserializeOwned + Sync,
    F: Future<Output = Result<T, RepositoryError>>,
{
    let rendered = key.to_string();
    if !bypass {
        if let Some(hit) = state.cache.get::<T>(&rendered).await {
            return Ok(hit);
        }
    }

    let value = load.await?;
    state.cache.set(&rendered, &value, key.ttl()).await;
    Ok(value)
}

async fn invalidate(state: &AppState, mutation: Mutation) {
    let report = state.invalidator.invalidate(&mutation).await;
    if !report.is_complete() {
        log::warn!(
            "Stale entries remain until TTL after {}: {:?}",
            mutation.report_id(),
            report.failed_keys
        );
    }
}

/// `GET /api/health`
pub async fn health() -> HttpResponse {
    HttpResponse::Ok().json(ApiHealth {
        healthy: true,
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

/// `GET /api/bounds-search`
///
/// Pins inside the viewport, cached under the quantized bounds key.
/// `fresh=1` skips the cached answer and replaces it.
pub async fn bounds_search(
    state: web::Data<AppState>,
    params: web::Query<BoundsSearchParams>,
) -> HttpResponse {
    let bbox = match params.to_bounding_box() {
        Ok(bbox) => bbox,
        Err(error) => return error_response(StatusCode::BAD_REQUEST, error),
    };
    let bbox = match bbox.validated() {
        Ok(bbox) => bbox,
        Err(e) => {
            return error_response(
                StatusCode::BAD_REQUEST,
                ApiError::new("Invalid bounds").with_details(e.to_string()),
            );
        }
    };

    let key = CacheKey::Bounds(bbox);
    let load = state.repository.pins_in_bounds(&bbox);
    match cache_aside::<Vec<Pin>, _>(&state, &key, params.wants_fresh(), load).await {
        Ok(pins) => HttpResponse::Ok().json(pins),
        Err(e) => repository_failure("Failed to search bounds", &e),
    }
}

/// `GET /api/reports/{id}`
pub async fn report(state: web::Data<AppState>, path: web::Path<String>) -> HttpResponse {
    let id = path.into_inner();
    let key = CacheKey::Report(id.clone()).to_string();

    if let Some(hit) = state.cache.get::<ReportRow>(&key).await {
        return HttpResponse::Ok().json(hit);
    }

    match state.repository.report(&id).await {
        Ok(Some(row)) => {
            state
                .cache
                .set(&key, &row, CacheKey::Report(id).ttl())
                .await;
            HttpResponse::Ok().json(row)
        }
        Ok(None) => not_found("Report"),
        Err(e) => repository_failure("Failed to load report", &e),
    }
}

/// `GET /api/reports/{id}/comments`
pub async fn comments(state: web::Data<AppState>, path: web::Path<String>) -> HttpResponse {
    let id = path.into_inner();
    let key = CacheKey::ReportComments(id.clone());
    let load = state.repository.comments(&id);
    match cache_aside::<Vec<serde_json::Value>, _>(&state, &key, false, load).await {
        Ok(comments) => HttpResponse::Ok().json(comments),
        Err(e) => repository_failure("Failed to load comments", &e),
    }
}

/// `GET /api/users/{id}/reports`
pub async fn user_reports(state: web::Data<AppState>, path: web::Path<String>) -> HttpResponse {
    let user_id = path.into_inner();
    let key = CacheKey::UserReports(user_id.clone());
    let load = state.repository.user_reports(&user_id);
    match cache_aside::<Vec<ReportRow>, _>(&state, &key, false, load).await {
        Ok(reports) => HttpResponse::Ok().json(reports),
        Err(e) => repository_failure("Failed to load user reports", &e),
    }
}

/// `GET /api/users/{id}/saved-reports?page&limit`
///
/// Pages are 1-based. `limit` defaults to 10 and is capped at 100.
pub async fn saved_reports(
    state: web::Data<AppState>,
    path: web::Path<String>,
    params: web::Query<SavedReportsParams>,
) -> HttpResponse {
    let user_id = path.into_inner();
    let page = params.page.unwrap_or(1).max(1);
    let limit = params
        .limit
        .unwrap_or(DEFAULT_PAGE_SIZE)
        .clamp(1, MAX_PAGE_SIZE);

    let key = CacheKey::UserSavedReports {
        user_id: user_id.clone(),
        page,
        limit,
    };
    let load = state.repository.saved_reports(&user_id, page, limit);
    match cache_aside::<Vec<ReportRow>, _>(&state, &key, false, load).await {
        Ok(reports) => HttpResponse::Ok().json(reports),
        Err(e) => repository_failure("Failed to load saved reports", &e),
    }
}

/// `POST /api/reports`
pub async fn create_report(
    state: web::Data<AppState>,
    body: web::Json<CreateReportRequest>,
) -> HttpResponse {
    match state.repository.create_report(&body).await {
        Ok(row) => {
            invalidate(
                &state,
                Mutation::ReportCreated {
                    report_id: row.id.clone(),
                    author_id: row.author_id.clone(),
                },
            )
            .await;
            HttpResponse::Created().json(row)
        }
        Err(e) => repository_failure("Failed to create report", &e),
    }
}

/// `PATCH /api/reports/{id}`
pub async fn update_report(
    state: web::Data<AppState>,
    path: web::Path<String>,
    body: web::Json<UpdateReportRequest>,
) -> HttpResponse {
    let id = path.into_inner();
    match state.repository.update_report(&id, &body.fields).await {
        Ok(Some(row)) => {
            invalidate(
                &state,
                Mutation::ReportUpdated {
                    report_id: row.id.clone(),
                    author_id: row.author_id.clone(),
                },
            )
            .await;
            HttpResponse::Ok().json(row)
        }
        Ok(None) => not_found("Report"),
        Err(e) => repository_failure("Failed to update report", &e),
    }
}

/// `DELETE /api/reports/{id}`
pub async fn delete_report(state: web::Data<AppState>, path: web::Path<String>) -> HttpResponse {
    let id = path.into_inner();
    match state.repository.delete_report(&id).await {
        Ok(Some(row)) => {
            invalidate(
                &state,
                Mutation::ReportDeleted {
                    report_id: row.id,
                    author_id: row.author_id,
                },
            )
            .await;
            HttpResponse::NoContent().finish()
        }
        Ok(None) => not_found("Report"),
        Err(e) => repository_failure("Failed to delete report", &e),
    }
}

/// `POST /api/reports/{id}/comments`
pub async fn create_comment(
    state: web::Data<AppState>,
    path: web::Path<String>,
    body: web::Json<CreateCommentRequest>,
) -> HttpResponse {
    let report_id = path.into_inner();
    match state.repository.add_comment(&report_id, &body).await {
        Ok(comment) => {
            invalidate(&state, Mutation::CommentCreated { report_id }).await;
            HttpResponse::Created().json(comment)
        }
        Err(e) => repository_failure("Failed to add comment", &e),
    }
}

/// `POST /api/reports/{id}/save`
pub async fn save_report(
    state: web::Data<AppState>,
    path: web::Path<String>,
    body: web::Json<SaveReportRequest>,
) -> HttpResponse {
    let report_id = path.into_inner();
    let user_id = body.into_inner().user_id;
    match state.repository.save_report(&report_id, &user_id).await {
        Ok(()) => {
            invalidate(&state, Mutation::ReportSaved { report_id, user_id }).await;
            HttpResponse::NoContent().finish()
        }
        Err(e) => repository_failure("Failed to save report", &e),
    }
}

/// `DELETE /api/reports/{id}/save`
pub async fn unsave_report(
    state: web::Data<AppState>,
    path: web::Path<String>,
    body: web::Json<SaveReportRequest>,
) -> HttpResponse {
    let report_id = path.into_inner();
    let user_id = body.into_inner().user_id;
    match state.repository.unsave_report(&report_id, &user_id).await {
        Ok(()) => {
            invalidate(&state, Mutation::ReportUnsaved { report_id, user_id }).await;
            HttpResponse::NoContent().finish()
        }
        Err(e) => repository_failure("Failed to unsave report", &e),
    }
}

/// `POST /api/mutations`
///
/// Webhook for writes performed outside this server. Runs the same
/// invalidation a local write would and reports what it achieved.
pub async fn mutations(state: web::Data<AppState>, body: web::Json<Mutation>) -> HttpResponse {
    let report = state.invalidator.invalidate(&body).await;
    HttpResponse::Ok().json(report)
}

/// `GET /api/events`
///
/// Server-Sent Events stream of every invalidation notification published
/// while the client stays connected. No replay.
pub async fn events(state: web::Data<AppState>) -> HttpResponse {
    let mut subscription = state.broker.subscribe_all();

    let stream = async_stream::stream! {
        yield Ok::<_, actix_web::Error>(web::Bytes::from_static(b": connected\n\n"));

        while let Some(notification) = subscription.recv().await {
            match serde_json::to_string(&notification) {
                Ok(json) => {
                    yield Ok(web::Bytes::from(format!(
                        "event: {}\ndata: {json}\n\n",
                        notification.topic
                    )));
                }
                Err(e) => log::warn!("Failed to encode notification: {e}"),
            }
        }
    };

    HttpResponse::Ok()
        .content_type("text/event-stream")
        .insert_header(("cache-control", "no-cache"))
        .streaming(stream)
}
