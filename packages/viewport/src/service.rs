//! The spatial query boundary.

use async_trait::async_trait;
use civic_map_report_models::{BoundingBox, Pin};
use civic_map_server_models::ApiError;

use crate::QueryError;

/// Answers "which pins fall inside this box?".
///
/// Implementations are stateless from the caller's point of view: pins on
/// an edge of the box are included, and the service has no ordering
/// guarantee across calls.
#[async_trait]
pub trait SpatialQueryService: Send + Sync {
    /// Returns the pins inside `bbox`.
    ///
    /// # Errors
    ///
    /// Returns a [`QueryError`] if the service cannot answer.
    async fn query_pins_in_bounds(&self, bbox: &BoundingBox) -> Result<Vec<Pin>, QueryError>;

    /// Like [`Self::query_pins_in_bounds`], but any cache the service keeps
    /// in front of its source of truth is skipped.
    ///
    /// # Errors
    ///
    /// Returns a [`QueryError`] if the service cannot answer.
    async fn query_fresh_pins_in_bounds(
        &self,
        bbox: &BoundingBox,
    ) -> Result<Vec<Pin>, QueryError> {
        self.query_pins_in_bounds(bbox).await
    }
}

/// [`SpatialQueryService`] backed by the server's `/bounds-search` route.
pub struct HttpSpatialQueryService {
    client: reqwest::Client,
    base_url: String,
}

impl HttpSpatialQueryService {
    /// Creates a client for the API rooted at `base_url`
    /// (e.g. `http://localhost:8080/api`).
    #[must_use]
    pub fn new(base_url: impl Into<String>) -> Self {
        Self::with_client(reqwest::Client::new(), base_url)
    }

    /// Creates a client reusing an existing connection pool.
    #[must_use]
    pub fn with_client(client: reqwest::Client, base_url: impl Into<String>) -> Self {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        Self { client, base_url }
    }

    fn endpoint(&self) -> String {
        format!("{}/bounds-search", self.base_url)
    }

    fn request(&self, bbox: &BoundingBox, fresh: bool) -> reqwest::RequestBuilder {
        let builder = self.client.get(self.endpoint()).query(&[
            ("sw_lat", bbox.sw_lat),
            ("sw_lng", bbox.sw_lng),
            ("ne_lat", bbox.ne_lat),
            ("ne_lng", bbox.ne_lng),
        ]);
        if fresh {
            builder.query(&[("fresh", "1")])
        } else {
            builder
        }
    }

    async fn fetch(&self, bbox: &BoundingBox, fresh: bool) -> Result<Vec<Pin>, QueryError> {
        let resp = self.request(bbox, fresh).send().await?;

        let status = resp.status();
        let body = resp.text().await?;

        if !status.is_success() {
            let err: ApiError = serde_json::from_str(&body)
                .unwrap_or_else(|_| ApiError::new(format!("HTTP {status}: {body}")));
            return Err(QueryError::Status {
                status: status.as_u16(),
                message: err.error,
                details: err.details,
            });
        }

        let pins: Vec<Pin> = serde_json::from_str(&body)?;
        log::debug!("bounds-search returned {} pins", pins.len());
        Ok(pins)
    }
}

#[async_trait]
impl SpatialQueryService for HttpSpatialQueryService {
    async fn query_pins_in_bounds(&self, bbox: &BoundingBox) -> Result<Vec<Pin>, QueryError> {
        self.fetch(bbox, false).await
    }

    async fn query_fresh_pins_in_bounds(
        &self,
        bbox: &BoundingBox,
    ) -> Result<Vec<Pin>, QueryError> {
        self.fetch(bbox, true).await
    }
}
