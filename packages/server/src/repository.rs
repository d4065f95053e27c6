//! The report data service: the source of truth behind the cache.

use std::time::Duration;

use async_trait::async_trait;
use civic_map_report_models::{BoundingBox, Pin, Urgency};
use civic_map_server_models::{CreateCommentRequest, CreateReportRequest, ReportRow};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value, json};
use thiserror::Error;

/// Errors from the backing data service.
#[derive(Debug, Error)]
pub enum RepositoryError {
    /// HTTP transport failed.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// The data service rejected the request.
    #[error("Data service returned HTTP {status}: {message}")]
    Status {
        /// HTTP status code.
        status: u16,
        /// Error text from the response body.
        message: String,
    },

    /// A response could not be decoded.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A write returned no row.
    #[error("Data service returned no row for {operation}")]
    EmptyResult {
        /// The write that came back empty.
        operation: &'static str,
    },
}

/// Reads and writes against the source of truth.
///
/// Every read here is what the cache sits in front of; every write is
/// followed by an invalidation in the HTTP layer.
#[async_trait]
pub trait ReportRepository: Send + Sync {
    /// Pins of every report inside `bbox`, edges inclusive.
    async fn pins_in_bounds(&self, bbox: &BoundingBox) -> Result<Vec<Pin>, RepositoryError>;

    /// A single report, or `None` if it does not exist.
    async fn report(&self, id: &str) -> Result<Option<ReportRow>, RepositoryError>;

    /// Comments of a report, oldest first.
    async fn comments(&self, report_id: &str) -> Result<Vec<Value>, RepositoryError>;

    /// Reports authored by a user, newest first.
    async fn user_reports(&self, user_id: &str) -> Result<Vec<ReportRow>, RepositoryError>;

    /// One page (1-based) of a user's saved reports.
    async fn saved_reports(
        &self,
        user_id: &str,
        page: u32,
        limit: u32,
    ) -> Result<Vec<ReportRow>, RepositoryError>;

    /// Creates a report and returns the stored row.
    async fn create_report(
        &self,
        request: &CreateReportRequest,
    ) -> Result<ReportRow, RepositoryError>;

    /// Applies `fields` to a report. `None` if it does not exist.
    async fn update_report(
        &self,
        id: &str,
        fields: &Map<String, Value>,
    ) -> Result<Option<ReportRow>, RepositoryError>;

    /// Deletes a report, returning the removed row. `None` if it did not
    /// exist.
    async fn delete_report(&self, id: &str) -> Result<Option<ReportRow>, RepositoryError>;

    /// Adds a comment and returns the stored row.
    async fn add_comment(
        &self,
        report_id: &str,
        request: &CreateCommentRequest,
    ) -> Result<Value, RepositoryError>;

    /// Adds a report to a user's saved list. Saving twice is not an error.
    async fn save_report(&self, report_id: &str, user_id: &str) -> Result<(), RepositoryError>;

    /// Removes a report from a user's saved list.
    async fn unsave_report(&self, report_id: &str, user_id: &str)
    -> Result<(), RepositoryError>;
}

#[derive(Deserialize)]
struct PinRow {
    id: String,
    urgency: Urgency,
    lat: f64,
    lng: f64,
}

impl From<PinRow> for Pin {
    fn from(row: PinRow) -> Self {
        Self::new(row.id, row.urgency, row.lat, row.lng)
    }
}

#[derive(Deserialize)]
struct SavedRow {
    reports: ReportRow,
}

/// Deadline for one data service round trip.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Deadline for establishing a connection to the data service.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(3);

/// [`ReportRepository`] over a PostgREST-style data service.
///
/// Expects `reports`, `comments` and `saved_reports` tables.
pub struct RestReportRepository {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
}

impl RestReportRepository {
    /// Creates a repository for the service rooted at `base_url`.
    #[must_use]
    pub fn new(base_url: impl Into<String>, api_key: Option<String>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .unwrap_or_else(|e| {
                log::warn!("Falling back to an unconfigured HTTP client: {e}");
                reqwest::Client::new()
            });
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key,
        }
    }

    fn request(&self, method: reqwest::Method, table: &str) -> reqwest::RequestBuilder {
        let builder = self
            .client
            .request(method, format!("{}/{table}", self.base_url));
        match &self.api_key {
            Some(key) => builder.header("apikey", key).bearer_auth(key),
            None => builder,
        }
    }

    async fn send<T: DeserializeOwned>(
        builder: reqwest::RequestBuilder,
    ) -> Result<T, RepositoryError> {
        let resp = builder.send().await?;
        let status = resp.status();
        let body = resp.text().await?;

        if !status.is_success() {
            let message = serde_json::from_str::<Value>(&body)
                .ok()
                .and_then(|v| v.get("message").and_then(Value::as_str).map(String::from))
                .unwrap_or(body);
            return Err(RepositoryError::Status {
                status: status.as_u16(),
                message,
            });
        }

        if body.trim().is_empty() {
            return Ok(serde_json::from_value(Value::Null)?);
        }
        Ok(serde_json::from_str(&body)?)
    }

    fn eq(value: &str) -> String {
        format!("eq.{value}")
    }
}

#[async_trait]
impl ReportRepository for RestReportRepository {
    async fn pins_in_bounds(&self, bbox: &BoundingBox) -> Result<Vec<Pin>, RepositoryError> {
        let rows: Vec<PinRow> = Self::send(
            self.request(reqwest::Method::GET, "reports").query(&[
                ("select", "id,urgency,lat,lng".to_string()),
                ("lat", format!("gte.{}", bbox.sw_lat)),
                ("lat", format!("lte.{}", bbox.ne_lat)),
                ("lng", format!("gte.{}", bbox.sw_lng)),
                ("lng", format!("lte.{}", bbox.ne_lng)),
            ]),
        )
        .await?;

        Ok(rows.into_iter().map(Pin::from).collect())
    }

    async fn report(&self, id: &str) -> Result<Option<ReportRow>, RepositoryError> {
        let rows: Vec<ReportRow> = Self::send(
            self.request(reqwest::Method::GET, "reports")
                .query(&[("id", Self::eq(id)), ("limit", "1".to_string())]),
        )
        .await?;
        Ok(rows.into_iter().next())
    }

    async fn comments(&self, report_id: &str) -> Result<Vec<Value>, RepositoryError> {
        Self::send(self.request(reqwest::Method::GET, "comments").query(&[
            ("report_id", Self::eq(report_id)),
            ("order", "created_at.asc".to_string()),
        ]))
        .await
    }

    async fn user_reports(&self, user_id: &str) -> Result<Vec<ReportRow>, RepositoryError> {
        Self::send(self.request(reqwest::Method::GET, "reports").query(&[
            ("author_id", Self::eq(user_id)),
            ("order", "created_at.desc".to_string()),
        ]))
        .await
    }

    async fn saved_reports(
        &self,
        user_id: &str,
        page: u32,
        limit: u32,
    ) -> Result<Vec<ReportRow>, RepositoryError> {
        let offset = page.saturating_sub(1).saturating_mul(limit);
        let rows: Vec<SavedRow> = Self::send(
            self.request(reqwest::Method::GET, "saved_reports").query(&[
                ("user_id", Self::eq(user_id)),
                ("select", "reports(*)".to_string()),
                ("order", "created_at.desc".to_string()),
                ("limit", limit.to_string()),
                ("offset", offset.to_string()),
            ]),
        )
        .await?;
        Ok(rows.into_iter().map(|row| row.reports).collect())
    }

    async fn create_report(
        &self,
        request: &CreateReportRequest,
    ) -> Result<ReportRow, RepositoryError> {
        let rows: Vec<ReportRow> = Self::send(
            self.request(reqwest::Method::POST, "reports")
                .header("prefer", "return=representation")
                .json(request),
        )
        .await?;
        rows.into_iter()
            .next()
            .ok_or(RepositoryError::EmptyResult {
                operation: "create report",
            })
    }

    async fn update_report(
        &self,
        id: &str,
        fields: &Map<String, Value>,
    ) -> Result<Option<ReportRow>, RepositoryError> {
        let rows: Vec<ReportRow> = Self::send(
            self.request(reqwest::Method::PATCH, "reports")
                .query(&[("id", Self::eq(id))])
                .header("prefer", "return=representation")
                .json(fields),
        )
        .await?;
        Ok(rows.into_iter().next())
    }

    async fn delete_report(&self, id: &str) -> Result<Option<ReportRow>, RepositoryError> {
        let rows: Vec<ReportRow> = Self::send(
            self.request(reqwest::Method::DELETE, "reports")
                .query(&[("id", Self::eq(id))])
                .header("prefer", "return=representation"),
        )
        .await?;
        Ok(rows.into_iter().next())
    }

    async fn add_comment(
        &self,
        report_id: &str,
        request: &CreateCommentRequest,
    ) -> Result<Value, RepositoryError> {
        let rows: Vec<Value> = Self::send(
            self.request(reqwest::Method::POST, "comments")
                .header("prefer", "return=representation")
                .json(&json!({
                    "report_id": report_id,
                    "author_id": request.author_id,
                    "body": request.body,
                })),
        )
        .await?;
        rows.into_iter().next().ok_or(RepositoryError::EmptyResult {
            operation: "add comment",
        })
    }

    async fn save_report(&self, report_id: &str, user_id: &str) -> Result<(), RepositoryError> {
        let _: Option<Value> = Self::send(
            self.request(reqwest::Method::POST, "saved_reports")
                .header("prefer", "resolution=ignore-duplicates,return=minimal")
                .json(&json!({ "report_id": report_id, "user_id": user_id })),
        )
        .await?;
        Ok(())
    }

    async fn unsave_report(
        &self,
        report_id: &str,
        user_id: &str,
    ) -> Result<(), RepositoryError> {
        let _: Option<Value> = Self::send(
            self.request(reqwest::Method::DELETE, "saved_reports")
                .query(&[("report_id", Self::eq(report_id)), ("user_id", Self::eq(user_id))])
                .header("prefer", "return=minimal"),
        )
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pin_rows_become_pins() {
        let row: PinRow =
            serde_json::from_str(r#"{"id":"r1","urgency":"high","lat":10.32,"lng":123.9}"#)
                .unwrap();
        assert_eq!(Pin::from(row), Pin::new("r1", Urgency::High, 10.32, 123.9));
    }

    #[test]
    fn saved_rows_unwrap_the_embedded_report() {
        let rows: Vec<SavedRow> = serde_json::from_str(
            r#"[{"reports":{"id":"r1","author_id":"u1","title":"Pothole"}}]"#,
        )
        .unwrap();
        assert_eq!(rows[0].reports.id, "r1");
        assert_eq!(rows[0].reports.fields["title"], "Pothole");
    }

    #[test]
    fn base_url_loses_trailing_slash() {
        let repo = RestReportRepository::new("http://db.local/rest/v1/", None);
        assert_eq!(repo.base_url, "http://db.local/rest/v1");
    }
}
