#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions, clippy::cargo_common_metadata)]

//! API request and response types for the civic map server.
//!
//! Shared by the server and by clients such as the viewport coordinator's
//! HTTP spatial query service. Pins are served as-is from
//! `civic_map_report_models`; everything else lives here.

use civic_map_report_models::BoundingBox;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Error body returned with every 4xx/5xx response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApiError {
    /// Short, user-presentable message.
    pub error: String,
    /// Optional diagnostic detail.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

impl ApiError {
    /// Creates an error body without details.
    #[must_use]
    pub fn new(error: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            details: None,
        }
    }

    /// Attaches diagnostic detail.
    #[must_use]
    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }
}

/// Health check response.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiHealth {
    /// Whether the service is healthy.
    pub healthy: bool,
    /// Server version.
    pub version: String,
}

/// Query parameters of `GET /bounds-search`.
///
/// Kept as raw strings so malformed values produce a structured
/// [`ApiError`] instead of a framework rejection.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct BoundsSearchParams {
    /// South-west latitude.
    pub sw_lat: Option<String>,
    /// South-west longitude.
    pub sw_lng: Option<String>,
    /// North-east latitude.
    pub ne_lat: Option<String>,
    /// North-east longitude.
    pub ne_lng: Option<String>,
    /// `1` or `true` skips the cached answer (the fresh one is still cached).
    pub fresh: Option<String>,
}

impl BoundsSearchParams {
    /// Parses the four corners into an (unvalidated) bounding box.
    ///
    /// # Errors
    ///
    /// Returns an [`ApiError`] naming the first missing or non-numeric
    /// parameter.
    pub fn to_bounding_box(&self) -> Result<BoundingBox, ApiError> {
        let field = |name: &str, value: Option<&String>| -> Result<f64, ApiError> {
            let raw = value.ok_or_else(|| {
                ApiError::new("Invalid bounds").with_details(format!("missing parameter {name}"))
            })?;
            raw.trim().parse::<f64>().map_err(|_| {
                ApiError::new("Invalid bounds")
                    .with_details(format!("parameter {name} is not a number: {raw}"))
            })
        };

        Ok(BoundingBox::new(
            field("sw_lat", self.sw_lat.as_ref())?,
            field("sw_lng", self.sw_lng.as_ref())?,
            field("ne_lat", self.ne_lat.as_ref())?,
            field("ne_lng", self.ne_lng.as_ref())?,
        ))
    }

    /// Whether the caller asked to skip the cache.
    #[must_use]
    pub fn wants_fresh(&self) -> bool {
        self.fresh
            .as_deref()
            .is_some_and(|v| v == "1" || v.eq_ignore_ascii_case("true"))
    }
}

/// Pagination of `GET /users/{id}/saved-reports`.
#[derive(Debug, Clone, Deserialize)]
pub struct SavedReportsParams {
    /// 1-based page number (default 1).
    pub page: Option<u32>,
    /// Page size (default 10, capped at 100).
    pub limit: Option<u32>,
}

/// A report row as stored by the backing data service.
///
/// Only the columns the server acts on are typed; everything else is carried
/// through untouched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReportRow {
    /// Report id.
    pub id: String,
    /// Author of the report.
    pub author_id: String,
    /// Remaining columns.
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

/// Body of `POST /reports`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateReportRequest {
    /// Author of the report.
    pub author_id: String,
    /// Remaining report fields, forwarded untouched.
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

/// Body of `PATCH /reports/{id}`: the fields to change.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UpdateReportRequest {
    /// Changed fields, forwarded untouched.
    pub fields: Map<String, Value>,
}

/// Body of `POST /reports/{id}/comments`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateCommentRequest {
    /// Author of the comment.
    pub author_id: String,
    /// Comment text.
    pub body: String,
}

/// Body of `POST`/`DELETE /reports/{id}/save`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SaveReportRequest {
    /// User whose saved list changes.
    pub user_id: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(sw_lat: &str, sw_lng: &str, ne_lat: &str, ne_lng: &str) -> BoundsSearchParams {
        BoundsSearchParams {
            sw_lat: Some(sw_lat.to_string()),
            sw_lng: Some(sw_lng.to_string()),
            ne_lat: Some(ne_lat.to_string()),
            ne_lng: Some(ne_lng.to_string()),
            fresh: None,
        }
    }

    #[test]
    fn fresh_flag_accepts_one_or_true() {
        let mut p = params("1", "2", "3", "4");
        assert!(!p.wants_fresh());
        p.fresh = Some("1".to_string());
        assert!(p.wants_fresh());
        p.fresh = Some("TRUE".to_string());
        assert!(p.wants_fresh());
        p.fresh = Some("0".to_string());
        assert!(!p.wants_fresh());
    }

    #[test]
    fn parses_all_four_corners() {
        let bbox = params("10.30", "123.85", "10.35", "123.95")
            .to_bounding_box()
            .unwrap();
        assert_eq!(bbox, BoundingBox::new(10.30, 123.85, 10.35, 123.95));
    }

    #[test]
    fn names_missing_parameter() {
        let mut p = params("1", "2", "3", "4");
        p.ne_lng = None;
        let err = p.to_bounding_box().unwrap_err();
        assert_eq!(err.details.as_deref(), Some("missing parameter ne_lng"));
    }

    #[test]
    fn rejects_non_numeric_values() {
        let err = params("1", "east", "3", "4").to_bounding_box().unwrap_err();
        assert_eq!(err.error, "Invalid bounds");
    }

    #[test]
    fn nan_parses_and_is_left_to_validation() {
        let bbox = params("NaN", "2", "3", "4").to_bounding_box().unwrap();
        assert!(bbox.validated().is_err());
    }

    #[test]
    fn create_request_keeps_extra_fields() {
        let req: CreateReportRequest = serde_json::from_str(
            r#"{"author_id":"u1","title":"Pothole","urgency":"High","lat":1.0,"lng":2.0}"#,
        )
        .unwrap();
        assert_eq!(req.author_id, "u1");
        assert_eq!(req.fields["title"], "Pothole");
        assert!(!req.fields.contains_key("author_id"));
    }
}
