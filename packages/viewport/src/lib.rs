#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions, clippy::cargo_common_metadata)]

//! Viewport-driven pin loading for the civic issue map.
//!
//! Keeps the rendered markers consistent with the user's current viewport:
//!
//! 1. [`ViewportQueryCoordinator`] turns viewport changes into at most one
//!    in-flight pin query, cancelling superseded ones, consulting the
//!    look-aside cache before the [`SpatialQueryService`], and publishing
//!    the result of the most recent viewport only.
//! 2. [`MarkerSync`] diffs each published pin set against the markers on
//!    the map and applies the minimal add/remove churn.
//! 3. [`RemoteEventBridge`] relays server-side invalidation notifications
//!    to a local broker so live coordinators re-query with the cache
//!    bypassed.

pub mod config;
pub mod coordinator;
pub mod marker_sync;
pub mod remote_events;
pub mod service;

pub use config::CoordinatorConfig;
pub use coordinator::{
    CoordinatorState, PinSource, RequestHandle, RequestOutcome, ViewportQueryCoordinator,
    ViewportSnapshot,
};
pub use marker_sync::{MapSurface, MarkerSync, SyncDiff};
pub use remote_events::{RemoteEventBridge, SseDecoder};
pub use service::{HttpSpatialQueryService, SpatialQueryService};

use std::fmt;
use std::time::Duration;

use thiserror::Error;

/// Errors from the spatial query service.
#[derive(Debug, Error)]
pub enum QueryError {
    /// HTTP transport failed.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// The service answered with an error status.
    #[error("Spatial query failed with HTTP {status}: {message}")]
    Status {
        /// HTTP status code.
        status: u16,
        /// `error` field of the response body.
        message: String,
        /// `details` field of the response body, if any.
        details: Option<String>,
    },

    /// The response body was not a pin list.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The service failed for a non-HTTP reason.
    #[error("Spatial query failed: {message}")]
    Service {
        /// Description of the failure.
        message: String,
    },
}

/// Category of a recoverable viewport error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ViewportErrorKind {
    /// The query failed outright.
    Network,
    /// Too many consecutive queries exceeded their deadline.
    Timeout,
}

/// Recoverable error state shown alongside the last-known-good pins.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ViewportError {
    /// What went wrong.
    pub kind: ViewportErrorKind,
    /// Diagnostic detail for logs.
    pub detail: String,
}

impl ViewportError {
    pub(crate) fn network(error: &QueryError) -> Self {
        Self {
            kind: ViewportErrorKind::Network,
            detail: error.to_string(),
        }
    }

    pub(crate) fn timeout(consecutive: u32, deadline: Duration) -> Self {
        Self {
            kind: ViewportErrorKind::Timeout,
            detail: format!("{consecutive} consecutive queries exceeded {deadline:?}"),
        }
    }
}

impl fmt::Display for ViewportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Unable to load markers for this area")
    }
}

impl std::error::Error for ViewportError {}
