#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions)]

//! Invalidation notifications and their broker.
//!
//! After a write invalidates cache entries server-side, a [`Notification`]
//! is published on a typed [`Topic`] so that open viewports and list views
//! re-query with the cache bypassed. Delivery is best-effort and only
//! reaches listeners alive at publish time; nothing is persisted or
//! replayed.

pub mod broker;

pub use broker::{EventBroker, SUBSCRIBER_BUFFER, Subscription};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum_macros::{AsRefStr, Display, EnumString};

/// Which family of cache entries an invalidation touched.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
    Display,
    EnumString,
    AsRefStr,
)]
#[serde(rename_all = "camelCase")]
#[strum(serialize_all = "camelCase")]
pub enum InvalidationScope {
    /// A single report payload (and its comments).
    Report,
    /// The list of reports authored by a user.
    UserReports,
    /// The paginated saved-report lists of a user.
    UserSavedReports,
    /// Every cached viewport.
    MapBounds,
}

/// One invalidated scope, optionally narrowed to an id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvalidationEvent {
    /// Family of entries affected.
    pub scope: InvalidationScope,
    /// Report or user id the scope was narrowed to, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
}

impl InvalidationEvent {
    /// A single report was invalidated.
    #[must_use]
    pub fn report(report_id: impl Into<String>) -> Self {
        Self {
            scope: InvalidationScope::Report,
            id: Some(report_id.into()),
        }
    }

    /// A user's authored-report list was invalidated.
    #[must_use]
    pub fn user_reports(user_id: impl Into<String>) -> Self {
        Self {
            scope: InvalidationScope::UserReports,
            id: Some(user_id.into()),
        }
    }

    /// A user's saved-report pages were invalidated.
    #[must_use]
    pub fn user_saved_reports(user_id: impl Into<String>) -> Self {
        Self {
            scope: InvalidationScope::UserSavedReports,
            id: Some(user_id.into()),
        }
    }

    /// Every cached viewport was invalidated.
    #[must_use]
    pub const fn map_bounds() -> Self {
        Self {
            scope: InvalidationScope::MapBounds,
            id: None,
        }
    }
}

/// Broadcast topic a notification is published on.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
    Display,
    EnumString,
    AsRefStr,
)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub enum Topic {
    /// A report was created; any viewport may now contain a new pin.
    NewReportCreated,
    /// A report was edited or deleted.
    ReportChanged,
    /// A comment was added to a report.
    CommentsChanged,
    /// A user saved or unsaved a report.
    SavedReportsChanged,
}

/// A message on the invalidation channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Notification {
    /// Topic this notification was published on.
    pub topic: Topic,
    /// Report the originating write concerned.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub report_id: Option<String>,
    /// Cache scopes that were invalidated before publishing.
    #[serde(default)]
    pub scopes: Vec<InvalidationEvent>,
    /// When the notification was emitted.
    pub emitted_at: DateTime<Utc>,
}

impl Notification {
    /// Creates a notification stamped with the current time.
    #[must_use]
    pub fn new(topic: Topic, report_id: Option<String>, scopes: Vec<InvalidationEvent>) -> Self {
        Self {
            topic,
            report_id,
            scopes,
            emitted_at: Utc::now(),
        }
    }

    /// Whether any invalidated scope belongs to the given family.
    #[must_use]
    pub fn touches(&self, scope: InvalidationScope) -> bool {
        self.scopes.iter().any(|event| event.scope == scope)
    }
}
