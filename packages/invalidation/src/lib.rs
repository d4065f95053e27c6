#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions, clippy::cargo_common_metadata)]

//! Cache invalidation for report mutations.
//!
//! Every successful write maps to a [`Mutation`]. [`Mutation::plan`] turns
//! it into the exact keys and key patterns that are now stale, plus the
//! [`Notification`] to broadcast afterwards:
//!
//! | Mutation | Deleted keys | Deleted patterns | Topic |
//! |---|---|---|---|
//! | report created | `user:reports:<author>` | `map:bounds:*` | `new-report-created` |
//! | report updated/deleted | `report:<id>`, `user:reports:<author>` | | `report-changed` |
//! | comment created | `report:<id>:comments`, `report:<id>` | | `comments-changed` |
//! | report saved/unsaved | | `user:saved-reports:<user>:*` | `saved-reports-changed` |
//!
//! A created report may fall inside any cached viewport, and finding the
//! affected bounds keys would mean decoding every one of them, so the
//! whole bounds cache is dropped instead.

use std::sync::Arc;

use civic_map_cache::CacheStore;
use civic_map_cache::keys::{BOUNDS_PATTERN, EntityKind, entity_key, user_saved_reports_pattern};
use civic_map_events::{EventBroker, InvalidationEvent, Notification, Topic};
use serde::{Deserialize, Serialize};

/// A successful write against the report data service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Mutation {
    /// A report was created.
    #[serde(rename_all = "camelCase")]
    ReportCreated {
        /// The new report.
        report_id: String,
        /// Its author.
        author_id: String,
    },
    /// A report was edited.
    #[serde(rename_all = "camelCase")]
    ReportUpdated {
        /// The edited report.
        report_id: String,
        /// Its author.
        author_id: String,
    },
    /// A report was deleted.
    #[serde(rename_all = "camelCase")]
    ReportDeleted {
        /// The deleted report.
        report_id: String,
        /// Its author.
        author_id: String,
    },
    /// A comment was added to a report.
    #[serde(rename_all = "camelCase")]
    CommentCreated {
        /// The commented report.
        report_id: String,
    },
    /// A user saved a report.
    #[serde(rename_all = "camelCase")]
    ReportSaved {
        /// The saved report.
        report_id: String,
        /// The user whose saved list changed.
        user_id: String,
    },
    /// A user unsaved a report.
    #[serde(rename_all = "camelCase")]
    ReportUnsaved {
        /// The unsaved report.
        report_id: String,
        /// The user whose saved list changed.
        user_id: String,
    },
}

/// The cache work and broadcast derived from one [`Mutation`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvalidationPlan {
    /// Exact keys to delete.
    pub keys: Vec<String>,
    /// Glob patterns whose matches are deleted.
    pub patterns: Vec<String>,
    /// Notification published once the deletes have been attempted.
    pub notification: Notification,
}

impl Mutation {
    /// Id of the report the mutation concerns.
    #[must_use]
    pub fn report_id(&self) -> &str {
        match self {
            Self::ReportCreated { report_id, .. }
            | Self::ReportUpdated { report_id, .. }
            | Self::ReportDeleted { report_id, .. }
            | Self::CommentCreated { report_id }
            | Self::ReportSaved { report_id, .. }
            | Self::ReportUnsaved { report_id, .. } => report_id,
        }
    }

    /// Derives the stale keys and the notification for this mutation.
    #[must_use]
    pub fn plan(&self) -> InvalidationPlan {
        let report_id = Some(self.report_id().to_string());

        let (keys, patterns, topic, scopes) = match self {
            Self::ReportCreated { author_id, .. } => (
                vec![entity_key(EntityKind::UserReports, author_id)],
                vec![BOUNDS_PATTERN.to_string()],
                Topic::NewReportCreated,
                vec![
                    InvalidationEvent::user_reports(author_id),
                    InvalidationEvent::map_bounds(),
                ],
            ),
            Self::ReportUpdated {
                report_id,
                author_id,
            }
            | Self::ReportDeleted {
                report_id,
                author_id,
            } => (
                vec![
                    entity_key(EntityKind::Report, report_id),
                    entity_key(EntityKind::UserReports, author_id),
                ],
                Vec::new(),
                Topic::ReportChanged,
                vec![
                    InvalidationEvent::report(report_id),
                    InvalidationEvent::user_reports(author_id),
                ],
            ),
            Self::CommentCreated { report_id } => (
                vec![
                    entity_key(EntityKind::ReportComments, report_id),
                    entity_key(EntityKind::Report, report_id),
                ],
                Vec::new(),
                Topic::CommentsChanged,
                vec![InvalidationEvent::report(report_id)],
            ),
            Self::ReportSaved { user_id, .. } | Self::ReportUnsaved { user_id, .. } => (
                Vec::new(),
                vec![user_saved_reports_pattern(user_id)],
                Topic::SavedReportsChanged,
                vec![InvalidationEvent::user_saved_reports(user_id)],
            ),
        };

        InvalidationPlan {
            keys,
            patterns,
            notification: Notification::new(topic, report_id, scopes),
        }
    }
}

/// Result of a single pattern delete.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PatternOutcome {
    /// The pattern that was enumerated.
    pub pattern: String,
    /// Number of removed keys, or `None` if the store failed.
    pub removed: Option<u64>,
}

/// What an invalidation actually achieved.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InvalidationReport {
    /// Exact keys the store acknowledged deleting.
    pub deleted_keys: Vec<String>,
    /// Exact keys whose delete failed. They expire with their TTL.
    pub failed_keys: Vec<String>,
    /// Per-pattern results.
    pub patterns: Vec<PatternOutcome>,
    /// Number of listeners the notification reached.
    pub notified: usize,
}

impl InvalidationReport {
    /// Whether every delete was acknowledged.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.failed_keys.is_empty() && self.patterns.iter().all(|p| p.removed.is_some())
    }
}

/// Deletes stale cache entries after writes and broadcasts the change.
#[derive(Clone)]
pub struct MutationInvalidator {
    cache: Arc<CacheStore>,
    broker: EventBroker,
}

impl MutationInvalidator {
    /// Creates an invalidator over the shared cache and broker.
    #[must_use]
    pub const fn new(cache: Arc<CacheStore>, broker: EventBroker) -> Self {
        Self { cache, broker }
    }

    /// Invalidates everything a mutation made stale, then notifies.
    ///
    /// Exact deletes run concurrently; pattern deletes follow. Failures are
    /// logged and not retried: the affected entries stay stale at most
    /// until their TTL. The notification is published regardless, so live
    /// listeners still re-query.
    pub async fn invalidate(&self, mutation: &Mutation) -> InvalidationReport {
        let InvalidationPlan {
            keys,
            patterns,
            notification,
        } = mutation.plan();

        let key_results =
            futures::future::join_all(keys.iter().map(|key| self.cache.delete(key))).await;

        let (deleted, failed): (Vec<_>, Vec<_>) = keys
            .into_iter()
            .zip(key_results)
            .partition(|(_, acknowledged)| *acknowledged);

        let mut pattern_outcomes = Vec::with_capacity(patterns.len());
        for pattern in patterns {
            let removed = self.cache.delete_by_pattern(&pattern).await;
            pattern_outcomes.push(PatternOutcome { pattern, removed });
        }

        let report = InvalidationReport {
            deleted_keys: deleted.into_iter().map(|(key, _)| key).collect(),
            failed_keys: failed.into_iter().map(|(key, _)| key).collect(),
            patterns: pattern_outcomes,
            notified: self.broker.publish(&notification),
        };

        if report.is_complete() {
            log::debug!("Invalidated {mutation:?}: {report:?}");
        } else {
            log::warn!("Partial invalidation for {mutation:?}: {report:?}");
        }

        report
    }
}
