//! Canonical cache key strings.
//!
//! The same strings are produced on the read side (look-aside lookups) and
//! the write side (invalidation), so every key in the system is built here.
//!
//! | Key | Format | TTL |
//! |---|---|---|
//! | Bounds | `map:bounds:{swLat:.2}:{swLng:.2}:{neLat:.2}:{neLng:.2}` | 300 s |
//! | Report | `report:{id}` | 600 s |
//! | Comments | `report:{id}:comments` | 300 s |
//! | Authored reports | `user:reports:{userId}` | 600 s |
//! | Saved reports | `user:saved-reports:{userId}:page{N}:limit{M}` | 300 s |

use std::fmt;
use std::time::Duration;

use civic_map_report_models::BoundingBox;

use crate::pattern;

/// Prefix shared by every bounds key.
pub const BOUNDS_PREFIX: &str = "map:bounds";

/// Pattern matching every cached bounds entry.
pub const BOUNDS_PATTERN: &str = "map:bounds:*";

/// TTL of bounds and comment entries.
pub const SHORT_TTL: Duration = Duration::from_secs(300);

/// TTL of single-report and authored-report entries.
pub const LONG_TTL: Duration = Duration::from_secs(600);

/// Number of decimal places bounds coordinates are quantized to
/// (≈1.1 km at the equator).
pub const BOUNDS_PRECISION: i32 = 2;

/// Rounds a coordinate onto the bounds key grid.
///
/// Negative zero is folded into positive zero so that `-0.001` and `0.001`
/// land on the same key.
#[must_use]
pub fn quantize(value: f64) -> f64 {
    let scale = 10f64.powi(BOUNDS_PRECISION);
    (value * scale).round() / scale + 0.0
}

/// Builds the quantized key for a bounding box.
///
/// Two boxes whose corners round to the same grid cell produce the same
/// key. That collision is the point: it trades precision for hit rate.
#[must_use]
pub fn bounds_key(bbox: &BoundingBox) -> String {
    format!(
        "{BOUNDS_PREFIX}:{:.2}:{:.2}:{:.2}:{:.2}",
        quantize(bbox.sw_lat),
        quantize(bbox.sw_lng),
        quantize(bbox.ne_lat),
        quantize(bbox.ne_lng),
    )
}

/// Kinds of entity keyed by a single identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntityKind {
    /// A single report payload.
    Report,
    /// Comment list of a report.
    ReportComments,
    /// Reports authored by a user.
    UserReports,
}

/// Builds the namespaced key for an entity. No rounding is involved.
#[must_use]
pub fn entity_key(kind: EntityKind, id: &str) -> String {
    match kind {
        EntityKind::Report => format!("report:{id}"),
        EntityKind::ReportComments => format!("report:{id}:comments"),
        EntityKind::UserReports => format!("user:reports:{id}"),
    }
}

/// Pattern matching every saved-reports page of one user.
///
/// The id is escaped, so an id containing glob characters never reaches
/// another user's pages.
#[must_use]
pub fn user_saved_reports_pattern(user_id: &str) -> String {
    format!("user:saved-reports:{}:*", pattern::escape(user_id))
}

/// A typed cache key, rendered to its canonical string via `Display`.
#[derive(Debug, Clone, PartialEq)]
pub enum CacheKey {
    /// Pins inside a (quantized) viewport.
    Bounds(BoundingBox),
    /// A single report payload.
    Report(String),
    /// Comments of a report.
    ReportComments(String),
    /// Reports authored by a user.
    UserReports(String),
    /// One page of a user's saved reports.
    UserSavedReports {
        /// Owner of the saved list.
        user_id: String,
        /// 1-based page number.
        page: u32,
        /// Page size.
        limit: u32,
    },
}

impl CacheKey {
    /// How long an entry under this key stays valid.
    #[must_use]
    pub const fn ttl(&self) -> Duration {
        match self {
            Self::Bounds(_) | Self::ReportComments(_) | Self::UserSavedReports { .. } => SHORT_TTL,
            Self::Report(_) | Self::UserReports(_) => LONG_TTL,
        }
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bounds(bbox) => f.write_str(&bounds_key(bbox)),
            Self::Report(id) => f.write_str(&entity_key(EntityKind::Report, id)),
            Self::ReportComments(id) => f.write_str(&entity_key(EntityKind::ReportComments, id)),
            Self::UserReports(id) => f.write_str(&entity_key(EntityKind::UserReports, id)),
            Self::UserSavedReports {
                user_id,
                page,
                limit,
            } => write!(f, "user:saved-reports:{user_id}:page{page}:limit{limit}"),
        }
    }
}
