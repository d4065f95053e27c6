#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions)]

//! Map-facing projections of civic issue reports.
//!
//! A [`Pin`] is the minimal marker projection of a report (id, urgency and
//! coordinates) and never carries full report content. A [`BoundingBox`]
//! describes the viewport a set of pins was queried for. Both are
//! immutable snapshots: they are replaced, never mutated.

use serde::{Deserialize, Serialize};
use strum_macros::{AsRefStr, Display, EnumString};
use thiserror::Error;

/// How urgently a reported issue needs attention.
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
#[serde(try_from = "String")]
#[strum(ascii_case_insensitive)]
pub enum Urgency {
    /// Cosmetic or long-standing issues.
    Low,
    /// Issues that should be handled in the normal course of work.
    Medium,
    /// Hazards that need prompt attention.
    High,
}

impl TryFrom<String> for Urgency {
    type Error = strum::ParseError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.trim().parse()
    }
}

/// Map-relevant projection of a single report.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Pin {
    /// Identifier of the report this pin represents.
    pub report_id: String,
    /// Urgency, used to pick the marker icon.
    pub urgency: Urgency,
    /// Latitude (WGS84).
    pub lat: f64,
    /// Longitude (WGS84).
    pub lng: f64,
}

impl Pin {
    /// Creates a new pin.
    #[must_use]
    pub fn new(report_id: impl Into<String>, urgency: Urgency, lat: f64, lng: f64) -> Self {
        Self {
            report_id: report_id.into(),
            urgency,
            lat,
            lng,
        }
    }
}

/// Reasons a bounding box is rejected before any lookup is attempted.
#[derive(Debug, Clone, Copy, PartialEq, Error)]
pub enum BoundsError {
    /// A coordinate was NaN or infinite.
    #[error("Coordinate {field} is not a finite number")]
    NotFinite {
        /// Name of the offending coordinate.
        field: &'static str,
    },

    /// A coordinate lies outside the WGS84 range for its axis.
    #[error("Coordinate {field}={value} is out of range")]
    OutOfRange {
        /// Name of the offending coordinate.
        field: &'static str,
        /// The rejected value.
        value: f64,
    },

    /// The western edge lies east of the eastern edge.
    ///
    /// Boxes crossing the antimeridian are not supported by the cache key
    /// scheme, so they are rejected instead of being reinterpreted.
    #[error("Bounding box crosses the antimeridian (sw_lng={sw_lng}, ne_lng={ne_lng})")]
    CrossesAntimeridian {
        /// South-west longitude.
        sw_lng: f64,
        /// North-east longitude.
        ne_lng: f64,
    },
}

/// A geographic bounding box in WGS84 degrees, given by its south-west and
/// north-east corners.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    /// South-west corner latitude.
    pub sw_lat: f64,
    /// South-west corner longitude.
    pub sw_lng: f64,
    /// North-east corner latitude.
    pub ne_lat: f64,
    /// North-east corner longitude.
    pub ne_lng: f64,
}

impl BoundingBox {
    /// Creates a new bounding box from the given corners.
    #[must_use]
    pub const fn new(sw_lat: f64, sw_lng: f64, ne_lat: f64, ne_lng: f64) -> Self {
        Self {
            sw_lat,
            sw_lng,
            ne_lat,
            ne_lng,
        }
    }

    /// Returns a normalized copy of this box, or the reason it is unusable.
    ///
    /// Latitudes given in north/south order are swapped so that
    /// `sw_lat <= ne_lat`. Longitudes are never swapped: `sw_lng > ne_lng`
    /// means the box wraps around the antimeridian.
    ///
    /// # Errors
    ///
    /// Returns [`BoundsError`] if any coordinate is not finite, outside the
    /// WGS84 range, or the box crosses the antimeridian.
    pub fn validated(self) -> Result<Self, BoundsError> {
        let coords = [
            ("sw_lat", self.sw_lat, 90.0),
            ("sw_lng", self.sw_lng, 180.0),
            ("ne_lat", self.ne_lat, 90.0),
            ("ne_lng", self.ne_lng, 180.0),
        ];

        for (field, value, limit) in coords {
            if !value.is_finite() {
                return Err(BoundsError::NotFinite { field });
            }
            if value.abs() > limit {
                return Err(BoundsError::OutOfRange { field, value });
            }
        }

        if self.sw_lng > self.ne_lng {
            return Err(BoundsError::CrossesAntimeridian {
                sw_lng: self.sw_lng,
                ne_lng: self.ne_lng,
            });
        }

        let (sw_lat, ne_lat) = if self.sw_lat <= self.ne_lat {
            (self.sw_lat, self.ne_lat)
        } else {
            (self.ne_lat, self.sw_lat)
        };

        Ok(Self::new(sw_lat, self.sw_lng, ne_lat, self.ne_lng))
    }

    /// Whether the point lies inside this box (edges inclusive).
    #[must_use]
    pub fn contains(&self, lat: f64, lng: f64) -> bool {
        lat >= self.sw_lat && lat <= self.ne_lat && lng >= self.sw_lng && lng <= self.ne_lng
    }
}
