//! Coordinator tuning, loadable from TOML.

use std::time::Duration;

use civic_map_events::Topic;
use serde::{Deserialize, Serialize};

/// Tuning knobs of a [`crate::ViewportQueryCoordinator`].
///
/// ```toml
/// pin_ttl_secs = 300
/// query_timeout_secs = 10
/// max_consecutive_timeouts = 3
/// refresh_topics = ["new-report-created", "report-changed"]
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinatorConfig {
    /// TTL of bounds entries written after a service query.
    pub pin_ttl_secs: u64,
    /// Deadline of a single service query.
    pub query_timeout_secs: u64,
    /// Consecutive timeouts tolerated before an error is surfaced.
    pub max_consecutive_timeouts: u32,
    /// Topics that make a live coordinator re-query its viewport.
    pub refresh_topics: Vec<Topic>,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            pin_ttl_secs: 300,
            query_timeout_secs: 10,
            max_consecutive_timeouts: 3,
            refresh_topics: vec![Topic::NewReportCreated, Topic::ReportChanged],
        }
    }
}

impl CoordinatorConfig {
    /// TTL as a [`Duration`].
    #[must_use]
    pub const fn pin_ttl(&self) -> Duration {
        Duration::from_secs(self.pin_ttl_secs)
    }

    /// Query deadline as a [`Duration`].
    #[must_use]
    pub const fn query_timeout(&self) -> Duration {
        Duration::from_secs(self.query_timeout_secs)
    }

    /// Parses a configuration from TOML, filling gaps with defaults.
    ///
    /// # Errors
    ///
    /// Returns a [`toml::de::Error`] if the document is malformed.
    pub fn from_toml_str(s: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(s)
    }
}
