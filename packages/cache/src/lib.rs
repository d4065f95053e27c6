#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions, clippy::cargo_common_metadata)]

//! Look-aside cache in front of the spatial query service and the report
//! data service.
//!
//! Caching is an optimization only. Every read through [`CacheStore`] has a
//! miss fallback, so an unreachable or empty store yields the same results
//! as a warm one, just slower:
//!
//! - [`keys`]: canonical key strings. Bounding boxes are quantized to a
//!   0.01° grid so nearby viewports share entries.
//! - [`store`]: the [`KeyValueStore`] primitive and the error-swallowing
//!   [`CacheStore`] wrapper callers actually use.
//! - [`memory`]: explicitly owned in-process store with TTL sweeping.
//! - [`rest`]: remote store speaking the Redis-over-HTTP protocol.
//! - [`tiered`]: in-process layer stacked in front of a remote one.

pub mod keys;
pub mod memory;
pub mod pattern;
pub mod rest;
pub mod store;
pub mod tiered;

pub use keys::CacheKey;
pub use memory::MemoryStore;
pub use rest::RestStore;
pub use store::{CacheStore, KeyValueStore};
pub use tiered::TieredStore;

use thiserror::Error;

/// Errors raised by [`KeyValueStore`] backends.
///
/// These never escape [`CacheStore`]; they exist so backends can report
/// precisely what went wrong before it is logged and treated as a miss.
#[derive(Debug, Error)]
pub enum CacheError {
    /// HTTP transport to the remote store failed.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// The remote store answered with an error reply.
    #[error("Store error: {message}")]
    Backend {
        /// Error text returned by the store.
        message: String,
    },

    /// A payload could not be encoded or decoded.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A key pattern could not be compiled.
    #[error("Invalid key pattern: {0}")]
    Pattern(#[from] regex::Error),
}
