//! Server configuration.
//!
//! Values come from, in increasing precedence: built-in defaults, an
//! optional TOML file, environment variables, and command-line flags.

use std::path::{Path, PathBuf};

use serde::Deserialize;
use thiserror::Error;

/// Errors raised while loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The config file could not be read.
    #[error("Failed to read {path}: {source}")]
    Io {
        /// The file that failed.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// The config file is not valid TOML for [`ServerConfig`].
    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),

    /// An environment variable holds an unusable value.
    #[error("Invalid value for {name}: {value}")]
    InvalidEnv {
        /// Variable name.
        name: &'static str,
        /// Offending value.
        value: String,
    },
}

/// Remote cache settings.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Base URL of the Redis-over-HTTP store. In-process only when unset.
    pub rest_url: Option<String>,
    /// Bearer token for the remote store.
    pub rest_token: Option<String>,
    /// TTL cap for entries mirrored into the in-process layer.
    pub local_ttl_secs: u64,
    /// How often expired in-process entries are swept.
    pub sweep_interval_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            rest_url: None,
            rest_token: None,
            local_ttl_secs: 60,
            sweep_interval_secs: 60,
        }
    }
}

/// Backing data service settings.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct BackendConfig {
    /// Base URL of the PostgREST-style data service.
    pub url: String,
    /// API key sent as `apikey` and bearer token.
    pub api_key: Option<String>,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            url: "http://127.0.0.1:3000".to_string(),
            api_key: None,
        }
    }
}

/// Full server configuration.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Address to bind.
    pub bind_addr: String,
    /// Port to bind.
    pub port: u16,
    /// Frontend build to serve at `/`, if any.
    pub static_dir: Option<PathBuf>,
    /// Cache settings.
    pub cache: CacheConfig,
    /// Data service settings.
    pub backend: BackendConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1".to_string(),
            port: 8080,
            static_dir: None,
            cache: CacheConfig::default(),
            backend: BackendConfig::default(),
        }
    }
}

impl ServerConfig {
    /// Parses a TOML document, filling gaps with defaults.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Toml`] if the document is malformed.
    pub fn from_toml_str(s: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(s)?)
    }

    /// Loads the optional file at `path`, then applies the process
    /// environment.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the file cannot be read or parsed, or an
    /// environment variable is malformed.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => {
                let contents =
                    std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
                        path: path.to_path_buf(),
                        source,
                    })?;
                log::info!("Loaded configuration from {}", path.display());
                Self::from_toml_str(&contents)?
            }
            None => Self::default(),
        };

        config.apply_env(|name| std::env::var(name).ok())?;
        Ok(config)
    }

    /// Overrides fields from environment variables looked up via `lookup`.
    ///
    /// Recognised: `BIND_ADDR`, `PORT`, `CACHE_REST_URL`,
    /// `CACHE_REST_TOKEN`, `BACKEND_URL`, `BACKEND_API_KEY`.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidEnv`] if `PORT` is not a port number.
    pub fn apply_env(
        &mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<(), ConfigError> {
        if let Some(bind_addr) = lookup("BIND_ADDR") {
            self.bind_addr = bind_addr;
        }
        if let Some(port) = lookup("PORT") {
            self.port = port.parse().map_err(|_| ConfigError::InvalidEnv {
                name: "PORT",
                value: port,
            })?;
        }
        if let Some(url) = lookup("CACHE_REST_URL") {
            self.cache.rest_url = Some(url);
        }
        if let Some(token) = lookup("CACHE_REST_TOKEN") {
            self.cache.rest_token = Some(token);
        }
        if let Some(url) = lookup("BACKEND_URL") {
            self.backend.url = url;
        }
        if let Some(key) = lookup("BACKEND_API_KEY") {
            self.backend.api_key = Some(key);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: BTreeMap<String, String> = pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    #[test]
    fn toml_sections_override_defaults() {
        let config = ServerConfig::from_toml_str(
            r#"
            port = 9000

            [cache]
            rest_url = "https://cache.example"

            [backend]
            url = "https://db.example/rest/v1"
            "#,
        )
        .unwrap();

        assert_eq!(config.port, 9000);
        assert_eq!(config.bind_addr, "127.0.0.1");
        assert_eq!(config.cache.rest_url.as_deref(), Some("https://cache.example"));
        assert_eq!(config.cache.local_ttl_secs, 60);
        assert_eq!(config.backend.url, "https://db.example/rest/v1");
    }

    #[test]
    fn environment_wins_over_file() {
        let mut config = ServerConfig::from_toml_str("port = 9000").unwrap();
        config
            .apply_env(env(&[("PORT", "7000"), ("CACHE_REST_TOKEN", "secret")]))
            .unwrap();

        assert_eq!(config.port, 7000);
        assert_eq!(config.cache.rest_token.as_deref(), Some("secret"));
    }

    #[test]
    fn rejects_bad_port() {
        let mut config = ServerConfig::default();
        let err = config.apply_env(env(&[("PORT", "eighty")])).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidEnv { name: "PORT", .. }));
    }

    #[test]
    fn rejects_unknown_types() {
        assert!(ServerConfig::from_toml_str("port = \"high\"").is_err());
    }
}
