//! Remote key/value store reached over the Redis-over-HTTP protocol.
//!
//! Each command is POSTed as a JSON array (`["SET", "k", "v", "EX", "300"]`)
//! with a bearer token. Replies are `{"result": ...}` on success and
//! `{"error": "..."}` on failure. Key enumeration uses `SCAN` so large
//! keyspaces are walked incrementally rather than blocking the store.

use std::collections::BTreeSet;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use crate::CacheError;
use crate::store::KeyValueStore;

/// Number of keys requested per `SCAN` round trip.
const DEFAULT_SCAN_COUNT: u32 = 500;

/// Deadline for a whole command round trip. A slow cache is a miss.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(2);

/// Deadline for establishing a connection to the store.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(1);

/// Client for a hosted Redis-compatible REST endpoint.
#[derive(Debug, Clone)]
pub struct RestStore {
    client: reqwest::Client,
    base_url: String,
    token: String,
    scan_count: u32,
}

impl RestStore {
    /// Creates a store client with its own HTTP client, bounded by
    /// [`REQUEST_TIMEOUT`] and [`CONNECT_TIMEOUT`].
    #[must_use]
    pub fn new(base_url: impl Into<String>, token: impl Into<String>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .unwrap_or_else(|e| {
                log::warn!("Falling back to an unconfigured HTTP client: {e}");
                reqwest::Client::new()
            });
        Self::with_client(client, base_url, token)
    }

    /// Creates a store client sharing an existing HTTP client.
    #[must_use]
    pub fn with_client(
        client: reqwest::Client,
        base_url: impl Into<String>,
        token: impl Into<String>,
    ) -> Self {
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token: token.into(),
            scan_count: DEFAULT_SCAN_COUNT,
        }
    }

    async fn command(&self, args: &[String]) -> Result<Value, CacheError> {
        let body: Value = self
            .client
            .post(&self.base_url)
            .bearer_auth(&self.token)
            .json(args)
            .send()
            .await?
            .json()
            .await?;
        parse_reply(body)
    }
}

fn set_command(key: &str, value: String, ttl: Duration) -> Vec<String> {
    vec![
        "SET".to_string(),
        key.to_string(),
        value,
        "EX".to_string(),
        ttl.as_secs().max(1).to_string(),
    ]
}

fn scan_command(cursor: &str, pattern: &str, count: u32) -> Vec<String> {
    vec![
        "SCAN".to_string(),
        cursor.to_string(),
        "MATCH".to_string(),
        pattern.to_string(),
        "COUNT".to_string(),
        count.to_string(),
    ]
}

/// Unwraps a `{result}` reply or converts an `{error}` reply.
fn parse_reply(body: Value) -> Result<Value, CacheError> {
    if let Some(message) = body.get("error").and_then(Value::as_str) {
        return Err(CacheError::Backend {
            message: message.to_string(),
        });
    }

    match body {
        Value::Object(mut map) => map.remove("result").ok_or_else(|| CacheError::Backend {
            message: "reply has neither result nor error".to_string(),
        }),
        other => Err(CacheError::Backend {
            message: format!("unexpected reply: {other}"),
        }),
    }
}

/// Splits a `SCAN` result `[cursor, [keys...]]`.
fn parse_scan(result: &Value) -> Result<(String, Vec<String>), CacheError> {
    let malformed = || CacheError::Backend {
        message: format!("malformed SCAN reply: {result}"),
    };

    let parts = result.as_array().ok_or_else(malformed)?;
    let cursor = match parts.first() {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Number(n)) => n.to_string(),
        _ => return Err(malformed()),
    };
    let keys = parts
        .get(1)
        .and_then(Value::as_array)
        .ok_or_else(malformed)?
        .iter()
        .filter_map(|k| k.as_str().map(str::to_string))
        .collect();

    Ok((cursor, keys))
}

#[async_trait]
impl KeyValueStore for RestStore {
    async fn get(&self, key: &str) -> Result<Option<String>, CacheError> {
        let result = self
            .command(&["GET".to_string(), key.to_string()])
            .await?;
        match result {
            Value::Null => Ok(None),
            Value::String(s) => Ok(Some(s)),
            other => Ok(Some(other.to_string())),
        }
    }

    async fn set(&self, key: &str, value: String, ttl: Duration) -> Result<(), CacheError> {
        self.command(&set_command(key, value, ttl)).await?;
        Ok(())
    }

    async fn delete(&self, keys: &[String]) -> Result<u64, CacheError> {
        if keys.is_empty() {
            return Ok(0);
        }

        let mut args = Vec::with_capacity(keys.len() + 1);
        args.push("DEL".to_string());
        args.extend(keys.iter().cloned());

        let result = self.command(&args).await?;
        Ok(result.as_u64().unwrap_or(0))
    }

    async fn keys(&self, pattern: &str) -> Result<Vec<String>, CacheError> {
        let mut found = BTreeSet::new();
        let mut cursor = "0".to_string();

        loop {
            let result = self
                .command(&scan_command(&cursor, pattern, self.scan_count))
                .await?;
            let (next, keys) = parse_scan(&result)?;
            found.extend(keys);
            if next == "0" {
                break;
            }
            cursor = next;
        }

        Ok(found.into_iter().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn set_command_carries_expiry_seconds() {
        let cmd = set_command("report:r1", "{}".to_string(), Duration::from_secs(600));
        assert_eq!(cmd, ["SET", "report:r1", "{}", "EX", "600"]);
    }

    #[test]
    fn set_command_never_sends_zero_expiry() {
        let cmd = set_command("k", "v".to_string(), Duration::from_millis(10));
        assert_eq!(cmd[4], "1");
    }

    #[tokio::test]
    async fn unreachable_store_fails_within_the_deadline() {
        // Non-routable address: the connect attempt hangs until a timeout.
        let store = RestStore::new("http://10.255.255.1:6379", "token");
        let started = std::time::Instant::now();

        assert!(store.get("report:r1").await.is_err());
        assert!(started.elapsed() < REQUEST_TIMEOUT + Duration::from_secs(3));
    }

    #[test]
    fn unwraps_result_replies() {
        assert_eq!(parse_reply(json!({"result": "OK"})).unwrap(), json!("OK"));
        assert_eq!(parse_reply(json!({"result": null})).unwrap(), Value::Null);
    }

    #[test]
    fn converts_error_replies() {
        let err = parse_reply(json!({"error": "WRONGPASS invalid password"})).unwrap_err();
        assert!(matches!(err, CacheError::Backend { message } if message.starts_with("WRONGPASS")));
    }

    #[test]
    fn rejects_replies_without_result() {
        assert!(parse_reply(json!({})).is_err());
        assert!(parse_reply(json!([1, 2])).is_err());
    }

    #[test]
    fn parses_scan_pages() {
        let (cursor, keys) =
            parse_scan(&json!(["17", ["map:bounds:1.00:1.00:2.00:2.00", "map:bounds:x"]])).unwrap();
        assert_eq!(cursor, "17");
        assert_eq!(keys.len(), 2);

        let (cursor, keys) = parse_scan(&json!([0, []])).unwrap();
        assert_eq!(cursor, "0");
        assert!(keys.is_empty());
    }

    #[test]
    fn rejects_malformed_scan_pages() {
        assert!(parse_scan(&json!("nope")).is_err());
        assert!(parse_scan(&json!(["0"])).is_err());
    }
}
