//! Blocking HTTP client for the daemon's JSON endpoints.

use anyhow::{Context, Result};
use serde_json::Value;

pub struct DaemonClient {
    base: String,
    identity_header: String,
    user: String,
}

impl DaemonClient {
    pub fn new(addr: &str, identity_header: &str, user: &str) -> Self {
        let base = if addr.starts_with("http://") || addr.starts_with("https://") {
            addr.trim_end_matches('/').to_string()
        } else {
            format!("http://{}", addr.trim_end_matches('/'))
        };
        Self {
            base,
            identity_header: identity_header.to_string(),
            user: user.to_string(),
        }
    }

    fn get_json(&self, path: &str) -> Result<Value> {
        let url = format!("{}{path}", self.base);
        tracing::debug!(%url, "GET");
        let body = ureq::get(&url)
            .header(self.identity_header.as_str(), self.user.as_str())
            .call()
            .with_context(|| format!("request to {url} failed (is presenced running?)"))?
            .body_mut()
            .read_to_string()
            .with_context(|| format!("failed to read response from {url}"))?;
        serde_json::from_str(&body).with_context(|| format!("invalid JSON from {url}"))
    }

    pub fn status(&self) -> Result<Value> {
        self.get_json("/status")
    }

    pub fn metrics(&self) -> Result<Value> {
        self.get_json("/metrics")
    }

    pub fn history(&self, limit: usize) -> Result<Value> {
        self.get_json(&format!("/attendance?limit={limit}"))
    }
}

/// Render attendance records as `day  recorded_at` lines.
pub fn format_history(records: &Value) -> Vec<String> {
    records
        .as_array()
        .map(|rows| {
            rows.iter()
                .map(|row| {
                    format!(
                        "{}  {}",
                        row["day"].as_str().unwrap_or("?"),
                        row["recorded_at"].as_str().unwrap_or("?")
                    )
                })
                .collect()
        })
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_base_url_normalization() {
        let c = DaemonClient::new("127.0.0.1:8090", "x-authenticated-user", "alice");
        assert_eq!(c.base, "http://127.0.0.1:8090");
        let c = DaemonClient::new("http://host:1/", "x-authenticated-user", "alice");
        assert_eq!(c.base, "http://host:1");
    }

    #[test]
    fn test_format_history() {
        let records = json!([
            {"id": "a", "user": "alice", "day": "2024-03-04", "recorded_at": "2024-03-04T09:00:00+00:00"},
            {"id": "b", "user": "alice", "day": "2024-03-03"}
        ]);
        assert_eq!(
            format_history(&records),
            [
                "2024-03-04  2024-03-04T09:00:00+00:00".to_string(),
                "2024-03-03  ?".to_string()
            ]
        );
        assert!(format_history(&json!({})).is_empty());
    }
}
