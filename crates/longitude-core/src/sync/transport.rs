//! Transport and connectivity seams.
//!
//! The HTTP client lives in the application shell. The queue only needs
//! the response shape below and a reachability probe.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};

/// Server status meaning the payload is already stored.
pub const STATUS_CONFLICT: u16 = 409;

/// JSON error marker meaning the payload is already stored.
pub const FILE_EXISTS_MARKER: &str = "OSF_FILE_EXISTS";

/// Error text a transport reports, with status 0, when the request never
/// left the device.
pub const NETWORK_FAILURE_MARKER: &str = "Network request failed";

/// Response of one send attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransportResponse {
    pub ok: bool,
    pub status: u16,
    #[serde(default)]
    pub json: Option<Value>,
    #[serde(default)]
    pub error: Option<String>,
}

/// How the queue treats a response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Accepted,
    Duplicate,
    Unreachable,
    Rejected,
}

impl TransportResponse {
    pub fn accepted(status: u16) -> Self {
        Self {
            ok: true,
            status,
            json: None,
            error: None,
        }
    }

    pub fn rejected(status: u16, json: Option<Value>) -> Self {
        Self {
            ok: false,
            status,
            json,
            error: None,
        }
    }

    /// Status 0 with the network failure marker.
    pub fn network_failure() -> Self {
        Self {
            ok: false,
            status: 0,
            json: None,
            error: Some(NETWORK_FAILURE_MARKER.to_string()),
        }
    }

    fn json_error(&self) -> Option<&str> {
        self.json.as_ref()?.get("error")?.as_str()
    }

    /// Duplicates are checked first: a 409 is never a rejection.
    pub fn classify(&self) -> Delivery {
        if self.status == STATUS_CONFLICT || self.json_error() == Some(FILE_EXISTS_MARKER) {
            Delivery::Duplicate
        } else if self.ok {
            Delivery::Accepted
        } else if self.status == 0 && self.error.as_deref() == Some(NETWORK_FAILURE_MARKER) {
            Delivery::Unreachable
        } else {
            Delivery::Rejected
        }
    }

    /// Server response rendered for the manual-sync UI.
    pub fn describe(&self) -> String {
        match (&self.json, &self.error) {
            (Some(json), _) => json.to_string(),
            (None, Some(error)) => error.clone(),
            (None, None) => format!("HTTP {}", self.status),
        }
    }
}

/// Delivers one payload to the collection endpoint.
///
/// Per-call timeouts are the implementation's job.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, data: &str, name: &str, destination_id: &str) -> TransportResponse;
}

/// Network reachability probe.
#[async_trait]
pub trait Connectivity: Send + Sync {
    async fn is_reachable(&self) -> bool;
}

/// Connectivity that is always up.
#[derive(Debug, Clone, Copy, Default)]
pub struct AlwaysOnline;

#[async_trait]
impl Connectivity for AlwaysOnline {
    async fn is_reachable(&self) -> bool {
        true
    }
}

/// Connectivity driven by the shell's network listener.
#[derive(Debug)]
pub struct ConnectivityFlag(AtomicBool);

impl ConnectivityFlag {
    pub fn new(online: bool) -> Self {
        Self(AtomicBool::new(online))
    }

    pub fn set(&self, online: bool) {
        self.0.store(online, Ordering::SeqCst);
    }
}

#[async_trait]
impl Connectivity for ConnectivityFlag {
    async fn is_reachable(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_classify_responses() {
        assert_eq!(TransportResponse::accepted(201).classify(), Delivery::Accepted);
        assert_eq!(TransportResponse::rejected(409, None).classify(), Delivery::Duplicate);
        assert_eq!(
            TransportResponse::rejected(400, Some(json!({"error": "OSF_FILE_EXISTS"}))).classify(),
            Delivery::Duplicate
        );
        assert_eq!(TransportResponse::network_failure().classify(), Delivery::Unreachable);
        assert_eq!(TransportResponse::rejected(500, None).classify(), Delivery::Rejected);

        // Status 0 without the marker is a rejection, not a network failure.
        let odd = TransportResponse {
            ok: false,
            status: 0,
            json: None,
            error: Some("aborted".into()),
        };
        assert_eq!(odd.classify(), Delivery::Rejected);
    }

    #[test]
    fn test_describe_prefers_json() {
        let response = TransportResponse::rejected(422, Some(json!({"error": "bad"})));
        assert_eq!(response.describe(), r#"{"error":"bad"}"#);
        assert_eq!(TransportResponse::rejected(503, None).describe(), "HTTP 503");
    }

    #[tokio::test]
    async fn test_connectivity_flag() {
        let flag = ConnectivityFlag::new(false);
        assert!(!flag.is_reachable().await);
        flag.set(true);
        assert!(flag.is_reachable().await);
    }
}
