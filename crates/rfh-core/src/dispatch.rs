//! Call routing from the transport boundary into sessions and facades.
//!
//! The dispatcher resolves `{client, facade, method, params}` to a facade
//! operation and always produces an [`RpcResponse`]: every [`CoreError`] is
//! converted into an error payload for the client, never propagated.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::errors::{CoreError, ErrorPayload};
use crate::params::Params;
use crate::session::SessionManager;
use crate::types::ClientId;

// ============================================================================
// Wire Types
// ============================================================================

/// One inbound call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcCall {
    pub client_id: ClientId,
    pub facade: String,
    pub method: String,
    #[serde(default)]
    pub params: Value,
}

/// Result of one call: exactly one of `result` or `error` is set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcResponse {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorPayload>,
}

impl RpcResponse {
    pub fn ok(result: Value) -> Self {
        Self {
            result: Some(result),
            error: None,
        }
    }

    pub fn err(error: ErrorPayload) -> Self {
        Self {
            result: None,
            error: Some(error),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }
}

// ============================================================================
// Dispatch Statistics
// ============================================================================

/// Statistics for call dispatch.
#[derive(Debug, Default)]
pub struct DispatchStats {
    /// Total calls received
    pub received: AtomicU64,
    /// Calls that returned a result
    pub succeeded: AtomicU64,
    /// Calls that returned an error
    pub failed: AtomicU64,
    /// Failures due to an invalid handle
    pub invalid_handle: AtomicU64,
    /// Failures due to an unknown facade
    pub unknown_facade: AtomicU64,
}

impl DispatchStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get a snapshot of current statistics.
    pub fn snapshot(&self) -> DispatchStatsSnapshot {
        DispatchStatsSnapshot {
            received: self.received.load(Ordering::Relaxed),
            succeeded: self.succeeded.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            invalid_handle: self.invalid_handle.load(Ordering::Relaxed),
            unknown_facade: self.unknown_facade.load(Ordering::Relaxed),
        }
    }

    /// Reset all statistics to zero.
    pub fn reset(&self) {
        self.received.store(0, Ordering::Relaxed);
        self.succeeded.store(0, Ordering::Relaxed);
        self.failed.store(0, Ordering::Relaxed);
        self.invalid_handle.store(0, Ordering::Relaxed);
        self.unknown_facade.store(0, Ordering::Relaxed);
    }

    fn record_failure(&self, error: &CoreError) {
        self.failed.fetch_add(1, Ordering::Relaxed);
        match error {
            CoreError::InvalidHandle { .. } => {
                self.invalid_handle.fetch_add(1, Ordering::Relaxed);
            }
            CoreError::UnknownFacade(_) => {
                self.unknown_facade.fetch_add(1, Ordering::Relaxed);
            }
            _ => {}
        }
    }
}

/// Snapshot of dispatch statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispatchStatsSnapshot {
    pub received: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub invalid_handle: u64,
    pub unknown_facade: u64,
}

// ============================================================================
// Dispatcher
// ============================================================================

pub struct Dispatcher {
    sessions: Arc<SessionManager>,
    stats: DispatchStats,
}

impl Dispatcher {
    pub fn new(sessions: Arc<SessionManager>) -> Self {
        Self {
            sessions,
            stats: DispatchStats::new(),
        }
    }

    pub fn sessions(&self) -> &Arc<SessionManager> {
        &self.sessions
    }

    pub fn stats(&self) -> &DispatchStats {
        &self.stats
    }

    /// Route one call and convert the outcome into a response.
    pub async fn dispatch(&self, call: RpcCall) -> RpcResponse {
        self.stats.received.fetch_add(1, Ordering::Relaxed);
        let client_id = call.client_id.clone();
        let facade = call.facade.clone();
        let method = call.method.clone();

        match self.route(call).await {
            Ok(result) => {
                self.stats.succeeded.fetch_add(1, Ordering::Relaxed);
                RpcResponse::ok(result)
            }
            Err(error) => {
                self.stats.record_failure(&error);
                if error.is_client_error() {
                    debug!(%client_id, %facade, %method, error = %error, "call rejected");
                } else {
                    warn!(%client_id, %facade, %method, error = %error, "call failed");
                }
                RpcResponse::err(error.to_payload())
            }
        }
    }

    async fn route(&self, call: RpcCall) -> Result<Value, CoreError> {
        let session = self.sessions.get_or_create(call.client_id)?;
        let facade = session.get_or_create_facade(&call.facade)?;
        facade.invoke(&call.method, Params::new(call.params)).await
    }

    /// Client went away: remove its session and tear everything down.
    pub fn disconnect(&self, client_id: &ClientId) -> bool {
        self.sessions.remove(client_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CoreConfig;
    use crate::facade::FacadeCatalog;
    use serde_json::json;

    fn dispatcher() -> Dispatcher {
        Dispatcher::new(Arc::new(SessionManager::new(
            FacadeCatalog::default(),
            CoreConfig::default(),
        )))
    }

    fn call(facade: &str, method: &str, params: Value) -> RpcCall {
        RpcCall {
            client_id: ClientId::from("c1"),
            facade: facade.to_string(),
            method: method.to_string(),
            params,
        }
    }

    #[tokio::test]
    async fn test_dispatch_success_creates_session() {
        let dispatcher = dispatcher();
        let response = dispatcher
            .dispatch(call("events", "post", json!({"name": "hello"})))
            .await;
        assert!(response.is_ok());
        assert_eq!(response.result, Some(json!(true)));
        assert_eq!(dispatcher.sessions().len(), 1);

        let response = dispatcher.dispatch(call("events", "poll", Value::Null)).await;
        assert_eq!(response.result.unwrap()[0]["name"], "hello");
    }

    #[tokio::test]
    async fn test_dispatch_errors_become_responses() {
        let dispatcher = dispatcher();

        let response = dispatcher.dispatch(call("nfc", "scan", Value::Null)).await;
        let error = response.error.unwrap();
        assert_eq!(error.code, "unknown_facade");

        let response = dispatcher.dispatch(call("events", "fly", Value::Null)).await;
        assert_eq!(response.error.unwrap().code, "unknown_method");

        let response = dispatcher
            .dispatch(call("events", "waitFor", json!({})))
            .await;
        assert_eq!(response.error.unwrap().code, "invalid_params");

        let stats = dispatcher.stats().snapshot();
        assert_eq!(stats.received, 3);
        assert_eq!(stats.failed, 3);
        assert_eq!(stats.unknown_facade, 1);
        assert_eq!(stats.succeeded, 0);

        dispatcher.stats().reset();
        assert_eq!(dispatcher.stats().snapshot(), DispatchStatsSnapshot::default());
    }

    #[tokio::test]
    async fn test_disconnect_removes_session() {
        let dispatcher = dispatcher();
        dispatcher.dispatch(call("events", "clear", Value::Null)).await;
        assert!(dispatcher.disconnect(&ClientId::from("c1")));
        assert!(!dispatcher.disconnect(&ClientId::from("c1")));
        assert!(dispatcher.sessions().is_empty());
    }

    #[test]
    fn test_call_deserializes_without_params() {
        let call: RpcCall =
            serde_json::from_str(r#"{"client_id":"7","facade":"events","method":"poll"}"#)
                .unwrap();
        assert_eq!(call.client_id, ClientId::from(7u64));
        assert!(call.params.is_null());

        let wire = serde_json::to_value(RpcResponse::ok(json!(1))).unwrap();
        assert_eq!(wire, json!({"result": 1}));
    }
}
