//! Error types for the facade host core.
//!
//! `CoreError` is what a call into a session, facade, or registry can fail
//! with. Every variant is recoverable and is mapped to a wire-safe
//! [`ErrorPayload`] at the dispatcher boundary. Teardown failures are the
//! exception: they are collected in a [`TeardownReport`] and logged, never
//! returned to a caller.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;

use crate::types::{ClientId, Handle};

// ============================================================================
// Core Error
// ============================================================================

/// Unified error for core operations.
#[derive(Debug, Error)]
pub enum CoreError {
    /// A handle is not present in the named registry
    #[error("Invalid index input: {handle} ({registry})")]
    InvalidHandle { registry: String, handle: Handle },

    /// The requested facade type is not in the catalog
    #[error("unknown facade: {0}")]
    UnknownFacade(String),

    /// No live session exists for this client
    #[error("session not found: {0}")]
    SessionNotFound(ClientId),

    /// The facade does not expose this operation
    #[error("unknown method {facade}.{method}")]
    UnknownMethod { facade: String, method: String },

    /// Missing or mistyped call arguments
    #[error("invalid params: {0}")]
    InvalidParams(String),

    /// The 32-bit handle space of a registry is used up
    #[error("handle space exhausted in {registry}")]
    RegistryExhausted { registry: String },

    /// The registry was released with its facade and takes no new objects
    #[error("registry {registry} is closed")]
    RegistryClosed { registry: String },

    /// The configured maximum number of sessions is reached
    #[error("session limit reached ({limit})")]
    SessionLimitReached { limit: usize },

    /// A facade factory failed to build its instance
    #[error("failed to construct facade {facade}: {reason}")]
    FacadeConstruction { facade: String, reason: String },

    /// The facade instance was torn down while the call was in flight
    #[error("facade {0} has been torn down")]
    FacadeTornDown(String),

    /// Failure reported by the underlying platform API
    #[error(transparent)]
    Platform(#[from] anyhow::Error),
}

impl CoreError {
    /// Shorthand for [`CoreError::InvalidHandle`].
    pub fn invalid_handle(registry: impl Into<String>, handle: Handle) -> Self {
        CoreError::InvalidHandle {
            registry: registry.into(),
            handle,
        }
    }

    /// Stable machine-readable code.
    pub fn code(&self) -> &'static str {
        match self {
            CoreError::InvalidHandle { .. } => "invalid_handle",
            CoreError::UnknownFacade(_) => "unknown_facade",
            CoreError::SessionNotFound(_) => "session_not_found",
            CoreError::UnknownMethod { .. } => "unknown_method",
            CoreError::InvalidParams(_) => "invalid_params",
            CoreError::RegistryExhausted { .. } => "registry_exhausted",
            CoreError::RegistryClosed { .. } => "registry_closed",
            CoreError::SessionLimitReached { .. } => "session_limit_reached",
            CoreError::FacadeConstruction { .. } => "facade_construction",
            CoreError::FacadeTornDown(_) => "facade_torn_down",
            CoreError::Platform(_) => "platform",
        }
    }

    /// Whether the error was caused by the client rather than the host.
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            CoreError::InvalidHandle { .. }
                | CoreError::UnknownFacade(_)
                | CoreError::SessionNotFound(_)
                | CoreError::UnknownMethod { .. }
                | CoreError::InvalidParams(_)
        )
    }

    /// Build the payload surfaced verbatim to the calling client.
    pub fn to_payload(&self) -> ErrorPayload {
        let details = match self {
            CoreError::InvalidHandle { registry, handle } => {
                Some(json!({ "registry": registry, "handle": handle }))
            }
            CoreError::UnknownFacade(name) => Some(json!({ "facade": name })),
            CoreError::SessionNotFound(client_id) => Some(json!({ "client_id": client_id })),
            CoreError::UnknownMethod { facade, method } => {
                Some(json!({ "facade": facade, "method": method }))
            }
            CoreError::RegistryExhausted { registry } | CoreError::RegistryClosed { registry } => {
                Some(json!({ "registry": registry }))
            }
            CoreError::SessionLimitReached { limit } => Some(json!({ "limit": limit })),
            CoreError::FacadeConstruction { facade, .. } | CoreError::FacadeTornDown(facade) => {
                Some(json!({ "facade": facade }))
            }
            CoreError::InvalidParams(_) | CoreError::Platform(_) => None,
        };

        ErrorPayload {
            code: self.code().to_string(),
            message: self.to_string(),
            details,
        }
    }
}

/// Wire-safe error returned to a remote client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub code: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

// ============================================================================
// Teardown
// ============================================================================

/// One failed release step during facade teardown.
#[derive(Debug, Clone, Error)]
#[error("teardown of {facade} failed to release {resource}: {reason}")]
pub struct TeardownError {
    pub facade: String,
    pub resource: String,
    pub reason: String,
}

impl TeardownError {
    pub fn new(
        facade: impl Into<String>,
        resource: impl Into<String>,
        reason: impl std::fmt::Display,
    ) -> Self {
        Self {
            facade: facade.into(),
            resource: resource.into(),
            reason: reason.to_string(),
        }
    }
}

/// Outcome of tearing down one facade.
#[derive(Debug, Clone, Default)]
pub struct TeardownReport {
    pub facade: String,
    /// Set when teardown had already run; nothing was released this time
    pub already_torn_down: bool,
    pub callbacks_unregistered: usize,
    pub objects_released: usize,
    pub shared_released: usize,
    pub failures: Vec<TeardownError>,
}

impl TeardownReport {
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_handle_message_and_payload() {
        let err = CoreError::invalid_handle("characteristic registry", Handle::new(9));
        assert_eq!(
            err.to_string(),
            "Invalid index input: 9 (characteristic registry)"
        );
        assert!(err.is_client_error());

        let payload = err.to_payload();
        assert_eq!(payload.code, "invalid_handle");
        let details = payload.details.unwrap();
        assert_eq!(details["registry"], "characteristic registry");
        assert_eq!(details["handle"], 9);
    }

    #[test]
    fn test_platform_error_is_transparent() {
        let err = CoreError::from(anyhow::anyhow!("adapter off"));
        assert_eq!(err.to_string(), "adapter off");
        assert_eq!(err.code(), "platform");
        assert!(!err.is_client_error());
        assert!(err.to_payload().details.is_none());
    }

    #[test]
    fn test_payload_omits_empty_details() {
        let payload = CoreError::InvalidParams("missing name".into()).to_payload();
        let json = serde_json::to_value(&payload).unwrap();
        assert_eq!(json["code"], "invalid_params");
        assert!(json.get("details").is_none());
    }

    #[test]
    fn test_registry_closed_names_the_registry() {
        let err = CoreError::RegistryClosed {
            registry: "connection registry".into(),
        };
        assert_eq!(err.to_string(), "registry connection registry is closed");
        assert_eq!(err.code(), "registry_closed");
        assert!(!err.is_client_error());
        assert_eq!(err.to_payload().details.unwrap()["registry"], "connection registry");
    }

    #[test]
    fn test_teardown_error_display() {
        let err = TeardownError::new("radio", "gatt registry #3", "already closed");
        assert_eq!(
            err.to_string(),
            "teardown of radio failed to release gatt registry #3: already closed"
        );
    }
}
