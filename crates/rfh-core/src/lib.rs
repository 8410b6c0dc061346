//! RFH Core - session and event delivery core for a remote facade host.
//!
//! This crate implements:
//! - Handle registries mapping opaque integer handles to server-side objects
//! - Per-session ordered event queues fed by platform callbacks
//! - The facade lifecycle contract and teardown cascade
//! - Sessions and the process-wide session manager
//! - A thin dispatcher turning calls into responses

#![forbid(unsafe_code)]

// Core
pub mod registry;
pub mod events;
pub mod facade;
pub mod session;

// Built-in facades and call handling
pub mod event_facade;
pub mod dispatch;
pub mod params;
pub mod readiness;

// Supporting modules
pub mod errors;
pub mod types;
pub mod config;
pub mod logging;
pub mod testing;

pub use config::{ConfigError, CoreConfig, EventQueueConfig};
pub use dispatch::{DispatchStats, DispatchStatsSnapshot, Dispatcher, RpcCall, RpcResponse};
pub use errors::{CoreError, ErrorPayload, TeardownError, TeardownReport};
pub use event_facade::{EventFacade, EVENTS_FACADE};
pub use events::{
    scoped_event_name, EventQueue, EventQueueStats, EventRecord, EventSink, OverflowPolicy,
};
pub use facade::{
    CatalogError, Emitter, Facade, FacadeCatalog, FacadeContext, FacadeCore, FacadeFactory,
    FacadeState,
};
pub use params::Params;
pub use readiness::ReadySignal;
pub use registry::{HandleRegistry, Resource, TrackedRegistry};
pub use session::{Session, SessionManager};
pub use types::{ClientId, Handle};
