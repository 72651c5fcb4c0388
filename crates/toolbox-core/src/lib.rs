//! toolbox-core: shared library for the toolbox server.
//!
//! Provides the backend service lifecycle contract, the keyed
//! [`ResourceCache`] with single-flight creation and idle eviction, cache-key
//! fingerprints, terminal control messages, and the command history service.

pub mod cache;
pub mod command_log;
pub mod error;
pub mod fingerprint;
pub mod messages;
pub mod service;

// Re-export commonly used items at crate root.
pub use cache::{ResourceCache, ServiceInfo};
pub use command_log::{
    CommandFilter, CommandLogRecord, CommandLogService, CommandStore, MemoryCommandStore,
};
pub use error::{ToolboxError, ToolboxResult};
pub use fingerprint::{fingerprint, service_key, short_key};
pub use messages::{ControlMessage, ServerNotice, WindowSize};
pub use service::{BackendKind, Service};
