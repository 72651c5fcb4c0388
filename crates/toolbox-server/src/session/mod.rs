//! Session management: backends, registry, stream bridge, output logs.

pub mod backend;
pub mod bridge;
pub mod output_log;
pub mod pty;
pub mod registry;
pub mod resolver;

#[cfg(test)]
pub mod testing;

pub use backend::{FileChannel, Place, SessionTarget};
pub use output_log::LogStore;
pub use registry::{new_session_key, CloseReason, SessionRegistry};
pub use resolver::DefaultResolver;
