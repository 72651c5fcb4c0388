//! Client transports for terminal sessions.
//!
//! The registry and bridge only see the two halves defined here; the
//! WebSocket listener provides the concrete implementation.

pub mod websocket;

use async_trait::async_trait;
use toolbox_core::{ServerNotice, ToolboxResult, WindowSize};

/// A decoded client frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    /// Raw bytes for the shell's input.
    Input(Vec<u8>),
    Resize(WindowSize),
    Ping,
}

/// Outgoing half. Shared between the output relay and session teardown.
#[async_trait]
pub trait FrameSink: Send + Sync {
    async fn send_output(&self, data: &[u8]) -> ToolboxResult<()>;

    async fn send_notice(&self, notice: &ServerNotice) -> ToolboxResult<()>;

    /// Close the transport. Further sends fail.
    async fn close(&self) -> ToolboxResult<()>;
}

/// Incoming half, owned by the input relay.
#[async_trait]
pub trait FrameSource: Send {
    /// Next frame, or `None` once the client has gone away.
    async fn recv(&mut self) -> ToolboxResult<Option<Inbound>>;
}

/// Both halves of a client connection.
pub struct Transport {
    pub sink: std::sync::Arc<dyn FrameSink>,
    pub source: Box<dyn FrameSource>,
}
