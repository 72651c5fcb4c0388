//! Messages exchanged with terminal clients.
//!
//! Binary frames carry raw terminal bytes in both directions. Text frames
//! carry the JSON control messages defined here, tagged by `type`.

use crate::error::{ToolboxError, ToolboxResult};
use serde::{Deserialize, Serialize};
use std::fmt;

pub const DEFAULT_COLS: u16 = 80;
pub const DEFAULT_ROWS: u16 = 24;

/// Terminal window size in character cells.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WindowSize {
    pub cols: u16,
    pub rows: u16,
}

impl Default for WindowSize {
    fn default() -> Self {
        Self {
            cols: DEFAULT_COLS,
            rows: DEFAULT_ROWS,
        }
    }
}

impl WindowSize {
    pub fn new(cols: u16, rows: u16) -> Self {
        Self { cols, rows }
    }

    /// Replace a zero dimension with `fallback`'s.
    pub fn or(self, fallback: WindowSize) -> Self {
        if !self.is_empty() {
            return self;
        }
        Self {
            cols: if self.cols == 0 { fallback.cols } else { self.cols },
            rows: if self.rows == 0 { fallback.rows } else { self.rows },
        }
    }

    pub fn is_empty(&self) -> bool {
        self.cols == 0 || self.rows == 0
    }
}

impl fmt::Display for WindowSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.cols, self.rows)
    }
}

/// Client → server control message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlMessage {
    Resize { cols: u16, rows: u16 },
    Ping,
}

impl ControlMessage {
    pub fn decode(text: &str) -> ToolboxResult<Self> {
        serde_json::from_str(text)
            .map_err(|e| ToolboxError::InvalidMessage(format!("bad control message: {e}")))
    }
}

/// Server → client notice.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerNotice {
    /// Last frame before the server closes the transport.
    Closed { reason: String, error: bool },
    Pong,
}

impl ServerNotice {
    pub fn closed(reason: impl Into<String>, error: bool) -> Self {
        ServerNotice::Closed {
            reason: reason.into(),
            error,
        }
    }

    pub fn encode(&self) -> String {
        // Both variants contain only strings and bools.
        serde_json::to_string(self).unwrap_or_else(|_| String::from("{\"type\":\"closed\"}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resize_decodes_from_tagged_json() {
        let msg = ControlMessage::decode(r#"{"type":"resize","cols":120,"rows":40}"#).unwrap();
        assert_eq!(msg, ControlMessage::Resize { cols: 120, rows: 40 });
        assert_eq!(ControlMessage::decode(r#"{"type":"ping"}"#).unwrap(), ControlMessage::Ping);
    }

    #[test]
    fn unknown_control_type_is_rejected() {
        let err = ControlMessage::decode(r#"{"type":"launch"}"#).unwrap_err();
        assert!(matches!(err, ToolboxError::InvalidMessage(_)));
    }

    #[test]
    fn closed_notice_shape() {
        let text = ServerNotice::closed("backend exited", true).encode();
        let value: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert_eq!(value["type"], "closed");
        assert_eq!(value["reason"], "backend exited");
        assert_eq!(value["error"], true);
    }

    #[test]
    fn zero_dimensions_fall_back() {
        let size = WindowSize::new(0, 50).or(WindowSize::default());
        assert_eq!(size, WindowSize::new(80, 50));
        assert_eq!(size.to_string(), "80x50");
        assert!(WindowSize::new(10, 0).is_empty());
    }

    #[test]
    fn full_size_is_kept() {
        let size = WindowSize::new(132, 43);
        assert!(!size.is_empty());
        assert_eq!(size.or(WindowSize::new(1, 1)), size);
        assert_eq!(WindowSize::new(0, 0).or(WindowSize::new(100, 30)), WindowSize::new(100, 30));
    }
}
