//! Text control messages.
//!
//! Control traffic is JSON with a `type` discriminator. Anything that does
//! not deserialize — malformed JSON, unknown `type`, wrong field shapes —
//! is dropped by the caller without closing the session.

use serde::{Deserialize, Serialize};

/// A control message on the session socket.
///
/// `Hello`, `RequestKeyframe` and `Pointer` arrive from viewers; `Status`
/// is emitted by the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlMessage {
    Hello {
        #[serde(default)]
        client: String,
        #[serde(default = "default_version")]
        version: u32,
    },
    RequestKeyframe,
    Pointer(PointerEvent),
    Status {
        text: String,
    },
}

fn default_version() -> u32 {
    1
}

/// A pointer update in normalized display coordinates.
///
/// `pressed` is the desired steady state of the button; only `down` and
/// `up` edges synthesize events.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PointerEvent {
    pub u: f32,
    pub v: f32,
    #[serde(default)]
    pub pressed: bool,
    #[serde(default)]
    pub down: bool,
    #[serde(default)]
    pub up: bool,
    #[serde(default)]
    pub button: u8,
}

/// Parse a control message, returning `None` for anything unrecognized.
#[must_use]
pub fn parse(text: &str) -> Option<ControlMessage> {
    serde_json::from_str(text).ok()
}

/// Serialize a `status` message for a session.
#[must_use]
pub fn status(text: impl Into<String>) -> String {
    serde_json::to_string(&ControlMessage::Status { text: text.into() })
        .unwrap_or_else(|_| String::from(r#"{"type":"status","text":""}"#))
}
