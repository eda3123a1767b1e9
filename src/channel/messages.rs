//! Wire messages for the realtime listening channel
//!
//! Commands and events are single JSON objects, internally tagged with
//! `command` / `event`. Payload field names match the listening backend.

use serde::{Deserialize, Serialize};

/// Commands emitted to the listening backend
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "command", rename_all = "kebab-case")]
pub enum ClientCommand {
    /// Start (or re-arm after a turn) capturing on the given device
    BeginCapture { device_index: usize },
    /// Stop capturing; sent best-effort at teardown
    EndCapture,
}

/// Events received from the listening backend
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "event", rename_all = "kebab-case")]
pub enum ServerEvent {
    /// One completed listening turn
    Result {
        transcription: String,
        ai_response: String,
    },
    /// Assistant-originated message outside the normal turn
    PeriodicMessage { message: String },
    /// Server declared the session idle for too long; carries a farewell
    Deactivated { ai_response: String },
    /// Server-side listening failure
    Error { message: String },
    /// Exit keyword detected; carries the final turn
    Quit {
        transcription: String,
        ai_response: String,
    },
}
