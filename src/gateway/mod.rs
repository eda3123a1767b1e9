//! Remote call gateway
//!
//! Stateless request/response operations against the companion backend:
//! text+image submission, recorded-voice submission, the one-shot greeting,
//! idle periodic messages, and the settings object. The gateway is a trait so
//! the session controller can be driven against an in-memory fake in tests;
//! [`HttpGateway`] is the production implementation.

mod http;

pub use http::HttpGateway;

use crate::error::GatewayError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// A file attached to a text submission
///
/// At most one attachment is pending at a time; it is held until the next
/// submission or an explicit removal.
#[derive(Debug, Clone)]
pub struct Attachment {
    pub filename: String,
    pub content_type: String,
    pub bytes: Vec<u8>,
}

/// Reply to a recorded-voice submission
#[derive(Debug, Clone, Deserialize)]
pub struct VoiceReply {
    pub transcription: String,
    pub ai_response: String,
}

/// Backend settings object
///
/// Opaque to the controller; the field definitions belong to the settings
/// form, which only round-trips the object through these two operations.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Settings(pub serde_json::Value);

/// Request/response operations the session controller consumes
#[async_trait]
pub trait Gateway: Send + Sync {
    /// Submit typed text (may be empty) with an optional attachment; returns
    /// the assistant reply text.
    async fn submit_message(
        &self,
        input: &str,
        attachment: Option<&Attachment>,
    ) -> Result<String, GatewayError>;

    /// Submit a recorded audio blob; returns the transcription and reply.
    async fn submit_voice(&self, wav: Vec<u8>) -> Result<VoiceReply, GatewayError>;

    /// Fetch the one-shot greeting shown at session start.
    async fn fetch_greeting(&self) -> Result<String, GatewayError>;

    /// Fetch one idle-period message.
    async fn fetch_periodic_message(&self) -> Result<String, GatewayError>;

    async fn fetch_settings(&self) -> Result<Settings, GatewayError>;

    async fn update_settings(&self, settings: &Settings) -> Result<(), GatewayError>;
}
