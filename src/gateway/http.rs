//! HTTP implementation of the remote call gateway
//!
//! Maps the logical gateway operations onto the companion backend's routes.
//! Text and voice submissions go out as `multipart/form-data`; replies are
//! plain JSON. Failures are never retried here: the user re-initiates the
//! action instead.

use super::{Attachment, Gateway, Settings, VoiceReply};
use crate::error::GatewayError;
use anyhow::Context;
use async_trait::async_trait;
use reqwest::multipart;
use serde::Deserialize;
use std::time::Duration;
use tracing::debug;

/// Overall request timeout
const REQUEST_TIMEOUT_SECS: u64 = 120;

/// TCP connect timeout
const CONNECT_TIMEOUT_SECS: u64 = 10;

/// Gateway backed by the companion backend's HTTP API
pub struct HttpGateway {
    base_url: String,
    client: reqwest::Client,
}

/// Envelope around the settings object as the backend returns it
#[derive(Debug, Deserialize)]
struct SettingsEnvelope {
    settings: serde_json::Value,
}

impl HttpGateway {
    /// Create a gateway for the backend at `base_url`.
    pub fn new(base_url: &str) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .connect_timeout(Duration::from_secs(CONNECT_TIMEOUT_SECS))
            .build()
            .context("Failed to create HTTP client for gateway")?;

        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client,
        })
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    /// Read a reply that is a bare JSON string.
    async fn read_reply_text(response: reqwest::Response) -> Result<String, GatewayError> {
        let response = check_status(response).await?;
        response
            .json::<String>()
            .await
            .map_err(|e| GatewayError::InvalidResponse(format!("Failed to parse reply: {e}")))
    }
}

/// Map non-2xx statuses to `GatewayError::Server` with the body as message.
async fn check_status(response: reqwest::Response) -> Result<reqwest::Response, GatewayError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let message = response.text().await.unwrap_or_default();
    Err(GatewayError::Server {
        status: status.as_u16(),
        message,
    })
}

#[async_trait]
impl Gateway for HttpGateway {
    async fn submit_message(
        &self,
        input: &str,
        attachment: Option<&Attachment>,
    ) -> Result<String, GatewayError> {
        let mut form = multipart::Form::new().text("input", input.to_string());

        if let Some(att) = attachment {
            let part = multipart::Part::bytes(att.bytes.clone())
                .file_name(att.filename.clone())
                .mime_str(&att.content_type)?;
            form = form.part("file", part);
        }

        debug!(
            input_len = input.len(),
            has_attachment = attachment.is_some(),
            "Submitting message"
        );

        let response = self
            .client
            .post(self.endpoint("/input_message"))
            .multipart(form)
            .send()
            .await?;

        Self::read_reply_text(response).await
    }

    async fn submit_voice(&self, wav: Vec<u8>) -> Result<VoiceReply, GatewayError> {
        debug!(bytes = wav.len(), "Submitting recorded audio");

        let part = multipart::Part::bytes(wav)
            .file_name("recording.wav")
            .mime_str("audio/wav")?;
        let form = multipart::Form::new().part("file", part);

        let response = self
            .client
            .post(self.endpoint("/voice"))
            .multipart(form)
            .send()
            .await?;

        let response = check_status(response).await?;
        response.json::<VoiceReply>().await.map_err(|e| {
            GatewayError::InvalidResponse(format!("Failed to parse voice reply: {e}"))
        })
    }

    async fn fetch_greeting(&self) -> Result<String, GatewayError> {
        let response = self.client.get(self.endpoint("/greeting")).send().await?;
        Self::read_reply_text(response).await
    }

    async fn fetch_periodic_message(&self) -> Result<String, GatewayError> {
        let response = self
            .client
            .get(self.endpoint("/periodic_message"))
            .send()
            .await?;
        Self::read_reply_text(response).await
    }

    async fn fetch_settings(&self) -> Result<Settings, GatewayError> {
        let response = self
            .client
            .get(self.endpoint("/settings/get_settings"))
            .send()
            .await?;

        let response = check_status(response).await?;
        let envelope: SettingsEnvelope = response.json().await.map_err(|e| {
            GatewayError::InvalidResponse(format!("Failed to parse settings: {e}"))
        })?;
        Ok(Settings(envelope.settings))
    }

    async fn update_settings(&self, settings: &Settings) -> Result<(), GatewayError> {
        let response = self
            .client
            .post(self.endpoint("/settings/update_settings"))
            .json(&settings.0)
            .send()
            .await?;

        check_status(response).await?;
        Ok(())
    }
}
