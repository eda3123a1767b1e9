use thiserror::Error;

/// Remote gateway errors
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("Invalid response from server: {0}")]
    InvalidResponse(String),

    #[error("Server error ({status}): {message}")]
    Server { status: u16, message: String },
}

/// Realtime channel errors
#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("Invalid channel endpoint: {0}")]
    InvalidEndpoint(String),

    #[error("Connection failed: {0}")]
    Connect(String),

    #[error("Connection timed out")]
    ConnectTimeout,
}
