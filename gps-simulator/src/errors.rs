use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("MQTT client error: {0}")]
    Mqtt(#[from] rumqttc::ClientError),

    #[error("Connection refused with code {code}: {reason}")]
    ConnectionRefused { code: u8, reason: String },

    #[error("Connection lost: {0}")]
    ConnectionLost(String),

    #[error("No connection acknowledgement within {0:?}")]
    ConnectTimeout(Duration),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Metrics error: {0}")]
    Metrics(#[from] prometheus::Error),

    #[error("Session is closed")]
    SessionClosed,
}

pub type Result<T> = std::result::Result<T, Error>;
