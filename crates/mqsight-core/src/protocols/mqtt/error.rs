use thiserror::Error;

/// Errors returned by MQTT fixed-header decoding.
#[derive(Debug, Error)]
pub enum MqttError {
    #[error("payload too short: need {needed} bytes, got {actual}")]
    TooShort { needed: usize, actual: usize },
    #[error("malformed remaining length (continuation past {max} bytes)")]
    MalformedRemainingLength { max: usize },
}
