use reqwest::header::InvalidHeaderValue;

#[derive(Debug, thiserror::Error)]
pub enum PaymentError {
    #[error("Failed to create header value: {0}")]
    InvalidHeader(#[from] InvalidHeaderValue),
    #[error("Request failed: {0}")]
    Reqwest(#[from] reqwest::Error),
    #[error("JSON serialization failed: {0}")]
    JsonSerialization(#[from] serde_json::Error),
    #[error("{action} failed with status: {status}, body: {body}")]
    RequestFailed {
        action: String,
        status: reqwest::StatusCode,
        body: String,
    },
    #[error(
        "Failed to parse gateway response: {action}, response: {response_text}, error: {parse_error}"
    )]
    ApiResponseParse {
        action: String,
        response_text: String,
        parse_error: String,
    },
    #[error("Invalid webhook signature")]
    InvalidSignature,
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),
}

impl PaymentError {
    /// Transport errors are the only ones worth retrying; a gateway that
    /// answered has made its decision.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Reqwest(e) => e.is_timeout() || e.is_connect(),
            _ => false,
        }
    }

    pub fn is_server_error(&self) -> bool {
        matches!(self, Self::RequestFailed { status, .. } if status.is_server_error())
    }
}
