use thiserror::Error;

#[derive(Debug, Clone, Error)]
pub enum GateError {
    /// The request never produced a response.
    #[error("request failed before a response was received: {0}")]
    Transport(String),
    #[error("server answered with status {status}")]
    Status { status: u16, body: String },
    /// The parked request was dropped without being replayed.
    #[error("parked request was abandoned before replay")]
    Abandoned,
    #[error("failed to decode response payload: {0}")]
    Decode(String),
    #[error("invalid request url: {0}")]
    InvalidUrl(String),
}

impl GateError {
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Status { status, .. } => Some(*status),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Error)]
pub enum UploadError {
    #[error("file transfer failed: {0}")]
    Transport(String),
    #[error("upload endpoint answered with status {status}")]
    Status { status: u16 },
    #[error("invalid mime type for upload: {0}")]
    InvalidMime(String),
}

#[derive(Debug, Clone, Error)]
pub enum PreviewError {
    #[error("could not decode image: {0}")]
    Decode(String),
    #[error("could not encode thumbnail: {0}")]
    Encode(String),
}
