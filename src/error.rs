//! Failure kinds for asset uploads and range input.

use thiserror::Error;

/// Why a single upload produced no URL.
#[derive(Debug, Error)]
pub enum UploadError {
    /// The file host rejected the user hash (HTTP 401).
    #[error("unauthorized: the file host rejected the user hash")]
    Authentication,

    /// Network or HTTP level failure, including a broken proxy template.
    #[error("transport error: {0}")]
    Transport(String),

    /// Proxy mode is selected but no proxy URL is set.
    #[error("no CORS proxy configured")]
    UnconfiguredProxy,

    /// An earlier upload under the same name failed; not sent again.
    #[error("upload of {0} already failed")]
    AlreadyFailed(String),

    /// The payload could not be encoded for the transport.
    #[error("encoding error: {0}")]
    Encoding(String),
}

impl UploadError {
    /// Text shown to the user for this failure.
    ///
    /// `UnconfiguredProxy` is a silent no-op and has no notice; `AlreadyFailed`
    /// was noticed on its first failure.
    pub fn notice(&self, name: &str) -> Option<String> {
        match self {
            Self::UnconfiguredProxy | Self::AlreadyFailed(_) => None,
            Self::Authentication => Some("Unauthorized: invalid user hash provided.".to_string()),
            _ => Some(format!("Unknown error occurred while uploading {name}.")),
        }
    }
}

impl From<reqwest::Error> for UploadError {
    fn from(err: reqwest::Error) -> Self {
        if err.status() == Some(reqwest::StatusCode::UNAUTHORIZED) {
            Self::Authentication
        } else {
            Self::Transport(err.to_string())
        }
    }
}

/// The textual `start-end` range could not be understood.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("invalid range input {input:?}: expected `start-end`")]
pub struct RangeInputError {
    pub input: String,
}
