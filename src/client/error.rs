use crate::limits::{FILE_TOO_LARGE_MESSAGE, invalid_type_message};
use thiserror::Error;

/// The request an attempt was executing when the service rejected it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestKind {
    File,
    Chunk,
    Completion,
}

impl RequestKind {
    /// Message used when the service gives no `detail`.
    pub fn fallback_message(self) -> &'static str {
        match self {
            RequestKind::File => "Upload failed",
            RequestKind::Chunk => "Chunk upload failed",
            RequestKind::Completion => "Upload completion failed",
        }
    }
}

/// Why an upload attempt ended without a result.
///
/// `Display` is the message meant for the end user.
#[derive(Debug, Error)]
pub enum UploadError {
    #[error("Authentication required")]
    AuthenticationRequired,

    #[error("{}", invalid_type_message())]
    InvalidFileType,

    #[error("{}", FILE_TOO_LARGE_MESSAGE)]
    FileTooLarge,

    #[error("{message}")]
    Rejected {
        kind: RequestKind,
        status: u16,
        message: String,
    },

    #[error("{0}")]
    Transport(#[from] reqwest::Error),

    #[error("{0}")]
    Io(#[from] std::io::Error),

    #[error("Upload failed: {0}")]
    InvalidResponse(String),
}

impl UploadError {
    /// Build a rejection, preferring the service's `detail` over the fallback.
    pub fn rejected(kind: RequestKind, status: u16, detail: Option<String>) -> Self {
        let message = detail
            .filter(|d| !d.trim().is_empty())
            .unwrap_or_else(|| kind.fallback_message().to_string());
        UploadError::Rejected {
            kind,
            status,
            message,
        }
    }

    /// True for errors detected locally before any request was made.
    pub fn is_precondition(&self) -> bool {
        matches!(
            self,
            UploadError::AuthenticationRequired
                | UploadError::InvalidFileType
                | UploadError::FileTooLarge
        )
    }
}
