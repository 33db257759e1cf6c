use super::error::UploadError;
use crate::limits::{CHUNKED_UPLOAD_THRESHOLD, MAX_FILE_SIZE, is_allowed_extension};

/// Check a file's name and size before anything touches the network.
///
/// The type check runs first, so an oversized file with a bad extension
/// reports the type error.
pub fn validate(filename: &str, size: u64) -> Result<(), UploadError> {
    if !is_allowed_extension(filename) {
        return Err(UploadError::InvalidFileType);
    }
    if size > MAX_FILE_SIZE {
        return Err(UploadError::FileTooLarge);
    }
    Ok(())
}

/// Whether a validated file of `size` bytes takes the chunked path.
pub fn requires_chunking(size: u64) -> bool {
    size > CHUNKED_UPLOAD_THRESHOLD
}
