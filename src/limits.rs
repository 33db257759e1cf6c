//! Size and type limits shared by the upload client and the upload service.

/// One mebibyte.
pub const MIB: u64 = 1024 * 1024;

/// Largest file accepted by either side.
pub const MAX_FILE_SIZE: u64 = 100 * MIB;

/// Files strictly larger than this go through the chunked path.
pub const CHUNKED_UPLOAD_THRESHOLD: u64 = 50 * MIB;

/// Fixed chunk size for every chunked session.
pub const CHUNK_SIZE: u64 = 5 * MIB;

/// Upper bound on `total_chunks` for a file of [`MAX_FILE_SIZE`].
pub const MAX_TOTAL_CHUNKS: u64 = MAX_FILE_SIZE.div_ceil(CHUNK_SIZE);

/// Extensions accepted for upload, lowercase and without the dot.
pub const ALLOWED_EXTENSIONS: [&str; 3] = ["json", "txt", "md"];

/// Lowercased extension after the last `.`, if any.
pub fn extension_of(filename: &str) -> Option<String> {
    filename
        .rsplit_once('.')
        .map(|(_, ext)| ext.to_ascii_lowercase())
}

/// True when `filename` carries one of [`ALLOWED_EXTENSIONS`].
pub fn is_allowed_extension(filename: &str) -> bool {
    extension_of(filename).is_some_and(|ext| ALLOWED_EXTENSIONS.contains(&ext.as_str()))
}

/// Human-readable list used in rejection messages: `.json, .txt, .md`.
pub fn allowed_extensions_display() -> String {
    ALLOWED_EXTENSIONS
        .iter()
        .map(|ext| format!(".{ext}"))
        .collect::<Vec<_>>()
        .join(", ")
}

/// Message returned when a file has a disallowed extension.
pub fn invalid_type_message() -> String {
    format!(
        "Invalid file type. Allowed: {}",
        allowed_extensions_display()
    )
}

pub const FILE_TOO_LARGE_MESSAGE: &str = "File size too large. Maximum 100MB allowed.";
