use std::path::Path;

use mime_guess::from_path;

use super::config::AppConfig;

pub const MIME_XLSX: &str = "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet";

/// Media types the upload gateway accepts.
pub const ACCEPTED_MEDIA_TYPES: [&str; 5] = [
    "application/pdf",
    "image/jpeg",
    "image/png",
    MIME_XLSX,
    "text/csv",
];

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum UploadValidationError {
    #[error("Unsupported media type: {0}")]
    UnsupportedMediaType(String),
    #[error("{0}")]
    PayloadTooLarge(String),
    #[error("{0}")]
    BadRequest(String),
}

/// Strips parameters (`; charset=utf-8`) and normalizes case.
pub fn normalize_media_type(declared: &str) -> String {
    declared
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase()
}

/// Resolves the media type of an upload, falling back to the file extension
/// when the client did not declare one.
pub fn resolve_media_type(declared: Option<&str>, file_name: Option<&str>) -> Option<String> {
    match declared.map(normalize_media_type) {
        Some(media_type) if !media_type.is_empty() && media_type != "application/octet-stream" => {
            Some(media_type)
        }
        _ => file_name
            .and_then(|name| from_path(Path::new(name)).first())
            .map(|guess| guess.essence_str().to_string()),
    }
}

pub fn validate_upload(
    config: &AppConfig,
    store_id: &str,
    media_type: Option<&str>,
    size_bytes: usize,
) -> Result<String, UploadValidationError> {
    if store_id.trim().is_empty() {
        return Err(UploadValidationError::BadRequest(
            "store_id is required".to_string(),
        ));
    }

    if size_bytes == 0 {
        return Err(UploadValidationError::BadRequest(
            "Uploaded document is empty".to_string(),
        ));
    }

    if size_bytes > config.ingest_max_document_bytes {
        return Err(UploadValidationError::PayloadTooLarge(format!(
            "Document is too large. Maximum allowed is {} bytes",
            config.ingest_max_document_bytes
        )));
    }

    let media_type = media_type
        .map(normalize_media_type)
        .filter(|m| !m.is_empty())
        .ok_or_else(|| UploadValidationError::UnsupportedMediaType("unknown".to_string()))?;

    if !ACCEPTED_MEDIA_TYPES.contains(&media_type.as_str()) {
        return Err(UploadValidationError::UnsupportedMediaType(media_type));
    }

    Ok(media_type)
}
