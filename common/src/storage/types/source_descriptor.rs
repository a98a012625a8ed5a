use bytes::Bytes;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::{error::AppError, storage::store::StorageManager};

/// Reference to an uploaded document inside object storage.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SourceDescriptor {
    pub location: String,
    pub file_name: String,
    pub media_type: String,
    pub size_bytes: u64,
    pub sha256: String,
}

impl SourceDescriptor {
    /// Persists the upload for `session_id` and returns the descriptor pointing at it.
    pub async fn store_upload(
        session_id: &str,
        file_name: &str,
        media_type: &str,
        data: Bytes,
        storage: &StorageManager,
    ) -> Result<Self, AppError> {
        let sanitized = sanitize_file_name(file_name);
        let location = format!("sessions/{session_id}/{sanitized}");
        let sha256 = format!("{:x}", Sha256::digest(&data));
        let size_bytes = u64::try_from(data.len()).unwrap_or(u64::MAX);

        storage.put(&location, data).await?;

        Ok(Self {
            location,
            file_name: file_name.to_string(),
            media_type: media_type.to_string(),
            size_bytes,
            sha256,
        })
    }

    pub async fn load(&self, storage: &StorageManager) -> Result<Bytes, AppError> {
        Ok(storage.get(&self.location).await?)
    }
}

/// Replaces anything that is not alphanumeric or `_` in the stem, keeping the extension.
pub fn sanitize_file_name(file_name: &str) -> String {
    let base = file_name
        .rsplit(['/', '\\'])
        .next()
        .unwrap_or(file_name);

    let clean = |part: &str| -> String {
        part.chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '_' { c } else { '_' })
            .collect()
    };

    let sanitized = match base.rfind('.') {
        Some(idx) if idx > 0 => {
            let (name, ext) = base.split_at(idx);
            format!("{}.{}", clean(name), clean(ext.trim_start_matches('.')))
        }
        _ => clean(base),
    };

    if sanitized.is_empty() {
        "document".to_string()
    } else {
        sanitized
    }
}
