use serde::{Deserialize, Serialize};

/// An uploaded image as stored in `files`.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct FileRecord {
    pub id: i64,
    pub user_id: i64,
    pub hash: String,
    pub ext: String,
    pub width: Option<i32>,
    pub height: Option<i32>,
}

impl FileRecord {
    /// Object key of the uploaded original.
    pub fn original_key(&self) -> String {
        format!("{}/{}/original.{}", self.user_id, self.hash, self.ext)
    }

    /// MIME type of the original, from its extension.
    pub fn content_type(&self) -> &'static str {
        match self.ext.to_ascii_lowercase().as_str() {
            "jpg" | "jpeg" => "image/jpeg",
            "png" => "image/png",
            "webp" => "image/webp",
            _ => "application/octet-stream",
        }
    }

    /// Object key of a resized copy.
    pub fn resized_key(&self, width: u32) -> String {
        format!("{}/{}/{}", self.user_id, self.hash, width)
    }
}
