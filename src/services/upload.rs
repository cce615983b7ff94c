//! Upload service: photo validation and local disk storage.
//!
//! DESIGN
//! ======
//! Photos are stored flat under the configured upload directory as
//! `<unix-millis>-<sanitized original name>`. The image type comes from the
//! file's magic bytes, not from the client-declared content type, so a
//! renamed non-image is rejected before it reaches the analyzer.
//!
//! Files are created with `create_new`; two uploads landing in the same
//! millisecond with the same name get a numeric disambiguator instead of
//! overwriting each other.

use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use sha2::{Digest, Sha256};
use tokio::io::AsyncWriteExt;
use tracing::info;

use crate::config::UploadConfig;

const MAX_NAME_CHARS: usize = 100;
const MAX_COLLISION_ATTEMPTS: u32 = 16;

#[derive(Debug, thiserror::Error)]
pub enum UploadError {
    #[error("uploaded file is empty")]
    Empty,
    #[error("uploaded file is {size} bytes (max {max})")]
    TooLarge { size: usize, max: usize },
    #[error("unsupported image type; expected jpeg, png, gif or webp")]
    UnsupportedType,
    #[error("could not allocate a file name for upload")]
    NameExhausted,
    #[error("storage error: {0}")]
    Io(#[from] std::io::Error),
}

impl crate::error::ErrorCode for UploadError {
    fn error_code(&self) -> &'static str {
        match self {
            Self::Empty => "E_UPLOAD_EMPTY",
            Self::TooLarge { .. } => "E_UPLOAD_TOO_LARGE",
            Self::UnsupportedType => "E_UPLOAD_TYPE",
            Self::NameExhausted | Self::Io(_) => "E_UPLOAD_STORAGE",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageType {
    Jpeg,
    Png,
    Gif,
    Webp,
}

impl ImageType {
    #[must_use]
    pub fn content_type(self) -> &'static str {
        match self {
            Self::Jpeg => "image/jpeg",
            Self::Png => "image/png",
            Self::Gif => "image/gif",
            Self::Webp => "image/webp",
        }
    }
}

/// A photo written to disk.
#[derive(Debug, Clone)]
pub struct StoredImage {
    pub stored_name: String,
    pub original_name: String,
    pub content_type: &'static str,
    pub size_bytes: i64,
    pub sha256: String,
    pub path: PathBuf,
}

/// Sniff the image type from leading magic bytes.
#[must_use]
pub fn detect_image_type(bytes: &[u8]) -> Option<ImageType> {
    match bytes {
        [0xFF, 0xD8, 0xFF, ..] => Some(ImageType::Jpeg),
        [0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A, ..] => Some(ImageType::Png),
        [b'G', b'I', b'F', b'8', ..] => Some(ImageType::Gif),
        [b'R', b'I', b'F', b'F', _, _, _, _, b'W', b'E', b'B', b'P', ..] => Some(ImageType::Webp),
        _ => None,
    }
}

/// Reduce a client-supplied file name to a safe single path component.
///
/// Directory parts are dropped, anything outside `[A-Za-z0-9._-]` becomes
/// `_`, leading dots are stripped and the result is capped in length.
#[must_use]
pub fn sanitize_filename(raw: &str) -> String {
    let base = raw.rsplit(['/', '\\']).next().unwrap_or_default();
    let cleaned: String = base
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') { c } else { '_' })
        .collect();
    let trimmed = cleaned.trim_start_matches('.');
    let capped: String = trimmed.chars().take(MAX_NAME_CHARS).collect();
    if capped.is_empty() { "image".to_owned() } else { capped }
}

pub(crate) fn sha256_hex(bytes: &[u8]) -> String {
    let digest = Sha256::digest(bytes);
    let mut s = String::with_capacity(digest.len() * 2);
    for b in digest {
        let _ = write!(s, "{b:02x}");
    }
    s
}

fn now_millis() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or(0)
}

/// Check an upload against the size cap and the accepted image formats.
///
/// # Errors
///
/// Returns [`UploadError`] for empty, oversize or non-image payloads.
pub fn validate_image(config: &UploadConfig, bytes: &[u8]) -> Result<ImageType, UploadError> {
    if bytes.is_empty() {
        return Err(UploadError::Empty);
    }
    if bytes.len() > config.max_bytes {
        return Err(UploadError::TooLarge { size: bytes.len(), max: config.max_bytes });
    }
    detect_image_type(bytes).ok_or(UploadError::UnsupportedType)
}

/// Validate and persist an uploaded photo.
///
/// # Errors
///
/// Returns [`UploadError`] for empty, oversize or non-image payloads, and
/// for filesystem failures.
pub async fn store_image(config: &UploadConfig, original_name: &str, bytes: &[u8]) -> Result<StoredImage, UploadError> {
    let image_type = validate_image(config, bytes)?;

    tokio::fs::create_dir_all(&config.dir).await?;

    let safe_name = sanitize_filename(original_name);
    let stamp = now_millis();
    let (stored_name, path, mut file) = create_unique(&config.dir, stamp, &safe_name).await?;
    file.write_all(bytes).await?;
    file.flush().await?;

    let size_bytes = i64::try_from(bytes.len()).unwrap_or(i64::MAX);
    info!(%stored_name, size_bytes, content_type = image_type.content_type(), "stored upload");

    Ok(StoredImage {
        stored_name,
        original_name: original_name.to_owned(),
        content_type: image_type.content_type(),
        size_bytes,
        sha256: sha256_hex(bytes),
        path,
    })
}

async fn create_unique(dir: &Path, stamp: u128, safe_name: &str) -> Result<(String, PathBuf, tokio::fs::File), UploadError> {
    for attempt in 0..MAX_COLLISION_ATTEMPTS {
        let name = if attempt == 0 { format!("{stamp}-{safe_name}") } else { format!("{stamp}-{attempt}-{safe_name}") };
        let path = dir.join(&name);
        match tokio::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .await
        {
            Ok(file) => return Ok((name, path, file)),
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {}
            Err(e) => return Err(e.into()),
        }
    }
    Err(UploadError::NameExhausted)
}

/// Resolve a stored name back to its path, refusing anything that is not a
/// plain file name.
#[must_use]
pub fn stored_path(config: &UploadConfig, stored_name: &str) -> Option<PathBuf> {
    if stored_name.is_empty() || stored_name != sanitize_filename(stored_name) {
        return None;
    }
    Some(config.dir.join(stored_name))
}

#[cfg(test)]
#[path = "upload_test.rs"]
mod tests;
