//! Imports remote images into the local media directory.
//!
//! Source URLs are normalised (query string and fragment dropped) and
//! deduplicated against the asset table before anything is downloaded.

use chrono::Utc;
use reqwest::Url;
use shared::Asset;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

use crate::db::Store;
use crate::error::StoreError;

pub const IMAGE_DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(120);

/// Bytes inspected when sniffing the image type
const SNIFF_LEN: usize = 16;

#[derive(Debug, Error)]
pub enum ImageImportError {
    #[error("Image download failed: {0}")]
    Download(String),

    #[error("Unsupported image type: {0}")]
    InvalidType(String),

    #[error("Media file error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Could not record asset: {0}")]
    Persistence(#[from] StoreError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageKind {
    pub content_type: &'static str,
    pub extension: &'static str,
}

const JPEG: ImageKind = ImageKind {
    content_type: "image/jpeg",
    extension: "jpg",
};
const PNG: ImageKind = ImageKind {
    content_type: "image/png",
    extension: "png",
};
const GIF: ImageKind = ImageKind {
    content_type: "image/gif",
    extension: "gif",
};
const WEBP: ImageKind = ImageKind {
    content_type: "image/webp",
    extension: "webp",
};

pub struct ImageImporter {
    http: reqwest::Client,
    media_dir: PathBuf,
    store: Arc<dyn Store>,
}

impl ImageImporter {
    pub fn new(http: reqwest::Client, media_dir: impl Into<PathBuf>, store: Arc<dyn Store>) -> Self {
        Self {
            http,
            media_dir: media_dir.into(),
            store,
        }
    }

    pub fn media_dir(&self) -> &Path {
        &self.media_dir
    }

    /// Import `url`, or return the asset already imported from it.
    pub async fn import(&self, url: &str) -> Result<Asset, ImageImportError> {
        let source_url = normalize_source_url(url)
            .ok_or_else(|| ImageImportError::Download(format!("Not an http(s) URL: {}", url)))?;

        if let Some(existing) = self.store.find_asset_by_source(&source_url).await? {
            tracing::debug!(source_url = %source_url, "Image already imported");
            return Ok(existing);
        }

        tokio::fs::create_dir_all(&self.media_dir).await?;

        let temp_path = self.media_dir.join(format!(".{}.part", Uuid::new_v4()));
        match self.download_and_store(&source_url, &temp_path).await {
            Ok(asset) => {
                tracing::info!(
                    source_url = %source_url,
                    file_name = %asset.file_name,
                    bytes = asset.byte_size,
                    "Imported image"
                );
                Ok(asset)
            }
            Err(e) => {
                if let Err(cleanup) = tokio::fs::remove_file(&temp_path).await {
                    if cleanup.kind() != std::io::ErrorKind::NotFound {
                        tracing::warn!("Failed to remove {}: {}", temp_path.display(), cleanup);
                    }
                }
                tracing::warn!(source_url = %source_url, "Image import failed: {}", e);
                Err(e)
            }
        }
    }

    async fn download_and_store(
        &self,
        source_url: &str,
        temp_path: &Path,
    ) -> Result<Asset, ImageImportError> {
        let response = self
            .http
            .get(source_url)
            .timeout(IMAGE_DOWNLOAD_TIMEOUT)
            .send()
            .await
            .map_err(|e| ImageImportError::Download(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(ImageImportError::Download(format!(
                "{} returned {}",
                source_url, status
            )));
        }

        let body = response
            .bytes()
            .await
            .map_err(|e| ImageImportError::Download(e.to_string()))?;
        if body.is_empty() {
            return Err(ImageImportError::Download(format!(
                "{} returned an empty body",
                source_url
            )));
        }

        tokio::fs::write(temp_path, &body).await?;

        let original_name = file_name_from_url(source_url);
        let head = &body[..body.len().min(SNIFF_LEN)];
        let kind = detect_image_kind(original_name.as_deref(), head).ok_or_else(|| {
            ImageImportError::InvalidType(format!(
                "{} is not a JPEG, PNG, GIF or WebP image",
                source_url
            ))
        })?;

        let file_name = self.unique_file_name(original_name.as_deref(), kind).await?;
        let final_path = self.media_dir.join(&file_name);
        tokio::fs::rename(temp_path, &final_path).await?;

        let asset = Asset {
            id: Uuid::new_v4(),
            file_name,
            local_path: final_path.to_string_lossy().into_owned(),
            source_url: source_url.to_string(),
            content_type: kind.content_type.to_string(),
            byte_size: body.len() as i64,
            created_at: Utc::now(),
        };

        if let Err(e) = self.store.insert_asset(&asset).await {
            tokio::fs::remove_file(&final_path).await.ok();
            return Err(e.into());
        }

        Ok(asset)
    }

    /// First of `name.ext`, `name-1.ext`, `name-2.ext`, ... unused on disk and in the store
    async fn unique_file_name(
        &self,
        original: Option<&str>,
        kind: ImageKind,
    ) -> Result<String, ImageImportError> {
        let (stem, extension) = split_file_name(original, kind);

        let mut suffix = 0u32;
        loop {
            let candidate = if suffix == 0 {
                format!("{}.{}", stem, extension)
            } else {
                format!("{}-{}.{}", stem, suffix, extension)
            };

            let on_disk = tokio::fs::try_exists(self.media_dir.join(&candidate)).await?;
            if !on_disk && !self.store.asset_file_name_taken(&candidate).await? {
                return Ok(candidate);
            }
            suffix += 1;
        }
    }
}

/// Drop query string and fragment. `None` unless the URL is http(s) with a host.
pub fn normalize_source_url(url: &str) -> Option<String> {
    let mut parsed = Url::parse(url.trim()).ok()?;
    if !matches!(parsed.scheme(), "http" | "https") || parsed.host_str().is_none() {
        return None;
    }

    parsed.set_query(None);
    parsed.set_fragment(None);
    Some(parsed.into())
}

/// Extension first, then magic bytes.
pub fn detect_image_kind(file_name: Option<&str>, head: &[u8]) -> Option<ImageKind> {
    file_name
        .and_then(|name| name.rsplit_once('.'))
        .and_then(|(_, ext)| kind_from_extension(ext))
        .or_else(|| kind_from_magic(head))
}

fn kind_from_extension(extension: &str) -> Option<ImageKind> {
    match extension.to_ascii_lowercase().as_str() {
        "jpg" | "jpeg" => Some(JPEG),
        "png" => Some(PNG),
        "gif" => Some(GIF),
        "webp" => Some(WEBP),
        _ => None,
    }
}

fn kind_from_magic(head: &[u8]) -> Option<ImageKind> {
    if head.starts_with(&[0xFF, 0xD8, 0xFF]) {
        Some(JPEG)
    } else if head.starts_with(b"\x89PNG\r\n\x1a\n") {
        Some(PNG)
    } else if head.starts_with(b"GIF87a") || head.starts_with(b"GIF89a") {
        Some(GIF)
    } else if head.len() >= 12 && &head[..4] == b"RIFF" && &head[8..12] == b"WEBP" {
        Some(WEBP)
    } else {
        None
    }
}

/// Last path segment of a normalised URL, percent-decoded and made filesystem-safe
fn file_name_from_url(url: &str) -> Option<String> {
    let parsed = Url::parse(url).ok()?;
    let segment = parsed.path_segments()?.next_back()?;
    let decoded = urlencoding::decode(segment)
        .map(|s| s.into_owned())
        .unwrap_or_else(|_| segment.to_string());

    let sanitized: String = decoded
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                c
            } else {
                '-'
            }
        })
        .collect();
    let sanitized = sanitized.trim_matches(|c| c == '-' || c == '.').to_string();

    (!sanitized.is_empty()).then_some(sanitized)
}

fn split_file_name(original: Option<&str>, kind: ImageKind) -> (String, String) {
    let Some(name) = original else {
        return ("image".to_string(), kind.extension.to_string());
    };

    match name.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() && kind_from_extension(ext).is_some() => {
            (stem.to_string(), ext.to_ascii_lowercase())
        }
        _ => (name.to_string(), kind.extension.to_string()),
    }
}
