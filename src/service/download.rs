//! Artifact download and output routing
//!
//! The daemon only consumes per-URL success/failure; everything about
//! naming and placement lives here. Extension detection prefers the
//! explicit output file, then the Content-Type header, then the URL path.

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

use crate::domain::OutputRouting;

const DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(300);

#[derive(Debug, Error)]
pub enum DownloadError {
    #[error("download failed: {0}")]
    Http(String),

    #[error("write failed: {0}")]
    Io(#[from] std::io::Error),
}

/// Saves one URL according to the job's output routing.
#[async_trait]
pub trait Downloader: Send + Sync {
    async fn fetch(
        &self,
        url: &str,
        routing: &OutputRouting,
        job_id: &str,
        index: usize,
        total: usize,
    ) -> Result<PathBuf, DownloadError>;
}

/// Streaming HTTP downloader.
pub struct HttpDownloader {
    client: reqwest::Client,
}

impl HttpDownloader {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }
}

impl Default for HttpDownloader {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Downloader for HttpDownloader {
    async fn fetch(
        &self,
        url: &str,
        routing: &OutputRouting,
        job_id: &str,
        index: usize,
        total: usize,
    ) -> Result<PathBuf, DownloadError> {
        let response = self
            .client
            .get(url)
            .timeout(DOWNLOAD_TIMEOUT)
            .send()
            .await
            .map_err(|e| DownloadError::Http(e.to_string()))?;
        let response = response
            .error_for_status()
            .map_err(|e| DownloadError::Http(e.to_string()))?;

        let content_type = header_str(&response, "Content-Type");
        let content_disposition = header_str(&response, "Content-Disposition");
        let filepath = resolve_target(
            url,
            routing,
            job_id,
            index,
            total,
            content_type.as_deref(),
            content_disposition.as_deref(),
        );

        if let Some(parent) = filepath.parent()
            && !parent.as_os_str().is_empty()
        {
            tokio::fs::create_dir_all(parent).await?;
        }

        let mut file = tokio::fs::File::create(&filepath).await?;
        let mut response = response;
        while let Some(chunk) = response
            .chunk()
            .await
            .map_err(|e| DownloadError::Http(e.to_string()))?
        {
            file.write_all(&chunk).await?;
        }
        file.flush().await?;

        debug!(url, path = %filepath.display(), "Artifact saved");
        Ok(filepath)
    }
}

fn header_str(response: &reqwest::Response, name: &str) -> Option<String> {
    response
        .headers()
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

/// Decide the final path for one artifact.
fn resolve_target(
    url: &str,
    routing: &OutputRouting,
    job_id: &str,
    index: usize,
    total: usize,
    content_type: Option<&str>,
    content_disposition: Option<&str>,
) -> PathBuf {
    let ext = routing
        .output_file
        .as_deref()
        .and_then(extension_of)
        .or_else(|| content_type.and_then(extension_for_content_type))
        .or_else(|| extension_from_url(url))
        .unwrap_or_default();
    if ext.is_empty() {
        warn!(url, "Could not detect a file extension");
    }

    if let Some(output_file) = &routing.output_file {
        // Explicit file name; suffix with the index when one job produced
        // several artifacts, and allow overwrites.
        let named = if total > 1 {
            numbered_variant(output_file, index + 1)
        } else {
            output_file.clone()
        };
        let path = Path::new(&named);
        if path.is_absolute() || path.parent().map(|p| !p.as_os_str().is_empty()).unwrap_or(false) {
            return path.to_path_buf();
        }
        return base_dir(routing).join(named);
    }

    let filename = if routing.auto_filename {
        auto_filename(job_id, &ext)
    } else if let Some(name) = filename_from_content_disposition(content_disposition) {
        name
    } else if let Some(name) = filename_from_url(url) {
        name
    } else {
        format!("{}{}", job_id, ext)
    };

    unique_path(base_dir(routing).join(filename))
}

fn base_dir(routing: &OutputRouting) -> PathBuf {
    routing
        .output_dir
        .as_deref()
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("./output"))
}

/// `{job_id}_{timestamp}{ext}`, with the id sanitized for filesystems.
fn auto_filename(job_id: &str, ext: &str) -> String {
    let safe_id: String = job_id
        .chars()
        .take(32)
        .map(|c| if c.is_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect();
    let timestamp = chrono::Utc::now().format("%Y%m%d_%H%M%S");
    format!("{}_{}{}", safe_id, timestamp, ext)
}

fn numbered_variant(filename: &str, n: usize) -> String {
    match filename.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() => format!("{}_{}.{}", stem, n, ext),
        _ => format!("{}_{}", filename, n),
    }
}

/// Add a `_N` suffix until the path no longer exists. Only used for
/// auto-derived names; explicit output files may overwrite.
fn unique_path(path: PathBuf) -> PathBuf {
    if !path.exists() {
        return path;
    }
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let ext = path
        .extension()
        .map(|e| format!(".{}", e.to_string_lossy()))
        .unwrap_or_default();
    let dir = path.parent().map(Path::to_path_buf).unwrap_or_default();
    for counter in 1.. {
        let candidate = dir.join(format!("{}_{}{}", stem, counter, ext));
        if !candidate.exists() {
            return candidate;
        }
    }
    unreachable!()
}

fn extension_of(filename: &str) -> Option<String> {
    Path::new(filename)
        .extension()
        .map(|e| format!(".{}", e.to_string_lossy()))
}

/// `"image/png; charset=utf-8"` -> `".png"`
fn extension_for_content_type(content_type: &str) -> Option<String> {
    let mime = content_type.split(';').next()?.trim().to_lowercase();
    let ext = match mime.as_str() {
        "image/png" => ".png",
        "image/jpeg" | "image/jpg" => ".jpg",
        "image/webp" => ".webp",
        "image/gif" => ".gif",
        "video/mp4" => ".mp4",
        "video/webm" => ".webm",
        "video/quicktime" => ".mov",
        "audio/mpeg" => ".mp3",
        "audio/wav" | "audio/x-wav" => ".wav",
        "audio/ogg" => ".ogg",
        "audio/flac" => ".flac",
        "application/pdf" => ".pdf",
        "application/json" => ".json",
        "application/zip" => ".zip",
        "text/plain" => ".txt",
        "text/html" => ".html",
        _ => return None,
    };
    Some(ext.to_string())
}

fn url_path(url: &str) -> Option<String> {
    let after_scheme = url.split_once("://").map(|(_, rest)| rest).unwrap_or(url);
    let path = after_scheme.split(['?', '#']).next()?;
    path.split_once('/').map(|(_, p)| p.to_string())
}

fn extension_from_url(url: &str) -> Option<String> {
    let path = url_path(url)?;
    let name = path.rsplit('/').next()?;
    let (_, ext) = name.rsplit_once('.')?;
    // Reasonable extension length, mirrors the submit-side heuristics
    if ext.is_empty() || ext.len() > 4 {
        return None;
    }
    Some(format!(".{}", ext.to_lowercase()))
}

fn filename_from_url(url: &str) -> Option<String> {
    let path = url_path(url)?;
    let name = path.rsplit('/').next()?;
    if name.is_empty() { None } else { Some(name.to_string()) }
}

fn filename_from_content_disposition(header: Option<&str>) -> Option<String> {
    let header = header?;
    let (_, value) = header.split_once("filename=")?;
    let name = value.trim().trim_matches(['"', '\'']).to_string();
    if name.is_empty() { None } else { Some(name) }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_extension_for_content_type() {
        assert_eq!(
            extension_for_content_type("image/png; charset=utf-8").as_deref(),
            Some(".png")
        );
        assert_eq!(extension_for_content_type("video/mp4").as_deref(), Some(".mp4"));
        assert_eq!(extension_for_content_type("application/x-unknown"), None);
    }

    #[test]
    fn test_extension_from_url() {
        assert_eq!(
            extension_from_url("https://cdn.example.com/render/a.PNG?sig=1").as_deref(),
            Some(".png")
        );
        assert_eq!(extension_from_url("https://cdn.example.com/render/file"), None);
        assert_eq!(
            extension_from_url("https://cdn.example.com/a.verylongext"),
            None
        );
    }

    #[test]
    fn test_filename_from_url() {
        assert_eq!(
            filename_from_url("https://cdn.example.com/out/final.mp4#t=1").as_deref(),
            Some("final.mp4")
        );
        assert_eq!(filename_from_url("https://cdn.example.com/"), None);
    }

    #[test]
    fn test_filename_from_content_disposition() {
        assert_eq!(
            filename_from_content_disposition(Some("attachment; filename=\"render.png\"")).as_deref(),
            Some("render.png")
        );
        assert_eq!(filename_from_content_disposition(Some("inline")), None);
        assert_eq!(filename_from_content_disposition(None), None);
    }

    #[test]
    fn test_numbered_variant() {
        assert_eq!(numbered_variant("out.png", 2), "out_2.png");
        assert_eq!(numbered_variant("archive", 3), "archive_3");
    }

    #[test]
    fn test_unique_path_suffixes() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("a.png");
        std::fs::write(&path, b"x").unwrap();
        std::fs::write(temp.path().join("a_1.png"), b"x").unwrap();

        let unique = unique_path(path);
        assert_eq!(unique, temp.path().join("a_2.png"));
    }

    #[test]
    fn test_resolve_target_explicit_file() {
        let temp = TempDir::new().unwrap();
        let routing = OutputRouting {
            output_dir: Some(temp.path().to_string_lossy().into_owned()),
            output_file: Some("final.png".to_string()),
            auto_filename: false,
        };
        let path = resolve_target("https://x/y.bin", &routing, "job-1", 0, 1, None, None);
        assert_eq!(path, temp.path().join("final.png"));
    }

    #[test]
    fn test_resolve_target_explicit_file_multi_artifact() {
        let routing = OutputRouting {
            output_dir: Some("/tmp/renders".to_string()),
            output_file: Some("final.png".to_string()),
            auto_filename: false,
        };
        let path = resolve_target("https://x/y.png", &routing, "job-1", 1, 3, None, None);
        assert_eq!(path, PathBuf::from("/tmp/renders/final_2.png"));
    }

    #[test]
    fn test_resolve_target_url_filename() {
        let temp = TempDir::new().unwrap();
        let routing = OutputRouting {
            output_dir: Some(temp.path().to_string_lossy().into_owned()),
            output_file: None,
            auto_filename: false,
        };
        let path = resolve_target(
            "https://cdn.example.com/out/render.webp",
            &routing,
            "job-1",
            0,
            1,
            None,
            None,
        );
        assert_eq!(path, temp.path().join("render.webp"));
    }

    #[test]
    fn test_resolve_target_auto_filename_uses_job_id() {
        let temp = TempDir::new().unwrap();
        let routing = OutputRouting {
            output_dir: Some(temp.path().to_string_lossy().into_owned()),
            output_file: None,
            auto_filename: true,
        };
        let path = resolve_target(
            "https://cdn.example.com/out/render.webp",
            &routing,
            "job-abc",
            0,
            1,
            None,
            None,
        );
        let name = path.file_name().unwrap().to_string_lossy().into_owned();
        assert!(name.starts_with("job-abc_"));
        assert!(name.ends_with(".webp"));
    }
}
