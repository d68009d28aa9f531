//! Local file intake
//!
//! Only image files are accepted. A file qualifies when its declared MIME type
//! is `image/*` or, failing that, when its extension is a known image format.

use crate::task::{FileMeta, FilePayload};
use crate::{Result, UploadError};
use chrono::{DateTime, Utc};
use std::path::{Path, PathBuf};
use tracing::debug;

/// Extension to MIME type for accepted images
const IMAGE_TYPES: &[(&str, &str)] = &[
    ("jpg", "image/jpeg"),
    ("jpeg", "image/jpeg"),
    ("png", "image/png"),
    ("gif", "image/gif"),
    ("bmp", "image/bmp"),
    ("webp", "image/webp"),
];

/// MIME type for a path, judged by extension
pub fn image_mime_type(path: &Path) -> Option<&'static str> {
    let ext = path.extension()?.to_str()?.to_ascii_lowercase();
    IMAGE_TYPES
        .iter()
        .find(|(known, _)| *known == ext)
        .map(|(_, mime)| *mime)
}

/// Whether a file would be accepted for upload
pub fn is_image(meta: &FileMeta) -> bool {
    if meta.mime_type.starts_with("image/") {
        return true;
    }
    image_mime_type(Path::new(&meta.name)).is_some()
}

/// Describe one image file. The contents are read when the upload is sent.
pub async fn load_file(path: &Path) -> Result<FilePayload> {
    let name = path
        .file_name()
        .and_then(|n| n.to_str())
        .map(str::to_string)
        .ok_or_else(|| UploadError::UnsupportedFile(path.display().to_string()))?;
    let mime_type = image_mime_type(path).ok_or_else(|| UploadError::UnsupportedFile(name.clone()))?;

    let metadata = tokio::fs::metadata(path).await?;
    if !metadata.is_file() {
        return Err(UploadError::UnsupportedFile(name));
    }

    let mut meta = FileMeta::new(name, metadata.len(), mime_type);
    meta.modified = metadata.modified().ok().map(DateTime::<Utc>::from);
    Ok(FilePayload::from_path(meta, path))
}

/// Every image directly inside `dir`, sorted by file name. Other files
/// are skipped.
pub async fn load_dir(dir: &Path) -> Result<Vec<FilePayload>> {
    let mut paths: Vec<PathBuf> = Vec::new();
    let mut entries = tokio::fs::read_dir(dir).await?;
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        if !entry.file_type().await?.is_file() {
            continue;
        }
        if image_mime_type(&path).is_some() {
            paths.push(path);
        } else {
            debug!("Skipping non-image file {}", path.display());
        }
    }
    paths.sort();

    let mut files = Vec::with_capacity(paths.len());
    for path in paths {
        files.push(load_file(&path).await?);
    }
    Ok(files)
}

/// Load a mix of files and directories. Explicit files must be images.
pub async fn load_paths(paths: &[PathBuf]) -> Result<Vec<FilePayload>> {
    let mut files = Vec::new();
    for path in paths {
        if tokio::fs::metadata(path).await?.is_dir() {
            files.extend(load_dir(path).await?);
        } else {
            files.push(load_file(path).await?);
        }
    }
    Ok(files)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_image_detection() {
        assert_eq!(image_mime_type(Path::new("a.JPG")), Some("image/jpeg"));
        assert_eq!(image_mime_type(Path::new("scan.webp")), Some("image/webp"));
        assert_eq!(image_mime_type(Path::new("notes.txt")), None);
        assert_eq!(image_mime_type(Path::new("README")), None);

        assert!(is_image(&FileMeta::new("photo", 10, "image/tiff")));
        assert!(is_image(&FileMeta::new("photo.png", 10, "application/octet-stream")));
        assert!(!is_image(&FileMeta::new("doc.pdf", 10, "application/pdf")));
    }

    #[tokio::test]
    async fn test_load_dir_filters_and_sorts() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("b.png"), b"png").unwrap();
        std::fs::write(dir.path().join("a.jpg"), b"jpeg!").unwrap();
        std::fs::write(dir.path().join("notes.txt"), b"text").unwrap();
        std::fs::create_dir(dir.path().join("nested.png")).unwrap();

        let files = load_dir(dir.path()).await.unwrap();
        let names: Vec<_> = files.iter().map(|f| f.meta.name.as_str()).collect();
        assert_eq!(names, vec!["a.jpg", "b.png"]);
        assert_eq!(files[0].meta.size, 5);
        assert_eq!(files[0].meta.mime_type, "image/jpeg");
        assert!(files[0].meta.modified.is_some());
        assert_eq!(files[0].path(), Some(dir.path().join("a.jpg").as_path()));
        assert_eq!(&*files[1].read().await.unwrap(), b"png");
    }

    #[tokio::test]
    async fn test_load_file_rejects_non_images() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("notes.txt");
        std::fs::write(&path, b"text").unwrap();

        let result = load_file(&path).await;
        assert!(matches!(result, Err(UploadError::UnsupportedFile(name)) if name == "notes.txt"));
    }
}
