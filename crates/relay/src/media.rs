//! Attachment downloads.
//!
//! Images arrive as URLs from the chat channel and must exist as local
//! files before the page's file input can take them. Downloads stream to
//! disk under a byte cap; a body that overruns the cap leaves no partial
//! file behind.

use std::path::{Path, PathBuf};

use futures::StreamExt;
use tracing::debug;

use pagebridge_core::{Error, Result};

const ALLOWED_EXTENSIONS: &[&str] = &["png", "jpg", "jpeg", "gif", "webp"];

/// Extract and validate the image extension from a URL path, ignoring
/// query strings.
fn url_extension(url: &str) -> Result<String> {
    let path = url.split(['?', '#']).next().unwrap_or(url);
    let ext = path
        .rsplit('/')
        .next()
        .and_then(|name| name.rsplit_once('.'))
        .map(|(_, ext)| ext.to_ascii_lowercase())
        .ok_or_else(|| Error::Media(format!("no file extension in {}", url)))?;
    if !ALLOWED_EXTENSIONS.contains(&ext.as_str()) {
        return Err(Error::Media(format!("unsupported image type .{}", ext)));
    }
    Ok(ext)
}

/// Download an image into `dir`, returning its local path.
pub async fn download_image(url: &str, dir: &Path, max_bytes: u64) -> Result<PathBuf> {
    let ext = url_extension(url)?;

    tokio::fs::create_dir_all(dir).await?;
    let path = dir.join(format!("{}.{}", uuid::Uuid::new_v4(), ext));

    let response = reqwest::get(url)
        .await
        .map_err(|e| Error::Media(format!("fetch {}: {}", url, e)))?;
    if !response.status().is_success() {
        return Err(Error::Media(format!("fetch {}: HTTP {}", url, response.status())));
    }
    if let Some(len) = response.content_length() {
        if len > max_bytes {
            return Err(Error::Media(format!("image is {} bytes, cap is {}", len, max_bytes)));
        }
    }

    let mut file = tokio::fs::File::create(&path).await?;
    let mut stream = response.bytes_stream();
    let mut written: u64 = 0;
    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(|e| Error::Media(format!("read body: {}", e)))?;
        written += chunk.len() as u64;
        if written > max_bytes {
            drop(file);
            let _ = tokio::fs::remove_file(&path).await;
            return Err(Error::Media(format!("image exceeds {} byte cap", max_bytes)));
        }
        tokio::io::AsyncWriteExt::write_all(&mut file, &chunk).await?;
    }
    tokio::io::AsyncWriteExt::flush(&mut file).await?;

    debug!(url, path = %path.display(), bytes = written, "downloaded image");
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extension_allowlist() {
        assert_eq!(url_extension("https://cdn.example.com/a/b.PNG").unwrap(), "png");
        assert_eq!(
            url_extension("https://cdn.example.com/x.jpg?width=400&h=2").unwrap(),
            "jpg"
        );
        assert!(url_extension("https://cdn.example.com/script.svg").is_err());
        assert!(url_extension("https://cdn.example.com/noext").is_err());
    }

    #[test]
    fn test_query_and_fragment_are_ignored() {
        assert_eq!(
            url_extension("https://cdn.example.com/pic.webp#frag").unwrap(),
            "webp"
        );
    }
}
