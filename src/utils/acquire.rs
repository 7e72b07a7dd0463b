// Image acquisition: local pass-through or download into the cache

use futures_util::StreamExt;
use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::models::ImageSource;

#[derive(Error, Debug)]
pub enum AcquireError {
    #[error("invalid image URL {url}: {reason}")]
    InvalidUrl { url: String, reason: String },

    #[error("failed to fetch {url}: {source}")]
    Request {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("failed to download {url}, status: {status}")]
    Status {
        url: String,
        status: reqwest::StatusCode,
    },

    #[error("hash verification failed for {path}. Expected: {expected}, got: {actual}")]
    HashMismatch {
        path: PathBuf,
        expected: String,
        actual: String,
    },

    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl AcquireError {
    fn io(path: &Path, source: io::Error) -> Self {
        AcquireError::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DownloadProgress {
    pub downloaded: u64,
    /// From Content-Length, when the server sends one
    pub total: Option<u64>,
}

/// Build a remote source cached under `cache_dir`, named after the URL's last path segment
pub fn remote_source(
    url: &str,
    cache_dir: &Path,
    sha256: Option<String>,
) -> Result<ImageSource, AcquireError> {
    let parsed = reqwest::Url::parse(url).map_err(|e| AcquireError::InvalidUrl {
        url: url.to_string(),
        reason: e.to_string(),
    })?;

    let file_name = parsed
        .path_segments()
        .and_then(|mut segments| segments.next_back())
        .filter(|name| !name.is_empty())
        .ok_or_else(|| AcquireError::InvalidUrl {
            url: url.to_string(),
            reason: "URL path has no file name".to_string(),
        })?;

    Ok(ImageSource::Remote {
        url: url.to_string(),
        cache_path: cache_dir.join(file_name),
        sha256: sha256.map(|h| h.to_lowercase()),
    })
}

/// SHA-256 of a file as lowercase hex
pub fn file_sha256(path: &Path) -> io::Result<String> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buffer = vec![0u8; 1024 * 1024];

    loop {
        let bytes_read = file.read(&mut buffer)?;
        if bytes_read == 0 {
            break;
        }
        hasher.update(&buffer[..bytes_read]);
    }

    Ok(hex::encode(hasher.finalize()))
}

pub fn verify_hash(path: &Path, expected: &str) -> Result<(), AcquireError> {
    let actual = file_sha256(path).map_err(|e| AcquireError::io(path, e))?;
    if actual == expected.to_lowercase() {
        Ok(())
    } else {
        Err(AcquireError::HashMismatch {
            path: path.to_path_buf(),
            expected: expected.to_string(),
            actual,
        })
    }
}

async fn verify_hash_blocking(path: &Path, expected: &str) -> Result<(), AcquireError> {
    let path_owned = path.to_path_buf();
    let expected = expected.to_string();
    tokio::task::spawn_blocking(move || verify_hash(&path_owned, &expected))
        .await
        .map_err(|e| AcquireError::io(path, io::Error::other(e)))?
}

/// Make `source` available as a local file and return its path.
///
/// Local sources must exist. Remote sources are reused from the cache when
/// present and verified, otherwise downloaded to `<cache_path>.download`,
/// verified and renamed into place.
pub async fn fetch(
    source: &ImageSource,
    progress: Option<mpsc::Sender<DownloadProgress>>,
) -> Result<PathBuf, AcquireError> {
    let (url, cache_path, sha256) = match source {
        ImageSource::Local(path) => {
            tokio::fs::metadata(path)
                .await
                .map_err(|e| AcquireError::io(path, e))?;
            return Ok(path.clone());
        }
        ImageSource::Remote {
            url,
            cache_path,
            sha256,
        } => (url, cache_path, sha256.as_deref()),
    };

    if tokio::fs::try_exists(cache_path).await.unwrap_or(false) {
        match sha256 {
            None => {
                info!("Using cached image {}", cache_path.display());
                return Ok(cache_path.clone());
            }
            Some(expected) => match verify_hash_blocking(cache_path, expected).await {
                Ok(()) => {
                    info!("Using cached and verified image {}", cache_path.display());
                    return Ok(cache_path.clone());
                }
                Err(e) => warn!("Cached image is stale, downloading again: {}", e),
            },
        }
    }

    if let Some(parent) = cache_path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| AcquireError::io(parent, e))?;
    }

    let mut temp_name = cache_path.as_os_str().to_owned();
    temp_name.push(".download");
    let temp_path = PathBuf::from(temp_name);

    let result = download(url, &temp_path, sha256, progress).await;
    if result.is_err() {
        let _ = tokio::fs::remove_file(&temp_path).await;
    }
    result?;

    tokio::fs::rename(&temp_path, cache_path)
        .await
        .map_err(|e| AcquireError::io(cache_path, e))?;
    info!("Downloaded {} to {}", url, cache_path.display());
    Ok(cache_path.clone())
}

async fn download(
    url: &str,
    temp_path: &Path,
    sha256: Option<&str>,
    progress: Option<mpsc::Sender<DownloadProgress>>,
) -> Result<(), AcquireError> {
    info!("Downloading {}", url);
    let request_failed = |source| AcquireError::Request {
        url: url.to_string(),
        source,
    };

    let response = reqwest::get(url).await.map_err(request_failed)?;
    if !response.status().is_success() {
        return Err(AcquireError::Status {
            url: url.to_string(),
            status: response.status(),
        });
    }

    let total = response.content_length();
    let mut output_file = tokio::fs::File::create(temp_path)
        .await
        .map_err(|e| AcquireError::io(temp_path, e))?;
    let mut hasher = Sha256::new();
    let mut downloaded = 0u64;
    let mut stream = response.bytes_stream();

    while let Some(item) = stream.next().await {
        let chunk = item.map_err(request_failed)?;
        output_file
            .write_all(&chunk)
            .await
            .map_err(|e| AcquireError::io(temp_path, e))?;
        hasher.update(&chunk);
        downloaded += chunk.len() as u64;

        if let Some(tx) = &progress {
            // A slow or absent listener must not stall the download
            let _ = tx.try_send(DownloadProgress { downloaded, total });
        }
    }

    output_file
        .flush()
        .await
        .map_err(|e| AcquireError::io(temp_path, e))?;
    drop(output_file);
    debug!("Downloaded {} bytes", downloaded);

    if let Some(expected) = sha256 {
        let actual = hex::encode(hasher.finalize());
        if actual != expected.to_lowercase() {
            return Err(AcquireError::HashMismatch {
                path: temp_path.to_path_buf(),
                expected: expected.to_string(),
                actual,
            });
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;

    const BODY: &[u8] = b"bootable image bytes";

    fn sha_of(bytes: &[u8]) -> String {
        hex::encode(Sha256::digest(bytes))
    }

    /// Serves `body` once over plain HTTP and returns the base URL
    async fn serve_once(body: &'static [u8]) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut request = [0u8; 1024];
            let _ = socket.read(&mut request).await;
            let header = format!(
                "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
                body.len()
            );
            socket.write_all(header.as_bytes()).await.unwrap();
            socket.write_all(body).await.unwrap();
            socket.shutdown().await.unwrap();
        });
        format!("http://{}", addr)
    }

    #[test]
    fn test_remote_source_cache_path() {
        let cache = Path::new("/var/cache/bootstick");
        let source = remote_source(
            "https://images.example.com/stable/installer-1.2.img.xz?sig=abc",
            cache,
            Some("ABCDEF".into()),
        )
        .unwrap();
        assert_eq!(source.local_path(), cache.join("installer-1.2.img.xz"));
        assert!(matches!(source, ImageSource::Remote { sha256: Some(ref h), .. } if h == "abcdef"));

        assert!(matches!(
            remote_source("https://images.example.com/", cache, None),
            Err(AcquireError::InvalidUrl { .. })
        ));
        assert!(remote_source("not a url", cache, None).is_err());
    }

    #[tokio::test]
    async fn test_local_source_passes_through() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("local.img");
        std::fs::write(&path, BODY).unwrap();

        let fetched = fetch(&ImageSource::Local(path.clone()), None).await.unwrap();
        assert_eq!(fetched, path);

        let missing = ImageSource::Local(dir.path().join("missing.img"));
        assert!(matches!(fetch(&missing, None).await, Err(AcquireError::Io { .. })));
    }

    #[tokio::test]
    async fn test_cached_image_is_reused() {
        let dir = tempfile::tempdir().unwrap();
        // Nothing listens on port 9, so a download attempt would fail
        let source = remote_source("http://127.0.0.1:9/image.img", dir.path(), Some(sha_of(BODY))).unwrap();
        std::fs::write(source.local_path(), BODY).unwrap();

        let fetched = fetch(&source, None).await.unwrap();
        assert_eq!(fetched, dir.path().join("image.img"));
    }

    #[tokio::test]
    async fn test_download_verifies_and_renames() {
        let dir = tempfile::tempdir().unwrap();
        let base = serve_once(BODY).await;
        let source = remote_source(&format!("{}/image.img", base), dir.path(), Some(sha_of(BODY))).unwrap();

        let (tx, mut rx) = mpsc::channel(64);
        let fetched = fetch(&source, Some(tx)).await.unwrap();

        assert_eq!(std::fs::read(&fetched).unwrap(), BODY);
        assert!(!dir.path().join("image.img.download").exists());

        let mut last = None;
        while let Ok(p) = rx.try_recv() {
            last = Some(p);
        }
        assert_eq!(
            last,
            Some(DownloadProgress {
                downloaded: BODY.len() as u64,
                total: Some(BODY.len() as u64)
            })
        );
    }

    #[tokio::test]
    async fn test_download_hash_mismatch_leaves_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let base = serve_once(BODY).await;
        let source = remote_source(&format!("{}/image.img", base), dir.path(), Some(sha_of(b"other"))).unwrap();

        let err = fetch(&source, None).await.unwrap_err();
        assert!(matches!(err, AcquireError::HashMismatch { .. }));
        assert!(!dir.path().join("image.img").exists());
        assert!(!dir.path().join("image.img.download").exists());
    }

    #[test]
    fn test_verify_hash() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("f");
        std::fs::write(&path, BODY).unwrap();
        verify_hash(&path, &sha_of(BODY).to_uppercase()).unwrap();
        assert!(matches!(
            verify_hash(&path, &sha_of(b"x")),
            Err(AcquireError::HashMismatch { .. })
        ));
    }
}
