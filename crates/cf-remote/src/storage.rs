//! Durable object store.
//!
//! [`ObjectStore::stage`] copies any supported URL (`file://`, `http://`,
//! `https://`) to a caller-chosen local path; [`ObjectStore::publish`]
//! uploads a local file under a fresh key and returns its durable URL.
//! Keys are never reused, so two writers never contend for one object.
//! Neither operation retries; callers own retry policy and local cleanup.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use cf_core::config::{StorageBackend, StorageConfig};
use cf_core::{Error, Result};
use tokio::io::AsyncWriteExt;

/// Upload/download timeout for store traffic.
const TRANSFER_TIMEOUT: Duration = Duration::from_secs(600);

#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Download `url` to `dest`. A failed download leaves no file behind.
    async fn stage(&self, url: &str, dest: &Path) -> Result<()>;

    /// Upload `local` and return the durable URL of the new object.
    async fn publish(&self, local: &Path) -> Result<String>;
}

/// Build the store selected by `config.backend`.
pub fn build_object_store(config: &StorageConfig) -> Result<Arc<dyn ObjectStore>> {
    match config.backend {
        StorageBackend::Local => Ok(Arc::new(LocalObjectStore::new(
            &config.local_root,
            &config.key_prefix,
        )?)),
        StorageBackend::Http => {
            let upload_url = config.upload_url.clone().ok_or_else(|| {
                Error::Validation("storage.upload_url is required for the http backend".into())
            })?;
            let public_url = config.public_url.clone().ok_or_else(|| {
                Error::Validation("storage.public_url is required for the http backend".into())
            })?;
            Ok(Arc::new(HttpObjectStore::new(
                upload_url,
                public_url,
                config.token.clone(),
                config.key_prefix.clone(),
            )?))
        }
    }
}

// ---------------------------------------------------------------------------
// Local filesystem store
// ---------------------------------------------------------------------------

/// Objects are files under a root directory, addressed by `file://` URLs.
#[derive(Debug, Clone)]
pub struct LocalObjectStore {
    root: PathBuf,
    key_prefix: String,
    http: reqwest::Client,
}

impl LocalObjectStore {
    pub fn new(root: impl AsRef<Path>, key_prefix: &str) -> Result<Self> {
        std::fs::create_dir_all(root.as_ref())?;
        let root = std::fs::canonicalize(root.as_ref())?;
        Ok(Self {
            root,
            key_prefix: key_prefix.trim_matches('/').to_string(),
            http: crate::http_client(TRANSFER_TIMEOUT)?,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

#[async_trait]
impl ObjectStore for LocalObjectStore {
    async fn stage(&self, url: &str, dest: &Path) -> Result<()> {
        fetch(&self.http, url, dest).await
    }

    async fn publish(&self, local: &Path) -> Result<String> {
        let key = object_key(&self.key_prefix, local);
        let target = self.root.join(&key);
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::copy(local, &target)
            .await
            .map_err(|e| Error::Storage(format!("failed to publish {}: {e}", local.display())))?;

        tracing::debug!(key = %key, "Published object");
        Ok(file_url(&target))
    }
}

// ---------------------------------------------------------------------------
// HTTP store
// ---------------------------------------------------------------------------

/// Objects are uploaded with `PUT {upload_url}/{key}` and served from
/// `{public_url}/{key}`.
#[derive(Debug, Clone)]
pub struct HttpObjectStore {
    http: reqwest::Client,
    upload_url: String,
    public_url: String,
    token: Option<String>,
    key_prefix: String,
}

impl HttpObjectStore {
    pub fn new(
        upload_url: String,
        public_url: String,
        token: Option<String>,
        key_prefix: String,
    ) -> Result<Self> {
        Ok(Self {
            http: crate::http_client(TRANSFER_TIMEOUT)?,
            upload_url: upload_url.trim_end_matches('/').to_string(),
            public_url: public_url.trim_end_matches('/').to_string(),
            token,
            key_prefix: key_prefix.trim_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl ObjectStore for HttpObjectStore {
    async fn stage(&self, url: &str, dest: &Path) -> Result<()> {
        fetch(&self.http, url, dest).await
    }

    async fn publish(&self, local: &Path) -> Result<String> {
        let key = object_key(&self.key_prefix, local);
        let body = tokio::fs::read(local).await?;

        let mut req = self
            .http
            .put(format!("{}/{key}", self.upload_url))
            .header(reqwest::header::CONTENT_TYPE, content_type(local))
            .body(body);
        if let Some(token) = &self.token {
            req = req.bearer_auth(token);
        }

        let resp = req
            .send()
            .await
            .map_err(|e| Error::Storage(format!("upload of {key} failed: {e}")))?;
        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(Error::Storage(format!("upload of {key} returned {status}: {body}")));
        }

        tracing::debug!(key = %key, "Uploaded object");
        Ok(format!("{}/{key}", self.public_url))
    }
}

// ---------------------------------------------------------------------------
// helpers
// ---------------------------------------------------------------------------

/// `{prefix}/{uuid}.{ext}`: a key that has never been used before.
fn object_key(prefix: &str, local: &Path) -> String {
    let ext = local
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or("bin");
    let name = format!("{}.{ext}", uuid::Uuid::new_v4());
    if prefix.is_empty() {
        name
    } else {
        format!("{prefix}/{name}")
    }
}

fn content_type(path: &Path) -> &'static str {
    match path.extension().and_then(|e| e.to_str()) {
        Some("mp4") => "video/mp4",
        Some("mov") => "video/quicktime",
        Some("webm") => "video/webm",
        Some("mp3") => "audio/mpeg",
        Some("png") => "image/png",
        Some("jpg" | "jpeg") => "image/jpeg",
        _ => "application/octet-stream",
    }
}

/// `file://` URL of an absolute path.
pub fn file_url(path: &Path) -> String {
    format!("file://{}", path.display())
}

/// The local path behind a `file://` URL.
pub fn local_path(url: &str) -> Option<PathBuf> {
    url.strip_prefix("file://").map(PathBuf::from)
}

/// Copy or download `url` to `dest`, removing `dest` again on failure.
async fn fetch(http: &reqwest::Client, url: &str, dest: &Path) -> Result<()> {
    let result = if let Some(path) = local_path(url) {
        tokio::fs::copy(&path, dest)
            .await
            .map(|_| ())
            .map_err(|e| Error::Storage(format!("failed to copy {}: {e}", path.display())))
    } else if url.starts_with("http://") || url.starts_with("https://") {
        download(http, url, dest).await
    } else {
        return Err(Error::Storage(format!("unsupported URL scheme: {url}")));
    };

    if result.is_err() {
        let _ = tokio::fs::remove_file(dest).await;
    }
    result
}

async fn download(http: &reqwest::Client, url: &str, dest: &Path) -> Result<()> {
    let mut resp = http
        .get(url)
        .send()
        .await
        .map_err(|e| Error::Storage(format!("download of {url} failed: {e}")))?;
    if !resp.status().is_success() {
        return Err(Error::Storage(format!(
            "download of {url} returned {}",
            resp.status()
        )));
    }

    let mut file = tokio::fs::File::create(dest).await?;
    while let Some(chunk) = resp
        .chunk()
        .await
        .map_err(|e| Error::Storage(format!("download of {url} interrupted: {e}")))?
    {
        file.write_all(&chunk).await?;
    }
    file.flush().await?;

    tracing::debug!(url, dest = %dest.display(), "Staged object");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{header, method, path, path_regex};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn local_publish_then_stage() {
        let root = tempfile::tempdir().unwrap();
        let work = tempfile::tempdir().unwrap();
        let store = LocalObjectStore::new(root.path(), "pipeline").unwrap();

        let src = work.path().join("clip.mp4");
        std::fs::write(&src, b"video-bytes").unwrap();

        let url = store.publish(&src).await.unwrap();
        assert!(url.starts_with("file://"));
        assert!(url.ends_with(".mp4"));
        assert!(url.contains("/pipeline/"));

        // Keys are unique per publish.
        let again = store.publish(&src).await.unwrap();
        assert_ne!(url, again);

        let dest = work.path().join("staged.mp4");
        store.stage(&url, &dest).await.unwrap();
        assert_eq!(std::fs::read(&dest).unwrap(), b"video-bytes");
    }

    #[tokio::test]
    async fn stage_over_http() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/media/source.mp4"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"remote".to_vec()))
            .mount(&server)
            .await;

        let root = tempfile::tempdir().unwrap();
        let store = LocalObjectStore::new(root.path(), "").unwrap();
        let dest = root.path().join("dl.mp4");
        store
            .stage(&format!("{}/media/source.mp4", server.uri()), &dest)
            .await
            .unwrap();
        assert_eq!(std::fs::read(&dest).unwrap(), b"remote");
    }

    #[tokio::test]
    async fn failed_stage_leaves_no_file() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let root = tempfile::tempdir().unwrap();
        let store = LocalObjectStore::new(root.path(), "").unwrap();
        let dest = root.path().join("missing.mp4");
        let err = store
            .stage(&format!("{}/nope.mp4", server.uri()), &dest)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Storage(_)));
        assert!(!dest.exists());
    }

    #[tokio::test]
    async fn unsupported_scheme() {
        let root = tempfile::tempdir().unwrap();
        let store = LocalObjectStore::new(root.path(), "").unwrap();
        let err = store
            .stage("ftp://host/x.mp4", &root.path().join("x.mp4"))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("unsupported URL scheme"));
    }

    #[tokio::test]
    async fn http_publish_puts_with_token() {
        let server = MockServer::start().await;
        Mock::given(method("PUT"))
            .and(path_regex(r"^/upload/jobs/[0-9a-f-]+\.mp4$"))
            .and(header("authorization", "Bearer secret"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let store = HttpObjectStore::new(
            format!("{}/upload/", server.uri()),
            "https://cdn.example".into(),
            Some("secret".into()),
            "jobs".into(),
        )
        .unwrap();

        let dir = tempfile::tempdir().unwrap();
        let local = dir.path().join("out.mp4");
        std::fs::write(&local, b"x").unwrap();

        let url = store.publish(&local).await.unwrap();
        assert!(url.starts_with("https://cdn.example/jobs/"));
        assert!(url.ends_with(".mp4"));
    }

    #[tokio::test]
    async fn http_publish_error_is_storage_error() {
        let server = MockServer::start().await;
        Mock::given(method("PUT"))
            .respond_with(ResponseTemplate::new(500).set_body_string("disk full"))
            .mount(&server)
            .await;

        let store =
            HttpObjectStore::new(server.uri(), server.uri(), None, String::new()).unwrap();
        let dir = tempfile::tempdir().unwrap();
        let local = dir.path().join("out.mp4");
        std::fs::write(&local, b"x").unwrap();

        let err = store.publish(&local).await.unwrap_err();
        assert!(matches!(err, Error::Storage(ref m) if m.contains("disk full")));
    }

    #[test]
    fn http_backend_requires_urls() {
        let config = StorageConfig {
            backend: StorageBackend::Http,
            ..Default::default()
        };
        assert!(matches!(build_object_store(&config), Err(Error::Validation(_))));
    }

    #[test]
    fn file_url_round_trip() {
        let p = Path::new("/data/objects/a.mp4");
        assert_eq!(local_path(&file_url(p)).as_deref(), Some(p));
        assert_eq!(local_path("https://x/a.mp4"), None);
    }
}
