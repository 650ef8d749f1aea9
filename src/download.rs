//! Release archive acquisition.
//!
//! [`HttpFetcher`] resolves a release to a download URL, streams the archive
//! into the run's staging directory and checks the transfer finished.

use crate::error::StageError;
use crate::types::InstallerSettings;
use crate::version::ReleaseVersion;
use futures_util::future::BoxFuture;
use futures_util::StreamExt;
use indicatif::ProgressBar;
use reqwest::StatusCode;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::io::AsyncWriteExt;

const ARCHIVE_EXTENSIONS: [&str; 6] = [".tar.gz", ".tgz", ".tar.xz", ".txz", ".tar", ".zip"];

/// Retrieves the release archive for a version into a staging directory.
pub trait ArtifactFetcher: Send + Sync {
    /// Returns the path of the downloaded archive inside `staging_dir`.
    fn fetch<'a>(
        &'a self,
        version: &'a ReleaseVersion,
        staging_dir: &'a Path,
    ) -> BoxFuture<'a, Result<PathBuf, StageError>>;
}

/// Expand `{tag}` and `{version}` in a download URL template.
pub fn build_release_url(template: &str, version: &ReleaseVersion) -> String {
    template
        .replace("{tag}", &version.tag())
        .replace("{version}", version.number())
}

/// Local file name for a downloaded archive, keeping the URL's archive extension.
pub fn archive_file_name(version: &ReleaseVersion, url: &str) -> String {
    let path = url.split(['?', '#']).next().unwrap_or(url).to_lowercase();
    let ext = ARCHIVE_EXTENSIONS
        .iter()
        .find(|ext| path.ends_with(*ext))
        .copied()
        .unwrap_or(".zip");
    format!("cmus-{}{}", version.tag(), ext)
}

pub struct HttpFetcher {
    client: reqwest::Client,
    url_template: String,
    progress: Option<ProgressBar>,
}

impl HttpFetcher {
    pub fn new(settings: &InstallerSettings) -> Result<Self, StageError> {
        let client = reqwest::Client::builder()
            .user_agent(settings.user_agent.clone())
            .timeout(Duration::from_secs(settings.timeout_secs))
            .build()
            .map_err(|e| StageError::network(format!("Could not build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            url_template: settings.download_url.clone(),
            progress: None,
        })
    }

    /// Report transferred bytes on `progress` while downloading.
    pub fn with_progress(mut self, progress: ProgressBar) -> Self {
        self.progress = Some(progress);
        self
    }

    pub fn release_url(&self, version: &ReleaseVersion) -> String {
        build_release_url(&self.url_template, version)
    }

    async fn download(
        &self,
        version: &ReleaseVersion,
        staging_dir: &Path,
    ) -> Result<PathBuf, StageError> {
        let url = self.release_url(version);
        let file_name = archive_file_name(version, &url);
        let local_path = staging_dir.join(&file_name);
        let part_path = staging_dir.join(format!("{}.part", file_name));

        tracing::info!("Downloading cmus {} from {}", version, url);

        let response = self
            .client
            .get(&url)
            .header(reqwest::header::ACCEPT, "application/octet-stream")
            .send()
            .await
            .map_err(|e| StageError::network(format!("Request to {} failed: {}", url, e)))?;

        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Err(StageError::NotFound {
                version: version.to_string(),
            });
        }
        if !status.is_success() {
            return Err(StageError::network(format!(
                "Download of {} failed with status {}",
                url, status
            )));
        }

        let expected = response.content_length();
        if let (Some(pb), Some(total)) = (&self.progress, expected) {
            pb.set_length(total);
        }

        tokio::fs::create_dir_all(staging_dir)
            .await
            .map_err(|e| StageError::from_io_at(e, staging_dir))?;
        let mut file = tokio::fs::File::create(&part_path)
            .await
            .map_err(|e| StageError::from_io_at(e, &part_path))?;

        let mut downloaded = 0u64;
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk
                .map_err(|e| StageError::network(format!("Transfer of {} failed: {}", url, e)))?;
            file.write_all(&chunk).await?;
            downloaded += chunk.len() as u64;
            if let Some(pb) = &self.progress {
                pb.set_position(downloaded);
            }
        }
        file.flush().await?;
        drop(file);

        verify_transfer(downloaded, expected, &url)?;

        tokio::fs::rename(&part_path, &local_path).await?;
        tracing::debug!("Saved {} bytes to {}", downloaded, local_path.display());
        Ok(local_path)
    }
}

impl ArtifactFetcher for HttpFetcher {
    fn fetch<'a>(
        &'a self,
        version: &'a ReleaseVersion,
        staging_dir: &'a Path,
    ) -> BoxFuture<'a, Result<PathBuf, StageError>> {
        Box::pin(self.download(version, staging_dir))
    }
}

fn verify_transfer(downloaded: u64, expected: Option<u64>, url: &str) -> Result<(), StageError> {
    if downloaded == 0 {
        return Err(StageError::network(format!("Received an empty archive from {}", url)));
    }
    if let Some(expected) = expected {
        if downloaded < expected {
            return Err(StageError::network(format!(
                "Transfer from {} ended early: {} of {} bytes",
                url, downloaded, expected
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    fn version(v: &str) -> ReleaseVersion {
        ReleaseVersion::parse(v).unwrap()
    }

    #[test]
    fn test_build_release_url() {
        assert_eq!(
            build_release_url(crate::types::DEFAULT_DOWNLOAD_URL, &version("3.2.0")),
            "https://github.com/cmus/cmus/archive/refs/tags/v3.2.0.zip"
        );
        assert_eq!(
            build_release_url("https://mirror.example/cmus-{version}.tar.gz", &version("v2.10.0")),
            "https://mirror.example/cmus-2.10.0.tar.gz"
        );
    }

    #[test]
    fn test_archive_file_name_keeps_extension() {
        let v = version("2.10.0");
        assert_eq!(
            archive_file_name(&v, "https://x/v2.10.0.zip"),
            "cmus-v2.10.0.zip"
        );
        assert_eq!(
            archive_file_name(&v, "https://x/cmus-2.10.0.tar.gz?dl=1"),
            "cmus-v2.10.0.tar.gz"
        );
        assert_eq!(
            archive_file_name(&v, "https://x/cmus-2.10.0.TAR.XZ"),
            "cmus-v2.10.0.tar.xz"
        );
        assert_eq!(archive_file_name(&v, "https://x/download"), "cmus-v2.10.0.zip");
    }

    #[test]
    fn test_verify_transfer() {
        assert!(verify_transfer(10, Some(10), "u").is_ok());
        assert!(verify_transfer(10, None, "u").is_ok());
        assert_eq!(
            verify_transfer(0, None, "u").unwrap_err().kind(),
            ErrorKind::Network
        );
        assert_eq!(
            verify_transfer(5, Some(10), "u").unwrap_err().kind(),
            ErrorKind::Network
        );
    }

    /// Answer a single request on a local port with a canned response.
    async fn serve_once(response: &'static [u8]) -> String {
        use tokio::io::AsyncReadExt;

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut request = Vec::new();
            let mut buf = [0u8; 1024];
            while !request.windows(4).any(|w| w == b"\r\n\r\n") {
                let n = socket.read(&mut buf).await.unwrap();
                if n == 0 {
                    break;
                }
                request.extend_from_slice(&buf[..n]);
            }
            socket.write_all(response).await.unwrap();
            let _ = socket.shutdown().await;
        });
        format!("http://{}", addr)
    }

    async fn fetch_from(response: &'static [u8]) -> (Result<PathBuf, StageError>, tempfile::TempDir) {
        let base = serve_once(response).await;
        let settings = InstallerSettings {
            download_url: format!("{}/cmus/{{tag}}.zip", base),
            timeout_secs: 10,
            ..InstallerSettings::default()
        };
        let staging = tempfile::tempdir().unwrap();
        let result = HttpFetcher::new(&settings)
            .unwrap()
            .fetch(&version("2.10.0"), staging.path())
            .await;
        (result, staging)
    }

    #[tokio::test]
    async fn test_fetch_saves_archive() {
        let (result, staging) =
            fetch_from(b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\nConnection: close\r\n\r\nPK\x03\x04!")
                .await;
        let path = result.unwrap();
        assert_eq!(path, staging.path().join("cmus-v2.10.0.zip"));
        assert_eq!(std::fs::read(&path).unwrap(), b"PK\x03\x04!");
        assert!(!staging.path().join("cmus-v2.10.0.zip.part").exists());
    }

    #[tokio::test]
    async fn test_fetch_404_is_not_found() {
        let (result, staging) =
            fetch_from(b"HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\nConnection: close\r\n\r\n")
                .await;
        assert_eq!(result.unwrap_err().kind(), ErrorKind::NotFound);
        assert!(!staging.path().join("cmus-v2.10.0.zip").exists());
    }

    #[tokio::test]
    async fn test_fetch_server_error_is_network() {
        let (result, staging) = fetch_from(
            b"HTTP/1.1 503 Service Unavailable\r\nContent-Length: 0\r\nConnection: close\r\n\r\n",
        )
        .await;
        assert_eq!(result.unwrap_err().kind(), ErrorKind::Network);
        assert!(!staging.path().join("cmus-v2.10.0.zip").exists());
    }

    #[tokio::test]
    async fn test_fetch_short_body_is_network() {
        let (result, staging) = fetch_from(
            b"HTTP/1.1 200 OK\r\nContent-Length: 100\r\nConnection: close\r\n\r\nshort",
        )
        .await;
        assert_eq!(result.unwrap_err().kind(), ErrorKind::Network);
        assert!(!staging.path().join("cmus-v2.10.0.zip").exists());
    }

    #[tokio::test]
    async fn test_fetch_empty_body_is_network() {
        let (result, staging) =
            fetch_from(b"HTTP/1.1 200 OK\r\nContent-Length: 0\r\nConnection: close\r\n\r\n")
                .await;
        assert_eq!(result.unwrap_err().kind(), ErrorKind::Network);
        assert!(!staging.path().join("cmus-v2.10.0.zip").exists());
    }

    #[test]
    fn test_http_fetcher_uses_template() {
        let settings = InstallerSettings {
            download_url: "http://127.0.0.1:9/{tag}.tar.gz".to_string(),
            ..InstallerSettings::default()
        };
        let fetcher = HttpFetcher::new(&settings).unwrap();
        assert_eq!(
            fetcher.release_url(&version("3.2.0")),
            "http://127.0.0.1:9/v3.2.0.tar.gz"
        );
    }
}
