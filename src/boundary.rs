//! Boolean-result operations for front ends that only need pass/fail.
//!
//! Each call runs one step with default settings, logs the error on failure
//! and returns whether it succeeded.

use crate::download::{ArtifactFetcher, HttpFetcher};
use crate::error::StageError;
use crate::extract::FsExtractor;
use crate::install::BuildInstaller;
use crate::types::InstallerSettings;
use crate::version::ReleaseVersion;
use std::path::Path;

fn report<T>(operation: &str, result: Result<T, StageError>) -> bool {
    match result {
        Ok(_) => true,
        Err(e) => {
            tracing::error!("Error {}: {}", operation, e);
            false
        }
    }
}

/// Download the release archive for `version` into `target_path`.
pub async fn download_artifact(version: &str, target_path: &Path) -> bool {
    let version = match ReleaseVersion::parse(version) {
        Ok(version) => version,
        Err(e) => {
            tracing::error!("Error downloading cmus: {}", e);
            return false;
        }
    };
    let result = match HttpFetcher::new(&InstallerSettings::default()) {
        Ok(fetcher) => fetcher.fetch(&version, target_path).await,
        Err(e) => Err(e),
    };
    report("downloading cmus", result)
}

/// Expand the archive at `source_path` into `target_path`.
pub async fn decompress_archive(source_path: &Path, target_path: &Path) -> bool {
    let source = source_path.to_path_buf();
    let target = target_path.to_path_buf();
    let result = tokio::task::spawn_blocking(move || FsExtractor::new().extract_blocking(&source, &target))
        .await
        .unwrap_or_else(|e| Err(StageError::Io(std::io::Error::new(std::io::ErrorKind::Other, e))));
    report("decompressing file", result)
}

/// Build and install the source tree at `target_path` with its default prefix.
pub async fn install_payload(target_path: &Path) -> bool {
    let result = BuildInstaller::default()
        .build_and_install(target_path, None, false)
        .await;
    report("installing cmus", result)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_download_rejects_bad_version() {
        let dir = tempfile::tempdir().unwrap();
        assert!(!download_artifact("not a version", dir.path()).await);
    }

    #[tokio::test]
    async fn test_decompress_missing_archive() {
        let dir = tempfile::tempdir().unwrap();
        assert!(!decompress_archive(&dir.path().join("missing.zip"), dir.path()).await);
    }

    #[tokio::test]
    async fn test_install_payload_without_configure() {
        let dir = tempfile::tempdir().unwrap();
        assert!(!install_payload(dir.path()).await);
    }
}
