use cmus_installer::{
    ArchiveExtractor, ArtifactFetcher, InstallPipeline, Installer, ReleaseVersion, StageError,
};
use futures_util::future::BoxFuture;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::Semaphore;

// Each test binary pulls in this module and uses only part of it.
#[allow(dead_code)]
pub struct TestContext {
    pub _temp_dir: TempDir,
    pub config_path: PathBuf,
    pub bin_path: PathBuf,
}

#[allow(dead_code)]
impl TestContext {
    pub fn new() -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let config_path = temp_dir.path().join("config.json");
        let bin_path = PathBuf::from(env!("CARGO_BIN_EXE_cmus-installer"));

        Self {
            _temp_dir: temp_dir,
            config_path,
            bin_path,
        }
    }

    pub fn cmd(&self) -> Command {
        let mut cmd = Command::new(&self.bin_path);
        cmd.env("CMUS_INSTALLER_CONFIG", &self.config_path);
        cmd.env("HOME", self._temp_dir.path());
        cmd.env("XDG_CONFIG_HOME", self._temp_dir.path().join("config"));
        for var in [
            "CMUS_INSTALLER_DOWNLOAD_URL",
            "CMUS_INSTALLER_STAGING_DIR",
            "CMUS_INSTALLER_INSTALL_METHOD",
            "CMUS_INSTALLER_MAKE",
            "RUST_LOG",
        ] {
            cmd.env_remove(var);
        }
        cmd
    }

    pub fn path(&self, relative: &str) -> PathBuf {
        self._temp_dir.path().join(relative)
    }
}

#[allow(dead_code)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    pub status: std::process::ExitStatus,
}

impl From<Output> for CommandOutput {
    fn from(output: Output) -> Self {
        Self {
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            status: output.status,
        }
    }
}

#[allow(dead_code)]
impl CommandOutput {
    pub fn assert_success(&self) -> &Self {
        if !self.status.success() {
            panic!(
                "Command failed with status {:?}\nstdout: {}\nstderr: {}",
                self.status.code(),
                self.stdout,
                self.stderr
            );
        }
        self
    }

    pub fn assert_failure(&self) -> &Self {
        assert!(
            !self.status.success(),
            "Command unexpectedly succeeded\nstdout: {}\nstderr: {}",
            self.stdout,
            self.stderr
        );
        self
    }

    pub fn assert_stdout_contains(&self, text: &str) -> &Self {
        assert!(
            self.stdout.contains(text),
            "Stdout did not contain '{}'\nActual stdout: {}",
            text,
            self.stdout
        );
        self
    }

    pub fn assert_stderr_contains(&self, text: &str) -> &Self {
        assert!(
            self.stderr.contains(text),
            "Stderr did not contain '{}'\nActual stderr: {}",
            text,
            self.stderr
        );
        self
    }
}

/// Fetcher that writes a placeholder archive, or serves a prepared one.
#[allow(dead_code)]
#[derive(Default)]
pub struct StubFetcher {
    pub calls: AtomicUsize,
    /// Versions reported as missing upstream
    pub missing: Vec<String>,
    /// Archive copied into the staging dir instead of the placeholder
    pub archive: Option<PathBuf>,
    /// When set, each fetch waits for a permit before finishing
    pub gate: Option<Arc<Semaphore>>,
}

#[allow(dead_code)]
impl StubFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn missing(versions: &[&str]) -> Self {
        Self {
            missing: versions.iter().map(|v| v.to_string()).collect(),
            ..Self::default()
        }
    }

    pub fn serving(archive: impl Into<PathBuf>) -> Self {
        Self {
            archive: Some(archive.into()),
            ..Self::default()
        }
    }

    /// A fetcher that blocks until the returned semaphore gets a permit.
    pub fn gated() -> (Self, Arc<Semaphore>) {
        let gate = Arc::new(Semaphore::new(0));
        let fetcher = Self {
            gate: Some(Arc::clone(&gate)),
            ..Self::default()
        };
        (fetcher, gate)
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl ArtifactFetcher for StubFetcher {
    fn fetch<'a>(
        &'a self,
        version: &'a ReleaseVersion,
        staging_dir: &'a Path,
    ) -> BoxFuture<'a, Result<PathBuf, StageError>> {
        Box::pin(async move {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if let Some(gate) = &self.gate {
                let _permit = gate
                    .acquire()
                    .await
                    .map_err(|e| StageError::network(e.to_string()))?;
            }
            if self.missing.iter().any(|v| v == version.number()) {
                return Err(StageError::NotFound {
                    version: version.to_string(),
                });
            }

            fs::create_dir_all(staging_dir)?;
            let path = staging_dir.join(format!("cmus-{}.zip", version.tag()));
            match &self.archive {
                Some(archive) => {
                    fs::copy(archive, &path)?;
                }
                None => fs::write(&path, b"placeholder")?,
            }
            Ok(path)
        })
    }
}

#[allow(dead_code)]
#[derive(Default)]
pub struct StubExtractor {
    pub calls: AtomicUsize,
    pub fail: bool,
}

#[allow(dead_code)]
impl StubExtractor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::default()
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl ArchiveExtractor for StubExtractor {
    fn extract<'a>(
        &'a self,
        _archive_path: &'a Path,
        work_dir: &'a Path,
    ) -> BoxFuture<'a, Result<PathBuf, StageError>> {
        Box::pin(async move {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(StageError::corrupt("truncated archive"));
            }
            let payload = work_dir.join("cmus");
            fs::create_dir_all(&payload)?;
            fs::write(payload.join("README"), b"cmus")?;
            Ok(payload)
        })
    }
}

#[allow(dead_code)]
#[derive(Default)]
pub struct StubInstaller {
    pub calls: AtomicUsize,
    pub fail: bool,
    pub panic: bool,
    pub destinations: Mutex<Vec<PathBuf>>,
}

#[allow(dead_code)]
impl StubInstaller {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::default()
        }
    }

    pub fn panicking() -> Self {
        Self {
            panic: true,
            ..Self::default()
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl Installer for StubInstaller {
    fn install<'a>(
        &'a self,
        _payload_dir: &'a Path,
        destination: &'a Path,
        _allow_overwrite: bool,
    ) -> BoxFuture<'a, Result<(), StageError>> {
        Box::pin(async move {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.panic {
                panic!("installer blew up");
            }
            if self.fail {
                return Err(StageError::PermissionDenied {
                    path: destination.to_path_buf(),
                });
            }
            self.destinations
                .lock()
                .unwrap()
                .push(destination.to_path_buf());
            Ok(())
        })
    }
}

/// Stub collaborators wired into a pipeline that stages under `staging_root`.
#[allow(dead_code)]
pub struct Harness {
    pub fetcher: Arc<StubFetcher>,
    pub extractor: Arc<StubExtractor>,
    pub installer: Arc<StubInstaller>,
    pub pipeline: InstallPipeline,
    pub staging_root: TempDir,
}

#[allow(dead_code)]
impl Harness {
    pub fn new(fetcher: StubFetcher, extractor: StubExtractor, installer: StubInstaller) -> Self {
        let staging_root = TempDir::new().expect("Failed to create staging root");
        let fetcher = Arc::new(fetcher);
        let extractor = Arc::new(extractor);
        let installer = Arc::new(installer);
        let pipeline = InstallPipeline::new(
            Arc::clone(&fetcher) as Arc<dyn ArtifactFetcher>,
            Arc::clone(&extractor) as Arc<dyn ArchiveExtractor>,
            Arc::clone(&installer) as Arc<dyn Installer>,
        )
        .with_staging_root(staging_root.path());

        Self {
            fetcher,
            extractor,
            installer,
            pipeline,
            staging_root,
        }
    }

    pub fn happy() -> Self {
        Self::new(StubFetcher::new(), StubExtractor::new(), StubInstaller::new())
    }
}

/// Poll `condition` until it holds, failing the test after a few seconds.
#[allow(dead_code)]
pub async fn wait_until(mut condition: impl FnMut() -> bool) {
    for _ in 0..500 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached in time");
}

/// Write a zip archive holding `entries` (name, contents).
#[allow(dead_code)]
pub fn write_zip(path: &Path, entries: &[(&str, &[u8])]) {
    let file = fs::File::create(path).unwrap();
    let mut zip = zip::ZipWriter::new(file);
    for (name, contents) in entries {
        let options = zip::write::FileOptions::default().unix_permissions(
            if name.ends_with("configure") || name.contains("/bin/") {
                0o755
            } else {
                0o644
            },
        );
        zip.start_file(*name, options).unwrap();
        zip.write_all(contents).unwrap();
    }
    zip.finish().unwrap();
}

/// Write a gzip-compressed tarball holding `entries` (name, contents).
///
/// Names are written into the header verbatim so unsafe names can be tested.
#[allow(dead_code)]
pub fn write_tar_gz(path: &Path, entries: &[(&str, &[u8])]) {
    let file = fs::File::create(path).unwrap();
    let encoder = flate2::write::GzEncoder::new(file, flate2::Compression::default());
    let mut builder = tar::Builder::new(encoder);
    for (name, contents) in entries {
        let mut header = tar::Header::new_old();
        let raw = name.as_bytes();
        header.as_old_mut().name[..raw.len()].copy_from_slice(raw);
        header.set_size(contents.len() as u64);
        header.set_mode(0o644);
        header.set_entry_type(tar::EntryType::Regular);
        header.set_cksum();
        builder.append(&header, *contents).unwrap();
    }
    builder.into_inner().unwrap().finish().unwrap();
}

#[allow(dead_code)]
pub enum TarFixture<'a> {
    Dir(&'a str),
    File(&'a str, &'a [u8]),
    Symlink(&'a str, &'a str),
}

/// Write a gzip-compressed tarball with directories and symlinks, in order.
#[allow(dead_code)]
pub fn write_tar_gz_entries(path: &Path, entries: &[TarFixture]) {
    let file = fs::File::create(path).unwrap();
    let encoder = flate2::write::GzEncoder::new(file, flate2::Compression::default());
    let mut builder = tar::Builder::new(encoder);
    for entry in entries {
        let mut header = tar::Header::new_old();
        let (name, contents): (&str, &[u8]) = match entry {
            TarFixture::Dir(name) => {
                header.set_entry_type(tar::EntryType::Directory);
                header.set_mode(0o755);
                (*name, &b""[..])
            }
            TarFixture::File(name, contents) => {
                header.set_entry_type(tar::EntryType::Regular);
                header.set_mode(0o644);
                (*name, *contents)
            }
            TarFixture::Symlink(name, target) => {
                header.set_entry_type(tar::EntryType::Symlink);
                header.set_mode(0o777);
                header.set_link_name(target).unwrap();
                (*name, &b""[..])
            }
        };
        let raw = name.as_bytes();
        header.as_old_mut().name[..raw.len()].copy_from_slice(raw);
        header.set_size(contents.len() as u64);
        header.set_cksum();
        builder.append(&header, contents).unwrap();
    }
    builder.into_inner().unwrap().finish().unwrap();
}
