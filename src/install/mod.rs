//! Placing an extracted payload at its final destination.
//!
//! Two installers are provided:
//! - [`BuildInstaller`] configures, builds and installs a source tree with the
//!   destination as prefix
//! - [`CopyInstaller`] copies a prebuilt tree into the destination

// Submodules
pub mod build;

pub use build::BuildInstaller;

use crate::error::StageError;
use crate::platform::set_executable;
use futures_util::future::BoxFuture;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

/// Places an extracted payload at the destination, leaving it runnable.
pub trait Installer: Send + Sync {
    fn install<'a>(
        &'a self,
        payload_dir: &'a Path,
        destination: &'a Path,
        allow_overwrite: bool,
    ) -> BoxFuture<'a, Result<(), StageError>>;
}

/// True when `path` holds something an install would clobber.
pub fn destination_occupied(path: &Path) -> Result<bool, StageError> {
    match fs::symlink_metadata(path) {
        Ok(meta) if meta.is_dir() => {
            let mut entries = fs::read_dir(path).map_err(|e| StageError::from_io_at(e, path))?;
            Ok(entries.next().is_some())
        }
        Ok(_) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(StageError::from_io_at(e, path)),
    }
}

#[derive(Debug, Clone, Default)]
pub struct CopyInstaller;

impl CopyInstaller {
    pub fn new() -> Self {
        Self
    }

    pub fn install_blocking(
        &self,
        payload_dir: &Path,
        destination: &Path,
        allow_overwrite: bool,
    ) -> Result<(), StageError> {
        if !payload_dir.is_dir() {
            return Err(StageError::Io(io::Error::new(
                io::ErrorKind::NotFound,
                format!("payload directory {} is missing", payload_dir.display()),
            )));
        }

        let occupied = destination_occupied(destination)?;
        if occupied && !allow_overwrite {
            return Err(StageError::DestinationConflict {
                path: destination.to_path_buf(),
            });
        }

        let parent = destination.parent().ok_or_else(|| {
            StageError::Io(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("destination {} has no parent", destination.display()),
            ))
        })?;
        fs::create_dir_all(parent).map_err(|e| StageError::from_io_at(e, parent))?;

        // Populate a sibling first so the destination only ever sees a complete tree
        let staged = tempfile::Builder::new()
            .prefix(".cmus-install-")
            .tempdir_in(parent)
            .map_err(|e| StageError::from_io_at(e, parent))?;
        tracing::debug!("Copying payload into {}", staged.path().display());
        copy_tree(payload_dir, staged.path())?;
        mark_executables(staged.path())?;

        let previous = if occupied {
            let holder = tempfile::Builder::new()
                .prefix(".cmus-previous-")
                .tempdir_in(parent)
                .map_err(|e| StageError::from_io_at(e, parent))?;
            let moved = holder.path().join("previous");
            fs::rename(destination, &moved).map_err(|e| StageError::from_io_at(e, destination))?;
            Some((holder, moved))
        } else {
            if destination.is_dir() {
                fs::remove_dir(destination).map_err(|e| StageError::from_io_at(e, destination))?;
            }
            None
        };

        if let Err(e) = fs::rename(staged.path(), destination) {
            if let Some((_, moved)) = &previous {
                if let Err(restore) = fs::rename(moved, destination) {
                    tracing::error!(
                        "Could not restore previous install at {}: {}",
                        destination.display(),
                        restore
                    );
                }
            }
            return Err(StageError::from_io_at(e, destination));
        }

        tracing::info!("Installed payload to {}", destination.display());
        Ok(())
    }
}

impl Installer for CopyInstaller {
    fn install<'a>(
        &'a self,
        payload_dir: &'a Path,
        destination: &'a Path,
        allow_overwrite: bool,
    ) -> BoxFuture<'a, Result<(), StageError>> {
        let installer = self.clone();
        let payload_dir = payload_dir.to_path_buf();
        let destination = destination.to_path_buf();
        Box::pin(async move {
            tokio::task::spawn_blocking(move || {
                installer.install_blocking(&payload_dir, &destination, allow_overwrite)
            })
            .await
            .map_err(|e| StageError::Io(io::Error::new(io::ErrorKind::Other, e)))?
        })
    }
}

/// Recursively copy `from` into `to`, keeping file modes and symlinks.
pub fn copy_tree(from: &Path, to: &Path) -> Result<(), StageError> {
    for entry in WalkDir::new(from).follow_links(false) {
        let entry = entry.map_err(|e| {
            let path = e.path().map(Path::to_path_buf).unwrap_or_else(|| from.to_path_buf());
            match e.into_io_error() {
                Some(io_err) => StageError::from_io_at(io_err, path),
                None => StageError::Io(io::Error::new(io::ErrorKind::Other, "filesystem loop")),
            }
        })?;
        let relative = entry
            .path()
            .strip_prefix(from)
            .map_err(|e| StageError::Io(io::Error::new(io::ErrorKind::Other, e)))?;
        let target: PathBuf = to.join(relative);
        let file_type = entry.file_type();

        if file_type.is_dir() {
            fs::create_dir_all(&target).map_err(|e| StageError::from_io_at(e, &target))?;
        } else if file_type.is_symlink() {
            copy_symlink(entry.path(), &target)?;
        } else {
            fs::copy(entry.path(), &target).map_err(|e| StageError::from_io_at(e, &target))?;
        }
    }
    Ok(())
}

#[cfg(unix)]
fn copy_symlink(link: &Path, target: &Path) -> Result<(), StageError> {
    let points_to = fs::read_link(link).map_err(|e| StageError::from_io_at(e, link))?;
    std::os::unix::fs::symlink(points_to, target).map_err(|e| StageError::from_io_at(e, target))
}

#[cfg(not(unix))]
fn copy_symlink(link: &Path, target: &Path) -> Result<(), StageError> {
    fs::copy(link, target)
        .map(|_| ())
        .map_err(|e| StageError::from_io_at(e, target))
}

/// Make `bin/*` entries and top-level build scripts executable.
fn mark_executables(root: &Path) -> Result<(), StageError> {
    for entry in WalkDir::new(root).into_iter().filter_map(|e| e.ok()) {
        if !entry.file_type().is_file() {
            continue;
        }
        let path = entry.path();
        let in_bin = path
            .parent()
            .and_then(|p| p.file_name())
            .is_some_and(|name| name == "bin");
        let is_script = path.parent() == Some(root)
            && path
                .file_name()
                .is_some_and(|name| name == "configure" || name == "install.sh");
        if in_bin || is_script {
            set_executable(path).map_err(|e| StageError::from_io_at(e, path))?;
        }
    }
    Ok(())
}
