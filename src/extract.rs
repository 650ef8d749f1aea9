//! Archive extraction.
//!
//! Every entry is checked before anything is written: an archive with an entry
//! that would land outside the working directory is rejected as a whole.

use crate::error::StageError;
use flate2::read::GzDecoder;
use futures_util::future::BoxFuture;
use std::collections::HashSet;
use std::ffi::OsString;
use std::fs;
use std::io::{self, Read};
use std::path::{Component, Path, PathBuf};
use tar::{Archive, EntryType};

/// Expands a staged archive into a working directory.
pub trait ArchiveExtractor: Send + Sync {
    /// Returns the directory holding the extracted payload.
    fn extract<'a>(
        &'a self,
        archive_path: &'a Path,
        work_dir: &'a Path,
    ) -> BoxFuture<'a, Result<PathBuf, StageError>>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveFormat {
    Zip,
    TarGz,
    TarXz,
    Tar,
}

impl ArchiveFormat {
    /// Detect the format from the file's leading bytes, then from its name.
    pub fn detect(path: &Path) -> Result<Self, StageError> {
        let mut header = Vec::with_capacity(512);
        fs::File::open(path)
            .map_err(|e| StageError::from_io_at(e, path))?
            .take(512)
            .read_to_end(&mut header)?;

        Self::from_magic(&header)
            .or_else(|| Self::from_extension(path))
            .ok_or_else(|| StageError::UnsupportedFormat {
                path: path.to_path_buf(),
            })
    }

    fn from_magic(header: &[u8]) -> Option<Self> {
        if header.starts_with(b"PK\x03\x04") || header.starts_with(b"PK\x05\x06") {
            Some(ArchiveFormat::Zip)
        } else if header.starts_with(&[0x1f, 0x8b]) {
            Some(ArchiveFormat::TarGz)
        } else if header.starts_with(&[0xfd, b'7', b'z', b'X', b'Z', 0x00]) {
            Some(ArchiveFormat::TarXz)
        } else if header.len() >= 262 && &header[257..262] == b"ustar" {
            Some(ArchiveFormat::Tar)
        } else {
            None
        }
    }

    fn from_extension(path: &Path) -> Option<Self> {
        let name = path.file_name()?.to_string_lossy().to_lowercase();
        if name.ends_with(".zip") {
            Some(ArchiveFormat::Zip)
        } else if name.ends_with(".tar.gz") || name.ends_with(".tgz") {
            Some(ArchiveFormat::TarGz)
        } else if name.ends_with(".tar.xz") || name.ends_with(".txz") {
            Some(ArchiveFormat::TarXz)
        } else if name.ends_with(".tar") {
            Some(ArchiveFormat::Tar)
        } else {
            None
        }
    }
}

/// Extractor backed by the `zip` and `tar` crates.
#[derive(Debug, Clone, Default)]
pub struct FsExtractor;

impl FsExtractor {
    pub fn new() -> Self {
        Self
    }

    /// Synchronous extraction; the trait impl runs this on the blocking pool.
    pub fn extract_blocking(
        &self,
        archive_path: &Path,
        work_dir: &Path,
    ) -> Result<PathBuf, StageError> {
        let format = ArchiveFormat::detect(archive_path)?;
        tracing::info!(
            "Extracting {} ({:?}) into {}",
            archive_path.display(),
            format,
            work_dir.display()
        );

        fs::create_dir_all(work_dir).map_err(|e| StageError::from_io_at(e, work_dir))?;

        let entries = match format {
            ArchiveFormat::Zip => extract_zip(archive_path, work_dir)?,
            ArchiveFormat::TarGz => extract_tar(archive_path, work_dir, |f| {
                Box::new(GzDecoder::new(f))
            })?,
            ArchiveFormat::TarXz => extract_tar(archive_path, work_dir, |f| {
                Box::new(xz2::read::XzDecoder::new(f))
            })?,
            ArchiveFormat::Tar => extract_tar(archive_path, work_dir, |f| Box::new(f))?,
        };

        let payload = match top_level_dir(&entries) {
            Some(top) => work_dir.join(top),
            None => work_dir.to_path_buf(),
        };
        tracing::info!("Extraction complete into {}", payload.display());
        Ok(payload)
    }
}

impl ArchiveExtractor for FsExtractor {
    fn extract<'a>(
        &'a self,
        archive_path: &'a Path,
        work_dir: &'a Path,
    ) -> BoxFuture<'a, Result<PathBuf, StageError>> {
        let extractor = self.clone();
        let archive_path = archive_path.to_path_buf();
        let work_dir = work_dir.to_path_buf();
        Box::pin(async move {
            tokio::task::spawn_blocking(move || extractor.extract_blocking(&archive_path, &work_dir))
                .await
                .map_err(|e| StageError::Io(io::Error::new(io::ErrorKind::Other, e)))?
        })
    }
}

/// Resolve an entry name to a path relative to the working directory.
///
/// Fails when the name is absolute or climbs above the working directory.
pub fn sanitize_entry_path(name: &Path) -> Result<PathBuf, StageError> {
    let mut resolved = PathBuf::new();
    for component in name.components() {
        match component {
            Component::Normal(part) => resolved.push(part),
            Component::CurDir => {}
            Component::ParentDir => {
                if !resolved.pop() {
                    return Err(StageError::corrupt(format!(
                        "entry '{}' escapes the working directory",
                        name.display()
                    )));
                }
            }
            Component::RootDir | Component::Prefix(_) => {
                return Err(StageError::corrupt(format!(
                    "entry '{}' has an absolute path",
                    name.display()
                )));
            }
        }
    }
    Ok(resolved)
}

/// Fail when walking `path` would step through a symlink the archive already holds.
fn reject_through_links(path: &Path, links: &HashSet<PathBuf>) -> Result<(), StageError> {
    let mut walked = PathBuf::new();
    for component in path.components() {
        if !walked.as_os_str().is_empty() && links.contains(&walked) {
            return Err(StageError::corrupt(format!(
                "entry '{}' passes through link '{}'",
                path.display(),
                walked.display()
            )));
        }
        match component {
            Component::Normal(part) => walked.push(part),
            Component::ParentDir => {
                walked.pop();
            }
            _ => {}
        }
    }
    Ok(())
}

/// Resolve a symlink target relative to the link's own directory.
fn sanitize_link_target(entry: &Path, target: &Path) -> Result<PathBuf, StageError> {
    if target.has_root() {
        return Err(StageError::corrupt(format!(
            "link '{}' points to absolute path '{}'",
            entry.display(),
            target.display()
        )));
    }
    let base = entry.parent().unwrap_or_else(|| Path::new(""));
    sanitize_entry_path(&base.join(target)).map_err(|_| {
        StageError::corrupt(format!(
            "link '{}' points outside the working directory",
            entry.display()
        ))
    })
}

fn top_level_dir(entries: &[PathBuf]) -> Option<OsString> {
    let first = entries.first()?.components().next()?.as_os_str().to_os_string();
    let shared = entries
        .iter()
        .all(|p| p.components().next().map(|c| c.as_os_str()) == Some(first.as_os_str()));
    let nested = entries.iter().any(|p| p.components().count() > 1);
    (shared && nested).then_some(first)
}

fn zip_error(err: zip::result::ZipError) -> StageError {
    match err {
        zip::result::ZipError::Io(e) => tar_io_error(e),
        other => StageError::corrupt(other.to_string()),
    }
}

fn extract_zip(archive_path: &Path, work_dir: &Path) -> Result<Vec<PathBuf>, StageError> {
    let file = fs::File::open(archive_path).map_err(|e| StageError::from_io_at(e, archive_path))?;
    let mut archive = zip::ZipArchive::new(file).map_err(zip_error)?;

    let mut entries = Vec::with_capacity(archive.len());
    for name in archive.file_names() {
        entries.push(sanitize_entry_path(Path::new(name))?);
    }
    entries.retain(|p| !p.as_os_str().is_empty());
    if entries.is_empty() {
        return Err(StageError::corrupt("archive is empty"));
    }

    for i in 0..archive.len() {
        let mut file = archive.by_index(i).map_err(zip_error)?;
        let relative = sanitize_entry_path(Path::new(file.name()))?;
        if relative.as_os_str().is_empty() {
            continue;
        }
        let outpath = work_dir.join(&relative);

        if file.is_dir() {
            fs::create_dir_all(&outpath).map_err(|e| StageError::from_io_at(e, &outpath))?;
            continue;
        }

        if let Some(parent) = outpath.parent() {
            fs::create_dir_all(parent).map_err(|e| StageError::from_io_at(e, parent))?;
        }
        let mut outfile =
            fs::File::create(&outpath).map_err(|e| StageError::from_io_at(e, &outpath))?;
        io::copy(&mut file, &mut outfile).map_err(tar_io_error)?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            if let Some(mode) = file.unix_mode() {
                fs::set_permissions(&outpath, fs::Permissions::from_mode(mode & 0o7777))?;
            }
        }
    }

    Ok(entries)
}

fn tar_io_error(err: io::Error) -> StageError {
    match err.kind() {
        io::ErrorKind::InvalidData | io::ErrorKind::InvalidInput | io::ErrorKind::UnexpectedEof => {
            StageError::corrupt(err.to_string())
        }
        _ => StageError::Io(err),
    }
}

fn is_payload_entry(kind: EntryType) -> bool {
    matches!(
        kind,
        EntryType::Regular
            | EntryType::Continuous
            | EntryType::Directory
            | EntryType::Symlink
            | EntryType::Link
    )
}

fn open_tar(
    archive_path: &Path,
    decoder: &dyn Fn(fs::File) -> Box<dyn Read>,
) -> Result<Archive<Box<dyn Read>>, StageError> {
    let file = fs::File::open(archive_path).map_err(|e| StageError::from_io_at(e, archive_path))?;
    Ok(Archive::new(decoder(file)))
}

fn extract_tar(
    archive_path: &Path,
    work_dir: &Path,
    decoder: impl Fn(fs::File) -> Box<dyn Read>,
) -> Result<Vec<PathBuf>, StageError> {
    // First pass validates every entry so a bad archive writes nothing.
    let mut entries = Vec::new();
    let mut links = HashSet::new();
    let mut archive = open_tar(archive_path, &decoder)?;
    for entry in archive.entries().map_err(tar_io_error)? {
        let entry = entry.map_err(tar_io_error)?;
        let kind = entry.header().entry_type();
        if !is_payload_entry(kind) {
            continue;
        }
        let name = entry.path().map_err(tar_io_error)?.into_owned();
        let relative = sanitize_entry_path(&name)?;
        reject_through_links(&name, &links)?;
        match kind {
            EntryType::Symlink => {
                let target = entry
                    .link_name()
                    .map_err(tar_io_error)?
                    .ok_or_else(|| StageError::corrupt("symlink without a target"))?;
                sanitize_link_target(&relative, &target)?;
                let base = relative.parent().unwrap_or_else(|| Path::new(""));
                reject_through_links(&base.join(&target), &links)?;
                links.insert(relative.clone());
            }
            EntryType::Link => {
                let target = entry
                    .link_name()
                    .map_err(tar_io_error)?
                    .ok_or_else(|| StageError::corrupt("hard link without a target"))?;
                sanitize_entry_path(&target)?;
                reject_through_links(&target, &links)?;
            }
            _ => {}
        }
        if !relative.as_os_str().is_empty() {
            entries.push(relative);
        }
    }
    if entries.is_empty() {
        return Err(StageError::corrupt("archive is empty"));
    }

    let mut archive = open_tar(archive_path, &decoder)?;
    archive.set_preserve_permissions(true);
    for entry in archive.entries().map_err(tar_io_error)? {
        let mut entry = entry.map_err(tar_io_error)?;
        let kind = entry.header().entry_type();
        if !is_payload_entry(kind) {
            continue;
        }
        let relative = sanitize_entry_path(&entry.path().map_err(tar_io_error)?)?;
        if relative.as_os_str().is_empty() {
            continue;
        }
        let outpath = work_dir.join(&relative);
        if let Some(parent) = outpath.parent() {
            fs::create_dir_all(parent).map_err(|e| StageError::from_io_at(e, parent))?;
        }

        if kind == EntryType::Link {
            // tar would resolve the target against the process cwd
            let target = entry
                .link_name()
                .map_err(tar_io_error)?
                .ok_or_else(|| StageError::corrupt("hard link without a target"))?;
            let source = work_dir.join(sanitize_entry_path(&target)?);
            fs::hard_link(&source, &outpath).map_err(|e| StageError::from_io_at(e, &outpath))?;
            continue;
        }

        // unpack_in refuses anything that resolves outside work_dir on disk
        if !entry.unpack_in(work_dir).map_err(tar_io_error)? {
            return Err(StageError::corrupt(format!(
                "entry '{}' escapes the working directory",
                relative.display()
            )));
        }
    }

    Ok(entries)
}
