//! Source build install: `./configure prefix=<dest> && make && make install`.

use super::Installer;
use crate::error::StageError;
use crate::platform::set_executable;
use futures_util::future::BoxFuture;
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;

const OUTPUT_TAIL_LINES: usize = 20;

#[derive(Debug, Clone)]
pub struct BuildInstaller {
    make_program: String,
}

impl Default for BuildInstaller {
    fn default() -> Self {
        Self::new(crate::platform::default_make_program())
    }
}

impl BuildInstaller {
    pub fn new(make_program: impl Into<String>) -> Self {
        Self {
            make_program: make_program.into(),
        }
    }

    /// Configure, build and install the tree at `source_dir`.
    ///
    /// Without a prefix the configure script's own default is used.
    pub async fn build_and_install(
        &self,
        source_dir: &Path,
        prefix: Option<&Path>,
        allow_overwrite: bool,
    ) -> Result<(), StageError> {
        if let Some(prefix) = prefix {
            let not_a_dir = std::fs::symlink_metadata(prefix).is_ok_and(|meta| !meta.is_dir());
            let existing = prefix.join("bin").join("cmus");
            if (not_a_dir || existing.exists()) && !allow_overwrite {
                return Err(StageError::DestinationConflict {
                    path: prefix.to_path_buf(),
                });
            }
        }

        let configure = source_dir.join("configure");
        if !configure.is_file() {
            return Err(StageError::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("no configure script in {}", source_dir.display()),
            )));
        }
        set_executable(&configure).map_err(|e| StageError::from_io_at(e, &configure))?;

        let install_script = source_dir.join("scripts").join("install");
        if install_script.is_file() {
            set_executable(&install_script)
                .map_err(|e| StageError::from_io_at(e, &install_script))?;
        }

        let denied_path = prefix.unwrap_or(source_dir);
        let configure_args: Vec<String> = prefix
            .map(|p| vec![format!("prefix={}", p.display())])
            .unwrap_or_default();

        run_logged("./configure", &configure_args, source_dir, denied_path).await?;
        run_logged(&self.make_program, &[], source_dir, denied_path).await?;
        run_logged(
            &self.make_program,
            &["install".to_string()],
            source_dir,
            denied_path,
        )
        .await?;

        tracing::info!(
            "Installed cmus from {} into {}",
            source_dir.display(),
            prefix.map_or_else(|| "the default prefix".to_string(), |p| p.display().to_string())
        );
        Ok(())
    }
}

impl Installer for BuildInstaller {
    fn install<'a>(
        &'a self,
        payload_dir: &'a Path,
        destination: &'a Path,
        allow_overwrite: bool,
    ) -> BoxFuture<'a, Result<(), StageError>> {
        Box::pin(self.build_and_install(payload_dir, Some(destination), allow_overwrite))
    }
}

/// Run a command in `cwd`, forwarding its output to the log.
async fn run_logged(
    program: &str,
    args: &[String],
    cwd: &Path,
    denied_path: &Path,
) -> Result<(), StageError> {
    let command_line = std::iter::once(program.to_string())
        .chain(args.iter().cloned())
        .collect::<Vec<_>>()
        .join(" ");
    tracing::info!("Running {} in {}", command_line, cwd.display());

    let mut child = Command::new(program)
        .args(args)
        .current_dir(cwd)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| match e.kind() {
            std::io::ErrorKind::PermissionDenied => StageError::PermissionDenied {
                path: cwd.join(program),
            },
            _ => StageError::CommandFailed {
                command: command_line.clone(),
                message: e.to_string(),
            },
        })?;

    let stdout = child.stdout.take().map(|out| tokio::spawn(forward_lines(out)));
    let stderr = child.stderr.take().map(|err| tokio::spawn(forward_lines(err)));

    let status = child.wait().await?;

    let mut tail = Vec::new();
    for task in [stdout, stderr].into_iter().flatten() {
        if let Ok(lines) = task.await {
            tail.extend(lines);
        }
    }

    if status.success() {
        return Ok(());
    }

    if tail.iter().any(|line| line.contains("Permission denied")) {
        return Err(StageError::PermissionDenied {
            path: PathBuf::from(denied_path),
        });
    }

    let mut message = format!("exited with {}", status);
    if !tail.is_empty() {
        message.push_str(": ");
        message.push_str(&tail.join("\n"));
    }
    Err(StageError::CommandFailed {
        command: command_line,
        message,
    })
}

/// Log each line and keep the last few for error reporting.
async fn forward_lines<R>(reader: R) -> Vec<String>
where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(reader).lines();
    let mut tail = VecDeque::with_capacity(OUTPUT_TAIL_LINES);
    while let Ok(Some(line)) = lines.next_line().await {
        tracing::info!("{}", line);
        if tail.len() == OUTPUT_TAIL_LINES {
            tail.pop_front();
        }
        tail.push_back(line);
    }
    tail.into_iter().collect()
}
