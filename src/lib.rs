//! Fetch, unpack and install a cmus release.
//!
//! The crate is built around [`InstallPipeline`], which runs three stages for an
//! [`InstallRequest`]:
//! - fetch the release archive ([`ArtifactFetcher`])
//! - extract it ([`ArchiveExtractor`])
//! - install the payload at the destination ([`Installer`])
//!
//! Progress is observed through [`InstallPipeline::subscribe`]; the stage
//! implementations can be swapped for anything implementing the traits.

pub mod boundary;
pub mod config;
pub mod download;
pub mod error;
pub mod extract;
pub mod install;
pub mod pipeline;
pub mod platform;
pub mod types;
pub mod version;


pub use download::{ArtifactFetcher, HttpFetcher};
pub use error::{ErrorKind, PipelineError, StageError};
pub use extract::{ArchiveExtractor, ArchiveFormat, FsExtractor};
pub use install::{BuildInstaller, CopyInstaller, Installer};
pub use pipeline::{InstallPipeline, RunHandle};
pub use types::{
    InstallMethod, InstallRequest, InstallerConfig, InstallerSettings, Outcome, PipelineRun,
    RequestId, RunId, RunState, Stage, StageResult,
};
pub use version::ReleaseVersion;
