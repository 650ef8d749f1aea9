use crate::error::{ErrorKind, PipelineError, StageError};
use crate::version::ReleaseVersion;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Component, PathBuf};

pub const DEFAULT_DOWNLOAD_URL: &str = "https://github.com/cmus/cmus/archive/refs/tags/{tag}.zip";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub enum InstallMethod {
    /// Run the source tree's configure script, then `make install`
    #[serde(rename = "build")]
    #[default]
    Build,
    /// Copy the extracted payload into the destination as-is
    #[serde(rename = "copy")]
    Copy,
}

impl InstallMethod {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_lowercase().as_str() {
            "build" => Some(InstallMethod::Build),
            "copy" => Some(InstallMethod::Copy),
            _ => None,
        }
    }
}

impl fmt::Display for InstallMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InstallMethod::Build => f.write_str("build"),
            InstallMethod::Copy => f.write_str("copy"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct InstallerSettings {
    #[serde(default = "default_download_url")]
    pub download_url: String,
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
    #[serde(default)]
    pub staging_dir: Option<String>,
    #[serde(default)]
    pub install_method: InstallMethod,
    #[serde(default = "default_make_program")]
    pub make_program: String,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_download_url() -> String {
    DEFAULT_DOWNLOAD_URL.to_string()
}
fn default_user_agent() -> String {
    format!("cmus-installer/{}", env!("CARGO_PKG_VERSION"))
}
fn default_make_program() -> String {
    crate::platform::default_make_program().to_string()
}
fn default_timeout_secs() -> u64 {
    300
}

impl Default for InstallerSettings {
    fn default() -> Self {
        Self {
            download_url: default_download_url(),
            user_agent: default_user_agent(),
            staging_dir: None,
            install_method: InstallMethod::default(),
            make_program: default_make_program(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct InstallerConfig {
    #[serde(default)]
    pub settings: InstallerSettings,
}

/// Identity of an install request; two requests with the same id may not run at once.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RequestId(String);

impl RequestId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// What to install and where. Immutable once a run has started.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct InstallRequest {
    pub version: String,
    pub destination: PathBuf,
    #[serde(default)]
    pub allow_overwrite: bool,
}

impl InstallRequest {
    pub fn new(version: impl Into<String>, destination: impl Into<PathBuf>) -> Self {
        Self {
            version: version.into(),
            destination: destination.into(),
            allow_overwrite: false,
        }
    }

    pub fn with_overwrite(mut self, allow_overwrite: bool) -> Self {
        self.allow_overwrite = allow_overwrite;
        self
    }

    pub fn id(&self) -> RequestId {
        RequestId(format!(
            "{}@{}",
            self.version.trim().trim_start_matches('v'),
            self.destination.display()
        ))
    }

    /// Check the request is well formed without touching the filesystem.
    pub fn validate(&self) -> Result<ReleaseVersion, PipelineError> {
        let version = ReleaseVersion::parse(&self.version).map_err(PipelineError::invalid)?;

        let destination = &self.destination;
        if destination.as_os_str().is_empty() {
            return Err(PipelineError::invalid("Destination path cannot be empty"));
        }
        if destination.to_string_lossy().contains('\0') {
            return Err(PipelineError::invalid("Destination path contains a NUL byte"));
        }
        if !destination.is_absolute() {
            return Err(PipelineError::invalid(format!(
                "Destination '{}' must be an absolute path",
                destination.display()
            )));
        }
        if destination
            .components()
            .any(|c| matches!(c, Component::ParentDir))
        {
            return Err(PipelineError::invalid(format!(
                "Destination '{}' must not contain '..'",
                destination.display()
            )));
        }
        if destination.file_name().is_none() {
            return Err(PipelineError::invalid(format!(
                "Destination '{}' must name a directory below the filesystem root",
                destination.display()
            )));
        }

        Ok(version)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Stage {
    Fetch,
    Extract,
    Install,
}

impl Stage {
    pub const ALL: [Stage; 3] = [Stage::Fetch, Stage::Extract, Stage::Install];

    /// State a run is in while this stage executes.
    pub fn running_state(&self) -> RunState {
        match self {
            Stage::Fetch => RunState::Fetching,
            Stage::Extract => RunState::Extracting,
            Stage::Install => RunState::Installing,
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Stage::Fetch => f.write_str("fetch"),
            Stage::Extract => f.write_str("extract"),
            Stage::Install => f.write_str("install"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Outcome {
    Success,
    Failure,
}

/// Outcome of one stage, as recorded in the run history and sent to subscribers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageResult {
    pub stage: Stage,
    pub outcome: Outcome,
    #[serde(default)]
    pub detail: Option<String>,
    #[serde(default)]
    pub artifact_path: Option<PathBuf>,
    #[serde(default)]
    pub error_kind: Option<ErrorKind>,
}

impl StageResult {
    pub fn success(stage: Stage, artifact_path: Option<PathBuf>) -> Self {
        Self {
            stage,
            outcome: Outcome::Success,
            detail: None,
            artifact_path,
            error_kind: None,
        }
    }

    pub fn failure(stage: Stage, error: &StageError) -> Self {
        Self {
            stage,
            outcome: Outcome::Failure,
            detail: Some(error.to_string()),
            artifact_path: None,
            error_kind: Some(error.kind()),
        }
    }

    pub fn cancelled(stage: Stage) -> Self {
        Self {
            stage,
            outcome: Outcome::Failure,
            detail: Some("cancelled".to_string()),
            artifact_path: None,
            error_kind: Some(ErrorKind::Cancelled),
        }
    }

    pub fn is_success(&self) -> bool {
        self.outcome == Outcome::Success
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum RunState {
    #[default]
    Idle,
    Fetching,
    Extracting,
    Installing,
    Completed,
    Failed,
}

impl RunState {
    pub fn label(&self) -> &'static str {
        match self {
            RunState::Idle => "Idle",
            RunState::Fetching => "Fetching",
            RunState::Extracting => "Extracting",
            RunState::Installing => "Installing",
            RunState::Completed => "Completed",
            RunState::Failed => "Failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, RunState::Completed | RunState::Failed)
    }

    /// The stage executing while in this state, if any.
    pub fn stage(&self) -> Option<Stage> {
        match self {
            RunState::Fetching => Some(Stage::Fetch),
            RunState::Extracting => Some(Stage::Extract),
            RunState::Installing => Some(Stage::Install),
            _ => None,
        }
    }

    fn rank(&self) -> u8 {
        match self {
            RunState::Idle => 0,
            RunState::Fetching => 1,
            RunState::Extracting => 2,
            RunState::Installing => 3,
            RunState::Completed | RunState::Failed => 4,
        }
    }

    /// Forward-only transition rule: Failed is reachable from any live state,
    /// every other move goes exactly one step ahead.
    pub fn can_advance_to(&self, next: RunState) -> bool {
        if self.is_terminal() {
            return false;
        }
        match next {
            RunState::Failed => true,
            RunState::Completed => *self == RunState::Installing,
            _ => next.rank() == self.rank() + 1,
        }
    }
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RunId(pub u64);

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "run-{}", self.0)
    }
}

/// One execution of the pipeline. Consumers only ever see clones of it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineRun {
    pub id: RunId,
    pub request: InstallRequest,
    pub current_stage: RunState,
    pub history: Vec<StageResult>,
    pub visited: Vec<RunState>,
    pub started_at: DateTime<Utc>,
    #[serde(default)]
    pub ended_at: Option<DateTime<Utc>>,
}

impl PipelineRun {
    pub fn new(id: RunId, request: InstallRequest) -> Self {
        Self {
            id,
            request,
            current_stage: RunState::Idle,
            history: Vec::new(),
            visited: vec![RunState::Idle],
            started_at: Utc::now(),
            ended_at: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.current_stage.is_terminal()
    }

    pub fn last_result(&self) -> Option<&StageResult> {
        self.history.last()
    }
}
