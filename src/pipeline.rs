//! Install orchestration.
//!
//! [`InstallPipeline`] runs fetch, extract and install one after another for a
//! request, records a [`StageResult`] per stage and publishes progress to any
//! number of subscribers without ever waiting on them.
//!
//! # Example
//!
//! ```rust,no_run
//! use cmus_installer::{InstallPipeline, InstallRequest, InstallerSettings};
//! use futures_util::StreamExt;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let pipeline = InstallPipeline::from_settings(&InstallerSettings::default())?;
//!     let handle = pipeline.start(InstallRequest::new("2.10.0", "/opt/cmus"))?;
//!
//!     let mut events = pipeline.subscribe(&handle);
//!     while let Some(result) = events.next().await {
//!         println!("{} -> {:?}", result.stage, result.outcome);
//!     }
//!     Ok(())
//! }
//! ```

use crate::download::{ArtifactFetcher, HttpFetcher};
use crate::error::{ErrorKind, PipelineError, StageError};
use crate::extract::{ArchiveExtractor, FsExtractor};
use crate::install::{BuildInstaller, CopyInstaller, Installer};
use crate::types::*;
use crate::version::ReleaseVersion;
use chrono::Utc;
use futures_util::stream::{self, BoxStream, StreamExt};
use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tempfile::TempDir;
use tokio::sync::watch;

type Registry = Mutex<HashMap<RequestId, RunId>>;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// State shared between a run's task, its handles and its subscribers.
struct RunShared {
    run: Mutex<PipelineRun>,
    cancel_requested: AtomicBool,
    notify: watch::Sender<RunState>,
}

impl RunShared {
    fn snapshot(&self) -> PipelineRun {
        lock(&self.run).clone()
    }

    fn is_cancelled(&self) -> bool {
        self.cancel_requested.load(Ordering::SeqCst)
    }

    fn record(&self, result: StageResult) {
        let state = {
            let mut run = lock(&self.run);
            run.history.push(result);
            run.current_stage
        };
        self.notify.send_replace(state);
    }

    fn advance(&self, next: RunState) {
        {
            let mut run = lock(&self.run);
            transition(&mut run, next);
        }
        self.notify.send_replace(next);
    }

    /// Append the last result and enter a terminal state in one step.
    fn finish(&self, result: StageResult, terminal: RunState) {
        {
            let mut run = lock(&self.run);
            run.history.push(result);
            transition(&mut run, terminal);
        }
        self.notify.send_replace(terminal);
    }
}

fn transition(run: &mut PipelineRun, next: RunState) {
    if !run.current_stage.can_advance_to(next) {
        tracing::error!(
            "Refusing transition {} -> {} for {}",
            run.current_stage,
            next,
            run.id
        );
        return;
    }
    run.current_stage = next;
    run.visited.push(next);
    if next.is_terminal() {
        run.ended_at = Some(Utc::now());
    }
}

/// Handle to one run; cheap to clone and safe to share between tasks.
#[derive(Clone)]
pub struct RunHandle {
    id: RunId,
    request_id: RequestId,
    shared: Arc<RunShared>,
}

impl RunHandle {
    pub fn id(&self) -> RunId {
        self.id
    }

    pub fn request_id(&self) -> &RequestId {
        &self.request_id
    }

    pub fn state(&self) -> RunState {
        lock(&self.shared.run).current_stage
    }

    pub fn snapshot(&self) -> PipelineRun {
        self.shared.snapshot()
    }

    /// Wait for the run to reach Completed or Failed and return its final state.
    pub async fn wait(&self) -> PipelineRun {
        let mut rx = self.shared.notify.subscribe();
        loop {
            {
                let run = lock(&self.shared.run);
                if run.is_terminal() {
                    return run.clone();
                }
            }
            if rx.changed().await.is_err() {
                return self.snapshot();
            }
        }
    }
}

impl fmt::Debug for RunHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RunHandle")
            .field("id", &self.id)
            .field("request_id", &self.request_id)
            .field("state", &self.state())
            .finish()
    }
}

/// Everything a run task needs, detached from the pipeline that spawned it.
#[derive(Clone)]
struct RunContext {
    shared: Arc<RunShared>,
    version: ReleaseVersion,
    request: InstallRequest,
    fetcher: Arc<dyn ArtifactFetcher>,
    extractor: Arc<dyn ArchiveExtractor>,
    installer: Arc<dyn Installer>,
    staging_root: Option<PathBuf>,
}

pub struct InstallPipeline {
    fetcher: Arc<dyn ArtifactFetcher>,
    extractor: Arc<dyn ArchiveExtractor>,
    installer: Arc<dyn Installer>,
    staging_root: Option<PathBuf>,
    active: Arc<Registry>,
    next_id: AtomicU64,
}

impl InstallPipeline {
    pub fn new(
        fetcher: Arc<dyn ArtifactFetcher>,
        extractor: Arc<dyn ArchiveExtractor>,
        installer: Arc<dyn Installer>,
    ) -> Self {
        Self {
            fetcher,
            extractor,
            installer,
            staging_root: None,
            active: Arc::new(Mutex::new(HashMap::new())),
            next_id: AtomicU64::new(0),
        }
    }

    /// Pipeline with the HTTP fetcher, filesystem extractor and the configured installer.
    pub fn from_settings(settings: &InstallerSettings) -> Result<Self, StageError> {
        let fetcher = Arc::new(HttpFetcher::new(settings)?);
        Ok(Self::new(fetcher, Arc::new(FsExtractor::new()), installer_for(settings))
            .with_staging_root_opt(settings.staging_dir.as_ref().map(PathBuf::from)))
    }

    /// Create per-run staging directories under `root` instead of the system temp dir.
    pub fn with_staging_root(self, root: impl Into<PathBuf>) -> Self {
        self.with_staging_root_opt(Some(root.into()))
    }

    fn with_staging_root_opt(mut self, root: Option<PathBuf>) -> Self {
        self.staging_root = root;
        self
    }

    /// Whether a run for `request_id` is currently in progress.
    pub fn is_active(&self, request_id: &RequestId) -> bool {
        lock(&self.active).contains_key(request_id)
    }

    /// String-typed entry point for callers that hold raw user input.
    pub fn start_install(
        &self,
        version: &str,
        destination: &str,
    ) -> Result<RunHandle, PipelineError> {
        self.start(InstallRequest::new(version, destination))
    }

    /// Validate `request` and start running it in the background.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn start(&self, request: InstallRequest) -> Result<RunHandle, PipelineError> {
        let version = request.validate()?;
        let request_id = request.id();
        let id = RunId(self.next_id.fetch_add(1, Ordering::Relaxed) + 1);

        {
            let mut active = lock(&self.active);
            if active.contains_key(&request_id) {
                tracing::warn!("Rejecting duplicate install of {}", request_id);
                return Err(PipelineError::AlreadyRunning {
                    request: request_id.to_string(),
                });
            }
            active.insert(request_id.clone(), id);
        }

        let mut run = PipelineRun::new(id, request.clone());
        transition(&mut run, RunState::Fetching);
        let (notify, _) = watch::channel(run.current_stage);
        let shared = Arc::new(RunShared {
            run: Mutex::new(run),
            cancel_requested: AtomicBool::new(false),
            notify,
        });

        tracing::info!(
            "Starting {}: cmus {} -> {}",
            id,
            version,
            request.destination.display()
        );
        if version.is_prerelease() {
            tracing::warn!("cmus {} is a pre-release", version);
        }

        let ctx = RunContext {
            shared: Arc::clone(&shared),
            version,
            request,
            fetcher: Arc::clone(&self.fetcher),
            extractor: Arc::clone(&self.extractor),
            installer: Arc::clone(&self.installer),
            staging_root: self.staging_root.clone(),
        };
        tokio::spawn(supervise(ctx, Arc::clone(&self.active), request_id.clone()));

        Ok(RunHandle {
            id,
            request_id,
            shared,
        })
    }

    /// Ordered stream of stage results, ending after the terminal one.
    ///
    /// A live run yields everything recorded so far, then each new result.
    /// A finished run yields only its final result.
    pub fn subscribe(&self, handle: &RunHandle) -> BoxStream<'static, StageResult> {
        let shared = Arc::clone(&handle.shared);
        let rx = shared.notify.subscribe();
        let cursor = {
            let run = lock(&shared.run);
            if run.is_terminal() {
                run.history.len().saturating_sub(1)
            } else {
                0
            }
        };

        stream::unfold((shared, rx, cursor), |(shared, mut rx, cursor)| async move {
            loop {
                let next = {
                    let run = lock(&shared.run);
                    match run.history.get(cursor) {
                        Some(result) => Some(result.clone()),
                        None if run.is_terminal() => return None,
                        None => None,
                    }
                };
                match next {
                    Some(result) => return Some((result, (shared, rx, cursor + 1))),
                    None => {
                        if rx.changed().await.is_err() {
                            return None;
                        }
                    }
                }
            }
        })
        .boxed()
    }

    /// Ask the run to stop at its next stage boundary.
    ///
    /// Returns false when the run has already finished.
    pub fn cancel(&self, handle: &RunHandle) -> bool {
        if handle.state().is_terminal() {
            return false;
        }
        handle.shared.cancel_requested.store(true, Ordering::SeqCst);
        tracing::info!("Cancellation requested for {}", handle.id);
        true
    }
}

pub fn installer_for(settings: &InstallerSettings) -> Arc<dyn Installer> {
    match settings.install_method {
        InstallMethod::Build => Arc::new(BuildInstaller::new(settings.make_program.clone())),
        InstallMethod::Copy => Arc::new(CopyInstaller::new()),
    }
}

/// Runs the stages on their own task so a panicking stage still ends the run.
async fn supervise(ctx: RunContext, active: Arc<Registry>, request_id: RequestId) {
    let shared = Arc::clone(&ctx.shared);
    let run_id = lock(&shared.run).id;

    let (result, terminal) = match tokio::spawn(run_stages(ctx)).await {
        Ok(outcome) => outcome,
        Err(e) => {
            let stage = lock(&shared.run)
                .current_stage
                .stage()
                .unwrap_or(Stage::Fetch);
            let result = StageResult {
                stage,
                outcome: Outcome::Failure,
                detail: Some(format!("{} stage aborted: {}", stage, e)),
                artifact_path: None,
                error_kind: Some(ErrorKind::Io),
            };
            (result, RunState::Failed)
        }
    };

    // Free the request before publishing, so a consumer may start it again at once
    {
        let mut active = lock(&active);
        if active.get(&request_id) == Some(&run_id) {
            active.remove(&request_id);
        }
    }

    match terminal {
        RunState::Completed => tracing::info!("{} completed", run_id),
        _ => tracing::warn!(
            "{} failed during {}: {}",
            run_id,
            result.stage,
            result.detail.as_deref().unwrap_or("unknown error")
        ),
    }
    shared.finish(result, terminal);
}

fn make_staging(root: Option<&Path>) -> Result<TempDir, StageError> {
    let mut builder = tempfile::Builder::new();
    builder.prefix("cmus-installer-");
    let staging = match root {
        Some(root) => {
            std::fs::create_dir_all(root).map_err(|e| StageError::from_io_at(e, root))?;
            builder.tempdir_in(root)
        }
        None => builder.tempdir(),
    }?;
    std::fs::create_dir_all(staging.path().join("download"))?;
    std::fs::create_dir_all(staging.path().join("work"))?;
    tracing::debug!("Staging directory: {}", staging.path().display());
    Ok(staging)
}

/// Execute the stages in order; returns the last result and the terminal state.
async fn run_stages(ctx: RunContext) -> (StageResult, RunState) {
    let shared = &ctx.shared;

    let staging = match make_staging(ctx.staging_root.as_deref()) {
        Ok(staging) => staging,
        Err(e) => return (StageResult::failure(Stage::Fetch, &e), RunState::Failed),
    };

    if shared.is_cancelled() {
        return (StageResult::cancelled(Stage::Fetch), RunState::Failed);
    }
    tracing::info!("Fetching cmus {}", ctx.version);
    let archive = match ctx
        .fetcher
        .fetch(&ctx.version, &staging.path().join("download"))
        .await
    {
        Ok(archive) => archive,
        Err(e) => return (StageResult::failure(Stage::Fetch, &e), RunState::Failed),
    };
    shared.record(StageResult::success(Stage::Fetch, Some(archive.clone())));

    if shared.is_cancelled() {
        return (StageResult::cancelled(Stage::Extract), RunState::Failed);
    }
    shared.advance(RunState::Extracting);
    tracing::info!("Extracting {}", archive.display());
    let extracted = match ctx
        .extractor
        .extract(&archive, &staging.path().join("work"))
        .await
    {
        Ok(dir) => dir,
        Err(e) => return (StageResult::failure(Stage::Extract, &e), RunState::Failed),
    };
    shared.record(StageResult::success(Stage::Extract, Some(extracted.clone())));

    if shared.is_cancelled() {
        return (StageResult::cancelled(Stage::Install), RunState::Failed);
    }
    shared.advance(RunState::Installing);
    let destination = &ctx.request.destination;
    tracing::info!("Installing into {}", destination.display());
    match ctx
        .installer
        .install(&extracted, destination, ctx.request.allow_overwrite)
        .await
    {
        Ok(()) => (
            StageResult::success(Stage::Install, Some(destination.clone())),
            RunState::Completed,
        ),
        Err(e) => (StageResult::failure(Stage::Install, &e), RunState::Failed),
    }
}
