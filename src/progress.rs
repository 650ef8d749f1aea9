use anyhow::Result;
use cmus_installer::{
    InstallPipeline, Outcome, PipelineRun, ReleaseVersion, RunHandle, RunState, Stage, StageResult,
};
use console::style;
use futures_util::StreamExt;
use indicatif::{ProgressBar, ProgressStyle};
use std::time::Duration;

pub fn spinner(hidden: bool) -> ProgressBar {
    if hidden {
        return ProgressBar::hidden();
    }
    let pb = ProgressBar::new_spinner();
    pb.set_style(download_style());
    pb.enable_steady_tick(Duration::from_millis(100));
    pb
}

fn download_style() -> ProgressStyle {
    ProgressStyle::default_spinner()
        .template("{spinner:.green} [{elapsed_precise}] {msg} {bytes}/{total_bytes}")
        .unwrap_or_else(|_| ProgressStyle::default_spinner())
}

fn stage_style() -> ProgressStyle {
    ProgressStyle::default_spinner()
        .template("{spinner:.green} [{elapsed_precise}] {msg}")
        .unwrap_or_else(|_| ProgressStyle::default_spinner())
}

/// Next state a successful stage hands over to.
fn next_state(stage: Stage) -> RunState {
    match stage {
        Stage::Fetch => RunState::Extracting,
        Stage::Extract => RunState::Installing,
        Stage::Install => RunState::Completed,
    }
}

fn describe(result: &StageResult) -> String {
    match result.outcome {
        Outcome::Success => format!("{} done", result.stage),
        Outcome::Failure => format!(
            "{} failed: {}",
            result.stage,
            result.detail.as_deref().unwrap_or("unknown error")
        ),
    }
}

/// Follow a run until it ends, cancelling it on Ctrl-C.
pub async fn follow(
    pipeline: &InstallPipeline,
    handle: &RunHandle,
    pb: &ProgressBar,
    json: bool,
) -> Result<PipelineRun> {
    let mut events = pipeline.subscribe(handle);
    let mut cancel_sent = false;

    pb.set_message(format!("{} cmus", handle.state()));

    loop {
        tokio::select! {
            event = events.next() => {
                let Some(result) = event else { break };
                if json {
                    println!("{}", serde_json::to_string(&result)?);
                    continue;
                }
                pb.println(describe(&result));
                if result.is_success() {
                    let next = next_state(result.stage);
                    pb.set_style(stage_style());
                    pb.set_message(format!("{} cmus", next));
                }
            }
            _ = tokio::signal::ctrl_c(), if !cancel_sent => {
                cancel_sent = true;
                if pipeline.cancel(handle) {
                    pb.println("Cancelling after the current stage finishes...");
                }
            }
        }
    }

    Ok(handle.wait().await)
}

/// Version as shown to the user, flagging pre-releases.
fn release_label(version: &str) -> String {
    match ReleaseVersion::parse(version) {
        Ok(release) if release.is_prerelease() => format!("{} (pre-release)", release),
        Ok(release) => release.to_string(),
        Err(_) => version.to_string(),
    }
}

pub fn print_summary(run: &PipelineRun) {
    let version = release_label(&run.request.version);
    let destination = run.request.destination.display();

    if run.current_stage == RunState::Completed {
        eprintln!(
            "{} cmus {} installed to {}",
            style("✔").green().bold(),
            version,
            destination
        );
        return;
    }

    let Some(last) = run.last_result() else {
        eprintln!("{} Install of cmus {} failed", style("✘").red().bold(), version);
        return;
    };
    eprintln!(
        "{} Install of cmus {} failed during {}: {}",
        style("✘").red().bold(),
        version,
        last.stage,
        last.detail.as_deref().unwrap_or("unknown error")
    );
    if last.error_kind.is_some_and(|kind| kind.is_retryable()) {
        eprintln!("  This may be temporary; run the same command again to retry.");
    }
}
