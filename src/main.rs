mod cli;
mod progress;

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use cli::{Cli, Commands, ConfigAction};
use cmus_installer::config::{
    apply_env_overrides, get_setting, load_config, normalize_key, save_config, set_setting,
    unset_setting, SETTING_KEYS,
};
use cmus_installer::pipeline::installer_for;
use cmus_installer::{
    FsExtractor, HttpFetcher, InstallMethod, InstallPipeline, InstallRequest, InstallerConfig,
    InstallerSettings, RunState,
};
use std::path::PathBuf;
use std::sync::Arc;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging
    setup_logging(&cli)?;

    // Load configuration
    let mut config = load_config()?;

    match cli.command {
        Commands::Version => {
            println!("cmus-installer v{}", env!("CARGO_PKG_VERSION"));
        }

        Commands::Install {
            version,
            destination,
            overwrite,
            method,
            json,
        } => {
            let mut settings = config.settings.clone();
            apply_env_overrides(&mut settings);
            if let Some(method) = method {
                settings.install_method = method;
            }
            let hide_progress = json || cli.quiet;
            let succeeded =
                install(&settings, version, destination, overwrite, json, hide_progress).await?;
            if !succeeded {
                std::process::exit(1);
            }
        }

        Commands::Config { action } => handle_config(&mut config, action)?,
    }

    Ok(())
}

fn setup_logging(cli: &Cli) -> Result<()> {
    use tracing_subscriber::{fmt, EnvFilter};

    let level = if cli.quiet {
        "error"
    } else if cli.verbose == 0 {
        "warn"
    } else if cli.verbose == 1 {
        "info"
    } else {
        "debug"
    };

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_thread_ids(false)
        .with_thread_names(false)
        .init();

    Ok(())
}

async fn install(
    settings: &InstallerSettings,
    version: String,
    destination: PathBuf,
    overwrite: bool,
    json: bool,
    hide_progress: bool,
) -> Result<bool> {
    let destination = if destination.is_absolute() {
        destination
    } else {
        std::env::current_dir()
            .context("Could not resolve the destination against the current directory")?
            .join(destination)
    };

    let pb = progress::spinner(hide_progress);
    let fetcher = HttpFetcher::new(settings)?.with_progress(pb.clone());
    let mut pipeline = InstallPipeline::new(
        Arc::new(fetcher),
        Arc::new(FsExtractor::new()),
        installer_for(settings),
    );
    if let Some(staging) = &settings.staging_dir {
        pipeline = pipeline.with_staging_root(staging);
    }

    if settings.install_method == InstallMethod::Build {
        tracing::info!("Building with '{}'", settings.make_program);
    }

    let request = InstallRequest::new(version, destination).with_overwrite(overwrite);
    let handle = pipeline.start(request)?;
    let run = progress::follow(&pipeline, &handle, &pb, json).await?;
    pb.finish_and_clear();

    if !json {
        progress::print_summary(&run);
    }
    Ok(run.current_stage == RunState::Completed)
}

fn handle_config(config: &mut InstallerConfig, action: ConfigAction) -> Result<()> {
    match action {
        ConfigAction::Get { key } => {
            if let Some(key) = key {
                let value = get_setting(&config.settings, &key)
                    .ok_or_else(|| anyhow!("Setting '{}' not found", key))?;
                println!("{}", value);
            } else {
                println!("--- cmus-installer Settings ---");
                for key in SETTING_KEYS {
                    let value = get_setting(&config.settings, key).unwrap_or_default();
                    println!("  {}: {}", key, value);
                }
            }
        }
        ConfigAction::Set { args } => {
            let (key, value) = match args.as_slice() {
                [single] => single
                    .split_once('=')
                    .map(|(k, v)| (k.to_string(), v.to_string()))
                    .ok_or_else(|| anyhow!("Invalid format. Use 'key=value' or 'key value'."))?,
                [key, rest @ ..] => (key.clone(), rest.join(" ")),
                [] => return Err(anyhow!("Missing key and value")),
            };
            set_setting(&mut config.settings, &key, &value)?;
            save_config(config)?;
            tracing::info!("Setting '{}' updated to '{}'", normalize_key(&key), value);
        }
        ConfigAction::Unset { key } => {
            unset_setting(&mut config.settings, &key)?;
            save_config(config)?;
            tracing::info!("Setting '{}' unset", normalize_key(&key));
        }
        ConfigAction::Show { format } => match format.as_str() {
            "json" => println!("{}", serde_json::to_string_pretty(config)?),
            "yaml" => print!("{}", serde_yaml::to_string(config)?),
            "plain" => {
                for key in SETTING_KEYS {
                    let value = get_setting(&config.settings, key).unwrap_or_default();
                    println!("{}={}", key, value);
                }
            }
            other => return Err(anyhow!("Unknown format '{}'. Use json, yaml or plain", other)),
        },
    }
    Ok(())
}
