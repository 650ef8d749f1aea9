use clap::{Parser, Subcommand};
use cmus_installer::InstallMethod;
use std::path::PathBuf;

fn get_version() -> &'static str {
    const BASE_VERSION: &str = env!("CARGO_PKG_VERSION");

    // A tag at HEAD is a release build
    if let Some(tag) = option_env!("CMUS_INSTALLER_GIT_TAG") {
        return tag;
    }

    let commit = option_env!("CMUS_INSTALLER_GIT_COMMIT").unwrap_or("unknown");
    let branch = option_env!("CMUS_INSTALLER_GIT_BRANCH").unwrap_or("unknown");

    // Leaked once at startup; clap needs a 'static str
    let version = format!("v{}-{} ({})", BASE_VERSION, commit, branch);
    Box::leak(version.into_boxed_str())
}

fn parse_method(value: &str) -> Result<InstallMethod, String> {
    InstallMethod::parse(value).ok_or_else(|| format!("'{}' is not 'build' or 'copy'", value))
}

#[derive(Parser)]
#[command(name = "cmus-installer")]
#[command(about = "Fetch, unpack and install a cmus release")]
#[command(version = get_version(), propagate_version = true)]
pub struct Cli {
    /// Increase verbosity (use multiple times for more detail)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Reduce output to errors only
    #[arg(short, long, global = true)]
    pub quiet: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Install a cmus release
    #[command(
        after_help = "Examples:\n  cmus-installer install 2.10.0 /opt/cmus\n  cmus-installer install v2.10.0 ~/.local/cmus --method build --overwrite"
    )]
    Install {
        /// Release to install (e.g., '2.10.0' or 'v2.10.0')
        #[arg(id = "release", value_name = "VERSION")]
        version: String,
        /// Absolute directory to install into
        destination: PathBuf,
        /// Replace an existing installation at the destination
        #[arg(long)]
        overwrite: bool,
        /// How to install the payload: 'build' (configure + make install) or 'copy'
        #[arg(long, value_parser = parse_method)]
        method: Option<InstallMethod>,
        /// Print each stage result as a JSON line instead of a spinner
        #[arg(long)]
        json: bool,
    },

    /// Manage cmus-installer's configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },

    /// Show the current version
    Version,
}

#[derive(Subcommand)]
pub enum ConfigAction {
    /// Get a configuration setting
    Get {
        /// Key to get (if omitted, shows all settings)
        key: Option<String>,
    },
    /// Set a configuration setting
    Set {
        /// Key and value (e.g., 'install-method=copy' or 'install-method copy')
        #[arg(trailing_var_arg = true, required = true)]
        args: Vec<String>,
    },
    /// Reset a configuration setting to its default
    Unset {
        /// Key to unset (e.g., 'staging-dir')
        key: String,
    },
    /// Show full configuration
    Show {
        /// Output format (json, yaml, plain)
        #[arg(long, default_value = "json")]
        format: String,
    },
}
