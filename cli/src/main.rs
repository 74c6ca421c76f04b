//! gx - binary entry point.
//!
//! ```text
//! main() -> init_tracing() -> Cli::parse() -> commands::run()
//!                                                  |
//!                                                  v
//!                    envs | activate | versions | install | serve | render | ignore-warning
//! ```
//!
//! User-facing output goes to stdout/stderr. Everything else goes to the log
//! file at `~/.gx/logs/gx.log`.

mod commands;
mod present;

use std::{
    fs::{self, OpenOptions},
    path::PathBuf,
    process::ExitCode,
    sync::Mutex,
};

use clap::{Parser, Subcommand};
use gx_types::{ImageFormat, ImageFormatError};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

#[derive(Parser, Debug)]
#[command(name = "gx", version, about = "Run and manage the pygerber Gerber language server")]
pub(crate) struct Cli {
    /// Workspace folder. Defaults to the current directory.
    #[arg(long, global = true)]
    pub workspace: Option<PathBuf>,
    /// Config file. Defaults to $GX_CONFIG, else ~/.gx/config.toml.
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub(crate) enum Command {
    /// List Python environments with their pygerber and language server status.
    Envs,
    /// Make an environment active, by index or id from `gx envs`.
    Activate { target: String },
    /// List installable pygerber versions.
    Versions {
        #[arg(long)]
        env: Option<String>,
    },
    /// Install pygerber with the language server extra.
    Install {
        /// Target environment. Defaults to the active one.
        #[arg(long)]
        env: Option<String>,
        /// pygerber version. Defaults to the newest available.
        #[arg(long)]
        version: Option<String>,
    },
    /// Start the language server and supervise it until Ctrl-C.
    Serve,
    /// Render a Gerber file to an image.
    Render {
        file: PathBuf,
        /// Defaults to the input path with the image extension.
        #[arg(long)]
        output: Option<PathBuf>,
        #[arg(long)]
        style: Option<String>,
        #[arg(long)]
        dpi: Option<u32>,
        #[arg(long, value_parser = parse_image_format)]
        format: Option<ImageFormat>,
        #[arg(long)]
        env: Option<String>,
    },
    /// Stop showing a warning.
    IgnoreWarning { id: String },
}

fn parse_image_format(raw: &str) -> Result<ImageFormat, ImageFormatError> {
    ImageFormat::parse(raw)
}

fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let (log_file, init_warnings) = open_log_file();

    if let Some((log_path, file)) = log_file {
        tracing_subscriber::registry()
            .with(fmt::layer().with_ansi(false).with_writer(Mutex::new(file)))
            .with(env_filter)
            .init();

        tracing::info!(path = %log_path.display(), "Logging initialized");
        for warning in init_warnings {
            tracing::warn!("{warning}");
        }
        return;
    }

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(env_filter)
        .init();
    for warning in init_warnings {
        tracing::warn!("{warning}");
    }
}

fn open_log_file() -> (Option<(PathBuf, fs::File)>, Vec<String>) {
    let mut warnings = Vec::new();

    for candidate in log_file_candidates() {
        if let Some(parent) = candidate.parent()
            && let Err(e) = fs::create_dir_all(parent)
        {
            warnings.push(format!(
                "Failed to create log dir {}: {e}",
                parent.display()
            ));
            continue;
        }

        match OpenOptions::new()
            .create(true)
            .append(true)
            .open(&candidate)
        {
            Ok(file) => return (Some((candidate, file)), warnings),
            Err(e) => {
                warnings.push(format!(
                    "Failed to open log file {}: {e}",
                    candidate.display()
                ));
            }
        }
    }

    (None, warnings)
}

fn log_file_candidates() -> Vec<PathBuf> {
    let mut candidates = Vec::new();

    // Primary: ~/.gx/logs/gx.log
    if let Some(dir) = gx_config::gx_dir() {
        candidates.push(dir.join("logs").join("gx.log"));
    }

    // Fallback: ./.gx/logs/gx.log
    candidates.push(PathBuf::from(".gx").join("logs").join("gx.log"));

    candidates
}

#[tokio::main]
async fn main() -> ExitCode {
    init_tracing();
    let cli = Cli::parse();

    match commands::run(cli).await {
        Ok(code) => code,
        Err(err) => {
            tracing::error!("{err:#}");
            eprintln!("gx: {err:#}");
            ExitCode::FAILURE
        }
    }
}
