//! Operations on the companion package: version index, install, render, and
//! the language server module to launch.

use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use gx_config::UserSettings;
use gx_types::{ImageFormat, Version, from_semver, to_semver};
use thiserror::Error;

use crate::environment::{COMPANION_PACKAGE, Environment};
use crate::runner::{CommandRunner, RunError};

pub const INSTALL_TIMEOUT: Duration = Duration::from_secs(10 * 60);

/// Releases at or below this predate the language server.
pub const OLDEST_LISTED: Version = Version::new(2, 2, 1);

const AVAILABLE_VERSIONS_PREFIX: &str = "Available versions: ";

/// Companion releases from 3.0.0a0 on moved the language server and the
/// raster CLI. An unparseable version is assumed to be a recent one.
fn is_v3(env: &Environment) -> bool {
    let v3 = Version::new(3, 0, 0).with_pre("alpha0");
    env.companion_version().is_none_or(|v| v >= v3)
}

/// `-m` target for the language server in `env`.
#[must_use]
pub fn language_server_module(env: &Environment) -> &'static str {
    if is_v3(env) {
        "pygerber.gerber.language_server"
    } else {
        "pygerber.gerberx3.language_server"
    }
}

// ============================================================================
// Version index
// ============================================================================

/// Parse `pip index versions` output into pip-spelled versions newer than
/// [`OLDEST_LISTED`], newest first.
#[must_use]
pub fn parse_available_versions(stdout: &str) -> Vec<String> {
    let Some(line) = stdout
        .lines()
        .find(|line| line.starts_with("Available versions"))
    else {
        return Vec::new();
    };

    let mut versions: Vec<Version> = line
        .trim_start_matches(AVAILABLE_VERSIONS_PREFIX)
        .split(", ")
        .filter_map(|raw| to_semver(raw).ok())
        .filter(|v| *v > OLDEST_LISTED)
        .collect();
    versions.sort_by(|a, b| b.cmp(a));
    versions.dedup();
    versions.iter().map(from_semver).collect()
}

/// Versions of the companion package installable into `env`. Any failure
/// yields an empty list.
pub async fn query_versions(runner: &dyn CommandRunner, env: &Environment) -> Vec<String> {
    let invocation = env
        .command()
        .args(["-m", "pip", "index", "--pre", "versions", COMPANION_PACKAGE]);
    match runner.run(&invocation).await {
        Ok(output) if output.is_success() => parse_available_versions(&output.stdout),
        Ok(output) => {
            tracing::warn!(exit_code = ?output.exit_code, "Version index query failed");
            Vec::new()
        }
        Err(err) => {
            tracing::warn!("Version index query failed: {err}");
            Vec::new()
        }
    }
}

// ============================================================================
// Install
// ============================================================================

#[derive(Debug, Error)]
pub enum InstallError {
    #[error(transparent)]
    Spawn(#[from] RunError),
    #[error("failed to create install directory {}: {source}", path.display())]
    Prepare {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("pip install failed (exit code {exit_code:?}, timed out: {timed_out})")]
    Failed {
        exit_code: Option<i32>,
        timed_out: bool,
    },
}

/// Install `pygerber[language-server]==version` into `env`, or into the
/// private install directory in extension search mode. Not retried.
pub async fn install(
    runner: &dyn CommandRunner,
    env: &Environment,
    version: &str,
    settings: &UserSettings,
) -> Result<(), InstallError> {
    let mut invocation = env
        .command()
        .args([
            "-m",
            "pip",
            "install",
            "--no-cache-dir",
            "--force-reinstall",
            "--compile",
            "--no-warn-script-location",
            "--disable-pip-version-check",
            "--trusted-host",
            "pypi.org",
            "--trusted-host",
            "pypi.python.org",
            "--trusted-host",
            "files.pythonhosted.org",
            "-vvv",
        ])
        .timeout(INSTALL_TIMEOUT);

    if let Some(target) = settings.python_path() {
        std::fs::create_dir_all(target).map_err(|source| InstallError::Prepare {
            path: target.to_path_buf(),
            source,
        })?;
        invocation = invocation.arg("--target").arg(target);
    }
    invocation = invocation.arg(format!("{COMPANION_PACKAGE}[language-server]=={version}"));

    tracing::info!(env = %env.id(), version, "Installing {COMPANION_PACKAGE}");
    let output = runner.run(&invocation).await?;
    if !output.is_success() {
        tracing::error!(
            env = %env.id(),
            exit_code = ?output.exit_code,
            stderr = %output.stderr,
            "Install failed"
        );
        return Err(InstallError::Failed {
            exit_code: output.exit_code,
            timed_out: output.timed_out,
        });
    }
    tracing::info!(env = %env.id(), version, "Install complete");
    Ok(())
}

// ============================================================================
// Render
// ============================================================================

#[derive(Debug, Error)]
pub enum RenderError {
    #[error("{COMPANION_PACKAGE} is not installed in {0}")]
    NotInstalled(String),
    #[error(transparent)]
    Spawn(#[from] RunError),
    #[error("render I/O error at {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("render failed (exit code {exit_code:?}): {stderr}")]
    Failed {
        exit_code: Option<i32>,
        stderr: String,
    },
}

/// Input path with its extension replaced by the image format's.
#[must_use]
pub fn default_output_path(input: &Path, format: ImageFormat) -> PathBuf {
    let mut name = input
        .file_stem()
        .map(|stem| stem.to_os_string())
        .unwrap_or_default();
    name.push(format.extension());
    input.with_file_name(name)
}

/// Rasterize `input` into `output` through the companion CLI.
///
/// The image is written to a temp file beside `output` and moved over it only
/// on success, so a failed render leaves the previous image alone.
pub async fn render(
    runner: &dyn CommandRunner,
    env: &Environment,
    input: &Path,
    output: &Path,
    settings: &UserSettings,
) -> Result<PathBuf, RenderError> {
    if !env.has_companion() {
        return Err(RenderError::NotInstalled(env.id().to_string()));
    }

    let io_err = |path: &Path| {
        let path = path.to_path_buf();
        move |source: io::Error| RenderError::Io { path, source }
    };

    let parent = match output.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    std::fs::create_dir_all(parent).map_err(io_err(parent))?;
    let tmp = tempfile::Builder::new()
        .prefix(".gx-render-")
        .suffix(settings.image_format.extension())
        .tempfile_in(parent)
        .map_err(io_err(parent))?;

    let subcommand: &[&str] = if is_v3(env) {
        &["gerber", "raster"]
    } else {
        &["raster-2d"]
    };
    let invocation = env
        .command()
        .args(["-m", COMPANION_PACKAGE])
        .args(subcommand.iter().copied())
        .arg(input)
        .arg("--style")
        .arg(&settings.layer_style)
        .arg("--dpi")
        .arg(settings.render_dpi.to_string())
        .arg("--output")
        .arg(tmp.path());

    tracing::info!(input = %input.display(), output = %output.display(), "Rendering");
    let result = runner.run(&invocation).await?;
    if !result.is_success() {
        return Err(RenderError::Failed {
            exit_code: result.exit_code,
            stderr: result.stderr.trim().to_string(),
        });
    }

    gx_utils::persist_over(tmp, output).map_err(io_err(output))?;
    tracing::info!(output = %output.display(), "Render complete");
    Ok(output.to_path_buf())
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::sync::Arc;

    use gx_types::PackageInfo;

    use super::*;
    use crate::catalog::tests::ScriptedRunner;
    use crate::runner::{CommandOutput, Invocation, RunFut};

    fn env_with_pygerber(version: &str) -> Environment {
        Environment::new(
            "/venv/bin/python",
            "/venv",
            "/venv/bin/python",
            Version::new(3, 12, 0),
            vec![PackageInfo::new("pygerber", version)],
        )
    }

    #[test]
    fn module_depends_on_companion_version() {
        assert_eq!(
            language_server_module(&env_with_pygerber("2.4.1")),
            "pygerber.gerberx3.language_server"
        );
        assert_eq!(
            language_server_module(&env_with_pygerber("3.0.0a0")),
            "pygerber.gerber.language_server"
        );
        assert_eq!(
            language_server_module(&env_with_pygerber("3.0.1")),
            "pygerber.gerber.language_server"
        );
    }

    #[test]
    fn available_versions_are_filtered_and_sorted() {
        let stdout = "pygerber (3.0.0a3)\n\
                      Available versions: 2.1.0rc1, 3.0.0a3, 2.4.1, 2.2.1, 2.3.0, 1.0.0, garbage\n  \
                      INSTALLED: 2.4.1\n";
        assert_eq!(
            parse_available_versions(stdout),
            vec!["3.0.0a3", "2.4.1", "2.3.0"]
        );
        assert!(parse_available_versions("ERROR: No matching distribution").is_empty());
    }

    #[tokio::test]
    async fn query_versions_is_empty_on_failure() {
        let runner = ScriptedRunner::default();
        runner.respond("pip index", 1, "Available versions: 3.0.0");
        assert!(query_versions(&runner, &env_with_pygerber("2.4.1")).await.is_empty());
    }

    #[tokio::test]
    async fn install_uses_target_in_extension_mode() {
        let dir = tempfile::tempdir().unwrap();
        let runner = ScriptedRunner::default();
        runner.respond("pip install", 0, "");
        let mut settings = UserSettings::defaults(dir.path());
        settings.install_directory = dir.path().join("pg");

        install(&runner, &env_with_pygerber("2.4.1"), "3.0.0a3", &settings)
            .await
            .unwrap();

        let seen = runner.seen.lock().unwrap();
        let line = seen[0].command_line();
        assert!(line.contains("--force-reinstall"));
        assert!(line.contains(&format!("--target {}", dir.path().join("pg").display())));
        assert!(line.ends_with("pygerber[language-server]==3.0.0a3"));
        assert_eq!(seen[0].timeout, Some(INSTALL_TIMEOUT));
        assert!(dir.path().join("pg").is_dir());
    }

    #[tokio::test]
    async fn install_reports_exit_code() {
        let dir = tempfile::tempdir().unwrap();
        let runner = ScriptedRunner::default();
        runner.respond("pip install", 2, "");
        let mut settings = UserSettings::defaults(dir.path());
        settings.search_mode = gx_types::SearchMode::Environment;

        let err = install(&runner, &env_with_pygerber("2.4.1"), "2.4.1", &settings)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            InstallError::Failed {
                exit_code: Some(2),
                timed_out: false
            }
        ));
        assert!(!runner.seen.lock().unwrap()[0].command_line().contains("--target"));
    }

    #[test]
    fn default_output_replaces_extension() {
        assert_eq!(
            default_output_path(Path::new("/boards/top.gtl"), ImageFormat::Png),
            PathBuf::from("/boards/top.png")
        );
        assert_eq!(
            default_output_path(Path::new("board.v2.gbr"), ImageFormat::Jpeg),
            PathBuf::from("board.v2.jpg")
        );
    }

    /// Writes a fixed payload to the `--output` argument, like the real CLI.
    struct WritingRunner {
        payload: &'static [u8],
        exit_code: i32,
    }

    impl CommandRunner for WritingRunner {
        fn run<'a>(&'a self, invocation: &'a Invocation) -> RunFut<'a> {
            Box::pin(async move {
                let position = invocation
                    .args
                    .iter()
                    .position(|arg| arg == "--output")
                    .unwrap();
                fs::write(&invocation.args[position + 1], self.payload).unwrap();
                Ok(CommandOutput {
                    exit_code: Some(self.exit_code),
                    stderr: if self.exit_code == 0 { String::new() } else { "bad aperture".to_string() },
                    ..CommandOutput::default()
                })
            })
        }
    }

    #[tokio::test]
    async fn render_persists_output_on_success() {
        let dir = tempfile::tempdir().unwrap();
        let output = dir.path().join("top.png");
        let runner = WritingRunner {
            payload: b"PNG",
            exit_code: 0,
        };
        let settings = UserSettings::defaults(dir.path());

        let written = render(
            &runner,
            &env_with_pygerber("3.0.0a3"),
            Path::new("top.gtl"),
            &output,
            &settings,
        )
        .await
        .unwrap();

        assert_eq!(written, output);
        assert_eq!(fs::read(&output).unwrap(), b"PNG");
        // Only the final image remains.
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 1);
    }

    #[tokio::test]
    async fn failed_render_keeps_previous_output() {
        let dir = tempfile::tempdir().unwrap();
        let output = dir.path().join("top.png");
        fs::write(&output, b"OLD").unwrap();
        let runner = WritingRunner {
            payload: b"PARTIAL",
            exit_code: 1,
        };
        let settings = UserSettings::defaults(dir.path());

        let err = render(
            &runner,
            &env_with_pygerber("2.4.1"),
            Path::new("top.gtl"),
            &output,
            &settings,
        )
        .await
        .unwrap_err();

        assert!(matches!(err, RenderError::Failed { exit_code: Some(1), ref stderr } if stderr == "bad aperture"));
        assert_eq!(fs::read(&output).unwrap(), b"OLD");
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 1);
    }

    #[tokio::test]
    async fn render_command_depends_on_companion_version() {
        let dir = tempfile::tempdir().unwrap();
        let settings = UserSettings::defaults(dir.path());
        let runner = Arc::new(ScriptedRunner::default());
        runner.respond("pygerber", 0, "");

        for version in ["2.4.1", "3.0.0a3"] {
            let _ = render(
                runner.as_ref(),
                &env_with_pygerber(version),
                Path::new("top.gtl"),
                &dir.path().join("top.png"),
                &settings,
            )
            .await;
        }

        let seen = runner.seen.lock().unwrap();
        assert!(seen[0].command_line().contains("-m pygerber raster-2d top.gtl --style copper_alpha --dpi 1000 --output"));
        assert!(seen[1].command_line().contains("-m pygerber gerber raster top.gtl"));
    }

    #[tokio::test]
    async fn render_requires_companion() {
        let dir = tempfile::tempdir().unwrap();
        let env = Environment::new("e", "/e", "/e/bin/python", Version::new(3, 12, 0), vec![]);
        let err = render(
            &ScriptedRunner::default(),
            &env,
            Path::new("top.gtl"),
            &dir.path().join("top.png"),
            &UserSettings::defaults(dir.path()),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, RenderError::NotInstalled(_)));
    }
}
