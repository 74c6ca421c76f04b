//! Command handlers. Each builds a [`Session`], does its work and returns the
//! process exit code.

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result, anyhow, bail};
use gx_config::{FileSettings, SettingsSource, UserSettings};
use gx_lsp::{LifecycleController, StdioClientFactory};
use gx_python::{
    CommandRunner, Discovery, Environment, EnvironmentCatalog, HostDiscovery, ProcessRunner, Prober,
    default_output_path, install, query_versions, render,
};
use gx_types::{ImageFormat, RestartResult, Warning};
use tokio::sync::broadcast;

use crate::present;
use crate::{Cli, Command};

/// Events drained right after the first start, before supervision begins.
const STARTUP_EVENT_BUDGET: usize = 32;

pub(crate) async fn run(cli: Cli) -> Result<ExitCode> {
    let session = Session::open(cli.workspace, cli.config)?;

    match cli.command {
        Command::Envs => session.envs().await,
        Command::Activate { target } => session.activate(&target).await,
        Command::Versions { env } => session.versions(env.as_deref()).await,
        Command::Install { env, version } => {
            session.install(env.as_deref(), version.as_deref()).await
        }
        Command::Serve => session.serve().await,
        Command::Render {
            file,
            output,
            style,
            dpi,
            format,
            env,
        } => {
            let overrides = RenderOverrides {
                output,
                style,
                dpi,
                format,
            };
            session.render(&file, overrides, env.as_deref()).await
        }
        Command::IgnoreWarning { id } => session.ignore_warning(&id),
    }
}

struct RenderOverrides {
    output: Option<PathBuf>,
    style: Option<String>,
    dpi: Option<u32>,
    format: Option<ImageFormat>,
}

struct Session {
    settings: FileSettings,
    discovery: Arc<HostDiscovery>,
    runner: Arc<dyn CommandRunner>,
    catalog: Arc<EnvironmentCatalog>,
}

impl Session {
    fn open(workspace: Option<PathBuf>, config: Option<PathBuf>) -> Result<Self> {
        let root = match workspace {
            Some(root) => root,
            None => std::env::current_dir().context("Failed to read the current directory")?,
        };
        let settings = match config {
            Some(path) => FileSettings::new(Some(path), root),
            None => FileSettings::discover(root),
        };
        tracing::debug!(
            workspace = %settings.workspace_root().display(),
            config = ?settings.path(),
            "Session opened"
        );

        let discovery = Arc::new(HostDiscovery::from_env(settings.clone()));
        let runner: Arc<dyn CommandRunner> = Arc::new(ProcessRunner);
        let catalog = Arc::new(EnvironmentCatalog::new(discovery.clone(), runner.clone()));
        Ok(Self {
            settings,
            discovery,
            runner,
            catalog,
        })
    }

    /// Refresh the catalog, printing the discovery warning when it applies.
    async fn refresh_catalog(&self, settings: &UserSettings) -> Vec<Arc<Environment>> {
        if self.catalog.refresh(settings).await.is_err()
            && let Some(notice) = present::warning_notice(settings, Warning::DiscoveryUnavailable)
        {
            eprintln!("{notice}");
        }
        self.catalog.environments()
    }

    /// `selector` if given, else the active environment, else the first.
    fn pick(
        environments: &[Arc<Environment>],
        selector: Option<&str>,
    ) -> Result<Arc<Environment>> {
        match selector {
            Some(selector) => present::find_environment(environments, selector)
                .cloned()
                .ok_or_else(|| anyhow!("No environment matches '{selector}'. See `gx envs`.")),
            None => environments
                .iter()
                .find(|env| env.is_active())
                .or_else(|| environments.first())
                .cloned()
                .ok_or_else(|| {
                    anyhow!(present::restart_message(RestartResult::AbortedNoPythonEnvironment)
                        .unwrap_or("No Python environment available."))
                }),
        }
    }

    // ========================================================================
    // envs / activate
    // ========================================================================

    async fn envs(&self) -> Result<ExitCode> {
        let settings = self.settings.snapshot();
        let environments = self.refresh_catalog(&settings).await;
        if environments.is_empty() {
            println!("No Python environments found.");
            return Ok(ExitCode::SUCCESS);
        }

        let prober = Prober::new(self.runner.clone());
        let mut rows = Vec::with_capacity(environments.len());
        for env in environments {
            let capability = prober.capability(&env).await;
            rows.push((env, capability));
        }
        print!("{}", present::environment_tree(&rows));

        if let Some(hint) = present::missing_server_hint(&rows) {
            eprintln!("{hint}");
        }
        if !rows.iter().any(|(_, capability)| capability.has_server())
            && let Some(notice) = present::warning_notice(&settings, Warning::NoQualifyingEnvironment)
        {
            eprintln!("{notice}");
        }
        Ok(ExitCode::SUCCESS)
    }

    async fn activate(&self, target: &str) -> Result<ExitCode> {
        let settings = self.settings.snapshot();
        let environments = self.refresh_catalog(&settings).await;
        let env = Self::pick(&environments, Some(target))?;
        self.catalog.activate(&env).await?;
        println!(
            "Activated Python {} at {}",
            env.version(),
            env.executable().display()
        );
        Ok(ExitCode::SUCCESS)
    }

    // ========================================================================
    // versions / install
    // ========================================================================

    async fn versions(&self, selector: Option<&str>) -> Result<ExitCode> {
        let settings = self.settings.snapshot();
        let environments = self.refresh_catalog(&settings).await;
        let env = Self::pick(&environments, selector)?;

        let versions = query_versions(self.runner.as_ref(), &env).await;
        if versions.is_empty() {
            eprintln!("No installable versions found.");
            return Ok(ExitCode::FAILURE);
        }
        for version in versions {
            println!("{version}");
        }
        Ok(ExitCode::SUCCESS)
    }

    async fn install(&self, selector: Option<&str>, version: Option<&str>) -> Result<ExitCode> {
        let settings = self.settings.snapshot();
        let environments = self.refresh_catalog(&settings).await;
        let env = Self::pick(&environments, selector)?;

        let version = match version {
            Some(version) => version.to_string(),
            None => query_versions(self.runner.as_ref(), &env)
                .await
                .into_iter()
                .next()
                .context("No installable versions found")?,
        };

        println!("Installing PyGerber {version} into {}", env.executable().display());
        let outcome = install(self.runner.as_ref(), &env, &version, &settings).await;
        // The companion's presence changed either way.
        self.refresh_catalog(&settings).await;

        match outcome {
            Ok(()) => {
                println!("Successfully installed PyGerber {version}.");
                Ok(ExitCode::SUCCESS)
            }
            Err(err) => {
                eprintln!("PyGerber installation failed: {err}");
                Ok(ExitCode::FAILURE)
            }
        }
    }

    // ========================================================================
    // render
    // ========================================================================

    async fn render(
        &self,
        input: &Path,
        overrides: RenderOverrides,
        selector: Option<&str>,
    ) -> Result<ExitCode> {
        let mut settings = self.settings.snapshot();
        if let Some(style) = overrides.style {
            settings.layer_style = style;
        }
        if let Some(dpi) = overrides.dpi {
            settings.render_dpi = dpi;
        }
        if let Some(format) = overrides.format {
            settings.image_format = format;
        }

        let env = self.render_environment(&settings, selector).await?;
        let output = overrides
            .output
            .unwrap_or_else(|| default_output_path(input, settings.image_format));

        match render(self.runner.as_ref(), &env, input, &output, &settings).await {
            Ok(written) => {
                println!(
                    "Successfully rendered file \"{}\", see result in \"{}\".",
                    input.display(),
                    written.display()
                );
                Ok(ExitCode::SUCCESS)
            }
            Err(err) => {
                tracing::error!(input = %input.display(), "Render failed: {err}");
                eprintln!("Failed to render file \"{}\": {err}", input.display());
                Ok(ExitCode::FAILURE)
            }
        }
    }

    /// Explicit selector, else the custom interpreter, else the first
    /// environment (active first) that has the companion package.
    async fn render_environment(
        &self,
        settings: &UserSettings,
        selector: Option<&str>,
    ) -> Result<Arc<Environment>> {
        if selector.is_none()
            && let Some(path) = &settings.custom_interpreter_path
        {
            return self
                .catalog
                .resolve_custom(path, settings)
                .await
                .with_context(|| format!("Custom interpreter {} is unusable", path.display()));
        }

        let environments = self.refresh_catalog(settings).await;
        if selector.is_some() {
            return Self::pick(&environments, selector);
        }
        environments
            .iter()
            .find(|env| env.has_companion())
            .cloned()
            .ok_or_else(|| {
                anyhow!(
                    present::restart_message(RestartResult::AbortedNoPyGerber)
                        .unwrap_or("PyGerber is not installed.")
                )
            })
    }

    // ========================================================================
    // ignore-warning
    // ========================================================================

    fn ignore_warning(&self, id: &str) -> Result<ExitCode> {
        let Some(warning) = Warning::from_id(id) else {
            let known: Vec<&str> = Warning::ALL.iter().map(|w| w.id()).collect();
            bail!("Unknown warning '{id}'. Known warnings: {}", known.join(", "));
        };
        let added = self
            .settings
            .ignore_warning(warning)
            .context("Failed to update the config file")?;
        if added {
            println!("Warning '{id}' will no longer be shown.");
        } else {
            println!("Warning '{id}' is already dismissed.");
        }
        Ok(ExitCode::SUCCESS)
    }

    // ========================================================================
    // serve
    // ========================================================================

    async fn serve(&self) -> Result<ExitCode> {
        let settings = self.settings.snapshot();
        let mut changes = self.discovery.subscribe();
        self.refresh_catalog(&settings).await;

        let controller = LifecycleController::new(
            self.catalog.clone(),
            Prober::new(self.runner.clone()),
            Arc::new(self.settings.clone()),
            Arc::new(StdioClientFactory),
        );

        let first = controller.refresh().await;
        self.report(first);
        let mut status = present::exit_status(first);
        for event in controller.poll_events(STARTUP_EVENT_BUDGET) {
            let (line, ends) = present::event_notice(&event);
            eprintln!("{line}");
            if ends {
                status = 1;
            }
        }
        if status != 0 {
            controller.dispose().await;
            return Ok(ExitCode::from(status));
        }

        #[cfg(unix)]
        let hangup = spawn_rescan_on_hangup(self.discovery.clone());

        let ctrl_c = tokio::signal::ctrl_c();
        tokio::pin!(ctrl_c);
        let mut exit = ExitCode::SUCCESS;

        loop {
            tokio::select! {
                signal = &mut ctrl_c => {
                    if let Err(err) = signal {
                        tracing::warn!("Failed to listen for Ctrl-C: {err}");
                    }
                    tracing::info!("Interrupted, shutting down");
                    break;
                }
                change = changes.recv() => {
                    match change {
                        Ok(change) => tracing::info!(?change, "Discovery changed"),
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            tracing::debug!(skipped, "Discovery changes coalesced");
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    }
                    let settings = self.settings.snapshot();
                    self.refresh_catalog(&settings).await;
                    let result = controller.refresh().await;
                    self.report(result);
                }
                event = controller.next_event() => {
                    let Some(event) = event else { break };
                    let (line, ends) = present::event_notice(&event);
                    eprintln!("{line}");
                    if ends {
                        exit = ExitCode::FAILURE;
                        break;
                    }
                }
            }
        }

        #[cfg(unix)]
        if let Some(task) = hangup {
            task.abort();
        }
        controller.dispose().await;
        Ok(exit)
    }

    fn report(&self, result: RestartResult) {
        tracing::info!(?result, "Language server refresh finished");
        if let Some(message) = present::restart_message(result) {
            eprintln!("{message}");
        }
        if present::offers_install(result)
            && let Some(notice) = present::warning_notice(
                &self.settings.snapshot(),
                Warning::NoQualifyingEnvironment,
            )
        {
            eprintln!("{notice}");
        }
    }
}

/// SIGHUP asks discovery for a rescan, which `serve` picks up as a change.
#[cfg(unix)]
fn spawn_rescan_on_hangup(discovery: Arc<HostDiscovery>) -> Option<tokio::task::JoinHandle<()>> {
    use tokio::signal::unix::{SignalKind, signal};

    let mut hangups = match signal(SignalKind::hangup()) {
        Ok(hangups) => hangups,
        Err(err) => {
            tracing::warn!("Failed to listen for SIGHUP: {err}");
            return None;
        }
    };
    Some(tokio::spawn(async move {
        while hangups.recv().await.is_some() {
            tracing::info!("SIGHUP received, rescanning environments");
            discovery.rescan();
        }
    }))
}
