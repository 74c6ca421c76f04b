//! The environment catalog: discovered candidates resolved into descriptors.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::join_all;
use gx_config::UserSettings;
use gx_types::{PackageInfo, Version, VersionParseError, to_semver};
use thiserror::Error;
use tokio::sync::watch;

use crate::discovery::{Candidate, Discovery, DiscoveryError, prefix_of, same_interpreter};
use crate::environment::{Environment, EnvironmentOrigin};
use crate::runner::{CommandRunner, Invocation, RunError};

const PROBE_TIMEOUT: Duration = Duration::from_secs(60);
const VERSION_PROBE: &str = "import platform;print(platform.python_version())";

#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("Python environment discovery is unavailable on this host")]
    DiscoveryUnavailable,
    #[error("failed to activate environment: {0}")]
    Activate(#[source] DiscoveryError),
}

/// Why a candidate was left out of the catalog. Only ever logged.
#[derive(Debug, Error)]
enum ResolveError {
    #[error("no executable reported")]
    NoExecutable,
    #[error("executable {} does not exist", .0.display())]
    Missing(PathBuf),
    #[error(transparent)]
    Spawn(#[from] RunError),
    #[error("{probe} probe exited with {exit_code:?}")]
    ProbeFailed {
        probe: &'static str,
        exit_code: Option<i32>,
    },
    #[error("unparseable version: {0}")]
    Version(#[from] VersionParseError),
    #[error("unparseable package list: {0}")]
    Packages(#[from] serde_json::Error),
}

/// One published catalog state.
#[derive(Debug, Default)]
pub struct CatalogSnapshot {
    environments: Vec<Arc<Environment>>,
    discovery_unavailable: bool,
}

impl CatalogSnapshot {
    /// Active environment first, then discovery order.
    #[must_use]
    pub fn environments(&self) -> &[Arc<Environment>] {
        &self.environments
    }

    #[must_use]
    pub fn active(&self) -> Option<&Arc<Environment>> {
        self.environments.iter().find(|env| env.is_active())
    }

    #[must_use]
    pub fn discovery_unavailable(&self) -> bool {
        self.discovery_unavailable
    }
}

pub struct EnvironmentCatalog {
    discovery: Arc<dyn Discovery>,
    runner: Arc<dyn CommandRunner>,
    snapshot: watch::Sender<Arc<CatalogSnapshot>>,
}

impl EnvironmentCatalog {
    #[must_use]
    pub fn new(discovery: Arc<dyn Discovery>, runner: Arc<dyn CommandRunner>) -> Self {
        let (snapshot, _) = watch::channel(Arc::new(CatalogSnapshot::default()));
        Self {
            discovery,
            runner,
            snapshot,
        }
    }

    #[must_use]
    pub fn discovery(&self) -> &Arc<dyn Discovery> {
        &self.discovery
    }

    /// Re-query discovery and resolve every candidate.
    ///
    /// Candidates that fail to resolve are dropped. Returns the number of
    /// environments published. Callers must not run two refreshes at once.
    pub async fn refresh(&self, settings: &UserSettings) -> Result<usize, CatalogError> {
        let candidates = match self.discovery.known().await {
            Ok(candidates) => candidates,
            Err(err) => {
                tracing::warn!("Environment discovery failed: {err}");
                self.snapshot.send_replace(Arc::new(CatalogSnapshot {
                    environments: Vec::new(),
                    discovery_unavailable: true,
                }));
                return Err(CatalogError::DiscoveryUnavailable);
            }
        };
        let active_path = self.discovery.active_path().await.unwrap_or_else(|err| {
            tracing::warn!("Failed to query the active interpreter: {err}");
            None
        });

        let python_path = settings.python_path().map(Path::to_path_buf);
        let resolved = join_all(
            candidates
                .iter()
                .map(|candidate| self.resolve(candidate, python_path.clone())),
        )
        .await;

        let mut environments: Vec<Arc<Environment>> = Vec::with_capacity(resolved.len());
        for (candidate, result) in candidates.iter().zip(resolved) {
            match result {
                Ok(env) => {
                    if environments.iter().any(|e| e.id() == env.id()) {
                        tracing::debug!(id = %env.id(), "Duplicate environment id dropped");
                        continue;
                    }
                    let is_active = active_path
                        .as_deref()
                        .is_some_and(|active| same_interpreter(env.executable(), active));
                    tracing::info!(id = %env.id(), version = %env.version(), "Known environment");
                    environments.push(Arc::new(env.active(is_active)));
                }
                Err(err) => {
                    tracing::debug!(candidate = %candidate.id, "Environment dropped: {err}");
                }
            }
        }

        // Stable: active first, the rest keep discovery order.
        environments.sort_by_key(|env| !env.is_active());

        let count = environments.len();
        self.snapshot.send_replace(Arc::new(CatalogSnapshot {
            environments,
            discovery_unavailable: false,
        }));
        tracing::info!(count, "Environment catalog refreshed");
        Ok(count)
    }

    #[must_use]
    pub fn snapshot(&self) -> Arc<CatalogSnapshot> {
        self.snapshot.borrow().clone()
    }

    #[must_use]
    pub fn environments(&self) -> Vec<Arc<Environment>> {
        self.snapshot().environments().to_vec()
    }

    #[must_use]
    pub fn active_environment(&self) -> Option<Arc<Environment>> {
        self.snapshot().active().cloned()
    }

    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<Arc<CatalogSnapshot>> {
        self.snapshot.subscribe()
    }

    /// Ask discovery to make `env` active. The catalog itself is not updated;
    /// the resulting change notification should trigger a refresh.
    pub async fn activate(&self, env: &Environment) -> Result<(), CatalogError> {
        self.discovery
            .set_active_path(env.executable())
            .await
            .map_err(CatalogError::Activate)
    }

    /// Resolve a user-supplied interpreter outside the catalog.
    pub async fn resolve_custom(
        &self,
        executable: &Path,
        settings: &UserSettings,
    ) -> Option<Arc<Environment>> {
        let candidate = Candidate {
            id: executable.display().to_string(),
            path: prefix_of(executable),
            executable: Some(executable.to_path_buf()),
        };
        match self
            .resolve(&candidate, settings.python_path().map(Path::to_path_buf))
            .await
        {
            Ok(env) => Some(Arc::new(env.with_origin(EnvironmentOrigin::CustomPath))),
            Err(err) => {
                tracing::warn!(
                    path = %executable.display(),
                    "Custom interpreter could not be resolved: {err}"
                );
                None
            }
        }
    }

    async fn resolve(
        &self,
        candidate: &Candidate,
        python_path: Option<PathBuf>,
    ) -> Result<Environment, ResolveError> {
        let exe = candidate
            .executable
            .as_deref()
            .ok_or(ResolveError::NoExecutable)?;
        let is_file = tokio::fs::metadata(exe)
            .await
            .map(|meta| meta.is_file())
            .unwrap_or(false);
        if !is_file {
            return Err(ResolveError::Missing(exe.to_path_buf()));
        }

        let command = || Invocation::new(exe).python_path(python_path.as_deref());
        let version = self.probe_version(command()).await?;
        let packages = self.probe_packages(command()).await?;

        Ok(Environment::new(
            candidate.id.clone(),
            candidate.path.clone(),
            exe,
            version,
            packages,
        )
        .with_python_path(python_path))
    }

    async fn probe_version(&self, command: Invocation) -> Result<Version, ResolveError> {
        let invocation = command.args(["-Sc", VERSION_PROBE]).timeout(PROBE_TIMEOUT);
        let output = self.runner.run(&invocation).await?;
        if !output.is_success() {
            return Err(ResolveError::ProbeFailed {
                probe: "version",
                exit_code: output.exit_code,
            });
        }
        Ok(to_semver(&output.stdout)?)
    }

    async fn probe_packages(&self, command: Invocation) -> Result<Vec<PackageInfo>, ResolveError> {
        let invocation = command
            .args(["-m", "pip", "list", "--format=json"])
            .timeout(PROBE_TIMEOUT);
        let output = self.runner.run(&invocation).await?;
        if !output.is_success() {
            return Err(ResolveError::ProbeFailed {
                probe: "package list",
                exit_code: output.exit_code,
            });
        }
        Ok(serde_json::from_str(output.stdout.trim())?)
    }
}
