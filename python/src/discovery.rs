//! Host environment discovery.
//!
//! [`Discovery`] is the seam between gx and whatever knows which Python
//! installations exist. [`HostDiscovery`] answers from the filesystem and
//! environment variables.

use std::env;
use std::ffi::OsString;
use std::fs;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;

use gx_config::{FileSettings, SettingsSource};
use thiserror::Error;
use tokio::sync::broadcast;

pub type DiscoveryFut<'a, T> = Pin<Box<dyn Future<Output = Result<T, DiscoveryError>> + Send + 'a>>;

#[derive(Debug, Error)]
pub enum DiscoveryError {
    /// No discovery integration on this host; no environment can ever be found.
    #[error("Python environment discovery is unavailable on this host")]
    Unavailable,
    #[error("failed to persist the active interpreter: {0}")]
    Persist(#[source] std::io::Error),
}

/// An environment as reported by discovery, before resolution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidate {
    pub id: String,
    /// Install prefix.
    pub path: PathBuf,
    pub executable: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiscoveryChange {
    EnvironmentsChanged,
    ActivePathChanged,
}

pub trait Discovery: Send + Sync {
    fn known(&self) -> DiscoveryFut<'_, Vec<Candidate>>;

    fn active_path(&self) -> DiscoveryFut<'_, Option<PathBuf>>;

    fn set_active_path<'a>(&'a self, path: &'a Path) -> DiscoveryFut<'a, ()>;

    fn subscribe(&self) -> broadcast::Receiver<DiscoveryChange>;
}

// ============================================================================
// Host scan
// ============================================================================

const CONDA_DISTRIBUTIONS: [&str; 3] = ["miniconda3", "anaconda3", "miniforge3"];
const WORKSPACE_ENV_DIRS: [&str; 3] = [".venv", "venv", "env"];

/// Locations [`HostDiscovery`] scans.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SearchRoots {
    pub virtual_env: Option<PathBuf>,
    pub conda_prefix: Option<PathBuf>,
    pub path_var: Option<OsString>,
    pub home: Option<PathBuf>,
    pub workspace_root: PathBuf,
}

impl SearchRoots {
    #[must_use]
    pub fn from_env(workspace_root: impl Into<PathBuf>) -> Self {
        let non_empty = |key: &str| env::var_os(key).filter(|v| !v.is_empty());
        Self {
            virtual_env: non_empty("VIRTUAL_ENV").map(PathBuf::from),
            conda_prefix: non_empty("CONDA_PREFIX").map(PathBuf::from),
            path_var: non_empty("PATH"),
            home: dirs::home_dir(),
            workspace_root: workspace_root.into(),
        }
    }
}

/// Interpreter inside an install prefix, if any.
#[must_use]
pub fn interpreter_in(prefix: &Path) -> Option<PathBuf> {
    let relative: &[&str] = if cfg!(windows) {
        &["Scripts/python.exe", "python.exe"]
    } else {
        &["bin/python3", "bin/python"]
    };
    relative
        .iter()
        .map(|rel| prefix.join(rel))
        .find(|candidate| candidate.is_file())
}

/// Install prefix of an interpreter: `<prefix>/bin/python3` -> `<prefix>`.
#[must_use]
pub fn prefix_of(executable: &Path) -> PathBuf {
    let Some(parent) = executable.parent() else {
        return executable.to_path_buf();
    };
    match parent.file_name().and_then(|n| n.to_str()) {
        Some("bin" | "Scripts") => parent.parent().unwrap_or(parent).to_path_buf(),
        _ => parent.to_path_buf(),
    }
}

/// Resolve directory symlinks but keep the final component.
///
/// A venv's `bin/python` links to the base interpreter; following that link
/// would merge the venv with its base.
pub(crate) fn normalize_path(path: &Path) -> PathBuf {
    match (path.parent(), path.file_name()) {
        (Some(parent), Some(name)) if !parent.as_os_str().is_empty() => fs::canonicalize(parent)
            .map(|dir| dir.join(name))
            .unwrap_or_else(|_| path.to_path_buf()),
        _ => path.to_path_buf(),
    }
}

pub(crate) fn same_interpreter(a: &Path, b: &Path) -> bool {
    a == b || normalize_path(a) == normalize_path(b)
}

fn candidate_for_prefix(prefix: &Path) -> Candidate {
    match interpreter_in(prefix) {
        Some(exe) => candidate_for_executable(exe),
        None => Candidate {
            id: prefix.display().to_string(),
            path: prefix.to_path_buf(),
            executable: None,
        },
    }
}

fn candidate_for_executable(exe: PathBuf) -> Candidate {
    Candidate {
        id: exe.display().to_string(),
        path: prefix_of(&exe),
        executable: Some(exe),
    }
}

fn child_dirs(dir: &Path) -> Vec<PathBuf> {
    let Ok(entries) = fs::read_dir(dir) else {
        return Vec::new();
    };
    let mut dirs: Vec<PathBuf> = entries
        .filter_map(Result::ok)
        .map(|entry| entry.path())
        .filter(|path| path.is_dir())
        .collect();
    dirs.sort();
    dirs
}

impl SearchRoots {
    fn path_interpreters(&self, name: &str) -> Vec<PathBuf> {
        let Some(path_var) = &self.path_var else {
            return Vec::new();
        };
        match which::which_in_all(name, Some(path_var), &self.workspace_root) {
            Ok(found) => found.collect(),
            Err(_) => Vec::new(),
        }
    }

    /// Candidates in priority order, collapsed by resolved executable and
    /// install prefix.
    #[must_use]
    pub fn scan(&self) -> Vec<Candidate> {
        let mut found = Vec::new();

        // Explicit prefixes are reported even when broken so resolution can
        // log why they were dropped.
        for prefix in [&self.virtual_env, &self.conda_prefix].into_iter().flatten() {
            found.push(candidate_for_prefix(prefix));
        }

        for dir in WORKSPACE_ENV_DIRS {
            let prefix = self.workspace_root.join(dir);
            if let Some(exe) = interpreter_in(&prefix) {
                found.push(candidate_for_executable(exe));
            }
        }

        for name in ["python3", "python"] {
            found.extend(
                self.path_interpreters(name)
                    .into_iter()
                    .map(candidate_for_executable),
            );
        }

        if let Some(home) = &self.home {
            let mut prefixes = child_dirs(&home.join(".pyenv").join("versions"));
            for distribution in CONDA_DISTRIBUTIONS {
                prefixes.extend(child_dirs(&home.join(distribution).join("envs")));
            }
            found.extend(
                prefixes
                    .iter()
                    .filter_map(|prefix| interpreter_in(prefix))
                    .map(candidate_for_executable),
            );
        }

        // The same interpreter can surface through a symlinked PATH entry
        // (`/bin -> /usr/bin`), which yields a different prefix.
        let mut seen_executables = Vec::new();
        let mut seen_prefixes = Vec::new();
        found.retain(|candidate| {
            let prefix = normalize_path(&candidate.path);
            let executable = candidate.executable.as_deref().map(normalize_path);
            if seen_prefixes.contains(&prefix)
                || executable
                    .as_ref()
                    .is_some_and(|exe| seen_executables.contains(exe))
            {
                return false;
            }
            seen_prefixes.push(prefix);
            seen_executables.extend(executable);
            true
        });
        found
    }

    fn default_active(&self) -> Option<PathBuf> {
        if let Some(exe) = self.virtual_env.as_deref().and_then(interpreter_in) {
            return Some(exe);
        }
        self.path_interpreters("python3").into_iter().next()
    }
}

/// Discovery from the local filesystem and environment variables.
///
/// The active interpreter is `[python].active` from the config file, else the
/// interpreter of `VIRTUAL_ENV`, else the first `python3` on `PATH`.
pub struct HostDiscovery {
    roots: SearchRoots,
    settings: FileSettings,
    changes: broadcast::Sender<DiscoveryChange>,
}

impl HostDiscovery {
    #[must_use]
    pub fn new(roots: SearchRoots, settings: FileSettings) -> Self {
        let (changes, _) = broadcast::channel(16);
        Self {
            roots,
            settings,
            changes,
        }
    }

    #[must_use]
    pub fn from_env(settings: FileSettings) -> Self {
        let roots = SearchRoots::from_env(settings.workspace_root());
        Self::new(roots, settings)
    }

    /// Tell subscribers the environment list may have changed.
    pub fn rescan(&self) {
        let _ = self.changes.send(DiscoveryChange::EnvironmentsChanged);
    }
}

impl Discovery for HostDiscovery {
    fn known(&self) -> DiscoveryFut<'_, Vec<Candidate>> {
        Box::pin(async move {
            let candidates = self.roots.scan();
            if candidates.is_empty() && self.roots.path_var.is_none() {
                return Err(DiscoveryError::Unavailable);
            }
            tracing::debug!(count = candidates.len(), "Host scan complete");
            Ok(candidates)
        })
    }

    fn active_path(&self) -> DiscoveryFut<'_, Option<PathBuf>> {
        Box::pin(async move {
            Ok(self
                .settings
                .snapshot()
                .active_interpreter
                .or_else(|| self.roots.default_active()))
        })
    }

    fn set_active_path<'a>(&'a self, path: &'a Path) -> DiscoveryFut<'a, ()> {
        Box::pin(async move {
            self.settings
                .set_active_interpreter(path)
                .map_err(DiscoveryError::Persist)?;
            tracing::info!(path = %path.display(), "Active interpreter changed");
            let _ = self.changes.send(DiscoveryChange::ActivePathChanged);
            Ok(())
        })
    }

    fn subscribe(&self) -> broadcast::Receiver<DiscoveryChange> {
        self.changes.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fake_interpreter(prefix: &Path) -> PathBuf {
        let bin = prefix.join(if cfg!(windows) { "Scripts" } else { "bin" });
        fs::create_dir_all(&bin).unwrap();
        let exe = bin.join(if cfg!(windows) { "python.exe" } else { "python3" });
        fs::write(&exe, b"").unwrap();
        exe
    }

    #[test]
    fn prefix_of_strips_bin_dir() {
        assert_eq!(
            prefix_of(Path::new("/opt/venv/bin/python3")),
            PathBuf::from("/opt/venv")
        );
        assert_eq!(
            prefix_of(Path::new("/opt/python3")),
            PathBuf::from("/opt")
        );
    }

    #[test]
    fn scan_orders_and_dedups() {
        let work = tempfile::tempdir().unwrap();
        let home = tempfile::tempdir().unwrap();
        let venv = work.path().join(".venv");
        let venv_exe = fake_interpreter(&venv);
        let pyenv_exe = fake_interpreter(&home.path().join(".pyenv/versions/3.11.4"));
        let conda_exe = fake_interpreter(&home.path().join("miniforge3/envs/cad"));

        let roots = SearchRoots {
            // Same prefix as the workspace .venv; must collapse.
            virtual_env: Some(venv.clone()),
            conda_prefix: None,
            path_var: None,
            home: Some(home.path().to_path_buf()),
            workspace_root: work.path().to_path_buf(),
        };

        let executables: Vec<_> = roots
            .scan()
            .into_iter()
            .map(|c| c.executable.unwrap())
            .collect();
        assert_eq!(executables, vec![venv_exe, pyenv_exe, conda_exe]);
    }

    #[cfg(unix)]
    #[test]
    fn symlinked_path_entry_yields_one_candidate() {
        use std::os::unix::fs::{PermissionsExt, symlink};

        let root = tempfile::tempdir().unwrap();
        let usr_bin = root.path().join("usr/bin");
        fs::create_dir_all(&usr_bin).unwrap();
        let exe = usr_bin.join("python3");
        fs::write(&exe, b"#!/bin/sh\n").unwrap();
        fs::set_permissions(&exe, fs::Permissions::from_mode(0o755)).unwrap();
        symlink(&usr_bin, root.path().join("bin")).unwrap();

        let path_var = env::join_paths([root.path().join("bin"), usr_bin.clone()]).unwrap();
        let roots = SearchRoots {
            path_var: Some(path_var),
            workspace_root: root.path().to_path_buf(),
            ..SearchRoots::default()
        };

        let candidates = roots.scan();
        assert_eq!(candidates.len(), 1, "{candidates:?}");
    }

    #[test]
    fn broken_virtual_env_is_reported_without_executable() {
        let work = tempfile::tempdir().unwrap();
        let roots = SearchRoots {
            virtual_env: Some(work.path().join("gone")),
            workspace_root: work.path().to_path_buf(),
            ..SearchRoots::default()
        };
        let candidates = roots.scan();
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].executable, None);
    }

    #[tokio::test]
    async fn no_path_and_nothing_found_is_unavailable() {
        let work = tempfile::tempdir().unwrap();
        let roots = SearchRoots {
            workspace_root: work.path().to_path_buf(),
            ..SearchRoots::default()
        };
        let discovery = HostDiscovery::new(roots, FileSettings::new(None, work.path()));
        assert!(matches!(
            discovery.known().await,
            Err(DiscoveryError::Unavailable)
        ));
    }

    #[tokio::test]
    async fn set_active_path_persists_and_notifies() {
        let work = tempfile::tempdir().unwrap();
        let config = work.path().join("config.toml");
        let exe = fake_interpreter(&work.path().join(".venv"));
        let roots = SearchRoots {
            workspace_root: work.path().to_path_buf(),
            ..SearchRoots::default()
        };
        let discovery =
            HostDiscovery::new(roots, FileSettings::new(Some(config), work.path()));
        let mut changes = discovery.subscribe();

        assert_eq!(discovery.active_path().await.unwrap(), None);
        discovery.set_active_path(&exe).await.unwrap();

        assert_eq!(discovery.active_path().await.unwrap(), Some(exe));
        assert_eq!(
            changes.recv().await.unwrap(),
            DiscoveryChange::ActivePathChanged
        );
    }

    #[test]
    fn virtual_env_is_the_default_active() {
        let work = tempfile::tempdir().unwrap();
        let venv = work.path().join("env-a");
        let exe = fake_interpreter(&venv);
        let roots = SearchRoots {
            virtual_env: Some(venv),
            workspace_root: work.path().to_path_buf(),
            ..SearchRoots::default()
        };
        assert_eq!(roots.default_active(), Some(exe));
    }
}
