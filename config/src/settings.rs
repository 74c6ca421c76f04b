use std::env;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use gx_types::{ImageFormat, SearchMode, Warning};

use crate::{GxConfig, config_path, gx_dir, persist};

/// Values for the `${...}` variables allowed in path settings.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Substitutions {
    pub user_home: Option<PathBuf>,
    pub workspace_folder: Option<PathBuf>,
    pub cwd: Option<PathBuf>,
}

impl Substitutions {
    #[must_use]
    pub fn detect(workspace_root: &Path) -> Self {
        Self {
            user_home: dirs::home_dir(),
            workspace_folder: Some(workspace_root.to_path_buf()),
            cwd: env::current_dir().ok(),
        }
    }

    /// Replace `${userHome}`, `${workspaceFolder}` and `${cwd}` in `raw`.
    ///
    /// A variable with no known value is left as written.
    #[must_use]
    pub fn apply(&self, raw: &str) -> String {
        let mut out = raw.to_string();
        for (token, value) in [
            ("${userHome}", &self.user_home),
            ("${workspaceFolder}", &self.workspace_folder),
            ("${cwd}", &self.cwd),
        ] {
            if let Some(value) = value {
                out = out.replace(token, &value.to_string_lossy());
            }
        }
        out
    }
}

/// Immutable view of the user's settings, taken at the start of an operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserSettings {
    pub enable: bool,
    pub args: Vec<String>,
    /// `None` when the setting is empty.
    pub custom_interpreter_path: Option<PathBuf>,
    pub allow_automatic_fallback: bool,
    pub search_mode: SearchMode,
    pub install_directory: PathBuf,
    pub render_dpi: u32,
    pub image_format: ImageFormat,
    pub layer_style: String,
    pub ignored_warnings: Vec<String>,
    pub start_timeout: Duration,
    pub poll_interval: Duration,
    pub workspace_root: PathBuf,
    pub active_interpreter: Option<PathBuf>,
}

impl UserSettings {
    #[must_use]
    pub fn resolve(config: &GxConfig, vars: &Substitutions, workspace_root: &Path) -> Self {
        let custom = vars.apply(config.custom_interpreter_path.trim());
        let install_directory = match config.extension_install_directory.as_deref() {
            Some(dir) if !dir.trim().is_empty() => PathBuf::from(vars.apply(dir.trim())),
            _ => default_install_directory(),
        };

        Self {
            enable: config.enable,
            args: config.args.clone(),
            custom_interpreter_path: (!custom.is_empty()).then(|| PathBuf::from(custom)),
            allow_automatic_fallback: config.allow_automatic_fallback,
            search_mode: config.pygerber_search_mode,
            install_directory,
            render_dpi: config.render_dpi,
            image_format: config.image_format,
            layer_style: config.layer_style.clone(),
            ignored_warnings: config.ignored_warnings.clone(),
            start_timeout: Duration::from_millis(config.lsp.start_timeout_ms),
            // A zero interval would spin.
            poll_interval: Duration::from_millis(config.lsp.poll_interval_ms.max(1)),
            workspace_root: workspace_root.to_path_buf(),
            active_interpreter: config
                .python
                .active
                .as_deref()
                .filter(|p| !p.trim().is_empty())
                .map(|p| PathBuf::from(vars.apply(p.trim()))),
        }
    }

    /// Defaults rooted at `workspace_root`, as if no config file existed.
    #[must_use]
    pub fn defaults(workspace_root: &Path) -> Self {
        Self::resolve(
            &GxConfig::default(),
            &Substitutions::detect(workspace_root),
            workspace_root,
        )
    }

    #[must_use]
    pub fn is_ignored(&self, warning: Warning) -> bool {
        self.ignored_warnings.iter().any(|id| id == warning.id())
    }

    /// Directory to put on `PYTHONPATH` for every interpreter call, if any.
    #[must_use]
    pub fn python_path(&self) -> Option<&Path> {
        match self.search_mode {
            SearchMode::Extension => Some(&self.install_directory),
            SearchMode::Environment => None,
        }
    }
}

fn default_install_directory() -> PathBuf {
    gx_dir()
        .unwrap_or_else(|| PathBuf::from(".gx"))
        .join("pygerber")
}

/// Produces a fresh [`UserSettings`] snapshot on demand.
pub trait SettingsSource: Send + Sync {
    fn snapshot(&self) -> UserSettings;
}

impl SettingsSource for UserSettings {
    fn snapshot(&self) -> UserSettings {
        self.clone()
    }
}

/// Settings backed by the config file, re-read on every snapshot.
#[derive(Debug, Clone)]
pub struct FileSettings {
    path: Option<PathBuf>,
    workspace_root: PathBuf,
}

impl FileSettings {
    #[must_use]
    pub fn new(path: Option<PathBuf>, workspace_root: impl Into<PathBuf>) -> Self {
        Self {
            path,
            workspace_root: workspace_root.into(),
        }
    }

    /// Settings from [`config_path`].
    #[must_use]
    pub fn discover(workspace_root: impl Into<PathBuf>) -> Self {
        Self::new(config_path(), workspace_root)
    }

    #[must_use]
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    #[must_use]
    pub fn workspace_root(&self) -> &Path {
        &self.workspace_root
    }

    /// Dismiss `warning` permanently. Returns `false` if it already was.
    pub fn ignore_warning(&self, warning: Warning) -> io::Result<bool> {
        persist::persist_ignored_warning(self.require_path()?, warning)
    }

    pub fn set_active_interpreter(&self, executable: &Path) -> io::Result<()> {
        persist::persist_active_interpreter(self.require_path()?, executable)
    }

    fn require_path(&self) -> io::Result<&Path> {
        self.path.as_deref().ok_or_else(|| {
            io::Error::new(io::ErrorKind::NotFound, "Could not determine config path")
        })
    }
}

impl SettingsSource for FileSettings {
    fn snapshot(&self) -> UserSettings {
        let config = match &self.path {
            Some(path) => GxConfig::load_from(path).unwrap_or_else(|err| {
                tracing::warn!(error = %err, "Using default settings");
                GxConfig::default()
            }),
            None => GxConfig::default(),
        };
        UserSettings::resolve(
            &config,
            &Substitutions::detect(&self.workspace_root),
            &self.workspace_root,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vars() -> Substitutions {
        Substitutions {
            user_home: Some(PathBuf::from("/home/ada")),
            workspace_folder: Some(PathBuf::from("/work/board")),
            cwd: Some(PathBuf::from("/tmp")),
        }
    }

    #[test]
    fn substitutes_known_variables() {
        assert_eq!(
            vars().apply("${userHome}/envs/${workspaceFolder}"),
            "/home/ada/envs//work/board"
        );
        assert_eq!(vars().apply("${cwd}/python"), "/tmp/python");
        assert_eq!(vars().apply("/usr/bin/python3"), "/usr/bin/python3");
    }

    #[test]
    fn unknown_variables_are_left_alone() {
        let vars = Substitutions::default();
        assert_eq!(vars.apply("${userHome}/python"), "${userHome}/python");
        assert_eq!(vars.apply("${env:HOME}"), "${env:HOME}");
    }

    #[test]
    fn resolve_applies_substitution_and_empty_means_unset() {
        let root = Path::new("/work/board");
        let mut config = GxConfig::default();
        let settings = UserSettings::resolve(&config, &vars(), root);
        assert_eq!(settings.custom_interpreter_path, None);
        assert_eq!(settings.active_interpreter, None);

        config.custom_interpreter_path = "${workspaceFolder}/.venv/bin/python".to_string();
        config.extension_install_directory = Some("${userHome}/pg".to_string());
        let settings = UserSettings::resolve(&config, &vars(), root);
        assert_eq!(
            settings.custom_interpreter_path,
            Some(PathBuf::from("/work/board/.venv/bin/python"))
        );
        assert_eq!(settings.install_directory, PathBuf::from("/home/ada/pg"));
        assert_eq!(settings.workspace_root, root);
    }

    #[test]
    fn python_path_only_in_extension_mode() {
        let mut config = GxConfig::default();
        config.extension_install_directory = Some("/opt/pg".to_string());
        let settings = UserSettings::resolve(&config, &vars(), Path::new("/w"));
        assert_eq!(settings.python_path(), Some(Path::new("/opt/pg")));

        config.pygerber_search_mode = SearchMode::Environment;
        let settings = UserSettings::resolve(&config, &vars(), Path::new("/w"));
        assert_eq!(settings.python_path(), None);
    }

    #[test]
    fn zero_poll_interval_is_clamped() {
        let mut config = GxConfig::default();
        config.lsp.poll_interval_ms = 0;
        let settings = UserSettings::resolve(&config, &vars(), Path::new("/w"));
        assert_eq!(settings.poll_interval, Duration::from_millis(1));
    }

    #[test]
    fn ignored_warnings_are_matched_by_id() {
        let mut config = GxConfig::default();
        config.ignored_warnings = vec!["no-qualifying-environment".to_string()];
        let settings = UserSettings::resolve(&config, &vars(), Path::new("/w"));
        assert!(settings.is_ignored(Warning::NoQualifyingEnvironment));
        assert!(!settings.is_ignored(Warning::DiscoveryUnavailable));
    }

    #[test]
    fn file_settings_reread_on_every_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        let source = FileSettings::new(Some(path.clone()), dir.path());

        assert!(source.snapshot().enable);
        std::fs::write(&path, "enable = false\nrender_dpi = 600\n").unwrap();
        let snapshot = source.snapshot();
        assert!(!snapshot.enable);
        assert_eq!(snapshot.render_dpi, 600);
    }

    #[test]
    fn file_settings_fall_back_to_defaults_on_parse_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "render_dpi = \"lots\"").unwrap();
        let source = FileSettings::new(Some(path), dir.path());
        assert_eq!(source.snapshot().render_dpi, crate::DEFAULT_RENDER_DPI);
    }

    #[test]
    fn persistence_requires_a_path() {
        let source = FileSettings::new(None, "/w");
        let err = source
            .ignore_warning(Warning::DiscoveryUnavailable)
            .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotFound);
    }
}
