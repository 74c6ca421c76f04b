use std::path::{Path, PathBuf};

use gx_types::{Capability, PackageInfo, Version, to_semver};
use tokio::sync::OnceCell;

use crate::runner::Invocation;

/// Name of the companion package on PyPI.
pub const COMPANION_PACKAGE: &str = "pygerber";

/// How an [`Environment`] entered the system.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EnvironmentOrigin {
    /// Reported by the discovery service and resolved by the catalog.
    Discovered,
    /// The user's `custom_interpreter_path` setting.
    CustomPath,
}

/// A resolved Python installation.
///
/// Built once per catalog refresh and never mutated afterwards, except for the
/// capability cell which the prober fills at most once.
#[derive(Debug)]
pub struct Environment {
    id: String,
    path: PathBuf,
    executable: PathBuf,
    version: Version,
    packages: Vec<PackageInfo>,
    is_active: bool,
    origin: EnvironmentOrigin,
    /// `PYTHONPATH` the environment was resolved with.
    python_path: Option<PathBuf>,
    capability: OnceCell<Capability>,
}

impl Environment {
    #[must_use]
    pub fn new(
        id: impl Into<String>,
        path: impl Into<PathBuf>,
        executable: impl Into<PathBuf>,
        version: Version,
        packages: Vec<PackageInfo>,
    ) -> Self {
        Self {
            id: id.into(),
            path: path.into(),
            executable: executable.into(),
            version,
            packages,
            is_active: false,
            origin: EnvironmentOrigin::Discovered,
            python_path: None,
            capability: OnceCell::new(),
        }
    }

    #[must_use]
    pub fn active(mut self, is_active: bool) -> Self {
        self.is_active = is_active;
        self
    }

    #[must_use]
    pub fn with_origin(mut self, origin: EnvironmentOrigin) -> Self {
        self.origin = origin;
        self
    }

    #[must_use]
    pub fn with_python_path(mut self, dir: Option<PathBuf>) -> Self {
        self.python_path = dir;
        self
    }

    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    #[must_use]
    pub fn executable(&self) -> &Path {
        &self.executable
    }

    #[must_use]
    pub fn version(&self) -> &Version {
        &self.version
    }

    #[must_use]
    pub fn packages(&self) -> &[PackageInfo] {
        &self.packages
    }

    #[must_use]
    pub fn is_active(&self) -> bool {
        self.is_active
    }

    #[must_use]
    pub fn origin(&self) -> EnvironmentOrigin {
        self.origin
    }

    #[must_use]
    pub fn python_path(&self) -> Option<&Path> {
        self.python_path.as_deref()
    }

    /// An invocation of this interpreter with the environment's `PYTHONPATH`.
    #[must_use]
    pub fn command(&self) -> Invocation {
        Invocation::new(&self.executable).python_path(self.python_path())
    }

    #[must_use]
    pub fn package(&self, name: &str) -> Option<&PackageInfo> {
        self.packages.iter().find(|p| p.is(name))
    }

    #[must_use]
    pub fn has_companion(&self) -> bool {
        self.package(COMPANION_PACKAGE).is_some()
    }

    /// Installed companion version, if present and parseable.
    #[must_use]
    pub fn companion_version(&self) -> Option<Version> {
        let package = self.package(COMPANION_PACKAGE)?;
        match to_semver(&package.version) {
            Ok(version) => Some(version),
            Err(err) => {
                tracing::warn!(
                    env = %self.id,
                    version = %package.version,
                    "Unparseable {COMPANION_PACKAGE} version: {err}"
                );
                None
            }
        }
    }

    pub(crate) fn capability_cell(&self) -> &OnceCell<Capability> {
        &self.capability
    }

    /// Capability, if it has already been probed.
    #[must_use]
    pub fn cached_capability(&self) -> Option<Capability> {
        self.capability.get().copied()
    }
}
