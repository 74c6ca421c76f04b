//! Core domain types for gx.
//!
//! This crate contains pure domain types with no IO, no async and minimal
//! dependencies. Everything here can be used from any layer of the
//! application.

mod version;

pub use version::{Version, VersionParseError, from_semver, to_semver};

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

// ============================================================================
// Installed packages
// ============================================================================

/// One row of `pip list --format=json`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackageInfo {
    pub name: String,
    pub version: String,
}

impl PackageInfo {
    #[must_use]
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
        }
    }

    /// Whether this record names `package`, compared the way pip normalizes
    /// distribution names (case-insensitive, `-`, `_` and `.` equivalent).
    #[must_use]
    pub fn is(&self, package: &str) -> bool {
        normalize_package_name(&self.name) == normalize_package_name(package)
    }
}

fn normalize_package_name(name: &str) -> String {
    name.chars()
        .map(|c| match c {
            '_' | '.' => '-',
            other => other.to_ascii_lowercase(),
        })
        .collect()
}

// ============================================================================
// Capability
// ============================================================================

/// Outcome of probing an environment for the companion package's language
/// server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Capability {
    /// Package installed and its self-check reports a working server.
    InstalledWithServer,
    /// Package installed, but the self-check failed or reported no server.
    InstalledWithoutServer,
    /// Package absent from the environment's package listing.
    NotInstalled,
    /// Self-check exited cleanly with output we do not recognise.
    UnexpectedOutput,
}

impl Capability {
    #[must_use]
    pub fn has_server(self) -> bool {
        self == Self::InstalledWithServer
    }

    #[must_use]
    pub fn is_installed(self) -> bool {
        !matches!(self, Self::NotInstalled)
    }
}

// ============================================================================
// Language server lifecycle
// ============================================================================

/// State of the protocol client wrapping the language server process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ClientState {
    #[default]
    Stopped,
    Starting,
    Running,
}

impl ClientState {
    #[must_use]
    pub fn label(self) -> &'static str {
        match self {
            Self::Stopped => "Stopped",
            Self::Starting => "Starting",
            Self::Running => "Running",
        }
    }
}

impl fmt::Display for ClientState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Result of a lifecycle `refresh()` / `restart()`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RestartResult {
    Success,
    Failed,
    /// Another restart holds the gate; this request was dropped.
    Aborted,
    /// Nothing to do and nothing worth reporting (e.g. server disabled).
    SilentAborted,
    AbortedNoPyGerber,
    AbortedNoLanguageServer,
    AbortedNoPythonEnvironment,
}

impl RestartResult {
    #[must_use]
    pub fn is_success(self) -> bool {
        self == Self::Success
    }

    /// Whether the result should be surfaced to the user as a problem.
    #[must_use]
    pub fn is_reportable_failure(self) -> bool {
        !matches!(self, Self::Success | Self::SilentAborted)
    }
}

// ============================================================================
// Settings enums
// ============================================================================

/// Where the companion package is looked up and installed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SearchMode {
    /// Use the interpreter's own site-packages.
    Environment,
    /// Use a private install directory prepended via `PYTHONPATH`.
    #[default]
    Extension,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unsupported image format '{0}' (expected .png, .jpg or .bmp)")]
pub struct ImageFormatError(String);

/// Output format for rendered images.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum ImageFormat {
    #[default]
    Png,
    Jpeg,
    Bmp,
}

impl ImageFormat {
    pub fn parse(raw: &str) -> Result<Self, ImageFormatError> {
        let trimmed = raw.trim();
        match trimmed
            .strip_prefix('.')
            .unwrap_or(trimmed)
            .to_ascii_lowercase()
            .as_str()
        {
            "png" => Ok(Self::Png),
            "jpg" | "jpeg" => Ok(Self::Jpeg),
            "bmp" => Ok(Self::Bmp),
            _ => Err(ImageFormatError(raw.to_string())),
        }
    }

    /// File extension including the leading dot.
    #[must_use]
    pub fn extension(self) -> &'static str {
        match self {
            Self::Png => ".png",
            Self::Jpeg => ".jpg",
            Self::Bmp => ".bmp",
        }
    }
}

impl TryFrom<String> for ImageFormat {
    type Error = ImageFormatError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<ImageFormat> for String {
    fn from(value: ImageFormat) -> Self {
        value.extension().to_string()
    }
}

// ============================================================================
// Dismissible warnings
// ============================================================================

/// Warnings the user can dismiss permanently.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Warning {
    /// No environment-discovery integration available on this host.
    DiscoveryUnavailable,
    /// Environments exist but none has the language server.
    NoQualifyingEnvironment,
}

impl Warning {
    pub const ALL: [Warning; 2] = [Self::DiscoveryUnavailable, Self::NoQualifyingEnvironment];

    #[must_use]
    pub fn id(self) -> &'static str {
        match self {
            Self::DiscoveryUnavailable => "discovery-unavailable",
            Self::NoQualifyingEnvironment => "no-qualifying-environment",
        }
    }

    #[must_use]
    pub fn from_id(id: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|w| w.id() == id)
    }
}
