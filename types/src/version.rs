//! Versions as reported by Python and pip.
//!
//! Python and pip spell pre-releases PEP 440 style (`3.0.0a0`, `2.1.0rc1`).
//! Internally we keep a semver-shaped [`Version`] so that ordering follows
//! semver precedence; [`to_semver`] and [`from_semver`] convert between the
//! two spellings.

use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum VersionParseError {
    #[error("empty version string")]
    Empty,
    #[error("expected MAJOR.MINOR.PATCH, got '{0}'")]
    Shape(String),
    #[error("invalid numeric component '{component}' in '{raw}'")]
    Component { raw: String, component: String },
    #[error("empty pre-release identifier in '{0}'")]
    EmptyPreRelease(String),
}

/// A `major.minor.patch[-pre]` version.
///
/// Build metadata (`+...`) is accepted on parse and discarded.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Version {
    major: u64,
    minor: u64,
    patch: u64,
    pre: Option<String>,
}

impl Version {
    #[must_use]
    pub const fn new(major: u64, minor: u64, patch: u64) -> Self {
        Self {
            major,
            minor,
            patch,
            pre: None,
        }
    }

    #[must_use]
    pub fn with_pre(mut self, pre: impl Into<String>) -> Self {
        self.pre = Some(pre.into());
        self
    }

    /// Parse a semver string such as `3.0.0-alpha0`.
    pub fn parse(raw: &str) -> Result<Self, VersionParseError> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Err(VersionParseError::Empty);
        }

        let without_build = raw.split_once('+').map_or(raw, |(v, _)| v);
        let (core, pre) = match without_build.split_once('-') {
            Some((core, pre)) => {
                if pre.is_empty() || pre.split('.').any(str::is_empty) {
                    return Err(VersionParseError::EmptyPreRelease(raw.to_string()));
                }
                (core, Some(pre.to_string()))
            }
            None => (without_build, None),
        };

        let parts: Vec<&str> = core.split('.').collect();
        let [major, minor, patch] = parts[..] else {
            return Err(VersionParseError::Shape(raw.to_string()));
        };

        let number = |component: &str| {
            component
                .parse::<u64>()
                .map_err(|_| VersionParseError::Component {
                    raw: raw.to_string(),
                    component: component.to_string(),
                })
        };

        Ok(Self {
            major: number(major)?,
            minor: number(minor)?,
            patch: number(patch)?,
            pre,
        })
    }

    #[must_use]
    pub fn major(&self) -> u64 {
        self.major
    }

    #[must_use]
    pub fn minor(&self) -> u64 {
        self.minor
    }

    #[must_use]
    pub fn patch(&self) -> u64 {
        self.patch
    }

    /// Pre-release tag without the leading `-` (e.g. `rc1`, `alpha0`).
    #[must_use]
    pub fn pre(&self) -> Option<&str> {
        self.pre.as_deref()
    }
}

impl FromStr for Version {
    type Err = VersionParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)?;
        if let Some(pre) = &self.pre {
            write!(f, "-{pre}")?;
        }
        Ok(())
    }
}

fn compare_identifiers(a: &str, b: &str) -> Ordering {
    match (a.parse::<u64>(), b.parse::<u64>()) {
        (Ok(x), Ok(y)) => x.cmp(&y),
        // Numeric identifiers always have lower precedence.
        (Ok(_), Err(_)) => Ordering::Less,
        (Err(_), Ok(_)) => Ordering::Greater,
        (Err(_), Err(_)) => a.cmp(b),
    }
}

fn compare_pre(a: Option<&str>, b: Option<&str>) -> Ordering {
    match (a, b) {
        (None, None) => Ordering::Equal,
        (None, Some(_)) => Ordering::Greater,
        (Some(_), None) => Ordering::Less,
        (Some(a), Some(b)) => {
            let mut lhs = a.split('.');
            let mut rhs = b.split('.');
            loop {
                match (lhs.next(), rhs.next()) {
                    (None, None) => return Ordering::Equal,
                    (None, Some(_)) => return Ordering::Less,
                    (Some(_), None) => return Ordering::Greater,
                    (Some(x), Some(y)) => match compare_identifiers(x, y) {
                        Ordering::Equal => {}
                        other => return other,
                    },
                }
            }
        }
    }
}

impl Ord for Version {
    fn cmp(&self, other: &Self) -> Ordering {
        self.major
            .cmp(&other.major)
            .then(self.minor.cmp(&other.minor))
            .then(self.patch.cmp(&other.patch))
            .then_with(|| compare_pre(self.pre(), other.pre()))
    }
}

impl PartialOrd for Version {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Convert a pip-style version (`2.1.0rc1`) into a [`Version`].
///
/// Only the first occurrence of each marker is rewritten: `a` → `-alpha`,
/// `b` → `-beta`, `rc` → `-rc`.
pub fn to_semver(pip_version: &str) -> Result<Version, VersionParseError> {
    let rewritten = pip_version
        .trim()
        .replacen('a', "-alpha", 1)
        .replacen('b', "-beta", 1)
        .replacen("rc", "-rc", 1);
    Version::parse(&rewritten)
}

/// Inverse of [`to_semver`]: render a [`Version`] in pip spelling.
#[must_use]
pub fn from_semver(version: &Version) -> String {
    version
        .to_string()
        .replacen("-alpha", "a", 1)
        .replacen("-beta", "b", 1)
        .replacen("-rc", "rc", 1)
}
