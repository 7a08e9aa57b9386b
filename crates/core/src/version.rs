//! Package version gating.
//!
//! Versions follow PEP 440 ordering, which is what the Python-side
//! components this engine interoperates with publish (`0.8.5.post1`,
//! `2.6.0rc1`, `1.0.0.dev3+cu121`).

use std::cmp::Ordering;
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::{LazyLock, RwLock};

use regex::Regex;
use thiserror::Error;

/// Errors from version resolution and parsing.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum VersionError {
    #[error("package not found: {0}")]
    PackageNotFound(String),
    #[error("invalid version: '{0}'")]
    InvalidVersion(String),
}

static VERSION_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?xi)
        ^\s*v?
        (?:(?P<epoch>[0-9]+)!)?
        (?P<release>[0-9]+(?:\.[0-9]+)*)
        (?:[-_.]?(?P<pre_l>alpha|a|beta|b|preview|pre|c|rc)[-_.]?(?P<pre_n>[0-9]+)?)?
        (?:-(?P<post_n1>[0-9]+)|[-_.]?(?P<post_l>post|rev|r)[-_.]?(?P<post_n2>[0-9]+)?)?
        (?:[-_.]?(?P<dev_l>dev)[-_.]?(?P<dev_n>[0-9]+)?)?
        (?:\+(?P<local>[a-z0-9]+(?:[-_.][a-z0-9]+)*))?
        \s*$",
    )
    .expect("VERSION_PATTERN pattern is invalid")
});

/// Pre-release phase, in ascending order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum PreRelease {
    Alpha,
    Beta,
    Rc,
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
enum LocalSegment {
    Text(String),
    Number(u64),
}

/// A parsed PEP 440 version.
#[derive(Debug, Clone)]
pub struct Version {
    pub epoch: u64,
    pub release: Vec<u64>,
    pub pre: Option<(PreRelease, u64)>,
    pub post: Option<u64>,
    pub dev: Option<u64>,
    local: Vec<LocalSegment>,
    raw: String,
}

impl Version {
    /// Whether this is a pre- or dev-release.
    pub fn is_prerelease(&self) -> bool {
        self.pre.is_some() || self.dev.is_some()
    }

    /// `release` without trailing zeros, so `1.2` == `1.2.0`.
    fn normalized_release(&self) -> &[u64] {
        let len = self
            .release
            .iter()
            .rposition(|&n| n != 0)
            .map_or(0, |pos| pos + 1);
        &self.release[..len]
    }

    /// Sort key following PEP 440: a dev-only release sorts before its
    /// pre-releases, which sort before the final release.
    fn sort_key(&self) -> (u64, &[u64], PreKey, Option<u64>, DevKey, &[LocalSegment]) {
        let pre = match (self.pre, self.post, self.dev) {
            (None, None, Some(_)) => PreKey::DevOnly,
            (None, _, _) => PreKey::Final,
            (Some(pre), _, _) => PreKey::Pre(pre),
        };
        let dev = match self.dev {
            Some(n) => DevKey::Dev(n),
            None => DevKey::None,
        };
        (
            self.epoch,
            self.normalized_release(),
            pre,
            self.post,
            dev,
            &self.local,
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum PreKey {
    DevOnly,
    Pre((PreRelease, u64)),
    Final,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum DevKey {
    Dev(u64),
    None,
}

fn parse_number(s: &str, raw: &str) -> Result<u64, VersionError> {
    s.parse()
        .map_err(|_| VersionError::InvalidVersion(raw.to_string()))
}

impl FromStr for Version {
    type Err = VersionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || VersionError::InvalidVersion(s.to_string());
        let caps = VERSION_PATTERN.captures(s).ok_or_else(invalid)?;

        let epoch = match caps.name("epoch") {
            Some(m) => parse_number(m.as_str(), s)?,
            None => 0,
        };
        let release = caps
            .name("release")
            .ok_or_else(invalid)?
            .as_str()
            .split('.')
            .map(|part| parse_number(part, s))
            .collect::<Result<Vec<_>, _>>()?;

        let pre = match caps.name("pre_l") {
            Some(label) => {
                let phase = match label.as_str().to_ascii_lowercase().as_str() {
                    "a" | "alpha" => PreRelease::Alpha,
                    "b" | "beta" => PreRelease::Beta,
                    _ => PreRelease::Rc,
                };
                let n = match caps.name("pre_n") {
                    Some(m) => parse_number(m.as_str(), s)?,
                    None => 0,
                };
                Some((phase, n))
            }
            None => None,
        };

        let post = match (caps.name("post_n1"), caps.name("post_n2")) {
            (Some(m), _) | (None, Some(m)) => Some(parse_number(m.as_str(), s)?),
            (None, None) if caps.name("post_l").is_some() => Some(0),
            (None, None) => None,
        };

        let dev = match caps.name("dev_n") {
            Some(m) => Some(parse_number(m.as_str(), s)?),
            None if caps.name("dev_l").is_some() => Some(0),
            None => None,
        };

        let local = caps
            .name("local")
            .map(|m| {
                m.as_str()
                    .split(['-', '_', '.'])
                    .map(|seg| match seg.parse::<u64>() {
                        Ok(n) => LocalSegment::Number(n),
                        Err(_) => LocalSegment::Text(seg.to_ascii_lowercase()),
                    })
                    .collect()
            })
            .unwrap_or_default();

        Ok(Self {
            epoch,
            release,
            pre,
            post,
            dev,
            local,
            raw: s.trim().to_string(),
        })
    }
}

impl PartialEq for Version {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Version {}

impl PartialOrd for Version {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Version {
    fn cmp(&self, other: &Self) -> Ordering {
        self.sort_key().cmp(&other.sort_key())
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

/// Installed package versions, keyed by normalized package name.
#[derive(Debug, Clone, Default)]
pub struct PackageRegistry {
    versions: HashMap<String, String>,
}

/// Package names compare case-insensitively with `-`, `_` and `.` equivalent.
fn normalize_name(name: &str) -> String {
    name.trim()
        .to_ascii_lowercase()
        .replace(['_', '.'], "-")
}

impl PackageRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record (or replace) a package's installed version.
    pub fn register(&mut self, name: &str, version: impl Into<String>) {
        self.versions.insert(normalize_name(name), version.into());
    }

    /// Installed version of `pkg`.
    pub fn version(&self, pkg: &str) -> Result<Version, VersionError> {
        let raw = self
            .versions
            .get(&normalize_name(pkg))
            .ok_or_else(|| VersionError::PackageNotFound(pkg.to_string()))?;
        raw.parse()
    }

    /// Whether the installed version of `pkg` is at least `minver`.
    pub fn is_version_ge(&self, pkg: &str, minver: &str) -> Result<bool, VersionError> {
        let installed = self.version(pkg)?;
        let minimum: Version = minver.parse()?;
        Ok(installed >= minimum)
    }
}

static INSTALLED: LazyLock<RwLock<PackageRegistry>> = LazyLock::new(|| {
    let mut registry = PackageRegistry::new();
    registry.register(env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION"));
    RwLock::new(registry)
});

/// Register a package version with the process-wide registry.
///
/// Hosts call this at startup for the components they embed or talk to.
pub fn register_package(name: &str, version: impl Into<String>) {
    INSTALLED
        .write()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
        .register(name, version);
}

/// Installed version of `pkg` from the process-wide registry.
pub fn installed_version(pkg: &str) -> Result<Version, VersionError> {
    INSTALLED
        .read()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
        .version(pkg)
}

/// Check if the package version is greater than or equal to the minimum version.
pub fn is_version_ge(pkg: &str, minver: &str) -> Result<bool, VersionError> {
    INSTALLED
        .read()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
        .is_version_ge(pkg, minver)
}
