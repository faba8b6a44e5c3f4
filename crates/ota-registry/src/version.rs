//! Version constraints and the policy that interprets them
//!
//! Constraint grammar: `>=X.Y.Z`, `^X.Y.Z`, `~X.Y.Z`, `=X.Y.Z`, bare
//! `X.Y.Z`, or `*`. How the open-ended forms (`>=`, `^`, bare) behave is
//! decided by [`CompatibilityPolicy`], so deployments can pick the rule
//! that matches their release discipline.

use crate::error::ConstraintError;
use semver::{Version, VersionReq};
use serde::{Deserialize, Serialize};
use std::fmt::{self, Display, Formatter};
use std::str::FromStr;

/// How open-ended constraints are matched against an Active version
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompatibilityPolicy {
    /// Same major, and at least the stated version
    #[default]
    SameMajorMinimum,
    /// Pure lower bound, any major
    Minimum,
    /// Only the stated version
    Exact,
    /// Cargo-style requirement semantics (`^0.x` pins the minor, etc.)
    Semver,
}

/// One dependency's version requirement
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum VersionConstraint {
    /// `*`
    Any,
    /// `>=X.Y.Z`
    AtLeast(Version),
    /// `^X.Y.Z`
    Caret(Version),
    /// `~X.Y.Z` (same major and minor)
    Tilde(Version),
    /// `=X.Y.Z`
    Exact(Version),
    /// `X.Y.Z`
    Bare(Version),
}

impl VersionConstraint {
    /// Check whether `found` satisfies this constraint under `policy`
    #[must_use]
    pub fn matches(&self, found: &Version, policy: CompatibilityPolicy) -> bool {
        match self {
            Self::Any => true,
            Self::Exact(v) => found == v,
            Self::Tilde(v) if policy != CompatibilityPolicy::Exact => {
                found.major == v.major && found.minor == v.minor && found >= v
            }
            Self::Tilde(v) => found == v,
            Self::AtLeast(v) | Self::Caret(v) | Self::Bare(v) => match policy {
                CompatibilityPolicy::SameMajorMinimum => found.major == v.major && found >= v,
                CompatibilityPolicy::Minimum => found >= v,
                CompatibilityPolicy::Exact => found == v,
                CompatibilityPolicy::Semver => self.semver_req().is_some_and(|req| req.matches(found)),
            },
        }
    }

    /// The version named by the constraint, if any
    #[must_use]
    pub fn version(&self) -> Option<&Version> {
        match self {
            Self::Any => None,
            Self::AtLeast(v) | Self::Caret(v) | Self::Tilde(v) | Self::Exact(v) | Self::Bare(v) => {
                Some(v)
            }
        }
    }

    fn semver_req(&self) -> Option<VersionReq> {
        let text = match self {
            Self::AtLeast(v) => format!(">={v}"),
            Self::Caret(v) | Self::Bare(v) => format!("^{v}"),
            _ => self.to_string(),
        };
        VersionReq::parse(&text).ok()
    }
}

impl Display for VersionConstraint {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Self::Any => write!(f, "*"),
            Self::AtLeast(v) => write!(f, ">={v}"),
            Self::Caret(v) => write!(f, "^{v}"),
            Self::Tilde(v) => write!(f, "~{v}"),
            Self::Exact(v) => write!(f, "={v}"),
            Self::Bare(v) => write!(f, "{v}"),
        }
    }
}

impl FromStr for VersionConstraint {
    type Err = ConstraintError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let input = s.trim();
        if input == "*" {
            return Ok(Self::Any);
        }

        // ">=" must be tried before "="
        let (op, rest) = [">=", "^", "~", "="]
            .iter()
            .find_map(|op| input.strip_prefix(*op).map(|rest| (*op, rest)))
            .unwrap_or(("", input));

        let version = Version::parse(rest.trim()).map_err(|e| ConstraintError {
            input: s.to_string(),
            reason: e.to_string(),
        })?;

        Ok(match op {
            ">=" => Self::AtLeast(version),
            "^" => Self::Caret(version),
            "~" => Self::Tilde(version),
            "=" => Self::Exact(version),
            _ => Self::Bare(version),
        })
    }
}

impl TryFrom<String> for VersionConstraint {
    type Error = ConstraintError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<VersionConstraint> for String {
    fn from(value: VersionConstraint) -> Self {
        value.to_string()
    }
}
