//! Container name validation and path helpers.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::{PortoError, PortoResult};

/// Name of the root container.
pub const ROOT_CONTAINER: &str = "/";

/// Name of the porto meta container all tenants live under.
pub const PORTO_ROOT_CONTAINER: &str = "/porto";

/// A validated, slash-delimited container name.
///
/// Names must:
/// - Be 1-200 characters long
/// - Consist of non-empty `/`-separated segments
/// - Use only `[A-Za-z0-9_@:.-]` within a segment
/// - Carry no leading or trailing slash (except the root name `/`)
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContainerName(String);

impl ContainerName {
    /// Maximum length of a container name.
    pub const MAX_LENGTH: usize = 200;

    /// Create a new container name, validating the format.
    ///
    /// # Errors
    ///
    /// Returns [`PortoError::InvalidValue`] if the format is invalid.
    pub fn new(name: impl Into<String>) -> PortoResult<Self> {
        let name = name.into();
        Self::validate(&name)?;
        Ok(Self(name))
    }

    /// The root container name.
    #[must_use]
    pub fn root() -> Self {
        Self(ROOT_CONTAINER.to_string())
    }

    /// Get the name as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Whether this is the root container `/`.
    #[must_use]
    pub fn is_root(&self) -> bool {
        self.0 == ROOT_CONTAINER
    }

    /// Name of the parent container, `None` for the root.
    #[must_use]
    pub fn parent(&self) -> Option<Self> {
        if self.is_root() {
            return None;
        }
        match self.0.rsplit_once('/') {
            Some((rest, _)) if !rest.is_empty() => Some(Self(rest.to_string())),
            _ => Some(Self::root()),
        }
    }

    /// Last path segment of the name.
    #[must_use]
    pub fn basename(&self) -> &str {
        self.0.rsplit('/').next().unwrap_or(&self.0)
    }

    /// Nesting level: root is 0, `a` is 1, `a/b` is 2.
    #[must_use]
    pub fn level(&self) -> usize {
        if self.is_root() {
            0
        } else {
            self.0.split('/').count()
        }
    }

    /// Child name `<self>/<segment>`.
    pub fn child(&self, segment: &str) -> PortoResult<Self> {
        if self.is_root() {
            Self::new(segment)
        } else {
            Self::new(format!("{}/{}", self.0, segment))
        }
    }

    /// Whether `other` is this container or one of its descendants.
    #[must_use]
    pub fn contains(&self, other: &Self) -> bool {
        if self.is_root() {
            return true;
        }
        other.0 == self.0 || other.0.starts_with(&format!("{}/", self.0))
    }

    fn validate(name: &str) -> PortoResult<()> {
        if name == ROOT_CONTAINER {
            return Ok(());
        }
        if name.is_empty() || name.len() > Self::MAX_LENGTH {
            return Err(PortoError::InvalidValue {
                message: format!("container name length must be 1..={}", Self::MAX_LENGTH),
            });
        }
        if name.starts_with('/') || name.ends_with('/') || name.contains("//") {
            return Err(PortoError::InvalidValue {
                message: format!("invalid container name: {name}"),
            });
        }
        for c in name.chars() {
            let ok = c.is_ascii_alphanumeric() || matches!(c, '_' | '/' | '@' | ':' | '.' | '-');
            if !ok {
                return Err(PortoError::InvalidValue {
                    message: format!("forbidden character {c:?} in container name: {name}"),
                });
            }
        }
        Ok(())
    }
}

impl fmt::Display for ContainerName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for ContainerName {
    type Err = PortoError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl AsRef<str> for ContainerName {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Match a container name against a wait wildcard pattern.
///
/// `*` matches any run of characters including `/`, `?` matches a single
/// character. Used by Wait registrations.
#[must_use]
pub fn match_wildcard(pattern: &str, name: &str) -> bool {
    fn rec(p: &[u8], n: &[u8]) -> bool {
        match (p.first(), n.first()) {
            (None, None) => true,
            (Some(b'*'), _) => rec(&p[1..], n) || (!n.is_empty() && rec(p, &n[1..])),
            (Some(b'?'), Some(_)) => rec(&p[1..], &n[1..]),
            (Some(a), Some(b)) if a == b => rec(&p[1..], &n[1..]),
            _ => false,
        }
    }
    rec(pattern.as_bytes(), name.as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn valid_names() {
        assert!(ContainerName::new("a").is_ok());
        assert!(ContainerName::new("a/b/c").is_ok());
        assert!(ContainerName::new("web@1:prod.2-x_y").is_ok());
        assert!(ContainerName::new("/").is_ok());
    }

    #[test]
    fn invalid_names() {
        assert!(ContainerName::new("").is_err());
        assert!(ContainerName::new("/a").is_err());
        assert!(ContainerName::new("a/").is_err());
        assert!(ContainerName::new("a//b").is_err());
        assert!(ContainerName::new("a b").is_err());
        assert!(ContainerName::new("a*b").is_err());
        assert!(ContainerName::new("x".repeat(201)).is_err());
    }

    #[test]
    fn parent_chain() {
        let name = ContainerName::new("a/b/c").unwrap();
        assert_eq!(name.parent().unwrap().as_str(), "a/b");
        assert_eq!(name.basename(), "c");
        assert_eq!(name.level(), 3);

        let top = ContainerName::new("a").unwrap();
        assert!(top.parent().unwrap().is_root());
        assert_eq!(ContainerName::root().parent(), None);
    }

    #[test]
    fn containment() {
        let a = ContainerName::new("a").unwrap();
        let ab = ContainerName::new("a/b").unwrap();
        let ax = ContainerName::new("ax").unwrap();
        assert!(a.contains(&ab));
        assert!(!a.contains(&ax));
        assert!(ContainerName::root().contains(&a));
        assert!(!ab.contains(&a));
    }

    #[test]
    fn wildcards() {
        assert!(match_wildcard("*", "a/b"));
        assert!(match_wildcard("a/*", "a/b/c"));
        assert!(match_wildcard("a?c", "abc"));
        assert!(!match_wildcard("a/*", "b/c"));
        assert!(match_wildcard("job-*", "job-17"));
    }
}
