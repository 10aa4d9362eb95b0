//! Backend-qualified paths.

use std::fmt;
use std::path::{Component, Path, PathBuf};
use std::str::FromStr;

use compact_str::CompactString;
use serde::{Deserialize, Serialize};

use crate::error::VfsError;

/// Scheme used for bare paths.
pub const DEFAULT_SCHEME: &str = "file";

/// A location inside one backend: a scheme plus an absolute path.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Uri {
    scheme: CompactString,
    path: PathBuf,
}

impl Uri {
    /// Create a URI from a scheme and an absolute path.
    pub fn new(scheme: impl Into<CompactString>, path: impl Into<PathBuf>) -> Self {
        Self {
            scheme: scheme.into(),
            path: normalize(&path.into()),
        }
    }

    /// Create a `file` URI from a path.
    pub fn local(path: impl Into<PathBuf>) -> Self {
        Self::new(DEFAULT_SCHEME, path)
    }

    /// Parse `scheme:///path` or a bare absolute path.
    pub fn parse(input: &str) -> Result<Self, VfsError> {
        let invalid = || VfsError::InvalidUri {
            uri: input.to_string(),
        };

        let (scheme, rest) = match input.split_once("://") {
            Some((scheme, rest)) => {
                if scheme.is_empty()
                    || !scheme
                        .chars()
                        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '+' | '-' | '.'))
                {
                    return Err(invalid());
                }
                (scheme, rest)
            }
            None => (DEFAULT_SCHEME, input),
        };

        if !rest.starts_with('/') {
            return Err(invalid());
        }

        Ok(Self::new(scheme, rest))
    }

    /// The backend scheme.
    pub fn scheme(&self) -> &str {
        &self.scheme
    }

    /// The absolute path within the backend.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Last path component, if any.
    pub fn file_name(&self) -> Option<&str> {
        self.path.file_name().and_then(|n| n.to_str())
    }

    /// Parent location, or `None` at the root.
    pub fn parent(&self) -> Option<Self> {
        self.path.parent().map(|p| Self {
            scheme: self.scheme.clone(),
            path: p.to_path_buf(),
        })
    }

    /// Append a relative component.
    pub fn join(&self, name: impl AsRef<Path>) -> Self {
        Self::new(self.scheme.clone(), self.path.join(name))
    }

    /// Replace the last component.
    pub fn with_file_name(&self, name: &str) -> Self {
        Self::new(self.scheme.clone(), self.path.with_file_name(name))
    }

    /// True if `other` is this location or lies beneath it on the same backend.
    pub fn is_ancestor_of(&self, other: &Uri) -> bool {
        self.scheme == other.scheme && other.path.starts_with(&self.path)
    }
}

/// Collapse `.` and `..` without touching the backend.
fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::from("/");
    for component in path.components() {
        match component {
            Component::Normal(part) => out.push(part),
            Component::ParentDir => {
                out.pop();
            }
            Component::RootDir | Component::CurDir | Component::Prefix(_) => {}
        }
    }
    out
}

impl fmt::Display for Uri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.scheme == DEFAULT_SCHEME {
            write!(f, "{}", self.path.display())
        } else {
            write!(f, "{}://{}", self.scheme, self.path.display())
        }
    }
}

impl FromStr for Uri {
    type Err = VfsError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}
