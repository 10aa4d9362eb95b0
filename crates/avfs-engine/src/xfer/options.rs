//! Transfer requests and the policies that steer them.

use avfs_core::{BackendRegistry, Uri, VfsError};
use derive_builder::Builder;
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

/// What a transfer does with each source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, Display, EnumString)]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum TransferMode {
    #[default]
    Copy,
    /// Copy then delete the source, or rename when both ends share a filesystem.
    Move,
    /// Create a symbolic link at the target pointing to the source.
    Link,
    /// Remove the sources. Takes no targets.
    Delete,
}

/// How backend failures during a transfer are handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, Display, EnumString)]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum ErrorMode {
    /// Fail the whole transfer.
    #[default]
    Abort,
    /// Ask the caller to abort, retry or skip.
    Query,
}

/// How existing targets are handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, Display, EnumString)]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum OverwriteMode {
    /// Ask the caller for each conflict.
    #[default]
    Query,
    /// Fail the transfer.
    Abort,
    /// Replace the existing target. A directory landing on a directory is
    /// merged into it instead.
    Replace,
    /// Leave the existing target and skip the source.
    Skip,
    /// Pick the next free "name (N)" variant without asking.
    #[strum(serialize = "rename")]
    RenameUnique,
}

/// Transfer behavior flags.
#[derive(Debug, Clone, Builder, Serialize, Deserialize)]
#[builder(setter(into), default)]
pub struct XferOptions {
    pub mode: TransferMode,
    /// Descend into directories.
    pub recursive: bool,
    /// Transfer what symlinks point to rather than the links.
    pub follow_links: bool,
    /// Move by rename when source and target share a filesystem.
    pub same_fs: bool,
    /// Resolve name clashes through the duplicate-name flow.
    pub use_unique_names: bool,
    /// Leave the target's default permissions in place.
    pub target_default_perms: bool,
}

impl Default for XferOptions {
    fn default() -> Self {
        Self {
            mode: TransferMode::Copy,
            recursive: false,
            follow_links: false,
            same_fs: true,
            use_unique_names: false,
            target_default_perms: false,
        }
    }
}

impl XferOptions {
    pub fn builder() -> XferOptionsBuilder {
        XferOptionsBuilder::default()
    }
}

/// A complete transfer job description.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferRequest {
    pub sources: Vec<Uri>,
    pub targets: Vec<Uri>,
    pub options: XferOptions,
    pub error_mode: ErrorMode,
    pub overwrite_mode: OverwriteMode,
}

impl TransferRequest {
    pub fn new(sources: Vec<Uri>, targets: Vec<Uri>) -> Self {
        Self {
            sources,
            targets,
            options: XferOptions::default(),
            error_mode: ErrorMode::default(),
            overwrite_mode: OverwriteMode::default(),
        }
    }

    /// Delete `sources`.
    pub fn delete(sources: Vec<Uri>) -> Self {
        let mut request = Self::new(sources, Vec::new());
        request.options.mode = TransferMode::Delete;
        request
    }

    pub fn with_options(mut self, options: XferOptions) -> Self {
        self.options = options;
        self
    }

    pub fn with_error_mode(mut self, mode: ErrorMode) -> Self {
        self.error_mode = mode;
        self
    }

    pub fn with_overwrite_mode(mut self, mode: OverwriteMode) -> Self {
        self.overwrite_mode = mode;
        self
    }

    /// Reject malformed requests before they are queued.
    pub fn validate(&self, registry: &BackendRegistry) -> Result<(), VfsError> {
        if self.sources.is_empty() {
            return Err(VfsError::bad_parameters("transfer needs at least one source"));
        }

        match self.options.mode {
            TransferMode::Delete if !self.targets.is_empty() => {
                return Err(VfsError::bad_parameters("delete takes no targets"));
            }
            TransferMode::Delete => {}
            _ if self.targets.is_empty() => {
                return Err(VfsError::bad_parameters("transfer needs a target"));
            }
            _ if self.targets.len() != 1 && self.targets.len() != self.sources.len() => {
                return Err(VfsError::bad_parameters(format!(
                    "{} sources cannot map onto {} targets",
                    self.sources.len(),
                    self.targets.len()
                )));
            }
            _ => {}
        }

        for uri in self.sources.iter().chain(&self.targets) {
            registry.resolve(uri)?;
        }
        if let Some(root) = self.sources.iter().find(|uri| uri.file_name().is_none()) {
            return Err(VfsError::bad_parameters(format!(
                "cannot transfer the root of {}",
                root.scheme()
            )));
        }
        Ok(())
    }

    /// Source/target pairs. A single target shared by several sources is a
    /// directory receiving each source under its own name.
    pub(crate) fn pairs(&self) -> Vec<(Uri, Option<Uri>)> {
        match self.targets.len() {
            0 => self.sources.iter().map(|s| (s.clone(), None)).collect(),
            1 if self.sources.len() > 1 => self
                .sources
                .iter()
                .map(|s| {
                    let name = s.file_name().unwrap_or_default();
                    (s.clone(), Some(self.targets[0].join(name)))
                })
                .collect(),
            _ => self
                .sources
                .iter()
                .cloned()
                .zip(self.targets.iter().cloned().map(Some))
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::str::FromStr;

    use super::*;

    #[test]
    fn test_pairs_broadcast_into_directory() {
        let request = TransferRequest::new(
            vec![Uri::local("/src/a"), Uri::local("/src/b.txt")],
            vec![Uri::local("/dst")],
        );
        let pairs = request.pairs();
        assert_eq!(pairs[0].1, Some(Uri::local("/dst/a")));
        assert_eq!(pairs[1].1, Some(Uri::local("/dst/b.txt")));
    }

    #[test]
    fn test_single_pair_is_exact() {
        let request = TransferRequest::new(vec![Uri::local("/src/x")], vec![Uri::local("/dst/y")]);
        assert_eq!(request.pairs()[0].1, Some(Uri::local("/dst/y")));
    }

    #[test]
    fn test_overwrite_mode_from_str() {
        assert_eq!(OverwriteMode::from_str("rename").unwrap(), OverwriteMode::RenameUnique);
        assert_eq!(OverwriteMode::from_str("Replace").unwrap(), OverwriteMode::Replace);
        assert_eq!(ErrorMode::from_str("query").unwrap(), ErrorMode::Query);
    }

    #[test]
    fn test_options_builder_defaults() {
        let options = XferOptions::builder().recursive(true).build().unwrap();
        assert!(options.recursive);
        assert!(options.same_fs);
        assert_eq!(options.mode, TransferMode::Copy);
    }
}
