//! Scheme to backend lookup.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use compact_str::CompactString;

use crate::backend::Backend;
use crate::error::VfsError;
use crate::uri::Uri;

/// The set of backends available to an engine, keyed by scheme.
#[derive(Clone, Default)]
pub struct BackendRegistry {
    backends: HashMap<CompactString, Arc<dyn Backend>>,
}

impl BackendRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a backend under its own scheme, replacing any previous one.
    pub fn register(&mut self, backend: Arc<dyn Backend>) -> &mut Self {
        self.backends
            .insert(CompactString::from(backend.scheme()), backend);
        self
    }

    /// Builder-style variant of [`register`](Self::register).
    pub fn with(mut self, backend: Arc<dyn Backend>) -> Self {
        self.register(backend);
        self
    }

    /// Backend serving `uri`.
    pub fn resolve(&self, uri: &Uri) -> Result<Arc<dyn Backend>, VfsError> {
        self.backends
            .get(uri.scheme())
            .cloned()
            .ok_or_else(|| VfsError::UnknownScheme {
                scheme: uri.scheme().to_string(),
            })
    }

    pub fn contains(&self, scheme: &str) -> bool {
        self.backends.contains_key(scheme)
    }

    /// Registered schemes, sorted.
    pub fn schemes(&self) -> Vec<&str> {
        let mut schemes: Vec<&str> = self.backends.keys().map(|s| s.as_str()).collect();
        schemes.sort_unstable();
        schemes
    }
}

impl fmt::Debug for BackendRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BackendRegistry")
            .field("schemes", &self.schemes())
            .finish()
    }
}
