//! Backends for avfs.
//!
//! - [`LocalBackend`] serves the host filesystem under the `file` scheme.
//! - [`MemoryBackend`] serves an in-process tree under the `mem` scheme and
//!   records every call it receives.
//!
//! Both implement [`avfs_core::Backend`], so the job engine drives them
//! through the same interface.

mod local;
mod memory;

pub use local::{LOCAL_SCHEME, LocalBackend};
pub use memory::{MEMORY_SCHEME, MemoryBackend, MemoryStats};

use std::sync::Arc;

use avfs_core::BackendRegistry;

/// Registry with the local backend installed.
pub fn default_registry() -> BackendRegistry {
    BackendRegistry::new().with(Arc::new(LocalBackend::new()))
}
