//! Core types and traits for avfs.
//!
//! This crate holds the vocabulary shared by the job engine, the backends and
//! callers: URIs, file metadata, error codes, engine configuration and the
//! uniform [`Backend`] interface through which every primitive operation is
//! performed.

mod backend;
mod config;
mod error;
mod info;
mod registry;
mod uri;

pub use backend::{Backend, FileHandle, ModuleCallbacks, OpContext};
pub use config::{
    EngineConfig, EngineConfigBuilder, PRIORITY_DEFAULT, PRIORITY_MAX, PRIORITY_MIN,
};
pub use error::{BackendResult, ErrorCode, VfsError};
pub use info::{FileInfo, FileType, FindDirectoryKind, OpenMode, SeekPosition, SetInfoMask};
pub use registry::BackendRegistry;
pub use uri::{DEFAULT_SCHEME, Uri};
