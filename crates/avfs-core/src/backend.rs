//! The uniform operation interface every protocol backend implements.
//!
//! Backends are invoked from worker threads. They block freely inside a call,
//! but should consult [`OpContext::checkpoint`] before each blocking step so
//! that cancellation takes effect promptly.

use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::error::{BackendResult, ErrorCode};
use crate::info::{FileInfo, FindDirectoryKind, OpenMode, SeekPosition, SetInfoMask};
use crate::uri::Uri;

/// Caller-side handlers a backend may consult mid-operation (for example to
/// obtain credentials). Calls block the worker until the caller answers.
pub trait ModuleCallbacks {
    fn invoke(&self, name: &str, payload: Value) -> BackendResult<Value>;
}

/// Per-call execution context handed to backends.
pub struct OpContext<'a> {
    cancel: CancellationToken,
    callbacks: Option<&'a dyn ModuleCallbacks>,
}

impl<'a> OpContext<'a> {
    /// Context observing the given cancellation token.
    pub fn new(cancel: CancellationToken) -> Self {
        Self {
            cancel,
            callbacks: None,
        }
    }

    /// Context that is never cancelled and has no module callbacks.
    pub fn detached() -> Self {
        Self::new(CancellationToken::new())
    }

    /// Attach the caller's module-callback bridge.
    pub fn with_callbacks(mut self, callbacks: &'a dyn ModuleCallbacks) -> Self {
        self.callbacks = Some(callbacks);
        self
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Fail with [`ErrorCode::Cancelled`] once cancellation was requested.
    pub fn checkpoint(&self) -> BackendResult<()> {
        if self.cancel.is_cancelled() {
            Err(ErrorCode::Cancelled)
        } else {
            Ok(())
        }
    }

    /// Round-trip `payload` to the caller's module callback called `name`.
    pub fn module_callback(&self, name: &str, payload: Value) -> BackendResult<Value> {
        self.checkpoint()?;
        match self.callbacks {
            Some(callbacks) => callbacks.invoke(name, payload),
            None => Err(ErrorCode::NotSupported),
        }
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }
}

/// An open file owned by a backend.
pub trait FileHandle: Send {
    /// Read up to `buf.len()` bytes. `Ok(0)` signals end of file.
    fn read(&mut self, buf: &mut [u8], ctx: &OpContext<'_>) -> BackendResult<usize>;

    /// Write `data`, returning the number of bytes accepted.
    fn write(&mut self, data: &[u8], ctx: &OpContext<'_>) -> BackendResult<usize>;

    /// Move the file position, returning the new absolute offset.
    fn seek(&mut self, whence: SeekPosition, offset: i64, ctx: &OpContext<'_>)
    -> BackendResult<u64>;

    /// Backend-specific control request.
    fn control(
        &mut self,
        operation: &str,
        _data: &Value,
        _ctx: &OpContext<'_>,
    ) -> BackendResult<Value> {
        let _ = operation;
        Err(ErrorCode::NotSupported)
    }

    /// Release the handle, flushing pending writes.
    fn close(self: Box<Self>, ctx: &OpContext<'_>) -> BackendResult<()>;
}

/// A per-protocol implementation of the primitive operations.
pub trait Backend: Send + Sync {
    /// URI scheme served by this backend.
    fn scheme(&self) -> &str;

    fn open(&self, uri: &Uri, mode: OpenMode, ctx: &OpContext<'_>)
    -> BackendResult<Box<dyn FileHandle>>;

    /// Create a file. With `exclusive`, an existing file is an error.
    fn create(
        &self,
        uri: &Uri,
        mode: OpenMode,
        exclusive: bool,
        permissions: u32,
        ctx: &OpContext<'_>,
    ) -> BackendResult<Box<dyn FileHandle>>;

    fn create_symlink(&self, uri: &Uri, target: &str, ctx: &OpContext<'_>) -> BackendResult<()>;

    fn get_file_info(
        &self,
        uri: &Uri,
        follow_links: bool,
        ctx: &OpContext<'_>,
    ) -> BackendResult<FileInfo>;

    /// Apply the fields of `info` selected by `mask`.
    fn set_file_info(
        &self,
        uri: &Uri,
        info: &FileInfo,
        mask: SetInfoMask,
        ctx: &OpContext<'_>,
    ) -> BackendResult<()>;

    /// List a directory, sorted by name.
    fn load_directory(
        &self,
        uri: &Uri,
        follow_links: bool,
        ctx: &OpContext<'_>,
    ) -> BackendResult<Vec<FileInfo>>;

    fn find_directory(
        &self,
        near: &Uri,
        kind: FindDirectoryKind,
        create_if_needed: bool,
        ctx: &OpContext<'_>,
    ) -> BackendResult<Uri>;

    fn make_directory(&self, uri: &Uri, permissions: u32, ctx: &OpContext<'_>)
    -> BackendResult<()>;

    /// Remove a file, symlink or empty directory.
    fn remove(&self, uri: &Uri, ctx: &OpContext<'_>) -> BackendResult<()>;

    /// Rename within this backend without copying data.
    fn rename(&self, from: &Uri, to: &Uri, ctx: &OpContext<'_>) -> BackendResult<()>;

    /// Whether a rename between the two locations can avoid copying.
    fn same_fs(&self, a: &Uri, b: &Uri, ctx: &OpContext<'_>) -> BackendResult<bool>;

    /// Convenience existence check built on `get_file_info`.
    fn exists(&self, uri: &Uri, ctx: &OpContext<'_>) -> BackendResult<bool> {
        match self.get_file_info(uri, false, ctx) {
            Ok(_) => Ok(true),
            Err(ErrorCode::NotFound) => Ok(false),
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Echo;

    impl ModuleCallbacks for Echo {
        fn invoke(&self, name: &str, payload: Value) -> BackendResult<Value> {
            Ok(serde_json::json!({ "name": name, "payload": payload }))
        }
    }

    #[test]
    fn test_checkpoint() {
        let token = CancellationToken::new();
        let ctx = OpContext::new(token.clone());
        assert!(ctx.checkpoint().is_ok());
        token.cancel();
        assert_eq!(ctx.checkpoint(), Err(ErrorCode::Cancelled));
    }

    #[test]
    fn test_module_callback_bridge() {
        let ctx = OpContext::detached();
        assert_eq!(
            ctx.module_callback("auth", Value::Null),
            Err(ErrorCode::NotSupported)
        );

        let echo = Echo;
        let ctx = OpContext::detached().with_callbacks(&echo);
        let reply = ctx.module_callback("auth", serde_json::json!(1)).unwrap();
        assert_eq!(reply["name"], "auth");
        assert_eq!(reply["payload"], 1);
    }
}
