//! Table of backend handles opened through the engine.
//!
//! Callers only ever see a [`FileId`]. The backend handle stays in the
//! table and is checked out by the worker that executes an operation on it,
//! so two jobs can never drive the same handle at once.

use std::fmt;
use std::sync::{Mutex, MutexGuard};

use avfs_core::{ErrorCode, FileHandle, OpContext, Uri};
use serde::{Deserialize, Serialize};

use crate::arena::{Arena, Index};

/// Caller-visible reference to an open file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FileId(Index);

impl fmt::Display for FileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "file#{}", self.0)
    }
}

struct OpenFile {
    uri: Uri,
    stream: bool,
    /// `None` while a worker has the handle checked out.
    handle: Option<Box<dyn FileHandle>>,
}

/// A handle lent to a worker for the duration of one operation.
pub(crate) struct Checkout {
    pub id: FileId,
    pub stream: bool,
    pub handle: Box<dyn FileHandle>,
}

#[derive(Default)]
pub(crate) struct FileTable {
    files: Mutex<Arena<OpenFile>>,
}

impl FileTable {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Arena<OpenFile>> {
        self.files.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn insert(&self, uri: Uri, stream: bool, handle: Box<dyn FileHandle>) -> FileId {
        FileId(self.lock().insert(OpenFile {
            uri,
            stream,
            handle: Some(handle),
        }))
    }

    /// Take the handle out for exclusive use.
    pub fn checkout(&self, id: FileId) -> Result<Checkout, ErrorCode> {
        let mut files = self.lock();
        let file = files.get_mut(id.0).ok_or(ErrorCode::NotOpen)?;
        let handle = file.handle.take().ok_or(ErrorCode::InProgress)?;
        Ok(Checkout {
            id,
            stream: file.stream,
            handle,
        })
    }

    /// Return a checked-out handle to its slot.
    pub fn checkin(&self, checkout: Checkout) {
        if let Some(file) = self.lock().get_mut(checkout.id.0) {
            file.handle = Some(checkout.handle);
        }
    }

    /// Drop the slot of a checked-out handle, handing the handle back for closing.
    pub fn retire(&self, checkout: Checkout) -> Box<dyn FileHandle> {
        self.lock().remove(checkout.id.0);
        checkout.handle
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Close every handle that is not checked out.
    pub fn close_all(&self, ctx: &OpContext<'_>) {
        let drained = self.lock().drain();
        for (index, file) in drained {
            if let Some(handle) = file.handle {
                if let Err(code) = handle.close(ctx) {
                    tracing::warn!(
                        target: "avfs::scheduler",
                        file = %FileId(index),
                        uri = %file.uri,
                        ?code,
                        "close on shutdown failed"
                    );
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use avfs_core::{BackendResult, SeekPosition};

    use super::*;

    struct Null;

    impl FileHandle for Null {
        fn read(&mut self, _buf: &mut [u8], _ctx: &OpContext<'_>) -> BackendResult<usize> {
            Ok(0)
        }

        fn write(&mut self, data: &[u8], _ctx: &OpContext<'_>) -> BackendResult<usize> {
            Ok(data.len())
        }

        fn seek(&mut self, _: SeekPosition, _: i64, _ctx: &OpContext<'_>) -> BackendResult<u64> {
            Ok(0)
        }

        fn close(self: Box<Self>, _ctx: &OpContext<'_>) -> BackendResult<()> {
            Ok(())
        }
    }

    #[test]
    fn test_checkout_is_exclusive() {
        let table = FileTable::new();
        let id = table.insert(Uri::local("/tmp/x"), false, Box::new(Null));

        let checkout = table.checkout(id).unwrap();
        assert_eq!(table.checkout(id).err(), Some(ErrorCode::InProgress));
        table.checkin(checkout);
        assert!(table.checkout(id).is_ok());
    }

    #[test]
    fn test_retired_handle_is_not_open() {
        let table = FileTable::new();
        let id = table.insert(Uri::local("/tmp/x"), true, Box::new(Null));

        let checkout = table.checkout(id).unwrap();
        assert!(checkout.stream);
        let handle = table.retire(checkout);
        handle.close(&OpContext::detached()).unwrap();

        assert_eq!(table.checkout(id).err(), Some(ErrorCode::NotOpen));
        assert_eq!(table.len(), 0);
    }
}
