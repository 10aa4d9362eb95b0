use std::fs;

use avfs_backend::{LocalBackend, MemoryBackend, default_registry};
use avfs_core::{Backend, ErrorCode, FindDirectoryKind, OpContext, OpenMode, Uri};
use tempfile::TempDir;

/// Run the same create/list/rename/remove sequence against any backend.
fn exercise(backend: &dyn Backend, root: &Uri) {
    let ctx = OpContext::detached();

    backend.make_directory(&root.join("dir"), 0o755, &ctx).unwrap();
    assert_eq!(
        backend.make_directory(&root.join("dir"), 0o755, &ctx),
        Err(ErrorCode::FileExists)
    );

    let file = root.join("dir/data.bin");
    let mut handle = backend
        .create(&file, OpenMode::write(), true, 0o644, &ctx)
        .unwrap();
    handle.write(&[7u8; 100], &ctx).unwrap();
    handle.close(&ctx).unwrap();

    let info = backend.get_file_info(&file, false, &ctx).unwrap();
    assert_eq!(info.size, 100);
    assert_eq!(info.name, "data.bin");

    let listing = backend.load_directory(&root.join("dir"), false, &ctx).unwrap();
    assert_eq!(listing.len(), 1);

    let renamed = root.join("dir/renamed.bin");
    backend.rename(&file, &renamed, &ctx).unwrap();
    assert_eq!(backend.exists(&file, &ctx), Ok(false));
    assert_eq!(backend.exists(&renamed, &ctx), Ok(true));
    assert!(backend.same_fs(&renamed, &root.join("elsewhere"), &ctx).unwrap());

    assert_eq!(
        backend.remove(&root.join("dir"), &ctx),
        Err(ErrorCode::DirectoryNotEmpty)
    );
    backend.remove(&renamed, &ctx).unwrap();
    backend.remove(&root.join("dir"), &ctx).unwrap();
    assert_eq!(
        backend.get_file_info(&root.join("dir"), false, &ctx),
        Err(ErrorCode::NotFound)
    );
}

#[test]
fn test_local_backend_contract() {
    let temp = TempDir::new().unwrap();
    exercise(&LocalBackend::new(), &Uri::local(temp.path()));
}

#[test]
fn test_memory_backend_contract() {
    let backend = MemoryBackend::new();
    backend.add_dir("/root");
    exercise(&backend, &MemoryBackend::uri("/root"));
}

#[test]
fn test_memory_find_directory() {
    let backend = MemoryBackend::new();
    let ctx = OpContext::detached();
    let near = MemoryBackend::uri("/");

    assert_eq!(
        backend.find_directory(&near, FindDirectoryKind::Trash, false, &ctx),
        Err(ErrorCode::NotFound)
    );
    let trash = backend
        .find_directory(&near, FindDirectoryKind::Trash, true, &ctx)
        .unwrap();
    assert_eq!(trash.to_string(), "mem:///.Trash");
    assert!(backend.exists("/.Trash"));
}

#[test]
fn test_default_registry_serves_local_paths() {
    let temp = TempDir::new().unwrap();
    fs::write(temp.path().join("x"), "xyz").unwrap();

    let registry = default_registry();
    let uri = Uri::local(temp.path().join("x"));
    let backend = registry.resolve(&uri).unwrap();
    let info = backend
        .get_file_info(&uri, false, &OpContext::detached())
        .unwrap();
    assert_eq!(info.size, 3);
    assert!(registry.resolve(&MemoryBackend::uri("/x")).is_err());
}
