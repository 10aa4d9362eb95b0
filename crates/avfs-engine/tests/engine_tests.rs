use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use avfs_backend::MemoryBackend;
use avfs_core::{
    BackendRegistry, EngineConfig, ErrorCode, FindDirectoryKind, OpenMode, SeekPosition, Uri,
    VfsError,
};
use avfs_engine::{
    Context, FileId, JobHandle, JobState, MAX_READ_COUNT, NotificationResult, Operation,
    OperationKind, Outcome, OverwriteMode, TransferRequest, XferDecision, XferPhase, XferProgressInfo, XferStatus,
};
use serde_json::{Value, json};

type Results = Rc<RefCell<Vec<NotificationResult>>>;

fn mem(path: &str) -> Uri {
    MemoryBackend::uri(path)
}

fn engine(backend: &MemoryBackend, workers: usize) -> Context {
    let registry = BackendRegistry::new().with(Arc::new(backend.clone()));
    let config = EngineConfig {
        max_workers: workers,
        buffer_size: 16,
        progress_interval: Duration::ZERO,
        ..EngineConfig::default()
    };
    Context::new(registry, config).unwrap()
}

fn collector() -> (Results, impl Fn() -> Box<dyn FnOnce(NotificationResult)>) {
    let results: Results = Rc::default();
    let sink = Rc::clone(&results);
    let make = move || {
        let sink = Rc::clone(&sink);
        Box::new(move |result: NotificationResult| sink.borrow_mut().push(result))
            as Box<dyn FnOnce(NotificationResult)>
    };
    (results, make)
}

/// Submit one operation and wait for its result.
fn run(ctx: &mut Context, operation: Operation) -> NotificationResult {
    let slot: Rc<RefCell<Option<NotificationResult>>> = Rc::default();
    let sink = Rc::clone(&slot);
    ctx.submit(operation, 0, move |result| *sink.borrow_mut() = Some(result))
        .unwrap();
    ctx.wait_all_blocking();
    slot.borrow_mut().take().expect("result delivered")
}

fn opened(result: &NotificationResult) -> FileId {
    match &result.outcome {
        Ok(Outcome::Opened(file)) => *file,
        other => panic!("expected an open file, got {other:?}"),
    }
}

/// Occupy the only worker with a module callback that is answered on the
/// next drain.
fn block_worker(ctx: &mut Context, results: &Results) -> JobHandle {
    ctx.register_module_callback("block", |_| Ok(Value::Null));
    let sink = Rc::clone(results);
    let handle = ctx
        .submit(
            Operation::ModuleCallback {
                name: "block".into(),
                payload: Value::Null,
            },
            0,
            move |result| sink.borrow_mut().push(result),
        )
        .unwrap();
    while ctx.job_state(handle) != Some(JobState::Running) {
        thread::yield_now();
    }
    handle
}

#[test]
fn test_file_lifecycle() {
    let backend = MemoryBackend::new();
    backend.add_file("/a.txt", "hello world");
    let mut ctx = engine(&backend, 2);

    let result = run(
        &mut ctx,
        Operation::Open {
            uri: mem("/a.txt"),
            mode: OpenMode::read(),
        },
    );
    assert!(result.is_ok());
    assert_eq!(result.kind, OperationKind::Open);
    let file = opened(&result);
    assert_eq!(result.outcome.as_ref().ok().and_then(Outcome::file), Some(file));
    assert_eq!(ctx.open_files(), 1);

    let read = Operation::Read { file, count: 5 };
    assert_eq!(read.file(), Some(file));
    let result = run(&mut ctx, read);
    assert_eq!(result.outcome, Ok(Outcome::Read(b"hello".to_vec())));

    let result = run(
        &mut ctx,
        Operation::Seek {
            file,
            whence: SeekPosition::Start,
            offset: 6,
        },
    );
    assert_eq!(result.outcome, Ok(Outcome::Position(6)));

    let result = run(&mut ctx, Operation::Read { file, count: 100 });
    assert_eq!(result.outcome, Ok(Outcome::Read(b"world".to_vec())));

    let result = run(&mut ctx, Operation::Read { file, count: 100 });
    assert_eq!(result.error(), Some(ErrorCode::Eof));

    for count in [MAX_READ_COUNT + 1, usize::MAX] {
        let err = ctx
            .submit(Operation::Read { file, count }, 0, |_| panic!("never delivered"))
            .unwrap_err();
        assert!(matches!(err, VfsError::BadParameters { .. }));
    }
    assert_eq!(ctx.outstanding(), 0);

    let result = run(
        &mut ctx,
        Operation::FileControl {
            file,
            operation: "size".into(),
            data: Value::Null,
        },
    );
    assert_eq!(result.outcome, Ok(Outcome::Value(json!(11))));

    let result = run(&mut ctx, Operation::Close { file });
    assert_eq!(result.outcome, Ok(Outcome::Done));
    assert_eq!(ctx.open_files(), 0);

    let result = run(&mut ctx, Operation::Read { file, count: 1 });
    assert_eq!(result.error(), Some(ErrorCode::NotOpen));
}

#[test]
fn test_create_write_and_info() {
    let backend = MemoryBackend::new();
    let mut ctx = engine(&backend, 1);

    let result = run(
        &mut ctx,
        Operation::Create {
            uri: mem("/new.bin"),
            mode: OpenMode::write(),
            exclusive: true,
            permissions: 0o600,
        },
    );
    let file = opened(&result);

    let result = run(
        &mut ctx,
        Operation::Write {
            file,
            data: vec![1, 2, 3, 4],
        },
    );
    assert_eq!(result.outcome, Ok(Outcome::Written(4)));
    run(&mut ctx, Operation::Close { file });

    let result = run(
        &mut ctx,
        Operation::GetFileInfo {
            uri: mem("/new.bin"),
            follow_links: false,
        },
    );
    match result.outcome {
        Ok(Outcome::FileInfo(info)) => {
            assert_eq!(info.size, 4);
            assert_eq!(info.permissions, 0o600);
        }
        other => panic!("unexpected outcome {other:?}"),
    }

    let result = run(
        &mut ctx,
        Operation::Create {
            uri: mem("/new.bin"),
            mode: OpenMode::write(),
            exclusive: true,
            permissions: 0o600,
        },
    );
    assert_eq!(result.error(), Some(ErrorCode::FileExists));
}

#[test]
fn test_stream_handles_cannot_seek() {
    let backend = MemoryBackend::new();
    backend.add_file("/s", "stream");
    let mut ctx = engine(&backend, 1);

    let file = opened(&run(
        &mut ctx,
        Operation::OpenAsStream {
            uri: mem("/s"),
            mode: OpenMode::read(),
        },
    ));
    let result = run(
        &mut ctx,
        Operation::Seek {
            file,
            whence: SeekPosition::Current,
            offset: 1,
        },
    );
    assert_eq!(result.error(), Some(ErrorCode::NotSupported));
    assert_eq!(backend.stats().count("seek"), 0);
}

#[test]
fn test_directory_operations() {
    let backend = MemoryBackend::new();
    backend.add_file("/d/b", "").add_file("/d/a", "").add_symlink("/d/l", "a");
    let mut ctx = engine(&backend, 1);

    let result = run(
        &mut ctx,
        Operation::LoadDirectory {
            uri: mem("/d"),
            follow_links: false,
        },
    );
    let Ok(Outcome::Directory(entries)) = result.outcome else {
        panic!("expected a listing");
    };
    let names: Vec<&str> = entries.iter().map(|e| e.name.as_str()).collect();
    assert_eq!(names, vec!["a", "b", "l"]);

    let result = run(
        &mut ctx,
        Operation::CreateSymlink {
            uri: mem("/d/m"),
            target: "b".into(),
        },
    );
    assert_eq!(result.outcome, Ok(Outcome::Done));
    assert!(backend.info("/d/m").unwrap().is_symlink());

    let result = run(
        &mut ctx,
        Operation::FindDirectory {
            near: mem("/d"),
            kind: FindDirectoryKind::Trash,
            create_if_needed: true,
        },
    );
    assert_eq!(result.outcome, Ok(Outcome::FoundDirectory(mem("/.Trash"))));
}

#[test]
fn test_submit_rejects_malformed_requests() {
    let backend = MemoryBackend::new();
    let mut ctx = engine(&backend, 1);

    let err = ctx
        .submit(
            Operation::GetFileInfo {
                uri: mem("/x"),
                follow_links: false,
            },
            11,
            |_| panic!("never delivered"),
        )
        .unwrap_err();
    assert!(matches!(err, VfsError::BadParameters { .. }));

    let err = ctx
        .submit(
            Operation::GetFileInfo {
                uri: Uri::new("ftp", "/x"),
                follow_links: false,
            },
            0,
            |_| panic!("never delivered"),
        )
        .unwrap_err();
    assert!(matches!(err, VfsError::UnknownScheme { .. }));

    let err = ctx
        .transfer(
            TransferRequest::new(vec![mem("/a")], Vec::new()),
            0,
            |_| XferDecision::Continue,
            |_| panic!("never delivered"),
        )
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::BadParameters);

    assert_eq!(ctx.outstanding(), 0);
    assert_eq!(backend.stats().total_calls(), 0);
}

#[test]
fn test_higher_priority_runs_first() {
    let backend = MemoryBackend::new();
    backend.add_file("/f", "x");
    let mut ctx = engine(&backend, 1);
    let (results, _) = collector();
    block_worker(&mut ctx, &results);

    let order = Rc::new(RefCell::new(Vec::new()));
    for (label, priority) in [("low", -5), ("high", 5), ("mid-1", 0), ("mid-2", 0)] {
        let order = Rc::clone(&order);
        ctx.submit(
            Operation::GetFileInfo {
                uri: mem("/f"),
                follow_links: false,
            },
            priority,
            move |_| order.borrow_mut().push(label),
        )
        .unwrap();
    }
    assert_eq!(ctx.queued(), 4);
    ctx.wait_all_blocking();

    assert_eq!(*order.borrow(), vec!["high", "mid-1", "mid-2", "low"]);
    assert_eq!(results.borrow().len(), 1);
}

#[test]
fn test_cancel_before_dispatch_touches_no_backend() {
    let backend = MemoryBackend::new();
    backend.add_file("/f", "x");
    let mut ctx = engine(&backend, 1);
    let (results, make) = collector();
    block_worker(&mut ctx, &results);
    backend.reset_stats();

    let handle = ctx
        .submit(
            Operation::GetFileInfo {
                uri: mem("/f"),
                follow_links: false,
            },
            0,
            make(),
        )
        .unwrap();
    assert_eq!(ctx.job_state(handle), Some(JobState::Queued));
    assert!(ctx.cancel(handle));
    ctx.wait_all_blocking();

    let results = results.borrow();
    assert_eq!(results.len(), 2);
    let cancelled = results.iter().find(|r| r.job == handle).unwrap();
    assert!(cancelled.cancelled);
    assert_eq!(cancelled.outcome, Err(ErrorCode::Cancelled));
    assert_eq!(cancelled.kind, OperationKind::GetFileInfo);
    assert_eq!(backend.stats().count("get_file_info"), 0);

    // Delivered results can no longer be cancelled.
    assert!(!ctx.cancel(handle));
    assert_eq!(ctx.job_state(handle), None);
}

#[test]
fn test_every_job_reports_exactly_once() {
    let backend = MemoryBackend::new();
    for i in 0..20 {
        backend.add_file(format!("/f{i}"), vec![0u8; i]);
    }
    let mut ctx = engine(&backend, 4);
    let (results, make) = collector();

    let mut handles = Vec::new();
    for i in 0..60 {
        let handle = ctx
            .submit(
                Operation::GetFileInfo {
                    uri: mem(&format!("/f{}", i % 20)),
                    follow_links: false,
                },
                (i % 3) as i32 - 1,
                make(),
            )
            .unwrap();
        handles.push(handle);
    }
    let cancelled: Vec<JobHandle> = handles.iter().copied().step_by(2).collect();
    for handle in &cancelled {
        assert!(ctx.cancel(*handle));
    }
    ctx.wait_all_blocking();
    assert_eq!(ctx.outstanding(), 0);

    let mut seen: HashMap<JobHandle, usize> = HashMap::new();
    for result in results.borrow().iter() {
        *seen.entry(result.job).or_default() += 1;
        if cancelled.contains(&result.job) {
            assert!(result.cancelled);
        } else {
            assert!(result.is_ok());
        }
    }
    assert_eq!(seen.len(), handles.len());
    assert!(seen.values().all(|&n| n == 1));
}

#[test]
fn test_module_callbacks() {
    let backend = MemoryBackend::new();
    let mut ctx = engine(&backend, 2);
    ctx.register_module_callback("echo", |payload| Ok(json!({ "echo": payload })));

    let result = run(
        &mut ctx,
        Operation::ModuleCallback {
            name: "echo".into(),
            payload: json!(42),
        },
    );
    assert_eq!(result.outcome, Ok(Outcome::Value(json!({ "echo": 42 }))));

    let result = run(
        &mut ctx,
        Operation::ModuleCallback {
            name: "missing".into(),
            payload: Value::Null,
        },
    );
    assert_eq!(result.error(), Some(ErrorCode::NotSupported));

    assert!(ctx.unregister_module_callback("echo"));
    assert!(!ctx.unregister_module_callback("echo"));
}

#[test]
fn test_job_limit() {
    let backend = MemoryBackend::new();
    let mut ctx = engine(&backend, 2);
    assert_eq!(ctx.job_limit(), 2);

    assert!(matches!(
        ctx.set_job_limit(0),
        Err(VfsError::BadParameters { .. })
    ));
    ctx.set_job_limit(5).unwrap();
    assert_eq!(ctx.job_limit(), 5);
    ctx.set_job_limit(1).unwrap();
    assert_eq!(ctx.job_limit(), 1);

    backend.add_file("/f", "x");
    let result = run(
        &mut ctx,
        Operation::GetFileInfo {
            uri: mem("/f"),
            follow_links: false,
        },
    );
    assert!(result.is_ok());
}

#[test]
fn test_transfer_reports_progress_and_summary() {
    let backend = MemoryBackend::new();
    backend
        .add_file("/src/a", vec![1u8; 40])
        .add_file("/src/b", vec![2u8; 40])
        .add_file("/dst/src/a", "old");
    let mut ctx = engine(&backend, 2);

    let mut request = TransferRequest::new(vec![mem("/src")], vec![mem("/dst/src")]);
    request.options.recursive = true;

    let events: Rc<RefCell<Vec<XferProgressInfo>>> = Rc::default();
    let (results, make) = collector();
    let sink = Rc::clone(&events);
    ctx.transfer(
        request,
        0,
        move |info| {
            sink.borrow_mut().push(info.clone());
            match info.status {
                XferStatus::NeedsOverwriteDecision => XferDecision::Replace,
                _ => XferDecision::Continue,
            }
        },
        make(),
    )
    .unwrap();
    ctx.wait_all_blocking();

    let results = results.borrow();
    assert_eq!(results.len(), 1);
    let Ok(Outcome::Transferred(summary)) = &results[0].outcome else {
        panic!("expected a transfer summary");
    };
    assert_eq!(summary.files_transferred, 2);
    assert_eq!(summary.bytes_written, 80);
    assert_eq!(backend.read_file("/dst/src/a").unwrap(), vec![1u8; 40]);

    let events = events.borrow();
    let queries = events.iter().filter(|e| e.is_query()).count();
    assert_eq!(queries, 1);
    assert_eq!(
        events.iter().filter(|e| e.phase == XferPhase::FileCompleted).count(),
        2
    );
    assert_eq!(events.last().unwrap().phase, XferPhase::Completed);
}

#[test]
fn test_transfer_queries_abort_without_progress_callback() {
    let backend = MemoryBackend::new();
    backend.add_file("/a", "new").add_file("/b", "old");
    let mut ctx = engine(&backend, 1);

    let request = TransferRequest::new(vec![mem("/a")], vec![mem("/b")])
        .with_overwrite_mode(OverwriteMode::Query);
    let result = run(&mut ctx, Operation::Transfer(Box::new(request)));

    assert_eq!(result.error(), Some(ErrorCode::Interrupted));
    assert_eq!(backend.read_file("/b").unwrap(), b"old");
}

#[test]
fn test_progress_abort_cancels_running_transfer() {
    let backend = MemoryBackend::new();
    backend.add_file("/big", vec![7u8; 64 * 1024]);
    let registry = BackendRegistry::new().with(Arc::new(backend.clone()));
    let config = EngineConfig {
        max_workers: 1,
        channel_capacity: 1,
        buffer_size: 16,
        progress_interval: Duration::ZERO,
        ..EngineConfig::default()
    };
    let mut ctx = Context::new(registry, config).unwrap();
    let (results, make) = collector();

    let request = TransferRequest::new(vec![mem("/big")], vec![mem("/copy")]);
    ctx.transfer(
        request,
        0,
        |info| {
            if info.phase == XferPhase::Copying && info.bytes_copied > 0 {
                XferDecision::Abort
            } else {
                XferDecision::Continue
            }
        },
        make(),
    )
    .unwrap();
    ctx.wait_all_blocking();

    let results = results.borrow();
    assert_eq!(results.len(), 1);
    assert!(results[0].cancelled);
    assert_eq!(results[0].error(), Some(ErrorCode::Cancelled));
    assert!(!backend.exists("/copy"));
}

#[test]
fn test_shutdown_delivers_cancelled_results() {
    let backend = MemoryBackend::new();
    backend.add_file("/f", "x");
    let mut ctx = engine(&backend, 1);
    let (results, make) = collector();
    block_worker(&mut ctx, &results);

    for _ in 0..3 {
        ctx.submit(
            Operation::GetFileInfo {
                uri: mem("/f"),
                follow_links: false,
            },
            0,
            make(),
        )
        .unwrap();
    }
    ctx.shutdown();

    let results = results.borrow();
    assert_eq!(results.len(), 4);
    assert!(results.iter().all(|r| r.cancelled));
    assert_eq!(backend.stats().count("get_file_info"), 0);
}

#[test]
fn test_drop_closes_open_files() {
    let backend = MemoryBackend::new();
    backend.add_file("/a", "x").add_file("/b", "y");
    let mut ctx = engine(&backend, 2);

    for path in ["/a", "/b"] {
        run(
            &mut ctx,
            Operation::Open {
                uri: mem(path),
                mode: OpenMode::read(),
            },
        );
    }
    assert_eq!(ctx.open_files(), 2);
    drop(ctx);

    assert_eq!(backend.stats().count("close"), 2);
}

#[tokio::test]
async fn test_async_wait() {
    let backend = MemoryBackend::new();
    backend.add_file("/f", "abc");
    let mut ctx = engine(&backend, 2);
    let (results, make) = collector();

    for _ in 0..5 {
        ctx.submit(
            Operation::GetFileInfo {
                uri: mem("/f"),
                follow_links: false,
            },
            0,
            make(),
        )
        .unwrap();
    }
    ctx.wait_all().await;

    assert_eq!(results.borrow().len(), 5);
    assert!(results.borrow().iter().all(NotificationResult::is_ok));
    assert_eq!(ctx.wait().await, 0);
}
