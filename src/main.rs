//! avfs - copy, move, link and delete files through the avfs job engine.
//!
//! Usage:
//!   avfs copy SRC... DEST    Copy files or trees
//!   avfs move SRC... DEST    Move files or trees
//!   avfs link SRC... DEST    Create symlinks to the sources
//!   avfs delete PATH...      Remove files or trees
//!   avfs ls PATH             List a directory
//!   avfs stat PATH           Show file metadata
//!   avfs cat PATH            Print a file
//!   avfs --help              Show help

use std::cell::RefCell;
use std::io::Write;
use std::path::{self, PathBuf};
use std::rc::Rc;

use chrono::{DateTime, Local};
use clap::{Args, Parser, Subcommand};
use color_eyre::eyre::{Result, WrapErr, bail, eyre};
use dialoguer::{Input, Select};
use tracing_subscriber::EnvFilter;

use avfs_backend::default_registry;
use avfs_core::{EngineConfig, ErrorCode, FileInfo, FileType, OpenMode, Uri};
use avfs_engine::{
    Context, ErrorMode, NotificationResult, Operation, Outcome, OverwriteMode, TransferMode,
    TransferRequest, XferDecision, XferOptions, XferPhase, XferProgressInfo, XferStatus,
    XferSummary,
};

#[derive(Parser)]
#[command(
    name = "avfs",
    version,
    about = "File operations through an asynchronous VFS job engine",
    long_about = "avfs runs copies, moves, links and deletes as prioritized jobs on a \
                  worker pool.\n\nConflicts and errors are resolved interactively \
                  unless a policy is given on the command line."
)]
struct Cli {
    /// Number of worker threads
    #[arg(short, long, global = true)]
    jobs: Option<usize>,

    /// Engine configuration file (JSON)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Copy files or directory trees
    Copy(TransferArgs),

    /// Move files or directory trees
    Move(TransferArgs),

    /// Create symlinks pointing at the sources
    Link(TransferArgs),

    /// Remove files or directory trees
    Delete {
        /// Paths to remove
        #[arg(required = true)]
        paths: Vec<String>,

        /// Remove directories and their contents
        #[arg(short, long)]
        recursive: bool,
    },

    /// List a directory
    Ls {
        /// Directory to list
        path: String,

        /// Output JSON instead of a table
        #[arg(long)]
        json: bool,
    },

    /// Show file metadata
    Stat {
        /// File to inspect
        path: String,

        /// Output JSON instead of text
        #[arg(long)]
        json: bool,

        /// Describe the target of a symlink rather than the link
        #[arg(short = 'L', long)]
        follow: bool,
    },

    /// Print a file to stdout
    Cat {
        /// File to print
        path: String,
    },
}

#[derive(Args)]
struct TransferArgs {
    /// Sources followed by the destination
    #[arg(required = true, num_args = 2..)]
    paths: Vec<String>,

    /// Descend into directories
    #[arg(short, long)]
    recursive: bool,

    /// What to do when a target exists (query, replace, skip, abort, rename)
    #[arg(long, default_value = "query")]
    overwrite: OverwriteMode,

    /// What to do when a file operation fails (abort, query)
    #[arg(long, default_value = "abort")]
    on_error: ErrorMode,

    /// Offer alternative names for clashing targets
    #[arg(long)]
    unique_names: bool,

    /// Leave the default permissions on created files
    #[arg(long)]
    default_perms: bool,

    /// Move by renaming when source and destination share a filesystem
    #[arg(long, default_value_t = true, action = clap::ArgAction::Set)]
    same_fs: bool,

    /// Copy what symlinks point to instead of the links
    #[arg(short = 'L', long)]
    follow_links: bool,
}

fn main() -> Result<()> {
    color_eyre::install()?;
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = load_config(&cli)?;
    let mut ctx = Context::new(default_registry(), config)?;

    let result = match cli.command {
        Command::Copy(args) => run_transfer(&mut ctx, TransferMode::Copy, args),
        Command::Move(args) => run_transfer(&mut ctx, TransferMode::Move, args),
        Command::Link(args) => run_transfer(&mut ctx, TransferMode::Link, args),
        Command::Delete { paths, recursive } => run_delete(&mut ctx, &paths, recursive),
        Command::Ls { path, json } => run_ls(&mut ctx, &path, json),
        Command::Stat { path, json, follow } => run_stat(&mut ctx, &path, json, follow),
        Command::Cat { path } => run_cat(&mut ctx, &path),
    };

    ctx.shutdown();
    result
}

fn load_config(cli: &Cli) -> Result<EngineConfig> {
    let mut config = match &cli.config {
        Some(path) => {
            let text = std::fs::read_to_string(path)
                .wrap_err_with(|| format!("Failed to read {}", path.display()))?;
            serde_json::from_str(&text)
                .wrap_err_with(|| format!("Invalid configuration in {}", path.display()))?
        }
        None => EngineConfig::default(),
    };
    if let Some(jobs) = cli.jobs {
        config.max_workers = jobs;
    }
    Ok(config)
}

/// Accept `scheme:///path` URIs and plain paths, relative ones included.
fn parse_uri(arg: &str) -> Result<Uri> {
    if arg.contains("://") {
        return Ok(Uri::parse(arg)?);
    }
    let path = path::absolute(arg).wrap_err_with(|| format!("Invalid path: {arg}"))?;
    Ok(Uri::local(path))
}

fn parse_uris(args: &[String]) -> Result<Vec<Uri>> {
    args.iter().map(|arg| parse_uri(arg)).collect()
}

/// Run one job to completion and hand back its result.
fn run(ctx: &mut Context, operation: Operation) -> Result<NotificationResult> {
    let slot = Rc::new(RefCell::new(None));
    let sink = Rc::clone(&slot);
    let priority = ctx.config().default_priority;
    ctx.submit(operation, priority, move |result| {
        *sink.borrow_mut() = Some(result);
    })?;
    ctx.wait_all_blocking();
    take_result(&slot)
}

fn take_result(slot: &RefCell<Option<NotificationResult>>) -> Result<NotificationResult> {
    let result = slot
        .borrow_mut()
        .take()
        .ok_or_else(|| eyre!("Job finished without a result"))?;
    if result.cancelled {
        bail!("{} was cancelled", result.kind);
    }
    Ok(result)
}

fn is_directory(ctx: &mut Context, uri: &Uri) -> Result<bool> {
    let result = run(
        ctx,
        Operation::GetFileInfo {
            uri: uri.clone(),
            follow_links: true,
        },
    )?;
    Ok(matches!(result.outcome, Ok(Outcome::FileInfo(info)) if info.is_dir()))
}

fn run_transfer(ctx: &mut Context, mode: TransferMode, args: TransferArgs) -> Result<()> {
    let mut uris = parse_uris(&args.paths)?;
    let Some(mut dest) = uris.pop() else {
        bail!("{mode} needs a source and a destination");
    };
    // A lone source dropped into an existing directory lands inside it.
    if uris.len() == 1 && is_directory(ctx, &dest)? {
        if let Some(name) = uris[0].file_name() {
            dest = dest.join(name);
        }
    }

    let options = XferOptions::builder()
        .mode(mode)
        .recursive(args.recursive)
        .follow_links(args.follow_links)
        .same_fs(args.same_fs)
        .use_unique_names(args.unique_names)
        .target_default_perms(args.default_perms)
        .build()?;
    let request = TransferRequest::new(uris, vec![dest])
        .with_options(options)
        .with_error_mode(args.on_error)
        .with_overwrite_mode(args.overwrite);

    let summary = transfer(ctx, request)?;
    print_summary(mode, &summary);
    Ok(())
}

fn run_delete(ctx: &mut Context, paths: &[String], recursive: bool) -> Result<()> {
    let options = XferOptions::builder()
        .mode(TransferMode::Delete)
        .recursive(recursive)
        .build()?;
    let request = TransferRequest::delete(parse_uris(paths)?).with_options(options);

    let summary = transfer(ctx, request)?;
    print_summary(TransferMode::Delete, &summary);
    Ok(())
}

fn transfer(ctx: &mut Context, request: TransferRequest) -> Result<XferSummary> {
    let mode = request.options.mode;
    let slot = Rc::new(RefCell::new(None));
    let sink = Rc::clone(&slot);
    let priority = ctx.config().default_priority;
    ctx.transfer(request, priority, on_progress, move |result| {
        *sink.borrow_mut() = Some(result);
    })?;
    ctx.wait_all_blocking();

    match take_result(&slot)?.outcome {
        Ok(Outcome::Transferred(summary)) => Ok(summary),
        Ok(other) => bail!("Unexpected {mode} result: {other:?}"),
        Err(code) => Err(code).wrap_err_with(|| format!("{mode} failed")),
    }
}

fn on_progress(info: &XferProgressInfo) -> XferDecision {
    if !info.is_query() {
        if info.phase == XferPhase::FileCompleted {
            report_file(info);
        }
        return XferDecision::Continue;
    }
    match ask(info) {
        Ok(decision) => decision,
        Err(err) => {
            tracing::warn!(%err, "no answer to transfer query, aborting");
            XferDecision::Abort
        }
    }
}

fn report_file(info: &XferProgressInfo) {
    let name = info
        .target_name
        .as_deref()
        .or(info.source_name.as_deref())
        .unwrap_or_default();
    eprintln!(
        "[{}/{}] {:5.1}% {} ({})",
        info.file_index,
        info.files_total,
        info.percentage(),
        name,
        format_size(info.file_size)
    );
    if let Some(code) = info.warning {
        eprintln!("  warning: {code}");
    }
}

fn ask(info: &XferProgressInfo) -> Result<XferDecision> {
    let source = info.source_name.as_deref().unwrap_or_default();
    let target = info.target_name.as_deref().unwrap_or_default();

    let decision = match info.status {
        XferStatus::Ok => XferDecision::Continue,
        XferStatus::NeedsOverwriteDecision => {
            let choice = Select::new()
                .with_prompt(format!("{target} already exists"))
                .items(&["Replace", "Replace all", "Skip", "Skip all", "Keep both", "Abort"])
                .default(0)
                .interact()?;
            match choice {
                0 => XferDecision::Replace,
                1 => XferDecision::ReplaceAll,
                2 => XferDecision::Skip,
                3 => XferDecision::SkipAll,
                4 => XferDecision::RenameUnique,
                _ => XferDecision::Abort,
            }
        }
        XferStatus::BackendError => {
            let code = info.vfs_status.unwrap_or(ErrorCode::Generic);
            let choice = Select::new()
                .with_prompt(format!("{code} at {} of {source}", info.phase))
                .items(&["Retry", "Skip", "Skip all", "Abort"])
                .default(0)
                .interact()?;
            match choice {
                0 => XferDecision::Retry,
                1 => XferDecision::Skip,
                2 => XferDecision::SkipAll,
                _ => XferDecision::Abort,
            }
        }
        XferStatus::NeedsDuplicateNameDecision => {
            let candidate = info.duplicate_name.as_deref().unwrap_or(target);
            let items = [
                format!("Use {candidate}"),
                "Try the next name".to_string(),
                "Enter a name".to_string(),
                "Skip".to_string(),
                "Abort".to_string(),
            ];
            let choice = Select::new()
                .with_prompt(format!("{target} already exists"))
                .items(&items)
                .default(0)
                .interact()?;
            match choice {
                0 => XferDecision::Continue,
                1 => XferDecision::NextCandidate,
                2 => {
                    let name: String = Input::new().with_prompt("New name").interact_text()?;
                    XferDecision::UseName(name.into())
                }
                3 => XferDecision::Skip,
                _ => XferDecision::Abort,
            }
        }
    };
    Ok(decision)
}

fn print_summary(mode: TransferMode, summary: &XferSummary) {
    println!(
        "{mode}: {} file(s) done, {} skipped, {} written",
        summary.files_transferred,
        summary.files_skipped,
        format_size(summary.bytes_written)
    );
    for (target, code) in &summary.warnings {
        println!("  warning: {target}: {code}");
    }
}

fn run_ls(ctx: &mut Context, path: &str, json: bool) -> Result<()> {
    let uri = parse_uri(path)?;
    let result = run(
        ctx,
        Operation::LoadDirectory {
            uri: uri.clone(),
            follow_links: false,
        },
    )?;
    let mut entries = match result.outcome {
        Ok(Outcome::Directory(entries)) => entries,
        Ok(other) => bail!("Unexpected listing result: {other:?}"),
        Err(code) => return Err(code).wrap_err_with(|| format!("Cannot list {uri}")),
    };
    entries.sort_by(|a, b| a.name.cmp(&b.name));

    if json {
        println!("{}", serde_json::to_string_pretty(&entries)?);
        return Ok(());
    }

    for entry in &entries {
        let mut line = format!(
            "{} {:>10} {} {}",
            mode_string(entry),
            format_size(entry.size),
            format_time(entry),
            entry.name
        );
        if let Some(target) = &entry.symlink_target {
            line.push_str(" -> ");
            line.push_str(target);
        }
        println!("{line}");
    }
    Ok(())
}

fn run_stat(ctx: &mut Context, path: &str, json: bool, follow: bool) -> Result<()> {
    let uri = parse_uri(path)?;
    let result = run(
        ctx,
        Operation::GetFileInfo {
            uri: uri.clone(),
            follow_links: follow,
        },
    )?;
    let info = match result.outcome {
        Ok(Outcome::FileInfo(info)) => info,
        Ok(other) => bail!("Unexpected stat result: {other:?}"),
        Err(code) => return Err(code).wrap_err_with(|| format!("Cannot stat {uri}")),
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&info)?);
        return Ok(());
    }

    println!("    Name: {}", info.name);
    println!("    Type: {}", info.file_type);
    println!("    Size: {} ({} bytes)", format_size(info.size), info.size);
    println!(
        "   Perms: {:04o} ({})",
        info.permissions & 0o7777,
        mode_string(&info)
    );
    println!("   Owner: {}:{}", info.uid, info.gid);
    println!("Modified: {}", format_time(&info));
    println!(
        "Accessed: {}",
        DateTime::<Local>::from(info.accessed).format("%Y-%m-%d %H:%M:%S")
    );
    println!("  Device: {}  Inode: {}", info.device, info.inode);
    if let Some(target) = &info.symlink_target {
        println!("    Link: {target}");
    }
    Ok(())
}

fn run_cat(ctx: &mut Context, path: &str) -> Result<()> {
    let uri = parse_uri(path)?;
    let opened = run(
        ctx,
        Operation::OpenAsStream {
            uri: uri.clone(),
            mode: OpenMode::read().sequential(),
        },
    )?;
    let file = match opened.outcome {
        Ok(Outcome::Opened(file)) => file,
        Ok(other) => bail!("Unexpected open result: {other:?}"),
        Err(code) => return Err(code).wrap_err_with(|| format!("Cannot open {uri}")),
    };

    let count = ctx.config().buffer_size;
    let mut stdout = std::io::stdout().lock();
    let copied = loop {
        let result = run(ctx, Operation::Read { file, count })?;
        match result.outcome {
            Ok(Outcome::Read(data)) => stdout.write_all(&data)?,
            Err(ErrorCode::Eof) => break Ok(()),
            Ok(other) => break Err(eyre!("Unexpected read result: {other:?}")),
            Err(code) => break Err(code).wrap_err_with(|| format!("Cannot read {uri}")),
        }
    };
    stdout.flush()?;

    run(ctx, Operation::Close { file })?;
    copied
}

fn mode_string(info: &FileInfo) -> String {
    let kind = match info.file_type {
        FileType::Directory => 'd',
        FileType::Symlink => 'l',
        _ => '-',
    };
    let mut out = String::with_capacity(10);
    out.push(kind);
    for shift in [6, 3, 0] {
        let bits = (info.permissions >> shift) & 0o7;
        out.push(if bits & 0o4 != 0 { 'r' } else { '-' });
        out.push(if bits & 0o2 != 0 { 'w' } else { '-' });
        out.push(if bits & 0o1 != 0 { 'x' } else { '-' });
    }
    out
}

fn format_time(info: &FileInfo) -> String {
    DateTime::<Local>::from(info.modified)
        .format("%Y-%m-%d %H:%M")
        .to_string()
}

fn format_size(bytes: u64) -> String {
    humansize::format_size(bytes, humansize::BINARY)
}
