use std::fs;
use std::path::Path;
use std::process::{Command, Output, Stdio};

use tempfile::TempDir;

fn avfs(args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_avfs"))
        .args(args)
        .stdin(Stdio::null())
        .output()
        .unwrap()
}

fn path(dir: &TempDir, name: &str) -> String {
    dir.path().join(name).to_string_lossy().into_owned()
}

fn tree(root: &Path) {
    fs::create_dir_all(root.join("src/nested")).unwrap();
    fs::write(root.join("src/a.txt"), b"alpha").unwrap();
    fs::write(root.join("src/nested/b.txt"), b"bravo").unwrap();
}

#[test]
fn test_copy_tree_then_list() {
    let dir = TempDir::new().unwrap();
    tree(dir.path());

    let out = avfs(&["copy", "-r", &path(&dir, "src"), &path(&dir, "dst")]);
    assert!(out.status.success(), "{}", String::from_utf8_lossy(&out.stderr));
    assert_eq!(fs::read(dir.path().join("dst/nested/b.txt")).unwrap(), b"bravo");
    assert!(dir.path().join("src/a.txt").exists());

    let out = avfs(&["ls", "--json", &path(&dir, "dst")]);
    assert!(out.status.success());
    let entries: serde_json::Value = serde_json::from_slice(&out.stdout).unwrap();
    let names: Vec<&str> = entries
        .as_array()
        .unwrap()
        .iter()
        .map(|e| e["name"].as_str().unwrap())
        .collect();
    assert_eq!(names, ["a.txt", "nested"]);
}

#[test]
fn test_copy_into_existing_directory() {
    let dir = TempDir::new().unwrap();
    tree(dir.path());
    fs::create_dir(dir.path().join("into")).unwrap();

    let out = avfs(&["copy", &path(&dir, "src/a.txt"), &path(&dir, "into")]);
    assert!(out.status.success());
    assert_eq!(fs::read(dir.path().join("into/a.txt")).unwrap(), b"alpha");
}

#[test]
fn test_conflict_without_terminal_aborts() {
    let dir = TempDir::new().unwrap();
    tree(dir.path());
    fs::write(dir.path().join("taken.txt"), b"old").unwrap();

    let out = avfs(&["copy", &path(&dir, "src/a.txt"), &path(&dir, "taken.txt")]);
    assert!(!out.status.success());
    assert_eq!(fs::read(dir.path().join("taken.txt")).unwrap(), b"old");

    let out = avfs(&[
        "copy",
        "--overwrite",
        "replace",
        &path(&dir, "src/a.txt"),
        &path(&dir, "taken.txt"),
    ]);
    assert!(out.status.success());
    assert_eq!(fs::read(dir.path().join("taken.txt")).unwrap(), b"alpha");
}

#[test]
fn test_move_and_delete() {
    let dir = TempDir::new().unwrap();
    tree(dir.path());

    let out = avfs(&["move", &path(&dir, "src"), &path(&dir, "moved")]);
    assert!(out.status.success());
    assert!(!dir.path().join("src").exists());
    assert!(dir.path().join("moved/nested/b.txt").exists());

    let out = avfs(&["delete", &path(&dir, "moved")]);
    assert!(!out.status.success());

    let out = avfs(&["delete", "-r", &path(&dir, "moved")]);
    assert!(out.status.success());
    assert!(!dir.path().join("moved").exists());
}

#[test]
fn test_cat_and_stat() {
    let dir = TempDir::new().unwrap();
    tree(dir.path());

    let out = avfs(&["cat", &path(&dir, "src/a.txt")]);
    assert!(out.status.success());
    assert_eq!(out.stdout, b"alpha");

    let out = avfs(&["stat", "--json", &path(&dir, "src/a.txt")]);
    assert!(out.status.success());
    let info: serde_json::Value = serde_json::from_slice(&out.stdout).unwrap();
    assert_eq!(info["size"], 5);
    assert_eq!(info["file_type"], "Regular");

    let out = avfs(&["cat", &path(&dir, "missing")]);
    assert!(!out.status.success());
}
