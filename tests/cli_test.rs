//! Command-line behaviour of the `p2pfs` binary

use assert_cmd::Command;
use predicates::prelude::*;
use std::path::Path;

fn p2pfs(data_dir: &Path) -> Command {
    let mut cmd = Command::cargo_bin("p2pfs").unwrap();
    cmd.arg("--data-dir").arg(data_dir).arg("--log-level").arg("warn");
    cmd
}

fn add(data_dir: &Path, file: &Path) -> String {
    let output = p2pfs(data_dir).arg("add").arg(file).output().unwrap();
    assert!(output.status.success());
    String::from_utf8(output.stdout).unwrap().trim().to_string()
}

#[test]
fn test_help_lists_commands() {
    Command::cargo_bin("p2pfs")
        .unwrap()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("fetch"))
        .stdout(predicate::str::contains("pin"));
}

#[test]
fn test_add_then_cat() {
    let dir = tempfile::tempdir().unwrap();
    let file = dir.path().join("hello.txt");
    std::fs::write(&file, "hello world").unwrap();

    let cid = add(&dir.path().join("data"), &file);
    assert!(cid.starts_with("bafk"));

    p2pfs(&dir.path().join("data"))
        .arg("cat")
        .arg(&cid)
        .assert()
        .success()
        .stdout("hello world");
}

#[test]
fn test_files_and_ls() {
    let dir = tempfile::tempdir().unwrap();
    let data = dir.path().join("data");
    let file = dir.path().join("notes.txt");
    std::fs::write(&file, "some notes").unwrap();
    let cid = add(&data, &file);

    p2pfs(&data)
        .arg("files")
        .assert()
        .success()
        .stdout(predicate::str::contains(cid.as_str()).and(predicate::str::contains("notes.txt")));

    // Raw blocks have no links
    p2pfs(&data).arg("ls").arg(&cid).assert().success().stdout("");
}

#[test]
fn test_get_writes_output_file() {
    let dir = tempfile::tempdir().unwrap();
    let data = dir.path().join("data");
    let file = dir.path().join("in.bin");
    let out = dir.path().join("out.bin");
    std::fs::write(&file, [0u8, 1, 2, 3, 255]).unwrap();
    let cid = add(&data, &file);

    p2pfs(&data)
        .arg("get")
        .arg(&cid)
        .arg(&out)
        .assert()
        .success()
        .stdout(predicate::str::starts_with("Saved"));
    assert_eq!(std::fs::read(&out).unwrap(), vec![0u8, 1, 2, 3, 255]);
}

#[test]
fn test_invalid_cid_fails() {
    let dir = tempfile::tempdir().unwrap();
    p2pfs(dir.path())
        .arg("cat")
        .arg("not-a-cid")
        .assert()
        .failure()
        .stderr(predicate::str::contains("Invalid CID"));
}

#[test]
fn test_missing_block_fails() {
    let dir = tempfile::tempdir().unwrap();
    let cid = p2pfs_core::block_cid(b"absent").unwrap().to_string();

    p2pfs(dir.path())
        .arg("cat")
        .arg(&cid)
        .assert()
        .failure()
        .stderr(predicate::str::contains("Not found"));
}

#[test]
fn test_add_missing_file_fails() {
    let dir = tempfile::tempdir().unwrap();
    p2pfs(dir.path())
        .arg("add")
        .arg(dir.path().join("nope.txt"))
        .assert()
        .failure();
}
