use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::process::Command;

fn nar() -> Command {
    let mut cmd = Command::new(env!("CARGO_BIN_EXE_nar"));
    cmd.env("NAR_USE_CASE_HACK", "0");
    cmd
}

// Dump a tree, restore it somewhere else and make sure both are equal.
#[test]
fn nar_dump_and_restore() {
    let dir = tempfile::tempdir().unwrap();
    let src = dir.path().join("src");
    fs::create_dir_all(src.join("sub")).unwrap();
    fs::write(src.join("hello"), b"hello world\n").unwrap();
    fs::write(src.join("sub/run"), b"#!/bin/sh\n").unwrap();
    fs::set_permissions(src.join("sub/run"), fs::Permissions::from_mode(0o755)).unwrap();
    fs::write(src.join("skip.tmp"), b"junk").unwrap();
    std::os::unix::fs::symlink("hello", src.join("link")).unwrap();

    let archive = dir.path().join("tree.nar");
    let status = nar()
        .arg("dump")
        .arg(&src)
        .arg(&archive)
        .arg("--exclude")
        .arg("*.tmp")
        .status()
        .unwrap();
    assert!(status.success());

    let dest = dir.path().join("dest");
    let status = nar()
        .arg("restore")
        .arg(&archive)
        .arg(&dest)
        .status()
        .unwrap();
    assert!(status.success());

    assert_eq!(fs::read(dest.join("hello")).unwrap(), b"hello world\n");
    assert_eq!(fs::read_link(dest.join("link")).unwrap().to_str(), Some("hello"));
    let mode = fs::metadata(dest.join("sub/run")).unwrap().permissions().mode();
    assert_eq!(mode & 0o111, 0o111);
    assert!(!dest.join("skip.tmp").exists());

    // the target exists now
    let status = nar()
        .arg("restore")
        .arg(&archive)
        .arg(&dest)
        .status()
        .unwrap();
    assert!(!status.success());

    let output = nar()
        .arg("cat")
        .arg(&archive)
        .arg("/sub/run")
        .output()
        .unwrap();
    assert!(output.status.success());
    assert_eq!(output.stdout, b"#!/bin/sh\n");

    let copy = dir.path().join("copy.nar");
    let status = nar()
        .arg("copy")
        .arg(&archive)
        .arg(&copy)
        .status()
        .unwrap();
    assert!(status.success());
    assert_eq!(fs::read(&copy).unwrap(), fs::read(&archive).unwrap());

    let output = nar()
        .arg("list")
        .arg(&archive)
        .arg("--json")
        .output()
        .unwrap();
    assert!(output.status.success());
    let listing: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(listing["entries"]["sub"]["entries"]["run"]["executable"], true);
}
