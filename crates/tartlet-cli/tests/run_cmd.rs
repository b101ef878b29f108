//! End-to-end checks of the run command's validation and locking phases.
//!
//! Everything up to device assembly is host-independent, so these tests
//! drive the real binary against a scratch VM home directory.

use std::fs::File;
use std::path::Path;
use std::process::{Command, Output};

use tartlet_core::lock::FileLock;

fn tartlet() -> Command {
    Command::new(env!("CARGO_BIN_EXE_tartlet"))
}

fn write_vm(home: &Path, name: &str, mac: &str) {
    let dir = home.join(name);
    std::fs::create_dir_all(&dir).unwrap();
    let config = format!(
        r#"{{
            "version": 1,
            "os": "linux",
            "arch": "arm64",
            "cpuCount": 2,
            "memorySize": 1073741824,
            "macAddress": "{mac}"
        }}"#
    );
    std::fs::write(dir.join("config.json"), config).unwrap();
    std::fs::write(dir.join("disk.img"), b"").unwrap();
    std::fs::write(dir.join("nvram.bin"), b"").unwrap();
}

fn run_in(home: &Path, args: &[&str]) -> Output {
    tartlet()
        .env("TART_HOME", home)
        .arg("run")
        .args(args)
        .output()
        .expect("binary should spawn")
}

fn stderr(output: &Output) -> String {
    String::from_utf8_lossy(&output.stderr).into_owned()
}

fn stdout(output: &Output) -> String {
    String::from_utf8_lossy(&output.stdout).into_owned()
}

#[test]
fn test_missing_vm_fails_with_not_found() {
    let home = tempfile::tempdir().unwrap();
    let output = run_in(home.path(), &["ghost"]);

    assert_eq!(output.status.code(), Some(1));
    assert!(stderr(&output).contains("not found"), "{output:?}");
}

#[test]
fn test_usage_error_exits_two() {
    let output = tartlet().arg("run").output().unwrap();
    assert_eq!(output.status.code(), Some(2));
}

#[test]
fn test_network_flags_are_mutually_exclusive() {
    let home = tempfile::tempdir().unwrap();
    write_vm(home.path(), "vm", "aa:bb:cc:dd:ee:01");

    for combo in [
        &["vm", "--net-softnet", "--net-host"][..],
        &["vm", "--net-bridged", "en0", "--net-softnet"][..],
        &["vm", "--net-bridged", "en0", "--net-host"][..],
        &["vm", "--net-softnet-expose", "8080:80", "--net-host"][..],
    ] {
        let output = run_in(home.path(), combo);
        assert_eq!(output.status.code(), Some(1), "{combo:?}");
        assert!(stderr(&output).contains("invalid options"), "{combo:?}");
    }
}

#[test]
fn test_graphics_flags_are_mutually_exclusive() {
    let home = tempfile::tempdir().unwrap();
    write_vm(home.path(), "vm", "aa:bb:cc:dd:ee:02");

    let output = run_in(home.path(), &["vm", "--graphics", "--no-graphics"]);
    assert_eq!(output.status.code(), Some(1));
    assert!(stderr(&output).contains("invalid options"));
}

#[test]
fn test_captures_system_keys_needs_native_ui() {
    let home = tempfile::tempdir().unwrap();
    write_vm(home.path(), "vm", "aa:bb:cc:dd:ee:03");

    for combo in [
        &["vm", "--captures-system-keys", "--no-graphics"][..],
        &["vm", "--captures-system-keys", "--vnc"][..],
        &["vm", "--captures-system-keys", "--vnc-experimental"][..],
    ] {
        let output = run_in(home.path(), combo);
        assert_eq!(output.status.code(), Some(1), "{combo:?}");
        assert!(stderr(&output).contains("invalid options"), "{combo:?}");
    }
}

#[test]
fn test_amd64_media_rejected() {
    let home = tempfile::tempdir().unwrap();
    write_vm(home.path(), "vm", "aa:bb:cc:dd:ee:04");

    let output = run_in(home.path(), &["vm", "--disk", "installer-amd64.iso"]);
    assert_eq!(output.status.code(), Some(1));
    assert!(stderr(&output).contains("wrong architecture"));
}

#[test]
fn test_unnamed_shares_on_one_tag_rejected() {
    let home = tempfile::tempdir().unwrap();
    write_vm(home.path(), "vm", "aa:bb:cc:dd:ee:05");

    let output = run_in(home.path(), &["vm", "--dir", "/tmp/a", "--dir", "/tmp/b"]);
    assert_eq!(output.status.code(), Some(1));
    assert!(stderr(&output).contains("invalid specification"));
}

#[test]
fn test_locked_vm_reports_already_running() {
    let home = tempfile::tempdir().unwrap();
    write_vm(home.path(), "vm", "aa:bb:cc:dd:ee:06");

    let _lock = FileLock::try_exclusive(File::open(home.path().join("vm/config.json")).unwrap())
        .unwrap()
        .expect("test holds the VM lock");

    let output = run_in(home.path(), &["vm"]);
    assert_eq!(output.status.code(), Some(1));
    assert!(
        stderr(&output).contains("already running"),
        "{:?}",
        stderr(&output)
    );
}

#[test]
fn test_mac_collision_with_running_peer_is_repaired() {
    let home = tempfile::tempdir().unwrap();
    write_vm(home.path(), "peer", "aa:bb:cc:dd:ee:10");
    write_vm(home.path(), "vm", "aa:bb:cc:dd:ee:10");

    // Hold the peer's lock so it counts as running.
    let _lock = FileLock::try_exclusive(File::open(home.path().join("peer/config.json")).unwrap())
        .unwrap()
        .expect("test holds the peer lock");

    let output = run_in(home.path(), &["vm"]);
    assert!(
        stdout(&output).contains("resetting"),
        "expected a MAC reset notice, got {:?}",
        stdout(&output)
    );

    let rewritten = std::fs::read_to_string(home.path().join("vm/config.json")).unwrap();
    assert!(
        !rewritten.contains("aa:bb:cc:dd:ee:10"),
        "the colliding MAC must be replaced"
    );
    let peer = std::fs::read_to_string(home.path().join("peer/config.json")).unwrap();
    assert!(
        peer.contains("aa:bb:cc:dd:ee:10"),
        "the running peer keeps its MAC"
    );
}

#[test]
fn test_stopped_peer_with_same_mac_is_no_collision() {
    let home = tempfile::tempdir().unwrap();
    write_vm(home.path(), "peer", "aa:bb:cc:dd:ee:11");
    write_vm(home.path(), "vm", "aa:bb:cc:dd:ee:11");

    let output = run_in(home.path(), &["vm"]);
    assert!(
        !stdout(&output).contains("resetting"),
        "a stopped peer must not trigger a MAC reset"
    );
    let config = std::fs::read_to_string(home.path().join("vm/config.json")).unwrap();
    assert!(config.contains("aa:bb:cc:dd:ee:11"));
}

#[cfg(not(target_os = "macos"))]
#[test]
fn test_run_is_unsupported_off_macos() {
    let home = tempfile::tempdir().unwrap();
    write_vm(home.path(), "vm", "aa:bb:cc:dd:ee:20");

    let output = run_in(home.path(), &["vm"]);
    assert_eq!(output.status.code(), Some(1));
    assert!(stderr(&output).contains("unsupported on this host"));
}

#[test]
fn test_suspendable_requires_macos_guest() {
    let home = tempfile::tempdir().unwrap();
    write_vm(home.path(), "vm", "aa:bb:cc:dd:ee:21");

    let output = run_in(home.path(), &["vm", "--suspendable"]);
    assert_eq!(output.status.code(), Some(1));
    assert!(stderr(&output).contains("suspend-to-disk requires a macOS guest"));
}

#[test]
fn test_rosetta_requires_linux_guest() {
    let home = tempfile::tempdir().unwrap();
    let dir = home.path().join("mac");
    std::fs::create_dir_all(&dir).unwrap();
    std::fs::write(
        dir.join("config.json"),
        r#"{
            "os": "darwin",
            "cpuCount": 4,
            "memorySize": 4294967296,
            "macAddress": "aa:bb:cc:dd:ee:22"
        }"#,
    )
    .unwrap();

    let output = run_in(home.path(), &["mac", "--rosetta", "rosetta"]);
    assert_eq!(output.status.code(), Some(1));
    assert!(stderr(&output).contains("--rosetta requires a Linux guest"));
}

#[test]
fn test_vm_lock_released_after_engine_exit() {
    let home = tempfile::tempdir().unwrap();
    write_vm(home.path(), "vm", "aa:bb:cc:dd:ee:23");

    // The run fails (or exits) quickly on any host without a real guest
    // image; afterwards the config lock must be free again.
    let _ = run_in(home.path(), &["vm"]);

    let lock = FileLock::try_exclusive(File::open(home.path().join("vm/config.json")).unwrap())
        .unwrap();
    assert!(lock.is_some(), "engine exit must release the VM lock");
}
