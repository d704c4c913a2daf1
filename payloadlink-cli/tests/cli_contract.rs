//! Integration tests for core CLI contract behavior.

use {
    predicates::prelude::*,
    std::{fs, path::Path},
    tempfile::tempdir,
};

fn cli_cmd() -> assert_cmd::Command {
    assert_cmd::cargo::cargo_bin_cmd!("payloadlink")
}

/// Command isolated from the user's global config.
fn isolated_cmd(home: &Path) -> assert_cmd::Command {
    let mut cmd = cli_cmd();
    cmd.env("HOME", home)
        .env("XDG_CONFIG_HOME", home.join(".config"))
        .env_remove("PAYLOADLINK_PORT")
        .env_remove("PAYLOADLINK_TCP")
        .env_remove("PAYLOADLINK_BAUD");
    cmd
}

fn ldrt_record(x: f32, y: f32, z: f32) -> Vec<u8> {
    let mut record = Vec::with_capacity(15);
    record.extend_from_slice(&x.to_le_bytes());
    record.extend_from_slice(&y.to_le_bytes());
    record.extend_from_slice(&z.to_le_bytes());
    record.extend_from_slice(&[255, 128, 0]);
    record
}

#[test]
fn help_exits_zero_and_writes_stdout_only() {
    let mut cmd = cli_cmd();
    cmd.arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("payloadlink"))
        .stderr(predicate::str::is_empty());
}

#[test]
fn version_exits_zero_and_writes_stdout_only() {
    let mut cmd = cli_cmd();
    cmd.arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains("payloadlink"))
        .stderr(predicate::str::is_empty());
}

#[test]
fn list_ports_json_returns_valid_json() {
    let dir = tempdir().expect("tempdir should be created");
    let output = isolated_cmd(dir.path())
        .args(["list-ports", "--json"])
        .output()
        .expect("command should execute");

    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    let parsed: serde_json::Value = serde_json::from_str(&stdout).expect("stdout should be JSON");
    assert!(parsed.is_array(), "should be a JSON array");
}

#[test]
fn exit_code_two_for_unknown_command() {
    let mut cmd = cli_cmd();
    cmd.arg("unknown-command-xyz")
        .assert()
        .failure()
        .code(2)
        .stderr(predicate::str::contains("unrecognized").or(predicate::str::contains("unknown")));
}

#[test]
fn exit_code_two_for_invalid_mount() {
    let dir = tempdir().expect("tempdir should be created");
    let mut cmd = cli_cmd();
    cmd.args(["files", "--mount", "gimbal", "--media-dir"])
        .arg(dir.path())
        .assert()
        .failure()
        .code(2)
        .stderr(predicate::str::contains("gimbal"));
}

#[test]
fn exit_code_two_for_completions_without_shell() {
    let mut cmd = cli_cmd();
    cmd.arg("completions")
        .assert()
        .failure()
        .code(2)
        .stderr(predicate::str::contains("shell"));
}

#[test]
fn completions_command_writes_to_stdout() {
    let mut cmd = cli_cmd();
    cmd.args(["completions", "bash"])
        .assert()
        .success()
        .stderr(predicate::str::is_empty())
        .stdout(predicate::str::contains("_payloadlink()"));
}

#[test]
fn exit_code_three_for_missing_config_file() {
    let dir = tempdir().expect("tempdir should be created");
    isolated_cmd(dir.path())
        .arg("--config")
        .arg(dir.path().join("missing.toml"))
        .arg("list-ports")
        .assert()
        .failure()
        .code(3)
        .stderr(predicate::str::contains("Config file not found"));
}

#[test]
fn malformed_local_config_warns_and_continues() {
    let dir = tempdir().expect("tempdir should be created");
    fs::write(dir.path().join("payloadlink.toml"), "invalid toml [[[")
        .expect("write invalid config");

    let output = isolated_cmd(dir.path())
        .current_dir(dir.path())
        .args(["list-ports", "--json"])
        .output()
        .expect("command should execute");
    assert!(
        output.status.success(),
        "command should succeed despite config warning"
    );
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("TOML"), "should warn about invalid TOML");
}

#[test]
fn files_json_lists_directory_entries() {
    let home = tempdir().expect("tempdir should be created");
    let media = tempdir().expect("tempdir should be created");
    fs::write(media.path().join("DJI_0001.jpg"), vec![1u8; 100]).expect("write jpg");
    fs::write(media.path().join("DJI_0002.mp4"), vec![2u8; 300]).expect("write mp4");

    let output = isolated_cmd(home.path())
        .args(["files", "--json", "--media-dir"])
        .arg(media.path())
        .output()
        .expect("command should execute");
    assert!(output.status.success());

    let parsed: serde_json::Value =
        serde_json::from_slice(&output.stdout).expect("stdout should be JSON");
    let entries = parsed.as_array().expect("array of entries");
    assert_eq!(entries.len(), 2);
    assert_eq!(entries[0]["name"], "DJI_0001.jpg");
    assert_eq!(entries[0]["size"], 100);
    assert_eq!(entries[0]["type"], "jpeg");
    assert_eq!(entries[1]["name"], "DJI_0002.mp4");
    assert_eq!(entries[1]["type"], "mp4");
}

#[test]
fn download_copies_every_file_under_mount_dir() {
    let home = tempdir().expect("tempdir should be created");
    let media = tempdir().expect("tempdir should be created");
    let out = tempdir().expect("tempdir should be created");

    let photo: Vec<u8> = (0..5000u32).map(|i| (i % 251) as u8).collect();
    fs::write(media.path().join("DJI_0001.jpg"), &photo).expect("write jpg");
    fs::write(media.path().join("DJI_0002.mp4"), b"tiny").expect("write mp4");

    isolated_cmd(home.path())
        .args(["--quiet", "download", "--slice", "1024", "--mount", "payload2"])
        .arg("--media-dir")
        .arg(media.path())
        .arg("--out")
        .arg(out.path())
        .assert()
        .success();

    let dest = out.path().join("payload2");
    assert_eq!(fs::read(dest.join("DJI_0001.jpg")).expect("jpg copied"), photo);
    assert_eq!(fs::read(dest.join("DJI_0002.mp4")).expect("mp4 copied"), b"tiny");
}

#[test]
fn download_missing_media_dir_exits_one() {
    let home = tempdir().expect("tempdir should be created");
    isolated_cmd(home.path())
        .arg("download")
        .arg("--media-dir")
        .arg(home.path().join("no-such-dir"))
        .arg("--out")
        .arg(home.path().join("out"))
        .assert()
        .failure()
        .code(1)
        .stdout(predicate::str::is_empty())
        .stderr(predicate::str::contains("Error"));
}

#[test]
fn convert_and_inspect_point_cloud() {
    let dir = tempdir().expect("tempdir should be created");
    let ldrt = dir.path().join("scan.ldrt");
    let pcd = dir.path().join("scan.pcd");

    let mut bytes = ldrt_record(1.0, 2.0, 3.0);
    bytes.extend(ldrt_record(-4.0, 0.0, 9.5));
    fs::write(&ldrt, bytes).expect("write ldrt");

    isolated_cmd(dir.path())
        .arg("convert")
        .arg(&ldrt)
        .arg(&pcd)
        .assert()
        .success()
        .stdout(predicate::str::is_empty());

    let text = fs::read(&pcd).expect("pcd written");
    let header = String::from_utf8_lossy(&text);
    assert!(header.contains("POINTS 0000000002"));
    assert!(header.contains("DATA binary"));

    let output = isolated_cmd(dir.path())
        .args(["inspect", "--json"])
        .arg(&pcd)
        .output()
        .expect("command should execute");
    assert!(output.status.success());
    let parsed: serde_json::Value =
        serde_json::from_slice(&output.stdout).expect("stdout should be JSON");
    assert_eq!(parsed["format"], "pcd");
    assert_eq!(parsed["points"], 2);
    assert_eq!(parsed["data_bytes"], 28);

    let output = isolated_cmd(dir.path())
        .args(["inspect", "--json"])
        .arg(&ldrt)
        .output()
        .expect("command should execute");
    assert!(output.status.success());
    let parsed: serde_json::Value =
        serde_json::from_slice(&output.stdout).expect("stdout should be JSON");
    assert_eq!(parsed["format"], "ldrt");
    assert_eq!(parsed["points"], 2);
    assert_eq!(parsed["bounds"]["min"][0], -4.0);
    assert_eq!(parsed["bounds"]["max"][2], 9.5);
}

#[test]
fn inspect_missing_file_exits_one_with_clean_stdout() {
    let dir = tempdir().expect("tempdir should be created");
    isolated_cmd(dir.path())
        .args(["inspect", "--json"])
        .arg(dir.path().join("missing.ldrt"))
        .assert()
        .failure()
        .code(1)
        .stdout(predicate::str::is_empty())
        .stderr(predicate::str::contains("Failed to open"));
}

#[test]
fn record_unreachable_endpoint_exits_one() {
    let dir = tempdir().expect("tempdir should be created");
    let config = dir.path().join("fast.toml");
    fs::write(
        &config,
        "[pointcloud]\nreconnect_attempts = 1\nreconnect_delay_ms = 10\n",
    )
    .expect("write config");

    isolated_cmd(dir.path())
        .arg("--config")
        .arg(&config)
        .args(["--tcp", "127.0.0.1:1", "record", "--packets", "1", "--out"])
        .arg(dir.path().join("x.ldrt"))
        .assert()
        .failure()
        .code(1)
        .stdout(predicate::str::is_empty());
}
