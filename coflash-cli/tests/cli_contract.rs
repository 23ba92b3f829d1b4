//! Integration tests for core CLI contract behavior.

use {predicates::prelude::*, std::fs, tempfile::tempdir};

fn cli_cmd() -> assert_cmd::Command {
    let mut cmd = assert_cmd::cargo::cargo_bin_cmd!("coflash");
    // Keep the host environment out of the contract
    cmd.env_remove("COFLASH_PORT")
        .env_remove("COFLASH_BAUD")
        .env_remove("COFLASH_NON_INTERACTIVE")
        .env_remove("RUST_LOG");
    cmd
}

#[test]
fn help_exits_zero_and_writes_stdout_only() {
    cli_cmd()
        .arg("--help")
        .assert()
        .success()
        .code(0)
        .stdout(predicate::str::contains("coflash"))
        .stderr(predicate::str::is_empty());
}

#[test]
fn short_help_exits_zero_and_writes_stdout_only() {
    cli_cmd()
        .arg("-h")
        .assert()
        .success()
        .stdout(predicate::str::contains("flash"))
        .stderr(predicate::str::is_empty());
}

#[test]
fn version_exits_zero_and_writes_stdout_only() {
    cli_cmd()
        .arg("--version")
        .assert()
        .success()
        .code(0)
        .stdout(predicate::str::contains("coflash"))
        .stderr(predicate::str::is_empty());
}

#[test]
fn subcommand_help_lists_flash_options() {
    cli_cmd()
        .args(["flash", "--help"])
        .assert()
        .success()
        .stdout(predicate::str::contains("--max-sync-attempts"))
        .stdout(predicate::str::contains("--restart-on-seal-failure"));
}

#[test]
fn completions_bash_exits_zero() {
    cli_cmd()
        .args(["completions", "bash"])
        .assert()
        .success()
        .code(0)
        .stdout(predicate::str::contains("coflash"));
}

#[test]
fn list_ports_json_returns_valid_json() {
    let output = cli_cmd()
        .args(["list-ports", "--json"])
        .output()
        .expect("command should execute");

    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    let parsed: serde_json::Value =
        serde_json::from_str(&stdout).expect("list-ports --json should print JSON");
    assert!(parsed.is_array(), "should be a JSON array");
}

#[test]
fn missing_image_fails_with_error_on_stderr() {
    let dir = tempdir().expect("tempdir should be created");
    let missing = dir.path().join("app.bin");

    cli_cmd()
        .current_dir(dir.path())
        .arg("--non-interactive")
        .arg("flash")
        .arg(&missing)
        .assert()
        .failure()
        .code(1)
        .stdout(predicate::str::is_empty())
        .stderr(predicate::str::contains("Error"))
        .stderr(predicate::str::contains("app.bin"));
}

#[test]
fn empty_image_is_rejected() {
    let dir = tempdir().expect("tempdir should be created");
    let image = dir.path().join("empty.bin");
    fs::write(&image, b"").expect("write empty image");

    cli_cmd()
        .current_dir(dir.path())
        .args(["-p", "INVALID_PORT_NAME_XYZ", "flash"])
        .arg(&image)
        .assert()
        .failure()
        .stderr(predicate::str::contains("empty"));
}

#[test]
fn invalid_port_fails() {
    let dir = tempdir().expect("tempdir should be created");
    let image = dir.path().join("app.bin");
    fs::write(&image, [0xA5u8; 512]).expect("write image");

    let output = cli_cmd()
        .current_dir(dir.path())
        .args(["-p", "INVALID_PORT_NAME_XYZ", "-q", "flash"])
        .arg(&image)
        .output()
        .expect("command should execute");

    assert!(!output.status.success(), "invalid port should not succeed");
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("INVALID_PORT_NAME_XYZ"));
}

#[test]
fn flash_without_image_is_usage_error() {
    cli_cmd()
        .arg("flash")
        .assert()
        .failure()
        .code(2)
        .stderr(predicate::str::contains("IMAGE"));
}

#[test]
fn unknown_command_is_usage_error() {
    cli_cmd()
        .arg("unknown-command-xyz")
        .assert()
        .failure()
        .code(2)
        .stderr(predicate::str::contains("unrecognized").or(predicate::str::contains("unknown")));
}

#[test]
fn unknown_flag_is_usage_error() {
    cli_cmd()
        .arg("--invalid-flag-xyz")
        .assert()
        .failure()
        .code(2);
}

#[test]
fn unknown_command_suggests_similar() {
    cli_cmd()
        .arg("falsh")
        .assert()
        .failure()
        .stderr(predicate::str::contains("flash"));
}

#[test]
fn invalid_config_warns_but_continues() {
    let dir = tempdir().expect("tempdir should be created");
    fs::write(dir.path().join("coflash.toml"), "invalid toml [[[").expect("write invalid config");

    let output = cli_cmd()
        .current_dir(dir.path())
        .args(["list-ports", "--json"])
        .output()
        .expect("command should execute");

    assert!(
        output.status.success(),
        "command should succeed despite config warning"
    );
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("coflash.toml"), "should warn about the config file");
}

#[test]
fn explicit_config_path_is_used() {
    let dir = tempdir().expect("tempdir should be created");
    let config = dir.path().join("custom.toml");
    fs::write(&config, "[connection]\nbaud = 115200\n").expect("write config");

    cli_cmd()
        .current_dir(dir.path())
        .arg("--config")
        .arg(&config)
        .arg("-vv")
        .args(["list-ports", "--json"])
        .assert()
        .success()
        .stderr(predicate::str::contains("custom.toml"));
}
