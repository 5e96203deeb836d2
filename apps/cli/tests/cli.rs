use std::io::Write;

use assert_cmd::Command;
use predicates::prelude::*;

fn config_file(body: &str) -> tempfile::NamedTempFile {
    let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
    file.write_all(body.as_bytes()).unwrap();
    file
}

const ONE_TCP: &str = r#"
[autoscale]
enabled = false

[resources.tws]
kind = "tcp"
target = "127.0.0.1:1"

[resources.tws.pool]
min_size = 0
max_size = 3
"#;

fn poolctl() -> Command {
    let mut cmd = Command::cargo_bin("resync-poolctl").unwrap();
    cmd.env_remove("RESYNC_LOG").env("RESYNC_LOG_FORMAT", "compact");
    cmd
}

#[test]
fn check_summarises_resources() {
    let file = config_file(ONE_TCP);
    poolctl()
        .args(["check", "--config"])
        .arg(file.path())
        .assert()
        .success()
        .stdout(predicate::str::contains("1 resource(s)"))
        .stdout(predicate::str::contains("tws"))
        .stdout(predicate::str::contains("autoscale off"));
}

#[test]
fn check_can_print_the_effective_config() {
    let file = config_file(ONE_TCP);
    poolctl()
        .args(["check", "--print-config", "--config"])
        .arg(file.path())
        .assert()
        .success()
        .stdout(predicate::str::contains("drain_grace = \"30s\""));
}

#[test]
fn check_rejects_invalid_pools() {
    let file = config_file(
        r#"
        [resources.tws]
        kind = "tcp"
        target = "127.0.0.1:1"
        pool = { min_size = 4, max_size = 2 }
        "#,
    );
    poolctl()
        .args(["check", "--config"])
        .arg(file.path())
        .assert()
        .failure()
        .stderr(predicate::str::contains("resource 'tws'"));
}

#[test]
fn missing_config_fails() {
    poolctl()
        .args(["check", "--config", "/nonexistent/pools.toml"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("not found"));
}

#[test]
fn report_prints_json() {
    let file = config_file(ONE_TCP);
    let output = poolctl()
        .args(["report", "--compact", "--config"])
        .arg(file.path())
        .output()
        .unwrap();
    assert!(output.status.success(), "{output:?}");

    let report: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(report["state"], "running");
    assert_eq!(report["resources"]["tws"]["max_size"], 3);
}

#[cfg(feature = "http")]
#[test]
fn shipped_example_config_is_valid() {
    poolctl()
        .args(["check", "--config", concat!(env!("CARGO_MANIFEST_DIR"), "/pools.example.toml")])
        .assert()
        .success()
        .stdout(predicate::str::contains("2 resource(s)"))
        .stdout(predicate::str::contains("pricing-api"));
}
