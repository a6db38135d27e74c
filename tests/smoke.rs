//! Smoke tests -- verify the binary runs and its subcommands parse.

use assert_cmd::Command;

#[test]
fn test_cli_help() {
    Command::cargo_bin("telemetry-stream")
        .unwrap()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicates::str::contains("Real-time sensor telemetry"));
}

#[test]
fn test_cli_version() {
    Command::cargo_bin("telemetry-stream")
        .unwrap()
        .arg("--version")
        .assert()
        .success()
        .stdout(predicates::str::contains("telemetry-stream"));
}

#[test]
fn test_simulate_subcommand_exists() {
    Command::cargo_bin("telemetry-stream")
        .unwrap()
        .args(["simulate", "--help"])
        .assert()
        .success()
        .stdout(predicates::str::contains("--outlier-rate"));
}

#[test]
fn test_show_config_prints_toml() {
    Command::cargo_bin("telemetry-stream")
        .unwrap()
        .env_remove("TELEMETRY_STREAM_CONFIG")
        .arg("show-config")
        .assert()
        .success()
        .stdout(predicates::str::contains("[window]"))
        .stdout(predicates::str::contains("window_size = 1000"));
}

#[test]
fn test_show_config_excavation_preset() {
    Command::cargo_bin("telemetry-stream")
        .unwrap()
        .args(["show-config", "--excavation"])
        .assert()
        .success()
        .stdout(predicates::str::contains("inclinometer = 0.95"));
}

#[test]
fn test_missing_config_file_fails() {
    Command::cargo_bin("telemetry-stream")
        .unwrap()
        .args(["--config", "/nonexistent/telemetry.toml", "show-config"])
        .assert()
        .failure()
        .stderr(predicates::str::contains("failed to read config file"));
}

#[test]
fn test_small_simulation_json() {
    Command::cargo_bin("telemetry-stream")
        .unwrap()
        .env("RUST_LOG", "warn")
        .args([
            "simulate",
            "--points",
            "300",
            "--sensors",
            "displacement_a,displacement_b",
            "--workers",
            "2",
            "--json",
        ])
        .assert()
        .success()
        .stdout(predicates::str::contains("\"total_processed\""))
        .stdout(predicates::str::contains("\"health_score\""));
}
