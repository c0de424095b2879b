use std::net::TcpListener;
use std::path::Path;

use assert_cmd::cargo::cargo_bin_cmd;
use predicates::prelude::*;

const SCRUBBED_VARS: &[&str] = &[
    "COURTSIDE_CONFIG_PATH",
    "COURTSIDE_CONFIG_JSON",
    "COURTSIDE_CATALOG_PATH",
    "COURTSIDE_DATA_ROOT",
    "HTTP_PROXY",
    "http_proxy",
    "HTTPS_PROXY",
    "https_proxy",
    "ALL_PROXY",
    "all_proxy",
];

fn courtsidectl(dir: &Path) -> assert_cmd::Command {
    let mut cmd = cargo_bin_cmd!("courtsidectl");
    cmd.current_dir(dir).env("RUST_LOG", "warn");
    for var in SCRUBBED_VARS {
        cmd.env_remove(var);
    }
    cmd
}

const CATALOG: &str = r#"
[[data_types]]
id = "schedules"
source = "bref"
priority = "HIGH"
path_pattern = "bref/schedules/{partition}"
partitions = { kind = "list", keys = ["2023", "2024"] }

[[data_types]]
id = "standings"
source = "bref"
priority = "LOW"
path_pattern = "bref/standings/{partition}"
partitions = { kind = "list", keys = ["2024"] }
"#;

#[test]
fn run_help_mentions_options() {
    let dir = tempfile::tempdir().unwrap();
    let output = courtsidectl(dir.path())
        .arg("run")
        .arg("--help")
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    let text = String::from_utf8_lossy(&output);
    for flag in ["--tier", "--source", "--dry-run", "--max-runtime", "--catalog"] {
        assert!(text.contains(flag), "run help missing {flag}");
    }
}

#[test]
fn gaps_help_documents_json_output() {
    let dir = tempfile::tempdir().unwrap();
    courtsidectl(dir.path())
        .arg("gaps")
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("--json"));
}

#[test]
fn dry_run_lists_gaps_without_fetching() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("catalog.toml"), CATALOG).unwrap();

    courtsidectl(dir.path())
        .env("COURTSIDE_DATA_ROOT", dir.path().join("data"))
        .args(["run", "--dry-run", "--catalog", "catalog.toml"])
        .assert()
        .success()
        .stdout(predicate::str::contains("schedules:2024 [bref] missing"))
        .stdout(predicate::str::contains("3 gap(s): 3 missing"));

    assert!(!dir.path().join("data").exists());
}

#[test]
fn gaps_respects_the_tier_filter() {
    let dir = tempfile::tempdir().unwrap();
    // Picked up from the default location.
    std::fs::write(dir.path().join("catalog.toml"), CATALOG).unwrap();

    let output = courtsidectl(dir.path())
        .env("COURTSIDE_DATA_ROOT", dir.path().join("data"))
        .args(["gaps", "--tier", "high", "--json"])
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    let text = String::from_utf8_lossy(&output);
    let gaps: Vec<serde_json::Value> = text
        .lines()
        .map(|line| serde_json::from_str(line).unwrap())
        .collect();
    assert_eq!(gaps.len(), 2);
    assert!(gaps.iter().all(|gap| gap["data_type_id"] == "schedules"));
    assert!(gaps.iter().all(|gap| gap["reason"] == "missing"));
}

#[test]
fn missing_catalog_exits_with_failure() {
    let dir = tempfile::tempdir().unwrap();
    courtsidectl(dir.path())
        .arg("gaps")
        .assert()
        .code(1)
        .stderr(predicate::str::contains("no catalog found"));
}

#[test]
fn config_prints_effective_settings() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(
        dir.path().join("courtside.toml"),
        "[breaker]\nfailure_threshold = 9.0\n",
    )
    .unwrap();

    courtsidectl(dir.path())
        .arg("config")
        .assert()
        .success()
        .stdout(predicate::str::contains("courtside.toml"))
        .stdout(predicate::str::contains("failure_threshold = 9.0"));
}

#[test]
fn exhausted_tasks_exit_with_dead_letter_code() {
    let dir = tempfile::tempdir().unwrap();
    // Bind then release a port so every request is refused.
    let port = {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().port()
    };

    std::fs::write(
        dir.path().join("catalog.toml"),
        r#"
[[data_types]]
id = "standings"
source = "bref"
path_pattern = "bref/standings/{partition}"
partitions = { kind = "list", keys = ["2024"] }
"#,
    )
    .unwrap();
    std::fs::write(
        dir.path().join("courtside.toml"),
        format!(
            r#"
[retry]
max_attempts = 1

[storage]
data_root = "data"

[http.url_templates]
bref = "http://127.0.0.1:{port}/{{data_type}}/{{partition}}"
"#
        ),
    )
    .unwrap();

    courtsidectl(dir.path())
        .args(["run", "--max-runtime", "30s"])
        .assert()
        .code(2)
        .stdout(predicate::str::contains("dead-lettered 1"))
        .stdout(predicate::str::contains("standings:2024 [bref]"));
}
