//! Configuration system tests
//!
//! Tests configuration loading, validation, and environment overrides

use std::fs;
use std::path::PathBuf;

use predicates::prelude::*;
use tempfile::TempDir;

use oob_bootstrap::comm::{CommConfig, ThreadMode};
use oob_bootstrap::config::BootstrapConfig;
use oob_bootstrap::error::{Error, ErrorCode};
use oob_bootstrap::oob::WaitPolicy;

/// Test fixture for configuration testing
struct ConfigFixture {
    _temp_dir: TempDir,
    config_path: PathBuf,
}

impl ConfigFixture {
    fn new() -> Self {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("config.toml");
        Self {
            _temp_dir: temp_dir,
            config_path,
        }
    }

    fn write_config(&self, content: &str) {
        fs::write(&self.config_path, content).unwrap();
    }

    fn path(&self) -> &str {
        self.config_path.to_str().unwrap()
    }
}

fn validate_cmd(fixture: &ConfigFixture) -> assert_cmd::Command {
    let mut cmd = assert_cmd::Command::cargo_bin("oob-bootstrap").unwrap();
    cmd.args(["config", "validate", "--config", fixture.path()]);
    cmd
}

// ─────────────────────────────────────────────────────────────────
// Valid Configuration Tests
// ─────────────────────────────────────────────────────────────────

#[test]
fn test_empty_config_uses_defaults() {
    let config = BootstrapConfig::parse("").unwrap();
    config.validate().unwrap();

    assert_eq!(config.rendezvous.namespace, "oob");
    assert_eq!(config.rendezvous.wait_timeout_ms, 0);
    assert_eq!(config.library.thread_mode, ThreadMode::Multi);
    assert!(!config.tracing.enabled);
    assert_eq!(config.logging.level, "info");
}

#[test]
fn test_full_config() {
    let config = BootstrapConfig::parse(
        r#"
[rendezvous]
namespace = "job/7"
poll_interval_ms = 5
wait_timeout_ms = 2500

[library]
config_prefix = "TORCH_UCX"
thread_mode = "multi"
estimated_num_eps = 64

[tracing]
enabled = true
output_dir = "/tmp/traces"

[logging]
level = "debug"
max_file_size_mb = 10
max_files = 2
json_format = true
"#,
    )
    .unwrap();
    config.validate().unwrap();

    let comm = CommConfig::from_config(&config);
    assert_eq!(comm.namespace, "job/7");
    assert_eq!(comm.wait_policy, WaitPolicy::Bounded(std::time::Duration::from_millis(2500)));
    assert_eq!(comm.config_prefix, "TORCH_UCX");
    assert_eq!(comm.estimated_num_eps, Some(64));
    assert_eq!(config.trace_dir(), Some(PathBuf::from("/tmp/traces")));
}

#[test]
fn test_unbounded_wait_by_default() {
    let config = BootstrapConfig::parse("").unwrap();
    assert_eq!(CommConfig::from_config(&config).wait_policy, WaitPolicy::Unbounded);
}

// ─────────────────────────────────────────────────────────────────
// Invalid Configuration Tests
// ─────────────────────────────────────────────────────────────────

#[test]
fn test_single_thread_mode_rejected() {
    let config = BootstrapConfig::parse("[library]\nthread_mode = \"single\"\n").unwrap();
    let err = config.validate().unwrap_err();
    assert_eq!(err.code(), ErrorCode::ConfigValidation);
}

#[test]
fn test_zero_endpoint_estimate_rejected() {
    let config = BootstrapConfig::parse("[library]\nestimated_num_eps = 0\n").unwrap();
    assert!(config.validate().is_err());
}

#[test]
fn test_invalid_log_level() {
    let fixture = ConfigFixture::new();
    fixture.write_config("[logging]\nlevel = \"chatty\"\n");

    validate_cmd(&fixture)
        .assert()
        .failure()
        .stderr(predicate::str::contains("Invalid log level 'chatty'"));
}

#[test]
fn test_malformed_toml() {
    let err = BootstrapConfig::parse("[rendezvous\nnamespace = ").unwrap_err();
    assert!(matches!(err, Error::ConfigParse { .. }));

    let fixture = ConfigFixture::new();
    fixture.write_config("[rendezvous\nnamespace = ");
    validate_cmd(&fixture)
        .assert()
        .failure()
        .code(10)
        .stderr(predicate::str::contains("E101"));
}

#[test]
fn test_unknown_thread_mode_is_parse_error() {
    assert!(BootstrapConfig::parse("[library]\nthread_mode = \"turbo\"\n").is_err());
}

// ─────────────────────────────────────────────────────────────────
// Environment Overrides
// ─────────────────────────────────────────────────────────────────

#[test]
fn test_env_override_namespace() {
    let fixture = ConfigFixture::new();
    fixture.write_config("[rendezvous]\nnamespace = \"from-file\"\n");

    assert_cmd::Command::cargo_bin("oob-bootstrap")
        .unwrap()
        .args(["config", "show", "--config", fixture.path()])
        .env("OOB_NAMESPACE", "from-env")
        .assert()
        .success()
        .stdout(predicate::str::contains("namespace = \"from-env\""));
}

#[test]
fn test_env_override_bad_number() {
    let fixture = ConfigFixture::new();
    fixture.write_config("");

    validate_cmd(&fixture)
        .env("OOB_WAIT_TIMEOUT_MS", "soon")
        .assert()
        .failure()
        .stderr(predicate::str::contains("'soon' is not a valid number"));
}

#[test]
fn test_tilde_expansion() {
    let fixture = ConfigFixture::new();
    fixture.write_config("[tracing]\noutput_dir = \"~/oob-traces\"\n");

    let config = BootstrapConfig::load(Some(fixture.path())).unwrap();
    let dir = config.trace_dir().unwrap();
    assert!(!dir.to_string_lossy().starts_with('~'));
    assert!(dir.ends_with("oob-traces"));
}
