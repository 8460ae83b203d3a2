//! Config load validation tests for challengectl-config.
// crates/challengectl-config/tests/load_validation.rs
// ============================================================================
// Module: Config Load Validation Tests
// Description: Validate config loading guards (path, size, encoding, schema).
// Purpose: Ensure config input handling is strict and fail-closed.
// ============================================================================

use std::io::Write;
use std::path::Path;

use challengectl_config::ConfigError;
use challengectl_config::ControllerConfig;
use tempfile::NamedTempFile;

type TestResult = Result<(), String>;

fn assert_invalid(result: Result<ControllerConfig, ConfigError>, needle: &str) -> TestResult {
    match result {
        Err(error) => {
            let message = error.to_string();
            if message.contains(needle) {
                Ok(())
            } else {
                Err(format!("error {message} did not contain {needle}"))
            }
        }
        Ok(_) => Err("expected invalid config load".to_owned()),
    }
}

#[test]
fn load_rejects_path_too_long() -> TestResult {
    let long_path = "a".repeat(5_000);
    assert_invalid(ControllerConfig::load(Some(Path::new(&long_path))), "config path exceeds max length")
}

#[test]
fn load_rejects_missing_file() -> TestResult {
    assert_invalid(ControllerConfig::load(Some(Path::new("/nonexistent/challengectl.yaml"))), "config file not found")
}

#[test]
fn load_rejects_oversized_file() -> TestResult {
    let mut file = NamedTempFile::new().map_err(|err| err.to_string())?;
    let payload = vec![b'a'; 1_048_577];
    file.write_all(&payload).map_err(|err| err.to_string())?;
    assert_invalid(ControllerConfig::load(Some(file.path())), "config file exceeds size limit")
}

#[test]
fn load_rejects_non_utf8_file() -> TestResult {
    let mut file = NamedTempFile::new().map_err(|err| err.to_string())?;
    file.write_all(&[0xFF, 0xFE, 0xFF]).map_err(|err| err.to_string())?;
    assert_invalid(ControllerConfig::load(Some(file.path())), "config file must be utf-8")
}

#[test]
fn load_rejects_missing_provisioning_key_hash() -> TestResult {
    let mut file = NamedTempFile::new().map_err(|err| err.to_string())?;
    writeln!(
        file,
        "bind_addr: 127.0.0.1:8080\nsqlite_path: /tmp/challengectl.sqlite3\nblob_store_dir: /tmp/blobs\nprovisioning_key_hash: \"\"\n"
    )
    .map_err(|err| err.to_string())?;
    assert_invalid(ControllerConfig::load(Some(file.path())), "provisioning_key_hash must not be empty")
}

#[test]
fn load_accepts_minimal_valid_document() -> TestResult {
    let mut file = NamedTempFile::new().map_err(|err| err.to_string())?;
    writeln!(
        file,
        "bind_addr: 127.0.0.1:8080\nsqlite_path: /tmp/challengectl.sqlite3\nblob_store_dir: /tmp/blobs\nprovisioning_key_hash: \"$2b$12$abcdefghijklmnopqrstuv\"\n"
    )
    .map_err(|err| err.to_string())?;
    let config = ControllerConfig::load(Some(file.path())).map_err(|err| err.to_string())?;
    assert_eq!(config.tunables.poll_interval.as_secs(), 10);
    assert!(config.tls.is_none());
    Ok(())
}
