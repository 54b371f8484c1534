//! Configuration File Tests
//!
//! Sessions built from `persista.toml`:
//! - The default file parses and yields the default config
//! - Settings in the file change session behaviour
//! - Invalid files are rejected before a session exists

use crate::*;
use persista::{AutoDetach, CallbackMode, ErrorKind, PersistentState, CONFIG_FILE_NAME};
use tempfile::TempDir;

#[test]
fn test_default_file_round_trips() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join(CONFIG_FILE_NAME);
    SessionConfig::write_default_if_missing(&path).unwrap();

    let loaded = SessionConfig::from_file(&path).unwrap();
    assert_eq!(loaded, SessionConfig::default());

    std::fs::write(&path, "optimistic = false\n").unwrap();
    SessionConfig::write_default_if_missing(&path).unwrap();
    assert!(!SessionConfig::from_file(&path).unwrap().optimistic);
}

#[test]
fn test_file_settings_drive_the_session() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join(CONFIG_FILE_NAME);
    std::fs::write(
        &path,
        r#"
retain_state = false
auto_detach = ["rollback"]
lifecycle_callback_mode = ["log"]
"#,
    )
    .unwrap();
    let config = SessionConfig::from_file(&path).unwrap();
    assert_eq!(config.auto_detach, vec![AutoDetach::Rollback]);
    assert_eq!(config.lifecycle_callback_mode, vec![CallbackMode::Log]);

    let h = Harness::new();
    h.seed_account(1, "ada", 100);
    h.seed_account(2, "bob", 5);
    let mut s = h.session(config);

    s.begin().unwrap();
    let a = s.find(&account(1)).unwrap().unwrap();
    s.commit().unwrap();
    assert_eq!(s.state(a).unwrap(), PersistentState::Hollow);

    s.begin().unwrap();
    let b = s.find(&account(2)).unwrap().unwrap();
    s.rollback().unwrap();
    assert!(s.get(b).is_none());
    assert!(s.cached(&account(2)).is_none());
}

#[test]
fn test_written_config_reloads() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join(CONFIG_FILE_NAME);
    let config = SessionConfig {
        optimistic: false,
        lock_timeout_ms: 250,
        clean_capacity: Some(64),
        ..SessionConfig::default()
    };
    config.write_to_file(&path).unwrap();
    assert_eq!(SessionConfig::from_file(&path).unwrap(), config);
}

#[test]
fn test_invalid_files_are_rejected() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join(CONFIG_FILE_NAME);

    std::fs::write(&path, "auto_detach = [\"none\", \"close\"]\n").unwrap();
    assert_eq!(SessionConfig::from_file(&path).unwrap_err().kind(), ErrorKind::User);

    std::fs::write(&path, "lock_timeout_ms = \"soon\"\n").unwrap();
    assert_eq!(SessionConfig::from_file(&path).unwrap_err().kind(), ErrorKind::User);

    let missing = dir.path().join("absent.toml");
    assert!(SessionConfig::from_file(&missing).is_err());
}
