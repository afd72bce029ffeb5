use std::io::Write;

use flowchat_core::config::{AppConfig, TelemetryBackend};
use flowchat_core::error::FlowError;

#[test]
fn test_load_full_config_from_file() {
    let toml_content = r#"
[engine]
assistant_id = "support-bot"
flow = "/srv/flows/support.json"
workspace = "/tmp/flowchat-test"

[pacing]
min_delay_ms = 200
per_char_ms = 5
inter_element_pause_ms = 300

[messages]
unmatched = "Pick one of the buttons, please."
dead_end = "Bye!"

[telemetry]
backend = "http"
base_url = "https://bots.example.com"
api_key = "tok-123"

[telemetry.retry]
max_retries = 5
initial_backoff_ms = 100
max_backoff_ms = 2000

[log]
level = 3
log_dir = "/tmp/flowchat-test/transcripts"
"#;

    let mut tmp = tempfile::NamedTempFile::new().expect("create temp file");
    tmp.write_all(toml_content.as_bytes()).expect("write toml");

    let config = AppConfig::load(tmp.path()).expect("load config");

    assert_eq!(config.engine.assistant_id, "support-bot");
    assert_eq!(config.engine.flow.as_deref(), Some("/srv/flows/support.json"));
    assert_eq!(config.pacing.min_delay_ms, 200);
    assert_eq!(config.pacing.inter_element_pause_ms, 300);
    assert_eq!(config.messages.unmatched, "Pick one of the buttons, please.");
    assert_eq!(config.messages.dead_end, "Bye!");
    assert_eq!(config.telemetry.backend, TelemetryBackend::Http);
    assert_eq!(config.telemetry.base_url.as_deref(), Some("https://bots.example.com"));
    assert_eq!(config.telemetry.retry.max_retries, 5);
    assert_eq!(config.telemetry.retry.max_backoff_ms, 2000);

    let log = config.log.as_ref().expect("log present");
    assert!(log.enabled);
    assert_eq!(log.level, 3);
    assert_eq!(
        config.log_dir().expect("log dir"),
        std::path::PathBuf::from("/tmp/flowchat-test/transcripts")
    );
    assert_eq!(
        config.db_path(),
        std::path::PathBuf::from("/tmp/flowchat-test/flowchat.db")
    );
}

#[test]
fn test_env_var_expansion_in_config() {
    std::env::set_var("FLOWCHAT_TEST_API_KEY", "expanded-key-value");

    let toml_content = r#"
[telemetry]
backend = "http"
base_url = "https://bots.example.com"
api_key = "${FLOWCHAT_TEST_API_KEY}"
"#;

    let mut tmp = tempfile::NamedTempFile::new().expect("create temp file");
    tmp.write_all(toml_content.as_bytes()).expect("write toml");

    let config = AppConfig::load(tmp.path()).expect("load config");
    assert_eq!(config.telemetry.api_key, Some("expanded-key-value".to_string()));

    std::env::remove_var("FLOWCHAT_TEST_API_KEY");
}

#[test]
fn test_minimal_config_uses_defaults() {
    let toml_content = r#"
[engine]
assistant_id = "a1"
"#;

    let mut tmp = tempfile::NamedTempFile::new().expect("create temp file");
    tmp.write_all(toml_content.as_bytes()).expect("write toml");

    let config = AppConfig::load(tmp.path()).expect("load config");

    assert_eq!(config.pacing.min_delay_ms, 500);
    assert_eq!(config.pacing.per_char_ms, 10);
    assert_eq!(config.pacing.inter_element_pause_ms, 600);
    assert_eq!(config.telemetry.backend, TelemetryBackend::Log);
    assert_eq!(config.telemetry.retry.max_retries, 3);
    assert!(config.engine.flow.is_none());
    assert!(config.log.is_none());
    assert!(config.log_dir().is_none());
}

#[test]
fn test_disabled_transcripts_have_no_dir() {
    let config = AppConfig::from_toml("[log]\nenabled = false\n").expect("parse");
    assert!(config.log_dir().is_none());
}

#[test]
fn test_missing_file_is_config_not_found() {
    let dir = tempfile::tempdir().expect("temp dir");
    let result = AppConfig::load(&dir.path().join("absent.toml"));
    assert!(matches!(result, Err(FlowError::ConfigNotFound(_))));
}

#[test]
fn test_explicit_path_wins() {
    let dir = tempfile::tempdir().expect("temp dir");
    let explicit = dir.path().join("custom.toml");
    assert_eq!(AppConfig::resolve_path(Some(&explicit)), explicit);
}
