use std::io::Write;

use strata_core::config::{EngineConfig, GateDenialPolicy, RecoveryStrategy};
use strata_core::error::StrataError;

#[test]
fn test_load_full_config_from_file() {
    let toml_content = r#"
[execution]
recovery_strategy = "retry"
max_retries = 3
max_node_visits = 8
on_gate_denied = "proceed"
default_strategy = "reasoning"
agent_id = "agent-7"
team_id = "research"

[execution.limits]
max_tokens = 20000
max_time_ms = 60000

[telemetry]
batch_size = 25
flush_interval_ms = 250
max_buffer_size = 100

[event_bus]
recent_capacity = 64

[storage]
path = "/tmp/strata-test/strata.db"

[shutdown]
drain_timeout_ms = 1500

[organization.roles.researcher]
strategies = ["reasoning", "conversational"]
tools = ["json_query"]
prohibited_tools = ["template"]

[organization.teams.research.members]
agent-7 = ["researcher"]
"#;

    let mut tmp = tempfile::NamedTempFile::new().expect("create temp file");
    tmp.write_all(toml_content.as_bytes()).expect("write toml");

    let config = EngineConfig::load(tmp.path()).expect("load config");

    let exec = &config.execution;
    assert_eq!(exec.recovery_strategy, RecoveryStrategy::Retry);
    assert_eq!(exec.max_retries, 3);
    assert_eq!(exec.max_node_visits, 8);
    assert_eq!(exec.on_gate_denied, GateDenialPolicy::Proceed);
    assert_eq!(exec.default_strategy, "reasoning");
    assert_eq!(exec.agent_id.as_deref(), Some("agent-7"));
    assert_eq!(exec.limits.max_tokens, Some(20000));
    assert_eq!(exec.limits.max_credits, None);

    assert_eq!(config.telemetry.batch_size, 25);
    assert_eq!(config.event_bus.recent_capacity, 64);
    assert_eq!(
        config.storage.resolved_path(),
        std::path::PathBuf::from("/tmp/strata-test/strata.db")
    );
    assert_eq!(config.shutdown.drain_timeout_ms, 1500);

    let org = config.organization.expect("organization present");
    assert_eq!(org.roles["researcher"].prohibited_tools, vec!["template"]);
    assert_eq!(org.teams["research"].members["agent-7"], vec!["researcher"]);
}

#[test]
fn test_env_var_expansion_in_config() {
    std::env::set_var("STRATA_TEST_DB_PATH", "/var/lib/strata/runs.db");

    let toml_content = r#"
[storage]
path = "${STRATA_TEST_DB_PATH}"
"#;

    let mut tmp = tempfile::NamedTempFile::new().expect("create temp file");
    tmp.write_all(toml_content.as_bytes()).expect("write toml");

    let config = EngineConfig::load(tmp.path()).expect("load config");
    assert_eq!(config.storage.path, "/var/lib/strata/runs.db");

    std::env::remove_var("STRATA_TEST_DB_PATH");
}

#[test]
fn test_minimal_config_uses_defaults() {
    let mut tmp = tempfile::NamedTempFile::new().expect("create temp file");
    tmp.write_all(b"# nothing here\n").expect("write toml");

    let config = EngineConfig::load(tmp.path()).expect("load config");

    assert_eq!(config.execution.recovery_strategy, RecoveryStrategy::Fail);
    assert_eq!(config.execution.max_retries, 2);
    assert_eq!(config.execution.on_gate_denied, GateDenialPolicy::Skip);
    assert_eq!(config.execution.default_strategy, "deterministic");
    assert!(config.execution.agent_id.is_none());
    assert!(config.telemetry.enabled);
    assert_eq!(config.telemetry.flush_interval_ms, 1000);
    assert_eq!(config.event_bus.recent_capacity, 500);
    assert_eq!(config.storage.path, "~/.strata/strata.db");
    assert_eq!(config.shutdown.drain_timeout_ms, 5000);
    assert!(config.organization.is_none());
}

#[test]
fn test_missing_file_is_reported() {
    let err = EngineConfig::load(std::path::Path::new("/nonexistent/strata.toml")).unwrap_err();
    assert!(matches!(err, StrataError::ConfigNotFound(_)));
}

#[test]
fn test_invalid_sampling_rate_is_rejected() {
    let toml_content = r#"
[telemetry.sampling]
health = -0.1
"#;

    let mut tmp = tempfile::NamedTempFile::new().expect("create temp file");
    tmp.write_all(toml_content.as_bytes()).expect("write toml");

    let err = EngineConfig::load(tmp.path()).unwrap_err();
    assert!(matches!(err, StrataError::Validation(_)));
    assert!(err.to_string().contains("telemetry.sampling.health"));
}

#[test]
fn test_config_round_trips_through_toml() {
    let config = EngineConfig::default();
    let rendered = toml::to_string_pretty(&config).expect("render");
    let parsed = EngineConfig::from_toml(&rendered).expect("parse");
    assert_eq!(parsed.execution, config.execution);
    assert_eq!(parsed.telemetry, config.telemetry);
    assert_eq!(parsed.storage, config.storage);
}
