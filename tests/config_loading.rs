use std::io::Write;

use evoflow_core::config::{AppConfig, InitialStrategy, SaturatingCurve};

#[test]
fn test_load_full_config_from_file() {
    let toml_content = r#"
[gateway]
base_url = "http://models.internal:8787"
api_key = "gw-test-key"
timeout_secs = 30

[gateway.retry]
max_retries = 2
initial_backoff_ms = 250

[budget]
max_total_node_invocations = 12
max_per_node_invocations = 2
max_nodes = 8
max_concurrent_workflows = 2
max_concurrent_ai_requests = 3
max_cost_usd_per_run = 0.75
generations = 4
population_size = 5
enable_stall_guard = false

[fitness]
judge_models = ["judge-small", "judge-large"]
num_models = 2
num_rounds = 3
cost_curve = { kind = "capped_linear", baseline = 0.001, threshold = 0.5 }

[evolution]
survivor_ratio = 0.4
repair_attempts = 5
mutation_model = "mutator-1"

[evolution.catalog]
models = ["small", "large"]
code_tools = ["calculator", "text_stats"]
max_seed_nodes = 3

[evolution.mutation_weights]
analyze_and_repair = 3.0

[log]
enabled = true
log_dir = "/tmp/evoflow-logs"
level = 3
"#;

    let mut tmp = tempfile::NamedTempFile::new().expect("create temp file");
    tmp.write_all(toml_content.as_bytes()).expect("write toml");

    let config = AppConfig::load(tmp.path()).expect("load config");

    assert_eq!(config.gateway.base_url, "http://models.internal:8787");
    assert_eq!(config.gateway.api_key, Some("gw-test-key".to_string()));
    assert_eq!(config.gateway.timeout_secs, 30);
    let retry = config.gateway.retry.as_ref().expect("retry present");
    assert_eq!(retry.max_retries, 2);
    assert_eq!(retry.initial_backoff_ms, 250);

    assert_eq!(config.budget.max_total_node_invocations, 12);
    assert_eq!(config.budget.max_per_node_invocations, 2);
    assert_eq!(config.budget.max_nodes, 8);
    assert_eq!(config.budget.max_concurrent_ai_requests, 3);
    assert_eq!(config.budget.generations, 4);
    assert_eq!(config.budget.population_size, 5);
    assert!(!config.budget.enable_stall_guard);
    assert!(config.budget.enable_parallel_limit);

    assert_eq!(config.fitness.judge_models, vec!["judge-small", "judge-large"]);
    assert_eq!(config.fitness.num_rounds, 3);
    assert_eq!(
        config.fitness.cost_curve,
        SaturatingCurve::CappedLinear {
            baseline: 0.001,
            threshold: 0.5
        }
    );

    assert_eq!(config.evolution.initial, InitialStrategy::Random);
    assert_eq!(config.evolution.repair_attempts, 5);
    assert_eq!(config.evolution.mutation_model, "mutator-1");
    assert_eq!(config.evolution.catalog.models, vec!["small", "large"]);
    assert_eq!(config.evolution.catalog.max_seed_nodes, 3);
    assert!((config.evolution.mutation_weights.analyze_and_repair - 3.0).abs() < f64::EPSILON);
    assert!((config.evolution.mutation_weights.edit_node - 2.0).abs() < f64::EPSILON);

    assert_eq!(config.log_dir(), std::path::PathBuf::from("/tmp/evoflow-logs"));
    assert_eq!(config.log.expect("log present").level, 3);
}

#[test]
fn test_env_var_expansion_in_config() {
    std::env::set_var("EVOFLOW_TEST_GATEWAY_KEY", "expanded-key-value");

    let toml_content = r#"
[gateway]
api_key = "${EVOFLOW_TEST_GATEWAY_KEY}"
"#;

    let mut tmp = tempfile::NamedTempFile::new().expect("create temp file");
    tmp.write_all(toml_content.as_bytes()).expect("write toml");

    let config = AppConfig::load(tmp.path()).expect("load config");
    assert_eq!(config.gateway.api_key, Some("expanded-key-value".to_string()));

    std::env::remove_var("EVOFLOW_TEST_GATEWAY_KEY");
}

#[test]
fn test_minimal_config_uses_defaults() {
    let toml_content = r#"
[gateway]
base_url = "http://localhost:8787"
"#;

    let mut tmp = tempfile::NamedTempFile::new().expect("create temp file");
    tmp.write_all(toml_content.as_bytes()).expect("write toml");

    let config = AppConfig::load(tmp.path()).expect("load config");

    assert_eq!(config.budget.max_total_node_invocations, 40);
    assert_eq!(config.budget.max_per_node_invocations, 1);
    assert_eq!(config.budget.max_nodes, 20);
    assert_eq!(config.budget.max_concurrent_workflows, 4);
    assert_eq!(config.budget.max_concurrent_ai_requests, 8);
    assert_eq!(config.budget.rate_window_ms, 1000);
    assert_eq!(config.budget.max_requests_per_window, 20);
    assert_eq!(config.budget.generations, 5);
    assert_eq!(config.budget.population_size, 6);
    assert_eq!(config.budget.maximum_time_minutes, 60);
    assert_eq!(config.budget.time_budget_seconds, 300);
    assert_eq!(config.fitness.num_models, 2);
    assert_eq!(config.fitness.num_rounds, 1);
    assert_eq!(config.evolution.repair_attempts, 3);
    assert!(config.store.is_none());
    assert!(config.log.is_none());
}

#[test]
fn test_budget_env_override_on_load() {
    std::env::set_var("EVOFLOW_STALL_TIMEOUT_SECS", "45");

    let mut tmp = tempfile::NamedTempFile::new().expect("create temp file");
    tmp.write_all(b"[budget]\nstall_timeout_secs = 10\n").expect("write toml");

    let config = AppConfig::load(tmp.path());
    std::env::remove_var("EVOFLOW_STALL_TIMEOUT_SECS");

    assert_eq!(config.expect("load config").budget.stall_timeout_secs, 45);
}

#[test]
fn test_invalid_budget_is_rejected() {
    let mut tmp = tempfile::NamedTempFile::new().expect("create temp file");
    tmp.write_all(b"[budget]\npopulation_size = 0\n").expect("write toml");
    assert!(AppConfig::load(tmp.path()).is_err());
}

#[test]
fn test_missing_config_file() {
    let err = AppConfig::load(std::path::Path::new("/nonexistent/evoflow.toml")).unwrap_err();
    assert!(err.to_string().contains("not found"));
}

#[test]
fn test_effective_config_round_trips() {
    let config = AppConfig::default();
    let rendered = toml::to_string_pretty(&config).expect("render config");
    let parsed = AppConfig::from_toml(&rendered).expect("parse rendered config");
    assert_eq!(parsed.budget.population_size, config.budget.population_size);
    assert_eq!(parsed.fitness.time_curve, config.fitness.time_curve);
    assert_eq!(parsed.evolution.catalog.roles, config.evolution.catalog.roles);
}
