use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{EvoflowError, Result};

/// Top-level evoflow configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub gateway: GatewayConfig,
    #[serde(default)]
    pub budget: BudgetConfig,
    #[serde(default)]
    pub fitness: FitnessConfig,
    #[serde(default)]
    pub evolution: EvolutionConfig,
    #[serde(default)]
    pub store: Option<StoreConfig>,
    #[serde(default)]
    pub log: Option<LogConfig>,
}

/// Model gateway connection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default = "default_gateway_url")]
    pub base_url: String,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default = "default_gateway_timeout")]
    pub timeout_secs: u64,
    #[serde(default)]
    pub retry: Option<RetryConfig>,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            base_url: default_gateway_url(),
            api_key: None,
            timeout_secs: default_gateway_timeout(),
            retry: None,
        }
    }
}

fn default_gateway_url() -> String { "http://127.0.0.1:8787".to_string() }
fn default_gateway_timeout() -> u64 { 120 }

/// Retry configuration for model requests.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_initial_backoff")]
    pub initial_backoff_ms: u64,
    #[serde(default = "default_max_backoff")]
    pub max_backoff_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            initial_backoff_ms: default_initial_backoff(),
            max_backoff_ms: default_max_backoff(),
        }
    }
}

fn default_max_retries() -> u32 { 3 }
fn default_initial_backoff() -> u64 { 1000 }
fn default_max_backoff() -> u64 { 30000 }

/// Run, concurrency and spend limits. Every field can be overridden from
/// the environment as `EVOFLOW_<FIELD_NAME_IN_UPPER_SNAKE>`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BudgetConfig {
    #[serde(default = "default_max_total_node_invocations")]
    pub max_total_node_invocations: u32,
    #[serde(default = "default_max_per_node_invocations")]
    pub max_per_node_invocations: u32,
    #[serde(default = "default_max_nodes")]
    pub max_nodes: usize,
    #[serde(default = "default_max_concurrent_workflows")]
    pub max_concurrent_workflows: usize,
    #[serde(default = "default_max_concurrent_ai_requests")]
    pub max_concurrent_ai_requests: usize,
    #[serde(default = "default_max_cost_usd_per_run")]
    pub max_cost_usd_per_run: f64,
    #[serde(default = "default_rate_window_ms")]
    pub rate_window_ms: u64,
    #[serde(default = "default_max_requests_per_window")]
    pub max_requests_per_window: usize,
    #[serde(default = "default_true")]
    pub enable_stall_guard: bool,
    #[serde(default = "default_true")]
    pub enable_parallel_limit: bool,
    #[serde(default = "default_generations")]
    pub generations: u32,
    #[serde(default = "default_population_size")]
    pub population_size: usize,
    #[serde(default = "default_maximum_time_minutes")]
    pub maximum_time_minutes: u64,
    /// Wall-clock budget of a single graph run.
    #[serde(default = "default_time_budget_seconds")]
    pub time_budget_seconds: u64,
    /// Seconds without progress before the stall guard trips.
    #[serde(default = "default_stall_timeout_secs")]
    pub stall_timeout_secs: u64,
}

impl Default for BudgetConfig {
    fn default() -> Self {
        Self {
            max_total_node_invocations: default_max_total_node_invocations(),
            max_per_node_invocations: default_max_per_node_invocations(),
            max_nodes: default_max_nodes(),
            max_concurrent_workflows: default_max_concurrent_workflows(),
            max_concurrent_ai_requests: default_max_concurrent_ai_requests(),
            max_cost_usd_per_run: default_max_cost_usd_per_run(),
            rate_window_ms: default_rate_window_ms(),
            max_requests_per_window: default_max_requests_per_window(),
            enable_stall_guard: true,
            enable_parallel_limit: true,
            generations: default_generations(),
            population_size: default_population_size(),
            maximum_time_minutes: default_maximum_time_minutes(),
            time_budget_seconds: default_time_budget_seconds(),
            stall_timeout_secs: default_stall_timeout_secs(),
        }
    }
}

fn default_true() -> bool { true }
fn default_max_total_node_invocations() -> u32 { 40 }
fn default_max_per_node_invocations() -> u32 { 1 }
fn default_max_nodes() -> usize { 20 }
fn default_max_concurrent_workflows() -> usize { 4 }
fn default_max_concurrent_ai_requests() -> usize { 8 }
fn default_max_cost_usd_per_run() -> f64 { 5.0 }
fn default_rate_window_ms() -> u64 { 1000 }
fn default_max_requests_per_window() -> usize { 20 }
fn default_generations() -> u32 { 5 }
fn default_population_size() -> usize { 6 }
fn default_maximum_time_minutes() -> u64 { 60 }
fn default_time_budget_seconds() -> u64 { 300 }
fn default_stall_timeout_secs() -> u64 { 120 }

impl BudgetConfig {
    /// Apply `EVOFLOW_*` environment overrides on top of file values.
    pub fn apply_env_overrides(&mut self) -> Result<()> {
        self.apply_overrides(|name| std::env::var(name).ok())
    }

    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        override_from(&lookup, "EVOFLOW_MAX_TOTAL_NODE_INVOCATIONS", &mut self.max_total_node_invocations)?;
        override_from(&lookup, "EVOFLOW_MAX_PER_NODE_INVOCATIONS", &mut self.max_per_node_invocations)?;
        override_from(&lookup, "EVOFLOW_MAX_NODES", &mut self.max_nodes)?;
        override_from(&lookup, "EVOFLOW_MAX_CONCURRENT_WORKFLOWS", &mut self.max_concurrent_workflows)?;
        override_from(&lookup, "EVOFLOW_MAX_CONCURRENT_AI_REQUESTS", &mut self.max_concurrent_ai_requests)?;
        override_from(&lookup, "EVOFLOW_MAX_COST_USD_PER_RUN", &mut self.max_cost_usd_per_run)?;
        override_from(&lookup, "EVOFLOW_RATE_WINDOW_MS", &mut self.rate_window_ms)?;
        override_from(&lookup, "EVOFLOW_MAX_REQUESTS_PER_WINDOW", &mut self.max_requests_per_window)?;
        override_from(&lookup, "EVOFLOW_ENABLE_STALL_GUARD", &mut self.enable_stall_guard)?;
        override_from(&lookup, "EVOFLOW_ENABLE_PARALLEL_LIMIT", &mut self.enable_parallel_limit)?;
        override_from(&lookup, "EVOFLOW_GENERATIONS", &mut self.generations)?;
        override_from(&lookup, "EVOFLOW_POPULATION_SIZE", &mut self.population_size)?;
        override_from(&lookup, "EVOFLOW_MAXIMUM_TIME_MINUTES", &mut self.maximum_time_minutes)?;
        override_from(&lookup, "EVOFLOW_TIME_BUDGET_SECONDS", &mut self.time_budget_seconds)?;
        override_from(&lookup, "EVOFLOW_STALL_TIMEOUT_SECS", &mut self.stall_timeout_secs)?;
        Ok(())
    }

    /// Reject budgets the engine cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.max_concurrent_ai_requests == 0 {
            return Err(EvoflowError::Config("max_concurrent_ai_requests must be at least 1".into()));
        }
        if self.max_requests_per_window == 0 || self.rate_window_ms == 0 {
            return Err(EvoflowError::Config("rate window must allow at least one request".into()));
        }
        if self.population_size == 0 {
            return Err(EvoflowError::Config("population_size must be at least 1".into()));
        }
        if self.max_cost_usd_per_run < 0.0 {
            return Err(EvoflowError::Config("max_cost_usd_per_run must not be negative".into()));
        }
        Ok(())
    }
}

fn override_from<T: FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    name: &str,
    field: &mut T,
) -> Result<()> {
    if let Some(raw) = lookup(name) {
        *field = raw
            .trim()
            .parse()
            .map_err(|_| EvoflowError::Config(format!("invalid value for {}: {:?}", name, raw)))?;
    }
    Ok(())
}

/// Saturating curve mapping an unbounded positive measurement to [0, 100],
/// where smaller measurements earn more.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SaturatingCurve {
    /// 100 at or below `baseline`, 0 at or above `threshold`, linear between.
    CappedLinear { baseline: f64, threshold: f64 },
    /// 100 / (1 + e^(steepness * (x - midpoint))).
    Logistic { midpoint: f64, steepness: f64 },
}

/// Weights of the three fitness terms.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FitnessWeights {
    #[serde(default = "default_accuracy_weight")]
    pub accuracy: f64,
    #[serde(default = "default_time_weight")]
    pub time: f64,
    #[serde(default = "default_cost_weight")]
    pub cost: f64,
}

impl Default for FitnessWeights {
    fn default() -> Self {
        Self {
            accuracy: default_accuracy_weight(),
            time: default_time_weight(),
            cost: default_cost_weight(),
        }
    }
}

fn default_accuracy_weight() -> f64 { 0.7 }
fn default_time_weight() -> f64 { 0.2 }
fn default_cost_weight() -> f64 { 0.1 }

/// Judge panel and scoring configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FitnessConfig {
    #[serde(default = "default_judge_models")]
    pub judge_models: Vec<String>,
    #[serde(default = "default_num_models")]
    pub num_models: usize,
    #[serde(default = "default_num_rounds")]
    pub num_rounds: usize,
    #[serde(default)]
    pub weights: FitnessWeights,
    #[serde(default = "default_time_curve")]
    pub time_curve: SaturatingCurve,
    #[serde(default = "default_cost_curve")]
    pub cost_curve: SaturatingCurve,
}

impl Default for FitnessConfig {
    fn default() -> Self {
        Self {
            judge_models: default_judge_models(),
            num_models: default_num_models(),
            num_rounds: default_num_rounds(),
            weights: FitnessWeights::default(),
            time_curve: default_time_curve(),
            cost_curve: default_cost_curve(),
        }
    }
}

fn default_judge_models() -> Vec<String> {
    vec!["gpt-4o-mini".to_string(), "claude-3-5-haiku-latest".to_string()]
}
fn default_num_models() -> usize { 2 }
fn default_num_rounds() -> usize { 1 }
fn default_time_curve() -> SaturatingCurve {
    SaturatingCurve::CappedLinear { baseline: 10.0, threshold: 300.0 }
}
fn default_cost_curve() -> SaturatingCurve {
    SaturatingCurve::CappedLinear { baseline: 0.01, threshold: 1.0 }
}

/// How the first generation is built.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(tag = "strategy", rename_all = "snake_case")]
pub enum InitialStrategy {
    /// Random construction from the node catalog.
    #[default]
    Random,
    /// Every seed candidate starts as a copy of this graph file.
    SeedFile { path: String },
}

/// A reusable node role used for random construction and node insertion.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NodeTemplate {
    pub description: String,
    pub system_prompt: String,
}

/// Building blocks available to random construction and mutation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeCatalog {
    #[serde(default = "default_catalog_models")]
    pub models: Vec<String>,
    #[serde(default = "default_catalog_roles")]
    pub roles: Vec<NodeTemplate>,
    #[serde(default)]
    pub mcp_tools: Vec<String>,
    #[serde(default)]
    pub code_tools: Vec<String>,
    /// Upper bound on nodes in a randomly constructed seed graph.
    #[serde(default = "default_max_seed_nodes")]
    pub max_seed_nodes: usize,
}

impl Default for NodeCatalog {
    fn default() -> Self {
        Self {
            models: default_catalog_models(),
            roles: default_catalog_roles(),
            mcp_tools: vec![],
            code_tools: vec![],
            max_seed_nodes: default_max_seed_nodes(),
        }
    }
}

fn default_catalog_models() -> Vec<String> {
    vec!["gpt-4o-mini".to_string()]
}
fn default_max_seed_nodes() -> usize { 4 }
fn default_catalog_roles() -> Vec<NodeTemplate> {
    vec![
        NodeTemplate {
            description: "Break the task into concrete steps".to_string(),
            system_prompt: "You are a planner. List the steps needed to answer the task.".to_string(),
        },
        NodeTemplate {
            description: "Research facts needed for the task".to_string(),
            system_prompt: "You are a researcher. Gather the facts needed to answer the task.".to_string(),
        },
        NodeTemplate {
            description: "Produce the final answer".to_string(),
            system_prompt: "You are a solver. Give the final answer to the task, concisely.".to_string(),
        },
        NodeTemplate {
            description: "Check and correct a draft answer".to_string(),
            system_prompt: "You are a reviewer. Check the draft answer and output a corrected final answer.".to_string(),
        },
    ]
}

/// Relative weights of the mutation operators.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MutationWeights {
    #[serde(default = "default_one")]
    pub add_node: f64,
    #[serde(default = "default_one")]
    pub remove_node: f64,
    #[serde(default = "default_two")]
    pub edit_node: f64,
    #[serde(default = "default_one")]
    pub analyze_and_repair: f64,
}

impl Default for MutationWeights {
    fn default() -> Self {
        Self {
            add_node: 1.0,
            remove_node: 1.0,
            edit_node: 2.0,
            analyze_and_repair: 1.0,
        }
    }
}

fn default_one() -> f64 { 1.0 }
fn default_two() -> f64 { 2.0 }

/// Evolutionary search configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvolutionConfig {
    #[serde(default)]
    pub initial: InitialStrategy,
    #[serde(default)]
    pub catalog: NodeCatalog,
    /// Share of each generation kept as survivors.
    #[serde(default = "default_survivor_ratio")]
    pub survivor_ratio: f64,
    #[serde(default)]
    pub mutation_weights: MutationWeights,
    /// Invalid-mutation retries before falling back to a parent copy.
    #[serde(default = "default_repair_attempts")]
    pub repair_attempts: u32,
    /// Model used by LLM-driven mutation operators.
    #[serde(default = "default_mutation_model")]
    pub mutation_model: String,
    /// Fixed seed for reproducible runs.
    #[serde(default)]
    pub rng_seed: Option<u64>,
    /// Tool-call rounds a node may take before it must answer.
    #[serde(default = "default_max_tool_rounds")]
    pub max_tool_rounds: u32,
}

impl Default for EvolutionConfig {
    fn default() -> Self {
        Self {
            initial: InitialStrategy::default(),
            catalog: NodeCatalog::default(),
            survivor_ratio: default_survivor_ratio(),
            mutation_weights: MutationWeights::default(),
            repair_attempts: default_repair_attempts(),
            mutation_model: default_mutation_model(),
            rng_seed: None,
            max_tool_rounds: default_max_tool_rounds(),
        }
    }
}

fn default_survivor_ratio() -> f64 { 0.5 }
fn default_repair_attempts() -> u32 { 3 }
fn default_mutation_model() -> String { "gpt-4o-mini".to_string() }
fn default_max_tool_rounds() -> u32 { 4 }

/// Record store location.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default = "default_store_path")]
    pub path: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: default_store_path(),
        }
    }
}

fn default_store_path() -> String { "~/.evoflow/records.db".to_string() }

/// JSONL evolution logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// Enable evolution logging (default: true when section is present).
    #[serde(default = "default_log_enabled")]
    pub enabled: bool,
    /// Directory for log files. Default: ~/.evoflow/logs
    #[serde(default)]
    pub log_dir: Option<String>,
    /// 1 = generation summaries, 2 = + candidate evaluations, 3 = + mutations.
    #[serde(default = "default_log_level")]
    pub level: u8,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            log_dir: None,
            level: 2,
        }
    }
}

fn default_log_enabled() -> bool { true }
fn default_log_level() -> u8 { 2 }

impl AppConfig {
    /// Load config from a TOML file, with env var expansion and budget overrides.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|_| EvoflowError::ConfigNotFound(path.display().to_string()))?;
        let mut config = Self::from_toml(&content)?;
        config.budget.apply_env_overrides()?;
        config.budget.validate()?;
        Ok(config)
    }

    /// Parse config text, expanding `${ENV_VAR}` references first.
    pub fn from_toml(content: &str) -> Result<Self> {
        let expanded = expand_env_vars(content);
        toml::from_str(&expanded).map_err(|e| EvoflowError::Config(e.to_string()))
    }

    /// Default config with budget overrides from the environment.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();
        config.budget.apply_env_overrides()?;
        config.budget.validate()?;
        Ok(config)
    }

    /// Resolve the record store path (expand ~).
    pub fn store_path(&self) -> PathBuf {
        let path = self
            .store
            .as_ref()
            .map(|s| s.path.clone())
            .unwrap_or_else(default_store_path);
        expand_home(&path)
    }

    /// Resolve the JSONL log directory (expand ~).
    pub fn log_dir(&self) -> PathBuf {
        let dir = self
            .log
            .as_ref()
            .and_then(|l| l.log_dir.clone())
            .unwrap_or_else(|| "~/.evoflow/logs".to_string());
        expand_home(&dir)
    }
}

fn expand_home(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs_home() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}

/// Expand `${ENV_VAR}` patterns in a string.
fn expand_env_vars(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(c) = chars.next() {
        if c == '$' && chars.peek() == Some(&'{') {
            chars.next(); // consume '{'
            let mut var_name = String::new();
            for c in chars.by_ref() {
                if c == '}' {
                    break;
                }
                var_name.push(c);
            }
            match std::env::var(&var_name) {
                Ok(val) => result.push_str(&val),
                Err(_) => {
                    // Keep original if env var not set
                    result.push_str(&format!("${{{}}}", var_name));
                }
            }
        } else {
            result.push(c);
        }
    }
    result
}

fn dirs_home() -> Option<PathBuf> {
    std::env::var("HOME").ok().map(PathBuf::from)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_expand_env_vars() {
        std::env::set_var("TEST_EVOFLOW_VAR", "hello");
        let result = expand_env_vars("key = \"${TEST_EVOFLOW_VAR}\"");
        assert_eq!(result, "key = \"hello\"");
        std::env::remove_var("TEST_EVOFLOW_VAR");
    }

    #[test]
    fn test_expand_env_vars_missing() {
        let result = expand_env_vars("key = \"${NONEXISTENT_EVOFLOW_VAR}\"");
        assert_eq!(result, "key = \"${NONEXISTENT_EVOFLOW_VAR}\"");
    }

    #[test]
    fn test_defaults_from_empty_toml() {
        let config = AppConfig::from_toml("").unwrap();
        assert_eq!(config.budget.max_nodes, 20);
        assert_eq!(config.budget.max_per_node_invocations, 1);
        assert!(config.budget.enable_stall_guard);
        assert_eq!(config.fitness.num_models, 2);
        assert_eq!(config.fitness.num_rounds, 1);
        assert!((config.fitness.weights.accuracy - 0.7).abs() < f64::EPSILON);
        assert_eq!(config.evolution.repair_attempts, 3);
        assert_eq!(config.evolution.initial, InitialStrategy::Random);
        assert!(config.store.is_none());
    }

    #[test]
    fn test_budget_overrides() {
        let env: HashMap<&str, &str> = HashMap::from([
            ("EVOFLOW_MAX_COST_USD_PER_RUN", "0.75"),
            ("EVOFLOW_ENABLE_STALL_GUARD", "false"),
            ("EVOFLOW_POPULATION_SIZE", " 12 "),
        ]);
        let mut budget = BudgetConfig::default();
        budget
            .apply_overrides(|name| env.get(name).map(|v| v.to_string()))
            .unwrap();
        assert!((budget.max_cost_usd_per_run - 0.75).abs() < f64::EPSILON);
        assert!(!budget.enable_stall_guard);
        assert_eq!(budget.population_size, 12);
        assert_eq!(budget.generations, 5);
    }

    #[test]
    fn test_budget_override_rejects_garbage() {
        let mut budget = BudgetConfig::default();
        let err = budget
            .apply_overrides(|name| (name == "EVOFLOW_MAX_NODES").then(|| "lots".to_string()))
            .unwrap_err();
        assert!(err.to_string().contains("EVOFLOW_MAX_NODES"));
    }

    #[test]
    fn test_budget_validate() {
        let budget = BudgetConfig {
            population_size: 0,
            ..BudgetConfig::default()
        };
        assert!(budget.validate().is_err());
        assert!(BudgetConfig::default().validate().is_ok());
    }

    #[test]
    fn test_full_config() {
        let toml_str = r#"
[gateway]
base_url = "http://gateway:9000"
api_key = "sk-test"

[gateway.retry]
max_retries = 5

[budget]
max_cost_usd_per_run = 2.5
generations = 10

[fitness]
judge_models = ["judge-a", "judge-b", "judge-c"]
num_models = 3
num_rounds = 2
time_curve = { kind = "logistic", midpoint = 60.0, steepness = 0.1 }

[fitness.weights]
accuracy = 0.8
time = 0.1
cost = 0.1

[evolution]
initial = { strategy = "seed_file", path = "seed.json" }
rng_seed = 7

[evolution.catalog]
models = ["small", "large"]
code_tools = ["calculator"]

[store]
path = "/tmp/evoflow.db"

[log]
level = 3
"#;
        let config = AppConfig::from_toml(toml_str).unwrap();
        assert_eq!(config.gateway.base_url, "http://gateway:9000");
        assert_eq!(config.gateway.retry.as_ref().unwrap().max_retries, 5);
        assert_eq!(config.budget.generations, 10);
        assert_eq!(config.budget.population_size, 6);
        assert_eq!(config.fitness.judge_models.len(), 3);
        assert_eq!(
            config.fitness.time_curve,
            SaturatingCurve::Logistic { midpoint: 60.0, steepness: 0.1 }
        );
        assert_eq!(
            config.evolution.initial,
            InitialStrategy::SeedFile { path: "seed.json".to_string() }
        );
        assert_eq!(config.evolution.rng_seed, Some(7));
        assert_eq!(config.evolution.catalog.code_tools, vec!["calculator"]);
        assert_eq!(config.evolution.catalog.roles.len(), 4);
        assert_eq!(config.store_path(), PathBuf::from("/tmp/evoflow.db"));
        assert_eq!(config.log.unwrap().level, 3);
    }
}
