use std::sync::Arc;

use rand::rngs::StdRng;
use rand::SeedableRng;
use serde_json::json;
use tokio_util::sync::CancellationToken;

use evoflow_core::config::{AppConfig, MutationWeights, NodeCatalog};
use evoflow_core::record::RecordKind;
use evoflow_core::traits::RecordStore;
use evoflow_engine::evolution::{seed_population, Origin};
use evoflow_engine::task::parse_tasks;
use evoflow_engine::{
    EvolutionEngine, EvolutionLogger, Executor, GraphValidator, RateController, RunBudgets, StopReason,
};
use evoflow_store::{MemoryRecordStore, SqliteRecordStore};
use evoflow_test_utils::{fixtures, Reply, Rule, ScriptedModel};
use evoflow_tools::ToolRegistry;

fn base_config() -> AppConfig {
    let mut config = AppConfig::default();
    config.budget.enable_stall_guard = false;
    config.fitness.judge_models = vec!["judge-a".into(), "judge-b".into()];
    config.fitness.num_models = 2;
    config.fitness.num_rounds = 1;
    config.evolution.rng_seed = Some(2024);
    config.evolution.mutation_model = "mutator".into();
    config.evolution.catalog = NodeCatalog {
        models: vec!["worker".into(), "strong".into()],
        code_tools: vec!["calculator".into()],
        ..NodeCatalog::default()
    };
    config
}

/// Workers answer "42"; judges give 90 when the answer mentions 42.
fn scripted() -> ScriptedModel {
    ScriptedModel::new()
        .rule(Rule::model("judge-a", Reply::structured(json!({"accuracy": 90}))).and_contains("Workflow answer:\n42"))
        .rule(Rule::model("judge-b", Reply::text("Accuracy: 70")).and_contains("Workflow answer:\n42"))
        .rule(Rule::model("judge-a", Reply::structured(json!({"accuracy": 10}))))
        .rule(Rule::model("judge-b", Reply::error("judge offline")))
        .rule(Rule::model("mutator", Reply::text("You are a precise solver. Answer with the number only.")))
        .default_reply(Reply::text("42"))
        .default_cost(0.001)
}

#[tokio::test]
async fn test_end_to_end_evolution_with_sqlite_store_and_log() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = base_config();
    config.budget.population_size = 4;
    config.budget.generations = 3;

    let store = Arc::new(SqliteRecordStore::open(&dir.path().join("records.db")).unwrap());
    let engine = EvolutionEngine::new(&config, Arc::new(scripted()), Arc::new(ToolRegistry::with_builtins()))
        .with_seed_graph(fixtures::graph(fixtures::SEQUENTIAL_CHAIN))
        .with_store(store.clone());
    let logger = EvolutionLogger::new(dir.path().join("logs"), 3).spawn(
        &engine.event_bus(),
        engine.evolution_id().to_string(),
        CancellationToken::new(),
    );

    let tasks = parse_tasks(fixtures::TASKS).unwrap();
    let outcome = engine.run(&tasks).await.unwrap();
    logger.await.unwrap();

    assert_eq!(outcome.stop_reason, StopReason::GenerationsReached);
    assert_eq!(outcome.generations, 3);
    assert_eq!(outcome.history.len(), 3);
    assert!(outcome.spent_usd > 0.0);

    let best = outcome.best.fitness.expect("best was scored");
    assert!(best.score > 0);
    assert!((best.accuracy - 80.0).abs() < 1e-9);
    assert!(GraphValidator::default().validate(&outcome.best.graph).is_ok());

    // Best never gets worse across generations because elites are carried.
    for pair in outcome.history.windows(2) {
        assert!(pair[1].best_score >= pair[0].best_score);
    }

    assert_eq!(store.count(RecordKind::Generation).unwrap(), 3);
    assert!(store.count(RecordKind::Fitness).unwrap() >= 4);
    assert!(store.count(RecordKind::Trace).unwrap() >= 8);

    let id = format!("generation/{}/2", outcome.evolution_id);
    let record = store.fetch(&id).await.unwrap().expect("last generation persisted");
    assert_eq!(record.payload["index"], 2);

    let log_dir = dir.path().join("logs").join(&outcome.evolution_id);
    let log_file = std::fs::read_dir(log_dir).unwrap().next().unwrap().unwrap().path();
    let content = std::fs::read_to_string(log_file).unwrap();
    assert!(content.contains("\"event_type\":\"generation_committed\""));
    assert!(content.contains("\"event_type\":\"candidate_evaluated\""));
    assert!(content.lines().last().unwrap().contains("\"event_type\":\"terminated\""));
}

#[tokio::test]
async fn test_cost_limit_stops_five_candidate_generation() {
    let mut config = base_config();
    config.budget.population_size = 5;
    config.budget.generations = 4;
    config.budget.max_cost_usd_per_run = 0.25;
    config.fitness.judge_models = vec!["judge-a".into()];
    config.fitness.num_models = 1;

    // Judging costs 0.1 per candidate and nodes are free, so the third
    // scored candidate pushes spend past the limit.
    let model = Arc::new(
        ScriptedModel::new()
            .rule(Rule::model("judge-a", Reply::structured(json!({"accuracy": 60}))).cost(0.1))
            .default_reply(Reply::text("42")),
    );
    let store = Arc::new(MemoryRecordStore::new());
    let engine = EvolutionEngine::new(&config, model.clone(), Arc::new(ToolRegistry::with_builtins()))
        .with_seed_graph(fixtures::graph(fixtures::SINGLE_NODE))
        .with_store(store.clone());

    let tasks = parse_tasks(fixtures::TASKS).unwrap()[..1].to_vec();
    let outcome = engine.run(&tasks).await.unwrap();

    assert_eq!(outcome.stop_reason, StopReason::SpendLimit);
    assert_eq!(outcome.generations, 1);
    let scored = outcome.history[0].evaluated;
    assert_eq!(scored, 3);
    assert!(scored < 5);
    assert_eq!(
        store.ids_with_prefix(&format!("fitness/{}/", outcome.evolution_id)).len(),
        scored
    );
    assert!(outcome.best.fitness.is_some());
    // Candidates still being judged when the limit hit are drained and paid for.
    assert!((outcome.spent_usd - model.total_charged()).abs() < 1e-9);
}

#[tokio::test]
async fn test_budgets_hold_for_every_seeded_graph() {
    let config = base_config();
    let mut rng = StdRng::seed_from_u64(99);
    let catalog = NodeCatalog {
        max_seed_nodes: 6,
        ..config.evolution.catalog.clone()
    };
    let population = seed_population(None, &catalog, 25, &GraphValidator::default(), &mut rng).unwrap();

    let executor = Executor::new(
        Arc::new(ScriptedModel::new().default_reply(Reply::text("done"))),
        Arc::new(ToolRegistry::with_builtins()),
        RateController::from_budget(&config.budget),
    );
    let budgets = RunBudgets {
        max_total_invocations: 3,
        max_per_node_invocations: 1,
        ..RunBudgets::default()
    };

    for candidate in &population {
        let trace = executor.run(&candidate.graph, "task", &budgets).await.unwrap();
        assert!(trace.total_invocations <= 3);
        assert!(trace.invocations.len() <= 3);
        assert!(trace.per_node_invocations.values().all(|n| *n <= 1));
        if candidate.graph.nodes.len() <= 3 {
            assert!(!trace.is_truncated(), "small graph should complete");
            assert!(trace.final_output.is_some());
        }
    }
}

#[tokio::test]
async fn test_rejected_mutations_fall_back_to_parent_copies() {
    let mut config = base_config();
    config.budget.population_size = 3;
    config.budget.generations = 2;
    config.evolution.repair_attempts = 2;
    config.evolution.mutation_weights = MutationWeights {
        add_node: 0.0,
        remove_node: 0.0,
        edit_node: 0.0,
        analyze_and_repair: 1.0,
    };
    // Repairs always come back as prose, so every mutation is rejected.
    let model = ScriptedModel::new()
        .rule(Rule::model("mutator", Reply::text("I cannot produce JSON today.")))
        .rule(Rule::model("judge-a", Reply::structured(json!({"accuracy": 50}))))
        .rule(Rule::model("judge-b", Reply::structured(json!({"accuracy": 50}))))
        .default_reply(Reply::text("42"));
    let engine = EvolutionEngine::new(&config, Arc::new(model), Arc::new(ToolRegistry::new()))
        .with_seed_graph(fixtures::graph(fixtures::SINGLE_NODE));
    let mut events = engine.event_bus().subscribe();

    let outcome = engine.run(&parse_tasks(fixtures::TASKS).unwrap()).await.unwrap();
    assert_eq!(outcome.stop_reason, StopReason::GenerationsReached);

    let last = outcome.history.last().unwrap();
    assert!(last.members.iter().any(|m| m.origin == Origin::ParentCopy));

    let mut rejected = 0;
    while let Ok(event) = events.try_recv() {
        if let evoflow_core::types::EvolutionEvent::MutationRejected { operator, .. } = event {
            assert_eq!(operator, "analyze_and_repair");
            rejected += 1;
        }
    }
    assert!(rejected >= 1);
}
