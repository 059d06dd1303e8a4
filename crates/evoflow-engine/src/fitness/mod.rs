//! Fitness evaluation: a panel of judge models grades a run's answer, and
//! the averaged accuracy is combined with time and cost terms.

pub mod judge;
pub mod normalize;

use std::sync::Arc;

use futures::future::join_all;
use tracing::{debug, warn};

use evoflow_core::config::FitnessConfig;
use evoflow_core::trace::{FitnessResult, RunTrace};
use evoflow_core::traits::ModelClient;
use evoflow_core::types::{ChatMessage, CompletionRequest};

use crate::rate::RateController;
use crate::task::EvalTask;

pub struct FitnessEvaluator {
    model: Arc<dyn ModelClient>,
    rate: RateController,
    config: FitnessConfig,
}

impl FitnessEvaluator {
    pub fn new(model: Arc<dyn ModelClient>, rate: RateController, config: FitnessConfig) -> Self {
        Self {
            model,
            rate,
            config,
        }
    }

    pub fn config(&self) -> &FitnessConfig {
        &self.config
    }

    /// Distinct judge models in configured order, capped at `num_models`.
    pub fn judges(&self) -> Vec<String> {
        let mut judges: Vec<String> = Vec::new();
        for model in &self.config.judge_models {
            if !judges.contains(model) {
                judges.push(model.clone());
            }
        }
        judges.truncate(self.config.num_models);
        judges
    }

    pub async fn score_task(&self, trace: &RunTrace, task: &EvalTask) -> FitnessResult {
        self.score(trace, &task.ground_truth, task.rubric.as_deref())
            .await
    }

    /// Score one trace. Never fails: when no judge round produces a usable
    /// accuracy the result is zero fitness.
    pub async fn score(
        &self,
        trace: &RunTrace,
        ground_truth: &str,
        rubric: Option<&str>,
    ) -> FitnessResult {
        let cost = trace.total_cost_usd();
        let time = trace.total_time_seconds();

        let Some(answer) = judge::answer_of(trace) else {
            debug!(run_id = %trace.run_id, "Trace has no answer, scoring zero");
            return FitnessResult::zero(cost, time, 0.0);
        };

        let prompt = judge::build_judge_prompt(answer, trace, ground_truth, rubric);
        let rounds = self.config.num_rounds.max(1);
        let calls = self
            .judges()
            .into_iter()
            .flat_map(|model| std::iter::repeat(model).take(rounds))
            .map(|model| self.judge_once(model, prompt.clone()));
        let verdicts = join_all(calls).await;

        let judge_cost: f64 = verdicts.iter().map(|(_, c)| c).sum();
        let accuracies: Vec<f64> = verdicts.iter().filter_map(|(a, _)| *a).collect();

        if accuracies.is_empty() {
            warn!(
                run_id = %trace.run_id,
                rounds = verdicts.len(),
                "All judge rounds failed, scoring zero"
            );
            return FitnessResult::zero(cost, time, judge_cost);
        }

        let accuracy = accuracies.iter().sum::<f64>() / accuracies.len() as f64;
        let time_term = normalize::saturate(&self.config.time_curve, time);
        let cost_term = normalize::saturate(&self.config.cost_curve, cost);
        let score = normalize::combine(accuracy, time_term, cost_term, &self.config.weights);

        debug!(
            run_id = %trace.run_id,
            score,
            accuracy,
            time_term,
            cost_term,
            judgements = accuracies.len(),
            "Trace scored"
        );

        FitnessResult {
            score,
            accuracy,
            total_cost_usd: cost,
            total_time_seconds: time,
            judge_cost_usd: judge_cost,
            judgements: accuracies.len() as u32,
        }
    }

    /// One judge round. Returns the accuracy if the reply was usable, and
    /// whatever the call cost either way.
    async fn judge_once(&self, model: String, prompt: String) -> (Option<f64>, f64) {
        let request = CompletionRequest::structured(
            &model,
            vec![
                ChatMessage::system(judge::JUDGE_SYSTEM_PROMPT),
                ChatMessage::user(prompt),
            ],
            judge::judge_schema(),
        );

        match self.rate.complete(self.model.as_ref(), request).await {
            Ok(response) => {
                let cost = response.usd_cost;
                match response.into_result() {
                    Ok(data) => {
                        let accuracy = judge::parse_accuracy(&data);
                        if accuracy.is_none() {
                            warn!(judge = %model, "Judge reply had no accuracy");
                        }
                        (accuracy, cost)
                    }
                    Err(e) => {
                        warn!(judge = %model, error = %e, "Judge round failed");
                        (None, cost)
                    }
                }
            }
            Err(e) => {
                warn!(judge = %model, error = %e, "Judge round failed");
                (None, 0.0)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use chrono::{TimeZone, Utc};
    use evoflow_core::config::SaturatingCurve;
    use evoflow_core::trace::{InvocationStatus, NodeInvocation, TerminationReason};
    use evoflow_core::types::RunId;
    use evoflow_test_utils::{Reply, Rule, ScriptedModel};
    use serde_json::json;

    use crate::rate::RateLimits;

    fn rate() -> RateController {
        RateController::new(RateLimits {
            max_concurrent: 4,
            max_per_window: 1000,
            window: Duration::from_millis(1000),
            max_workflows: None,
            stall_timeout: None,
        })
    }

    fn config(judges: &[&str], num_models: usize, num_rounds: usize) -> FitnessConfig {
        FitnessConfig {
            judge_models: judges.iter().map(|s| s.to_string()).collect(),
            num_models,
            num_rounds,
            ..FitnessConfig::default()
        }
    }

    /// A completed trace with a fixed 5 second duration and the given cost.
    fn trace(output: Option<&str>, cost: f64) -> RunTrace {
        let start = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap();
        let end = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 5).unwrap();
        RunTrace {
            run_id: RunId::new(),
            invocations: vec![NodeInvocation {
                node_id: "A".into(),
                input: "q".into(),
                output: output.map(String::from),
                error: None,
                start_time: start,
                end_time: end,
                cost,
                status: InvocationStatus::Succeeded,
                tool_calls: vec![],
            }],
            total_invocations: 1,
            per_node_invocations: [("A".to_string(), 1)].into_iter().collect(),
            termination: TerminationReason::Completed,
            started_at: start,
            finished_at: end,
            final_output: output.map(String::from),
        }
    }

    #[tokio::test]
    async fn test_one_judge_failure_averages_survivor() {
        let model = Arc::new(
            ScriptedModel::new()
                .rule(Rule::model("judge-a", Reply::error("overloaded")))
                .rule(Rule::model("judge-b", Reply::structured(json!({"accuracy": 80}))).cost(0.002)),
        );
        let eval = FitnessEvaluator::new(model.clone(), rate(), config(&["judge-a", "judge-b"], 2, 1));
        let result = eval.score(&trace(Some("42"), 0.0), "42", None).await;

        assert_eq!(result.judgements, 1);
        assert!((result.accuracy - 80.0).abs() < 1e-9);
        // 0.7 * 80 + 0.8 * (0.2 * 100 + 0.1 * 100)
        assert_eq!(result.score, 80);
        assert!((result.judge_cost_usd - 0.002).abs() < 1e-9);
        assert_eq!(model.call_count(), 2);
    }

    #[tokio::test]
    async fn test_all_judges_fail_gives_zero() {
        let model = Arc::new(
            ScriptedModel::new()
                .rule(Rule::model("judge-a", Reply::fail("bad")).cost(0.001))
                .rule(Rule::model("judge-b", Reply::text("I cannot grade this"))),
        );
        let eval = FitnessEvaluator::new(model, rate(), config(&["judge-a", "judge-b"], 2, 1));
        let result = eval.score(&trace(Some("42"), 0.3), "42", None).await;

        assert_eq!(result.score, 0);
        assert_eq!(result.accuracy, 0.0);
        assert_eq!(result.judgements, 0);
        assert!((result.total_cost_usd - 0.3).abs() < 1e-9);
        assert!((result.judge_cost_usd - 0.001).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_zero_accuracy_scores_zero() {
        let model = Arc::new(
            ScriptedModel::new().rule(Rule::any(Reply::structured(json!({"accuracy": 0})))),
        );
        let eval = FitnessEvaluator::new(model, rate(), config(&["j"], 1, 3));
        let result = eval.score(&trace(Some("wrong"), 0.0), "42", None).await;
        assert_eq!(result.score, 0);
        assert_eq!(result.judgements, 3);
    }

    #[tokio::test]
    async fn test_judges_are_deduplicated_and_capped() {
        let model = Arc::new(
            ScriptedModel::new().rule(Rule::any(Reply::structured(json!({"accuracy": 100})))),
        );
        let eval = FitnessEvaluator::new(
            model.clone(),
            rate(),
            config(&["a", "a", "b", "c"], 2, 2),
        );
        assert_eq!(eval.judges(), vec!["a", "b"]);
        let result = eval.score(&trace(Some("42"), 0.0), "42", Some("exact")).await;
        assert_eq!(model.call_count(), 4);
        assert_eq!(result.score, 100);
    }

    #[tokio::test]
    async fn test_no_answer_skips_judging() {
        let model = Arc::new(ScriptedModel::new());
        let eval = FitnessEvaluator::new(model.clone(), rate(), FitnessConfig::default());
        let result = eval.score(&trace(None, 0.05), "42", None).await;
        assert_eq!(result.score, 0);
        assert_eq!(model.call_count(), 0);
    }

    #[tokio::test]
    async fn test_cost_and_time_curves_apply() {
        let model = Arc::new(
            ScriptedModel::new().rule(Rule::any(Reply::structured(json!({"accuracy": 100})))),
        );
        let mut cfg = config(&["j"], 1, 1);
        cfg.time_curve = SaturatingCurve::CappedLinear {
            baseline: 0.0,
            threshold: 10.0,
        };
        cfg.cost_curve = SaturatingCurve::CappedLinear {
            baseline: 0.0,
            threshold: 1.0,
        };
        let eval = FitnessEvaluator::new(model, rate(), cfg);
        // 5s of 10s -> 50; $1 of $1 -> 0; 70 + 0.2 * 50 + 0.1 * 0
        let result = eval.score(&trace(Some("42"), 1.0), "42", None).await;
        assert_eq!(result.score, 80);
    }
}
