use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::stream::{FuturesUnordered, StreamExt};
use tokio::time::{sleep_until, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use evoflow_core::config::BudgetConfig;
use evoflow_core::error::Result;
use evoflow_core::graph::{WorkflowGraph, WorkflowNode};
use evoflow_core::trace::{
    BudgetKind, InvocationStatus, NodeInvocation, RunTrace, TerminationReason, ToolUsage,
};
use evoflow_core::traits::ModelClient;
use evoflow_core::types::{
    ChatMessage, CompletionData, CompletionRequest, RunId, ToolContext, ToolDefinition,
};
use evoflow_tools::ToolRegistry;

use super::handoff::{parse_handoff_choice, HandOffPlan, Target};
use super::validate::{GraphValidator, ValidatedGraph};
use crate::fitness::judge::extract_json;
use crate::rate::{RateController, StallGuard};

const DEFAULT_NODE_PROMPT: &str = "Complete the task.";
const ROUTER_PROMPT: &str =
    "You route work between the steps of an agent workflow. Pick the single best next step.";

/// Per-run limits checked before every dispatch.
#[derive(Debug, Clone)]
pub struct RunBudgets {
    pub max_total_invocations: u32,
    pub max_per_node_invocations: u32,
    /// Cap on distinct nodes invoked in one run.
    pub max_nodes: usize,
    pub time_budget: Duration,
}

impl From<&BudgetConfig> for RunBudgets {
    fn from(budget: &BudgetConfig) -> Self {
        Self {
            max_total_invocations: budget.max_total_node_invocations,
            max_per_node_invocations: budget.max_per_node_invocations,
            max_nodes: budget.max_nodes,
            time_budget: Duration::from_secs(budget.time_budget_seconds),
        }
    }
}

impl Default for RunBudgets {
    fn default() -> Self {
        Self::from(&BudgetConfig::default())
    }
}

/// Runs validated workflow graphs.
///
/// Ready nodes are dispatched concurrently; every model call a node makes
/// (including tool rounds and conditional routing) goes through the shared
/// [`RateController`]. Invocations are recorded in completion order.
pub struct Executor {
    model: Arc<dyn ModelClient>,
    tools: Arc<ToolRegistry>,
    rate: RateController,
    validator: GraphValidator,
    max_tool_rounds: u32,
}

impl Executor {
    pub fn new(model: Arc<dyn ModelClient>, tools: Arc<ToolRegistry>, rate: RateController) -> Self {
        Self {
            model,
            tools,
            rate,
            validator: GraphValidator::default(),
            max_tool_rounds: 4,
        }
    }

    pub fn with_max_tool_rounds(mut self, rounds: u32) -> Self {
        self.max_tool_rounds = rounds;
        self
    }

    pub fn with_validator(mut self, validator: GraphValidator) -> Self {
        self.validator = validator;
        self
    }

    pub fn rate(&self) -> &RateController {
        &self.rate
    }

    pub fn validator(&self) -> &GraphValidator {
        &self.validator
    }

    /// Validate and run a graph. Only a `GraphError` is returned as `Err`;
    /// node failures, budget truncation and stalls are recorded in the trace.
    pub async fn run(
        &self,
        graph: &WorkflowGraph,
        input: &str,
        budgets: &RunBudgets,
    ) -> Result<RunTrace> {
        self.run_with_cancel(graph, input, budgets, CancellationToken::new())
            .await
    }

    pub async fn run_with_cancel(
        &self,
        graph: &WorkflowGraph,
        input: &str,
        budgets: &RunBudgets,
        cancel: CancellationToken,
    ) -> Result<RunTrace> {
        let validated = self.validator.validate(graph)?;
        Ok(self.run_validated(&validated, input, budgets, cancel).await)
    }

    /// Run an already validated graph to completion, truncation, or stall.
    pub async fn run_validated(
        &self,
        graph: &ValidatedGraph,
        input: &str,
        budgets: &RunBudgets,
        cancel: CancellationToken,
    ) -> RunTrace {
        let _slot = self.rate.acquire_workflow().await.ok();

        let run_id = RunId::new();
        let started_at = Utc::now();
        let started = Instant::now();
        let deadline = started + budgets.time_budget;
        let mut stall = self.rate.stall_guard();

        let mut sched = Scheduler::new(graph);
        let mut invocations = Vec::new();
        let mut total_invocations = 0u32;
        let mut per_node: BTreeMap<String, u32> = BTreeMap::new();
        let mut termination: Option<TerminationReason> = None;
        let mut pending: HashMap<String, (String, DateTime<Utc>)> = HashMap::new();
        let mut in_flight = FuturesUnordered::new();

        info!(
            run_id = %run_id,
            entry = %graph.entry(),
            nodes = graph.len(),
            "Starting workflow run"
        );

        loop {
            if termination.is_none() && cancel.is_cancelled() {
                info!(run_id = %run_id, "Run cancelled before dispatch");
                termination = Some(TerminationReason::Cancelled);
                sched.clear_ready();
            }

            if termination.is_none() {
                while let Some(node_id) = sched.pop_ready() {
                    if let Some(budget) = exceeded_budget(
                        budgets,
                        total_invocations,
                        &per_node,
                        &node_id,
                        started,
                    ) {
                        warn!(
                            run_id = %run_id,
                            node_id = %node_id,
                            budget = ?budget,
                            "Run budget exhausted, truncating"
                        );
                        termination = Some(TerminationReason::Truncated { budget });
                        sched.clear_ready();
                        break;
                    }

                    total_invocations += 1;
                    *per_node.entry(node_id.clone()).or_insert(0) += 1;

                    let node_input = sched.input_for(&node_id, input);
                    pending.insert(node_id.clone(), (node_input.clone(), Utc::now()));
                    in_flight.push(self.invoke_node(run_id.clone(), graph, node_id, node_input));
                }
            }

            if in_flight.is_empty() {
                break;
            }

            let stall_at = stall.as_ref().map(StallGuard::deadline);

            tokio::select! {
                Some(outcome) = in_flight.next() => {
                    if let Some(guard) = stall.as_mut() {
                        guard.touch();
                    }
                    pending.remove(&outcome.node_id);
                    invocations.push(settle(&mut sched, &run_id, outcome));
                }
                _ = sleep_until(deadline), if termination.is_none() => {
                    warn!(
                        run_id = %run_id,
                        in_flight = in_flight.len(),
                        "Run time budget expired, draining in-flight nodes"
                    );
                    termination = Some(TerminationReason::Truncated {
                        budget: BudgetKind::TimeBudget,
                    });
                    sched.clear_ready();
                }
                _ = cancel.cancelled(), if termination.is_none() => {
                    info!(
                        run_id = %run_id,
                        in_flight = in_flight.len(),
                        "Run cancelled, draining in-flight nodes"
                    );
                    termination = Some(TerminationReason::Cancelled);
                    sched.clear_ready();
                }
                _ = sleep_until(stall_at.unwrap_or(deadline)), if stall_at.is_some() => {
                    if let Some(guard) = stall.as_mut() {
                        if let Err(e) = guard.check(&self.rate) {
                            warn!(run_id = %run_id, error = %e, "Stall guard tripped, aborting run");
                            let idle_secs = match e {
                                evoflow_core::EvoflowError::Stalled { idle_secs } => idle_secs,
                                _ => 0,
                            };
                            termination.get_or_insert(TerminationReason::Stalled { idle_secs });
                            break;
                        }
                    }
                }
            }
        }

        // Anything still in flight was aborted by the stall guard.
        drop(in_flight);
        let mut aborted: Vec<_> = pending.into_iter().collect();
        aborted.sort_by(|a, b| a.0.cmp(&b.0));
        let now = Utc::now();
        for (node_id, (node_input, start_time)) in aborted {
            invocations.push(NodeInvocation {
                node_id,
                input: node_input,
                output: None,
                error: Some("aborted: run stalled".to_string()),
                start_time,
                end_time: now,
                cost: 0.0,
                status: InvocationStatus::Failed,
                tool_calls: vec![],
            });
        }

        let termination = termination.unwrap_or(TerminationReason::Completed);
        let trace = RunTrace {
            run_id,
            invocations,
            total_invocations,
            per_node_invocations: per_node,
            termination,
            started_at,
            finished_at: Utc::now(),
            final_output: sched.final_output(),
        };

        info!(
            run_id = %trace.run_id,
            invocations = trace.total_invocations,
            failed = trace.failed_nodes().len(),
            cost_usd = trace.total_cost_usd(),
            termination = ?trace.termination,
            "Workflow run finished"
        );
        trace
    }

    async fn invoke_node(
        &self,
        run_id: RunId,
        graph: &ValidatedGraph,
        node_id: String,
        input: String,
    ) -> NodeOutcome {
        let start_time = Utc::now();
        let mut outcome = NodeOutcome {
            node_id,
            input,
            result: Err(String::new()),
            route: None,
            cost: 0.0,
            tool_calls: vec![],
            start_time,
            end_time: start_time,
        };

        let Some(node) = graph.graph().node(&outcome.node_id) else {
            outcome.result = Err(format!("node '{}' not in graph", outcome.node_id));
            return outcome;
        };
        let plan = graph.plan(&node.node_id);

        info!(run_id = %run_id, node_id = %node.node_id, model = %node.model_name, "Executing graph node");

        let system = build_system_prompt(node, plan, graph.graph());
        let result = self
            .run_turns(
                &run_id,
                node,
                system,
                &outcome.input,
                &mut outcome.cost,
                &mut outcome.tool_calls,
            )
            .await;
        outcome.result = result;

        if let (Ok(output), Some(HandOffPlan::Conditional { targets })) = (&outcome.result, plan) {
            let (route, cost) = self.select_route(node, output, targets, graph.graph()).await;
            outcome.cost += cost;
            outcome.route = route;
        }

        outcome.end_time = Utc::now();
        debug!(
            node_id = %outcome.node_id,
            succeeded = outcome.result.is_ok(),
            cost_usd = outcome.cost,
            "Node execution complete"
        );
        outcome
    }

    /// Model turns for one node: tool rounds up to the cap, then a final
    /// answer without tools.
    async fn run_turns(
        &self,
        run_id: &RunId,
        node: &WorkflowNode,
        system: String,
        input: &str,
        cost: &mut f64,
        tool_calls: &mut Vec<ToolUsage>,
    ) -> std::result::Result<String, String> {
        let definitions: Vec<ToolDefinition> = self.tools.definitions_for(node.tool_refs());
        let mut messages = vec![ChatMessage::system(system), ChatMessage::user(input)];

        for round in 0..=self.max_tool_rounds {
            let offer_tools = !definitions.is_empty() && round < self.max_tool_rounds;
            let mut request = CompletionRequest::text(&node.model_name, messages.clone());
            if offer_tools {
                request = request.with_tools(definitions.clone());
            }

            let response = self
                .rate
                .complete(self.model.as_ref(), request)
                .await
                .map_err(|e| e.to_string())?;
            *cost += response.usd_cost;

            match response.into_result()? {
                CompletionData::ToolCalls(calls) if !calls.is_empty() => {
                    if !offer_tools {
                        return Err(format!(
                            "model requested tools after {} tool rounds",
                            self.max_tool_rounds
                        ));
                    }
                    messages.push(ChatMessage::assistant_tool_calls(&calls));
                    for call in calls {
                        let allowed = node.tool_refs().any(|t| t == call.name);
                        let result = if allowed {
                            let ctx = ToolContext {
                                run_id: run_id.clone(),
                                node_id: node.node_id.clone(),
                            };
                            self.tools.execute(&call.name, call.input.clone(), ctx).await
                        } else {
                            Err(evoflow_core::EvoflowError::ToolNotFound(call.name.clone()))
                        };

                        let (content, success, error) = match result {
                            Ok(r) => (r.content(), r.success, r.error.clone()),
                            Err(e) => (e.to_string(), false, Some(e.to_string())),
                        };
                        if !success {
                            debug!(node_id = %node.node_id, tool = %call.name, "Tool call failed");
                        }
                        tool_calls.push(ToolUsage {
                            tool: call.name.clone(),
                            success,
                            error,
                        });
                        messages.push(ChatMessage::tool_result(&call.id, content, !success));
                    }
                }
                data => return Ok(data.as_text()),
            }
        }

        Err("tool round limit reached".to_string())
    }

    /// Ask the node's model to pick one hand-off target. Returns `None` when
    /// the call fails or names something that is not a target.
    async fn select_route(
        &self,
        node: &WorkflowNode,
        output: &str,
        targets: &[Target],
        graph: &WorkflowGraph,
    ) -> (Option<Target>, f64) {
        let ids: Vec<String> = targets.iter().map(Target::to_string).collect();
        let schema = serde_json::json!({
            "type": "object",
            "properties": {"next": {"type": "string", "enum": ids}},
            "required": ["next"]
        });
        let prompt = format!(
            "Step '{}' has finished.\n\n## Options\n\n{}\n\n## Step output\n\n{}\n\n\
             Respond with JSON: {{\"next\": \"<option id>\"}}",
            node.node_id,
            describe_targets(targets, graph),
            output
        );
        let request = CompletionRequest::structured(
            &node.model_name,
            vec![ChatMessage::system(ROUTER_PROMPT), ChatMessage::user(prompt)],
            schema,
        );

        match self.rate.complete(self.model.as_ref(), request).await {
            Ok(response) => {
                let cost = response.usd_cost;
                match response.into_result() {
                    Ok(data) => {
                        let route = parse_route(&data, &ids).map(|id| Target::parse(&id));
                        if route.is_none() {
                            warn!(node_id = %node.node_id, "Route selection named no valid target");
                        }
                        (route, cost)
                    }
                    Err(e) => {
                        warn!(node_id = %node.node_id, error = %e, "Route selection failed");
                        (None, cost)
                    }
                }
            }
            Err(e) => {
                warn!(node_id = %node.node_id, error = %e, "Route selection failed");
                (None, 0.0)
            }
        }
    }
}

struct NodeOutcome {
    node_id: String,
    input: String,
    result: std::result::Result<String, String>,
    route: Option<Target>,
    cost: f64,
    tool_calls: Vec<ToolUsage>,
    start_time: DateTime<Utc>,
    end_time: DateTime<Utc>,
}

fn settle(sched: &mut Scheduler<'_>, run_id: &RunId, outcome: NodeOutcome) -> NodeInvocation {
    let (status, output, error) = match outcome.result {
        Ok(output) => {
            let next = sched.on_success(&outcome.node_id, &output, outcome.route);
            debug!(
                run_id = %run_id,
                node_id = %outcome.node_id,
                next = ?next.iter().map(Target::to_string).collect::<Vec<_>>(),
                "Hand-off resolved"
            );
            (InvocationStatus::Succeeded, Some(output), None)
        }
        Err(error) => {
            warn!(run_id = %run_id, node_id = %outcome.node_id, error = %error, "Graph node failed");
            sched.on_failure(&outcome.node_id);
            (InvocationStatus::Failed, None, Some(error))
        }
    };
    NodeInvocation {
        node_id: outcome.node_id,
        input: outcome.input,
        output,
        error,
        start_time: outcome.start_time,
        end_time: outcome.end_time,
        cost: outcome.cost,
        status,
        tool_calls: outcome.tool_calls,
    }
}

fn exceeded_budget(
    budgets: &RunBudgets,
    total: u32,
    per_node: &BTreeMap<String, u32>,
    node_id: &str,
    started: Instant,
) -> Option<BudgetKind> {
    let node_count = per_node.get(node_id).copied();
    if total >= budgets.max_total_invocations {
        Some(BudgetKind::TotalInvocations)
    } else if node_count.unwrap_or(0) >= budgets.max_per_node_invocations {
        Some(BudgetKind::PerNodeInvocations)
    } else if node_count.is_none() && per_node.len() >= budgets.max_nodes {
        Some(BudgetKind::NodeCount)
    } else if started.elapsed() >= budgets.time_budget {
        Some(BudgetKind::TimeBudget)
    } else {
        None
    }
}

fn build_system_prompt(
    node: &WorkflowNode,
    plan: Option<&HandOffPlan>,
    graph: &WorkflowGraph,
) -> String {
    let mut prompt = if node.system_prompt.trim().is_empty() {
        DEFAULT_NODE_PROMPT.to_string()
    } else {
        node.system_prompt.clone()
    };

    if let Some(memory) = node.memory.as_ref().filter(|m| !m.is_empty()) {
        prompt.push_str("\n\n## Notes\n\n");
        for (key, value) in memory {
            prompt.push_str(&format!("**{}**: {}\n", key, value));
        }
    }

    if let Some(plan) = plan.filter(|p| p.wants_choice()) {
        prompt.push_str(
            "\n\n## Next step\n\nFinish your reply with a line `HANDOFF: <id>` naming one of:\n\n",
        );
        prompt.push_str(&describe_targets(&plan.targets(), graph));
    }
    prompt
}

fn describe_targets(targets: &[Target], graph: &WorkflowGraph) -> String {
    targets
        .iter()
        .map(|t| match t {
            Target::End => format!("- {}: finish and return the answer", t),
            Target::Node(id) => match graph.node(id).map(|n| n.description.as_str()) {
                Some(desc) if !desc.is_empty() => format!("- {}: {}", id, desc),
                _ => format!("- {}", id),
            },
        })
        .collect::<Vec<_>>()
        .join("\n")
}

fn parse_route(data: &CompletionData, ids: &[String]) -> Option<String> {
    let candidate = match data {
        CompletionData::Structured(v) => v.get("next").and_then(|n| n.as_str()).map(String::from),
        CompletionData::Text(text) => serde_json::from_str::<serde_json::Value>(&extract_json(text))
            .ok()
            .and_then(|v| v.get("next").and_then(|n| n.as_str()).map(String::from))
            .or_else(|| Some(text.trim().trim_matches('"').to_string())),
        CompletionData::ToolCalls(_) => None,
    }?;
    ids.iter().find(|id| **id == candidate).cloned()
}

/// Readiness bookkeeping for one run.
///
/// A node is enqueued at most once. A join is enqueued when every
/// predecessor in its `waitFor` has handed off to it; once any of them
/// fails or routes elsewhere the join, and everything below it, is
/// excluded for the rest of the run.
struct Scheduler<'g> {
    graph: &'g ValidatedGraph,
    ready: VecDeque<String>,
    scheduled: HashSet<String>,
    excluded: HashSet<String>,
    arrivals: HashMap<String, Vec<String>>,
    outputs: HashMap<String, String>,
    final_outputs: Vec<(String, String)>,
}

impl<'g> Scheduler<'g> {
    fn new(graph: &'g ValidatedGraph) -> Self {
        let mut sched = Self {
            graph,
            ready: VecDeque::new(),
            scheduled: HashSet::new(),
            excluded: HashSet::new(),
            arrivals: HashMap::new(),
            outputs: HashMap::new(),
            final_outputs: Vec::new(),
        };
        sched.enqueue(graph.entry());
        sched
    }

    fn enqueue(&mut self, id: &str) {
        if self.scheduled.insert(id.to_string()) {
            self.ready.push_back(id.to_string());
        }
    }

    fn pop_ready(&mut self) -> Option<String> {
        self.ready.pop_front()
    }

    fn clear_ready(&mut self) {
        self.ready.clear();
    }

    /// End is always satisfiable. A node is satisfiable while it has not
    /// been scheduled or excluded; a join still waiting on other
    /// predecessors counts, since this arrival moves it toward readiness.
    fn satisfiable(&self, target: &Target) -> bool {
        match target {
            Target::End => true,
            Target::Node(id) => !self.excluded.contains(id) && !self.scheduled.contains(id),
        }
    }

    fn first_satisfiable(&self, targets: &[Target]) -> Option<Target> {
        targets.iter().find(|t| self.satisfiable(t)).cloned()
    }

    fn input_for(&self, node_id: &str, run_input: &str) -> String {
        let Some(preds) = self.arrivals.get(node_id).filter(|p| !p.is_empty()) else {
            return run_input.to_string();
        };
        let mut input = format!("## Task\n\n{}", run_input);
        for pred in preds {
            if let Some(output) = self.outputs.get(pred) {
                input.push_str(&format!("\n\n## Output from {}\n\n{}", pred, output));
            }
        }
        input
    }

    fn on_success(&mut self, node_id: &str, output: &str, route: Option<Target>) -> Vec<Target> {
        let Some(plan) = self.graph.plan(node_id).cloned() else {
            return vec![];
        };

        let chosen: Vec<Target> = match &plan {
            HandOffPlan::Sequential { targets, choice } => {
                let named = if *choice {
                    parse_handoff_choice(output)
                        .map(|id| Target::parse(&id))
                        .filter(|t| targets.contains(t) && self.satisfiable(t))
                } else {
                    None
                };
                named
                    .or_else(|| self.first_satisfiable(targets))
                    .into_iter()
                    .collect()
            }
            HandOffPlan::Parallel { targets } => targets
                .iter()
                .map(|t| Target::Node(t.clone()))
                .filter(|t| self.satisfiable(t))
                .collect(),
            HandOffPlan::Conditional { targets } => route
                .filter(|t| targets.contains(t) && self.satisfiable(t))
                .or_else(|| self.first_satisfiable(targets))
                .into_iter()
                .collect(),
        };

        self.outputs.insert(node_id.to_string(), output.to_string());
        for target in &chosen {
            match target {
                Target::End => self
                    .final_outputs
                    .push((node_id.to_string(), output.to_string())),
                Target::Node(next) => self.arrive(node_id, next),
            }
        }

        let skipped: Vec<String> = self
            .graph
            .successors(node_id)
            .into_iter()
            .filter(|s| !chosen.iter().any(|t| t.node_id() == Some(*s)))
            .map(String::from)
            .collect();
        for succ in skipped {
            self.exclude(&succ);
        }
        chosen
    }

    fn on_failure(&mut self, node_id: &str) {
        let successors: Vec<String> = self
            .graph
            .successors(node_id)
            .into_iter()
            .map(String::from)
            .collect();
        for succ in successors {
            self.exclude(&succ);
        }
    }

    fn arrive(&mut self, from: &str, to: &str) {
        let arrived = self.arrivals.entry(to.to_string()).or_default();
        arrived.push(from.to_string());
        let needed = self.graph.predecessors(to).len().max(1);
        if arrived.len() >= needed {
            self.enqueue(to);
        }
    }

    fn exclude(&mut self, id: &str) {
        let mut stack = vec![id.to_string()];
        while let Some(node) = stack.pop() {
            if self.scheduled.contains(&node) || !self.excluded.insert(node.clone()) {
                continue;
            }
            debug!(node_id = %node, "Node excluded for this run");
            stack.extend(self.graph.successors(&node).into_iter().map(String::from));
        }
    }

    fn final_output(&self) -> Option<String> {
        match self.final_outputs.as_slice() {
            [] => None,
            [(_, only)] => Some(only.clone()),
            many => Some(
                many.iter()
                    .map(|(id, out)| format!("## {}\n\n{}", id, out))
                    .collect::<Vec<_>>()
                    .join("\n\n"),
            ),
        }
    }
}
