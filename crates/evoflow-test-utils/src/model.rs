use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use futures::future::BoxFuture;

use evoflow_core::error::{EvoflowError, Result};
use evoflow_core::traits::ModelClient;
use evoflow_core::types::*;

/// What a scripted call answers with.
#[derive(Debug, Clone)]
pub enum Reply {
    Text(String),
    ToolCalls(Vec<ToolCall>),
    Structured(serde_json::Value),
    /// Model-level failure: `success == false`, cost still charged.
    Fail(String),
    /// Transport failure: the call returns `Err`.
    Error(String),
}

impl Reply {
    pub fn text(s: impl Into<String>) -> Self {
        Self::Text(s.into())
    }

    pub fn structured(v: serde_json::Value) -> Self {
        Self::Structured(v)
    }

    pub fn tool_call(name: &str, input: serde_json::Value) -> Self {
        Self::ToolCalls(vec![ToolCall {
            id: format!("call_{}", name),
            name: name.to_string(),
            input,
        }])
    }

    pub fn fail(s: impl Into<String>) -> Self {
        Self::Fail(s.into())
    }

    pub fn error(s: impl Into<String>) -> Self {
        Self::Error(s.into())
    }
}

/// A match condition plus the reply it produces.
#[derive(Debug, Clone)]
pub struct Rule {
    model: Option<String>,
    contains: Option<String>,
    mode: Option<CompletionMode>,
    reply: Reply,
    cost: Option<f64>,
    delay: Duration,
    remaining: Option<usize>,
}

impl Rule {
    /// Matches every request.
    pub fn any(reply: Reply) -> Self {
        Self {
            model: None,
            contains: None,
            mode: None,
            reply,
            cost: None,
            delay: Duration::ZERO,
            remaining: None,
        }
    }

    /// Matches requests whose transcript contains `needle`.
    pub fn prompt_contains(needle: &str, reply: Reply) -> Self {
        Self {
            contains: Some(needle.to_string()),
            ..Self::any(reply)
        }
    }

    /// Matches requests for the given model.
    pub fn model(model: &str, reply: Reply) -> Self {
        Self {
            model: Some(model.to_string()),
            ..Self::any(reply)
        }
    }

    pub fn and_contains(mut self, needle: &str) -> Self {
        self.contains = Some(needle.to_string());
        self
    }

    pub fn in_mode(mut self, mode: CompletionMode) -> Self {
        self.mode = Some(mode);
        self
    }

    pub fn cost(mut self, usd: f64) -> Self {
        self.cost = Some(usd);
        self
    }

    pub fn delay_ms(mut self, ms: u64) -> Self {
        self.delay = Duration::from_millis(ms);
        self
    }

    /// Stop matching after `n` uses.
    pub fn times(mut self, n: usize) -> Self {
        self.remaining = Some(n);
        self
    }

    fn matches(&self, request: &CompletionRequest, transcript: &str) -> bool {
        if self.remaining == Some(0) {
            return false;
        }
        if let Some(m) = &self.model {
            if &request.model != m {
                return false;
            }
        }
        if let Some(mode) = self.mode {
            if request.mode != mode {
                return false;
            }
        }
        match &self.contains {
            Some(needle) => transcript.contains(needle.as_str()),
            None => true,
        }
    }
}

/// Rule-based deterministic model. The first matching rule answers; when no
/// rule matches the default reply is used. Records every request and the
/// peak number of concurrent calls.
pub struct ScriptedModel {
    rules: Mutex<Vec<Rule>>,
    default_reply: Reply,
    default_cost: f64,
    default_delay: Duration,
    requests: Mutex<Vec<CompletionRequest>>,
    charged: Mutex<f64>,
    in_flight: AtomicUsize,
    peak: AtomicUsize,
}

impl ScriptedModel {
    pub fn new() -> Self {
        Self {
            rules: Mutex::new(vec![]),
            default_reply: Reply::text("ok"),
            default_cost: 0.0,
            default_delay: Duration::ZERO,
            requests: Mutex::new(vec![]),
            charged: Mutex::new(0.0),
            in_flight: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        }
    }

    pub fn rule(self, rule: Rule) -> Self {
        if let Ok(mut rules) = self.rules.lock() {
            rules.push(rule);
        }
        self
    }

    pub fn default_reply(mut self, reply: Reply) -> Self {
        self.default_reply = reply;
        self
    }

    pub fn default_cost(mut self, usd: f64) -> Self {
        self.default_cost = usd;
        self
    }

    pub fn default_delay_ms(mut self, ms: u64) -> Self {
        self.default_delay = Duration::from_millis(ms);
        self
    }

    /// Every request seen so far, in arrival order.
    pub fn requests(&self) -> Vec<CompletionRequest> {
        self.requests.lock().map(|r| r.clone()).unwrap_or_default()
    }

    pub fn call_count(&self) -> usize {
        self.requests.lock().map(|r| r.len()).unwrap_or(0)
    }

    /// Number of requests whose transcript contains `needle`.
    pub fn calls_containing(&self, needle: &str) -> usize {
        self.requests()
            .iter()
            .filter(|r| r.transcript().contains(needle))
            .count()
    }

    /// USD charged across every answered call, failed replies included.
    pub fn total_charged(&self) -> f64 {
        self.charged.lock().map(|c| *c).unwrap_or(0.0)
    }

    /// Highest number of calls that were in flight at once.
    pub fn peak_concurrency(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    fn pick(&self, request: &CompletionRequest) -> (Reply, f64, Duration) {
        let transcript = request.transcript();
        if let Ok(mut rules) = self.rules.lock() {
            if let Some(rule) = rules.iter_mut().find(|r| r.matches(request, &transcript)) {
                if let Some(n) = rule.remaining.as_mut() {
                    *n -= 1;
                }
                return (
                    rule.reply.clone(),
                    rule.cost.unwrap_or(self.default_cost),
                    rule.delay,
                );
            }
        }
        (self.default_reply.clone(), self.default_cost, self.default_delay)
    }
}

impl Default for ScriptedModel {
    fn default() -> Self {
        Self::new()
    }
}

struct InFlight<'a>(&'a AtomicUsize);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl ModelClient for ScriptedModel {
    fn complete(&self, request: CompletionRequest) -> BoxFuture<'_, Result<CompletionResponse>> {
        Box::pin(async move {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            let _guard = InFlight(&self.in_flight);

            let (reply, cost, delay) = self.pick(&request);
            if let Ok(mut log) = self.requests.lock() {
                log.push(request);
            }
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            if !matches!(reply, Reply::Error(_)) {
                if let Ok(mut charged) = self.charged.lock() {
                    *charged += cost;
                }
            }
            match reply {
                Reply::Text(t) => Ok(CompletionResponse::ok(CompletionData::Text(t), cost)),
                Reply::ToolCalls(calls) => {
                    Ok(CompletionResponse::ok(CompletionData::ToolCalls(calls), cost))
                }
                Reply::Structured(v) => {
                    Ok(CompletionResponse::ok(CompletionData::Structured(v), cost))
                }
                Reply::Fail(e) => Ok(CompletionResponse::failed(e, cost)),
                Reply::Error(e) => Err(EvoflowError::ModelRequest(e)),
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn req(model: &str, text: &str) -> CompletionRequest {
        CompletionRequest::text(model, vec![ChatMessage::user(text)])
    }

    #[tokio::test]
    async fn test_first_matching_rule_wins() {
        let model = ScriptedModel::new()
            .rule(Rule::prompt_contains("alpha", Reply::text("A")).cost(0.5))
            .rule(Rule::model("m", Reply::text("M")));
        let a = model.complete(req("m", "say alpha")).await.unwrap();
        assert_eq!(a.into_result().unwrap().as_text(), "A");
        let m = model.complete(req("m", "other")).await.unwrap();
        assert_eq!(m.into_result().unwrap().as_text(), "M");
        let d = model.complete(req("x", "other")).await.unwrap();
        assert_eq!(d.into_result().unwrap().as_text(), "ok");
        assert_eq!(model.call_count(), 3);
    }

    #[tokio::test]
    async fn test_times_limits_rule() {
        let model = ScriptedModel::new().rule(Rule::any(Reply::fail("first")).times(1));
        assert!(!model.complete(req("m", "x")).await.unwrap().success);
        assert!(model.complete(req("m", "x")).await.unwrap().success);
    }

    #[tokio::test]
    async fn test_total_charged_skips_transport_errors() {
        let model = ScriptedModel::new()
            .rule(Rule::model("down", Reply::error("offline")).cost(5.0))
            .rule(Rule::model("flaky", Reply::fail("bad")).cost(0.25))
            .default_cost(0.5);
        model.complete(req("m", "x")).await.unwrap();
        model.complete(req("flaky", "x")).await.unwrap();
        assert!(model.complete(req("down", "x")).await.is_err());
        assert!((model.total_charged() - 0.75).abs() < 1e-9);
    }
}
