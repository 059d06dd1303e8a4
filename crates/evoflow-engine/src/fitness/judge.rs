use std::sync::OnceLock;

use regex::Regex;
use serde_json::{json, Value};

use evoflow_core::trace::RunTrace;
use evoflow_core::types::CompletionData;

pub const JUDGE_SYSTEM_PROMPT: &str =
    "You are a strict grader. Compare an AI workflow's answer against the reference answer \
     and rate its correctness.";

/// Schema requested from judges in structured mode.
pub fn judge_schema() -> Value {
    json!({
        "type": "object",
        "properties": {
            "accuracy": {"type": "number", "minimum": 0, "maximum": 100},
            "reason": {"type": "string"}
        },
        "required": ["accuracy"]
    })
}

/// The answer a trace is graded on: the final output, or for a run that
/// never reached `end`, the last successful node output.
pub fn answer_of(trace: &RunTrace) -> Option<&str> {
    trace
        .final_output
        .as_deref()
        .or_else(|| {
            trace
                .invocations
                .iter()
                .rev()
                .filter(|i| i.succeeded())
                .find_map(|i| i.output.as_deref())
        })
        .filter(|a| !a.trim().is_empty())
}

/// One line per node invocation that used tools.
pub fn summarize_tools(trace: &RunTrace) -> String {
    trace
        .invocations
        .iter()
        .filter(|i| !i.tool_calls.is_empty())
        .map(|i| {
            let calls = i
                .tool_calls
                .iter()
                .map(|t| {
                    if t.success {
                        t.tool.clone()
                    } else {
                        format!("{} (failed)", t.tool)
                    }
                })
                .collect::<Vec<_>>()
                .join(", ");
            format!("- {}: {}", i.node_id, calls)
        })
        .collect::<Vec<_>>()
        .join("\n")
}

pub fn build_judge_prompt(
    answer: &str,
    trace: &RunTrace,
    ground_truth: &str,
    rubric: Option<&str>,
) -> String {
    let tools = summarize_tools(trace);
    let tools = if tools.is_empty() {
        "(no tools used)".to_string()
    } else {
        tools
    };
    let rubric = rubric
        .filter(|r| !r.trim().is_empty())
        .map(|r| format!("\nGrading rubric:\n{}\n", r))
        .unwrap_or_default();

    format!(
        r#"Reference answer:
{}
{}
Workflow answer:
{}

Tool usage:
{}

Rate how correct the workflow answer is compared with the reference, from 0 (wrong) to 100 (fully correct). Respond with ONLY valid JSON:
{{
  "accuracy": 0-100,
  "reason": "brief explanation"
}}"#,
        ground_truth, rubric, answer, tools
    )
}

/// Read an accuracy value from a judge reply. Accepts structured output,
/// JSON in text (optionally fenced), an `accuracy: N` line, or a bare number.
pub fn parse_accuracy(data: &CompletionData) -> Option<f64> {
    let value = match data {
        CompletionData::Structured(v) => accuracy_field(v),
        CompletionData::Text(text) => serde_json::from_str::<Value>(extract_json(text))
            .ok()
            .and_then(|v| accuracy_field(&v))
            .or_else(|| {
                accuracy_pattern()
                    .and_then(|re| re.captures(text))
                    .and_then(|c| c.get(1))
                    .and_then(|m| m.as_str().parse().ok())
            })
            .or_else(|| text.trim().trim_end_matches('%').parse().ok()),
        CompletionData::ToolCalls(_) => None,
    }?;
    (!value.is_nan()).then(|| value.clamp(0.0, 100.0))
}

fn accuracy_field(v: &Value) -> Option<f64> {
    match v.get("accuracy")? {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().trim_end_matches('%').parse().ok(),
        _ => None,
    }
}

fn accuracy_pattern() -> Option<&'static Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN
        .get_or_init(|| Regex::new(r"(?i)accuracy\W{0,3}[:=]\s*(\d+(?:\.\d+)?)").ok())
        .as_ref()
}

/// Extract JSON from a response that may contain markdown code fences.
pub(crate) fn extract_json(text: &str) -> &str {
    let trimmed = text.trim();
    if let Some(start) = trimmed.find("```json") {
        let after = &trimmed[start + 7..];
        if let Some(end) = after.find("```") {
            return after[..end].trim();
        }
    }
    if let Some(start) = trimmed.find("```") {
        let after = &trimmed[start + 3..];
        if let Some(end) = after.find("```") {
            return after[..end].trim();
        }
    }
    if let Some(start) = trimmed.find('{') {
        if let Some(end) = trimmed.rfind('}') {
            if end > start {
                return &trimmed[start..=end];
            }
        }
    }
    trimmed
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use evoflow_core::trace::{InvocationStatus, NodeInvocation, TerminationReason, ToolUsage};
    use evoflow_core::types::RunId;

    fn invocation(node: &str, output: Option<&str>, tools: Vec<ToolUsage>) -> NodeInvocation {
        NodeInvocation {
            node_id: node.into(),
            input: "in".into(),
            output: output.map(String::from),
            error: output.is_none().then(|| "failed".to_string()),
            start_time: Utc::now(),
            end_time: Utc::now(),
            cost: 0.0,
            status: if output.is_some() {
                InvocationStatus::Succeeded
            } else {
                InvocationStatus::Failed
            },
            tool_calls: tools,
        }
    }

    fn trace(invocations: Vec<NodeInvocation>, final_output: Option<&str>) -> RunTrace {
        RunTrace {
            run_id: RunId::new(),
            total_invocations: invocations.len() as u32,
            invocations,
            per_node_invocations: Default::default(),
            termination: TerminationReason::Completed,
            started_at: Utc::now(),
            finished_at: Utc::now(),
            final_output: final_output.map(String::from),
        }
    }

    #[test]
    fn test_parse_accuracy_forms() {
        let s = CompletionData::Structured(json!({"accuracy": 85, "reason": "close"}));
        assert_eq!(parse_accuracy(&s), Some(85.0));
        let fenced = CompletionData::Text("```json\n{\"accuracy\": 40}\n```".into());
        assert_eq!(parse_accuracy(&fenced), Some(40.0));
        let line = CompletionData::Text("Reasoning...\nAccuracy: 72.5".into());
        assert_eq!(parse_accuracy(&line), Some(72.5));
        let bare = CompletionData::Text(" 90% ".into());
        assert_eq!(parse_accuracy(&bare), Some(90.0));
        let string_field = CompletionData::Structured(json!({"accuracy": "65"}));
        assert_eq!(parse_accuracy(&string_field), Some(65.0));
    }

    #[test]
    fn test_parse_accuracy_clamps_and_rejects() {
        assert_eq!(parse_accuracy(&CompletionData::Structured(json!({"accuracy": 140}))), Some(100.0));
        assert_eq!(parse_accuracy(&CompletionData::Structured(json!({"accuracy": -3}))), Some(0.0));
        assert_eq!(parse_accuracy(&CompletionData::Text("no idea".into())), None);
        assert_eq!(parse_accuracy(&CompletionData::Structured(json!({"score": 1}))), None);
        assert_eq!(parse_accuracy(&CompletionData::ToolCalls(vec![])), None);
    }

    #[test]
    fn test_answer_falls_back_to_last_success() {
        let t = trace(
            vec![
                invocation("A", Some("draft"), vec![]),
                invocation("B", None, vec![]),
            ],
            None,
        );
        assert_eq!(answer_of(&t), Some("draft"));

        let done = trace(vec![invocation("A", Some("draft"), vec![])], Some("final"));
        assert_eq!(answer_of(&done), Some("final"));

        let empty = trace(vec![invocation("A", None, vec![])], None);
        assert_eq!(answer_of(&empty), None);
    }

    #[test]
    fn test_prompt_includes_tool_trail_and_rubric() {
        let t = trace(
            vec![invocation(
                "A",
                Some("42"),
                vec![
                    ToolUsage {
                        tool: "calculator".into(),
                        success: true,
                        error: None,
                    },
                    ToolUsage {
                        tool: "web_fetch".into(),
                        success: false,
                        error: Some("timeout".into()),
                    },
                ],
            )],
            Some("42"),
        );
        let prompt = build_judge_prompt("42", &t, "42", Some("Exact number"));
        assert!(prompt.contains("- A: calculator, web_fetch (failed)"));
        assert!(prompt.contains("Grading rubric:\nExact number"));
        assert!(prompt.contains("Reference answer:\n42"));

        let bare = build_judge_prompt("x", &trace(vec![], Some("x")), "y", None);
        assert!(bare.contains("(no tools used)"));
        assert!(!bare.contains("rubric"));
    }

    #[test]
    fn test_extract_json() {
        assert_eq!(extract_json("```json\n{\"a\": 1}\n```"), "{\"a\": 1}");
        assert_eq!(extract_json("Sure: {\"a\": 1} done"), "{\"a\": 1}");
        assert_eq!(extract_json("  plain  "), "plain");
    }
}
