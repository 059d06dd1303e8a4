use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique identifier of one executor run.
#[derive(Debug, Clone, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
pub struct RunId(pub String);

impl RunId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RunId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of a candidate graph inside an evolution run.
#[derive(Debug, Clone, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
pub struct CandidateId(pub String);

impl CandidateId {
    pub fn new() -> Self {
        // Short ids keep logs and record keys readable.
        Self(Uuid::new_v4().simple().to_string()[..12].to_string())
    }

    pub fn from_str(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl Default for CandidateId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for CandidateId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Role in a conversation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

/// A single content block in a message.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ContentBlock {
    #[serde(rename = "text")]
    Text { text: String },

    #[serde(rename = "tool_use")]
    ToolUse {
        id: String,
        name: String,
        input: serde_json::Value,
    },

    #[serde(rename = "tool_result")]
    ToolResult {
        tool_use_id: String,
        content: String,
        is_error: bool,
    },
}

/// A chat message sent to the model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: Vec<ContentBlock>,
}

impl ChatMessage {
    pub fn system(text: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: vec![ContentBlock::Text { text: text.into() }],
        }
    }

    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: vec![ContentBlock::Text { text: text.into() }],
        }
    }

    pub fn assistant_text(text: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: vec![ContentBlock::Text { text: text.into() }],
        }
    }

    /// Assistant turn that requested tool calls.
    pub fn assistant_tool_calls(calls: &[ToolCall]) -> Self {
        Self {
            role: Role::Assistant,
            content: calls
                .iter()
                .map(|c| ContentBlock::ToolUse {
                    id: c.id.clone(),
                    name: c.name.clone(),
                    input: c.input.clone(),
                })
                .collect(),
        }
    }

    pub fn tool_result(tool_use_id: impl Into<String>, content: impl Into<String>, is_error: bool) -> Self {
        Self {
            role: Role::Tool,
            content: vec![ContentBlock::ToolResult {
                tool_use_id: tool_use_id.into(),
                content: content.into(),
                is_error,
            }],
        }
    }

    /// Extract all text content from this message.
    pub fn text(&self) -> String {
        self.content
            .iter()
            .filter_map(|b| match b {
                ContentBlock::Text { text } => Some(text.as_str()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("")
    }
}

/// How the model is expected to answer.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum CompletionMode {
    /// Plain text answer.
    #[default]
    Text,
    /// Text or tool calls, chosen by the model.
    Tools,
    /// JSON conforming to the request schema.
    Structured,
}

/// A request to the model capability.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletionRequest {
    pub messages: Vec<ChatMessage>,
    pub model: String,
    pub mode: CompletionMode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tools: Vec<ToolDefinition>,
}

impl CompletionRequest {
    pub fn text(model: impl Into<String>, messages: Vec<ChatMessage>) -> Self {
        Self {
            messages,
            model: model.into(),
            mode: CompletionMode::Text,
            schema: None,
            tools: vec![],
        }
    }

    pub fn structured(
        model: impl Into<String>,
        messages: Vec<ChatMessage>,
        schema: serde_json::Value,
    ) -> Self {
        Self {
            messages,
            model: model.into(),
            mode: CompletionMode::Structured,
            schema: Some(schema),
            tools: vec![],
        }
    }

    pub fn with_tools(mut self, tools: Vec<ToolDefinition>) -> Self {
        if !tools.is_empty() {
            self.mode = CompletionMode::Tools;
        }
        self.tools = tools;
        self
    }

    /// Concatenated text of all messages, handy for routing in tests and logs.
    pub fn transcript(&self) -> String {
        self.messages
            .iter()
            .map(|m| m.text())
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// Payload of a successful completion.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum CompletionData {
    Text(String),
    ToolCalls(Vec<ToolCall>),
    Structured(serde_json::Value),
}

impl CompletionData {
    /// Text form of the payload (structured values are rendered as JSON).
    pub fn as_text(&self) -> String {
        match self {
            Self::Text(t) => t.clone(),
            Self::Structured(v) => v.to_string(),
            Self::ToolCalls(calls) => calls
                .iter()
                .map(|c| format!("{}({})", c.name, c.input))
                .collect::<Vec<_>>()
                .join(", "),
        }
    }
}

/// Response of the model capability: `{success, data|error, usdCost}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompletionResponse {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<CompletionData>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default)]
    pub usd_cost: f64,
}

impl CompletionResponse {
    pub fn ok(data: CompletionData, usd_cost: f64) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
            usd_cost,
        }
    }

    pub fn failed(error: impl Into<String>, usd_cost: f64) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(error.into()),
            usd_cost,
        }
    }

    /// Split into the payload or the failure message.
    pub fn into_result(self) -> std::result::Result<CompletionData, String> {
        match (self.success, self.data) {
            (true, Some(data)) => Ok(data),
            (true, None) => Err("model returned success without data".to_string()),
            (false, _) => Err(self.error.unwrap_or_else(|| "model call failed".to_string())),
        }
    }
}

/// A tool call requested by the model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub input: serde_json::Value,
}

/// Result of a tool execution: `{success, data|error}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolResult {
    pub success: bool,
    #[serde(default)]
    pub data: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ToolResult {
    pub fn success(data: impl Into<serde_json::Value>) -> Self {
        Self {
            success: true,
            data: data.into(),
            error: None,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            success: false,
            data: serde_json::Value::Null,
            error: Some(message.into()),
        }
    }

    /// Text fed back to the model.
    pub fn content(&self) -> String {
        if self.success {
            match &self.data {
                serde_json::Value::String(s) => s.clone(),
                other => other.to_string(),
            }
        } else {
            self.error.clone().unwrap_or_else(|| "tool failed".to_string())
        }
    }
}

/// Tool definition for sending to the model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub input_schema: serde_json::Value,
}

/// Context passed to tools during execution.
#[derive(Debug, Clone)]
pub struct ToolContext {
    pub run_id: RunId,
    pub node_id: String,
}

/// Event broadcast by the evolution engine to all subscribers.
#[derive(Debug, Clone)]
pub enum EvolutionEvent {
    /// A generation started evaluating.
    GenerationStarted { generation: u32, candidates: usize },
    /// A candidate finished evaluation.
    CandidateEvaluated {
        generation: u32,
        candidate_id: CandidateId,
        score: u32,
        accuracy: f64,
        cost_usd: f64,
        truncated: bool,
    },
    /// A mutation produced a valid offspring.
    MutationApplied {
        generation: u32,
        parent_id: CandidateId,
        child_id: CandidateId,
        operator: String,
        attempts: u32,
    },
    /// Every repair attempt failed; the parent was copied instead.
    MutationRejected {
        generation: u32,
        parent_id: CandidateId,
        operator: String,
        reason: String,
    },
    /// Selection finished and the next generation was committed.
    GenerationCommitted {
        generation: u32,
        best_score: u32,
        mean_score: f64,
        evaluated: usize,
        spent_usd: f64,
    },
    /// The loop stopped.
    Terminated {
        reason: String,
        generations: u32,
        best_score: u32,
        spent_usd: f64,
        at: DateTime<Utc>,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_completion_response_wire_format() {
        let json = r#"{"success": true, "data": {"kind": "text", "value": "42"}, "usdCost": 0.002}"#;
        let resp: CompletionResponse = serde_json::from_str(json).unwrap();
        assert!(resp.success);
        assert!((resp.usd_cost - 0.002).abs() < f64::EPSILON);
        match resp.into_result().unwrap() {
            CompletionData::Text(t) => assert_eq!(t, "42"),
            other => panic!("Expected text, got {:?}", other),
        }
    }

    #[test]
    fn test_completion_response_failure() {
        let json = r#"{"success": false, "error": "overloaded", "usdCost": 0}"#;
        let resp: CompletionResponse = serde_json::from_str(json).unwrap();
        assert_eq!(resp.into_result().unwrap_err(), "overloaded");
    }

    #[test]
    fn test_request_with_tools_switches_mode() {
        let req = CompletionRequest::text("m", vec![ChatMessage::user("hi")]).with_tools(vec![
            ToolDefinition {
                name: "echo".into(),
                description: "echo".into(),
                input_schema: serde_json::json!({"type": "object"}),
            },
        ]);
        assert_eq!(req.mode, CompletionMode::Tools);

        let req = CompletionRequest::text("m", vec![]).with_tools(vec![]);
        assert_eq!(req.mode, CompletionMode::Text);
    }

    #[test]
    fn test_tool_result_content() {
        assert_eq!(ToolResult::success("done").content(), "done");
        assert_eq!(ToolResult::success(serde_json::json!({"n": 1})).content(), r#"{"n":1}"#);
        assert_eq!(ToolResult::error("boom").content(), "boom");
    }

    #[test]
    fn test_candidate_id_is_short() {
        assert_eq!(CandidateId::new().0.len(), 12);
    }
}
