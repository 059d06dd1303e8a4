use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::warn;

use evoflow_core::error::{EvoflowError, Result};

/// One evaluation task: an input for the workflow and the reference
/// answer judges grade against.
///
/// GAIA-style records (`task_id`, `Question`, `Final answer`, `Level`) load
/// through the same type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EvalTask {
    #[serde(alias = "task_id")]
    pub id: String,
    #[serde(alias = "Question", alias = "question")]
    pub input: String,
    #[serde(default, alias = "Final answer", alias = "ground_truth")]
    pub ground_truth: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rubric: Option<String>,
    #[serde(default, alias = "Level", skip_serializing_if = "Option::is_none")]
    pub level: Option<u8>,
}

/// Load tasks from a JSON array or a JSON-lines file. Tasks without a
/// reference answer cannot be graded and are skipped.
pub fn load_tasks(path: &Path) -> Result<Vec<EvalTask>> {
    let content = std::fs::read_to_string(path)
        .map_err(|_| EvoflowError::ConfigNotFound(path.display().to_string()))?;
    parse_tasks(&content)
}

pub fn parse_tasks(content: &str) -> Result<Vec<EvalTask>> {
    let trimmed = content.trim_start();
    let raw: Vec<EvalTask> = if trimmed.starts_with('[') {
        serde_json::from_str(trimmed)?
    } else {
        trimmed
            .lines()
            .filter(|l| !l.trim().is_empty())
            .map(serde_json::from_str)
            .collect::<std::result::Result<_, _>>()?
    };

    let total = raw.len();
    let tasks: Vec<EvalTask> = raw
        .into_iter()
        .filter(|t| !t.ground_truth.trim().is_empty())
        .collect();
    if tasks.len() < total {
        warn!(
            skipped = total - tasks.len(),
            "Skipping tasks without a reference answer"
        );
    }
    if tasks.is_empty() {
        return Err(EvoflowError::Config(
            "task file has no gradable tasks".to_string(),
        ));
    }
    Ok(tasks)
}
