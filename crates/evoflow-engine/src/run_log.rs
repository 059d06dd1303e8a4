use std::path::PathBuf;

use chrono::Utc;
use serde::Serialize;
use tokio::io::AsyncWriteExt;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use evoflow_core::event::EventBus;
use evoflow_core::types::EvolutionEvent;

/// JSONL evolution logger.
///
/// Subscribes to the engine's EventBus and writes one JSON object per line
/// to `{log_dir}/{evolution_id}/{timestamp}.jsonl`. Lines are flushed as
/// they are written, so a crashed run still leaves a readable log.
pub struct EvolutionLogger {
    log_dir: PathBuf,
    level: u8,
}

#[derive(Serialize)]
struct LogEntry {
    timestamp: String,
    evolution_id: String,
    event_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    generation: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    detail: Option<serde_json::Value>,
}

impl EvolutionLogger {
    /// `level` controls verbosity: 1 = generation summaries,
    /// 2 = + candidate evaluations, 3 = + mutations.
    pub fn new(log_dir: PathBuf, level: u8) -> Self {
        Self { log_dir, level }
    }

    /// Subscribe now and log in a background task, so no event published
    /// after this call is missed.
    pub fn spawn(
        self,
        event_bus: &EventBus,
        evolution_id: String,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let rx = event_bus.subscribe();
        tokio::spawn(self.run(rx, evolution_id, cancel))
    }

    /// Write entries until cancellation or the `Terminated` event.
    pub async fn run(
        self,
        mut rx: broadcast::Receiver<EvolutionEvent>,
        evolution_id: String,
        cancel: CancellationToken,
    ) {
        let dir = self.log_dir.join(&evolution_id);
        if let Err(e) = tokio::fs::create_dir_all(&dir).await {
            error!(error = %e, "Failed to create log directory");
            return;
        }

        let timestamp = Utc::now().format("%Y%m%d_%H%M%S").to_string();
        let log_path = dir.join(format!("{}.jsonl", timestamp));

        let file = match tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_path)
            .await
        {
            Ok(f) => f,
            Err(e) => {
                error!(error = %e, path = %log_path.display(), "Failed to open log file");
                return;
            }
        };

        info!(path = %log_path.display(), "EvolutionLogger started");
        let mut writer = tokio::io::BufWriter::new(file);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("EvolutionLogger cancelled");
                    break;
                }
                result = rx.recv() => {
                    match result {
                        Ok(event) => {
                            if let Some(entry) = self.event_to_entry(&evolution_id, &event) {
                                if let Ok(json) = serde_json::to_string(&entry) {
                                    let line = format!("{}\n", json);
                                    if let Err(e) = writer.write_all(line.as_bytes()).await {
                                        error!(error = %e, "Failed to write log entry");
                                        break;
                                    }
                                    if let Err(e) = writer.flush().await {
                                        error!(error = %e, "Failed to flush log");
                                    }
                                }
                            }
                            if matches!(event, EvolutionEvent::Terminated { .. }) {
                                break;
                            }
                        }
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            debug!(skipped = n, "EvolutionLogger lagged, skipped events");
                        }
                        Err(broadcast::error::RecvError::Closed) => {
                            debug!("EventBus closed, EvolutionLogger stopping");
                            break;
                        }
                    }
                }
            }
        }

        writer.flush().await.ok();
        debug!(path = %log_path.display(), "EvolutionLogger finished");
    }

    /// Convert an event to a log entry; `None` when filtered by level.
    fn event_to_entry(&self, evolution_id: &str, event: &EvolutionEvent) -> Option<LogEntry> {
        let entry = |event_type: &str, generation: Option<u32>, detail: Option<serde_json::Value>| {
            Some(LogEntry {
                timestamp: Utc::now().to_rfc3339(),
                evolution_id: evolution_id.to_string(),
                event_type: event_type.to_string(),
                generation,
                detail,
            })
        };

        match event {
            // L1: generation summaries
            EvolutionEvent::GenerationStarted {
                generation,
                candidates,
            } => entry(
                "generation_started",
                Some(*generation),
                Some(serde_json::json!({ "candidates": candidates })),
            ),
            EvolutionEvent::GenerationCommitted {
                generation,
                best_score,
                mean_score,
                evaluated,
                spent_usd,
            } => entry(
                "generation_committed",
                Some(*generation),
                Some(serde_json::json!({
                    "best_score": best_score,
                    "mean_score": mean_score,
                    "evaluated": evaluated,
                    "spent_usd": spent_usd,
                })),
            ),
            EvolutionEvent::Terminated {
                reason,
                generations,
                best_score,
                spent_usd,
                ..
            } => entry(
                "terminated",
                None,
                Some(serde_json::json!({
                    "reason": reason,
                    "generations": generations,
                    "best_score": best_score,
                    "spent_usd": spent_usd,
                })),
            ),

            // L2: candidate evaluations
            EvolutionEvent::CandidateEvaluated {
                generation,
                candidate_id,
                score,
                accuracy,
                cost_usd,
                truncated,
            } if self.level >= 2 => entry(
                "candidate_evaluated",
                Some(*generation),
                Some(serde_json::json!({
                    "candidate_id": candidate_id,
                    "score": score,
                    "accuracy": accuracy,
                    "cost_usd": cost_usd,
                    "truncated": truncated,
                })),
            ),

            // L3: mutations
            EvolutionEvent::MutationApplied {
                generation,
                parent_id,
                child_id,
                operator,
                attempts,
            } if self.level >= 3 => entry(
                "mutation_applied",
                Some(*generation),
                Some(serde_json::json!({
                    "parent_id": parent_id,
                    "child_id": child_id,
                    "operator": operator,
                    "attempts": attempts,
                })),
            ),
            EvolutionEvent::MutationRejected {
                generation,
                parent_id,
                operator,
                reason,
            } if self.level >= 3 => entry(
                "mutation_rejected",
                Some(*generation),
                Some(serde_json::json!({
                    "parent_id": parent_id,
                    "operator": operator,
                    "reason": truncate_str(reason, 300),
                })),
            ),

            _ => None,
        }
    }
}

fn truncate_str(s: &str, max_len: usize) -> &str {
    if s.len() <= max_len {
        return s;
    }
    let mut end = max_len;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

#[cfg(test)]
mod tests {
    use super::*;
    use evoflow_core::types::CandidateId;

    fn evaluated() -> EvolutionEvent {
        EvolutionEvent::CandidateEvaluated {
            generation: 0,
            candidate_id: CandidateId::from_str("abc"),
            score: 70,
            accuracy: 80.0,
            cost_usd: 0.01,
            truncated: false,
        }
    }

    fn rejected() -> EvolutionEvent {
        EvolutionEvent::MutationRejected {
            generation: 1,
            parent_id: CandidateId::from_str("abc"),
            operator: "remove_node".into(),
            reason: "no removable node".into(),
        }
    }

    fn terminated() -> EvolutionEvent {
        EvolutionEvent::Terminated {
            reason: "generations_reached".into(),
            generations: 1,
            best_score: 70,
            spent_usd: 0.01,
            at: Utc::now(),
        }
    }

    #[test]
    fn test_entry_skips_empty_fields() {
        let entry = LogEntry {
            timestamp: "2026-02-24T12:00:00Z".to_string(),
            evolution_id: "evo-1".to_string(),
            event_type: "terminated".to_string(),
            generation: None,
            detail: None,
        };
        let json = serde_json::to_string(&entry).unwrap();
        assert!(json.contains("evo-1"));
        assert!(!json.contains("generation"));
        assert!(!json.contains("detail"));
    }

    #[test]
    fn test_event_level_filtering() {
        let l1 = EvolutionLogger::new(PathBuf::from("/tmp"), 1);
        assert!(l1.event_to_entry("e", &terminated()).is_some());
        assert!(l1.event_to_entry("e", &evaluated()).is_none());
        assert!(l1.event_to_entry("e", &rejected()).is_none());

        let l2 = EvolutionLogger::new(PathBuf::from("/tmp"), 2);
        assert!(l2.event_to_entry("e", &evaluated()).is_some());
        assert!(l2.event_to_entry("e", &rejected()).is_none());

        let l3 = EvolutionLogger::new(PathBuf::from("/tmp"), 3);
        let entry = l3.event_to_entry("e", &rejected()).unwrap();
        assert_eq!(entry.event_type, "mutation_rejected");
        assert_eq!(entry.generation, Some(1));
    }

    #[test]
    fn test_truncate_str_respects_char_boundary() {
        assert_eq!(truncate_str("héllo", 2), "h");
        assert_eq!(truncate_str("short", 10), "short");
    }

    #[tokio::test]
    async fn test_writes_jsonl_until_terminated() {
        let dir = tempfile::tempdir().unwrap();
        let bus = EventBus::new(16);
        let handle = EvolutionLogger::new(dir.path().to_path_buf(), 2).spawn(
            &bus,
            "evo-test".to_string(),
            CancellationToken::new(),
        );

        bus.publish(EvolutionEvent::GenerationStarted {
            generation: 0,
            candidates: 1,
        });
        bus.publish(evaluated());
        bus.publish(rejected());
        bus.publish(terminated());
        handle.await.unwrap();

        let mut files = std::fs::read_dir(dir.path().join("evo-test")).unwrap();
        let path = files.next().unwrap().unwrap().path();
        let content = std::fs::read_to_string(path).unwrap();
        let types: Vec<String> = content
            .lines()
            .map(|l| serde_json::from_str::<serde_json::Value>(l).unwrap()["event_type"]
                .as_str()
                .unwrap()
                .to_string())
            .collect();
        assert_eq!(types, vec!["generation_started", "candidate_evaluated", "terminated"]);
    }
}
