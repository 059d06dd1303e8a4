use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::types::CandidateId;

/// What a persisted record holds.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum RecordKind {
    Trace,
    Fitness,
    Generation,
}

impl RecordKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Trace => "trace",
            Self::Fitness => "fitness",
            Self::Generation => "generation",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "trace" => Some(Self::Trace),
            "fitness" => Some(Self::Fitness),
            "generation" => Some(Self::Generation),
            _ => None,
        }
    }
}

/// An opaque record handed to storage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Record {
    pub id: String,
    pub kind: RecordKind,
    pub payload: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

impl Record {
    pub fn new(id: impl Into<String>, kind: RecordKind, payload: &impl Serialize) -> Result<Self> {
        Ok(Self {
            id: id.into(),
            kind,
            payload: serde_json::to_value(payload)?,
            created_at: Utc::now(),
        })
    }

    /// Decode the payload back into a typed value.
    pub fn decode<T: serde::de::DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_value(self.payload.clone())?)
    }
}

/// `trace/{evolution}/{generation}/{candidate}/{task}`
pub fn trace_id(evolution: &str, generation: u32, candidate: &CandidateId, task: &str) -> String {
    format!("trace/{}/{}/{}/{}", evolution, generation, candidate, task)
}

/// `fitness/{evolution}/{generation}/{candidate}`
pub fn fitness_id(evolution: &str, generation: u32, candidate: &CandidateId) -> String {
    format!("fitness/{}/{}/{}", evolution, generation, candidate)
}

/// `generation/{evolution}/{generation}`
pub fn generation_id(evolution: &str, generation: u32) -> String {
    format!("generation/{}/{}", evolution, generation)
}
