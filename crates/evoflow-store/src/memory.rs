use std::collections::HashMap;
use std::sync::Mutex;

use futures::future::BoxFuture;

use evoflow_core::error::{EvoflowError, Result};
use evoflow_core::record::Record;
use evoflow_core::traits::RecordStore;

/// Process-local record store for tests and embedders that do not need
/// durable records. The CLI always persists to SQLite.
#[derive(Default)]
pub struct MemoryRecordStore {
    records: Mutex<HashMap<String, Record>>,
}

impl MemoryRecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.lock().map(|r| r.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Stored ids starting with `prefix`, sorted.
    pub fn ids_with_prefix(&self, prefix: &str) -> Vec<String> {
        let mut ids: Vec<String> = self
            .records
            .lock()
            .map(|r| r.keys().filter(|k| k.starts_with(prefix)).cloned().collect())
            .unwrap_or_default();
        ids.sort();
        ids
    }
}

impl RecordStore for MemoryRecordStore {
    fn append(&self, record: Record) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            let mut records = self
                .records
                .lock()
                .map_err(|e| EvoflowError::Database(e.to_string()))?;
            records.insert(record.id.clone(), record);
            Ok(())
        })
    }

    fn fetch(&self, id: &str) -> BoxFuture<'_, Result<Option<Record>>> {
        let id = id.to_string();
        Box::pin(async move {
            let records = self
                .records
                .lock()
                .map_err(|e| EvoflowError::Database(e.to_string()))?;
            Ok(records.get(&id).cloned())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use evoflow_core::record::RecordKind;

    #[tokio::test]
    async fn test_prefix_listing() {
        let store = MemoryRecordStore::new();
        for id in ["trace/e/0/a/t1", "trace/e/0/b/t1", "fitness/e/0/a"] {
            store
                .append(Record::new(id, RecordKind::Trace, &serde_json::json!({})).unwrap())
                .await
                .unwrap();
        }
        assert_eq!(store.len(), 3);
        assert_eq!(store.ids_with_prefix("trace/e/0/"), vec!["trace/e/0/a/t1", "trace/e/0/b/t1"]);
        assert!(store.fetch("fitness/e/0/a").await.unwrap().is_some());
    }
}
