//! Persistence contract for published datasets.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Mutex;

use serde_json::Value;

use crate::entity::EntityKey;

pub type SinkFuture<'a> = Pin<Box<dyn Future<Output = bool> + Send + 'a>>;

/// Key-value store the publish step writes into.
///
/// Returning `false` reports a failed write; the pipeline logs it and carries on.
pub trait PersistenceSink: Send + Sync {
    fn upsert<'a>(&'a self, entity: &'a EntityKey, dataset: &'a str, payload: &'a Value)
        -> SinkFuture<'a>;
}

/// In-process store keyed by `(entity, dataset)`.
#[derive(Debug, Default)]
pub struct MemorySink {
    records: Mutex<HashMap<(String, String), Value>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, entity: &str, dataset: &str) -> Option<Value> {
        self.lock()
            .get(&(entity.to_owned(), dataset.to_owned()))
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<(String, String), Value>> {
        self.records
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl PersistenceSink for MemorySink {
    fn upsert<'a>(
        &'a self,
        entity: &'a EntityKey,
        dataset: &'a str,
        payload: &'a Value,
    ) -> SinkFuture<'a> {
        Box::pin(async move {
            self.lock().insert(
                (entity.as_str().to_owned(), dataset.to_owned()),
                payload.clone(),
            );
            true
        })
    }
}

/// Accepts and discards every write.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl PersistenceSink for NullSink {
    fn upsert<'a>(
        &'a self,
        _entity: &'a EntityKey,
        _dataset: &'a str,
        _payload: &'a Value,
    ) -> SinkFuture<'a> {
        Box::pin(async { true })
    }
}
