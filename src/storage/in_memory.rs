//! In-memory relational store.
//!
//! A thread-safe implementation of [`StorageProvider`] using nested HashMaps
//! behind a tokio `RwLock`. Used by the in-memory user service and by the
//! test suites.
//!
//! # Performance Characteristics
//!
//! * PUT/GET/DELETE: O(1) average case
//! * FIND_BY_ATTRIBUTE: O(n log n) over the rows of the table

use crate::storage::{StorageError, StorageKey, StoragePrefix, StorageProvider};
use log::trace;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::RwLock;

type Tables = HashMap<String, HashMap<String, Value>>;

/// Thread-safe in-memory storage implementation.
///
/// Structure: `tenant_id` → `table` → `row_id` → `row`.
#[derive(Clone)]
pub struct InMemoryStorage {
    data: Arc<RwLock<HashMap<String, Tables>>>,
    available: Arc<AtomicBool>,
}

impl InMemoryStorage {
    /// Create a new empty in-memory storage instance.
    pub fn new() -> Self {
        Self {
            data: Arc::new(RwLock::new(HashMap::new())),
            available: Arc::new(AtomicBool::new(true)),
        }
    }

    /// Make every operation fail with [`StorageError::Unavailable`] until
    /// called again with `true`.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    fn check_available(&self) -> Result<(), StorageError> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(StorageError::unavailable("in-memory storage switched off"))
        }
    }

    /// Extract a nested attribute from a row using dot notation.
    ///
    /// Scalars yield one value; arrays of scalars yield every element.
    fn extract_attribute_values(data: &Value, attribute_path: &str) -> Vec<String> {
        let mut current = data;

        for part in attribute_path.split('.') {
            let next = if let Ok(index) = part.parse::<usize>() {
                current.get(index)
            } else {
                current.get(part)
            };
            match next {
                Some(value) => current = value,
                None => return Vec::new(),
            }
        }

        match current {
            Value::Array(items) => items.iter().filter_map(Self::scalar_to_string).collect(),
            other => Self::scalar_to_string(other).into_iter().collect(),
        }
    }

    fn scalar_to_string(value: &Value) -> Option<String> {
        match value {
            Value::String(s) => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            Value::Bool(b) => Some(b.to_string()),
            _ => None,
        }
    }
}

impl Default for InMemoryStorage {
    fn default() -> Self {
        Self::new()
    }
}

impl StorageProvider for InMemoryStorage {
    type Error = StorageError;

    async fn put(&self, key: StorageKey, data: Value) -> Result<Value, Self::Error> {
        self.check_available()?;
        let mut data_guard = self.data.write().await;

        data_guard
            .entry(key.tenant_id().to_string())
            .or_default()
            .entry(key.table().to_string())
            .or_default()
            .insert(key.row_id().to_string(), data.clone());

        trace!("Stored row {}", key);
        Ok(data)
    }

    async fn get(&self, key: StorageKey) -> Result<Option<Value>, Self::Error> {
        self.check_available()?;
        let data_guard = self.data.read().await;

        let result = data_guard
            .get(key.tenant_id())
            .and_then(|tenant_data| tenant_data.get(key.table()))
            .and_then(|table_data| table_data.get(key.row_id()))
            .cloned();

        Ok(result)
    }

    async fn delete(&self, key: StorageKey) -> Result<bool, Self::Error> {
        self.check_available()?;
        let mut data_guard = self.data.write().await;

        let existed = data_guard
            .get_mut(key.tenant_id())
            .and_then(|tenant_data| tenant_data.get_mut(key.table()))
            .map(|table_data| table_data.remove(key.row_id()).is_some())
            .unwrap_or(false);

        Ok(existed)
    }

    async fn find_by_attribute(
        &self,
        prefix: StoragePrefix,
        attribute: &str,
        value: &str,
    ) -> Result<Vec<(StorageKey, Value)>, Self::Error> {
        self.check_available()?;
        if attribute.is_empty() {
            return Err(StorageError::invalid_query("empty attribute path", attribute));
        }

        let data_guard = self.data.read().await;

        let table_data = match data_guard
            .get(prefix.tenant_id())
            .and_then(|tenant_data| tenant_data.get(prefix.table()))
        {
            Some(data) => data,
            None => return Ok(Vec::new()),
        };

        let mut results: Vec<(StorageKey, Value)> = table_data
            .iter()
            .filter(|(_, row)| {
                Self::extract_attribute_values(row, attribute)
                    .iter()
                    .any(|candidate| candidate == value)
            })
            .map(|(row_id, row)| {
                (
                    StorageKey::new(prefix.tenant_id(), prefix.table(), row_id),
                    row.clone(),
                )
            })
            .collect();

        results.sort_by(|a, b| a.0.row_id().cmp(b.0.row_id()));

        Ok(results)
    }
}
