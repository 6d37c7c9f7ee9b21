//! Relational store abstraction.
//!
//! The harness reads back what the user-management service persisted. The
//! store is modelled as JSON rows keyed by tenant, table and row id;
//! [`StorageProvider`] is the contract and [`InMemoryStorage`] the
//! in-process implementation.
//!
//! Rows are scoped to a tenant by their key, so a query in one tenant never
//! sees another tenant's rows. The tenant id is the organization's resource
//! path.
//!
//! # Example Usage
//!
//! ```rust
//! use usermgmt_harness::storage::{InMemoryStorage, StorageKey, StorageProvider};
//! use serde_json::json;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let storage = InMemoryStorage::new();
//!
//! let key = StorageKey::new("org-1", "users", "user-123");
//! storage.put(key.clone(), json!({"user_id": "user-123", "name": "user-42"})).await?;
//!
//! let row = storage.get(key.clone()).await?;
//! assert!(row.is_some());
//!
//! let prefix = StorageKey::prefix("org-1", "users");
//! let found = storage.find_by_attribute(prefix, "name", "user-42").await?;
//! assert_eq!(found.len(), 1);
//! # Ok(())
//! # }
//! ```

pub mod errors;
pub mod in_memory;
pub mod rows;

pub use errors::StorageError;
pub use in_memory::InMemoryStorage;

use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::fmt;
use std::future::Future;

use crate::error::{HarnessError, HarnessResult};

/// A hierarchical key for identifying rows in storage.
///
/// Rows are organized as: `tenant_id` → `table` → `row_id`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StorageKey {
    tenant_id: String,
    table: String,
    row_id: String,
}

impl StorageKey {
    /// Create a new storage key.
    pub fn new(
        tenant_id: impl Into<String>,
        table: impl Into<String>,
        row_id: impl Into<String>,
    ) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            table: table.into(),
            row_id: row_id.into(),
        }
    }

    pub fn tenant_id(&self) -> &str {
        &self.tenant_id
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    pub fn row_id(&self) -> &str {
        &self.row_id
    }

    /// Create a prefix for listing the rows of a table within a tenant.
    pub fn prefix(tenant_id: impl Into<String>, table: impl Into<String>) -> StoragePrefix {
        StoragePrefix {
            tenant_id: tenant_id.into(),
            table: table.into(),
        }
    }
}

impl fmt::Display for StorageKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.tenant_id, self.table, self.row_id)
    }
}

/// A prefix for querying the rows of one table within a tenant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoragePrefix {
    tenant_id: String,
    table: String,
}

impl StoragePrefix {
    pub fn tenant_id(&self) -> &str {
        &self.tenant_id
    }

    pub fn table(&self) -> &str {
        &self.table
    }
}

impl fmt::Display for StoragePrefix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.tenant_id, self.table)
    }
}

/// Core trait for relational store access.
///
/// # Design Principles
///
/// - **PUT/GET/DELETE Model**: create and update are both a put
/// - **Tenant Isolation**: all operations are scoped by the key or prefix
/// - **Async First**: all operations return futures
pub trait StorageProvider: Send + Sync {
    /// The error type returned by storage operations.
    type Error: std::error::Error + Send + Sync + 'static;

    /// Store `data` at `key`, replacing any existing row, and return the
    /// stored row.
    fn put(
        &self,
        key: StorageKey,
        data: Value,
    ) -> impl Future<Output = Result<Value, Self::Error>> + Send;

    /// `Some(row)` if the row exists.
    fn get(
        &self,
        key: StorageKey,
    ) -> impl Future<Output = Result<Option<Value>, Self::Error>> + Send;

    /// `true` if the row was deleted, `false` if it didn't exist.
    fn delete(&self, key: StorageKey) -> impl Future<Output = Result<bool, Self::Error>> + Send;

    /// Find rows whose attribute at the dot-separated path `attribute`
    /// equals `value`, ordered by row id.
    ///
    /// Array-valued attributes match when any element equals `value`.
    fn find_by_attribute(
        &self,
        prefix: StoragePrefix,
        attribute: &str,
        value: &str,
    ) -> impl Future<Output = Result<Vec<(StorageKey, Value)>, Self::Error>> + Send;
}

/// Serialize and store a typed row.
pub async fn put_row<S, T>(storage: &S, key: StorageKey, row: &T) -> HarnessResult<()>
where
    S: StorageProvider,
    T: Serialize + Sync,
{
    let value = serde_json::to_value(row)
        .map_err(|e| HarnessError::storage(StorageError::invalid_data(format!("row {}", key), e)))?;
    storage.put(key, value).await.map_err(HarnessError::storage)?;
    Ok(())
}

/// Fetch and deserialize a typed row.
pub async fn get_row<S, T>(storage: &S, key: StorageKey) -> HarnessResult<Option<T>>
where
    S: StorageProvider,
    T: DeserializeOwned,
{
    match storage.get(key.clone()).await.map_err(HarnessError::storage)? {
        Some(value) => decode_row(&key, value).map(Some),
        None => Ok(None),
    }
}

/// Fetch and deserialize every row whose `attribute` equals `value`.
pub async fn find_rows<S, T>(
    storage: &S,
    prefix: StoragePrefix,
    attribute: &str,
    value: &str,
) -> HarnessResult<Vec<T>>
where
    S: StorageProvider,
    T: DeserializeOwned,
{
    storage
        .find_by_attribute(prefix, attribute, value)
        .await
        .map_err(HarnessError::storage)?
        .into_iter()
        .map(|(key, row)| decode_row(&key, row))
        .collect()
}

fn decode_row<T: DeserializeOwned>(key: &StorageKey, value: Value) -> HarnessResult<T> {
    serde_json::from_value(value)
        .map_err(|e| HarnessError::storage(StorageError::invalid_data(format!("row {}", key), e)))
}
