//! Key encoding utilities for `RocksDB`.
//!
//! Composite keys are fixed-width byte concatenations so that prefix
//! iteration over a user, task or status yields its records in key order.

use chrono::{DateTime, Datelike, NaiveDate, Utc};

use muse_core::{EntryId, TaskId, TaskStatus, UserId};

use crate::error::{Result, StoreError};

/// Length of a UUID or ULID in bytes.
const ID_LEN: usize = 16;

/// Create an account key from a user ID.
#[must_use]
pub fn account_key(user_id: &UserId) -> Vec<u8> {
    user_id.as_bytes().to_vec()
}

/// Create a ledger entry key.
#[must_use]
pub fn entry_key(entry_id: &EntryId) -> Vec<u8> {
    entry_id.to_bytes().to_vec()
}

/// `user_id (16) || entry_id (16)`. ULIDs make the user's entries time-ordered.
#[must_use]
pub fn user_entry_key(user_id: &UserId, entry_id: &EntryId) -> Vec<u8> {
    let mut key = Vec::with_capacity(2 * ID_LEN);
    key.extend_from_slice(user_id.as_bytes());
    key.extend_from_slice(&entry_id.to_bytes());
    key
}

/// `task_id (16) || entry_id (16)`.
#[must_use]
pub fn task_entry_key(task_id: &TaskId, entry_id: &EntryId) -> Vec<u8> {
    let mut key = Vec::with_capacity(2 * ID_LEN);
    key.extend_from_slice(task_id.as_bytes());
    key.extend_from_slice(&entry_id.to_bytes());
    key
}

/// Create a task key from a task ID.
#[must_use]
pub fn task_key(task_id: &TaskId) -> Vec<u8> {
    task_id.as_bytes().to_vec()
}

/// `user_id (16) || created_at millis (8, big endian) || task_id (16)`.
#[must_use]
pub fn user_task_key(user_id: &UserId, created_at: DateTime<Utc>, task_id: &TaskId) -> Vec<u8> {
    let millis = u64::try_from(created_at.timestamp_millis()).unwrap_or(0);
    let mut key = Vec::with_capacity(2 * ID_LEN + 8);
    key.extend_from_slice(user_id.as_bytes());
    key.extend_from_slice(&millis.to_be_bytes());
    key.extend_from_slice(task_id.as_bytes());
    key
}

/// One-byte tag per task status.
#[must_use]
pub const fn status_tag(status: TaskStatus) -> u8 {
    match status {
        TaskStatus::Pending => 0,
        TaskStatus::Processing => 1,
        TaskStatus::Succeeded => 2,
        TaskStatus::Failed => 3,
    }
}

/// `status_tag (1) || task_id (16)`.
#[must_use]
pub fn status_task_key(status: TaskStatus, task_id: &TaskId) -> Vec<u8> {
    let mut key = Vec::with_capacity(1 + ID_LEN);
    key.push(status_tag(status));
    key.extend_from_slice(task_id.as_bytes());
    key
}

/// Create a provider-id index key.
#[must_use]
pub fn provider_task_key(provider_task_id: &str) -> Vec<u8> {
    provider_task_id.as_bytes().to_vec()
}

/// `user_id (16) || days since CE (4, big endian)`.
#[must_use]
pub fn usage_key(user_id: &UserId, week_start: NaiveDate) -> Vec<u8> {
    let mut key = Vec::with_capacity(ID_LEN + 4);
    key.extend_from_slice(user_id.as_bytes());
    key.extend_from_slice(&week_start.num_days_from_ce().to_be_bytes());
    key
}

fn trailing_id(key: &[u8]) -> Result<[u8; ID_LEN]> {
    key.len()
        .checked_sub(ID_LEN)
        .and_then(|start| key[start..].try_into().ok())
        .ok_or_else(|| StoreError::Database(format!("malformed index key of {} bytes", key.len())))
}

/// Extract the entry ID from the tail of an entry index key.
///
/// # Errors
///
/// Returns `StoreError::Database` if the key is shorter than an id.
pub fn trailing_entry_id(key: &[u8]) -> Result<EntryId> {
    trailing_id(key).map(EntryId::from_bytes)
}

/// Extract the task ID from the tail of a task index key.
///
/// # Errors
///
/// Returns `StoreError::Database` if the key is shorter than an id.
pub fn trailing_task_id(key: &[u8]) -> Result<TaskId> {
    trailing_id(key).map(|bytes| TaskId::from_uuid(uuid::Uuid::from_bytes(bytes)))
}
