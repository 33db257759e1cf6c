//! Counts conversations in an uploaded export.

use super::storage_service::{StorageError, StorageResult};
use crate::limits::extension_of;
use serde_json::Value;

/// Number of conversations in `data`, judged by the file's extension.
///
/// - JSON array: one conversation per element (the `conversations.json` export).
/// - JSON object with a `conversations` array: that array's length.
/// - JSON object with a `mapping` key: a single exported conversation.
/// - Any other JSON, and `.txt` / `.md` files: 0.
pub fn count_conversations(filename: &str, data: &[u8]) -> StorageResult<i64> {
    if extension_of(filename).as_deref() != Some("json") {
        return Ok(0);
    }
    let value: Value =
        serde_json::from_slice(data).map_err(|err| StorageError::InvalidJson(err.to_string()))?;

    let count = match &value {
        Value::Array(items) => items.len(),
        Value::Object(map) => match map.get("conversations") {
            Some(Value::Array(items)) => items.len(),
            _ if map.contains_key("mapping") => 1,
            _ => 0,
        },
        _ => 0,
    };
    Ok(count as i64)
}
