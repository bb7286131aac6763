use crate::core::errors::DocumentValidationError;
use crate::{Document, TxnError};
use serde_json::Value;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};
use uuid::Uuid;

pub const ID_FIELD: &str = "_id";

/// Validates `value` as a document and makes sure it carries an `_id`.
///
/// Returns the primary key together with the normalized document.
pub fn normalize_document(value: Value) -> Result<(Value, Document), TxnError> {
    let mut doc = match value {
        Value::Object(map) => map,
        _ => {
            return Err(DocumentValidationError("document must be a JSON object".into()).into())
        }
    };

    let id = match doc.get(ID_FIELD) {
        Some(Value::Null) => {
            return Err(DocumentValidationError("_id must not be null".into()).into());
        }
        Some(id) => id.clone(),
        None => {
            let id = Value::String(generate_object_id_hex());
            doc.insert(ID_FIELD.to_string(), id.clone());
            id
        }
    };
    validate_key(&id)?;
    Ok((id, doc))
}

/// Keys must be scalars so they can be ordered and compared by value.
pub fn validate_key(key: &Value) -> Result<(), TxnError> {
    match key {
        Value::String(_) | Value::Number(_) | Value::Bool(_) => Ok(()),
        _ => Err(DocumentValidationError(format!("unsupported key: {key}")).into()),
    }
}

fn generate_object_id_hex() -> String {
    // 4 bytes timestamp, 5 random bytes, 3 byte counter (ObjectId layout).
    static COUNTER: AtomicU32 = AtomicU32::new(0);

    let now_secs = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as u32;
    let ts = now_secs.to_be_bytes();

    let rand = Uuid::new_v4();
    let rand_bytes = rand.as_bytes();

    let c = COUNTER.fetch_add(1, Ordering::Relaxed) & 0x00FF_FFFF;
    let counter_bytes = c.to_be_bytes();

    let mut bytes = [0u8; 12];
    bytes[0..4].copy_from_slice(&ts);
    bytes[4..9].copy_from_slice(&rand_bytes[0..5]);
    bytes[9..12].copy_from_slice(&counter_bytes[1..4]);

    bytes.iter().map(|b| format!("{b:02x}")).collect()
}
