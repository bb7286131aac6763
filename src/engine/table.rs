//! Document operations on one table, always inside a [`Transaction`].
//!
//! Every operation goes through `Transaction::perform`, which registers the
//! table and, during the planning pass, returns a stand-in instead of calling
//! the engine: `None` for lookups, an empty `Vec` for scans, `0` for counts,
//! `false` for deletes and updates, and the normalized key for a put.
//!
//! Keys are not validated while planning. They may come from stand-ins, such
//! as a field of a lookup that returned `None`.

use serde_json::Value;

use crate::core::document::{normalize_document, validate_key, ID_FIELD};
use crate::core::errors::{DocumentValidationError, StorageError};
use crate::txn::{LockMode, Transaction};
use crate::{Document, TxnError};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Table {
    name: String,
}

impl Table {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub async fn get(&self, txn: &Transaction, key: &Value) -> Result<Option<Document>, TxnError> {
        check_key(txn, key)?;
        let table = self.name.clone();
        let key = key.clone();
        txn.perform(&self.name, LockMode::Read, None, move |engine, handle| async move {
            engine.get(handle, &table, &key).await
        })
        .await
    }

    /// Inserts or replaces `doc`, assigning an `_id` when it has none.
    /// Returns the document's key.
    pub async fn put(&self, txn: &Transaction, doc: Value) -> Result<Value, TxnError> {
        let (key, doc) = normalize_document(doc)?;
        let table = self.name.clone();
        txn.perform(
            &self.name,
            LockMode::ReadWrite,
            key.clone(),
            move |engine, handle| async move {
                engine.put(handle, &table, key.clone(), doc).await?;
                Ok::<_, StorageError>(key)
            },
        )
        .await
    }

    /// Returns whether a document was removed.
    pub async fn delete(&self, txn: &Transaction, key: &Value) -> Result<bool, TxnError> {
        check_key(txn, key)?;
        let table = self.name.clone();
        let key = key.clone();
        txn.perform(&self.name, LockMode::ReadWrite, false, move |engine, handle| async move {
            engine.delete(handle, &table, &key).await
        })
        .await
    }

    /// Merges `fields` into the document stored under `key`. Returns whether
    /// the document existed.
    pub async fn update(
        &self,
        txn: &Transaction,
        key: &Value,
        fields: Value,
    ) -> Result<bool, TxnError> {
        check_key(txn, key)?;
        let fields = match fields {
            Value::Object(fields) => fields,
            _ => {
                return Err(DocumentValidationError("update must be a JSON object".into()).into())
            }
        };
        if !txn.is_planning_phase() && fields.get(ID_FIELD).is_some_and(|id| id != key) {
            return Err(DocumentValidationError("_id cannot be changed".into()).into());
        }

        let table = self.name.clone();
        let key = key.clone();
        txn.perform(&self.name, LockMode::ReadWrite, false, move |engine, handle| async move {
            let Some(mut doc) = engine.get(handle, &table, &key).await? else {
                return Ok(false);
            };
            doc.extend(fields);
            engine.put(handle, &table, key, doc).await?;
            Ok::<_, StorageError>(true)
        })
        .await
    }

    pub async fn scan(&self, txn: &Transaction) -> Result<Vec<Document>, TxnError> {
        let table = self.name.clone();
        txn.perform(&self.name, LockMode::Read, Vec::new(), move |engine, handle| async move {
            engine.scan(handle, &table).await
        })
        .await
    }

    pub async fn count(&self, txn: &Transaction) -> Result<usize, TxnError> {
        let table = self.name.clone();
        txn.perform(&self.name, LockMode::Read, 0, move |engine, handle| async move {
            Ok::<_, StorageError>(engine.scan(handle, &table).await?.len())
        })
        .await
    }
}

fn check_key(txn: &Transaction, key: &Value) -> Result<(), TxnError> {
    if txn.is_planning_phase() {
        return Ok(());
    }
    validate_key(key)
}
