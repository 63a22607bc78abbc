//! Denormalized search fields maintained alongside the event log.
//!
//! Field operations are best effort: the push applies them inside a
//! savepoint and a failure only rolls that savepoint back.

use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};
use warden_types::{Error, InstanceId, Result};

use crate::error::storage_error;
use crate::event::AggregateKey;

/// An object inside an aggregate that search fields describe, e.g. a
/// project grant or a member.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SearchObject {
    pub object_type: String,
    pub id: String,
    pub revision: u8,
}

impl SearchObject {
    pub fn new(object_type: impl Into<String>, id: impl Into<String>, revision: u8) -> Self {
        Self {
            object_type: object_type.into(),
            id: id.into(),
            revision,
        }
    }
}

/// A field value and how it is indexed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchValue {
    pub value: serde_json::Value,
    /// No two objects of the same type in an instance may carry the value.
    pub must_be_unique: bool,
    /// Whether the value can be searched for.
    pub should_index: bool,
}

impl SearchValue {
    pub fn indexed(value: impl Into<serde_json::Value>) -> Self {
        Self {
            value: value.into(),
            must_be_unique: false,
            should_index: true,
        }
    }

    pub fn unique(value: impl Into<serde_json::Value>) -> Self {
        Self {
            value: value.into(),
            must_be_unique: true,
            should_index: true,
        }
    }

    pub fn stored(value: impl Into<serde_json::Value>) -> Self {
        Self {
            value: value.into(),
            must_be_unique: false,
            should_index: false,
        }
    }
}

/// A mutation of the search-field table emitted by an event.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldOperation {
    /// Insert or overwrite one field of an object.
    Set {
        object: SearchObject,
        field_name: String,
        value: SearchValue,
    },
    /// Drop every field of one object.
    RemoveObject { object_type: String, object_id: String },
    /// Drop every field of the aggregate.
    RemoveAggregate,
}

impl FieldOperation {
    pub fn set(object: SearchObject, field_name: impl Into<String>, value: SearchValue) -> Self {
        Self::Set {
            object,
            field_name: field_name.into(),
            value,
        }
    }

    pub fn remove_object(object_type: impl Into<String>, object_id: impl Into<String>) -> Self {
        Self::RemoveObject {
            object_type: object_type.into(),
            object_id: object_id.into(),
        }
    }
}

/// A row of the search-field table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchField {
    pub instance_id: InstanceId,
    pub resource_owner: String,
    pub aggregate_type: String,
    pub aggregate_id: String,
    pub object: SearchObject,
    pub field_name: String,
    pub value: SearchValue,
}

/// Applies the operations of one event against its aggregate.
pub(crate) fn apply(
    tx: &Connection,
    aggregate: &AggregateKey,
    resource_owner: &str,
    operations: &[FieldOperation],
) -> Result<()> {
    for operation in operations {
        match operation {
            FieldOperation::Set {
                object,
                field_name,
                value,
            } => {
                let json = serde_json::to_string(&value.value).map_err(|e| {
                    Error::invalid_argument("search value cannot be serialized").with_source(e)
                })?;
                tx.execute(
                    "INSERT INTO fields
                        (instance_id, resource_owner, aggregate_type, aggregate_id,
                         object_type, object_id, object_revision, field_name,
                         value, value_must_be_unique, should_index)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
                     ON CONFLICT (instance_id, aggregate_type, aggregate_id,
                                  object_type, object_id, field_name)
                     DO UPDATE SET
                        resource_owner = excluded.resource_owner,
                        object_revision = excluded.object_revision,
                        value = excluded.value,
                        value_must_be_unique = excluded.value_must_be_unique,
                        should_index = excluded.should_index",
                    params![
                        aggregate.instance_id.as_str(),
                        resource_owner,
                        aggregate.aggregate_type,
                        aggregate.aggregate_id,
                        object.object_type,
                        object.id,
                        object.revision,
                        field_name,
                        json,
                        value.must_be_unique,
                        value.should_index,
                    ],
                )
                .map_err(storage_error)?;
            }
            FieldOperation::RemoveObject {
                object_type,
                object_id,
            } => {
                tx.execute(
                    "DELETE FROM fields
                     WHERE instance_id = ?1 AND aggregate_type = ?2 AND aggregate_id = ?3
                       AND object_type = ?4 AND object_id = ?5",
                    params![
                        aggregate.instance_id.as_str(),
                        aggregate.aggregate_type,
                        aggregate.aggregate_id,
                        object_type,
                        object_id
                    ],
                )
                .map_err(storage_error)?;
            }
            FieldOperation::RemoveAggregate => {
                tx.execute(
                    "DELETE FROM fields
                     WHERE instance_id = ?1 AND aggregate_type = ?2 AND aggregate_id = ?3",
                    params![
                        aggregate.instance_id.as_str(),
                        aggregate.aggregate_type,
                        aggregate.aggregate_id
                    ],
                )
                .map_err(storage_error)?;
            }
        }
    }
    Ok(())
}

/// Finds the indexed fields of `object_type` whose `field_name` equals `value`.
pub(crate) fn search(
    conn: &Connection,
    instance: &InstanceId,
    object_type: &str,
    field_name: &str,
    value: &serde_json::Value,
) -> Result<Vec<SearchField>> {
    let json = serde_json::to_string(value)
        .map_err(|e| Error::invalid_argument("search value cannot be serialized").with_source(e))?;
    let mut stmt = conn
        .prepare(
            "SELECT instance_id, resource_owner, aggregate_type, aggregate_id,
                    object_type, object_id, object_revision, field_name,
                    value, value_must_be_unique, should_index
             FROM fields
             WHERE instance_id = ?1 AND object_type = ?2 AND field_name = ?3
               AND value = ?4 AND should_index = 1
             ORDER BY aggregate_type, aggregate_id, object_id",
        )
        .map_err(storage_error)?;
    let rows = stmt
        .query_map(params![instance.as_str(), object_type, field_name, json], |row| {
            let raw: String = row.get(8)?;
            let value = serde_json::from_str(&raw).map_err(|e| {
                rusqlite::Error::FromSqlConversionFailure(8, rusqlite::types::Type::Text, Box::new(e))
            })?;
            Ok(SearchField {
                instance_id: InstanceId::new(row.get::<_, String>(0)?),
                resource_owner: row.get(1)?,
                aggregate_type: row.get(2)?,
                aggregate_id: row.get(3)?,
                object: SearchObject {
                    object_type: row.get(4)?,
                    id: row.get(5)?,
                    revision: row.get(6)?,
                },
                field_name: row.get(7)?,
                value: SearchValue {
                    value,
                    must_be_unique: row.get(9)?,
                    should_index: row.get(10)?,
                },
            })
        })
        .map_err(storage_error)?;

    let mut fields = Vec::new();
    for row in rows {
        fields.push(row.map_err(storage_error)?);
    }
    Ok(fields)
}
