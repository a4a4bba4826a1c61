//! Node-local DML execution: request payloads shipped by the coordinator and
//! the device-sharded executor that applies them.

pub mod executor;

pub use executor::{ExecutorContext, MassDeleteOutcome};

use serde::{Deserialize, Serialize};

use crate::meta::{ColValue, IndexDef, PartitionMeta, Rid, TableSchema};

/// A RID plus the row's key values for every index on the table, in index
/// declaration order. Deletes and updates carry these so index maintenance
/// never re-reads the row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RidAndKeys {
    pub rid: Rid,
    pub keys: Vec<Vec<ColValue>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InsertRequest {
    pub schema: TableSchema,
    pub rows: Vec<Vec<ColValue>>,
    pub indexes: Vec<IndexDef>,
    pub part: PartitionMeta,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeleteRequest {
    pub schema: TableSchema,
    pub rows: Vec<RidAndKeys>,
    pub indexes: Vec<IndexDef>,
}

/// One row update: the target row with its current index keys, the column
/// positions being set, and their new values.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpdateRow {
    pub row: RidAndKeys,
    pub cols: Vec<usize>,
    pub values: Vec<ColValue>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpdateRequest {
    pub schema: TableSchema,
    pub rows: Vec<UpdateRow>,
    pub indexes: Vec<IndexDef>,
}

/// Truncate a table and its indexes on every device of every node in the
/// broadcast tree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MassDeleteRequest {
    pub schema: TableSchema,
    pub indexes: Vec<IndexDef>,
}
