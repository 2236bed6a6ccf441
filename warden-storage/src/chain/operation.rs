//! Operation kinds, priorities and results.

use std::fmt;

use serde::{Deserialize, Serialize};
use warden_core::{EntityId, OptimisticLockConflict, Row};

/// The kind of call an interceptor chain wraps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    Create,
    Update,
    Delete,
    Read,
    BatchCreate,
    BatchUpdate,
    BatchDelete,
}

impl Operation {
    pub fn is_create(&self) -> bool {
        matches!(self, Operation::Create | Operation::BatchCreate)
    }

    pub fn is_update(&self) -> bool {
        matches!(self, Operation::Update | Operation::BatchUpdate)
    }

    pub fn is_delete(&self) -> bool {
        matches!(self, Operation::Delete | Operation::BatchDelete)
    }

    pub fn is_read(&self) -> bool {
        matches!(self, Operation::Read)
    }

    pub fn is_write(&self) -> bool {
        !self.is_read()
    }

    pub fn is_batch(&self) -> bool {
        matches!(
            self,
            Operation::BatchCreate | Operation::BatchUpdate | Operation::BatchDelete
        )
    }

    /// The update variant with the same arity. Used when a delete is
    /// rewritten into a flag update.
    pub fn as_update(&self) -> Operation {
        if self.is_batch() {
            Operation::BatchUpdate
        } else {
            Operation::Update
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::Create => "create",
            Operation::Update => "update",
            Operation::Delete => "delete",
            Operation::Read => "read",
            Operation::BatchCreate => "batch_create",
            Operation::BatchUpdate => "batch_update",
            Operation::BatchDelete => "batch_delete",
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Interceptor ordering. Lower runs earlier before the store call and later
/// after it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Priority(pub u16);

impl Priority {
    pub const HIGHEST: Priority = Priority(50);
    pub const HIGH: Priority = Priority(100);
    pub const NORMAL: Priority = Priority(200);
    pub const LOW: Priority = Priority(300);
}

impl Default for Priority {
    fn default() -> Self {
        Priority::NORMAL
    }
}

/// What a `before` hook asks the chain to do next.
#[derive(Debug, Clone, PartialEq)]
pub enum Flow {
    Continue,
    /// Skip the remaining before hooks and the store call.
    Respond(OperationResult),
}

/// Outcome of one chain run.
#[derive(Debug, Clone, PartialEq)]
pub enum OperationResult {
    /// Rows as persisted by create/update, with per-row conflicts when the
    /// batch policy reports instead of aborting.
    Written {
        rows: Vec<Row>,
        conflicts: Vec<OptimisticLockConflict>,
    },
    Deleted {
        ids: Vec<EntityId>,
        soft: bool,
    },
    Found(Option<Row>),
    Listed(Vec<Row>),
}

impl OperationResult {
    /// Ids of the rows a write touched.
    pub fn written_ids(&self) -> Vec<EntityId> {
        match self {
            OperationResult::Written { rows, .. } => rows.iter().map(|r| r.id).collect(),
            OperationResult::Deleted { ids, .. } => ids.clone(),
            OperationResult::Found(_) | OperationResult::Listed(_) => Vec::new(),
        }
    }

    pub fn into_rows(self) -> Vec<Row> {
        match self {
            OperationResult::Written { rows, .. } | OperationResult::Listed(rows) => rows,
            OperationResult::Found(row) => row.into_iter().collect(),
            OperationResult::Deleted { .. } => Vec::new(),
        }
    }
}
