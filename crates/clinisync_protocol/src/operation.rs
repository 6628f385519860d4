//! Mutation kinds carried by sync records and remote changes.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Kind of mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    /// Entity was created.
    Create,
    /// Entity was updated.
    Update,
    /// Entity was deleted. The payload is a tombstone.
    Delete,
}

impl Operation {
    /// Returns true for deletes, whose payload may be empty.
    pub fn is_delete(&self) -> bool {
        matches!(self, Operation::Delete)
    }

    /// Wire name of the operation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::Create => "create",
            Operation::Update => "update",
            Operation::Delete => "delete",
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
