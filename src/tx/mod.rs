//! Transaction management.

pub mod editing;

pub use editing::{BoxEditing, Preview, UpdateListener};

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::update::Update;

/// Transaction mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TxMode {
    /// Lands on the undo stack.
    Recorded,
    /// Published to listeners but never undoable.
    Transient,
}

/// Opaque transaction identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TxId(pub u64);

impl fmt::Display for TxId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "tx#{}", self.0)
    }
}

/// A committed transaction: the ordered updates it made.
#[derive(Debug, Clone, PartialEq)]
pub struct Transaction {
    pub id: TxId,
    pub mode: TxMode,
    pub updates: Vec<Update>,
}

impl Transaction {
    pub fn new(id: TxId, mode: TxMode, updates: Vec<Update>) -> Self {
        Self { id, mode, updates }
    }

    pub fn is_empty(&self) -> bool {
        self.updates.is_empty()
    }

    pub fn len(&self) -> usize {
        self.updates.len()
    }

    /// Updates that revert this transaction, in application order.
    pub fn inverse(&self) -> Vec<Update> {
        self.updates.iter().rev().map(Update::inverse).collect()
    }
}
