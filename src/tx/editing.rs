//! Editing facade: transactions with undo/redo and commit listeners.

use std::collections::VecDeque;
use std::ops::{Deref, DerefMut};

use tracing::debug;

use super::{Transaction, TxMode};
use crate::config::EditingConfig;
use crate::graph::BoxGraph;
use crate::model::{Address, Value};
use crate::update::Update;
use crate::{Error, Result};

/// Receives every committed, non-empty transaction in commit order,
/// including the replays made by undo and redo.
pub trait UpdateListener: Send {
    fn on_commit(&mut self, tx: &Transaction);
}

/// Owns the graph and the undo history. Derefs to the graph, so the graph's
/// operations are available inside `modify` closures.
pub struct BoxEditing {
    graph: BoxGraph,
    undo: VecDeque<Transaction>,
    redo: Vec<Transaction>,
    listeners: Vec<Box<dyn UpdateListener>>,
    config: EditingConfig,
}

impl BoxEditing {
    pub fn new(graph: BoxGraph) -> Self {
        Self::with_config(graph, EditingConfig::default())
    }

    pub fn with_config(graph: BoxGraph, config: EditingConfig) -> Self {
        Self {
            graph,
            undo: VecDeque::new(),
            redo: Vec::new(),
            listeners: Vec::new(),
            config,
        }
    }

    pub fn graph(&self) -> &BoxGraph {
        &self.graph
    }

    pub fn into_graph(self) -> BoxGraph {
        self.graph
    }

    pub fn subscribe(&mut self, listener: impl UpdateListener + 'static) {
        self.listeners.push(Box::new(listener));
    }

    // ========================================================================
    // Transactions
    // ========================================================================

    /// Run `f` in a recorded transaction.
    pub fn modify<R>(&mut self, f: impl FnOnce(&mut Self) -> Result<R>) -> Result<R> {
        self.modify_with(TxMode::Recorded, f)
    }

    /// Run `f` in a transaction. Any error rolls back everything `f` did.
    /// Nested calls join the enclosing transaction; only the outermost call
    /// validates mandatory pointers, commits and publishes.
    pub fn modify_with<R>(
        &mut self,
        mode: TxMode,
        f: impl FnOnce(&mut Self) -> Result<R>,
    ) -> Result<R> {
        let outermost = !self.graph.in_transaction();
        self.graph.begin();
        let value = match f(self) {
            Ok(value) => value,
            Err(e) => {
                self.graph.rollback()?;
                return Err(e);
            }
        };
        if outermost {
            if let Err(e) = self.graph.check_mandatory() {
                self.graph.rollback()?;
                return Err(e);
            }
        }
        if let Some(mut tx) = self.graph.commit()? {
            tx.mode = mode;
            self.record(tx);
        }
        Ok(value)
    }

    fn record(&mut self, tx: Transaction) {
        if tx.is_empty() {
            return;
        }
        self.publish(&tx);
        if tx.mode == TxMode::Recorded {
            self.undo.push_back(tx);
            while self.undo.len() > self.config.undo_limit {
                self.undo.pop_front();
            }
            self.redo.clear();
        }
    }

    fn publish(&mut self, tx: &Transaction) {
        for listener in &mut self.listeners {
            listener.on_commit(tx);
        }
    }

    // ========================================================================
    // Undo / redo
    // ========================================================================

    pub fn can_undo(&self) -> bool {
        !self.undo.is_empty()
    }

    pub fn can_redo(&self) -> bool {
        !self.redo.is_empty()
    }

    /// Revert the latest recorded transaction. `Ok(false)` if there is none.
    pub fn undo(&mut self) -> Result<bool> {
        if self.graph.in_transaction() {
            return Err(Error::TransactionOpen);
        }
        let Some(tx) = self.undo.pop_back() else {
            return Ok(false);
        };
        match self.replay(&tx.inverse()) {
            Ok(()) => {
                debug!(tx = %tx.id, "undo");
                self.redo.push(tx);
                Ok(true)
            }
            Err(e) => {
                self.undo.push_back(tx);
                Err(e)
            }
        }
    }

    /// Re-apply the latest undone transaction. `Ok(false)` if there is none.
    pub fn redo(&mut self) -> Result<bool> {
        if self.graph.in_transaction() {
            return Err(Error::TransactionOpen);
        }
        let Some(tx) = self.redo.pop() else {
            return Ok(false);
        };
        match self.replay(&tx.updates) {
            Ok(()) => {
                debug!(tx = %tx.id, "redo");
                self.undo.push_back(tx);
                Ok(true)
            }
            Err(e) => {
                self.redo.push(tx);
                Err(e)
            }
        }
    }

    fn replay(&mut self, updates: &[Update]) -> Result<()> {
        self.graph.begin();
        for update in updates {
            if let Err(e) = self.graph.apply(update) {
                self.graph.rollback()?;
                return Err(e);
            }
        }
        if let Some(mut tx) = self.graph.commit()? {
            tx.mode = TxMode::Transient;
            if !tx.is_empty() {
                self.publish(&tx);
            }
        }
        Ok(())
    }

    // ========================================================================
    // Preview edits
    // ========================================================================

    /// Start a live edit of a primitive (e.g. a fader drag).
    pub fn begin_preview(&self, address: &Address) -> Result<Preview> {
        let original = self.graph.read_field(address)?.clone();
        Ok(Preview { address: address.clone(), original })
    }

    /// Show `value` without creating an undo step.
    pub fn preview(&mut self, preview: &Preview, value: Value) -> Result<()> {
        self.modify_with(TxMode::Transient, |e| e.graph.write_field(&preview.address, value))
    }

    /// Commit the previewed value as a single undo step.
    pub fn finish_preview(&mut self, preview: Preview) -> Result<()> {
        let last = self.graph.read_field(&preview.address)?.clone();
        self.modify_with(TxMode::Transient, |e| {
            e.graph.write_field(&preview.address, preview.original.clone())
        })?;
        self.modify(|e| e.graph.write_field(&preview.address, last))
    }

    /// Restore the value the preview started from.
    pub fn cancel_preview(&mut self, preview: Preview) -> Result<()> {
        self.modify_with(TxMode::Transient, |e| {
            e.graph.write_field(&preview.address, preview.original)
        })
    }
}

impl Deref for BoxEditing {
    type Target = BoxGraph;

    fn deref(&self) -> &BoxGraph {
        &self.graph
    }
}

impl DerefMut for BoxEditing {
    fn deref_mut(&mut self) -> &mut BoxGraph {
        &mut self.graph
    }
}

/// Handle for an in-progress preview edit.
#[derive(Debug, Clone)]
pub struct Preview {
    address: Address,
    original: Value,
}

impl Preview {
    pub fn address(&self) -> &Address {
        &self.address
    }

    pub fn original(&self) -> &Value {
        &self.original
    }
}
