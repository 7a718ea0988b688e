//! # Synchronization bridge
//!
//! Keeps mirror graphs (typically on the audio thread) consistent with the
//! editing graph.
//!
//! ```text
//! BoxEditing::modify ─commit─▶ SyncSource ─Bytes─▶ crossbeam ─▶ SyncTarget::drain
//!                              (encode once)        channel      (try_recv, apply)
//! ```
//!
//! Only encoded bytes cross the thread boundary. The source side never
//! waits on a mirror and the mirror side never blocks on the channel.

mod target;

pub use target::{BatchReport, DrainReport, SyncTarget};

use std::sync::Arc;

use bytes::Bytes;
use crossbeam_channel::{Receiver, Sender};
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::config::SyncConfig;
use crate::graph::BoxGraph;
use crate::project::MandatoryBoxes;
use crate::snapshot;
use crate::tx::{Transaction, UpdateListener};
use crate::update::encode_batch;
use crate::Result;

/// What travels to a mirror.
#[derive(Debug, Clone, PartialEq)]
pub enum BridgeMessage {
    /// Full state; replaces the mirror's graph.
    Snapshot(Bytes),
    /// One committed transaction.
    Batch(Bytes),
}

/// Fan-out of committed transactions to every attached mirror.
///
/// Cloneable handle: subscribe one clone to `BoxEditing` and keep another
/// to attach mirrors later.
#[derive(Clone, Default)]
pub struct SyncSource {
    mirrors: Arc<Mutex<Vec<Sender<BridgeMessage>>>>,
}

impl SyncSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a new mirror. It receives a snapshot of `graph` first, then
    /// every batch published after this call. Fails with `TransactionOpen`
    /// while `graph` has uncommitted changes.
    pub fn attach(
        &self,
        graph: &BoxGraph,
        mandatory: &MandatoryBoxes,
        config: SyncConfig,
    ) -> Result<SyncTarget> {
        let state = BridgeMessage::Snapshot(snapshot::encode(graph, mandatory)?);
        let (tx, rx) = crossbeam_channel::unbounded();
        if tx.send(state).is_ok() {
            self.mirrors.lock().push(tx);
        }
        Ok(SyncTarget::new(BoxGraph::new(), rx, config))
    }

    /// Register a bare receiver of future messages, without a snapshot.
    pub fn subscribe_raw(&self) -> Receiver<BridgeMessage> {
        let (tx, rx) = crossbeam_channel::unbounded();
        self.mirrors.lock().push(tx);
        rx
    }

    pub fn mirror_count(&self) -> usize {
        self.mirrors.lock().len()
    }

    /// Encode `tx` once and send it to every mirror, pruning mirrors whose
    /// receiving end is gone.
    pub fn publish(&self, tx: &Transaction) {
        if tx.is_empty() {
            return;
        }
        let bytes = encode_batch(tx);
        let mut mirrors = self.mirrors.lock();
        mirrors.retain(|mirror| match mirror.send(BridgeMessage::Batch(bytes.clone())) {
            Ok(()) => true,
            Err(_) => {
                warn!(tx = %tx.id, "mirror disconnected, pruning");
                false
            }
        });
        debug!(tx = %tx.id, updates = tx.len(), bytes = bytes.len(), mirrors = mirrors.len(), "published batch");
    }
}

impl UpdateListener for SyncSource {
    fn on_commit(&mut self, tx: &Transaction) {
        self.publish(tx);
    }
}
