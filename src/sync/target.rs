//! Mirror side of the bridge.

use crossbeam_channel::{Receiver, TryRecvError};
use tracing::{debug, warn};

use super::BridgeMessage;
use crate::config::{RetryPolicy, SyncConfig};
use crate::graph::BoxGraph;
use crate::project::MandatoryBoxes;
use crate::snapshot;
use crate::tx::TxId;
use crate::update::{decode_batch, Update};
use crate::{Error, Result};

/// Outcome of applying one batch to the mirror.
#[derive(Debug, Clone, PartialEq)]
pub struct BatchReport {
    pub tx_id: TxId,
    /// Updates applied, including those that needed a retry.
    pub applied: usize,
    /// Updates that failed first and succeeded on a retry pass.
    pub retried: usize,
    /// Updates that could not be decoded or applied.
    pub dropped: usize,
    /// What the mirror actually changed, in order (cascades included).
    pub updates: Vec<Update>,
}

/// Outcome of one `drain` call.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DrainReport {
    pub batches: usize,
    pub dropped: usize,
    pub updates: Vec<Update>,
    /// A snapshot replaced the whole mirror graph.
    pub snapshot_loaded: bool,
    /// The source side is gone; no further messages will arrive.
    pub disconnected: bool,
}

/// Owns a mirror graph fed from a `SyncSource`.
pub struct SyncTarget {
    graph: BoxGraph,
    mandatory: Option<MandatoryBoxes>,
    rx: Receiver<BridgeMessage>,
    config: SyncConfig,
}

impl SyncTarget {
    pub fn new(graph: BoxGraph, rx: Receiver<BridgeMessage>, config: SyncConfig) -> Self {
        Self { graph, mandatory: None, rx, config }
    }

    pub fn graph(&self) -> &BoxGraph {
        &self.graph
    }

    /// Handles from the last loaded snapshot.
    pub fn mandatory(&self) -> Option<MandatoryBoxes> {
        self.mandatory
    }

    pub fn load_snapshot(&mut self, bytes: &[u8]) -> Result<()> {
        let (graph, mandatory) = snapshot::decode(bytes)?;
        debug!(boxes = graph.box_count(), "mirror loaded snapshot");
        self.graph = graph;
        self.mandatory = Some(mandatory);
        Ok(())
    }

    /// Apply whatever is waiting, up to `max_batches_per_drain` messages.
    /// Never blocks.
    pub fn drain(&mut self) -> DrainReport {
        let mut report = DrainReport::default();
        for _ in 0..self.config.max_batches_per_drain {
            match self.rx.try_recv() {
                Ok(BridgeMessage::Snapshot(bytes)) => match self.load_snapshot(&bytes) {
                    Ok(()) => {
                        report.snapshot_loaded = true;
                        report.updates.clear();
                    }
                    Err(e) => warn!(error = %e, "mirror rejected snapshot"),
                },
                Ok(BridgeMessage::Batch(bytes)) => match self.apply_batch(&bytes) {
                    Ok(batch) => {
                        report.batches += 1;
                        report.dropped += batch.dropped;
                        report.updates.extend(batch.updates);
                    }
                    Err(e) => warn!(error = %e, "mirror dropped undecodable batch"),
                },
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => {
                    report.disconnected = true;
                    break;
                }
            }
        }
        if report.batches > 0 {
            debug!(batches = report.batches, updates = report.updates.len(), dropped = report.dropped, "mirror drained");
        }
        report
    }

    /// Apply one encoded batch in one transaction. Failing updates are set
    /// aside and retried per the configured `RetryPolicy`; whatever still
    /// fails is dropped. Only broken batch framing fails the call.
    pub fn apply_batch(&mut self, bytes: &[u8]) -> Result<BatchReport> {
        let decoded = decode_batch(bytes)?;
        let tx_id = decoded.tx_id;
        for e in &decoded.rejected {
            warn!(tx = %tx_id, error = %e, "dropping undecodable message");
        }
        let mut report = BatchReport {
            tx_id,
            applied: 0,
            retried: 0,
            dropped: decoded.rejected.len(),
            updates: Vec::new(),
        };

        self.graph.begin();
        let mut pending = Vec::new();
        for update in decoded.updates {
            match self.graph.apply(&update) {
                Ok(()) => report.applied += 1,
                Err(e) => {
                    let e = Error::ApplyFailed(format!("{} on {}: {e}", tx_id, update.box_id()));
                    debug!(error = %e, "deferring update");
                    pending.push(update);
                }
            }
        }

        let max_passes = match self.config.retry {
            RetryPolicy::Never => 0,
            RetryPolicy::Once => 1,
            RetryPolicy::UntilStable => usize::MAX,
        };
        let mut passes = 0;
        while !pending.is_empty() && passes < max_passes {
            passes += 1;
            let before = pending.len();
            let mut still_failing = Vec::new();
            for update in pending {
                match self.graph.apply(&update) {
                    Ok(()) => {
                        report.applied += 1;
                        report.retried += 1;
                    }
                    Err(_) => still_failing.push(update),
                }
            }
            pending = still_failing;
            if pending.len() == before {
                break;
            }
        }

        for update in &pending {
            warn!(tx = %tx_id, box_id = %update.box_id(), tag = update.tag(), "dropping update that failed to apply");
        }
        report.dropped += pending.len();
        report.updates = self.graph.commit()?.map(|tx| tx.updates).unwrap_or_default();
        Ok(report)
    }
}
