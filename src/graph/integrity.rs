//! Integrity checks: dangling pointers, index consistency, orphans and
//! mandatory pointers.

use std::collections::{BTreeSet, VecDeque};
use std::fmt;

use hashbrown::HashSet;
use serde::{Deserialize, Serialize};

use super::BoxGraph;
use crate::model::{Address, BoxId, FieldSpec};
use crate::update::Update;
use crate::{Error, Result};

/// Why a pointer failed verification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum DanglingReason {
    /// Target box does not exist.
    MissingBox,
    /// Target box exists but has no such field.
    MissingField,
    /// Target does not accept the pointer's purpose.
    NotAccepted,
    /// Forward pointer is missing from the reverse index.
    Unindexed,
    /// Reverse index holds an entry with no matching forward pointer.
    StaleIndex,
}

impl fmt::Display for DanglingReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DanglingReason::MissingBox => "missing box",
            DanglingReason::MissingField => "missing field",
            DanglingReason::NotAccepted => "target does not accept purpose",
            DanglingReason::Unindexed => "not in reverse index",
            DanglingReason::StaleIndex => "stale reverse index entry",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DanglingPointer {
    pub pointer: Address,
    pub target: Address,
    pub reason: DanglingReason,
}

impl fmt::Display for DanglingPointer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} -> {}: {}", self.pointer, self.target, self.reason)
    }
}

impl BoxGraph {
    /// Walk every pointer. `Ok(n)` is the number of resolved pointers.
    pub fn verify_integrity(&self) -> std::result::Result<usize, Vec<DanglingPointer>> {
        let mut problems = Vec::new();
        let mut checked = 0;

        for record in self.boxes.values() {
            for (pointer, target) in record.pointers() {
                checked += 1;
                let reason = match self.boxes.get(&target.box_id) {
                    None => Some(DanglingReason::MissingBox),
                    Some(t) if !target.path.is_empty() && t.kind.field(&target.path).is_none() => {
                        Some(DanglingReason::MissingField)
                    }
                    Some(t) => {
                        let accepted = self
                            .pointer_purpose(&pointer)
                            .is_some_and(|purpose| t.kind.accepts_at(&target.path, purpose));
                        if !accepted {
                            Some(DanglingReason::NotAccepted)
                        } else if !self.index.contains(&pointer, target) {
                            Some(DanglingReason::Unindexed)
                        } else {
                            None
                        }
                    }
                };
                if let Some(reason) = reason {
                    problems.push(DanglingPointer { pointer, target: target.clone(), reason });
                }
            }
        }

        for (pointer, target) in self.index.iter() {
            let forward = self
                .boxes
                .get(&pointer.box_id)
                .and_then(|r| r.pointer(&pointer.path));
            if forward != Some(target) {
                problems.push(DanglingPointer {
                    pointer: pointer.clone(),
                    target: target.clone(),
                    reason: DanglingReason::StaleIndex,
                });
            }
        }

        if problems.is_empty() {
            Ok(checked)
        } else {
            problems.sort();
            Err(problems)
        }
    }

    /// Boxes not connected to `root` through pointers in either direction,
    /// sorted by id.
    pub fn find_orphans(&self, root: BoxId) -> Vec<BoxId> {
        let mut reached = HashSet::new();
        let mut queue = VecDeque::new();
        if self.boxes.contains_key(&root) {
            reached.insert(root);
            queue.push_back(root);
        }
        while let Some(id) = queue.pop_front() {
            let mut neighbours: Vec<BoxId> = self
                .index
                .incoming_to_box(id)
                .into_iter()
                .map(|(pointer, _)| pointer.box_id)
                .collect();
            if let Some(record) = self.boxes.get(&id) {
                neighbours.extend(record.pointers().map(|(_, target)| target.box_id));
            }
            for n in neighbours {
                if self.boxes.contains_key(&n) && reached.insert(n) {
                    queue.push_back(n);
                }
            }
        }
        let mut orphans: Vec<BoxId> = self
            .boxes
            .keys()
            .filter(|id| !reached.contains(*id))
            .copied()
            .collect();
        orphans.sort_unstable();
        orphans
    }

    /// Every unset mandatory pointer on boxes touched by the open
    /// transaction.
    pub(crate) fn check_mandatory(&self) -> Result<()> {
        let touched: BTreeSet<BoxId> = self.pending_updates().iter().map(Update::box_id).collect();
        let mut missing = Vec::new();
        for id in touched {
            let Some(record) = self.boxes.get(&id) else {
                continue;
            };
            for (path, spec) in record.kind.slots() {
                if let FieldSpec::Pointer { mandatory: true, .. } = spec {
                    if record.pointer(&path).is_none() {
                        missing.push(Address { box_id: id, path }.to_string());
                    }
                }
            }
        }
        if missing.is_empty() {
            Ok(())
        } else {
            Err(Error::IntegrityViolation(format!(
                "mandatory pointer unset: {}",
                missing.join(", ")
            )))
        }
    }
}
