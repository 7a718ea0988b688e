//! # Box Graph
//!
//! In-memory store of boxes with a reverse pointer index and a journaled,
//! nestable transaction.
//!
//! ## Rules
//!
//! - Every mutation requires an open transaction (`NotInTransaction`).
//! - Every mutation is journaled as an `Update`; rollback reverts the
//!   journal in reverse without re-validating.
//! - Pointers are validated at assignment: target exists, target accepts
//!   the purpose, routing stays acyclic.
//! - Deleting a box clears every pointer into it first, one `Pointer`
//!   update per cleared pointer.

pub mod index;
pub mod integrity;
pub mod routing;

pub use index::PointerIndex;
pub use integrity::{DanglingPointer, DanglingReason};

use std::collections::VecDeque;

use hashbrown::{HashMap, HashSet};
use tracing::debug;

use crate::model::record::split_pointers;
use crate::model::*;
use crate::tx::{Transaction, TxId, TxMode};
use crate::update::Update;
use crate::{Error, Result};

// ============================================================================
// BoxGraph
// ============================================================================

#[derive(Debug, Clone)]
struct TxState {
    id: TxId,
    journal: Vec<Update>,
    /// Journal lengths at each nested `begin`.
    savepoints: Vec<usize>,
}

/// The entity graph.
#[derive(Debug, Clone, Default)]
pub struct BoxGraph {
    boxes: HashMap<BoxId, BoxRecord>,
    index: PointerIndex,
    /// Ids of deleted boxes; `create_box` never hands them out again.
    retired: HashSet<BoxId>,
    tx: Option<TxState>,
    next_tx_id: u64,
}

impl BoxGraph {
    pub fn new() -> Self {
        Self::default()
    }

    // ========================================================================
    // Transaction control
    // ========================================================================

    /// Open a transaction, or a savepoint if one is already open.
    pub fn begin(&mut self) {
        match &mut self.tx {
            Some(state) => state.savepoints.push(state.journal.len()),
            None => {
                self.next_tx_id += 1;
                self.tx = Some(TxState {
                    id: TxId(self.next_tx_id),
                    journal: Vec::new(),
                    savepoints: Vec::new(),
                });
            }
        }
    }

    /// Close the innermost level. Only the outermost commit yields the
    /// finished transaction (as `Recorded`; callers re-tag the mode).
    pub fn commit(&mut self) -> Result<Option<Transaction>> {
        let Some(mut state) = self.tx.take() else {
            return Err(Error::NotInTransaction);
        };
        if state.savepoints.pop().is_some() {
            self.tx = Some(state);
            return Ok(None);
        }
        debug!(tx = %state.id, updates = state.journal.len(), "commit");
        Ok(Some(Transaction::new(state.id, TxMode::Recorded, state.journal)))
    }

    /// Revert everything since the innermost `begin`.
    pub fn rollback(&mut self) -> Result<()> {
        let Some(mut state) = self.tx.take() else {
            return Err(Error::NotInTransaction);
        };
        let savepoint = state.savepoints.pop();
        let reverted: Vec<Update> = state.journal.drain(savepoint.unwrap_or(0)..).collect();
        for update in reverted.iter().rev() {
            self.revert(update);
        }
        debug!(tx = %state.id, reverted = reverted.len(), nested = savepoint.is_some(), "rollback");
        if savepoint.is_some() {
            self.tx = Some(state);
        }
        Ok(())
    }

    pub fn in_transaction(&self) -> bool {
        self.tx.is_some()
    }

    /// Updates journaled so far in the open transaction.
    pub fn pending_updates(&self) -> &[Update] {
        self.tx.as_ref().map(|s| s.journal.as_slice()).unwrap_or(&[])
    }

    fn ensure_tx(&self) -> Result<()> {
        if self.tx.is_none() {
            return Err(Error::NotInTransaction);
        }
        Ok(())
    }

    fn push(&mut self, update: Update) {
        if let Some(state) = &mut self.tx {
            state.journal.push(update);
        }
    }

    fn revert(&mut self, update: &Update) {
        match update {
            Update::Create { id, .. } => {
                self.raw_remove(*id);
            }
            Update::Delete { id, kind, fields } => {
                self.raw_insert(BoxRecord { id: *id, kind: *kind, fields: fields.clone() });
            }
            Update::Primitive { address, old, .. } => {
                self.raw_set(address, FieldValue::Primitive(old.clone()));
            }
            Update::Pointer { address, old, .. } => {
                self.raw_set(address, FieldValue::Pointer(old.clone()));
            }
        }
    }

    // ========================================================================
    // Raw storage (no validation, no journal; keeps the index in step)
    // ========================================================================

    fn raw_insert(&mut self, record: BoxRecord) {
        for (pointer, target) in record.pointers() {
            self.index.insert(&pointer, target);
        }
        self.boxes.insert(record.id, record);
    }

    fn raw_remove(&mut self, id: BoxId) -> Option<BoxRecord> {
        let record = self.boxes.remove(&id)?;
        for (pointer, target) in record.pointers() {
            self.index.remove(&pointer, target);
        }
        Some(record)
    }

    fn raw_set(&mut self, address: &Address, value: FieldValue) -> Option<FieldValue> {
        let record = self.boxes.get_mut(&address.box_id)?;
        let slot = record.fields.get_mut(&address.path[..])?;
        let old = std::mem::replace(slot, value);
        if let FieldValue::Pointer(Some(target)) = &old {
            self.index.remove(address, target);
        }
        if let FieldValue::Pointer(Some(target)) = &*slot {
            self.index.insert(address, target);
        }
        Some(old)
    }

    // ========================================================================
    // Box lifecycle
    // ========================================================================

    /// Create a box with schema defaults. `id` lets callers choose the
    /// identity; live or retired ids are rejected.
    pub fn create_box(&mut self, kind: BoxKind, id: Option<BoxId>) -> Result<BoxId> {
        self.ensure_tx()?;
        let id = id.unwrap_or_else(BoxId::new);
        if self.boxes.contains_key(&id) || self.retired.contains(&id) {
            return Err(Error::DuplicateBox(id));
        }
        let record = BoxRecord::new(id, kind);
        let fields = record.fields.clone();
        self.raw_insert(record);
        self.push(Update::Create { id, kind, fields });
        Ok(id)
    }

    /// Bring back a box with the given state (replay of a `Create`).
    /// Retired ids are allowed here. Pointers in `fields` are validated
    /// like `set_pointer`; missing slots take schema defaults.
    pub fn restore_box(&mut self, id: BoxId, kind: BoxKind, fields: &FieldValues) -> Result<()> {
        self.ensure_tx()?;
        if self.boxes.contains_key(&id) {
            return Err(Error::DuplicateBox(id));
        }
        let (plain, pointers) = split_pointers(fields);
        let mut record = BoxRecord::new(id, kind);
        for (path, value) in plain {
            let address = Address { box_id: id, path: path.clone() };
            match (kind.field(&path), &value) {
                (Some(FieldSpec::Primitive(init)), FieldValue::Primitive(v)) => {
                    if init.value_type() != v.value_type() {
                        return Err(Error::TypeMismatch {
                            address,
                            expected: init.value_type(),
                            got: v.value_type(),
                        });
                    }
                }
                (Some(FieldSpec::Pointer { .. }), FieldValue::Pointer(_)) => {}
                (Some(FieldSpec::Pointer { .. }), FieldValue::Primitive(_)) => {
                    return Err(Error::NotAPrimitive(address));
                }
                (Some(FieldSpec::Primitive(_)), FieldValue::Pointer(_)) => {
                    return Err(Error::NotAPointer(address));
                }
                _ => return Err(Error::UnknownField(address)),
            }
            record.fields.insert(path, value);
        }
        self.raw_insert(record);

        for (path, target) in pointers {
            let pointer = Address { box_id: id, path };
            if let Err(e) = self.link(&pointer, target) {
                self.raw_remove(id);
                return Err(e);
            }
        }
        let fields = self.boxes.get(&id).map(|r| r.fields.clone()).unwrap_or_default();
        self.push(Update::Create { id, kind, fields });
        Ok(())
    }

    /// Delete a box, clearing every pointer that targets it or any of its
    /// fields first.
    pub fn delete_box(&mut self, id: BoxId) -> Result<()> {
        self.ensure_tx()?;
        if !self.boxes.contains_key(&id) {
            return Err(Error::BoxNotFound(id));
        }
        for (pointer, target) in self.index.incoming_to_box(id) {
            self.raw_set(&pointer, FieldValue::Pointer(None));
            self.push(Update::Pointer { address: pointer, old: Some(target), new: None });
        }
        let Some(record) = self.raw_remove(id) else {
            return Err(Error::BoxNotFound(id));
        };
        self.retired.insert(id);
        self.push(Update::Delete { id, kind: record.kind, fields: record.fields });
        Ok(())
    }

    /// Delete a box together with every box whose mandatory pointer targets
    /// it, transitively. Returns the deleted ids, `id` first.
    pub fn delete_box_with_dependents(&mut self, id: BoxId) -> Result<Vec<BoxId>> {
        self.ensure_tx()?;
        if !self.boxes.contains_key(&id) {
            return Err(Error::BoxNotFound(id));
        }
        let mut order = vec![id];
        let mut seen = HashSet::new();
        seen.insert(id);
        let mut queue = VecDeque::from([id]);
        while let Some(current) = queue.pop_front() {
            for (pointer, _) in self.index.incoming_to_box(current) {
                let dependent = pointer.box_id;
                if self.is_mandatory(&pointer) && seen.insert(dependent) {
                    order.push(dependent);
                    queue.push_back(dependent);
                }
            }
        }
        for victim in order.iter().rev() {
            self.delete_box(*victim)?;
        }
        Ok(order)
    }

    // ========================================================================
    // Fields
    // ========================================================================

    pub fn read_field(&self, address: &Address) -> Result<&Value> {
        let record = self
            .boxes
            .get(&address.box_id)
            .ok_or(Error::BoxNotFound(address.box_id))?;
        match record.kind.field(&address.path) {
            Some(FieldSpec::Primitive(_)) => record
                .value(&address.path)
                .ok_or_else(|| Error::UnknownField(address.clone())),
            Some(_) => Err(Error::NotAPrimitive(address.clone())),
            None => Err(Error::UnknownField(address.clone())),
        }
    }

    /// Write a primitive. Writing the current value is a no-op.
    pub fn write_field(&mut self, address: &Address, value: Value) -> Result<()> {
        self.ensure_tx()?;
        let current = self.read_field(address)?;
        if current.value_type() != value.value_type() {
            return Err(Error::TypeMismatch {
                address: address.clone(),
                expected: current.value_type(),
                got: value.value_type(),
            });
        }
        if *current == value {
            return Ok(());
        }
        let old = current.clone();
        self.raw_set(address, FieldValue::Primitive(value.clone()));
        self.push(Update::Primitive { address: address.clone(), old, new: value });
        Ok(())
    }

    // ========================================================================
    // Pointers
    // ========================================================================

    fn pointer_spec(&self, pointer: &Address) -> Result<(PointerType, bool)> {
        let kind = self.kind_of(pointer.box_id).ok_or(Error::BoxNotFound(pointer.box_id))?;
        match kind.field(&pointer.path) {
            Some(FieldSpec::Pointer { purpose, mandatory }) => Ok((*purpose, *mandatory)),
            Some(_) => Err(Error::NotAPointer(pointer.clone())),
            None => Err(Error::UnknownField(pointer.clone())),
        }
    }

    fn is_mandatory(&self, pointer: &Address) -> bool {
        self.pointer_spec(pointer).is_ok_and(|(_, mandatory)| mandatory)
    }

    /// Purpose of the pointer field at `pointer`, if it is one.
    pub fn pointer_purpose(&self, pointer: &Address) -> Option<PointerType> {
        self.pointer_spec(pointer).ok().map(|(purpose, _)| purpose)
    }

    /// Validate and assign without journaling. Returns the previous slot.
    fn link(&mut self, pointer: &Address, target: Address) -> Result<Option<Address>> {
        let (purpose, _) = self.pointer_spec(pointer)?;
        let Some(target_kind) = self.kind_of(target.box_id) else {
            return Err(Error::DanglingPointer { pointer: pointer.clone(), target });
        };
        if !target_kind.accepts_at(&target.path, purpose) {
            return Err(Error::IllegalTarget { pointer: pointer.clone(), target, purpose });
        }
        if purpose.is_routing() {
            self.check_routing_cycle(pointer, purpose, &target)?;
        }
        match self.raw_set(pointer, FieldValue::Pointer(Some(target))) {
            Some(FieldValue::Pointer(old)) => Ok(old),
            _ => Ok(None),
        }
    }

    pub fn read_pointer(&self, pointer: &Address) -> Result<Option<&Address>> {
        self.pointer_spec(pointer)?;
        Ok(self
            .boxes
            .get(&pointer.box_id)
            .and_then(|record| record.pointer(&pointer.path)))
    }

    /// Point `pointer` at `target`. Re-setting the current target is a no-op.
    pub fn set_pointer(&mut self, pointer: &Address, target: Address) -> Result<()> {
        self.ensure_tx()?;
        if self.read_pointer(pointer)? == Some(&target) {
            return Ok(());
        }
        let old = self.link(pointer, target.clone())?;
        self.push(Update::Pointer { address: pointer.clone(), old, new: Some(target) });
        Ok(())
    }

    pub fn clear_pointer(&mut self, pointer: &Address) -> Result<()> {
        self.ensure_tx()?;
        let Some(old) = self.read_pointer(pointer)?.cloned() else {
            return Ok(());
        };
        self.raw_set(pointer, FieldValue::Pointer(None));
        self.push(Update::Pointer { address: pointer.clone(), old: Some(old), new: None });
        Ok(())
    }

    // ========================================================================
    // Replay
    // ========================================================================

    /// Apply an update through the validated operations.
    pub fn apply(&mut self, update: &Update) -> Result<()> {
        match update {
            Update::Create { id, kind, fields } => self.restore_box(*id, *kind, fields),
            Update::Delete { id, kind, .. } => match self.kind_of(*id) {
                Some(live) if live == *kind => self.delete_box(*id),
                Some(live) => Err(Error::ApplyFailed(format!(
                    "delete of {id}: expected {kind}, found {live}"
                ))),
                None => Err(Error::BoxNotFound(*id)),
            },
            Update::Primitive { address, new, .. } => self.write_field(address, new.clone()),
            Update::Pointer { address, new, .. } => match new {
                Some(target) => self.set_pointer(address, target.clone()),
                None => self.clear_pointer(address),
            },
        }
    }

    // ========================================================================
    // Queries
    // ========================================================================

    pub fn find_box(&self, id: BoxId) -> Option<&BoxRecord> {
        self.boxes.get(&id)
    }

    pub fn contains(&self, id: BoxId) -> bool {
        self.boxes.contains_key(&id)
    }

    pub fn kind_of(&self, id: BoxId) -> Option<BoxKind> {
        self.boxes.get(&id).map(|r| r.kind)
    }

    pub fn box_count(&self) -> usize {
        self.boxes.len()
    }

    /// All boxes, unordered.
    pub fn boxes(&self) -> impl Iterator<Item = &BoxRecord> {
        self.boxes.values()
    }

    pub fn sorted_ids(&self) -> Vec<BoxId> {
        let mut ids: Vec<BoxId> = self.boxes.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    pub fn boxes_of_kind(&self, kind: BoxKind) -> Vec<BoxId> {
        let mut ids: Vec<BoxId> = self
            .boxes
            .values()
            .filter(|r| r.kind == kind)
            .map(|r| r.id)
            .collect();
        ids.sort_unstable();
        ids
    }

    /// Pointers targeting exactly `target`.
    pub fn incoming(&self, target: &Address) -> Vec<Address> {
        self.index.incoming(target).cloned().collect()
    }

    /// `(pointer, target)` for every pointer into box `id` or its fields.
    pub fn incoming_to_box(&self, id: BoxId) -> Vec<(Address, Address)> {
        self.index.incoming_to_box(id)
    }

    /// Number of set pointers.
    pub fn pointer_count(&self) -> usize {
        self.index.len()
    }
}
