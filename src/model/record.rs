//! Stored box state.

use std::collections::BTreeMap;

use super::{Address, BoxId, BoxKind, FieldKey, FieldPath, FieldSpec, Value};

/// State of one primitive or pointer leaf.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    Primitive(Value),
    Pointer(Option<Address>),
}

/// All leaves of a box, ordered by path. This is the "field blob".
pub type FieldValues = BTreeMap<FieldPath, FieldValue>;

/// A box: identity, kind, and the current value of every leaf field.
#[derive(Debug, Clone, PartialEq)]
pub struct BoxRecord {
    pub id: BoxId,
    pub kind: BoxKind,
    pub(crate) fields: FieldValues,
}

impl BoxRecord {
    /// New box with every field at its schema default and all pointers unset.
    pub fn new(id: BoxId, kind: BoxKind) -> Self {
        let fields = kind
            .slots()
            .into_iter()
            .map(|(path, spec)| {
                let value = match spec {
                    FieldSpec::Primitive(init) => FieldValue::Primitive(init.value()),
                    _ => FieldValue::Pointer(None),
                };
                (path, value)
            })
            .collect();
        Self { id, kind, fields }
    }

    pub fn fields(&self) -> &FieldValues {
        &self.fields
    }

    pub fn get(&self, path: &[FieldKey]) -> Option<&FieldValue> {
        self.fields.get(path)
    }

    pub fn value(&self, path: &[FieldKey]) -> Option<&Value> {
        match self.fields.get(path)? {
            FieldValue::Primitive(v) => Some(v),
            FieldValue::Pointer(_) => None,
        }
    }

    pub fn pointer(&self, path: &[FieldKey]) -> Option<&Address> {
        match self.fields.get(path)? {
            FieldValue::Pointer(target) => target.as_ref(),
            FieldValue::Primitive(_) => None,
        }
    }

    /// Every set pointer of this box as `(pointer address, target)`.
    pub fn pointers(&self) -> impl Iterator<Item = (Address, &Address)> + '_ {
        self.fields.iter().filter_map(|(path, value)| match value {
            FieldValue::Pointer(Some(target)) => Some((
                Address { box_id: self.id, path: path.clone() },
                target,
            )),
            _ => None,
        })
    }
}

/// Split a field blob into its primitive part (pointers unset) and the
/// pointers that were set.
pub fn split_pointers(fields: &FieldValues) -> (FieldValues, Vec<(FieldPath, Address)>) {
    let mut plain = FieldValues::new();
    let mut pointers = Vec::new();
    for (path, value) in fields {
        match value {
            FieldValue::Pointer(Some(target)) => {
                pointers.push((path.clone(), target.clone()));
                plain.insert(path.clone(), FieldValue::Pointer(None));
            }
            other => {
                plain.insert(path.clone(), other.clone());
            }
        }
    }
    (plain, pointers)
}
