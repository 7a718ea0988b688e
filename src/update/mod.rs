//! # Update messages
//!
//! Every committed mutation is one `Update`. Undo replays inverses, the
//! sync bridge replays the encoded form on the mirror, and snapshots are a
//! batch of `Create`s with pointers applied last.

pub mod codec;

pub use codec::{decode_batch, decode_update, encode_batch, encode_update, DecodedBatch};

use crate::model::{Address, BoxId, BoxKind, FieldValues, Value};

/// One atomic, invertible change to the graph.
#[derive(Debug, Clone, PartialEq)]
pub enum Update {
    /// A box came into existence with exactly these field values.
    Create { id: BoxId, kind: BoxKind, fields: FieldValues },
    /// A box was removed; `fields` is its state just before removal.
    Delete { id: BoxId, kind: BoxKind, fields: FieldValues },
    Primitive { address: Address, old: Value, new: Value },
    Pointer { address: Address, old: Option<Address>, new: Option<Address> },
}

impl Update {
    pub const TAG_CREATE: u8 = 1;
    pub const TAG_DELETE: u8 = 2;
    pub const TAG_PRIMITIVE: u8 = 3;
    pub const TAG_POINTER: u8 = 4;

    /// Wire tag.
    pub fn tag(&self) -> u8 {
        match self {
            Update::Create { .. } => Self::TAG_CREATE,
            Update::Delete { .. } => Self::TAG_DELETE,
            Update::Primitive { .. } => Self::TAG_PRIMITIVE,
            Update::Pointer { .. } => Self::TAG_POINTER,
        }
    }

    /// The update that reverts this one.
    pub fn inverse(&self) -> Update {
        match self {
            Update::Create { id, kind, fields } => {
                Update::Delete { id: *id, kind: *kind, fields: fields.clone() }
            }
            Update::Delete { id, kind, fields } => {
                Update::Create { id: *id, kind: *kind, fields: fields.clone() }
            }
            Update::Primitive { address, old, new } => Update::Primitive {
                address: address.clone(),
                old: new.clone(),
                new: old.clone(),
            },
            Update::Pointer { address, old, new } => Update::Pointer {
                address: address.clone(),
                old: new.clone(),
                new: old.clone(),
            },
        }
    }

    /// The box this update mutates.
    pub fn box_id(&self) -> BoxId {
        match self {
            Update::Create { id, .. } | Update::Delete { id, .. } => *id,
            Update::Primitive { address, .. } | Update::Pointer { address, .. } => address.box_id,
        }
    }
}
