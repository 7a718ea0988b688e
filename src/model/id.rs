//! Box identifiers and field addresses.

use std::fmt;

use serde::{Deserialize, Serialize};
use smallvec::SmallVec;
use uuid::Uuid;

/// Globally unique box identifier (128-bit UUID).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BoxId(pub Uuid);

impl BoxId {
    /// Fresh random identifier.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(Uuid::from_bytes(bytes))
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        self.0.as_bytes()
    }
}

impl Default for BoxId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for BoxId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Field key, local to a box.
pub type FieldKey = u16;

/// Sequence of keys into nested object fields. Empty = the box itself.
pub type FieldPath = SmallVec<[FieldKey; 4]>;

/// Full address of a box or one of its fields.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Address {
    pub box_id: BoxId,
    pub path: FieldPath,
}

impl Address {
    /// Address of the box itself.
    pub fn of_box(box_id: BoxId) -> Self {
        Self { box_id, path: FieldPath::new() }
    }

    /// Address of a (possibly nested) field.
    pub fn field(box_id: BoxId, keys: &[FieldKey]) -> Self {
        Self { box_id, path: FieldPath::from_slice(keys) }
    }

    pub fn is_box(&self) -> bool {
        self.path.is_empty()
    }

    /// Extend this address by one key.
    pub fn child(&self, key: FieldKey) -> Self {
        let mut path = self.path.clone();
        path.push(key);
        Self { box_id: self.box_id, path }
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.box_id)?;
        for key in &self.path {
            write!(f, "/{key}")?;
        }
        Ok(())
    }
}
