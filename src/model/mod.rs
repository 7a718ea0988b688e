//! # Box Graph Model
//!
//! Plain data that crosses every boundary: graph ↔ transactions ↔ wire.
//!
//! Design rule: no I/O, no state, no threads here.

pub mod id;
pub mod kind;
pub mod record;
pub mod value;

pub use id::{Address, BoxId, FieldKey, FieldPath};
pub use kind::{BoxKind, FieldDecl, FieldSpec, Init, PointerType};
pub use record::{BoxRecord, FieldValue, FieldValues};
pub use value::{Value, ValueType};
