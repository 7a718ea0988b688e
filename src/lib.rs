//! # boxgraph: Transactional Box Graph with Real-Time Mirroring
//!
//! The project model of an audio workstation as a graph of typed *boxes*
//! connected by pointer fields, with undo/redo, a binary replay format, and
//! a bridge that keeps a mirror of the graph consistent inside a real-time
//! audio context.
//!
//! ## Design Principles
//!
//! 1. **Closed kinds**: `BoxKind` is an enum with static schemas; every
//!    dispatch over kinds is an exhaustive `match`
//! 2. **Updates are the only currency**: every mutation is journaled as an
//!    `Update`; undo, persistence and mirroring all replay the same values
//! 3. **Reverse index, not parent lists**: "who points at me" is an index
//!    lookup, never a scan
//! 4. **The audio side never blocks**: graph state crosses threads as
//!    encoded batches; only telemetry shares memory
//!
//! ## Quick Start
//!
//! ```rust
//! use boxgraph::{BoxEditing, BoxGraph, BoxKind, Address, project};
//! use boxgraph::model::kind::{device, track};
//!
//! # fn example() -> boxgraph::Result<()> {
//! let mut editing = BoxEditing::new(BoxGraph::new());
//! let mandatory = project::create_project(&mut editing)?;
//!
//! let (track_id, device_id) = editing.modify(|e| {
//!     let t = e.create_box(BoxKind::Track, None)?;
//!     let d = e.create_box(BoxKind::Device, None)?;
//!     e.set_pointer(&Address::field(d, &[device::HOST]), Address::field(t, &[track::DEVICES]))?;
//!     Ok((t, d))
//! })?;
//!
//! assert_eq!(editing.verify_integrity(), Ok(editing.pointer_count()));
//! editing.undo()?;
//! assert!(editing.find_box(track_id).is_none());
//! # let _ = (mandatory, device_id);
//! # Ok(())
//! # }
//! # example().unwrap();
//! ```
//!
//! ## Threads
//!
//! | Side | Types |
//! |------|-------|
//! | UI | `BoxEditing`, `SyncSource`, `EngineClient`, `TelemetryReader` |
//! | Audio | `SyncTarget`, `ProcessingScheduler`, `AudioEngine`, `TelemetryWriter` |

// ============================================================================
// Modules
// ============================================================================

pub mod model;
pub mod graph;
pub mod tx;
pub mod update;
pub mod snapshot;
pub mod project;
pub mod sync;
pub mod telemetry;
pub mod scheduler;
pub mod rpc;
pub mod engine;
pub mod config;

// ============================================================================
// Re-exports: Model
// ============================================================================

pub use model::{
    Address, BoxId, BoxKind, BoxRecord, FieldKey, FieldPath, FieldValue,
    FieldValues, PointerType, Value, ValueType,
};

// ============================================================================
// Re-exports: Graph and transactions
// ============================================================================

pub use graph::{BoxGraph, DanglingPointer, DanglingReason};
pub use tx::{BoxEditing, Preview, Transaction, TxId, TxMode, UpdateListener};
pub use update::Update;

// ============================================================================
// Re-exports: Cross-thread
// ============================================================================

pub use project::MandatoryBoxes;
pub use sync::{BatchReport, BridgeMessage, DrainReport, SyncSource, SyncTarget};
pub use telemetry::{TelemetryReader, TelemetryRecord, TelemetryWriter, TransportRecord};
pub use scheduler::{ProcessingScheduler, Processor, ProcessorKind};
pub use rpc::{Command, EngineClient, EngineControl, Query, QueryReply};
pub use engine::AudioEngine;
pub use config::EngineConfig;

// ============================================================================
// Error Types
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Mutation attempted outside of a transaction")]
    NotInTransaction,

    #[error("Operation not allowed while a transaction is open")]
    TransactionOpen,

    #[error("Box not found: {0}")]
    BoxNotFound(BoxId),

    #[error("Box id already in use: {0}")]
    DuplicateBox(BoxId),

    #[error("Unknown field: {0}")]
    UnknownField(Address),

    #[error("Type mismatch at {address}: expected {expected}, got {got}")]
    TypeMismatch { address: Address, expected: ValueType, got: ValueType },

    #[error("Field {0} is not a primitive")]
    NotAPrimitive(Address),

    #[error("Field {0} is not a pointer")]
    NotAPointer(Address),

    #[error("Pointer {pointer} ({purpose:?}) may not target {target}")]
    IllegalTarget { pointer: Address, target: Address, purpose: PointerType },

    #[error("Dangling pointer {pointer} -> {target}")]
    DanglingPointer { pointer: Address, target: Address },

    #[error("Integrity violation: {0}")]
    IntegrityViolation(String),

    #[error("Routing cycle: {from} -> {to} closes a loop")]
    CycleDetected { from: BoxId, to: BoxId },

    #[error("Unknown update kind: {0:#04x}")]
    UnknownUpdateKind(u8),

    #[error("Decode error: {0}")]
    DecodeError(String),

    #[error("Apply failed: {0}")]
    ApplyFailed(String),

    #[error("Peer disconnected")]
    Disconnected,

    #[error("RPC error: {0}")]
    Rpc(String),

    #[error("Telemetry layout mismatch: {0}")]
    TelemetryLayout(String),

    #[error("Config error: {0}")]
    Config(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
