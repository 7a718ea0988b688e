//! Engine configuration.
//!
//! Loaded from JSON; every section and field is optional and falls back to
//! its default.

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Top-level configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub editing: EditingConfig,
    pub sync: SyncConfig,
    pub transport: TransportConfig,
    pub rpc: RpcConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EditingConfig {
    /// Maximum number of undo steps kept.
    pub undo_limit: usize,
}

impl Default for EditingConfig {
    fn default() -> Self {
        Self { undo_limit: 256 }
    }
}

/// What a mirror does with updates that fail to apply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryPolicy {
    /// Drop on first failure.
    Never,
    /// One retry pass after the rest of the batch.
    Once,
    /// Retry passes while each pass applies at least one update.
    #[default]
    UntilStable,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Batches applied per `drain` call at most.
    pub max_batches_per_drain: usize,
    pub retry: RetryPolicy,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self { max_batches_per_drain: 64, retry: RetryPolicy::default() }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    pub sample_rate: u32,
    pub block_size: usize,
    /// Ticks per quarter note.
    pub ppqn: u32,
    pub max_active_notes: usize,
    pub max_requests_per_block: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            sample_rate: 48_000,
            block_size: 128,
            ppqn: 960,
            max_active_notes: 128,
            max_requests_per_block: 32,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RpcConfig {
    /// Outstanding queries allowed before `query` fails fast.
    pub max_pending: usize,
}

impl Default for RpcConfig {
    fn default() -> Self {
        Self { max_pending: 64 }
    }
}

impl EngineConfig {
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: EngineConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        Self::from_json_str(&content)
    }

    pub fn validate(&self) -> Result<()> {
        if self.transport.sample_rate == 0 {
            return Err(Error::Config("transport.sample_rate must be positive".into()));
        }
        if self.transport.block_size == 0 {
            return Err(Error::Config("transport.block_size must be positive".into()));
        }
        if self.transport.ppqn == 0 {
            return Err(Error::Config("transport.ppqn must be positive".into()));
        }
        if self.sync.max_batches_per_drain == 0 {
            return Err(Error::Config("sync.max_batches_per_drain must be positive".into()));
        }
        if self.rpc.max_pending == 0 {
            return Err(Error::Config("rpc.max_pending must be positive".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_json_keeps_defaults() {
        let config = EngineConfig::from_json_str(
            r#"{ "transport": { "sample_rate": 44100 }, "sync": { "retry": "once" } }"#,
        )
        .unwrap();
        assert_eq!(config.transport.sample_rate, 44_100);
        assert_eq!(config.transport.ppqn, 960);
        assert_eq!(config.sync.retry, RetryPolicy::Once);
        assert_eq!(config.editing, EditingConfig::default());
    }

    #[test]
    fn test_validation_and_parse_errors() {
        let err = EngineConfig::from_json_str(r#"{ "transport": { "block_size": 0 } }"#).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
        let err = EngineConfig::from_json_str("{ not json").unwrap_err();
        assert!(matches!(err, Error::Json(_)));
        let err = EngineConfig::from_path("/nonexistent/boxgraph.json").unwrap_err();
        assert!(matches!(err, Error::Io(_)));
    }

    #[test]
    fn test_default_roundtrips_through_json() {
        let json = serde_json::to_string(&EngineConfig::default()).unwrap();
        assert_eq!(EngineConfig::from_json_str(&json).unwrap(), EngineConfig::default());
    }
}
