//! Error types for the Quill protocol.
use thiserror::Error;

use crate::types::Hash256;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BodyError {
    #[error("body decode failed: {0}")] Decode(String),
    #[error("body encode failed: {0}")] Encode(String),
    #[error("oversized body: {size} > {max}")] Oversized { size: usize, max: usize },
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MempoolError {
    #[error("transaction already in pool: {0}")] AlreadyExists(String),
    #[error("fee overflow")] FeeOverflow,
    #[error("internal: {0}")] Internal(String),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("state not found: row {0}")] StateNotFound(u64),
    #[error("duplicate state: {0}")] DuplicateState(String),
    #[error("no open transaction")] NoTransaction,
    #[error("transaction already open")] NestedTransaction,
    #[error("cursor out of sync: expected height {expected}, got {got}")]
    CursorMismatch { expected: u64, got: u64 },
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProcessorError {
    /// An invariant of already-validated persisted state does not hold.
    /// Callers treat this as process-terminating.
    #[error("node data corrupted: {0}")] Corrupted(&'static str),
    #[error("incompatible data configuration: stored {stored}, compiled {compiled}")]
    ConfigMismatch { stored: Hash256, compiled: Hash256 },
    #[error(transparent)] Store(#[from] StoreError),
    #[error(transparent)] Body(#[from] BodyError),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ChainError {
    #[error(transparent)] Body(#[from] BodyError),
    #[error(transparent)] Mempool(#[from] MempoolError),
    #[error(transparent)] Store(#[from] StoreError),
    #[error(transparent)] Processor(#[from] ProcessorError),
}
