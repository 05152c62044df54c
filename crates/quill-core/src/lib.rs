//! # quill-core
//! Foundation types and consensus rules for the Quill protocol.

pub mod body;
pub mod difficulty;
pub mod error;
pub mod kdf;
pub mod mempool;
pub mod merkle;
pub mod rules;
pub mod types;
