//! Hooks the processor calls out through.
//!
//! The node layer (networking, miner scheduling, peer management) observes
//! the chain core through this trait. Every method has a no-op default so
//! tests and embedded uses can pass [`NullEvents`].

use quill_core::types::HeaderId;

use crate::store::PeerId;

/// Observer interface for processor side effects.
///
/// Methods take `&self`; implementations that need mutable state use
/// interior mutability.
pub trait ProcessorEvents {
    /// A peer delivered data that failed validation in context.
    fn on_peer_insane(&self, _peer: PeerId) {}

    /// The cursor moved to a new best state.
    fn on_new_state(&self) {}

    /// A state was unapplied during a reorg.
    fn on_rolled_back(&self) {}

    /// A header arrived (regardless of acceptance).
    fn on_state_data(&self) {}

    /// A block body arrived (regardless of acceptance).
    fn on_block_data(&self) {}

    /// Last-chance veto for a standalone-valid header.
    fn approve_state(&self, _id: HeaderId) -> bool {
        true
    }

    /// The processor wants a header (or its body) it does not have.
    fn request_data(&self, _id: HeaderId, _wants_body: bool, _peer: Option<PeerId>) {}
}

/// Ignores everything.
#[derive(Clone, Copy, Debug, Default)]
pub struct NullEvents;

impl ProcessorEvents for NullEvents {}
