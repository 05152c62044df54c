//! Shared helpers for the Quill end-to-end test suite.

pub mod helpers;
