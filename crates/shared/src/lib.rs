//! DeskRelay Shared Types and Utilities
//!
//! This crate contains the types, errors, and storage collaborator shared
//! across the DeskRelay conversation engine.

pub mod storage;
pub mod types;

pub use storage::*;
pub use types::*;
