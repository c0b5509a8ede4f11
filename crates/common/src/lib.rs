//! Shared wire types for the edge-controller workspace.
//!
//! Keep cross-crate DTOs here so the controller, the installer and the tests
//! agree on one wire format.

#![warn(missing_docs)]

/// Shared API DTOs for cross-crate use.
pub mod api;
