//! SSH primitives used by the edge controller's agent install orchestrator.
//!
//! The orchestrator drives a scripted sequence of remote commands and file
//! uploads against the asset being provisioned. Everything here wraps the
//! system `ssh` binary; no network code of its own.

pub mod ssh;

pub use ssh::{SshAuth, SshTarget};
