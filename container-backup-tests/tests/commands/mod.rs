//! Command tests for container-backup
//!
//! These tests drive the operations behind each CLI command against the
//! mock container runtime.

mod backup;
mod retention;
mod status;
