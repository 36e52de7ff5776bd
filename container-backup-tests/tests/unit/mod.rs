//! Unit tests for container-backup
//!
//! These tests exercise the library's building blocks through its public API.

mod config;
mod credentials;
mod discovery;
mod retention;
