//! End-to-end scenarios
//!
//! Each scenario runs a full backup against the mock container runtime and
//! inspects the archives written to a temporary backup root.

mod bind_mounts;
mod cold_backup;
mod credentials_missing;
mod serialization;
mod stale_lock;
mod wordpress;
