//! Foundation utilities for the coffer storage engine.
//!
//! Writers of on-disk state (the index, refs) go through [`LockFile`] so a
//! partially written file is never observed under the real path and
//! concurrent writers are serialized across processes.

pub mod lockfile;

pub use lockfile::{LockError, LockFile};
