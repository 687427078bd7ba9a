//! Hash computation and object identity for the coffer storage engine.
//!
//! This crate provides the core `ObjectId` type, hash computation, and hex
//! encoding/decoding used throughout coffer.

mod error;
pub mod hex;
mod oid;
pub mod hasher;

pub use error::HashError;
pub use hasher::Hasher;
pub use oid::ObjectId;
