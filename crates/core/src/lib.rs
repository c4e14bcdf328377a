//! Core types shared across the MNX spine.
//!
//! Identifiers, tenancy scope, canonical JSON hashing, and the domain error
//! model. Infrastructure (storage, HTTP) lives in the other crates.

pub mod canonical;
pub mod error;
pub mod id;
pub mod scope;

pub use canonical::{canonical_json, payload_hash, sha256_hex};
pub use error::{DomainError, DomainResult};
pub use id::WorldId;
pub use scope::Scope;
