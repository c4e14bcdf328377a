//! Projector SDK and the concrete lenses.
//!
//! The SDK ([`sdk`]) owns everything every projector shares: payload-hash
//! verification, idempotent apply with watermark CAS, canonical snapshot
//! hashing, and the rebuild/restore/snapshot admin operations. The lenses
//! ([`lenses`]) and the EMO translator ([`translator`]) plug in behind the
//! [`sdk::Lens`] seam. [`receiver`] is the HTTP runtime the CDC publisher
//! delivers into.

pub mod config;
pub mod embedding;
pub mod lenses;
pub mod receiver;
pub mod sdk;
pub mod translator;

pub use sdk::{ApplyOutcome, Lens, LensError, ProjectorCore, ProjectorError};
