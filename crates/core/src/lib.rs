//! `jobweave-core`: value-level building blocks shared by the job engine.
//!
//! This crate contains identifiers and payload types only (no storage, no threads).

pub mod error;
pub mod id;
pub mod payload;

pub use error::{CoreError, CoreResult};
pub use id::{AccountId, ExecutionContextId, JobId};
pub use payload::ResultPayload;
