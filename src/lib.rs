//! Local-first cache and sync engine for the legal document portal.
//!
//! The portal keeps working while disconnected: reads come from a tiered
//! cache, mutations wait in a durable queue, and a bulk export can pull the
//! whole remote dataset for fully offline use.

pub mod cache;
pub mod clock;
pub mod config;
pub mod connectivity;
pub mod engine;
pub mod error;
pub mod remote;
pub mod snapshot;
pub mod stats;
pub mod sync;

pub use engine::{EngineParts, OfflineEngine};
