//! Transfer queue and bucket clone engine for S3-compatible storage.
//!
//! The engine moves files between local disk and buckets through a bounded,
//! persistent queue, and replicates a bucket prefix onto another bucket
//! prefix, on the same or a different target, with pause, resume and
//! crash recovery. State lives in a [`db::Store`]; the UI drives everything
//! through [`Engine`] and listens on [`events::EventSubscription`].

pub mod clone;
pub mod commands;
pub mod config;
pub mod db;
pub mod error;
pub mod events;
pub mod model;
mod multipart;
pub mod progress;
pub mod storage;
pub mod transfer;

#[cfg(feature = "desktop")]
pub mod desktop;

#[cfg(test)]
mod testing;

pub use clone::CloneEngine;
pub use commands::Engine;
pub use config::EngineConfig;
pub use error::{EngineError, EngineResult};
pub use events::{EngineEvent, EventSubscription};
pub use transfer::TransferQueue;
