//! Bucket-to-bucket clone jobs
//!
//! A job lists its source scope page by page into persisted items, then
//! copies the items through a slot pool shared by every job. Each live job
//! has one driver task; pause and cancel reach it through a control block.

mod engine;
mod enumerate;
mod scope;
mod state;
mod worker;

pub use engine::CloneEngine;
