//! Upload/download queue with per-direction worker pools
//!
//! Items are drained from `queued` into `active` by a pump task per
//! direction. Every worker that finishes, and every command that frees or
//! adds work, wakes the pump of its direction again.

mod queue;
mod worker;

pub use queue::TransferQueue;
