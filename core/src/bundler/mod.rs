// Bundler module: per-destination accumulation of outbound messages under
// a byte budget, batch serialization, and loopback dispatch

pub mod base;
pub mod batching;

pub use base::{BundlerCore, BundlerOptions};
pub use batching::{BatchingBundler, DirectBundler};

use crate::message::Message;

/// The transport's outbound accumulator. Implementations share the
/// accumulate/send/loopback primitives of [`BundlerCore`] and differ in
/// when they flush.
pub trait Bundler: Send + Sync {
    /// Queues or sends one message. Send failures are logged and the
    /// message is considered consumed.
    fn send(&self, msg: Message);

    /// Sends everything queued, bundling per destination.
    fn flush(&self);

    /// Number of unsent messages currently queued.
    fn size(&self) -> usize;

    fn start(&self) {}

    fn stop(&self) {}
}
