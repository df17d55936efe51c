//! Transport abstraction layer for the relay stack.
//!
//! Two views of the layer below, both contract-only:
//! - [`Transport`] is what the bundler needs: raw byte sends, the loopback
//!   processing policy and the per-message overhead constant.
//! - [`Channel`]/[`Connector`]/[`Receiver`] is what the relay core needs:
//!   membership clusters that deliver messages and monotonic views.

use crate::address::{Addr, AddrFlags, View};
use crate::message::Message;
use std::sync::Arc;
use thiserror::Error;

/// Fixed per-message wire overhead estimate, added to the payload length
/// when accounting a message against the bundler's byte budget.
pub const MSG_OVERHEAD: usize = 28;

/// Errors from the transport layer.
#[derive(Debug, Clone, Error)]
pub enum TransportError {
    #[error("send failed: {0}")]
    SendFailed(String),
    #[error("not connected to cluster {0}")]
    NotConnected(String),
    #[error("no member {0} in cluster {1}")]
    NoSuchMember(String, String),
    #[error("channel closed")]
    Closed,
}

/// Ordering class of a loopback batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchMode {
    /// Regular messages; per-sender FIFO is preserved.
    Reg,
    /// Out-of-band messages; may overtake regular ones.
    Oob,
}

/// A batch of messages handed to the transport's processing policy.
#[derive(Debug, Clone)]
pub struct MessageBatch {
    pub dest: Option<Addr>,
    pub sender: Option<Addr>,
    pub cluster: String,
    pub multicast: bool,
    pub mode: BatchMode,
    pub msgs: Vec<Message>,
}

impl MessageBatch {
    pub fn new(
        dest: Option<Addr>,
        sender: Option<Addr>,
        cluster: String,
        mode: BatchMode,
        capacity: usize,
    ) -> Self {
        MessageBatch {
            multicast: dest.is_none(),
            dest,
            sender,
            cluster,
            mode,
            msgs: Vec::with_capacity(capacity),
        }
    }

    pub fn add(&mut self, msg: Message) {
        self.msgs.push(msg);
    }

    pub fn len(&self) -> usize {
        self.msgs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.msgs.is_empty()
    }
}

/// The bundler's view of the transport below it.
pub trait Transport: Send + Sync {
    /// The local address messages are stamped with.
    fn address(&self) -> Addr;

    fn cluster_name(&self) -> String;

    /// Sends a serialized frame. `None` means multicast to the cluster.
    fn do_send(&self, buf: &[u8], dest: Option<&Addr>) -> Result<(), TransportError>;

    /// Whether locally destined messages are dispatched on a separate
    /// thread, in which case the bundler performs the loopback itself.
    fn loopback_separate_thread(&self) -> bool {
        true
    }

    /// Hands a batch to the message processing policy for local delivery.
    fn loopback(&self, batch: MessageBatch);

    fn msg_overhead(&self) -> usize {
        MSG_OVERHEAD
    }

    fn stats_enabled(&self) -> bool {
        false
    }
}

/// Callbacks a cluster member registers with its channel.
pub trait Receiver: Send + Sync {
    fn on_message(&self, msg: Message);

    fn on_view(&self, view: View);
}

/// One connection into a named cluster: the relay core's handle for the
/// local cluster and for each bridge.
pub trait Channel: Send + Sync {
    fn local_addr(&self) -> Addr;

    fn cluster(&self) -> String;

    /// Sends within the cluster; `msg.dest == None` multicasts.
    fn send(&self, msg: Message) -> Result<(), TransportError>;

    /// Current membership view of the cluster.
    fn view(&self) -> View;

    fn close(&self);
}

/// Opens channels into named clusters.
pub trait Connector: Send + Sync {
    /// Joins `cluster` as `local`, delivering messages and views to
    /// `receiver`. `flags` tags the member for election when address
    /// tagging is enabled; `None` joins untagged.
    fn connect(
        &self,
        cluster: &str,
        local: Addr,
        flags: Option<AddrFlags>,
        receiver: Arc<dyn Receiver>,
    ) -> Result<Arc<dyn Channel>, TransportError>;
}
