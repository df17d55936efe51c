//! Shared bundler state and send primitives.
//!
//! All queue state is guarded by one mutex, held for the whole of an
//! accumulate or flush operation. The serialization buffer is shared and
//! reset before each send while the lock is held.

use crate::address::Addr;
use crate::message::codec::{encode_message, encode_message_list};
use crate::message::{Message, MsgFlags};
use crate::stats::MinMaxAvg;
use crate::transport::{BatchMode, MessageBatch, Transport};
use parking_lot::{Mutex, MutexGuard};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tracing::trace;

/// Bundler tuning knobs.
#[derive(Debug, Clone)]
pub struct BundlerOptions {
    /// Byte budget: messages are queued until this many bytes accumulate.
    pub max_size: usize,
    /// Upper bound on queued elements for size-limited bundlers.
    pub capacity: usize,
    /// Whether locally destined messages are looped back by the bundler.
    pub process_loopbacks: bool,
}

impl Default for BundlerOptions {
    fn default() -> Self {
        BundlerOptions { max_size: 64000, capacity: 16384, process_loopbacks: true }
    }
}

pub(crate) struct BundlerState {
    /// Destination to queued messages, FIFO per destination.
    pub(crate) msgs: HashMap<Option<Addr>, Vec<Message>>,
    /// Accumulated byte total of queued messages.
    pub(crate) count: usize,
    /// Shared serialization buffer, reset before each send.
    pub(crate) output: Vec<u8>,
}

/// The accumulate/send/loopback primitives concrete bundlers build on.
pub struct BundlerCore {
    transport: Arc<dyn Transport>,
    opts: BundlerOptions,
    state: Mutex<BundlerState>,
    avg_send_time: MinMaxAvg,
}

impl BundlerCore {
    pub fn new(transport: Arc<dyn Transport>, opts: BundlerOptions) -> Self {
        let output = Vec::with_capacity(opts.max_size + transport.msg_overhead());
        BundlerCore {
            transport,
            opts,
            state: Mutex::new(BundlerState { msgs: HashMap::with_capacity(24), count: 0, output }),
            avg_send_time: MinMaxAvg::new(),
        }
    }

    pub fn max_size(&self) -> usize {
        self.opts.max_size
    }

    pub fn capacity(&self) -> usize {
        self.opts.capacity
    }

    pub fn process_loopbacks(&self) -> bool {
        self.opts.process_loopbacks
    }

    /// Byte cost of a message against the budget: payload plus the
    /// transport's fixed per-message overhead.
    pub fn accounted_size(&self, msg: &Message) -> usize {
        msg.len() + self.transport.msg_overhead()
    }

    pub(crate) fn transport_address(&self) -> Addr {
        self.transport.address()
    }

    pub(crate) fn loopback_separate_thread(&self) -> bool {
        self.transport.loopback_separate_thread()
    }

    /// Wall-clock nanoseconds per flush, recorded when stats are enabled.
    pub fn avg_send_time(&self) -> &MinMaxAvg {
        &self.avg_send_time
    }

    pub fn reset_stats(&self) {
        self.avg_send_time.clear();
    }

    /// Total number of queued messages.
    pub fn size(&self) -> usize {
        let state = self.state.lock();
        state.msgs.values().map(Vec::len).sum()
    }

    pub(crate) fn lock_state(&self) -> MutexGuard<'_, BundlerState> {
        self.state.lock()
    }

    /// Appends `msg` to its destination queue. Caller holds the state lock.
    pub(crate) fn add_message(&self, state: &mut BundlerState, msg: Message, size: usize) {
        state.msgs.entry(msg.dest.clone()).or_insert_with(|| Vec::with_capacity(16)).push(msg);
        state.count += size;
    }

    /// Sends every queued message, bundling per destination. Caller holds
    /// the state lock.
    pub(crate) fn send_bundled_messages(&self, state: &mut BundlerState) {
        let stats_enabled = self.transport.stats_enabled();
        let start = stats_enabled.then(Instant::now);
        let local_addr = self.transport.address();
        let BundlerState { msgs, count, output } = state;

        for (dst, list) in msgs.iter_mut() {
            if list.is_empty() {
                continue;
            }
            let loopback = dst.as_ref().map_or(true, |d| *d == local_addr);
            output.clear();

            if list.len() == 1 {
                let msg = &list[0];
                self.send_single_message(msg, output);
                if self.opts.process_loopbacks
                    && loopback
                    && !msg.is_flag_set(MsgFlags::DONT_LOOPBACK)
                    && self.transport.loopback_separate_thread()
                {
                    self.loopback(dst.clone(), local_addr.clone(), std::slice::from_ref(msg));
                }
            } else {
                self.send_message_list(dst.as_ref(), list[0].src.clone(), list, output);
                if self.opts.process_loopbacks
                    && loopback
                    && self.transport.loopback_separate_thread()
                {
                    self.loopback(dst.clone(), local_addr.clone(), list);
                }
            }
            list.clear();
        }
        *count = 0;
        if let Some(start) = start {
            self.avg_send_time.add(start.elapsed().as_nanos() as u64);
        }
    }

    /// Serializes and sends one message. Failures are logged at trace and
    /// swallowed; the message is considered consumed either way.
    pub(crate) fn send_single_message(&self, msg: &Message, output: &mut Vec<u8>) {
        let dest = msg.dest.as_ref();
        let result = encode_message(msg, output)
            .map_err(|e| e.to_string())
            .and_then(|_| self.transport.do_send(output, dest).map_err(|e| e.to_string()));
        if let Err(e) = result {
            trace!(
                sender = %local_or_cluster(Some(&self.transport.address())),
                dest = %local_or_cluster(dest),
                size = msg.len(),
                error = %e,
                headers = %msg.print_headers(),
                "failed sending message"
            );
        }
    }

    /// Serializes and sends a batch. Failures are logged at trace and
    /// swallowed.
    pub(crate) fn send_message_list(
        &self,
        dest: Option<&Addr>,
        src: Option<Addr>,
        list: &[Message],
        output: &mut Vec<u8>,
    ) {
        let cluster = self.transport.cluster_name();
        let result = encode_message_list(dest, src.as_ref(), &cluster, list, output)
            .map_err(|e| e.to_string())
            .and_then(|_| self.transport.do_send(output, dest).map_err(|e| e.to_string()));
        if let Err(e) = result {
            trace!(
                sender = %local_or_cluster(Some(&self.transport.address())),
                dest = %local_or_cluster(dest),
                batch = list.len(),
                error = %e,
                "failed sending message bundle"
            );
        }
    }

    /// Dispatches locally destined messages to the transport's processing
    /// policy, partitioned by ordering class so OOB messages never queue
    /// behind regular ones. Messages flagged DONT_LOOPBACK are skipped.
    pub(crate) fn loopback(&self, dest: Option<Addr>, sender: Addr, list: &[Message]) {
        let cluster = self.transport.cluster_name();
        let mut oob =
            MessageBatch::new(dest.clone(), Some(sender.clone()), cluster.clone(), BatchMode::Oob, list.len());
        let mut reg = MessageBatch::new(dest, Some(sender), cluster, BatchMode::Reg, list.len());
        for msg in list {
            if msg.is_flag_set(MsgFlags::DONT_LOOPBACK) {
                continue;
            }
            if msg.is_flag_set(MsgFlags::OOB) {
                oob.add(msg.clone());
            } else {
                reg.add(msg.clone());
            }
        }
        if !reg.is_empty() {
            self.transport.loopback(reg);
        }
        if !oob.is_empty() {
            self.transport.loopback(oob);
        }
    }
}

fn local_or_cluster(addr: Option<&Addr>) -> String {
    match addr {
        Some(a) => a.to_string(),
        None => "cluster".to_string(),
    }
}
