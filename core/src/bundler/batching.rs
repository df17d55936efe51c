//! Concrete bundlers: byte-budgeted batching and a pass-through variant.

use super::base::{BundlerCore, BundlerOptions};
use super::Bundler;
use crate::message::{Message, MsgFlags};
use crate::transport::Transport;
use std::sync::Arc;

/// Accumulates messages per destination and flushes when the byte budget
/// or the element capacity would be exceeded, and on explicit `flush`.
pub struct BatchingBundler {
    core: BundlerCore,
}

impl BatchingBundler {
    pub fn new(transport: Arc<dyn Transport>, opts: BundlerOptions) -> Self {
        BatchingBundler { core: BundlerCore::new(transport, opts) }
    }

    pub fn core(&self) -> &BundlerCore {
        &self.core
    }
}

impl Bundler for BatchingBundler {
    fn send(&self, msg: Message) {
        let size = self.core.accounted_size(&msg);
        let mut state = self.core.lock_state();
        let queued: usize = state.msgs.values().map(Vec::len).sum();
        if state.count + size >= self.core.max_size() || queued >= self.core.capacity() {
            self.core.send_bundled_messages(&mut state);
        }
        self.core.add_message(&mut state, msg, size);
        // A single message above the budget goes out immediately.
        if state.count >= self.core.max_size() {
            self.core.send_bundled_messages(&mut state);
        }
    }

    fn flush(&self) {
        let mut state = self.core.lock_state();
        self.core.send_bundled_messages(&mut state);
    }

    fn size(&self) -> usize {
        self.core.size()
    }

    fn stop(&self) {
        self.flush();
    }
}

/// No accumulation: every message is serialized and sent on the caller's
/// thread, with the same loopback handling as the batching path.
pub struct DirectBundler {
    core: BundlerCore,
}

impl DirectBundler {
    pub fn new(transport: Arc<dyn Transport>, opts: BundlerOptions) -> Self {
        DirectBundler { core: BundlerCore::new(transport, opts) }
    }

    pub fn core(&self) -> &BundlerCore {
        &self.core
    }
}

impl Bundler for DirectBundler {
    fn send(&self, msg: Message) {
        let mut state = self.core.lock_state();
        state.output.clear();
        let mut output = std::mem::take(&mut state.output);
        self.core.send_single_message(&msg, &mut output);
        state.output = output;

        let local = self.core.transport_address();
        let loopback = msg.dest.as_ref().map_or(true, |d| *d == local);
        if self.core.process_loopbacks()
            && loopback
            && !msg.is_flag_set(MsgFlags::DONT_LOOPBACK)
            && self.core.loopback_separate_thread()
        {
            self.core.loopback(msg.dest.clone(), local, std::slice::from_ref(&msg));
        }
    }

    fn flush(&self) {}

    fn size(&self) -> usize {
        0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::{Addr, NodeId};
    use crate::bundler::testutil::MockTransport;
    use crate::message::codec::{decode_frame, Frame};

    fn opts(max_size: usize) -> BundlerOptions {
        BundlerOptions { max_size, ..BundlerOptions::default() }
    }

    #[test]
    fn test_coalesces_under_budget_and_flushes_once() {
        let t = Arc::new(MockTransport::new(Addr::Node(NodeId::random())));
        let bundler = BatchingBundler::new(t.clone(), opts(64000));
        let dest = NodeId::random();
        let src = NodeId::random();

        bundler.send(Message::to(dest).with_src(src).with_payload(vec![0; 30000]));
        bundler.send(Message::to(dest).with_src(src).with_payload(vec![1; 30000]));
        assert_eq!(bundler.size(), 2);
        assert!(t.sends.lock().is_empty());

        bundler.flush();
        assert_eq!(bundler.size(), 0);

        let sends = t.sends.lock();
        assert_eq!(sends.len(), 1);
        match decode_frame(&sends[0].1).unwrap() {
            Frame::Batch(list) => {
                assert_eq!(list.dest, Some(Addr::Node(dest)));
                assert_eq!(list.src, Some(Addr::Node(src)));
                assert_eq!(list.msgs.len(), 2);
                assert_eq!(list.msgs[0].payload[0], 0);
                assert_eq!(list.msgs[1].payload[0], 1);
            }
            Frame::Single(_) => panic!("expected a batch"),
        }
    }

    #[test]
    fn test_flushes_when_budget_would_overflow() {
        let t = Arc::new(MockTransport::new(Addr::Node(NodeId::random())));
        let bundler = BatchingBundler::new(t.clone(), opts(1000));
        let dest = NodeId::random();

        bundler.send(Message::to(dest).with_payload(vec![0; 600]));
        assert!(t.sends.lock().is_empty());
        // 600 + 600 + overheads > 1000: the first message goes out before
        // the second is queued.
        bundler.send(Message::to(dest).with_payload(vec![1; 600]));
        assert_eq!(t.sends.lock().len(), 1);
        assert_eq!(bundler.size(), 1);
    }

    #[test]
    fn test_oversized_message_sent_immediately() {
        let t = Arc::new(MockTransport::new(Addr::Node(NodeId::random())));
        let bundler = BatchingBundler::new(t.clone(), opts(1000));

        bundler.send(Message::to(NodeId::random()).with_payload(vec![0; 5000]));
        assert_eq!(bundler.size(), 0);
        assert_eq!(t.sends.lock().len(), 1);
    }

    #[test]
    fn test_capacity_bound_triggers_flush() {
        let t = Arc::new(MockTransport::new(Addr::Node(NodeId::random())));
        let bundler = BatchingBundler::new(
            t.clone(),
            BundlerOptions { max_size: 1 << 20, capacity: 3, ..BundlerOptions::default() },
        );
        let dest = NodeId::random();
        for i in 0..4u8 {
            bundler.send(Message::to(dest).with_payload(vec![i]));
        }
        assert_eq!(t.sends.lock().len(), 1);
        assert_eq!(bundler.size(), 1);
    }

    #[test]
    fn test_stop_drains_queue() {
        let t = Arc::new(MockTransport::new(Addr::Node(NodeId::random())));
        let bundler = BatchingBundler::new(t.clone(), opts(64000));
        bundler.send(Message::to(NodeId::random()).with_payload(vec![1]));
        bundler.stop();
        assert_eq!(bundler.size(), 0);
        assert_eq!(t.sends.lock().len(), 1);
    }

    #[test]
    fn test_direct_bundler_sends_inline() {
        let addr = Addr::Node(NodeId::random());
        let t = Arc::new(MockTransport::new(addr.clone()));
        let bundler = DirectBundler::new(t.clone(), BundlerOptions::default());

        bundler.send(Message::to(NodeId::random()).with_payload(vec![9]));
        assert_eq!(t.sends.lock().len(), 1);
        assert_eq!(bundler.size(), 0);
        assert!(t.loopbacks.lock().is_empty());
    }

    #[test]
    fn test_direct_bundler_loops_back_own_address() {
        let node = NodeId::random();
        let addr = Addr::Node(node);
        let t = Arc::new(MockTransport::new(addr.clone()));
        let bundler = DirectBundler::new(t.clone(), BundlerOptions::default());

        bundler.send(Message::to(node).with_payload(vec![9]));
        assert_eq!(t.loopbacks.lock().len(), 1);

        bundler.send(Message::to(node).with_flag(MsgFlags::DONT_LOOPBACK));
        assert_eq!(t.loopbacks.lock().len(), 1);
    }

    #[test]
    fn test_dont_loopback_messages_never_loop_back() {
        let addr = Addr::Node(NodeId::random());
        let t = Arc::new(MockTransport::new(addr.clone()));
        let bundler = BatchingBundler::new(t.clone(), BundlerOptions::default());

        bundler.send(Message::multicast().with_payload(vec![1]).with_flag(MsgFlags::DONT_LOOPBACK));
        bundler.flush();
        assert!(t.loopbacks.lock().is_empty());
    }
}
