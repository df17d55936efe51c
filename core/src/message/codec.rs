//! Wire codec for single messages and bundled message lists.
//!
//! Frame layout: one version byte, one kind byte (single or batch), then
//! the bincode body. Oversized frames are rejected on both sides.

use super::types::Message;
use crate::address::Addr;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Wire format version.
pub const WIRE_VERSION: u8 = 1;

/// Maximum accepted frame size: 256 KB. Bundles are byte-budgeted well
/// below this; anything larger is malformed or hostile.
pub const MAX_FRAME_SIZE: usize = 256 * 1024;

const KIND_SINGLE: u8 = 0;
const KIND_BATCH: u8 = 1;

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("encode failed: {0}")]
    Encode(String),
    #[error("decode failed: {0}")]
    Decode(String),
    #[error("frame truncated ({0} bytes)")]
    Truncated(usize),
    #[error("frame too large: {0} bytes (max {MAX_FRAME_SIZE})")]
    TooLarge(usize),
    #[error("unsupported wire version {0}")]
    UnsupportedVersion(u8),
    #[error("unknown frame kind {0}")]
    UnknownKind(u8),
}

/// A batch of messages bundled for one destination.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageList {
    pub dest: Option<Addr>,
    pub src: Option<Addr>,
    pub cluster: String,
    pub multicast: bool,
    pub msgs: Vec<Message>,
}

/// A decoded wire frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Single(Message),
    Batch(MessageList),
}

/// Appends a single-message frame to `out`.
pub fn encode_message(msg: &Message, out: &mut Vec<u8>) -> Result<(), CodecError> {
    out.push(WIRE_VERSION);
    out.push(KIND_SINGLE);
    bincode::serialize_into(&mut *out, msg).map_err(|e| CodecError::Encode(e.to_string()))?;
    if out.len() > MAX_FRAME_SIZE {
        return Err(CodecError::TooLarge(out.len()));
    }
    Ok(())
}

/// Appends a batch frame for `msgs` addressed to `dest` to `out`.
pub fn encode_message_list(
    dest: Option<&Addr>,
    src: Option<&Addr>,
    cluster: &str,
    msgs: &[Message],
    out: &mut Vec<u8>,
) -> Result<(), CodecError> {
    let list = MessageList {
        dest: dest.cloned(),
        src: src.cloned(),
        cluster: cluster.to_string(),
        multicast: dest.is_none(),
        msgs: msgs.to_vec(),
    };
    out.push(WIRE_VERSION);
    out.push(KIND_BATCH);
    bincode::serialize_into(&mut *out, &list).map_err(|e| CodecError::Encode(e.to_string()))?;
    if out.len() > MAX_FRAME_SIZE {
        return Err(CodecError::TooLarge(out.len()));
    }
    Ok(())
}

/// Decodes one wire frame.
pub fn decode_frame(buf: &[u8]) -> Result<Frame, CodecError> {
    if buf.len() > MAX_FRAME_SIZE {
        return Err(CodecError::TooLarge(buf.len()));
    }
    if buf.len() < 2 {
        return Err(CodecError::Truncated(buf.len()));
    }
    if buf[0] != WIRE_VERSION {
        return Err(CodecError::UnsupportedVersion(buf[0]));
    }
    let body = &buf[2..];
    match buf[1] {
        KIND_SINGLE => {
            let msg = bincode::deserialize(body).map_err(|e| CodecError::Decode(e.to_string()))?;
            Ok(Frame::Single(msg))
        }
        KIND_BATCH => {
            let list = bincode::deserialize(body).map_err(|e| CodecError::Decode(e.to_string()))?;
            Ok(Frame::Batch(list))
        }
        kind => Err(CodecError::UnknownKind(kind)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::{NodeId, SiteAddr};
    use crate::message::MsgFlags;

    #[test]
    fn test_single_round_trip() {
        let node = NodeId::random();
        let msg = Message::to(SiteAddr::member(node, "SFO"))
            .with_src(node)
            .with_payload(b"hello".to_vec())
            .with_flag(MsgFlags::OOB);

        let mut out = Vec::new();
        encode_message(&msg, &mut out).unwrap();
        match decode_frame(&out).unwrap() {
            Frame::Single(restored) => assert_eq!(restored, msg),
            other => panic!("expected single frame, got {other:?}"),
        }
    }

    #[test]
    fn test_batch_round_trip_preserves_order() {
        let node = NodeId::random();
        let dest = Addr::Node(node);
        let msgs = vec![
            Message::to(node).with_payload(vec![1]),
            Message::to(node).with_payload(vec![2]),
            Message::to(node).with_payload(vec![3]),
        ];

        let mut out = Vec::new();
        encode_message_list(Some(&dest), Some(&dest), "bridge-1", &msgs, &mut out).unwrap();
        match decode_frame(&out).unwrap() {
            Frame::Batch(list) => {
                assert_eq!(list.dest, Some(dest));
                assert_eq!(list.cluster, "bridge-1");
                assert!(!list.multicast);
                let payloads: Vec<_> = list.msgs.iter().map(|m| m.payload.clone()).collect();
                assert_eq!(payloads, vec![vec![1], vec![2], vec![3]]);
            }
            other => panic!("expected batch frame, got {other:?}"),
        }
    }

    #[test]
    fn test_multicast_batch() {
        let msgs = vec![Message::multicast().with_payload(vec![7])];
        let mut out = Vec::new();
        encode_message_list(None, None, "c", &msgs, &mut out).unwrap();
        match decode_frame(&out).unwrap() {
            Frame::Batch(list) => assert!(list.multicast),
            other => panic!("expected batch frame, got {other:?}"),
        }
    }

    #[test]
    fn test_truncated_frame() {
        assert!(matches!(decode_frame(&[]), Err(CodecError::Truncated(0))));
        assert!(matches!(decode_frame(&[WIRE_VERSION]), Err(CodecError::Truncated(1))));
    }

    #[test]
    fn test_bad_version_and_kind() {
        assert!(matches!(decode_frame(&[99, 0, 0]), Err(CodecError::UnsupportedVersion(99))));
        assert!(matches!(decode_frame(&[WIRE_VERSION, 7, 0]), Err(CodecError::UnknownKind(7))));
    }

    #[test]
    fn test_garbage_body_rejected() {
        let buf = [WIRE_VERSION, 0, 0xff, 0xff, 0xff];
        assert!(matches!(decode_frame(&buf), Err(CodecError::Decode(_))));
    }
}
