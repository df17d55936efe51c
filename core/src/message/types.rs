//! The message type the relay and bundler move around.

use crate::address::Addr;
use crate::relay::header::{RelayHeader, TopoHeader};
use serde::{Deserialize, Serialize};

/// Message flag bitfield.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct MsgFlags(u16);

impl MsgFlags {
    /// Out-of-band ordering class: may be delivered concurrently with and
    /// ahead of regular messages.
    pub const OOB: u16 = 1;
    /// Never dispatch this message back to the local delivery path.
    pub const DONT_LOOPBACK: u16 = 1 << 1;
    /// A site master must not relay this multicast to its bridges.
    pub const NO_RELAY: u16 = 1 << 2;

    pub fn new(flags: u16) -> Self {
        MsgFlags(flags)
    }

    pub fn contains(&self, flag: u16) -> bool {
        (self.0 & flag) != 0
    }

    pub fn set(&mut self, flag: u16) {
        self.0 |= flag;
    }

    pub fn clear(&mut self, flag: u16) {
        self.0 &= !flag;
    }

    pub fn as_u16(&self) -> u16 {
        self.0
    }
}

/// Header slots of a message: at most one relay header and one topology
/// header.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Headers {
    relay: Option<RelayHeader>,
    topo: Option<TopoHeader>,
}

/// An opaque payload plus destination, source, flags and protocol headers.
///
/// `dest == None` means multicast to the whole cluster. `src` is stamped by
/// the transport if the sender leaves it empty.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub dest: Option<Addr>,
    pub src: Option<Addr>,
    flags: MsgFlags,
    headers: Headers,
    pub payload: Vec<u8>,
}

impl Message {
    /// A unicast message to `dest` with an empty payload.
    pub fn to(dest: impl Into<Addr>) -> Self {
        Message {
            dest: Some(dest.into()),
            src: None,
            flags: MsgFlags::default(),
            headers: Headers::default(),
            payload: Vec::new(),
        }
    }

    /// A multicast message with an empty payload.
    pub fn multicast() -> Self {
        Message {
            dest: None,
            src: None,
            flags: MsgFlags::default(),
            headers: Headers::default(),
            payload: Vec::new(),
        }
    }

    pub fn with_payload(mut self, payload: Vec<u8>) -> Self {
        self.payload = payload;
        self
    }

    pub fn with_src(mut self, src: impl Into<Addr>) -> Self {
        self.src = Some(src.into());
        self
    }

    pub fn with_flag(mut self, flag: u16) -> Self {
        self.flags.set(flag);
        self
    }

    pub fn set_flag(&mut self, flag: u16) {
        self.flags.set(flag);
    }

    pub fn is_flag_set(&self, flag: u16) -> bool {
        self.flags.contains(flag)
    }

    pub fn flags(&self) -> MsgFlags {
        self.flags
    }

    pub fn put_relay_header(&mut self, hdr: RelayHeader) {
        self.headers.relay = Some(hdr);
    }

    pub fn put_topo_header(&mut self, hdr: TopoHeader) {
        self.headers.topo = Some(hdr);
    }

    pub fn relay_header(&self) -> Option<&RelayHeader> {
        self.headers.relay.as_ref()
    }

    pub fn topo_header(&self) -> Option<&TopoHeader> {
        self.headers.topo.as_ref()
    }

    /// Payload length in bytes. The wire size additionally includes the
    /// transport's fixed per-message overhead.
    pub fn len(&self) -> usize {
        self.payload.len()
    }

    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }

    /// A copy without the relay header, used when re-wrapping a message
    /// for the next hop. Headers above the relay layer (topology) are
    /// kept so they survive bridge crossings.
    pub fn stripped_copy(&self) -> Message {
        Message {
            dest: self.dest.clone(),
            src: self.src.clone(),
            flags: self.flags,
            headers: Headers { relay: None, topo: self.headers.topo },
            payload: self.payload.clone(),
        }
    }

    /// One-line header summary for failure logs.
    pub fn print_headers(&self) -> String {
        let mut parts = Vec::new();
        if let Some(h) = &self.headers.relay {
            parts.push(format!("relay: {h}"));
        }
        if let Some(h) = &self.headers.topo {
            parts.push(format!("topo: {:?}", h.ty));
        }
        if parts.is_empty() {
            "(none)".to_string()
        } else {
            parts.join(", ")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::{NodeId, SiteAddr};
    use crate::relay::header::RelayHeaderType;

    #[test]
    fn test_flags() {
        let mut flags = MsgFlags::default();
        assert!(!flags.contains(MsgFlags::OOB));
        flags.set(MsgFlags::OOB);
        flags.set(MsgFlags::NO_RELAY);
        assert!(flags.contains(MsgFlags::OOB));
        assert!(flags.contains(MsgFlags::NO_RELAY));
        assert!(!flags.contains(MsgFlags::DONT_LOOPBACK));
        flags.clear(MsgFlags::OOB);
        assert!(!flags.contains(MsgFlags::OOB));
    }

    #[test]
    fn test_builders() {
        let node = NodeId::random();
        let msg = Message::to(node)
            .with_payload(b"hi".to_vec())
            .with_flag(MsgFlags::OOB);
        assert_eq!(msg.dest, Some(Addr::Node(node)));
        assert!(msg.is_flag_set(MsgFlags::OOB));
        assert_eq!(msg.len(), 2);

        let mc = Message::multicast();
        assert!(mc.dest.is_none());
        assert!(mc.is_empty());
    }

    #[test]
    fn test_headers() {
        let mut msg = Message::multicast();
        assert!(msg.relay_header().is_none());
        msg.put_relay_header(RelayHeader::data(Some(SiteAddr::master("SFO")), None));
        let hdr = msg.relay_header().unwrap();
        assert_eq!(hdr.ty, RelayHeaderType::Data);
        assert!(msg.topo_header().is_none());
    }

    #[test]
    fn test_stripped_copy_drops_relay_header_keeps_rest() {
        let mut msg = Message::multicast()
            .with_payload(vec![1, 2, 3])
            .with_flag(MsgFlags::OOB);
        msg.put_relay_header(RelayHeader::data(None, None));
        msg.put_topo_header(TopoHeader::req());

        let copy = msg.stripped_copy();
        assert!(copy.relay_header().is_none());
        assert!(copy.topo_header().is_some());
        assert!(copy.is_flag_set(MsgFlags::OOB));
        assert_eq!(copy.payload, vec![1, 2, 3]);
    }

    #[test]
    fn test_serialization_round_trip() {
        let node = NodeId::random();
        let mut msg = Message::to(SiteAddr::member(node, "SFO"))
            .with_src(node)
            .with_payload(b"payload".to_vec())
            .with_flag(MsgFlags::DONT_LOOPBACK);
        msg.put_relay_header(RelayHeader::data(
            Some(SiteAddr::member(node, "SFO")),
            Some(SiteAddr::member(node, "LON")),
        ));

        let bytes = bincode::serialize(&msg).unwrap();
        let restored: Message = bincode::deserialize(&bytes).unwrap();
        assert_eq!(msg, restored);
    }
}
