// Transport module: contracts for the group-membership layer below the
// relay, plus an in-process implementation for tests and demos

pub mod abstraction;
pub mod local;

pub use abstraction::{
    BatchMode, Channel, Connector, MessageBatch, Receiver, Transport, TransportError, MSG_OVERHEAD,
};
pub use local::{LocalChannel, LocalNetwork};
