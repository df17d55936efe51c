// Message module: the relayed message model and its wire codec

pub mod codec;
pub mod types;

pub use codec::{decode_frame, encode_message, encode_message_list, CodecError, Frame, MessageList};
pub use types::{Message, MsgFlags};
