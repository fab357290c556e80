//! The shared wire protocol spoken between clients, brokers and bridges.

mod frame;
mod message;
mod pattern;
mod wire;

pub use frame::{
    decode_datagram, encode_frame, FrameReader, FrameWriter,
    DEFAULT_MAX_FRAME,
};
pub use message::Message;
pub use pattern::matches;
pub use wire::{
    encode_reply, CloudStatus, ConnectReply, ConnectRequest, Frame,
    GetRequest, LockRequest, RequestCode, WireReader, WireWriter,
    PROTOCOL_VERSION,
};
