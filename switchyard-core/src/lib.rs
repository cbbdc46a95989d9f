//! Switchyard router protocol.
//! No I/O: message types, wire encoding and URL routing shared by the router and its peers.

pub mod protocol;
pub mod url;
pub mod wire;

pub use protocol::{
    status, Message, MessageKind, StartStatus, DEFAULT_ROUTER_PORT, DEFAULT_SERVICE_PORT,
};
pub use url::{parse_url, Route, RouterUrl, UrlError};
pub use wire::{encode_message, FrameEncodeError, MAX_STRING_LEN};
