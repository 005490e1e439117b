//! ## Minibus wire protocol
//!
//! Every logical message on the stream transport is a 4-byte big-endian
//! length followed by a zlib-compressed payload whose first decompressed
//! byte is an opcode. The peer datagram transport reuses the outer length
//! prefix but leaves the payload uncompressed, so several records may be
//! coalesced in one receive buffer and split back apart.
//!
//! The codec is synchronous and buffer-based: transports read into a
//! [`bytes::BytesMut`] and call [`frame::split`] / [`datagram::split`] to
//! pop complete messages off the front.

pub mod datagram;
pub mod frame;
pub mod message;

use std::str::Utf8Error;

use num_enum::{IntoPrimitive, TryFromPrimitive};

/// POST_ACK status byte for a successful publication.
pub const STATUS_OK: u8 = 0x00;

#[derive(Debug)]
pub enum Error {
    /// The stream ended before a full frame arrived.
    Framing,
    /// The compressed block inside a frame is malformed.
    Decode,
    /// A message body is shorter than its layout requires, or a string
    /// does not fit its 1-byte length prefix.
    InvalidInput,
    UnknownOpcode(u8),
    UnknownErrorKind(u8),
    Utf8Error(Utf8Error),
}

impl std::error::Error for Error {}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

impl From<Utf8Error> for Error {
    fn from(value: Utf8Error) -> Self {
        Self::Utf8Error(value)
    }
}

/// Stream opcodes. The first decompressed byte of every frame.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive, IntoPrimitive)]
pub enum Opcode {
    /// Error reply; the next byte is an [`ErrorKind`], the remainder is
    /// kind-specific context.
    Error = 0x00,
    /// Publish to a field owned by the sender.
    Post = 0x01,
    PostAck = 0x02,
    /// Fetch the last payload of a `(node, field)` pair.
    Get = 0x03,
    /// Carries a `(node, field, payload)` triple, both as the GET reply
    /// and as subscriber fan-out.
    Deliver = 0x04,
    Subscribe = 0x05,
    Unsubscribe = 0x06,
    /// Unicast opaque bytes to a named peer on a named field.
    Anon = 0x07,
    DeliverAnon = 0x08,
    /// Ask the broker for a peer's advertised datagram endpoint.
    GetDatagramAddr = 0xFC,
    /// Shared byte: datagram endpoint advertisement/report and the
    /// registry snapshot. The body shape tells them apart, see
    /// [`message::Request`] and [`message::Response`].
    DatagramAddr = 0xFD,
    /// First server frame after accept.
    RequestAuth = 0xFE,
    /// Client claims its node name.
    SendAuth = 0xFF,
}

/// Error kinds carried inside ERROR frames.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive, IntoPrimitive)]
pub enum ErrorKind {
    NodeExists = 0x00,
    MethodNotFound = 0x01,
    InvalidCredentials = 0x02,
    InvalidSubscribe = 0x03,
    InvalidAnonTarget = 0x04,
    UnknownDatagramPeer = 0x05,
}

impl ErrorKind {
    /// Whether a client loop should stop after receiving this kind.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::NodeExists | Self::InvalidCredentials)
    }
}

/// Opcodes of the peer datagram transport, one per record.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive, IntoPrimitive)]
pub enum DatagramOpcode {
    Ping = 0x00,
    Pong = 0x01,
    Anon = 0x02,
}
