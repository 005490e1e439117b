//! Uncompressed length-prefixed records for the peer datagram transport.
//!
//! One UDP payload may carry several records; receive buffers are treated
//! as a byte stream and [`split`] consumes one record per call.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::{DatagramOpcode, Error, frame::LENGTH_PREFIX, message};

/// One record of the peer-to-peer datagram protocol.
#[derive(Debug, Clone, PartialEq)]
pub enum Record {
    /// Liveness probe.
    Ping,
    Pong,
    /// Direct peer anon delivery, bypassing the broker.
    Anon {
        sender: String,
        field: String,
        payload: Bytes,
    },
}

impl Record {
    pub fn decode(body: &[u8]) -> Result<Self, Error> {
        let (&opcode, rest) = body.split_first().ok_or(Error::InvalidInput)?;
        let opcode = DatagramOpcode::try_from(opcode).map_err(|_| Error::UnknownOpcode(opcode))?;

        Ok(match opcode {
            DatagramOpcode::Ping => Self::Ping,
            DatagramOpcode::Pong => Self::Pong,
            DatagramOpcode::Anon => {
                let (sender, field, payload) = message::get_pair(rest)?;
                Self::Anon {
                    sender: sender.to_owned(),
                    field: field.to_owned(),
                    payload: Bytes::copy_from_slice(payload),
                }
            }
        })
    }

    /// Writes the record with its outer length prefix.
    pub fn encode(&self, dst: &mut BytesMut) -> Result<(), Error> {
        let mut body = BytesMut::new();
        match self {
            Self::Ping => body.put_u8(DatagramOpcode::Ping.into()),
            Self::Pong => body.put_u8(DatagramOpcode::Pong.into()),
            Self::Anon {
                sender,
                field,
                payload,
            } => {
                body.put_u8(DatagramOpcode::Anon.into());
                message::put_pair(sender, field, &mut body)?;
                body.put_slice(payload);
            }
        }

        dst.reserve(LENGTH_PREFIX + body.len());
        dst.put_u32(body.len() as u32);
        dst.put_slice(&body);
        Ok(())
    }
}

/// Pops one record off the front of a per-peer receive buffer, or `None`
/// until a full record has arrived.
pub fn split(buffer: &mut BytesMut) -> Option<Bytes> {
    if buffer.len() < LENGTH_PREFIX {
        return None;
    }

    let length = u32::from_be_bytes([buffer[0], buffer[1], buffer[2], buffer[3]]) as usize;
    if buffer.len() < LENGTH_PREFIX + length {
        return None;
    }

    buffer.advance(LENGTH_PREFIX);
    Some(buffer.split_to(length).freeze())
}
