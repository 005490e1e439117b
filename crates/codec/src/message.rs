//! Typed stream messages, split by direction.
//!
//! All lengths inside bodies are 1-byte; where two names are concatenated
//! both lengths come first, then both strings. IP addresses travel as
//! ASCII text, ports as 2-byte big-endian.

use std::net::IpAddr;
use std::str;

use bytes::{BufMut, Bytes, BytesMut};

use crate::{Error, ErrorKind, Opcode};

/// Client → server messages.
#[derive(Debug, Clone, PartialEq)]
pub enum Request {
    /// Error report from the peer; logged, never answered.
    Error { kind: ErrorKind, context: Bytes },
    /// Publish to a field owned by the sender.
    Post { field: String, payload: Bytes },
    Get { node: String, field: String },
    Subscribe { node: String, field: String },
    Unsubscribe { node: String, field: String },
    Anon {
        node: String,
        field: String,
        payload: Bytes,
    },
    GetDatagramAddr { node: String },
    /// Advertise the sender's own datagram endpoint, as seen by the
    /// sender itself.
    DatagramAddr { ip: IpAddr, port: u16 },
    /// Registry snapshot request. Shares the advertisement opcode with an
    /// empty body; an advertisement body is never empty.
    Rosstat,
    SendAuth { name: String },
}

/// Server → client messages.
#[derive(Debug, Clone, PartialEq)]
pub enum Response {
    Error { kind: ErrorKind, context: Bytes },
    PostAck { status: u8 },
    /// GET reply and subscriber fan-out alike.
    Deliver {
        node: String,
        field: String,
        payload: Bytes,
    },
    DeliverAnon {
        sender: String,
        field: String,
        payload: Bytes,
    },
    /// A peer's datagram endpoint, prefixed with the requested name so
    /// the reply is self-describing.
    DatagramAddr {
        node: String,
        ip: IpAddr,
        port: u16,
    },
    /// Registry snapshot. Carries a zero name-length prefix, which no
    /// node can claim, followed by the JSON text.
    Rosstat { json: String },
    RequestAuth,
}

impl Request {
    pub fn decode(body: &[u8]) -> Result<Self, Error> {
        let (&opcode, rest) = body.split_first().ok_or(Error::InvalidInput)?;
        let opcode = Opcode::try_from(opcode).map_err(|_| Error::UnknownOpcode(opcode))?;

        Ok(match opcode {
            Opcode::Error => {
                let (kind, context) = get_error(rest)?;
                Self::Error { kind, context }
            }
            Opcode::Post => {
                let (field, payload) = get_name(rest)?;
                Self::Post {
                    field: field.to_owned(),
                    payload: Bytes::copy_from_slice(payload),
                }
            }
            Opcode::Get => {
                let (node, field, _) = get_pair(rest)?;
                Self::Get {
                    node: node.to_owned(),
                    field: field.to_owned(),
                }
            }
            Opcode::Subscribe => {
                let (node, field, _) = get_pair(rest)?;
                Self::Subscribe {
                    node: node.to_owned(),
                    field: field.to_owned(),
                }
            }
            Opcode::Unsubscribe => {
                let (node, field, _) = get_pair(rest)?;
                Self::Unsubscribe {
                    node: node.to_owned(),
                    field: field.to_owned(),
                }
            }
            Opcode::Anon => {
                let (node, field, payload) = get_pair(rest)?;
                Self::Anon {
                    node: node.to_owned(),
                    field: field.to_owned(),
                    payload: Bytes::copy_from_slice(payload),
                }
            }
            Opcode::GetDatagramAddr => Self::GetDatagramAddr {
                node: str::from_utf8(rest)?.to_owned(),
            },
            Opcode::DatagramAddr => {
                if rest.is_empty() {
                    Self::Rosstat
                } else {
                    let (ip, port) = get_endpoint(rest)?;
                    Self::DatagramAddr { ip, port }
                }
            }
            Opcode::SendAuth => {
                let (name, _) = get_name(rest)?;
                Self::SendAuth {
                    name: name.to_owned(),
                }
            }
            // These never travel client → server.
            Opcode::PostAck | Opcode::Deliver | Opcode::DeliverAnon | Opcode::RequestAuth => {
                return Err(Error::UnknownOpcode(opcode.into()));
            }
        })
    }

    pub fn encode(&self, dst: &mut BytesMut) -> Result<(), Error> {
        match self {
            Self::Error { kind, context } => {
                dst.put_u8(Opcode::Error.into());
                dst.put_u8((*kind).into());
                dst.put_slice(context);
            }
            Self::Post { field, payload } => {
                dst.put_u8(Opcode::Post.into());
                put_name(field, dst)?;
                dst.put_slice(payload);
            }
            Self::Get { node, field } => {
                dst.put_u8(Opcode::Get.into());
                put_pair(node, field, dst)?;
            }
            Self::Subscribe { node, field } => {
                dst.put_u8(Opcode::Subscribe.into());
                put_pair(node, field, dst)?;
            }
            Self::Unsubscribe { node, field } => {
                dst.put_u8(Opcode::Unsubscribe.into());
                put_pair(node, field, dst)?;
            }
            Self::Anon {
                node,
                field,
                payload,
            } => {
                dst.put_u8(Opcode::Anon.into());
                put_pair(node, field, dst)?;
                dst.put_slice(payload);
            }
            Self::GetDatagramAddr { node } => {
                dst.put_u8(Opcode::GetDatagramAddr.into());
                dst.put_slice(node.as_bytes());
            }
            Self::DatagramAddr { ip, port } => {
                dst.put_u8(Opcode::DatagramAddr.into());
                dst.put_slice(ip.to_string().as_bytes());
                dst.put_u16(*port);
            }
            Self::Rosstat => {
                dst.put_u8(Opcode::DatagramAddr.into());
            }
            Self::SendAuth { name } => {
                dst.put_u8(Opcode::SendAuth.into());
                put_name(name, dst)?;
            }
        }

        Ok(())
    }
}

impl Response {
    pub fn decode(body: &[u8]) -> Result<Self, Error> {
        let (&opcode, rest) = body.split_first().ok_or(Error::InvalidInput)?;
        let opcode = Opcode::try_from(opcode).map_err(|_| Error::UnknownOpcode(opcode))?;

        Ok(match opcode {
            Opcode::Error => {
                let (kind, context) = get_error(rest)?;
                Self::Error { kind, context }
            }
            Opcode::PostAck => {
                let (&status, _) = rest.split_first().ok_or(Error::InvalidInput)?;
                Self::PostAck { status }
            }
            Opcode::Deliver => {
                let (node, field, payload) = get_pair(rest)?;
                Self::Deliver {
                    node: node.to_owned(),
                    field: field.to_owned(),
                    payload: Bytes::copy_from_slice(payload),
                }
            }
            Opcode::DeliverAnon => {
                let (sender, field, payload) = get_pair(rest)?;
                Self::DeliverAnon {
                    sender: sender.to_owned(),
                    field: field.to_owned(),
                    payload: Bytes::copy_from_slice(payload),
                }
            }
            Opcode::DatagramAddr => match rest.split_first() {
                None => return Err(Error::InvalidInput),
                Some((&0, json)) => Self::Rosstat {
                    json: str::from_utf8(json)?.to_owned(),
                },
                Some(_) => {
                    let (node, tail) = get_name(rest)?;
                    let (ip, port) = get_endpoint(tail)?;
                    Self::DatagramAddr {
                        node: node.to_owned(),
                        ip,
                        port,
                    }
                }
            },
            Opcode::RequestAuth => Self::RequestAuth,
            // These never travel server → client.
            Opcode::Post
            | Opcode::Get
            | Opcode::Subscribe
            | Opcode::Unsubscribe
            | Opcode::Anon
            | Opcode::GetDatagramAddr
            | Opcode::SendAuth => {
                return Err(Error::UnknownOpcode(opcode.into()));
            }
        })
    }

    pub fn encode(&self, dst: &mut BytesMut) -> Result<(), Error> {
        match self {
            Self::Error { kind, context } => {
                dst.put_u8(Opcode::Error.into());
                dst.put_u8((*kind).into());
                dst.put_slice(context);
            }
            Self::PostAck { status } => {
                dst.put_u8(Opcode::PostAck.into());
                dst.put_u8(*status);
            }
            Self::Deliver {
                node,
                field,
                payload,
            } => {
                dst.put_u8(Opcode::Deliver.into());
                put_pair(node, field, dst)?;
                dst.put_slice(payload);
            }
            Self::DeliverAnon {
                sender,
                field,
                payload,
            } => {
                dst.put_u8(Opcode::DeliverAnon.into());
                put_pair(sender, field, dst)?;
                dst.put_slice(payload);
            }
            Self::DatagramAddr { node, ip, port } => {
                dst.put_u8(Opcode::DatagramAddr.into());
                put_name(node, dst)?;
                dst.put_slice(ip.to_string().as_bytes());
                dst.put_u16(*port);
            }
            Self::Rosstat { json } => {
                dst.put_u8(Opcode::DatagramAddr.into());
                dst.put_u8(0);
                dst.put_slice(json.as_bytes());
            }
            Self::RequestAuth => {
                dst.put_u8(Opcode::RequestAuth.into());
            }
        }

        Ok(())
    }
}

fn get_error(body: &[u8]) -> Result<(ErrorKind, Bytes), Error> {
    let (&kind, context) = body.split_first().ok_or(Error::InvalidInput)?;
    Ok((
        ErrorKind::try_from(kind).map_err(|_| Error::UnknownErrorKind(kind))?,
        Bytes::copy_from_slice(context),
    ))
}

/// Reads one 1-byte-length-prefixed string; returns it and the tail.
fn get_name(body: &[u8]) -> Result<(&str, &[u8]), Error> {
    let (&length, rest) = body.split_first().ok_or(Error::InvalidInput)?;
    let length = length as usize;
    if rest.len() < length {
        return Err(Error::InvalidInput);
    }

    Ok((str::from_utf8(&rest[..length])?, &rest[length..]))
}

/// Reads the two-name layout: both lengths first, then both strings.
/// Returns the names and the trailing payload bytes.
pub(crate) fn get_pair(body: &[u8]) -> Result<(&str, &str, &[u8]), Error> {
    if body.len() < 2 {
        return Err(Error::InvalidInput);
    }

    let (first, second) = (body[0] as usize, body[1] as usize);
    let rest = &body[2..];
    if rest.len() < first + second {
        return Err(Error::InvalidInput);
    }

    Ok((
        str::from_utf8(&rest[..first])?,
        str::from_utf8(&rest[first..first + second])?,
        &rest[first + second..],
    ))
}

fn get_endpoint(body: &[u8]) -> Result<(IpAddr, u16), Error> {
    if body.len() < 3 {
        return Err(Error::InvalidInput);
    }

    let (ip, port) = body.split_at(body.len() - 2);
    let ip = str::from_utf8(ip)?
        .parse::<IpAddr>()
        .map_err(|_| Error::InvalidInput)?;

    Ok((ip, u16::from_be_bytes([port[0], port[1]])))
}

fn put_name(name: &str, dst: &mut BytesMut) -> Result<(), Error> {
    if name.len() > u8::MAX as usize {
        return Err(Error::InvalidInput);
    }

    dst.put_u8(name.len() as u8);
    dst.put_slice(name.as_bytes());
    Ok(())
}

pub(crate) fn put_pair(first: &str, second: &str, dst: &mut BytesMut) -> Result<(), Error> {
    if first.len() > u8::MAX as usize || second.len() > u8::MAX as usize {
        return Err(Error::InvalidInput);
    }

    dst.put_u8(first.len() as u8);
    dst.put_u8(second.len() as u8);
    dst.put_slice(first.as_bytes());
    dst.put_slice(second.as_bytes());
    Ok(())
}
