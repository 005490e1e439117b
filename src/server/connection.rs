use std::net::SocketAddr;

use bytes::{Bytes, BytesMut};
use codec::{
    ErrorKind, STATUS_OK, frame,
    message::{Request, Response},
};
use service::Registry;
use tokio::{io::AsyncReadExt, net::TcpStream};

use super::outbox::Outbox;

/// Drives one accepted stream connection from auth to teardown.
///
/// The first frame after REQUEST_AUTH must be SEND_AUTH; everything else
/// is answered with an error and the connection stays unauthenticated.
/// Once a name is claimed the per-frame dispatch below runs until EOF or a
/// transport failure, after which the registry record is purged and every
/// subscriber list loses the departing name.
pub async fn handle(socket: TcpStream, address: SocketAddr, registry: Registry<Outbox>) {
    let (mut reader, writer) = socket.into_split();
    let outbox = Outbox::start(writer);

    send(&outbox, &Response::RequestAuth);

    // None until SEND_AUTH succeeds.
    let mut identity: Option<String> = None;
    let mut buffer = BytesMut::with_capacity(4096);

    loop {
        match reader.read_buf(&mut buffer).await {
            Ok(0) | Err(_) => {
                if !buffer.is_empty() {
                    log::warn!(
                        "stream ended mid frame: addr={address:?}, pending={}",
                        buffer.len()
                    );
                }

                break;
            }
            Ok(_) => {}
        }

        loop {
            let body = match frame::split(&mut buffer) {
                Ok(Some(body)) => body,
                Ok(None) => break,
                Err(e) => {
                    // A corrupt compressed block costs one frame, not the
                    // connection.
                    log::warn!("dropped malformed frame: addr={address:?}, err={e}");
                    continue;
                }
            };

            let request = match Request::decode(&body) {
                Ok(request) => request,
                Err(e) => {
                    log::warn!("undecodable request: addr={address:?}, err={e}");
                    send_error(&outbox, ErrorKind::MethodNotFound, Bytes::new());
                    continue;
                }
            };

            if let Some(name) = identity.take() {
                dispatch(&name, request, &outbox, &registry, address);
                identity = Some(name);
            } else {
                identity = authenticate(request, &outbox, &registry, address);
            }
        }
    }

    match identity {
        Some(name) => {
            registry.remove(&name);
            log::info!("tcp socket disconnect: addr={address:?}, node={name:?}");
        }
        None => log::info!("tcp socket disconnect: addr={address:?}"),
    }
}

/// AwaitingAuth: only a usable SEND_AUTH moves the connection on; anything
/// else leaves it where it is.
fn authenticate(
    request: Request,
    outbox: &Outbox,
    registry: &Registry<Outbox>,
    address: SocketAddr,
) -> Option<String> {
    let name = match request {
        // The empty name is reserved, see the snapshot reply framing.
        Request::SendAuth { name } if !name.is_empty() => name,
        _ => {
            log::warn!("rejected pre-auth request: addr={address:?}");
            send_error(outbox, ErrorKind::InvalidCredentials, Bytes::new());
            return None;
        }
    };

    if registry.insert(&name, outbox.clone()).is_err() {
        log::warn!("node name already claimed: addr={address:?}, node={name:?}");
        send_error(outbox, ErrorKind::InvalidCredentials, Bytes::new());
        return None;
    }

    log::info!("node authenticated: addr={address:?}, node={name:?}");

    Some(name)
}

fn dispatch(
    name: &str,
    request: Request,
    outbox: &Outbox,
    registry: &Registry<Outbox>,
    address: SocketAddr,
) {
    match request {
        Request::Post { field, payload } => {
            let subscribers = match registry.publish(name, &field, payload.clone()) {
                Ok(subscribers) => subscribers,
                Err(e) => {
                    // The publisher is authenticated, so its own record
                    // cannot be missing; nothing sensible to answer.
                    log::error!("publish failed: node={name:?}, field={field:?}, err={e}");
                    return;
                }
            };

            if let Some(deliver) = seal(&Response::Deliver {
                node: name.to_owned(),
                field: field.clone(),
                payload,
            }) {
                for (subscriber, target) in subscribers {
                    if !target.push(deliver.clone()) {
                        log::warn!("fan-out push failed: node={subscriber:?}, field={field:?}");
                    }
                }
            }

            send(outbox, &Response::PostAck { status: STATUS_OK });
        }
        Request::Get { node, field } => match registry.get(&node, &field) {
            Ok(payload) => send(outbox, &Response::Deliver { node, field, payload }),
            Err(_) => send_error(outbox, ErrorKind::InvalidCredentials, Bytes::new()),
        },
        Request::Subscribe { node, field } => {
            if registry.subscribe(&node, &field, name).is_err() {
                send_error(outbox, ErrorKind::InvalidSubscribe, Bytes::new());
            }
        }
        Request::Unsubscribe { node, field } => {
            if registry.unsubscribe(&node, &field, name).is_err() {
                send_error(outbox, ErrorKind::InvalidSubscribe, Bytes::new());
            }
        }
        Request::Anon {
            node,
            field,
            payload,
        } => match registry.outbox(&node) {
            Some(target) => {
                let deliver = Response::DeliverAnon {
                    sender: name.to_owned(),
                    field,
                    payload,
                };

                if let Some(frame) = seal(&deliver) {
                    target.push(frame);
                }
            }
            None => send_error(outbox, ErrorKind::InvalidAnonTarget, Bytes::new()),
        },
        Request::DatagramAddr { ip, port } => {
            let _ = registry.set_datagram_addr(name, (ip, port).into());
        }
        Request::GetDatagramAddr { node } => match registry.datagram_addr(&node) {
            Ok(addr) => send(
                outbox,
                &Response::DatagramAddr {
                    node,
                    ip: addr.ip(),
                    port: addr.port(),
                },
            ),
            // The requested name is echoed so the client knows which peer
            // to stop probing.
            Err(_) => send_error(
                outbox,
                ErrorKind::UnknownDatagramPeer,
                Bytes::from(node.into_bytes()),
            ),
        },
        Request::Rosstat => {
            let json = registry.snapshot().to_string();
            send(outbox, &Response::Rosstat { json });
        }
        Request::Error { kind, context } => {
            log::warn!("peer reported error: addr={address:?}, kind={kind:?}, context={context:?}");
        }
        // SEND_AUTH has no meaning once authenticated.
        Request::SendAuth { .. } => {
            send_error(outbox, ErrorKind::MethodNotFound, Bytes::new());
        }
    }
}

/// Encodes and compresses a response into one wire-ready frame.
fn seal(response: &Response) -> Option<Bytes> {
    let mut body = BytesMut::new();
    if let Err(e) = response.encode(&mut body) {
        log::error!("response encode failed: err={e}");
        return None;
    }

    let mut wire = BytesMut::new();
    if let Err(e) = frame::encode(&body, &mut wire) {
        log::error!("frame encode failed: err={e}");
        return None;
    }

    Some(wire.freeze())
}

fn send(outbox: &Outbox, response: &Response) {
    if let Some(frame) = seal(response) {
        outbox.push(frame);
    }
}

fn send_error(outbox: &Outbox, kind: ErrorKind, context: Bytes) {
    send(outbox, &Response::Error { kind, context });
}
