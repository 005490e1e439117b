//! ## Minibus client
//!
//! Connects a named node to a broker, keeps the stream and datagram loops
//! running, and chooses between transports when sending anon messages:
//! confirmed peers get direct datagrams, everyone else goes through the
//! broker.
//!
//! ```no_run
//! use minibus_sdk::{Client, ClientOptions};
//!
//! # async fn example() -> Result<(), minibus_sdk::Error> {
//! let client = Client::connect(ClientOptions {
//!     server: "127.0.0.1:3000".parse().unwrap(),
//!     name: "turtle".to_string(),
//! })
//! .await?;
//!
//! client.subscribe("camera", "frame", |payload| {
//!     println!("frame: {} bytes", payload.len());
//! })?;
//!
//! client.post("pose", b"x=0;y=0")?;
//! client.anon("camera", "cmd", b"\x01", false).await?;
//!
//! client.closed().await;
//! # Ok(())
//! # }
//! ```

pub mod peer;

use std::{
    collections::HashMap,
    io::ErrorKind::ConnectionReset,
    net::SocketAddr,
    sync::Arc,
    time::Duration,
};

use bytes::{Bytes, BytesMut};
use codec::{
    ErrorKind, datagram,
    datagram::Record,
    frame,
    message::{Request, Response},
};
use parking_lot::{Mutex, RwLock};
use tokio::{
    io::AsyncReadExt,
    io::AsyncWriteExt,
    net::{
        TcpStream, UdpSocket,
        tcp::{OwnedReadHalf, OwnedWriteHalf},
    },
    sync::{
        mpsc::{UnboundedReceiver, UnboundedSender, unbounded_channel},
        watch,
    },
    time::sleep,
};

use self::peer::{Peer, Peers};

/// How long an unanswered PING keeps the probe waiting, and how often the
/// wait polls for the answer.
const PING_TIMEOUT: Duration = Duration::from_secs(5);
const PING_POLL: Duration = Duration::from_millis(50);

/// Pause between datagram dispatcher scans.
const DATAGRAM_TICK: Duration = Duration::from_millis(10);

#[derive(Debug)]
pub enum Error {
    /// The stream loop has terminated; nothing more can be sent.
    Closed,
    Codec(codec::Error),
    Io(std::io::Error),
}

impl std::error::Error for Error {}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

impl From<codec::Error> for Error {
    fn from(value: codec::Error) -> Self {
        Self::Codec(value)
    }
}

impl From<std::io::Error> for Error {
    fn from(value: std::io::Error) -> Self {
        Self::Io(value)
    }
}

/// Subscription callback, invoked with each delivered payload.
pub type TopicHandler = Arc<dyn Fn(Bytes) + Send + Sync>;

/// Anon callback, invoked with the payload and the sender's name.
pub type AnonHandler = Arc<dyn Fn(Bytes, String) + Send + Sync>;

/// Registry snapshot callback.
pub type RosstatHandler = Arc<dyn Fn(serde_json::Value) + Send + Sync>;

#[derive(Debug, Clone)]
pub struct ClientOptions {
    /// Broker stream address.
    pub server: SocketAddr,
    /// Node name claimed at authentication. Must be unique on the broker
    /// while this client lives.
    pub name: String,
}

/// A connected node.
///
/// Cheap to clone; all clones drive the same connection.
#[derive(Clone)]
pub struct Client(Arc<Inner>);

struct Inner {
    name: String,
    outbox: UnboundedSender<Bytes>,
    socket: Arc<UdpSocket>,
    /// Own datagram endpoint, as advertised to the broker.
    datagram_addr: SocketAddr,
    peers: Peers,
    /// Per-source receive buffers fed by the datagram socket.
    buffers: Mutex<HashMap<SocketAddr, BytesMut>>,
    /// Deliveries for pairs without a registered handler.
    received: RwLock<HashMap<String, HashMap<String, Bytes>>>,
    topic_handlers: RwLock<HashMap<(String, String), TopicHandler>>,
    anon_handlers: RwLock<HashMap<String, AnonHandler>>,
    rosstat_handler: RwLock<Option<RosstatHandler>>,
    closed: watch::Sender<bool>,
}

impl Client {
    /// Opens the stream connection, binds a datagram endpoint on a free
    /// local port, answers the broker's auth request and advertises the
    /// endpoint, then spawns the client loops. The broker does not
    /// acknowledge a successful claim; a rejected name shows up as
    /// [`Client::closed`] resolving.
    pub async fn connect(options: ClientOptions) -> Result<Self, Error> {
        let stream = TcpStream::connect(options.server).await?;
        stream.set_nodelay(true)?;

        // The datagram endpoint lives on whatever local interface the
        // stream went out on, so the advertised address is one peers can
        // actually reach.
        let local_ip = stream.local_addr()?.ip();
        let socket = Arc::new(UdpSocket::bind(SocketAddr::new(local_ip, 0)).await?);
        let datagram_addr = socket.local_addr()?;

        let (mut reader, writer) = stream.into_split();
        let (outbox, outbox_rx) = unbounded_channel();
        let (closed, _) = watch::channel(false);

        let inner = Arc::new(Inner {
            name: options.name,
            outbox,
            socket,
            datagram_addr,
            peers: Peers::default(),
            buffers: Mutex::new(HashMap::new()),
            received: RwLock::new(HashMap::new()),
            topic_handlers: RwLock::new(HashMap::new()),
            anon_handlers: RwLock::new(HashMap::new()),
            rosstat_handler: RwLock::new(None),
            closed,
        });

        tokio::spawn(write_loop(writer, outbox_rx));

        // The broker speaks first. Answering REQUEST_AUTH before returning
        // pins the wire order: everything user code sends afterwards lands
        // behind SEND_AUTH.
        let mut buffer = BytesMut::with_capacity(4096);
        loop {
            match frame::split(&mut buffer)? {
                Some(body) => match Response::decode(&body)? {
                    Response::RequestAuth => break,
                    other => log::warn!("frame before auth request dropped: reply={other:?}"),
                },
                None => {
                    if reader.read_buf(&mut buffer).await? == 0 {
                        return Err(Error::Closed);
                    }
                }
            }
        }

        inner.send(&Request::SendAuth {
            name: inner.name.clone(),
        })?;

        inner.send(&Request::DatagramAddr {
            ip: datagram_addr.ip(),
            port: datagram_addr.port(),
        })?;

        tokio::spawn(stream_loop(inner.clone(), reader, buffer));
        tokio::spawn(recv_loop(inner.clone()));
        tokio::spawn(datagram_loop(inner.clone()));

        Ok(Self(inner))
    }

    pub fn name(&self) -> &str {
        &self.0.name
    }

    /// The local datagram endpoint advertised to the broker.
    pub fn datagram_addr(&self) -> SocketAddr {
        self.0.datagram_addr
    }

    /// Fire-and-forget publish to one of this node's own fields.
    pub fn post(&self, field: &str, payload: &[u8]) -> Result<(), Error> {
        self.0.send(&Request::Post {
            field: field.to_owned(),
            payload: Bytes::copy_from_slice(payload),
        })
    }

    /// Requests the last payload of `(node, field)`. The reply arrives as
    /// a DELIVER: through the pair's handler if one is registered,
    /// otherwise into the [`Client::received`] cache.
    pub fn get(&self, node: &str, field: &str) -> Result<(), Error> {
        self.0.send(&Request::Get {
            node: node.to_owned(),
            field: field.to_owned(),
        })
    }

    /// Last cached delivery for a pair without a handler.
    pub fn received(&self, node: &str, field: &str) -> Option<Bytes> {
        self.0.received.read().get(node)?.get(field).cloned()
    }

    /// Subscribes to `(node, field)`; `handler` runs on the stream loop
    /// for every delivery. Subscribing twice doubles the deliveries.
    pub fn subscribe<F>(&self, node: &str, field: &str, handler: F) -> Result<(), Error>
    where
        F: Fn(Bytes) + Send + Sync + 'static,
    {
        self.0
            .topic_handlers
            .write()
            .insert((node.to_owned(), field.to_owned()), Arc::new(handler));

        self.0.send(&Request::Subscribe {
            node: node.to_owned(),
            field: field.to_owned(),
        })
    }

    /// Drops every subscription of this node to `(node, field)`, local
    /// handler included.
    pub fn unsubscribe(&self, node: &str, field: &str) -> Result<(), Error> {
        self.0
            .topic_handlers
            .write()
            .remove(&(node.to_owned(), field.to_owned()));

        self.0.send(&Request::Unsubscribe {
            node: node.to_owned(),
            field: field.to_owned(),
        })
    }

    /// Registers the anon callback for a field name.
    pub fn on_anon<F>(&self, field: &str, handler: F)
    where
        F: Fn(Bytes, String) + Send + Sync + 'static,
    {
        self.0
            .anon_handlers
            .write()
            .insert(field.to_owned(), Arc::new(handler));
    }

    /// Registers the registry snapshot callback.
    pub fn on_rosstat<F>(&self, handler: F)
    where
        F: Fn(serde_json::Value) + Send + Sync + 'static,
    {
        *self.0.rosstat_handler.write() = Some(Arc::new(handler));
    }

    /// Requests a registry snapshot; the reply goes to the
    /// [`Client::on_rosstat`] callback.
    pub fn rosstat(&self) -> Result<(), Error> {
        self.0.send(&Request::Rosstat)
    }

    /// Current knowledge about a peer's datagram endpoint, for
    /// diagnostics.
    pub fn peer(&self, node: &str) -> Option<Peer> {
        self.0.peers.get(node)
    }

    /// Unicasts opaque bytes to `node` on `field`.
    ///
    /// Picks the transport by peer state: a confirmed-reachable peer gets
    /// a direct datagram; a peer that failed its probe or lookup gets
    /// broker relay; an unknown peer gets relay now plus an endpoint
    /// lookup for next time; an advertised-but-unprobed peer is pinged
    /// first and the send follows the outcome. `force_relay` skips the
    /// datagram path entirely.
    pub async fn anon(
        &self,
        node: &str,
        field: &str,
        payload: &[u8],
        force_relay: bool,
    ) -> Result<(), Error> {
        if force_relay {
            return self.relay(node, field, payload);
        }

        match self.0.peers.get(node) {
            Some(Peer {
                reachable: true,
                addr: Some(addr),
                ..
            }) => self.direct(addr, field, payload).await,
            Some(Peer { tried: true, .. }) => self.relay(node, field, payload),
            Some(Peer {
                addr: Some(addr), ..
            }) => {
                // Advertised but never probed: ping, then wait for the
                // datagram dispatcher to observe the pong.
                self.0.peers.mark_tried(node);
                self.0.send_record(&Record::Ping, addr).await?;

                let deadline = PING_TIMEOUT.as_millis() / PING_POLL.as_millis();
                for _ in 0..deadline {
                    if self.0.peers.get(node).is_some_and(|peer| peer.reachable) {
                        break;
                    }

                    sleep(PING_POLL).await;
                }

                if self.0.peers.get(node).is_some_and(|peer| peer.reachable) {
                    self.direct(addr, field, payload).await
                } else {
                    log::debug!("datagram probe timed out: node={node:?}");
                    self.relay(node, field, payload)
                }
            }
            // An entry with neither endpoint nor probe does not occur.
            Some(_) => self.relay(node, field, payload),
            None => {
                // Ask for the endpoint for next time, deliver through the
                // broker now.
                self.0.send(&Request::GetDatagramAddr {
                    node: node.to_owned(),
                })?;

                self.relay(node, field, payload)
            }
        }
    }

    /// Resolves once the stream loop has terminated, whether by EOF or by
    /// a fatal in-band error.
    pub async fn closed(&self) {
        let mut rx = self.0.closed.subscribe();
        while !*rx.borrow_and_update() {
            if rx.changed().await.is_err() {
                break;
            }
        }
    }

    fn relay(&self, node: &str, field: &str, payload: &[u8]) -> Result<(), Error> {
        self.0.send(&Request::Anon {
            node: node.to_owned(),
            field: field.to_owned(),
            payload: Bytes::copy_from_slice(payload),
        })
    }

    async fn direct(&self, addr: SocketAddr, field: &str, payload: &[u8]) -> Result<(), Error> {
        let record = Record::Anon {
            sender: self.0.name.clone(),
            field: field.to_owned(),
            payload: Bytes::copy_from_slice(payload),
        };

        self.0.send_record(&record, addr).await
    }
}

impl Inner {
    /// Seals a request into one compressed frame and queues it on the
    /// stream writer.
    fn send(&self, request: &Request) -> Result<(), Error> {
        let mut body = BytesMut::new();
        request.encode(&mut body)?;

        let mut wire = BytesMut::new();
        frame::encode(&body, &mut wire)?;

        self.outbox
            .send(wire.freeze())
            .map_err(|_| Error::Closed)
    }

    async fn send_record(&self, record: &Record, addr: SocketAddr) -> Result<(), Error> {
        let mut wire = BytesMut::new();
        record.encode(&mut wire)?;
        self.socket.send_to(&wire, addr).await?;
        Ok(())
    }

    /// Handles one server frame; returns `false` when the loop must stop.
    fn dispatch(&self, response: Response) -> bool {
        match response {
            // Already answered during connect; the broker sends it once.
            Response::RequestAuth => log::warn!("unexpected auth request ignored"),
            Response::Deliver {
                node,
                field,
                payload,
            } => {
                let handler = self
                    .topic_handlers
                    .read()
                    .get(&(node.clone(), field.clone()))
                    .cloned();

                match handler {
                    Some(handler) => handler(payload),
                    None => {
                        self.received
                            .write()
                            .entry(node)
                            .or_default()
                            .insert(field, payload);
                    }
                }
            }
            Response::DeliverAnon {
                sender,
                field,
                payload,
            } => {
                let handler = self.anon_handlers.read().get(&field).cloned();
                match handler {
                    Some(handler) => handler(payload, sender),
                    None => log::debug!("anon without handler dropped: field={field:?}"),
                }
            }
            Response::DatagramAddr { node, ip, port } => {
                self.peers.advertise(&node, SocketAddr::new(ip, port));
            }
            Response::Rosstat { json } => match serde_json::from_str(&json) {
                Ok(value) => {
                    if let Some(handler) = self.rosstat_handler.read().clone() {
                        handler(value);
                    }
                }
                Err(e) => log::warn!("unparseable registry snapshot: err={e}"),
            },
            Response::PostAck { .. } => {}
            Response::Error { kind, context } => return self.handle_error(kind, &context),
        }

        true
    }

    fn handle_error(&self, kind: ErrorKind, context: &Bytes) -> bool {
        match kind {
            ErrorKind::NodeExists => log::error!("node name already exists"),
            ErrorKind::InvalidCredentials => log::error!("broker rejected credentials"),
            ErrorKind::MethodNotFound => log::error!("broker did not recognize a request"),
            ErrorKind::InvalidSubscribe => log::error!("subscribed to an unknown node"),
            ErrorKind::InvalidAnonTarget => log::error!("anon target is not connected"),
            ErrorKind::UnknownDatagramPeer => match std::str::from_utf8(context) {
                Ok(node) => {
                    log::warn!("peer has no datagram endpoint: node={node:?}");
                    self.peers.mark_unreachable(node);
                }
                Err(_) => log::warn!("unreadable datagram lookup context"),
            },
        }

        !kind.is_fatal()
    }
}

async fn write_loop(mut writer: OwnedWriteHalf, mut rx: UnboundedReceiver<Bytes>) {
    while let Some(frame) = rx.recv().await {
        if writer.write_all(&frame).await.is_err() {
            break;
        }
    }
}

/// Reads and dispatches server frames. `buffer` may already hold frames
/// that arrived behind the auth request during connect.
async fn stream_loop(inner: Arc<Inner>, mut reader: OwnedReadHalf, mut buffer: BytesMut) {
    'outer: loop {
        loop {
            let body = match frame::split(&mut buffer) {
                Ok(Some(body)) => body,
                Ok(None) => break,
                Err(e) => {
                    log::warn!("dropped malformed frame: err={e}");
                    continue;
                }
            };

            let response = match Response::decode(&body) {
                Ok(response) => response,
                Err(e) => {
                    log::warn!("undecodable reply: err={e}");
                    let _ = inner.send(&Request::Error {
                        kind: ErrorKind::MethodNotFound,
                        context: Bytes::new(),
                    });
                    continue;
                }
            };

            if !inner.dispatch(response) {
                break 'outer;
            }
        }

        match reader.read_buf(&mut buffer).await {
            Ok(0) | Err(_) => break,
            Ok(_) => {}
        }
    }

    inner.closed.send_replace(true);
    log::info!("stream loop terminated: node={:?}", inner.name);
}

/// Feeds the datagram socket into the per-source receive buffers.
async fn recv_loop(inner: Arc<Inner>) {
    let mut scratch = vec![0u8; 65536];

    loop {
        match inner.socket.recv_from(&mut scratch).await {
            Ok((size, addr)) => {
                let mut buffers = inner.buffers.lock();
                buffers
                    .entry(addr)
                    .or_default()
                    .extend_from_slice(&scratch[..size]);
            }
            Err(e) if e.kind() == ConnectionReset => continue,
            Err(e) => {
                log::error!("datagram receive failed: err={e}");
                break;
            }
        }
    }
}

/// Scans the receive buffers and consumes one record per non-empty buffer
/// per tick, so a chatty peer cannot starve the rest.
async fn datagram_loop(inner: Arc<Inner>) {
    loop {
        let mut records = Vec::new();
        {
            let mut buffers = inner.buffers.lock();
            for (addr, buffer) in buffers.iter_mut() {
                if let Some(record) = datagram::split(buffer) {
                    records.push((*addr, record));
                }
            }
        }

        for (addr, record) in records {
            match Record::decode(&record) {
                Ok(Record::Ping) => {
                    if let Err(e) = inner.send_record(&Record::Pong, addr).await {
                        log::warn!("pong send failed: addr={addr:?}, err={e}");
                    }
                }
                Ok(Record::Pong) => match inner.peers.confirm(addr) {
                    Some(node) => log::debug!("datagram peer confirmed: node={node:?}"),
                    None => log::debug!("pong from unknown peer: addr={addr:?}"),
                },
                Ok(Record::Anon {
                    sender,
                    field,
                    payload,
                }) => {
                    let handler = inner.anon_handlers.read().get(&field).cloned();
                    if let Some(handler) = handler {
                        handler(payload, sender);
                    }
                }
                Err(e) => log::warn!("dropped malformed record: addr={addr:?}, err={e}"),
            }
        }

        sleep(DATAGRAM_TICK).await;
    }
}
