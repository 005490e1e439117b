//! ## Broker state
//!
//! The in-memory registry mapping node names to connection records. The
//! crate is runtime-free: the writer handle is a generic `W` (the server
//! instantiates it with its per-connection outbox sender), so every
//! operation here is synchronous and the map is shared across connection
//! tasks behind a read-write lock.

use std::net::SocketAddr;
use std::sync::Arc;

use ahash::{HashMap, HashMapExt};
use bytes::Bytes;
use parking_lot::RwLock;
use serde_json::{Map, Value, json};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// The name is already claimed by a live connection.
    NodeExists,
    UnknownNode,
    UnknownField,
    /// The node is connected but never advertised a datagram endpoint.
    NoDatagramAddr,
}

impl std::error::Error for Error {}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// A named byte-blob slot owned by one node.
///
/// A field exists after its owner's first publication or after the first
/// subscription to it; in the latter case the payload is still absent.
#[derive(Debug, Default, Clone)]
pub struct Field {
    /// Last published payload. Once set it is only ever overwritten.
    pub payload: Option<Bytes>,
    /// Ordered multiset of subscriber names. Subscribing twice yields two
    /// deliveries per publication.
    pub subscribers: Vec<String>,
}

/// Per-connection record: the claimed name's fields, the writer handle
/// used to push frames at the node, and its advertised datagram endpoint.
#[derive(Debug)]
pub struct Node<W> {
    pub outbox: W,
    pub fields: HashMap<String, Field>,
    pub datagram_addr: Option<SocketAddr>,
}

/// The broker registry.
///
/// ```
/// use minibus_service::{Error, Registry};
///
/// let registry = Registry::<()>::default();
///
/// registry.insert("turtle", ()).unwrap();
/// assert_eq!(registry.insert("turtle", ()), Err(Error::NodeExists));
///
/// registry.remove("turtle");
/// assert!(registry.insert("turtle", ()).is_ok());
/// ```
pub struct Registry<W>(Arc<RwLock<HashMap<String, Node<W>>>>);

impl<W> Default for Registry<W> {
    fn default() -> Self {
        Self(Arc::new(RwLock::new(HashMap::new())))
    }
}

impl<W> Clone for Registry<W> {
    fn clone(&self) -> Self {
        Self(self.0.clone())
    }
}

impl<W: Clone> Registry<W> {
    /// Claims `name` for a new connection.
    pub fn insert(&self, name: &str, outbox: W) -> Result<(), Error> {
        let mut nodes = self.0.write();
        if nodes.contains_key(name) {
            return Err(Error::NodeExists);
        }

        nodes.insert(
            name.to_owned(),
            Node {
                outbox,
                fields: HashMap::new(),
                datagram_addr: None,
            },
        );

        Ok(())
    }

    /// Destroys a connection record and scrubs every occurrence of the
    /// departing name from every subscriber list. Idempotent.
    pub fn remove(&self, name: &str) {
        let mut nodes = self.0.write();
        if nodes.remove(name).is_none() {
            return;
        }

        for node in nodes.values_mut() {
            for field in node.fields.values_mut() {
                field.subscribers.retain(|it| it != name);
            }
        }
    }

    pub fn contains(&self, name: &str) -> bool {
        self.0.read().contains_key(name)
    }

    /// Upserts the field, overwrites its payload and returns the writer
    /// handles to fan the publication out to, one per subscription.
    pub fn publish(
        &self,
        owner: &str,
        field: &str,
        payload: Bytes,
    ) -> Result<Vec<(String, W)>, Error> {
        let mut nodes = self.0.write();

        let subscribers = {
            let record = nodes.get_mut(owner).ok_or(Error::UnknownNode)?;
            let slot = record.fields.entry(field.to_owned()).or_default();
            slot.payload = Some(payload);
            slot.subscribers.clone()
        };

        // Names of connections that raced away since their subscription
        // are skipped; the disconnect scrub owns their removal.
        Ok(subscribers
            .into_iter()
            .filter_map(|name| {
                let outbox = nodes.get(&name)?.outbox.clone();
                Some((name, outbox))
            })
            .collect())
    }

    /// Last payload of a `(node, field)` pair; empty if the field exists
    /// but has never been posted.
    pub fn get(&self, node: &str, field: &str) -> Result<Bytes, Error> {
        let nodes = self.0.read();
        let record = nodes.get(node).ok_or(Error::UnknownNode)?;
        let slot = record.fields.get(field).ok_or(Error::UnknownField)?;

        Ok(slot.payload.clone().unwrap_or_else(Bytes::new))
    }

    /// Appends `subscriber` to the field's list, creating the field if the
    /// owner has never posted it.
    pub fn subscribe(&self, node: &str, field: &str, subscriber: &str) -> Result<(), Error> {
        let mut nodes = self.0.write();
        let record = nodes.get_mut(node).ok_or(Error::UnknownNode)?;

        record
            .fields
            .entry(field.to_owned())
            .or_default()
            .subscribers
            .push(subscriber.to_owned());

        Ok(())
    }

    /// Removes all occurrences of `subscriber`, making repeated calls
    /// idempotent. An unknown field is a no-op.
    pub fn unsubscribe(&self, node: &str, field: &str, subscriber: &str) -> Result<(), Error> {
        let mut nodes = self.0.write();
        let record = nodes.get_mut(node).ok_or(Error::UnknownNode)?;

        if let Some(slot) = record.fields.get_mut(field) {
            slot.subscribers.retain(|it| it != subscriber);
        }

        Ok(())
    }

    /// Writer handle of a node, for anon relay.
    pub fn outbox(&self, node: &str) -> Option<W> {
        self.0.read().get(node).map(|record| record.outbox.clone())
    }

    pub fn set_datagram_addr(&self, node: &str, addr: SocketAddr) -> Result<(), Error> {
        let mut nodes = self.0.write();
        let record = nodes.get_mut(node).ok_or(Error::UnknownNode)?;
        record.datagram_addr = Some(addr);
        Ok(())
    }

    pub fn datagram_addr(&self, node: &str) -> Result<SocketAddr, Error> {
        let nodes = self.0.read();
        let record = nodes.get(node).ok_or(Error::UnknownNode)?;
        record.datagram_addr.ok_or(Error::NoDatagramAddr)
    }

    /// Diagnostic snapshot of the registry, shaped
    /// `{ node: { "fields": { field: { "subscribers": [names…] } } } }`.
    /// Payload bytes and writer handles are omitted.
    pub fn snapshot(&self) -> Value {
        let nodes = self.0.read();

        let mut out = Map::new();
        for (name, node) in nodes.iter() {
            let mut fields = Map::new();
            for (field, slot) in node.fields.iter() {
                fields.insert(field.clone(), json!({ "subscribers": slot.subscribers }));
            }

            out.insert(name.clone(), json!({ "fields": fields }));
        }

        Value::Object(out)
    }
}
