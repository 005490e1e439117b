use std::{net::SocketAddr, sync::Arc, time::Duration};

use anyhow::{Result, ensure};
use bytes::BytesMut;
use codec::{
    frame,
    message::{Request, Response},
};
use minibus_server::config::{Config, Listen};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::TcpStream,
    time::sleep,
};

/// Boots a broker on the given port and waits until it accepts traffic.
///
/// Each test gets its own port so the scenarios can run in parallel
/// within one process.
pub async fn create_broker(port: u16) -> SocketAddr {
    let config = Config {
        listen: Listen {
            host: [127, 0, 0, 1].into(),
            port,
        },
        log: Default::default(),
    };

    tokio::spawn(async move {
        minibus_server::startup(Arc::new(config)).await.unwrap();
    });

    let addr = SocketAddr::from(([127, 0, 0, 1], port));
    for _ in 0..100 {
        if TcpStream::connect(addr).await.is_ok() {
            break;
        }

        sleep(Duration::from_millis(25)).await;
    }

    addr
}

/// Polls `probe` until it yields a value or the deadline passes.
pub async fn wait_for<T>(mut probe: impl FnMut() -> Option<T>) -> T {
    for _ in 0..200 {
        if let Some(value) = probe() {
            return value;
        }

        sleep(Duration::from_millis(25)).await;
    }

    panic!("condition not met within deadline");
}

/// A protocol-level client: speaks raw frames and does nothing on its own,
/// so tests can drive exact sequences (or leave steps out, like the
/// datagram endpoint advertisement).
pub struct RawClient {
    stream: TcpStream,
    buffer: BytesMut,
}

impl RawClient {
    /// Connects without authenticating; the broker's REQUEST_AUTH is
    /// consumed.
    pub async fn open(server: SocketAddr) -> Result<Self> {
        let stream = TcpStream::connect(server).await?;
        let mut this = Self {
            stream,
            buffer: BytesMut::new(),
        };

        ensure!(matches!(this.read().await?, Response::RequestAuth));
        Ok(this)
    }

    /// Connects and claims `name`. No datagram endpoint is advertised.
    pub async fn connect(server: SocketAddr, name: &str) -> Result<Self> {
        let mut this = Self::open(server).await?;
        this.send(&Request::SendAuth {
            name: name.to_owned(),
        })
        .await?;

        Ok(this)
    }

    pub async fn send(&mut self, request: &Request) -> Result<()> {
        let mut body = BytesMut::new();
        request.encode(&mut body)?;

        let mut wire = BytesMut::new();
        frame::encode(&body, &mut wire)?;

        self.stream.write_all(&wire).await?;
        Ok(())
    }

    pub async fn read(&mut self) -> Result<Response> {
        loop {
            if let Some(body) = frame::split(&mut self.buffer)? {
                return Ok(Response::decode(&body)?);
            }

            let size = self.stream.read_buf(&mut self.buffer).await?;
            ensure!(size > 0, "stream closed");
        }
    }

    /// Round-trips a registry snapshot, which doubles as a barrier: every
    /// frame this client sent before it has been dispatched once the
    /// reply arrives.
    pub async fn snapshot(&mut self) -> Result<serde_json::Value> {
        self.send(&Request::Rosstat).await?;
        match self.read().await? {
            Response::Rosstat { json } => Ok(serde_json::from_str(&json)?),
            other => anyhow::bail!("expected a snapshot, got {other:?}"),
        }
    }

    /// Polls the broker until `node` has an advertised datagram endpoint.
    pub async fn wait_endpoint(&mut self, node: &str) -> Result<()> {
        for _ in 0..200 {
            self.send(&Request::GetDatagramAddr {
                node: node.to_owned(),
            })
            .await?;

            match self.read().await? {
                Response::DatagramAddr { .. } => return Ok(()),
                Response::Error { .. } => sleep(Duration::from_millis(25)).await,
                other => anyhow::bail!("unexpected reply: {other:?}"),
            }
        }

        anyhow::bail!("endpoint for {node:?} never advertised")
    }

    /// Polls the registry until `node` shows up.
    pub async fn wait_registered(&mut self, node: &str) -> Result<()> {
        for _ in 0..200 {
            if self.snapshot().await?.get(node).is_some() {
                return Ok(());
            }

            sleep(Duration::from_millis(25)).await;
        }

        anyhow::bail!("node {node:?} never registered")
    }
}
