mod connection;
mod outbox;

use anyhow::Result;
use service::Registry;
use tokio::net::TcpListener;

use crate::config::Config;

use self::outbox::Outbox;

/// Binds the stream listener and spawns the accept loop.
///
/// Each accepted connection gets its own task; all of them share the
/// registry. There is no explicit graceful shutdown: closing the listener
/// is enough, every per-connection task observes EOF and cleans up after
/// itself.
pub async fn start(config: &Config) -> Result<()> {
    let listener = TcpListener::bind(config.listen.addr()).await?;
    let local_addr = listener.local_addr()?;

    let registry: Registry<Outbox> = Registry::default();

    tokio::spawn(async move {
        while let Ok((socket, address)) = listener.accept().await {
            log::info!("tcp socket accept: addr={address:?}, interface={local_addr:?}");

            // Frames are small and latency-sensitive; disable the Nagle
            // algorithm.
            if let Err(e) = socket.set_nodelay(true) {
                log::error!("tcp socket set nodelay failed!: addr={address}, err={e}");
            }

            tokio::spawn(connection::handle(socket, address, registry.clone()));
        }

        log::error!("tcp server close: interface={local_addr:?}");
    });

    log::info!("broker listening: listen={local_addr}");

    Ok(())
}
