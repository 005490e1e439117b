pub mod config;
pub mod server;

use std::sync::Arc;

use self::config::Config;

/// In order to let the integration tests use the crate directly and start
/// the broker, a function is opened to replace the main function.
pub async fn startup(config: Arc<Config>) -> anyhow::Result<()> {
    server::start(&config).await?;

    // The broker is non-blocking once the listener task is spawned and
    // needs to be kept from exiting immediately.
    std::future::pending::<()>().await;

    Ok(())
}
