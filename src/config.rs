use std::{
    fs::read_to_string,
    net::{IpAddr, SocketAddr},
};

use anyhow::Result;
use clap::{Parser, Subcommand};
use serde::Deserialize;

/// Stream listener binding.
#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
pub struct Listen {
    #[serde(default = "Listen::host")]
    pub host: IpAddr,
    #[serde(default = "Listen::port")]
    pub port: u16,
}

impl Listen {
    pub fn addr(&self) -> SocketAddr {
        SocketAddr::new(self.host, self.port)
    }
}

impl Listen {
    fn host() -> IpAddr {
        [127, 0, 0, 1].into()
    }

    fn port() -> u16 {
        3000
    }
}

impl Default for Listen {
    fn default() -> Self {
        Self {
            host: Self::host(),
            port: Self::port(),
        }
    }
}

#[derive(Deserialize, Debug, Clone, Copy)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl Default for LogLevel {
    fn default() -> Self {
        Self::Info
    }
}

impl LogLevel {
    pub fn as_level(&self) -> log::Level {
        match *self {
            Self::Error => log::Level::Error,
            Self::Debug => log::Level::Debug,
            Self::Trace => log::Level::Trace,
            Self::Warn => log::Level::Warn,
            Self::Info => log::Level::Info,
        }
    }
}

#[derive(Deserialize, Debug, Default, Clone)]
#[serde(rename_all = "kebab-case")]
pub struct Log {
    ///
    /// log level
    ///
    /// An enum representing the available verbosity levels of the logger.
    ///
    #[serde(default)]
    pub level: LogLevel,
}

#[derive(Deserialize, Debug, Default, Clone)]
#[serde(rename_all = "kebab-case")]
pub struct Config {
    #[serde(default)]
    pub listen: Listen,
    #[serde(default)]
    pub log: Log,
}

#[derive(Parser, Debug)]
#[command(
    about = env!("CARGO_PKG_DESCRIPTION"),
    version = env!("CARGO_PKG_VERSION"),
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Start the broker.
    Server {
        ///
        /// Address to bind the stream listener on.
        ///
        #[arg(long)]
        host: Option<IpAddr>,
        ///
        /// Port to bind the stream listener on.
        ///
        #[arg(long)]
        port: Option<u16>,
        ///
        /// Optional configuration file; flags override its values.
        ///
        /// Example: minibus-server server --config /etc/minibus/config.json5
        ///
        #[arg(long, short)]
        config: Option<String>,
    },
}

impl Config {
    ///
    /// Load configure from config file and command line parameters.
    ///
    /// If a configuration file path is specified the configuration is read
    /// from it, otherwise the defaults are used; `--host` and `--port`
    /// override either.
    ///
    pub fn load() -> Result<Self> {
        let Cli {
            command: Command::Server { host, port, config },
        } = Cli::parse();

        let mut config = match config {
            Some(path) => serde_json5::from_str::<Self>(&read_to_string(&path)?)?,
            None => Self::default(),
        };

        if let Some(host) = host {
            config.listen.host = host;
        }

        if let Some(port) = port {
            config.listen.port = port;
        }

        Ok(config)
    }
}
