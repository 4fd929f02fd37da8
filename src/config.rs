//! Configuration surface: flags with environment fallbacks.

use std::{path::PathBuf, time::Duration};

use clap::Parser;

use crate::discovery::DiscoveryCommand;

/// `NAME=myapp` your server, then open `http://myapp.localhost:<port>/`.
///
/// Install the PAC file (served at `/proxy.pac`) to use bare
/// `http://myapp/` and, with the development CA trusted,
/// `https://myapp/`.
#[derive(Debug, Clone, Parser)]
#[command(name = "localhome", version)]
pub struct Config {
    /// Port to listen on.
    #[arg(long, env = "PORT", default_value_t = 9090)]
    pub port: u16,

    /// Address to bind the listener to.
    #[arg(long, env = "BIND_HOST", default_value = "127.0.0.1")]
    pub bind_host: String,

    /// Verbose discovery logging (`DEBUG=1`).
    #[arg(long, env = "DEBUG", value_parser = clap::builder::FalseyValueParser::new())]
    pub debug: bool,

    /// Seconds a discovery scan stays fresh.
    #[arg(long, default_value_t = 5)]
    pub cache_ttl: u64,

    /// Tool used to enumerate listening sockets.
    #[arg(long, value_enum, default_value_t = DiscoveryCommand::default())]
    pub discovery: DiscoveryCommand,

    /// Disable TLS interception for CONNECT-to-443 tunnels.
    #[arg(long)]
    pub no_mitm: bool,

    /// Directory holding the development CA (created on first use).
    #[arg(long)]
    pub ca_dir: Option<PathBuf>,
}

impl Config {
    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl)
    }

    /// The CA directory: `--ca-dir` or `~/.localhome/ca`.
    pub fn ca_dir(&self) -> PathBuf {
        if let Some(dir) = &self.ca_dir {
            return dir.clone();
        }
        std::env::var_os("HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".localhome")
            .join("ca")
    }
}
