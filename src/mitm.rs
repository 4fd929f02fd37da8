//! TLS-MITM subsystem: a registry of per-hostname TLS-terminating virtual
//! servers, created lazily and kept for the life of the process.
//!
//! A CONNECT-to-443 tunnel is bridged to the hostname's virtual server,
//! which terminates TLS with a locally issued leaf certificate and serves
//! HTTP/1.1 (with WebSocket upgrades) against the plain-HTTP backend.

use std::{collections::HashMap, sync::Arc};

use tokio::{net::TcpListener, sync::Mutex};
use tokio_rustls::TlsAcceptor;
use tracing::debug;

use crate::{
    discovery::ServiceMap,
    error::ProxyError,
    tls::{CertIssuer, server_config},
};

mod vserver;

/// State every virtual server needs to serve requests.
#[derive(Clone)]
pub struct MitmContext {
    pub services: Arc<ServiceMap>,
    pub client: reqwest::Client,
    pub listen_port: u16,
}

/// One TLS virtual server bound on an ephemeral loopback port.
pub struct VirtualServer {
    pub port: u16,
}

/// Registry of virtual servers, keyed by hostname.
///
/// Creation is single-flight (the lock is held across issuance and bind)
/// and entries are never removed; the set is bounded by the number of
/// distinct hostnames seen.
pub struct MitmRegistry {
    issuer: Arc<dyn CertIssuer>,
    ctx: MitmContext,
    servers: Mutex<HashMap<String, Arc<VirtualServer>>>,
}

impl MitmRegistry {
    pub fn new(issuer: Arc<dyn CertIssuer>, ctx: MitmContext) -> Self {
        Self {
            issuer,
            ctx,
            servers: Mutex::new(HashMap::new()),
        }
    }

    /// Returns the virtual server for `hostname`, creating it on first use.
    pub async fn get_or_create(&self, hostname: &str) -> Result<Arc<VirtualServer>, ProxyError> {
        let mut servers = self.servers.lock().await;
        if let Some(server) = servers.get(hostname) {
            return Ok(server.clone());
        }
        let server = Arc::new(self.spawn_virtual_server(hostname).await?);
        servers.insert(hostname.to_string(), server.clone());
        Ok(server)
    }

    async fn spawn_virtual_server(&self, hostname: &str) -> Result<VirtualServer, ProxyError> {
        let issued = self.issuer.issue(hostname)?;
        let acceptor = TlsAcceptor::from(server_config(issued)?);
        let listener = TcpListener::bind(("127.0.0.1", 0)).await?;
        let port = listener.local_addr()?.port();
        debug!(%hostname, port, "starting tls virtual server");

        let hostname = hostname.to_string();
        let ctx = self.ctx.clone();
        tokio::spawn(vserver::run(listener, acceptor, hostname, ctx));
        Ok(VirtualServer { port })
    }
}
