//! A developer-workstation proxy that maps bare and `*.localhost` names
//! to whichever local port a matching process listens on.
//!
//! Start any server with `NAME=<label>` in its environment; the proxy
//! discovers it and routes `http://<label>.localhost:<port>/` requests
//! (and, via the served PAC file, bare `http://<label>/`, CONNECT
//! tunnels, and TLS-intercepted `https://<label>/`) to that backend.

pub mod config;
pub mod dashboard;
pub mod discovery;
pub mod error;
pub mod fetch;
pub mod mitm;
pub mod parse;
pub mod proxy;
pub mod tls;
pub mod tunnel;

pub use config::Config;
pub use discovery::{DiscoveryCommand, ServiceEntry, ServiceMap};
pub use error::ProxyError;
pub use proxy::Proxy;
pub use tls::{CertIssuer, DevCa};

/// How much data to read for a request or response head before it is
/// considered invalid. 8 KiB should be plenty.
pub const HEADER_SECTION_MAX_LENGTH: usize = 8192;
