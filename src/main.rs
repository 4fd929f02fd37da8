use std::{process::ExitCode, sync::Arc};

use clap::Parser;
use localhome::{
    config::Config,
    discovery::ServiceMap,
    proxy::Proxy,
    tls::{CertIssuer, DevCa},
};
use tokio::net::TcpListener;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> ExitCode {
    let config = Config::parse();
    let level = if config.debug {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };
    tracing_subscriber::fmt().with_max_level(level).init();

    let listener = match TcpListener::bind((config.bind_host.as_str(), config.port)).await {
        Ok(listener) => listener,
        Err(err) => {
            error!("failed to bind {}:{}: {err}", config.bind_host, config.port);
            return ExitCode::FAILURE;
        }
    };

    let issuer: Option<Arc<dyn CertIssuer>> = if config.no_mitm {
        None
    } else {
        match DevCa::load_or_generate(&config.ca_dir()) {
            Ok(ca) => {
                info!(
                    ca = %config.ca_dir().join("ca.crt").display(),
                    "tls interception enabled; trust the ca certificate to use https://<name>/"
                );
                Some(Arc::new(ca))
            }
            Err(err) => {
                warn!("tls interception disabled: {err}");
                None
            }
        }
    };

    let services = Arc::new(ServiceMap::new(config.discovery, config.cache_ttl()));
    let proxy = match Proxy::new(services, issuer, config.port) {
        Ok(proxy) => Arc::new(proxy),
        Err(err) => {
            error!("failed to build outbound http client: {err}");
            return ExitCode::FAILURE;
        }
    };

    info!("listening on {}:{}", config.bind_host, config.port);
    info!("pac file: http://localhost:{}/proxy.pac", config.port);

    tokio::select! {
        res = proxy.run(listener) => {
            if let Err(err) = res {
                error!("listener failed: {err}");
                return ExitCode::FAILURE;
            }
        }
        _ = tokio::signal::ctrl_c() => info!("shutting down"),
    }
    ExitCode::SUCCESS
}
