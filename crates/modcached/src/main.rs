use camino::Utf8PathBuf;
use eyre::{eyre, Result};
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use std::convert::Infallible;
use std::sync::Arc;
use tokio::net::TcpListener;

use modcached::server::ProxyServer;

#[derive(Debug)]
struct Args {
    /// Listen address (host:port).
    addr: String,

    /// URL prefix stripped from every incoming request.
    prefix: String,
}

impl Args {
    /// `modcached <address>[/<prefix>]`
    fn from_argv() -> Result<Self> {
        let mut argv = std::env::args().skip(1);
        let addr = argv
            .next()
            .ok_or_else(|| eyre!("usage: modcached <address>[/<prefix>]"))?;
        if argv.next().is_some() {
            return Err(eyre!("usage: modcached <address>[/<prefix>]"));
        }
        let (addr, prefix) = match addr.rfind('/') {
            Some(idx) => (addr[..idx].to_string(), addr[idx..].to_string()),
            None => (addr, String::new()),
        };
        Ok(Args { addr, prefix })
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("modcached=info")),
        )
        .init();

    let args = Args::from_argv()?;

    // The cache lives in the current directory; one daemon owns it.
    let server = Arc::new(ProxyServer::new(&args.prefix, Utf8PathBuf::from("."))?);

    let listener = TcpListener::bind(&args.addr).await?;
    tracing::info!(
        "listening on {}, prefix {}",
        listener.local_addr()?,
        server.prefix()
    );

    loop {
        let (socket, peer_addr) = listener.accept().await?;
        let server = server.clone();

        tokio::spawn(async move {
            tracing::debug!("new connection from {}", peer_addr);

            let io = TokioIo::new(socket);
            let service = service_fn(move |req| {
                let server = server.clone();
                async move { Ok::<_, Infallible>(server.handle(req).await) }
            });

            if let Err(err) = hyper::server::conn::http1::Builder::new()
                .serve_connection(io, service)
                .await
            {
                tracing::debug!("connection error from {}: {}", peer_addr, err);
            }

            tracing::debug!("connection from {} closed", peer_addr);
        });
    }
}
