//! TLS-terminating listener the client-facing [`crate::http`] router is served behind.
//!
//! Mirrors the teacher's `GatewayListener`/`Task` pairing, simplified to the one kind of
//! listener this crate needs (a single TLS+HTTP/WebSocket socket — no plain-TCP or
//! plain-HTTP variants).

use crate::config::Conf;

use anyhow::Context as _;
use jimm_gateway_task::{ShutdownSignal, Task};
use std::io;
use std::net::SocketAddr;
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::server::TlsStream;
use tokio_rustls::TlsAcceptor;

/// A bound TCP socket paired with the TLS acceptor client connections are terminated
/// through. Implements [`axum::serve::Listener`] so it plugs directly into `axum::serve`.
pub struct GatewayListener {
    tcp: TcpListener,
    tls_acceptor: TlsAcceptor,
    local_addr: SocketAddr,
}

impl GatewayListener {
    pub async fn init_and_bind(conf: &Conf, tls_acceptor: TlsAcceptor) -> anyhow::Result<Self> {
        let tcp = TcpListener::bind(conf.bind_address)
            .await
            .with_context(|| format!("failed to bind {}", conf.bind_address))?;
        let local_addr = tcp.local_addr().context("failed to read local address")?;

        info!(%local_addr, "listening");

        Ok(Self { tcp, tls_acceptor, local_addr })
    }

    pub fn addr(&self) -> SocketAddr {
        self.local_addr
    }
}

impl axum::serve::Listener for GatewayListener {
    type Io = TlsStream<TcpStream>;
    type Addr = SocketAddr;

    async fn accept(&mut self) -> (Self::Io, Self::Addr) {
        loop {
            let (tcp, peer_addr) = match self.tcp.accept().await {
                Ok(accepted) => accepted,
                Err(error) => {
                    warn!(%error, "failed to accept TCP connection");
                    continue;
                }
            };
            tcp.set_nodelay(true).ok();

            match self.tls_acceptor.accept(tcp).await {
                Ok(tls) => return (tls, peer_addr),
                Err(error) => {
                    warn!(%error, %peer_addr, "TLS handshake failed");
                    continue;
                }
            }
        }
    }

    fn local_addr(&self) -> io::Result<Self::Addr> {
        Ok(self.local_addr)
    }
}

/// Drives `axum::serve` to completion, stopping gracefully once `shutdown_signal` fires.
pub struct ListenerTask {
    listener: GatewayListener,
    router: axum::Router,
}

impl ListenerTask {
    pub fn new(listener: GatewayListener, router: axum::Router) -> Self {
        Self { listener, router }
    }
}

#[async_trait::async_trait]
impl Task for ListenerTask {
    type Output = anyhow::Result<()>;

    const NAME: &'static str = "https listener";

    async fn run(self, mut shutdown_signal: ShutdownSignal) -> Self::Output {
        axum::serve(self.listener, self.router.into_make_service())
            .with_graceful_shutdown(async move { shutdown_signal.wait().await })
            .await
            .context("listener loop failed")
    }
}
