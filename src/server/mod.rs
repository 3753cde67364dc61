//! Listening socket and accept loop.
//!
//! Connections are served one at a time unless `concurrent` is set: a build
//! blocks the next client, which suits one person pressing "compile". In
//! concurrent mode each connection gets its own task; the handler already
//! owns all per-request state, so nothing else is shared.

use std::{future::Future, net::SocketAddr, sync::Arc};

use anyhow::{anyhow, Context, Result};
use tokio::net::{lookup_host, TcpListener, TcpSocket, TcpStream};
use tracing::{info, warn};

use crate::{config::ServerSettings, handler::Handler, process::CommandRunner};

pub struct Server {
    listener: TcpListener,
    concurrent: bool,
}

impl Server {
    /// Binds with address reuse and the configured backlog. Failure here is
    /// fatal to the process.
    pub async fn bind(settings: &ServerSettings) -> Result<Self> {
        let addr = lookup_host((settings.host.as_str(), settings.port))
            .await
            .with_context(|| format!("resolving {}:{}", settings.host, settings.port))?
            .next()
            .ok_or_else(|| anyhow!("no address for {}:{}", settings.host, settings.port))?;

        let socket = if addr.is_ipv4() { TcpSocket::new_v4()? } else { TcpSocket::new_v6()? };
        socket.set_reuseaddr(true)?;
        socket.bind(addr).with_context(|| format!("binding {addr}"))?;
        let listener = socket
            .listen(settings.backlog)
            .with_context(|| format!("listening on {addr}"))?;

        Ok(Self { listener, concurrent: settings.concurrent })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accepts until `shutdown` resolves, then releases the listener.
    pub async fn serve<R, F>(self, handler: Arc<Handler<R>>, shutdown: F) -> Result<()>
    where
        R: CommandRunner + 'static,
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);
        info!(addr = %self.local_addr()?, concurrent = self.concurrent, "waiting for connections");

        loop {
            let accepted = tokio::select! {
                _ = &mut shutdown => break,
                accepted = self.listener.accept() => accepted,
            };
            let (stream, peer) = match accepted {
                Ok(conn) => conn,
                Err(e) => {
                    warn!(error = %e, "error accepting connection");
                    continue;
                }
            };

            if self.concurrent {
                let handler = Arc::clone(&handler);
                tokio::spawn(async move { serve_connection(&handler, stream, peer).await });
            } else {
                // Abandoning the handler kills its child and removes its scratch dir.
                tokio::select! {
                    _ = &mut shutdown => break,
                    _ = serve_connection(&handler, stream, peer) => {}
                }
            }
        }

        info!("shutting down");
        drop(self.listener);
        info!("server stopped");
        Ok(())
    }
}

async fn serve_connection<R: CommandRunner>(handler: &Handler<R>, stream: TcpStream, peer: SocketAddr) {
    if let Err(e) = stream.set_nodelay(true) {
        warn!(%peer, error = %e, "could not set TCP_NODELAY");
    }
    handler.handle(stream, &peer.to_string()).await;
}
