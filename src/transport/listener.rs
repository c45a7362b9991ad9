//! Accepting side of the transport.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::{TcpListener, ToSocketAddrs};
use tracing::debug;

use super::config::ConnectionConfig;
use super::connection::{Connection, Handler};
use crate::core::{Codec, Result};

/// Accepts peers and wraps each socket as a [`Connection`].
///
/// Every accepted connection shares the listener's codec, handler and
/// settings, and runs the same key exchange as the dialing side.
pub struct Listener<C: Codec> {
    inner: TcpListener,
    codec: Arc<C>,
    handler: Arc<dyn Handler<C::Item>>,
    config: ConnectionConfig,
}

impl<C: Codec> Listener<C> {
    /// Bind to `addr`.
    pub async fn bind(
        addr: impl ToSocketAddrs,
        codec: Arc<C>,
        handler: Arc<dyn Handler<C::Item>>,
        config: ConnectionConfig,
    ) -> Result<Self> {
        config.validate()?;
        let inner = TcpListener::bind(addr).await?;
        debug!(local = %inner.local_addr()?, "listening");
        Ok(Self {
            inner,
            codec,
            handler,
            config,
        })
    }

    /// Address the listener is bound to.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.inner.local_addr()?)
    }

    /// Wait for the next peer and complete its key exchange.
    ///
    /// A failed key exchange is returned as an error; the listener itself
    /// stays usable.
    pub async fn accept(&self) -> Result<Connection<C>> {
        let (stream, remote) = self.inner.accept().await?;
        debug!(%remote, "accepted");
        Connection::from_stream(
            stream,
            Arc::clone(&self.codec),
            Arc::clone(&self.handler),
            self.config.clone(),
        )
        .await
    }
}

impl<C: Codec> std::fmt::Debug for Listener<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Listener")
            .field("local", &self.inner.local_addr().ok())
            .finish_non_exhaustive()
    }
}
