//! Inbound Layer
//!
//! Each listener accepts on a configured address and yields
//! `(metadata, client_stream)` to the dispatcher. The shims here only do
//! enough protocol to learn the target address; everything after the
//! handshake is a raw byte stream.

mod http;
mod socks;

pub use http::handshake as http_handshake;
pub use socks::handshake as socks_handshake;

use std::sync::Arc;

use tracing::{debug, error, warn};

use crate::common::{Address, Metadata, Result, Stream};
use crate::transport::{Listener, TcpTransport, Transport};
use crate::tunnel::Dispatcher;

/// Which shim an inbound listener speaks
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InboundProtocol {
    /// HTTP proxy: CONNECT tunnels and plain proxy-form requests
    Http,
    /// SOCKS4 and SOCKS5, sniffed from the version byte
    Socks,
}

/// One configured inbound listener
pub struct Inbound {
    pub tag: String,
    pub protocol: InboundProtocol,
    pub listen: Address,
}

impl Inbound {
    pub fn new(tag: impl Into<String>, protocol: InboundProtocol, listen: Address) -> Self {
        Self {
            tag: tag.into(),
            protocol,
            listen,
        }
    }

    /// Run the protocol handshake, producing the classification metadata
    pub async fn accept(&self, stream: Stream, source: &Address) -> Result<(Metadata, Stream)> {
        let (mut metadata, stream) = match self.protocol {
            InboundProtocol::Http => http::handshake(stream).await?,
            InboundProtocol::Socks => socks::handshake(stream).await?,
        };
        if let Address::Socket(addr) = source {
            metadata.src_ip = Some(addr.ip());
            metadata.src_port = addr.port();
        }
        Ok((metadata, stream))
    }
}

/// Bind an inbound listener and spawn its accept loop.
///
/// Binding happens before the task starts, so a bind failure surfaces to
/// the caller instead of dying inside a detached task.
pub async fn spawn_listener(
    inbound: Arc<Inbound>,
    dispatcher: Arc<Dispatcher>,
    shutdown_rx: tokio::sync::broadcast::Receiver<()>,
) -> Result<tokio::task::JoinHandle<()>> {
    let transport = TcpTransport::new();
    let listener: Box<dyn Listener> = transport.bind(&inbound.listen).await?;
    tracing::info!("[{}] listening on {}", inbound.tag, inbound.listen);
    Ok(tokio::spawn(accept_loop(
        inbound,
        dispatcher,
        listener,
        shutdown_rx,
    )))
}

/// Each connection is handled in its own task; the loop ends on shutdown
async fn accept_loop(
    inbound: Arc<Inbound>,
    dispatcher: Arc<Dispatcher>,
    listener: Box<dyn Listener>,
    mut shutdown_rx: tokio::sync::broadcast::Receiver<()>,
) {
    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, source)) => {
                        debug!("[{}] accepted {}", inbound.tag, source);
                        let inbound = Arc::clone(&inbound);
                        let dispatcher = Arc::clone(&dispatcher);
                        tokio::spawn(async move {
                            if let Err(e) = serve_connection(inbound, dispatcher, stream, source).await {
                                debug!("connection error: {}", e);
                            }
                        });
                    }
                    Err(e) => {
                        error!("[{}] accept error: {}", inbound.tag, e);
                    }
                }
            }
            _ = shutdown_rx.recv() => {
                warn!("[{}] shutting down", inbound.tag);
                break;
            }
        }
    }
}

async fn serve_connection(
    inbound: Arc<Inbound>,
    dispatcher: Arc<Dispatcher>,
    stream: Stream,
    source: Address,
) -> Result<()> {
    let (metadata, stream) = inbound.accept(stream, &source).await?;
    dispatcher.dispatch(metadata, stream).await
}
