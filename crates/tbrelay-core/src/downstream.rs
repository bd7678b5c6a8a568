//! Downstream WebSocket server.
//!
//! Accepts subscriber connections (plain or TLS), registers each with the
//! relay through a [`RelayHandle`], and pushes the frames it is handed in
//! order. Anything a subscriber sends is logged and otherwise ignored.

use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_rustls::TlsAcceptor;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::broadcast::{ConnectionHandle, ConnectionId, Frame};
use crate::error::CoreError;
use crate::relay::RelayHandle;

pub struct DownstreamServer {
    listener: TcpListener,
    tls: Option<TlsAcceptor>,
    relay: RelayHandle,
    queue_capacity: usize,
    next_id: u64,
}

impl DownstreamServer {
    pub async fn bind(
        addr: SocketAddr,
        tls: Option<TlsAcceptor>,
        relay: RelayHandle,
        queue_capacity: usize,
    ) -> Result<Self, CoreError> {
        let listener = TcpListener::bind(addr).await.map_err(|source| CoreError::Bind {
            addr: addr.to_string(),
            source,
        })?;

        Ok(Self {
            listener,
            tls,
            relay,
            queue_capacity: queue_capacity.max(1),
            next_id: 0,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, CoreError> {
        self.listener.local_addr().map_err(|e| CoreError::Internal(format!("local_addr: {e}")))
    }

    pub fn is_tls(&self) -> bool {
        self.tls.is_some()
    }

    /// Accept subscribers until cancelled. Open connections are closed
    /// when `cancel` fires.
    pub async fn serve(mut self, cancel: CancellationToken) -> Result<(), CoreError> {
        let addr = self.local_addr()?;
        info!(%addr, tls = self.is_tls(), "downstream server listening");

        loop {
            tokio::select! {
                biased;
                () = cancel.cancelled() => break,
                accepted = self.listener.accept() => {
                    let (stream, peer) = match accepted {
                        Ok(pair) => pair,
                        Err(e) => {
                            warn!(error = %e, "downstream accept failed");
                            continue;
                        }
                    };

                    self.next_id += 1;
                    let connection = Connection {
                        id: ConnectionId::new(self.next_id),
                        peer,
                        relay: self.relay.clone(),
                        queue_capacity: self.queue_capacity,
                        cancel: cancel.child_token(),
                    };
                    let tls = self.tls.clone();
                    tokio::spawn(async move {
                        let id = connection.id;
                        if let Err(e) = connection.handle(stream, tls).await {
                            warn!(%peer, conn = %id, error = %e, "subscriber connection failed");
                        }
                    });
                }
            }
        }

        debug!("downstream server stopped");
        Ok(())
    }
}

/// One accepted subscriber.
struct Connection {
    id: ConnectionId,
    peer: SocketAddr,
    relay: RelayHandle,
    queue_capacity: usize,
    cancel: CancellationToken,
}

impl Connection {
    async fn handle(self, stream: TcpStream, tls: Option<TlsAcceptor>) -> Result<(), CoreError> {
        if let Some(acceptor) = tls {
            let tls_stream = acceptor.accept(stream).await.map_err(|e| CoreError::Tls {
                message: format!("handshake with {} failed: {e}", self.peer),
            })?;
            return self.serve_socket(tls_stream).await;
        }
        self.serve_socket(stream).await
    }

    async fn serve_socket<S>(self, stream: S) -> Result<(), CoreError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let ws_stream = tokio_tungstenite::accept_async(stream)
            .await
            .map_err(|e| CoreError::ConnectionFailed {
                url: self.peer.to_string(),
                reason: format!("WebSocket handshake failed: {e}"),
            })?;
        info!(peer = %self.peer, conn = %self.id, "subscriber connected");

        let (mut writer, mut reader) = ws_stream.split();
        let (tx, mut rx) = mpsc::channel::<Frame>(self.queue_capacity);
        self.relay.join(ConnectionHandle::new(self.id, tx)).await?;

        loop {
            tokio::select! {
                biased;
                () = self.cancel.cancelled() => {
                    let _ = writer.send(Message::Close(None)).await;
                    break;
                }
                frame = rx.recv() => {
                    let Some(frame) = frame else { break };
                    if let Err(e) = writer.send(Message::text(frame.to_string())).await {
                        debug!(conn = %self.id, error = %e, "subscriber write failed");
                        break;
                    }
                }
                message = reader.next() => match message {
                    Some(Ok(Message::Text(text))) => {
                        debug!(conn = %self.id, frame = %text.as_str(), "subscriber message ignored");
                    }
                    Some(Ok(Message::Close(frame))) => {
                        debug!(conn = %self.id, ?frame, "subscriber closed websocket");
                        break;
                    }
                    Some(Ok(_)) => trace!(conn = %self.id, "subscriber control frame"),
                    Some(Err(e)) => {
                        debug!(conn = %self.id, error = %e, "subscriber websocket error");
                        break;
                    }
                    None => break,
                }
            }
        }

        // The relay may already be gone during shutdown.
        let _ = self.relay.leave(self.id).await;
        info!(peer = %self.peer, conn = %self.id, "subscriber disconnected");
        Ok(())
    }
}

/// Build a TLS acceptor from PEM certificate chain and private key files.
pub fn load_tls_acceptor(cert_path: &Path, key_path: &Path) -> Result<TlsAcceptor, CoreError> {
    let tls_err = |message: String| CoreError::Tls { message };

    let cert_file = std::fs::File::open(cert_path)
        .map_err(|e| tls_err(format!("open cert {}: {e}", cert_path.display())))?;
    let key_file = std::fs::File::open(key_path)
        .map_err(|e| tls_err(format!("open key {}: {e}", key_path.display())))?;

    let mut cert_reader = std::io::BufReader::new(cert_file);
    let mut key_reader = std::io::BufReader::new(key_file);

    let certs = rustls_pemfile::certs(&mut cert_reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| tls_err(format!("read certs: {e}")))?;
    if certs.is_empty() {
        return Err(tls_err(format!("no certificates in {}", cert_path.display())));
    }
    let key = rustls_pemfile::private_key(&mut key_reader)
        .map_err(|e| tls_err(format!("read private key: {e}")))?
        .ok_or_else(|| tls_err(format!("no private key in {}", key_path.display())))?;

    let config =
        rustls::ServerConfig::builder_with_provider(Arc::new(rustls::crypto::ring::default_provider()))
            .with_safe_default_protocol_versions()
            .map_err(|e| tls_err(format!("protocol versions: {e}")))?
            .with_no_client_auth()
            .with_single_cert(certs, key)
            .map_err(|e| tls_err(format!("invalid cert or key: {e}")))?;
    Ok(TlsAcceptor::from(Arc::new(config)))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::io::Write;

    use super::*;

    #[test]
    fn missing_cert_file_is_tls_error() {
        let result = load_tls_acceptor(Path::new("/nonexistent/cert.pem"), Path::new("/nonexistent/key.pem"));
        assert!(matches!(result, Err(CoreError::Tls { .. })));
    }

    #[test]
    fn pem_without_certificates_is_rejected() {
        let mut cert = tempfile::NamedTempFile::new().unwrap();
        writeln!(cert, "not a pem file").unwrap();
        let key = tempfile::NamedTempFile::new().unwrap();

        let Err(CoreError::Tls { message }) = load_tls_acceptor(cert.path(), key.path()) else {
            panic!("expected a TLS error");
        };
        assert!(message.contains("no certificates"), "{message}");
    }

    #[tokio::test]
    async fn bind_reports_ephemeral_port() {
        let (handle, _rx) = crate::relay::Relay::command_channel();
        let server = DownstreamServer::bind("127.0.0.1:0".parse().unwrap(), None, handle, 8)
            .await
            .unwrap();
        assert_ne!(server.local_addr().unwrap().port(), 0);
        assert!(!server.is_tls());
    }
}
