//! TCP connection layer.
//!
//! Frames are newline-delimited JSON envelopes read and written through a
//! [`LinesCodec`]. Outbound calls open a connection per request; listeners
//! run [`serve`], which spawns one task per accepted connection and hands
//! every decoded frame to a [`FrameHandler`].

use crate::transport::Envelope;
use crate::utils::{ChatError, NetworkConfig, NetworkError, ProtocolError, Result};
use futures::{SinkExt, StreamExt};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::codec::{Framed, LinesCodec};
use tokio_util::sync::CancellationToken;

/// One framed TCP connection
pub struct Connection {
    framed: Framed<TcpStream, LinesCodec>,
    peer: String,
    settings: NetworkConfig,
}

impl Connection {
    /// Dial `address` within the configured connect timeout
    pub async fn connect(address: &str, settings: &NetworkConfig) -> Result<Self> {
        log::debug!("Connecting to {}", address);
        let stream = tokio::time::timeout(settings.connect_timeout(), TcpStream::connect(address))
            .await
            .map_err(|_| NetworkError::Timeout {
                operation: format!("connect to {address}"),
            })?
            .map_err(|e| NetworkError::ConnectionFailed {
                peer: address.to_string(),
                reason: e.to_string(),
            })?;
        log::trace!("Connected to {}", address);
        Ok(Self::from_stream(stream, address.to_string(), settings))
    }

    /// Wrap an accepted stream
    pub fn from_stream(stream: TcpStream, peer: String, settings: &NetworkConfig) -> Self {
        Self {
            framed: Framed::new(stream, LinesCodec::new_with_max_length(settings.max_frame_bytes)),
            peer,
            settings: settings.clone(),
        }
    }

    /// Write one frame
    pub async fn send(&mut self, envelope: &Envelope) -> Result<()> {
        let line = envelope.to_line()?;
        log::trace!("-> {}: {}", self.peer, line);
        self.framed.send(line).await.map_err(|e| self.map_codec_error(e))
    }

    /// Read one frame; `Ok(None)` when the peer closed the connection
    pub async fn recv(&mut self) -> Result<Option<Envelope>> {
        loop {
            match self.framed.next().await {
                None => return Ok(None),
                Some(Err(e)) => return Err(self.map_codec_error(e)),
                Some(Ok(line)) if line.trim().is_empty() => continue,
                Some(Ok(line)) => {
                    log::trace!("<- {}: {}", self.peer, line);
                    return Envelope::from_line(&line).map(Some);
                }
            }
        }
    }

    /// Send `envelope` and wait for the reply frame
    pub async fn request(&mut self, envelope: &Envelope) -> Result<Envelope> {
        self.send(envelope).await?;
        let reply = tokio::time::timeout(self.settings.response_timeout(), self.recv())
            .await
            .map_err(|_| NetworkError::Timeout {
                operation: format!("awaiting reply to '{}' from {}", envelope.command, self.peer),
            })??;
        reply.ok_or_else(|| {
            NetworkError::ConnectionClosed {
                peer: self.peer.clone(),
            }
            .into()
        })
    }

    fn map_codec_error(&self, err: tokio_util::codec::LinesCodecError) -> ChatError {
        match err {
            tokio_util::codec::LinesCodecError::MaxLineLengthExceeded => ProtocolError::FrameTooLarge {
                max: self.settings.max_frame_bytes,
            }
            .into(),
            tokio_util::codec::LinesCodecError::Io(e) => NetworkError::ConnectionFailed {
                peer: self.peer.clone(),
                reason: e.to_string(),
            }
            .into(),
        }
    }
}

/// Open a connection, send one request and return the reply
pub async fn request_once(address: &str, envelope: &Envelope, settings: &NetworkConfig) -> Result<Envelope> {
    let mut connection = Connection::connect(address, settings).await?;
    connection.request(envelope).await
}

/// Open a connection and send one frame without waiting for a reply
pub async fn notify_once(address: &str, envelope: &Envelope, settings: &NetworkConfig) -> Result<()> {
    let mut connection = Connection::connect(address, settings).await?;
    connection.send(envelope).await
}

/// Bind a listener on `host:port`
pub async fn bind(host: &str, port: u16) -> Result<TcpListener> {
    let address = format!("{host}:{port}");
    TcpListener::bind(&address).await.map_err(|e| {
        NetworkError::BindFailed {
            address,
            reason: e.to_string(),
        }
        .into()
    })
}

/// Per-frame request handling for a listener
pub trait FrameHandler: Send + Sync + 'static {
    /// Handle one inbound frame, optionally producing a reply frame
    fn handle(&self, envelope: Envelope, peer: SocketAddr) -> impl Future<Output = Option<Envelope>> + Send;
}

/// Accept connections until `cancel` fires
///
/// Each connection runs in its own task and is cancelled together with the
/// listener. A malformed frame is dropped without closing the connection; a
/// reset or oversize frame ends only that connection.
pub async fn serve<H: FrameHandler>(
    listener: TcpListener,
    handler: Arc<H>,
    settings: NetworkConfig,
    cancel: CancellationToken,
    role: &'static str,
) {
    match listener.local_addr() {
        Ok(addr) => log::info!("{} listening on {}", role, addr),
        Err(e) => log::warn!("{} listening on unknown address: {}", role, e),
    }

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                log::info!("{} stopped", role);
                break;
            }
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    log::debug!("{} accepted connection from {}", role, peer);
                    let connection = Connection::from_stream(stream, peer.to_string(), &settings);
                    tokio::spawn(handle_connection(
                        connection,
                        peer,
                        Arc::clone(&handler),
                        cancel.child_token(),
                        role,
                    ));
                }
                Err(e) => log::warn!("{} failed to accept connection: {}", role, e),
            }
        }
    }
}

async fn handle_connection<H: FrameHandler>(
    mut connection: Connection,
    peer: SocketAddr,
    handler: Arc<H>,
    cancel: CancellationToken,
    role: &'static str,
) {
    loop {
        let frame = tokio::select! {
            _ = cancel.cancelled() => break,
            frame = connection.recv() => frame,
        };

        let envelope = match frame {
            Ok(Some(envelope)) => envelope,
            Ok(None) => {
                log::debug!("{}: {} closed the connection", role, peer);
                break;
            }
            Err(e) if e.is_protocol_fault() && !matches!(e, ChatError::Protocol(ProtocolError::FrameTooLarge { .. })) => {
                log::warn!("{}: dropping frame from {}: {}", role, peer, e);
                continue;
            }
            Err(e) => {
                log::warn!("{}: session with {} aborted: {}", role, peer, e);
                break;
            }
        };

        if let Some(reply) = handler.handle(envelope, peer).await {
            if let Err(e) = connection.send(&reply).await {
                log::warn!("{}: failed to reply to {}: {}", role, peer, e);
                break;
            }
        }
    }
}
