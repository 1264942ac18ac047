//! Network Server
//!
//! TCP server accepting frames from peers and handing their bodies to the
//! node's inbound channel.

use bytes::Bytes;
use futures::StreamExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio_util::codec::FramedRead;

use super::frame::FrameCodec;
use crate::error::Result;

/// Network server for mesh communication
pub struct NetworkServer {
    /// Bind address
    bind_address: String,
    /// Largest accepted frame
    max_frame_bytes: usize,
    /// Channel for incoming frames
    incoming_tx: mpsc::Sender<Bytes>,
    /// Shutdown signal
    shutdown: watch::Sender<bool>,
}

impl NetworkServer {
    /// Create a new network server
    pub fn new(bind_address: String, max_frame_bytes: usize, incoming_tx: mpsc::Sender<Bytes>) -> Self {
        let (shutdown_tx, _) = watch::channel(false);

        Self {
            bind_address,
            max_frame_bytes,
            incoming_tx,
            shutdown: shutdown_tx,
        }
    }

    pub fn bind_address(&self) -> &str {
        &self.bind_address
    }

    /// Bind and serve until stopped
    pub async fn start(&self) -> Result<()> {
        let listener = TcpListener::bind(&self.bind_address).await?;
        self.serve(listener).await
    }

    /// Serve an already bound listener until stopped
    pub async fn serve(&self, listener: TcpListener) -> Result<()> {
        tracing::info!("Network server listening on {}", listener.local_addr()?);

        let mut shutdown_rx = self.shutdown.subscribe();

        while !*shutdown_rx.borrow() {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((socket, addr)) => {
                            let peer_addr = addr.to_string();
                            let incoming_tx = self.incoming_tx.clone();
                            let codec = FrameCodec::new(self.max_frame_bytes);
                            let shutdown_rx = self.shutdown.subscribe();

                            tokio::spawn(async move {
                                handle_connection(socket, peer_addr, codec, incoming_tx, shutdown_rx).await;
                            });
                        }
                        Err(e) => {
                            tracing::error!("Accept error: {}", e);
                        }
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        break;
                    }
                }
            }
        }

        tracing::info!("Network server stopped");
        Ok(())
    }

    /// Stop the server
    pub fn stop(&self) {
        self.shutdown.send_replace(true);
    }
}

/// Read frames from one connection until it closes
async fn handle_connection(
    socket: TcpStream,
    peer_addr: String,
    codec: FrameCodec,
    incoming_tx: mpsc::Sender<Bytes>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let mut frames = FramedRead::new(socket, codec);
    tracing::debug!("Accepted connection from {}", peer_addr);

    loop {
        tokio::select! {
            frame = frames.next() => match frame {
                Some(Ok(body)) => {
                    tracing::trace!("Received {} byte frame from {}", body.len(), peer_addr);
                    if incoming_tx.send(body).await.is_err() {
                        break;
                    }
                }
                Some(Err(e)) => {
                    tracing::warn!("Error reading frame from {}: {}", peer_addr, e);
                    break;
                }
                None => break,
            },
            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    break;
                }
            }
        }
    }

    tracing::debug!("Connection from {} closed", peer_addr);
}
