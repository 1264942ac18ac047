//! Network Client
//!
//! Outbound TCP connections to peers, pooled per address, and the
//! [`TcpTransport`] that retries sends with exponential backoff.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::Bytes;
use futures::SinkExt;
use rand::Rng;
use tokio::net::TcpStream;
use tokio::sync::{Mutex, RwLock};
use tokio::time::timeout;
use tokio_util::codec::Framed;

use super::frame::FrameCodec;
use super::{AddressBook, Transport};
use crate::config::TransportConfig;
use crate::error::{Error, Result};
use crate::identifier::NodeIdentifier;

/// Connection pool entry
struct PoolEntry {
    framed: Framed<TcpStream, FrameCodec>,
    last_used: Instant,
}

/// Network client for connecting to peer nodes
pub struct NetworkClient {
    /// Connection pool: address -> connection
    pool: Arc<RwLock<HashMap<String, Arc<Mutex<PoolEntry>>>>>,
    /// Connection timeout
    connect_timeout: Duration,
    /// Largest frame we will send
    max_frame_bytes: usize,
}

impl NetworkClient {
    /// Create a new network client
    pub fn new(connect_timeout: Duration, max_frame_bytes: usize) -> Self {
        Self {
            pool: Arc::new(RwLock::new(HashMap::new())),
            connect_timeout,
            max_frame_bytes,
        }
    }

    /// Send one frame to an address, reusing a pooled connection if possible
    pub async fn send(&self, address: &str, payload: Bytes) -> Result<()> {
        if let Some(entry) = self.get_connection(address).await {
            let mut entry = entry.lock().await;
            match entry.framed.send(payload.clone()).await {
                Ok(()) => {
                    entry.last_used = Instant::now();
                    return Ok(());
                }
                Err(e) => {
                    tracing::debug!("Pooled connection to {} failed: {}", address, e);
                    drop(entry);
                    self.remove_connection(address).await;
                }
            }
        }

        let stream = self.connect(address).await?;
        let mut framed = Framed::new(stream, FrameCodec::new(self.max_frame_bytes));
        framed.send(payload).await?;
        self.store_connection(address.to_string(), framed).await;
        Ok(())
    }

    /// Connect to an address
    async fn connect(&self, address: &str) -> Result<TcpStream> {
        let result = timeout(self.connect_timeout, TcpStream::connect(address)).await;

        match result {
            Ok(Ok(stream)) => {
                stream.set_nodelay(true)?;
                Ok(stream)
            }
            Ok(Err(e)) => Err(Error::ConnectionFailed {
                address: address.to_string(),
                reason: e.to_string(),
            }),
            Err(_) => Err(Error::ConnectionTimeout(address.to_string())),
        }
    }

    /// Get a connection from the pool
    async fn get_connection(&self, address: &str) -> Option<Arc<Mutex<PoolEntry>>> {
        let pool = self.pool.read().await;
        pool.get(address).cloned()
    }

    /// Store a connection in the pool
    async fn store_connection(&self, address: String, framed: Framed<TcpStream, FrameCodec>) {
        let mut pool = self.pool.write().await;
        pool.insert(
            address,
            Arc::new(Mutex::new(PoolEntry {
                framed,
                last_used: Instant::now(),
            })),
        );
    }

    /// Remove a connection from the pool
    async fn remove_connection(&self, address: &str) {
        let mut pool = self.pool.write().await;
        pool.remove(address);
    }

    /// Clean up stale connections
    pub async fn cleanup_stale(&self, max_idle: Duration) {
        let mut pool = self.pool.write().await;
        let now = Instant::now();

        pool.retain(|addr, entry| {
            if let Ok(e) = entry.try_lock() {
                if now.duration_since(e.last_used) > max_idle {
                    tracing::debug!("Removing stale connection to {}", addr);
                    return false;
                }
            }
            true
        });
    }

    /// Close all connections
    pub async fn close_all(&self) {
        let mut pool = self.pool.write().await;
        pool.clear();
    }

    /// Get connection count
    pub async fn connection_count(&self) -> usize {
        self.pool.read().await.len()
    }
}

/// TCP transport with retry and backoff
pub struct TcpTransport {
    client: NetworkClient,
    addresses: AddressBook,
    config: TransportConfig,
}

impl TcpTransport {
    pub fn new(config: TransportConfig, addresses: AddressBook) -> Self {
        Self {
            client: NetworkClient::new(config.connect_timeout(), config.max_frame_bytes),
            addresses,
            config,
        }
    }

    pub fn client(&self) -> &NetworkClient {
        &self.client
    }

    /// Backoff before the next attempt, with up to 25% jitter
    fn delay_for(&self, attempt: u32) -> Duration {
        let base = self.config.backoff_for_attempt(attempt);
        let jitter_ms = base.as_millis() as u64 / 4;
        if jitter_ms == 0 {
            return base;
        }
        base + Duration::from_millis(rand::thread_rng().gen_range(0..=jitter_ms))
    }
}

#[async_trait]
impl Transport for TcpTransport {
    async fn send(&self, peer: &NodeIdentifier, payload: Bytes) -> Result<()> {
        let address = self.addresses.address_for(peer)?;
        let attempts = self.config.max_attempts.max(1);
        let mut last_error = None;

        for attempt in 1..=attempts {
            match self.client.send(&address, payload.clone()).await {
                Ok(()) => return Ok(()),
                Err(e) if e.is_retryable() || matches!(e, Error::Io(_)) => {
                    tracing::debug!(
                        "Send to {} ({}) failed on attempt {}/{}: {}",
                        peer,
                        address,
                        attempt,
                        attempts,
                        e
                    );
                    last_error = Some(e);
                    if attempt < attempts {
                        tokio::time::sleep(self.delay_for(attempt)).await;
                    }
                }
                Err(e) => {
                    last_error = Some(e);
                    break;
                }
            }
        }

        Err(Error::PeerUnreachable {
            peer: peer.to_string(),
            reason: last_error
                .map(|e| e.to_string())
                .unwrap_or_else(|| "no attempt made".into()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ResolverConfig;
    use crate::identifier::IdentifierResolver;

    #[tokio::test]
    async fn test_client_creation() {
        let client = NetworkClient::new(Duration::from_secs(5), 1024);
        assert_eq!(client.connection_count().await, 0);
    }

    #[tokio::test]
    async fn test_connection_failure() {
        let client = NetworkClient::new(Duration::from_millis(100), 1024);
        let result = client.send("127.0.0.1:1", Bytes::from_static(b"x")).await;
        assert!(result.is_err());
        assert_eq!(client.connection_count().await, 0);
    }

    #[tokio::test]
    async fn test_transport_gives_up_after_attempts() {
        let config = TransportConfig {
            connect_timeout_ms: 100,
            max_attempts: 2,
            initial_backoff_ms: 1,
            max_backoff_ms: 2,
            ..TransportConfig::default()
        };
        let resolver = IdentifierResolver::new(&ResolverConfig::default());
        let peer = resolver.guess("b.example").unwrap();
        let mut book = AddressBook::new(config.default_port);
        book.insert(peer.clone(), "127.0.0.1:1");

        let transport = TcpTransport::new(config, book);
        let err = transport.send(&peer, Bytes::from_static(b"x")).await.unwrap_err();
        assert!(err.is_peer_failure());
    }
}
