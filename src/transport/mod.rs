//! Secured datagram transport.
//!
//! One UDP socket per listener, read concurrently by `threads` reader tasks;
//! the OS balances incoming datagrams across the blocked reads. Each read
//! decrypts and decodes the datagram, then hands the message to the
//! dispatcher queue without blocking: when the queue is full the message is
//! dropped and counted. The sender path is fire-and-forget; loss is tolerated
//! by the manager's periodic re-issue of monitor requests.

pub mod crypto;

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use anyhow::Context;
use rsa::RsaPublicKey;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use crate::protocol::{Message, ProtocolError};

pub use crypto::MessageSecurity;

/// Monotonic transport counters, shared by all reader tasks and the sender.
#[derive(Debug, Default)]
pub struct TransportStats {
    received: AtomicU64,
    sent: AtomicU64,
    decrypt_failures: AtomicU64,
    oversized: AtomicU64,
    malformed: AtomicU64,
    backlog_dropped: AtomicU64,
}

/// Point-in-time copy of [`TransportStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransportSnapshot {
    pub received: u64,
    pub sent: u64,
    pub decrypt_failures: u64,
    pub oversized: u64,
    pub malformed: u64,
    pub backlog_dropped: u64,
}

impl TransportStats {
    pub fn snapshot(&self) -> TransportSnapshot {
        TransportSnapshot {
            received: self.received.load(Ordering::Relaxed),
            sent: self.sent.load(Ordering::Relaxed),
            decrypt_failures: self.decrypt_failures.load(Ordering::Relaxed),
            oversized: self.oversized.load(Ordering::Relaxed),
            malformed: self.malformed.load(Ordering::Relaxed),
            backlog_dropped: self.backlog_dropped.load(Ordering::Relaxed),
        }
    }

    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// The UDP listener: binds one socket and fans reads out over reader tasks.
pub struct UdpListener {
    socket: Arc<UdpSocket>,
    threads: usize,
    max_message_size: usize,
    security: Arc<MessageSecurity>,
    stats: Arc<TransportStats>,
}

impl UdpListener {
    pub async fn bind(
        addr: SocketAddr,
        threads: usize,
        max_message_size: usize,
        security: MessageSecurity,
    ) -> anyhow::Result<Self> {
        let socket = UdpSocket::bind(addr)
            .await
            .with_context(|| format!("binding udp listener on {addr}"))?;

        debug!(
            "udp listener bound on {} ({} reader threads, encryption {})",
            socket.local_addr()?,
            threads,
            if security.is_enabled() { "on" } else { "off" }
        );

        Ok(Self {
            socket: Arc::new(socket),
            threads: threads.max(1),
            max_message_size,
            security: Arc::new(security),
            stats: Arc::new(TransportStats::default()),
        })
    }

    pub fn local_addr(&self) -> anyhow::Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    pub fn stats(&self) -> Arc<TransportStats> {
        self.stats.clone()
    }

    /// A sender sharing this listener's socket, for replies and requests.
    pub fn sender(&self) -> UdpSender {
        UdpSender {
            socket: self.socket.clone(),
            max_message_size: self.max_message_size,
            stats: self.stats.clone(),
        }
    }

    /// Spawn the reader tasks. They run until `shutdown` flips to true or the
    /// dispatcher queue closes.
    pub fn spawn(
        &self,
        queue: mpsc::Sender<Message>,
        shutdown: watch::Receiver<bool>,
    ) -> Vec<JoinHandle<()>> {
        (0..self.threads)
            .map(|worker| {
                let socket = self.socket.clone();
                let security = self.security.clone();
                let stats = self.stats.clone();
                let queue = queue.clone();
                let mut shutdown = shutdown.clone();
                let max = self.max_message_size;

                tokio::spawn(async move {
                    // one extra byte so oversized datagrams are detectable
                    let mut buf = vec![0u8; max + 1];

                    loop {
                        tokio::select! {
                            changed = shutdown.changed() => {
                                if changed.is_err() || *shutdown.borrow() {
                                    break;
                                }
                            }

                            result = socket.recv_from(&mut buf) => {
                                let (len, peer) = match result {
                                    Ok(pair) => pair,
                                    Err(e) => {
                                        warn!("udp reader {worker}: recv error: {e}");
                                        continue;
                                    }
                                };

                                TransportStats::bump(&stats.received);

                                if len > max {
                                    TransportStats::bump(&stats.oversized);
                                    warn!(
                                        "{}",
                                        ProtocolError::MessageTooLarge { size: len, limit: max }
                                    );
                                    continue;
                                }

                                let plain = match security.unseal(&buf[..len]) {
                                    Ok(plain) => plain,
                                    Err(_) => {
                                        TransportStats::bump(&stats.decrypt_failures);
                                        debug!("dropping undecryptable datagram from {peer}");
                                        continue;
                                    }
                                };

                                let message = match Message::decode(&plain, max) {
                                    Ok(message) => message,
                                    Err(e) => {
                                        TransportStats::bump(&stats.malformed);
                                        warn!("dropping message from {peer}: {e}");
                                        continue;
                                    }
                                };

                                trace!(
                                    "reader {worker}: {} for host {} from {peer}",
                                    message.msg_type, message.host_id
                                );

                                match queue.try_send(message) {
                                    Ok(()) => {}
                                    Err(mpsc::error::TrySendError::Full(_)) => {
                                        TransportStats::bump(&stats.backlog_dropped);
                                        warn!("dispatcher backlog full, dropping newest message");
                                    }
                                    Err(mpsc::error::TrySendError::Closed(_)) => {
                                        debug!("dispatcher queue closed, reader {worker} exiting");
                                        break;
                                    }
                                }
                            }
                        }
                    }

                    debug!("udp reader {worker} stopped");
                })
            })
            .collect()
    }
}

/// Fire-and-forget sender over the shared socket.
#[derive(Debug, Clone)]
pub struct UdpSender {
    socket: Arc<UdpSocket>,
    max_message_size: usize,
    stats: Arc<TransportStats>,
}

impl UdpSender {
    /// Encode, optionally encrypt for the recipient, and send. No
    /// retransmission; the caller re-issues on the next monitor cycle.
    pub async fn send(
        &self,
        addr: SocketAddr,
        message: &Message,
        recipient_key: Option<&RsaPublicKey>,
    ) -> anyhow::Result<()> {
        let raw = message.encode(self.max_message_size)?;

        let wire = match recipient_key {
            Some(key) => MessageSecurity::seal(key, &raw)?,
            None => raw,
        };

        self.socket
            .send_to(&wire, addr)
            .await
            .with_context(|| format!("sending {} to {addr}", message.msg_type))?;

        TransportStats::bump(&self.stats.sent);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::MessageType;
    use std::time::Duration;

    async fn listener_with_queue(
        security: MessageSecurity,
    ) -> (UdpListener, mpsc::Receiver<Message>, watch::Sender<bool>) {
        let listener = UdpListener::bind("127.0.0.1:0".parse().unwrap(), 2, 1024, security)
            .await
            .unwrap();
        let (tx, rx) = mpsc::channel(16);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        listener.spawn(tx, shutdown_rx);
        (listener, rx, shutdown_tx)
    }

    #[tokio::test]
    async fn plaintext_message_is_received_and_decoded() {
        let (listener, mut rx, _shutdown) = listener_with_queue(MessageSecurity::disabled()).await;
        let addr = listener.local_addr().unwrap();

        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let msg = Message::new(MessageType::BeaconHost, 3, 77, String::new());
        client.send_to(&msg.encode(1024).unwrap(), addr).await.unwrap();

        let received = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(received, msg);
        assert_eq!(listener.stats().snapshot().received, 1);
    }

    #[tokio::test]
    async fn undecryptable_datagram_is_counted_and_dropped() {
        let key = rsa::RsaPrivateKey::new(&mut rand::thread_rng(), 1024).unwrap();
        let (listener, mut rx, _shutdown) =
            listener_with_queue(MessageSecurity::from_private_key(key)).await;
        let addr = listener.local_addr().unwrap();

        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        client.send_to(b"not ciphertext at all", addr).await.unwrap();

        // nothing should arrive on the queue
        let outcome = tokio::time::timeout(Duration::from_millis(300), rx.recv()).await;
        assert!(outcome.is_err());
        assert_eq!(listener.stats().snapshot().decrypt_failures, 1);
    }

    #[tokio::test]
    async fn malformed_message_is_counted_and_dropped() {
        let (listener, mut rx, _shutdown) = listener_with_queue(MessageSecurity::disabled()).await;
        let addr = listener.local_addr().unwrap();

        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        client.send_to(b"NOT_A_TYPE x y z\n", addr).await.unwrap();

        let outcome = tokio::time::timeout(Duration::from_millis(300), rx.recv()).await;
        assert!(outcome.is_err());
        assert_eq!(listener.stats().snapshot().malformed, 1);
    }

    #[tokio::test]
    async fn sender_round_trip_with_encryption() {
        let key = rsa::RsaPrivateKey::new(&mut rand::thread_rng(), 1024).unwrap();
        let public = key.to_public_key();
        let (listener, mut rx, _shutdown) =
            listener_with_queue(MessageSecurity::from_private_key(key)).await;
        let addr = listener.local_addr().unwrap();

        // a second listener only to borrow its sender socket
        let client = UdpListener::bind(
            "127.0.0.1:0".parse().unwrap(),
            1,
            1024,
            MessageSecurity::disabled(),
        )
        .await
        .unwrap();

        let msg = Message::new(MessageType::MonitorHost, 5, 0, "FREE_CPU=40\n".to_string());
        client.sender().send(addr, &msg, Some(&public)).await.unwrap();

        let received = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(received, msg);
    }
}
