//! Peer table.
//!
//! Holds the established connections handed over by the SOCKS connector.
//! Locking is two-level: a table lock guarding the address map, and one
//! lock per peer. Callers lock the table, clone out the peer handle, and
//! release the table before touching the peer, so a peer can be written to
//! without stalling lookups.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::net::Ipv6Addr;
use std::sync::Arc;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tracing::{debug, error, info, warn};

/// Errors related to peer operations.
#[derive(Debug, Error)]
pub enum PeerError {
    #[error("peer not found: {0}")]
    NotFound(Ipv6Addr),

    #[error("peer already exists: {0}")]
    AlreadyExists(Ipv6Addr),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// One established connection to a remote peer.
#[derive(Debug)]
pub struct Peer {
    /// Virtual address of the peer.
    addr: Ipv6Addr,
    /// The connected stream, as handed over by the connector.
    stream: TcpStream,
    /// When the peer was registered (Unix milliseconds).
    created_ms: u64,
    /// How long the connect + handshake took (milliseconds).
    setup_duration_ms: u64,
    /// When the last keepalive was written (Unix milliseconds).
    last_keepalive_ms: u64,
}

impl Peer {
    /// Virtual address of the peer.
    pub fn addr(&self) -> Ipv6Addr {
        self.addr
    }

    /// How long connect + handshake took.
    pub fn setup_duration_ms(&self) -> u64 {
        self.setup_duration_ms
    }

    /// When the peer was registered.
    pub fn created_ms(&self) -> u64 {
        self.created_ms
    }

    /// When the last keepalive was written; 0 if none yet.
    pub fn last_keepalive_ms(&self) -> u64 {
        self.last_keepalive_ms
    }

    /// Send one keepalive frame: a payload-less IPv6 header addressed from
    /// our virtual address to the peer's. Peers treat any traffic as
    /// liveness, so the empty packet is enough to hold the circuit open.
    pub async fn send_keepalive(&mut self, src: Ipv6Addr, now_ms: u64) -> Result<(), PeerError> {
        let frame = keepalive_frame(src, self.addr);
        self.stream.write_all(&frame).await?;
        self.last_keepalive_ms = now_ms;
        debug!(addr = %self.addr, "keepalive sent");
        Ok(())
    }
}

/// Build the keepalive frame: an IPv6 header with no payload.
fn keepalive_frame(src: Ipv6Addr, dst: Ipv6Addr) -> [u8; 40] {
    let mut frame = [0u8; 40];
    frame[0] = 0x60; // version 6, no traffic class / flow label
    // payload length stays zero
    frame[6] = 59; // next header: none
    frame[7] = 64; // hop limit
    frame[8..24].copy_from_slice(&src.octets());
    frame[24..40].copy_from_slice(&dst.octets());
    frame
}

/// Shared handle to one peer.
pub type PeerHandle = Arc<tokio::sync::Mutex<Peer>>;

/// Table of established peers, keyed by virtual address.
#[derive(Debug, Default)]
pub struct PeerTable {
    peers: Mutex<HashMap<Ipv6Addr, PeerHandle>>,
}

impl PeerTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a connected stream for a peer.
    ///
    /// An existing entry for the address is replaced: the connector only
    /// hands over a new stream when it was asked to connect, and the old
    /// stream is dead by then.
    pub fn insert(
        &self,
        addr: Ipv6Addr,
        stream: TcpStream,
        setup_duration_ms: u64,
        now_ms: u64,
    ) {
        let peer = Peer {
            addr,
            stream,
            created_ms: now_ms,
            setup_duration_ms,
            last_keepalive_ms: 0,
        };

        let mut table = self.peers.lock();
        if table
            .insert(addr, Arc::new(tokio::sync::Mutex::new(peer)))
            .is_some()
        {
            warn!(addr = %addr, "replaced existing peer entry");
        }
    }

    /// Look up a peer handle. The table lock is released before returning.
    pub fn find(&self, addr: &Ipv6Addr) -> Option<PeerHandle> {
        self.peers.lock().get(addr).cloned()
    }

    /// Remove a peer, returning its handle if present.
    pub fn remove(&self, addr: &Ipv6Addr) -> Option<PeerHandle> {
        self.peers.lock().remove(addr)
    }

    pub fn len(&self) -> usize {
        self.peers.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.lock().is_empty()
    }

    /// Take over a freshly handshaken stream from the connector.
    ///
    /// Registers the stream, re-resolves the peer under the table lock,
    /// then sends the first keepalive immediately under the peer lock.
    /// The peer not being found right after insertion would mean another
    /// subsystem tore it down between the two steps; that is a logic
    /// error, reported loudly but not fatal.
    pub async fn activate(
        &self,
        addr: Ipv6Addr,
        stream: TcpStream,
        setup_duration_ms: u64,
        our_addr: Ipv6Addr,
        now_ms: u64,
    ) {
        self.insert(addr, stream, setup_duration_ms, now_ms);
        info!(
            addr = %addr,
            setup_ms = setup_duration_ms,
            "peer activated"
        );

        // Table lock, find, release; then peer lock.
        let peer = self.find(&addr);
        match peer {
            Some(peer) => {
                let mut peer = peer.lock().await;
                if let Err(e) = peer.send_keepalive(our_addr, now_ms).await {
                    warn!(addr = %addr, error = %e, "initial keepalive failed");
                }
            }
            None => {
                error!(addr = %addr, "newly inserted peer not found");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;

    fn addr(last: u16) -> Ipv6Addr {
        format!("fd87:d87e:eb43::{:x}", last).parse().unwrap()
    }

    async fn socket_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let local = listener.local_addr().unwrap();
        let client = TcpStream::connect(local);
        let server = listener.accept();
        let (client, server) = tokio::join!(client, server);
        (client.unwrap(), server.unwrap().0)
    }

    #[test]
    fn test_keepalive_frame_layout() {
        let src = addr(1);
        let dst = addr(2);
        let frame = keepalive_frame(src, dst);

        assert_eq!(frame.len(), 40);
        assert_eq!(frame[0] >> 4, 6, "IPv6 version nibble");
        assert_eq!(u16::from_be_bytes([frame[4], frame[5]]), 0, "payload length");
        assert_eq!(frame[6], 59, "next header: none");
        assert_eq!(&frame[8..24], &src.octets());
        assert_eq!(&frame[24..40], &dst.octets());
    }

    #[tokio::test]
    async fn test_insert_and_find() {
        let table = PeerTable::new();
        let (client, _server) = socket_pair().await;

        assert!(table.is_empty());
        table.insert(addr(1), client, 120, 1000);
        assert_eq!(table.len(), 1);

        let peer = table.find(&addr(1)).unwrap();
        let peer = peer.lock().await;
        assert_eq!(peer.addr(), addr(1));
        assert_eq!(peer.setup_duration_ms(), 120);

        assert!(table.find(&addr(2)).is_none());
    }

    #[tokio::test]
    async fn test_activate_sends_keepalive() {
        let table = PeerTable::new();
        let (client, mut server) = socket_pair().await;

        table.activate(addr(2), client, 80, addr(1), 1000).await;
        assert_eq!(table.len(), 1);

        let mut frame = [0u8; 40];
        server.read_exact(&mut frame).await.unwrap();
        assert_eq!(frame[0] >> 4, 6);
        assert_eq!(frame[6], 59);
        assert_eq!(&frame[8..24], &addr(1).octets());
        assert_eq!(&frame[24..40], &addr(2).octets());
    }

    #[tokio::test]
    async fn test_remove() {
        let table = PeerTable::new();
        let (client, _server) = socket_pair().await;

        table.insert(addr(1), client, 0, 0);
        assert!(table.remove(&addr(1)).is_some());
        assert!(table.remove(&addr(1)).is_none());
        assert!(table.is_empty());
    }
}
