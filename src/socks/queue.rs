//! Connection request queue.
//!
//! One [`Request`] per peer address the daemon is trying to reach. The
//! queue is owned exclusively by the connector; producers reach it only
//! through the control channel, so at most one connect attempt per address
//! is ever in flight.

use crate::hosts::NsSource;
use std::fmt;
use std::net::{Ipv6Addr, SocketAddr};
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;
use tracing::debug;

/// Protocol state of one connection request.
///
/// States that perform TCP I/O carry no socket here: the stream is owned
/// by the step task driving that state, and comes back through its
/// completion event. Only the reverse-DNS wait keeps its socket in the
/// request, because the connector retransmits queries on timeout.
#[derive(Debug)]
pub enum RequestState {
    /// Waiting to (re)start a connection attempt.
    New,
    /// Reverse-DNS query sent, awaiting the response.
    DnsSent {
        /// Query socket, shared with the receive task.
        socket: Arc<UdpSocket>,
        /// Where the query went; responses from anywhere else are discarded.
        ns_addr: SocketAddr,
        /// Provenance of the nameserver entry.
        ns_src: NsSource,
        /// DNS transaction id.
        id: u16,
        /// Receive task, aborted when the lookup is abandoned.
        task: JoinHandle<()>,
    },
    /// TCP connect to the proxy (or the target, in direct mode) in flight.
    Connecting,
    /// SOCKS4a request written, awaiting the 8-byte reply.
    Socks4aReqSent,
    /// SOCKS5 greeting written, awaiting the method reply.
    Socks5GreetSent,
    /// SOCKS5 request written, awaiting the final reply.
    Socks5ReqSent,
    /// Finished (successfully or not); removed by the cleanup pass.
    Delete,
}

impl RequestState {
    /// Numeric code, as printed by the queue dump.
    pub fn code(&self) -> u8 {
        match self {
            RequestState::New => 0,
            RequestState::Connecting => 1,
            RequestState::Socks4aReqSent => 2,
            RequestState::Socks5GreetSent => 3,
            RequestState::Socks5ReqSent => 4,
            RequestState::DnsSent { .. } => 5,
            RequestState::Delete => 6,
        }
    }

    /// Check if the request is finished and awaiting cleanup.
    pub fn is_delete(&self) -> bool {
        matches!(self, RequestState::Delete)
    }

    /// Check if some I/O step owns a socket for this request.
    pub fn in_flight(&self) -> bool {
        matches!(
            self,
            RequestState::DnsSent { .. }
                | RequestState::Connecting
                | RequestState::Socks4aReqSent
                | RequestState::Socks5GreetSent
                | RequestState::Socks5ReqSent
        )
    }
}

impl fmt::Display for RequestState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RequestState::New => "new",
            RequestState::DnsSent { .. } => "dns_sent",
            RequestState::Connecting => "connecting",
            RequestState::Socks4aReqSent => "socks4a_req_sent",
            RequestState::Socks5GreetSent => "socks5_greet_sent",
            RequestState::Socks5ReqSent => "socks5_req_sent",
            RequestState::Delete => "delete",
        };
        write!(f, "{}", s)
    }
}

/// One queued intent to establish a connection to one peer.
#[derive(Debug)]
pub struct Request {
    /// Virtual address of the target peer; the identity key in the queue.
    pub addr: Ipv6Addr,
    /// Permanent requests are retried indefinitely; temporary ones are
    /// dropped after the retry budget is spent.
    pub perm: bool,
    pub state: RequestState,
    /// Attempt counter; reset on transitions that represent progress.
    pub retry: u32,
    /// When the current TCP connect attempt started (Unix ms).
    pub connect_time_ms: u64,
    /// Earliest time the request may be re-attempted (Unix ms); 0 = now.
    pub restart_time_ms: u64,
    /// Bumped on every state transition; step events carrying an older
    /// value are stale and dropped.
    pub(crate) seq: u64,
}

impl Request {
    pub fn new(addr: Ipv6Addr, perm: bool) -> Self {
        Self {
            addr,
            perm,
            state: RequestState::New,
            retry: 0,
            connect_time_ms: 0,
            restart_time_ms: 0,
            seq: 0,
        }
    }

    /// Whether the request is backing off.
    pub fn is_idle(&self, now_ms: u64) -> bool {
        now_ms < self.restart_time_ms
    }
}

/// Ordered collection of pending requests, de-duplicated on address.
#[derive(Debug, Default)]
pub struct ConnectQueue {
    requests: Vec<Request>,
}

impl ConnectQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.requests.len()
    }

    pub fn is_empty(&self) -> bool {
        self.requests.is_empty()
    }

    /// Add a request unless one for the same address already exists.
    ///
    /// Returns whether the request was added; a re-request for an address
    /// already in the queue is a no-op.
    pub fn enqueue(&mut self, addr: Ipv6Addr, perm: bool) -> bool {
        if self.find(&addr).is_some() {
            debug!(addr = %addr, "connection request already queued");
            return false;
        }
        self.requests.push(Request::new(addr, perm));
        true
    }

    pub fn find(&self, addr: &Ipv6Addr) -> Option<&Request> {
        self.requests.iter().find(|r| r.addr == *addr)
    }

    pub fn find_mut(&mut self, addr: &Ipv6Addr) -> Option<&mut Request> {
        self.requests.iter_mut().find(|r| r.addr == *addr)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Request> {
        self.requests.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Request> {
        self.requests.iter_mut()
    }

    /// Remove every request marked for deletion. Returns how many went.
    pub fn remove_deleted(&mut self) -> usize {
        let before = self.requests.len();
        self.requests.retain(|r| !r.state.is_delete());
        before - self.requests.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(last: u16) -> Ipv6Addr {
        format!("fd87:d87e:eb43::{:x}", last).parse().unwrap()
    }

    #[test]
    fn test_enqueue_deduplicates() {
        let mut queue = ConnectQueue::new();
        assert!(queue.enqueue(addr(1), false));
        assert!(!queue.enqueue(addr(1), true));
        assert_eq!(queue.len(), 1);
        // The first request is untouched, including its perm flag
        assert!(!queue.find(&addr(1)).unwrap().perm);

        assert!(queue.enqueue(addr(2), true));
        assert_eq!(queue.len(), 2);
    }

    #[test]
    fn test_new_request_shape() {
        let req = Request::new(addr(1), true);
        assert!(matches!(req.state, RequestState::New));
        assert_eq!(req.retry, 0);
        assert_eq!(req.restart_time_ms, 0);
        assert!(!req.is_idle(0));
        assert!(!req.state.in_flight());
    }

    #[test]
    fn test_is_idle() {
        let mut req = Request::new(addr(1), false);
        req.restart_time_ms = 1000;
        assert!(req.is_idle(999));
        assert!(!req.is_idle(1000));
    }

    #[test]
    fn test_remove_deleted() {
        let mut queue = ConnectQueue::new();
        queue.enqueue(addr(1), false);
        queue.enqueue(addr(2), false);
        queue.enqueue(addr(3), false);

        queue.find_mut(&addr(2)).unwrap().state = RequestState::Delete;
        assert_eq!(queue.remove_deleted(), 1);
        assert_eq!(queue.len(), 2);
        assert!(queue.find(&addr(2)).is_none());
        assert!(queue.find(&addr(1)).is_some());
        assert!(queue.find(&addr(3)).is_some());

        assert_eq!(queue.remove_deleted(), 0);
    }

    #[test]
    fn test_state_codes_are_distinct() {
        let states = [
            RequestState::New,
            RequestState::Connecting,
            RequestState::Socks4aReqSent,
            RequestState::Socks5GreetSent,
            RequestState::Socks5ReqSent,
            RequestState::Delete,
        ];
        let mut codes: Vec<u8> = states.iter().map(|s| s.code()).collect();
        codes.sort_unstable();
        codes.dedup();
        assert_eq!(codes.len(), states.len());
    }

    #[test]
    fn test_in_flight_states() {
        assert!(RequestState::Connecting.in_flight());
        assert!(RequestState::Socks4aReqSent.in_flight());
        assert!(RequestState::Socks5GreetSent.in_flight());
        assert!(RequestState::Socks5ReqSent.in_flight());
        assert!(!RequestState::New.in_flight());
        assert!(!RequestState::Delete.in_flight());
    }
}
