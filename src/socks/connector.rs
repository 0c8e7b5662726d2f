//! The connector engine.
//!
//! A single task owns the request queue and drives every request through
//! its lifecycle: optional reverse-DNS lookup, TCP connect to the proxy,
//! SOCKS handshake, and hand-off to the peer table. Each sweep scans the
//! queue, starts whatever I/O is due, then waits (bounded) for a control
//! message or a step completion.
//!
//! I/O steps run as small spawned tasks on the same runtime; each performs
//! exactly one protocol state's I/O on a socket it owns and reports the
//! result through the step-event channel. A request's `seq` is bumped on
//! every transition, so events from abandoned steps are recognized as
//! stale and dropped (dropping the event also closes its socket).

use crate::config::{Config, ConnectMode};
use crate::hosts::HostsHandle;
use crate::naming::{derive_hostname, resolve_name};
use crate::peer::PeerTable;
use crate::resolver;
use crate::socks::codec;
use crate::socks::control::{ControlMessage, ControlRx};
use crate::socks::queue::{ConnectQueue, Request, RequestState};
use crate::socks::SocksError;
use std::fmt::Write as _;
use std::net::{IpAddr, Ipv6Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, UdpSocket};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Current Unix time in milliseconds.
pub(crate) fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Result of one I/O step. TCP steps return the stream so the next state
/// (or the hand-off) can take it over.
#[derive(Debug)]
enum StepOutcome {
    /// TCP connect finished.
    Connected(Result<TcpStream, SocksError>),
    /// SOCKS4a request written and reply validated.
    Socks4a(Result<TcpStream, SocksError>),
    /// SOCKS5 greeting written and method reply validated.
    Socks5Greet(Result<TcpStream, SocksError>),
    /// SOCKS5 request written and final reply validated.
    Socks5Request(Result<TcpStream, SocksError>),
    /// Reverse-DNS response received and parsed.
    Dns(Result<String, SocksError>),
}

#[derive(Debug)]
struct StepEvent {
    addr: Ipv6Addr,
    seq: u64,
    outcome: StepOutcome,
}

/// The connector. Owns the queue; producers reach it only through the
/// control channel.
pub struct Connector {
    cfg: Config,
    queue: ConnectQueue,
    control_rx: ControlRx,
    events_tx: mpsc::Sender<StepEvent>,
    events_rx: mpsc::Receiver<StepEvent>,
    hosts: HostsHandle,
    peers: Arc<PeerTable>,
    term: Arc<AtomicBool>,
}

impl Connector {
    pub fn new(
        cfg: Config,
        hosts: HostsHandle,
        peers: Arc<PeerTable>,
        control_rx: ControlRx,
        term: Arc<AtomicBool>,
    ) -> Self {
        let (events_tx, events_rx) = mpsc::channel(cfg.node.buffers.event_channel());
        Self {
            cfg,
            queue: ConnectQueue::new(),
            control_rx,
            events_tx,
            events_rx,
            hosts,
            peers,
            term,
        }
    }

    /// Run sweeps until termination is requested or the control channel
    /// closes.
    pub async fn run(&mut self) {
        info!(mode = %self.cfg.socks.mode(), "SOCKS connector started");
        while self.sweep().await {}
        info!("SOCKS connector stopped");
    }

    /// One reactor sweep. Returns `false` when the connector should stop.
    pub(crate) async fn sweep(&mut self) -> bool {
        if self.term.load(Ordering::Relaxed) {
            debug!("termination requested");
            return false;
        }

        let now = now_ms();
        self.prepare(now).await;

        // Bounded wait, so backing-off requests are re-examined even
        // without any I/O activity.
        let wait = Duration::from_secs(self.cfg.retry.dns_retry_timeout_secs());
        tokio::select! {
            biased;
            msg = self.control_rx.recv() => match msg {
                Some(msg) => self.handle_control(msg),
                None => {
                    debug!("control channel closed");
                    return false;
                }
            },
            event = self.events_rx.recv() => {
                if let Some(event) = event {
                    self.handle_event(event, now_ms()).await;
                }
            }
            _ = tokio::time::sleep(wait) => {}
        }

        let removed = self.queue.remove_deleted();
        if removed > 0 {
            debug!(removed, "removed finished requests");
        }
        true
    }

    /// Scan the queue and start whatever I/O is due.
    async fn prepare(&mut self, now_ms: u64) {
        let Self {
            cfg,
            queue,
            events_tx,
            hosts,
            ..
        } = self;

        for req in queue.iter_mut() {
            if matches!(req.state, RequestState::New) {
                Self::dispatch_new(cfg, hosts, events_tx, req, now_ms).await;
            } else if matches!(req.state, RequestState::DnsSent { .. }) {
                Self::dispatch_dns_wait(cfg, req, now_ms);
            }
        }
    }

    /// Start the next attempt for an idle request.
    async fn dispatch_new(
        cfg: &Config,
        hosts: &HostsHandle,
        events_tx: &mpsc::Sender<StepEvent>,
        req: &mut Request,
        now_ms: u64,
    ) {
        if req.is_idle(now_ms) {
            debug!(
                addr = %req.addr,
                wait_ms = req.restart_time_ms - now_ms,
                "request is backing off"
            );
            return;
        }

        req.retry += 1;
        if !req.perm && req.retry > cfg.retry.max_retries() {
            info!(
                addr = %req.addr,
                attempts = req.retry - 1,
                "temporary request failed too often, dropping"
            );
            req.state = RequestState::Delete;
            return;
        }

        // First attempt without a cached name: try the reverse-DNS path.
        // A fallback from an exhausted lookup re-enters with retry already
        // above one, which skips this gate.
        if cfg.naming.dns_lookup
            && req.retry <= 1
            && !resolve_name(&req.addr, &cfg.naming, hosts).from_hosts()
        {
            match Self::start_dns_query(cfg, hosts, events_tx, req, now_ms).await {
                Ok(()) => return,
                Err(e) => {
                    warn!(
                        addr = %req.addr,
                        error = %e,
                        "reverse-DNS lookup not started, connecting with derived name"
                    );
                }
            }
        }

        // Pick the target: the proxy, or the resolved host in direct mode.
        let target = match cfg.socks.mode() {
            ConnectMode::Direct => {
                let name = resolve_name(&req.addr, &cfg.naming, hosts).into_name();
                match resolve_direct(&name, cfg.socks.dest_port()).await {
                    Ok(sa) => sa,
                    Err(e) => {
                        warn!(
                            addr = %req.addr,
                            name = %name,
                            error = %e,
                            "no address for direct connection"
                        );
                        return;
                    }
                }
            }
            _ => match cfg.socks.proxy {
                Some(sa) => sa,
                None => {
                    // Enqueues are gated on a configured proxy, so a
                    // request here slipped past the producer side.
                    // Permanent requests must never be deleted: park
                    // them in backoff until a proxy appears.
                    warn!(addr = %req.addr, "no proxy configured, cannot connect");
                    if req.perm {
                        req.restart_time_ms =
                            now_ms + cfg.retry.connect_backoff_secs() * 1000;
                    } else {
                        req.state = RequestState::Delete;
                    }
                    return;
                }
            },
        };

        req.connect_time_ms = now_ms;
        req.state = RequestState::Connecting;
        req.seq += 1;
        debug!(addr = %req.addr, target = %target, retry = req.retry, "starting TCP connect");
        tokio::spawn(connect_step(
            target,
            req.addr,
            req.seq,
            events_tx.clone(),
        ));
    }

    /// Send a reverse-DNS query and move the request to the DNS wait.
    async fn start_dns_query(
        cfg: &Config,
        hosts: &HostsHandle,
        events_tx: &mpsc::Sender<StepEvent>,
        req: &mut Request,
        now_ms: u64,
    ) -> Result<(), SocksError> {
        let (ns_ip, ns_src) = hosts.lock().get_ns().ok_or(SocksError::NoNameserver)?;
        let ns_addr = SocketAddr::new(IpAddr::V6(ns_ip), cfg.socks.ns_port());

        let socket = Arc::new(UdpSocket::bind((Ipv6Addr::UNSPECIFIED, 0)).await?);
        let id = rand::random::<u16>();
        let query = resolver::build_ptr_query(&req.addr, id)?;
        socket.send_to(&query, ns_addr).await?;

        req.seq += 1;
        let task = tokio::spawn(dns_recv_step(
            socket.clone(),
            ns_addr,
            id,
            req.addr,
            req.seq,
            events_tx.clone(),
        ));

        info!(addr = %req.addr, ns = %ns_addr, ns_src = %ns_src, "reverse-DNS query sent");
        req.state = RequestState::DnsSent {
            socket,
            ns_addr,
            ns_src,
            id,
            task,
        };
        req.retry = 0;
        req.restart_time_ms = now_ms + cfg.retry.dns_retry_timeout_secs() * 1000;
        Ok(())
    }

    /// Retransmit or abandon a pending reverse-DNS lookup.
    fn dispatch_dns_wait(cfg: &Config, req: &mut Request, now_ms: u64) {
        if req.is_idle(now_ms) {
            // Awaiting the response; the receive task is watching.
            return;
        }

        let mut resent = false;
        if req.retry < cfg.retry.dns_retries() {
            if let RequestState::DnsSent {
                socket,
                ns_addr,
                ns_src,
                id,
                ..
            } = &req.state
            {
                match resolver::build_ptr_query(&req.addr, *id) {
                    Ok(query) => match socket.try_send_to(&query, *ns_addr) {
                        Ok(_) => {
                            info!(
                                addr = %req.addr,
                                ns = %ns_addr,
                                ns_src = %ns_src,
                                "reverse-DNS query re-sent"
                            );
                            resent = true;
                        }
                        Err(e) => {
                            warn!(addr = %req.addr, error = %e, "reverse-DNS resend failed");
                        }
                    },
                    Err(e) => {
                        warn!(addr = %req.addr, error = %e, "reverse-DNS resend failed");
                    }
                }
            }
        }

        if resent {
            req.retry += 1;
            req.restart_time_ms = now_ms + cfg.retry.dns_retry_timeout_secs() * 1000;
        } else {
            info!(addr = %req.addr, "reverse-DNS gave no answer, using derived hostname");
            let old = std::mem::replace(&mut req.state, RequestState::New);
            if let RequestState::DnsSent { task, .. } = old {
                task.abort();
            }
            req.restart_time_ms = 0;
            // The lookup consumed one attempt; a value above zero also
            // keeps the next pass from starting another lookup.
            req.retry = 1;
            req.seq += 1;
        }
    }

    /// Process one control message.
    fn handle_control(&mut self, msg: ControlMessage) {
        match msg {
            ControlMessage::Connect { addr, perm } => {
                if self.queue.enqueue(addr, perm) {
                    debug!(addr = %addr, perm, "connection request queued");
                }
            }
            ControlMessage::Wakeup => {
                debug!("wakeup received");
            }
            ControlMessage::DumpQueue { reply } => {
                if reply.send(self.format_queue()).is_err() {
                    debug!("dump requester went away");
                }
            }
        }
    }

    /// Queue listing for the dump interface: one line per request plus a
    /// single zero byte as the end marker.
    fn format_queue(&self) -> Vec<u8> {
        let mut out = String::new();
        for (i, req) in self.queue.iter().enumerate() {
            let _ = writeln!(
                out,
                "{}: {}, {}, state = {}, {}({}), retry = {}, connect_time = {}, restart_time = {}",
                i,
                req.addr,
                derive_hostname(&req.addr, self.cfg.naming.domain()),
                req.state.code(),
                if req.perm { "PERMANENT" } else { "TEMPORARY" },
                u8::from(req.perm),
                req.retry,
                req.connect_time_ms / 1000,
                req.restart_time_ms / 1000,
            );
        }
        let mut bytes = out.into_bytes();
        bytes.push(0);
        bytes
    }

    /// Apply one step completion to its request.
    async fn handle_event(&mut self, event: StepEvent, now_ms: u64) {
        let StepEvent { addr, seq, outcome } = event;
        let backoff_ms = self.cfg.retry.connect_backoff_secs() * 1000;

        let Self {
            cfg,
            queue,
            events_tx,
            hosts,
            peers,
            ..
        } = self;

        let Some(req) = queue.find_mut(&addr) else {
            debug!(addr = %addr, "step event for unknown request, dropping");
            return;
        };
        if req.seq != seq {
            debug!(addr = %addr, "stale step event, dropping");
            return;
        }

        match outcome {
            StepOutcome::Connected(result) => {
                if !matches!(req.state, RequestState::Connecting) {
                    debug!(addr = %addr, state = %req.state, "connect event in wrong state");
                    return;
                }
                match result {
                    Ok(stream) => match cfg.socks.mode() {
                        ConnectMode::Socks4a => {
                            let name = resolve_name(&addr, &cfg.naming, hosts).into_name();
                            info!(addr = %addr, name = %name, "connected, sending SOCKS4a request");
                            let frame = codec::socks4a_request(
                                cfg.socks.dest_port(),
                                cfg.socks.username(),
                                &name,
                            );
                            req.state = RequestState::Socks4aReqSent;
                            req.seq += 1;
                            tokio::spawn(socks4a_step(stream, frame, addr, req.seq, events_tx.clone()));
                        }
                        ConnectMode::Socks5 => {
                            info!(addr = %addr, "connected, sending SOCKS5 greeting");
                            req.state = RequestState::Socks5GreetSent;
                            req.seq += 1;
                            tokio::spawn(socks5_greet_step(stream, addr, req.seq, events_tx.clone()));
                        }
                        ConnectMode::Direct => {
                            Self::hand_off(peers, cfg, req, stream, now_ms).await;
                        }
                    },
                    Err(e) => {
                        warn!(addr = %addr, error = %e, "connect failed");
                        Self::reschedule(req, backoff_ms, now_ms);
                    }
                }
            }
            StepOutcome::Socks4a(result) => {
                if !matches!(req.state, RequestState::Socks4aReqSent) {
                    debug!(addr = %addr, state = %req.state, "SOCKS4a event in wrong state");
                    return;
                }
                match result {
                    Ok(stream) => {
                        info!(addr = %addr, "SOCKS4a connection opened");
                        Self::hand_off(peers, cfg, req, stream, now_ms).await;
                    }
                    Err(e) => {
                        warn!(addr = %addr, error = %e, "SOCKS4a request failed");
                        Self::reschedule(req, backoff_ms, now_ms);
                    }
                }
            }
            StepOutcome::Socks5Greet(result) => {
                if !matches!(req.state, RequestState::Socks5GreetSent) {
                    debug!(addr = %addr, state = %req.state, "SOCKS5 greet event in wrong state");
                    return;
                }
                match result {
                    Ok(stream) => {
                        let name = resolve_name(&addr, &cfg.naming, hosts).into_name();
                        match codec::socks5_request(cfg.socks.dest_port(), &name) {
                            Ok(frame) => {
                                debug!(addr = %addr, name = %name, "greeting accepted, sending SOCKS5 request");
                                req.state = RequestState::Socks5ReqSent;
                                req.seq += 1;
                                tokio::spawn(socks5_request_step(
                                    stream,
                                    frame,
                                    addr,
                                    req.seq,
                                    events_tx.clone(),
                                ));
                            }
                            Err(e) => {
                                warn!(addr = %addr, error = %e, "cannot build SOCKS5 request");
                                Self::reschedule(req, backoff_ms, now_ms);
                            }
                        }
                    }
                    Err(e) => {
                        warn!(addr = %addr, error = %e, "SOCKS5 greeting failed");
                        Self::reschedule(req, backoff_ms, now_ms);
                    }
                }
            }
            StepOutcome::Socks5Request(result) => {
                if !matches!(req.state, RequestState::Socks5ReqSent) {
                    debug!(addr = %addr, state = %req.state, "SOCKS5 reply event in wrong state");
                    return;
                }
                match result {
                    Ok(stream) => {
                        info!(addr = %addr, "SOCKS5 connection opened");
                        Self::hand_off(peers, cfg, req, stream, now_ms).await;
                    }
                    Err(e) => {
                        warn!(addr = %addr, error = %e, "SOCKS5 request failed");
                        Self::reschedule(req, backoff_ms, now_ms);
                    }
                }
            }
            StepOutcome::Dns(result) => {
                if !matches!(req.state, RequestState::DnsSent { .. }) {
                    debug!(addr = %addr, state = %req.state, "DNS event in wrong state");
                    return;
                }
                let old = std::mem::replace(&mut req.state, RequestState::New);
                if let RequestState::DnsSent { task, .. } = old {
                    task.abort();
                }
                req.seq += 1;
                match result {
                    Ok(name) => {
                        info!(addr = %addr, name = %name, "reverse-DNS lookup succeeded, reconnecting");
                        hosts.lock().add_dns(addr, name);
                        req.retry = 0;
                        req.restart_time_ms = 0;
                    }
                    Err(e) => {
                        warn!(addr = %addr, error = %e, "reverse-DNS lookup failed");
                        req.state = RequestState::Delete;
                    }
                }
            }
        }
    }

    /// Hand a handshaken stream to the peer layer and finish the request.
    async fn hand_off(
        peers: &Arc<PeerTable>,
        cfg: &Config,
        req: &mut Request,
        stream: TcpStream,
        now_ms: u64,
    ) {
        let setup_ms = now_ms.saturating_sub(req.connect_time_ms);
        let our_addr = cfg.node.virtual_addr.unwrap_or(Ipv6Addr::UNSPECIFIED);
        peers
            .activate(req.addr, stream, setup_ms, our_addr, now_ms)
            .await;
        req.state = RequestState::Delete;
        req.seq += 1;
    }

    /// Put a failed request back into backoff. The retry counter is kept,
    /// so temporary requests converge to removal.
    fn reschedule(req: &mut Request, backoff_ms: u64, now_ms: u64) {
        info!(addr = %req.addr, retry = req.retry, "rescheduling connection request");
        req.state = RequestState::New;
        req.restart_time_ms = now_ms + backoff_ms;
        req.seq += 1;
    }
}

/// Resolve a hostname for a direct (proxy-less) connection.
async fn resolve_direct(name: &str, port: u16) -> Result<SocketAddr, SocksError> {
    let mut addrs = tokio::net::lookup_host((name, port)).await?;
    addrs
        .next()
        .ok_or_else(|| SocksError::NoSuchHost(name.to_string()))
}

// === I/O steps ===
//
// Each step owns its socket for the duration of one protocol state and
// reports the result through the event channel. The handshake bodies are
// shared with the startup probe.

async fn connect_step(
    target: SocketAddr,
    addr: Ipv6Addr,
    seq: u64,
    events: mpsc::Sender<StepEvent>,
) {
    let outcome = TcpStream::connect(target).await.map_err(SocksError::Io);
    let _ = events
        .send(StepEvent {
            addr,
            seq,
            outcome: StepOutcome::Connected(outcome),
        })
        .await;
}

async fn socks4a_step(
    mut stream: TcpStream,
    frame: Vec<u8>,
    addr: Ipv6Addr,
    seq: u64,
    events: mpsc::Sender<StepEvent>,
) {
    let outcome = socks4a_exchange(&mut stream, &frame).await.map(|()| stream);
    let _ = events
        .send(StepEvent {
            addr,
            seq,
            outcome: StepOutcome::Socks4a(outcome),
        })
        .await;
}

async fn socks5_greet_step(
    mut stream: TcpStream,
    addr: Ipv6Addr,
    seq: u64,
    events: mpsc::Sender<StepEvent>,
) {
    let outcome = socks5_greet_exchange(&mut stream).await.map(|()| stream);
    let _ = events
        .send(StepEvent {
            addr,
            seq,
            outcome: StepOutcome::Socks5Greet(outcome),
        })
        .await;
}

async fn socks5_request_step(
    mut stream: TcpStream,
    frame: Vec<u8>,
    addr: Ipv6Addr,
    seq: u64,
    events: mpsc::Sender<StepEvent>,
) {
    let outcome = socks5_request_exchange(&mut stream, &frame)
        .await
        .map(|()| stream);
    let _ = events
        .send(StepEvent {
            addr,
            seq,
            outcome: StepOutcome::Socks5Request(outcome),
        })
        .await;
}

/// Write a SOCKS4a request and validate the 8-byte reply.
pub(super) async fn socks4a_exchange(
    stream: &mut TcpStream,
    frame: &[u8],
) -> Result<(), SocksError> {
    stream.write_all(frame).await?;
    let mut reply = [0u8; codec::SOCKS4A_REPLY_LEN];
    stream.read_exact(&mut reply).await?;
    codec::parse_socks4a_reply(&reply)?;
    Ok(())
}

/// Write the SOCKS5 greeting and validate the method reply.
pub(super) async fn socks5_greet_exchange(stream: &mut TcpStream) -> Result<(), SocksError> {
    stream.write_all(&codec::SOCKS5_GREETING).await?;
    let mut reply = [0u8; 2];
    stream.read_exact(&mut reply).await?;
    codec::parse_socks5_greet_reply(&reply)?;
    Ok(())
}

/// Write a SOCKS5 request and validate the reply, consuming the bound
/// address/port trailer so the stream is clean for the peer layer.
pub(super) async fn socks5_request_exchange(
    stream: &mut TcpStream,
    frame: &[u8],
) -> Result<(), SocksError> {
    stream.write_all(frame).await?;

    let mut header = [0u8; 4];
    stream.read_exact(&mut header).await?;
    let atyp = codec::parse_socks5_reply_header(&header)?;

    let tail_len = match atyp.fixed_tail_len() {
        Some(n) => n,
        None => {
            let mut len = [0u8; 1];
            stream.read_exact(&mut len).await?;
            usize::from(len[0]) + 2
        }
    };
    let mut tail = vec![0u8; tail_len];
    stream.read_exact(&mut tail).await?;
    Ok(())
}

/// Wait for a matching reverse-DNS response on the query socket.
///
/// Datagrams from anyone but the queried nameserver are discarded and the
/// wait continues; the first source-matched datagram decides the outcome.
async fn dns_recv_step(
    socket: Arc<UdpSocket>,
    ns_addr: SocketAddr,
    id: u16,
    addr: Ipv6Addr,
    seq: u64,
    events: mpsc::Sender<StepEvent>,
) {
    let mut buf = [0u8; 512];
    let outcome = loop {
        match socket.recv_from(&mut buf).await {
            Ok((len, src)) => {
                if src != ns_addr {
                    warn!(
                        addr = %addr,
                        src = %src,
                        "DNS response source does not match nameserver, discarding"
                    );
                    continue;
                }
                break resolver::parse_ptr_response(&buf[..len], id, &addr)
                    .map_err(SocksError::from);
            }
            Err(e) => break Err(SocksError::Io(e)),
        }
    };
    let _ = events
        .send(StepEvent {
            addr,
            seq,
            outcome: StepOutcome::Dns(outcome),
        })
        .await;
}
