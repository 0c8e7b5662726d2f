//! SOCKS connection queue and connector engine.
//!
//! Outbound connections to overlay peers go through a local SOCKS proxy
//! (typically a Tor or I2P client). Producers enqueue connection requests
//! over the control channel; the connector owns the queue and drives each
//! request through DNS lookup, TCP connect, and the SOCKS handshake, then
//! hands the established stream to the peer table.

mod codec;
mod connector;
mod control;
mod probe;
mod queue;

pub use codec::{
    parse_socks4a_reply, parse_socks5_greet_reply, parse_socks5_reply_header, socks4a_request,
    socks5_request, CodecError, Socks5Atyp, SOCKS5_GREETING,
};
pub use connector::Connector;
pub use control::{control_channel, ControlMessage, ControlRx, ControlSender};
pub use probe::probe_proxy;
pub use queue::{ConnectQueue, Request, RequestState};

use crate::resolver::ResolverError;
use thiserror::Error;

/// Errors from the connector engine.
#[derive(Debug, Error)]
pub enum SocksError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error(transparent)]
    Resolver(#[from] ResolverError),

    #[error("connector is disabled (no proxy configured)")]
    Disabled,

    #[error("no local virtual address configured")]
    NoLocalAddress,

    #[error("no nameserver available")]
    NoNameserver,

    #[error("hostname {0} did not resolve to any address")]
    NoSuchHost(String),

    #[error("termination requested")]
    Terminated,
}
