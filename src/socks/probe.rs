//! Startup proxy probe.
//!
//! A one-shot sequential variant of the connector: connect to the proxy,
//! run the configured handshake against our own hostname, and return the
//! established stream. Used at startup to confirm the proxy is reachable
//! before the daemon starts accepting traffic. Unlike the connector it
//! multiplexes nothing; each attempt runs to completion, and failures
//! retry after a bounded pause.

use crate::config::{Config, ConnectMode};
use crate::naming::derive_hostname;
use crate::socks::codec;
use crate::socks::connector::{socks4a_exchange, socks5_greet_exchange, socks5_request_exchange};
use crate::socks::SocksError;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

/// Verify the proxy is reachable, retrying until it is.
///
/// Returns the connected and handshaken stream, or [`SocksError::Terminated`]
/// once the shared termination flag is raised. The target hostname is our
/// own: a proxy that accepts a connection back to us proves the whole path.
pub async fn probe_proxy(cfg: &Config, term: &Arc<AtomicBool>) -> Result<TcpStream, SocksError> {
    let proxy = cfg.socks.proxy.ok_or(SocksError::Disabled)?;
    let our_addr = cfg.node.virtual_addr.ok_or(SocksError::NoLocalAddress)?;
    let hostname = derive_hostname(&our_addr, cfg.naming.domain());
    let backoff = Duration::from_secs(cfg.retry.probe_backoff_secs());

    loop {
        if term.load(Ordering::Relaxed) {
            debug!("probe aborted by termination request");
            return Err(SocksError::Terminated);
        }

        match probe_once(proxy, &hostname, cfg).await {
            Ok(stream) => {
                info!(proxy = %proxy, "successfully connected through proxy");
                return Ok(stream);
            }
            Err(e) => {
                warn!(proxy = %proxy, error = %e, "proxy probe failed");
            }
        }

        info!(wait_secs = backoff.as_secs(), "restarting probe in a moment");
        tokio::time::sleep(backoff).await;
    }
}

/// One probe attempt: connect and handshake.
async fn probe_once(
    proxy: SocketAddr,
    hostname: &str,
    cfg: &Config,
) -> Result<TcpStream, SocksError> {
    debug!(proxy = %proxy, hostname = %hostname, "probing proxy");
    let mut stream = TcpStream::connect(proxy).await?;

    match cfg.socks.mode() {
        ConnectMode::Socks4a => {
            let frame =
                codec::socks4a_request(cfg.socks.dest_port(), cfg.socks.username(), hostname);
            socks4a_exchange(&mut stream, &frame).await?;
        }
        ConnectMode::Socks5 => {
            socks5_greet_exchange(&mut stream).await?;
            let frame = codec::socks5_request(cfg.socks.dest_port(), hostname)?;
            socks5_request_exchange(&mut stream, &frame).await?;
        }
        // Nothing to handshake; reaching the target is the whole test
        ConnectMode::Direct => {}
    }

    Ok(stream)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    fn probe_config(proxy: SocketAddr, mode: ConnectMode) -> Config {
        let mut cfg = Config::new();
        cfg.socks.proxy = Some(proxy);
        cfg.socks.mode = Some(mode);
        cfg.socks.dest_port = Some(80);
        cfg.retry.probe_backoff_secs = Some(0);
        cfg.node.virtual_addr = Some("fd87:d87e:eb43::1".parse().unwrap());
        cfg
    }

    #[tokio::test]
    async fn test_probe_socks5_succeeds() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let proxy = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            let (mut s, _) = listener.accept().await.unwrap();
            let mut greet = [0u8; 3];
            s.read_exact(&mut greet).await.unwrap();
            assert_eq!(greet, [5, 1, 0]);
            s.write_all(&[5, 0]).await.unwrap();

            let mut head = [0u8; 5];
            s.read_exact(&mut head).await.unwrap();
            let len = head[4] as usize;
            let mut rest = vec![0u8; len + 2];
            s.read_exact(&mut rest).await.unwrap();
            let hostname = String::from_utf8(rest[..len].to_vec()).unwrap();

            s.write_all(&[5, 0, 0, 1, 0, 0, 0, 0, 0, 0]).await.unwrap();
            hostname
        });

        let cfg = probe_config(proxy, ConnectMode::Socks5);
        let term = Arc::new(AtomicBool::new(false));

        let stream = probe_proxy(&cfg, &term).await.unwrap();
        drop(stream);

        // The probe targets our own derived hostname
        assert_eq!(server.await.unwrap(), "aaaaaaaaaaaaaaab.onion");
    }

    #[tokio::test]
    async fn test_probe_retries_after_rejection() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let proxy = listener.local_addr().unwrap();
        tokio::spawn(async move {
            // First attempt: reject the greeting
            let (mut s, _) = listener.accept().await.unwrap();
            let mut greet = [0u8; 3];
            s.read_exact(&mut greet).await.unwrap();
            s.write_all(&[5, 0xff]).await.unwrap();
            drop(s);

            // Second attempt: accept
            let (mut s, _) = listener.accept().await.unwrap();
            let mut greet = [0u8; 3];
            s.read_exact(&mut greet).await.unwrap();
            s.write_all(&[5, 0]).await.unwrap();
            let mut head = [0u8; 5];
            s.read_exact(&mut head).await.unwrap();
            let len = head[4] as usize;
            let mut rest = vec![0u8; len + 2];
            s.read_exact(&mut rest).await.unwrap();
            s.write_all(&[5, 0, 0, 1, 0, 0, 0, 0, 0, 0]).await.unwrap();
        });

        let cfg = probe_config(proxy, ConnectMode::Socks5);
        let term = Arc::new(AtomicBool::new(false));

        let result = tokio::time::timeout(
            Duration::from_secs(10),
            probe_proxy(&cfg, &term),
        )
        .await
        .expect("probe did not converge");
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_probe_terminates_on_flag() {
        let cfg = probe_config("127.0.0.1:1".parse().unwrap(), ConnectMode::Socks5);
        let term = Arc::new(AtomicBool::new(true));

        let err = probe_proxy(&cfg, &term).await.unwrap_err();
        assert!(matches!(err, SocksError::Terminated));
    }

    #[tokio::test]
    async fn test_probe_requires_local_address() {
        let mut cfg = probe_config("127.0.0.1:1".parse().unwrap(), ConnectMode::Socks5);
        cfg.node.virtual_addr = None;
        let term = Arc::new(AtomicBool::new(false));

        let err = probe_proxy(&cfg, &term).await.unwrap_err();
        assert!(matches!(err, SocksError::NoLocalAddress));
    }

    #[tokio::test]
    async fn test_probe_direct_mode_connects_only() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let proxy = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let _ = listener.accept().await;
        });

        let cfg = probe_config(proxy, ConnectMode::Direct);
        let term = Arc::new(AtomicBool::new(false));
        assert!(probe_proxy(&cfg, &term).await.is_ok());
    }
}
