//! SOCKS4a and SOCKS5 frame codecs.
//!
//! Pure builders and parsers; all socket I/O lives in the connector. Only
//! the client side of the protocols is spoken, CONNECT command only, and
//! SOCKS5 requests always carry the DOMAIN address type: targets are
//! hidden-service hostnames the proxy resolves internally (RFC 1928).

use thiserror::Error;

/// SOCKS5 greeting: version 5, one method, "no authentication".
pub const SOCKS5_GREETING: [u8; 3] = [5, 1, 0];

/// Length of a SOCKS4a reply.
pub const SOCKS4A_REPLY_LEN: usize = 8;

/// SOCKS4a status for a granted request.
const SOCKS4A_GRANTED: u8 = 90;

/// Protocol errors in SOCKS replies.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CodecError {
    #[error("hostname too long for SOCKS5 request: {0} bytes")]
    HostnameTooLong(usize),

    #[error("unexpected SOCKS4a reply version {0}")]
    Socks4aVersion(u8),

    #[error("SOCKS4a request failed, status {0}")]
    Socks4aRejected(u8),

    #[error("unexpected SOCKS5 greet reply: version {version}, method {method}")]
    Socks5GreetRejected { version: u8, method: u8 },

    #[error("malformed SOCKS5 reply")]
    Socks5Malformed,

    #[error("SOCKS5 server returned error {0}")]
    Socks5Rejected(u8),
}

/// Build a SOCKS4a CONNECT request.
///
/// The destination address `0.0.0.1` tells the proxy that the real target
/// is the hostname following the user id.
pub fn socks4a_request(port: u16, userid: &str, hostname: &str) -> Vec<u8> {
    let mut buf = Vec::with_capacity(8 + userid.len() + hostname.len() + 2);
    buf.push(4); // version
    buf.push(1); // CONNECT
    buf.extend_from_slice(&port.to_be_bytes());
    buf.extend_from_slice(&[0, 0, 0, 1]); // 0.0.0.1: hostname follows
    buf.extend_from_slice(userid.as_bytes());
    buf.push(0);
    buf.extend_from_slice(hostname.as_bytes());
    buf.push(0);
    buf
}

/// Validate a SOCKS4a reply: version 0, request granted.
pub fn parse_socks4a_reply(buf: &[u8; SOCKS4A_REPLY_LEN]) -> Result<(), CodecError> {
    if buf[0] != 0 {
        return Err(CodecError::Socks4aVersion(buf[0]));
    }
    if buf[1] != SOCKS4A_GRANTED {
        return Err(CodecError::Socks4aRejected(buf[1]));
    }
    Ok(())
}

/// Validate a SOCKS5 greet reply: must be exactly version 5, method 0.
pub fn parse_socks5_greet_reply(buf: &[u8; 2]) -> Result<(), CodecError> {
    if buf[0] != 5 || buf[1] != 0 {
        return Err(CodecError::Socks5GreetRejected {
            version: buf[0],
            method: buf[1],
        });
    }
    Ok(())
}

/// Build a SOCKS5 CONNECT request with a DOMAIN target.
pub fn socks5_request(port: u16, hostname: &str) -> Result<Vec<u8>, CodecError> {
    if hostname.len() > u8::MAX as usize {
        return Err(CodecError::HostnameTooLong(hostname.len()));
    }

    let mut buf = Vec::with_capacity(7 + hostname.len());
    buf.push(5); // version
    buf.push(1); // CONNECT
    buf.push(0); // reserved
    buf.push(3); // address type: DOMAIN
    buf.push(hostname.len() as u8);
    buf.extend_from_slice(hostname.as_bytes());
    buf.extend_from_slice(&port.to_be_bytes());
    Ok(buf)
}

/// Address type of the bound-address trailer in a SOCKS5 reply.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Socks5Atyp {
    V4,
    Domain,
    V6,
}

impl Socks5Atyp {
    /// Remaining trailer length after the fixed header, including the
    /// bound port. `None` for DOMAIN, where a length byte follows first.
    pub fn fixed_tail_len(self) -> Option<usize> {
        match self {
            Socks5Atyp::V4 => Some(4 + 2),
            Socks5Atyp::Domain => None,
            Socks5Atyp::V6 => Some(16 + 2),
        }
    }
}

/// Validate the fixed header of a SOCKS5 request reply.
///
/// Returns the address type of the bound-address trailer, which the caller
/// consumes and discards to leave the stream clean for the peer layer.
pub fn parse_socks5_reply_header(buf: &[u8; 4]) -> Result<Socks5Atyp, CodecError> {
    if buf[0] != 5 || buf[2] != 0 {
        return Err(CodecError::Socks5Malformed);
    }
    if buf[1] != 0 {
        return Err(CodecError::Socks5Rejected(buf[1]));
    }
    match buf[3] {
        1 => Ok(Socks5Atyp::V4),
        3 => Ok(Socks5Atyp::Domain),
        4 => Ok(Socks5Atyp::V6),
        _ => Err(CodecError::Socks5Malformed),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Proxy-side parse of a SOCKS4a request, for round-trip checks.
    fn parse_socks4a_request(buf: &[u8]) -> (u16, String, String) {
        assert_eq!(buf[0], 4, "version");
        assert_eq!(buf[1], 1, "command");
        let port = u16::from_be_bytes([buf[2], buf[3]]);
        assert_eq!(&buf[4..8], &[0, 0, 0, 1], "hostname-follows sentinel");

        let rest = &buf[8..];
        let nul = rest.iter().position(|&b| b == 0).expect("userid NUL");
        let userid = String::from_utf8(rest[..nul].to_vec()).unwrap();
        let rest = &rest[nul + 1..];
        let nul = rest.iter().position(|&b| b == 0).expect("hostname NUL");
        let hostname = String::from_utf8(rest[..nul].to_vec()).unwrap();
        assert_eq!(nul + 1, rest.len(), "nothing after hostname NUL");

        (port, userid, hostname)
    }

    /// Proxy-side parse of a SOCKS5 request, for round-trip checks.
    fn parse_socks5_request(buf: &[u8]) -> (u16, String) {
        assert_eq!(&buf[..4], &[5, 1, 0, 3], "version/command/reserved/DOMAIN");
        let len = buf[4] as usize;
        let hostname = String::from_utf8(buf[5..5 + len].to_vec()).unwrap();
        let port = u16::from_be_bytes([buf[5 + len], buf[6 + len]]);
        assert_eq!(buf.len(), 7 + len);
        (port, hostname)
    }

    #[test]
    fn test_socks4a_round_trip() {
        let frame = socks4a_request(8060, "veild", "facebookcorewwwi.onion");
        let (port, userid, hostname) = parse_socks4a_request(&frame);
        assert_eq!(port, 8060);
        assert_eq!(userid, "veild");
        assert_eq!(hostname, "facebookcorewwwi.onion");
    }

    #[test]
    fn test_socks4a_empty_userid() {
        let frame = socks4a_request(80, "", "x.onion");
        let (port, userid, hostname) = parse_socks4a_request(&frame);
        assert_eq!(port, 80);
        assert_eq!(userid, "");
        assert_eq!(hostname, "x.onion");
    }

    #[test]
    fn test_socks4a_reply() {
        assert_eq!(parse_socks4a_reply(&[0, 90, 0, 0, 0, 0, 0, 0]), Ok(()));
        assert_eq!(
            parse_socks4a_reply(&[0, 0x5b, 0, 0, 0, 0, 0, 0]),
            Err(CodecError::Socks4aRejected(0x5b))
        );
        assert_eq!(
            parse_socks4a_reply(&[4, 90, 0, 0, 0, 0, 0, 0]),
            Err(CodecError::Socks4aVersion(4))
        );
    }

    #[test]
    fn test_socks5_greeting_bytes() {
        assert_eq!(SOCKS5_GREETING, [0x05, 0x01, 0x00]);
    }

    #[test]
    fn test_socks5_greet_reply() {
        assert_eq!(parse_socks5_greet_reply(&[5, 0]), Ok(()));
        assert_eq!(
            parse_socks5_greet_reply(&[5, 0xff]),
            Err(CodecError::Socks5GreetRejected {
                version: 5,
                method: 0xff
            })
        );
        assert!(parse_socks5_greet_reply(&[4, 0]).is_err());
    }

    #[test]
    fn test_socks5_request_round_trip() {
        let frame = socks5_request(80, "facebookcorewwwi.onion").unwrap();
        // Exact bytes: 05 01 00 03, len 0x16, hostname, port 00 50
        assert_eq!(&frame[..5], &[0x05, 0x01, 0x00, 0x03, 0x16]);
        assert_eq!(&frame[frame.len() - 2..], &[0x00, 0x50]);

        let (port, hostname) = parse_socks5_request(&frame);
        assert_eq!(port, 80);
        assert_eq!(hostname, "facebookcorewwwi.onion");
    }

    #[test]
    fn test_socks5_request_hostname_too_long() {
        let long = "a".repeat(256);
        assert_eq!(
            socks5_request(80, &long),
            Err(CodecError::HostnameTooLong(256))
        );
    }

    #[test]
    fn test_socks5_reply_header() {
        assert_eq!(
            parse_socks5_reply_header(&[5, 0, 0, 1]),
            Ok(Socks5Atyp::V4)
        );
        assert_eq!(
            parse_socks5_reply_header(&[5, 0, 0, 4]),
            Ok(Socks5Atyp::V6)
        );
        assert_eq!(
            parse_socks5_reply_header(&[5, 0, 0, 3]),
            Ok(Socks5Atyp::Domain)
        );
        assert_eq!(
            parse_socks5_reply_header(&[5, 1, 0, 1]),
            Err(CodecError::Socks5Rejected(1))
        );
        assert_eq!(
            parse_socks5_reply_header(&[4, 0, 0, 1]),
            Err(CodecError::Socks5Malformed)
        );
        assert_eq!(
            parse_socks5_reply_header(&[5, 0, 7, 1]),
            Err(CodecError::Socks5Malformed)
        );
    }

    #[test]
    fn test_socks5_tail_lengths() {
        assert_eq!(Socks5Atyp::V4.fixed_tail_len(), Some(6));
        assert_eq!(Socks5Atyp::V6.fixed_tail_len(), Some(18));
        assert_eq!(Socks5Atyp::Domain.fixed_tail_len(), None);
    }
}
