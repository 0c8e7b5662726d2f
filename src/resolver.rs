//! Reverse-DNS wire format for the lookup path.
//!
//! When a virtual address has no hosts entry, the connector can ask a peer
//! nameserver for the full-length service name via a standard PTR query for
//! the address's `ip6.arpa` name. This module builds those queries and
//! validates the responses; socket handling lives in the connector.

use simple_dns::{Name, Packet, PacketFlag, Question, SimpleDnsError, CLASS, QCLASS, QTYPE, RCODE, TYPE};
use simple_dns::rdata::RData;
use std::net::Ipv6Addr;
use thiserror::Error;

const HEX_DIGITS: &[u8; 16] = b"0123456789abcdef";

/// Errors from reverse-DNS query handling.
#[derive(Debug, Error)]
pub enum ResolverError {
    #[error("DNS wire format error: {0}")]
    Wire(#[from] SimpleDnsError),

    #[error("response id {got} does not match query id {expected}")]
    IdMismatch { expected: u16, got: u16 },

    #[error("nameserver returned {0:?}")]
    Refused(RCODE),

    #[error("no matching PTR answer in response")]
    NoAnswer,
}

/// The `ip6.arpa` name for a virtual address: 32 reversed nibbles.
pub fn ptr_qname(addr: &Ipv6Addr) -> String {
    let mut out = String::with_capacity(72);
    for byte in addr.octets().iter().rev() {
        out.push(HEX_DIGITS[(byte & 0xf) as usize] as char);
        out.push('.');
        out.push(HEX_DIGITS[(byte >> 4) as usize] as char);
        out.push('.');
    }
    out.push_str("ip6.arpa");
    out
}

/// Build a PTR query datagram for the given virtual address.
pub fn build_ptr_query(addr: &Ipv6Addr, id: u16) -> Result<Vec<u8>, ResolverError> {
    let qname = ptr_qname(addr);
    let mut packet = Packet::new_query(id);
    packet.set_flags(PacketFlag::RECURSION_DESIRED);
    packet.questions.push(Question::new(
        Name::new_unchecked(&qname).into_owned(),
        QTYPE::TYPE(TYPE::PTR),
        QCLASS::CLASS(CLASS::IN),
        false,
    ));
    Ok(packet.build_bytes_vec()?)
}

/// Parse and validate a response to a query built by [`build_ptr_query`].
///
/// Checks the transaction id and response code, then returns the target of
/// the first PTR answer owned by the queried name. The trailing root dot,
/// if present, is stripped from the returned hostname.
pub fn parse_ptr_response(
    buf: &[u8],
    id: u16,
    addr: &Ipv6Addr,
) -> Result<String, ResolverError> {
    let packet = Packet::parse(buf)?;

    if packet.id() != id {
        return Err(ResolverError::IdMismatch {
            expected: id,
            got: packet.id(),
        });
    }
    if packet.rcode() != RCODE::NoError {
        return Err(ResolverError::Refused(packet.rcode()));
    }

    let qname = ptr_qname(addr);
    for answer in &packet.answers {
        if let RData::PTR(ptr) = &answer.rdata {
            let owner = answer.name.to_string();
            if !trim_root(&owner).eq_ignore_ascii_case(&qname) {
                continue;
            }
            let target = ptr.0.to_string();
            let target = trim_root(&target);
            if !target.is_empty() {
                return Ok(target.to_string());
            }
        }
    }

    Err(ResolverError::NoAnswer)
}

fn trim_root(name: &str) -> &str {
    name.strip_suffix('.').unwrap_or(name)
}
