//! Binary tunnel handshake codec.
//!
//! Wire format of the first client message:
//!
//! ```text
//! +---------+--------------+-----------+--------+---------+------+------+---------+---------+
//! | version | identity     | addon len | addon  | command | port | atyp | address | payload |
//! | 1 byte  | 16 bytes     | 1 byte    | N      | 1 byte  | 2 BE | 1    | var     | rest    |
//! +---------+--------------+-----------+--------+---------+------+------+---------+---------+
//! ```
//!
//! Address types: `1` = IPv4 (4 bytes), `2` = domain (1 length byte + name),
//! `3` = IPv6 (16 bytes). Anything after the address is application payload
//! that must reach the target before relaying starts.
//!
//! Every rejection is reported with its own variant for diagnostics, but the
//! caller is expected to treat them all the same way: close without a reply.

use crate::identity::{Identity, IDENTITY_LEN};
use std::fmt;
use std::net::{Ipv4Addr, Ipv6Addr};
use thiserror::Error;

/// version + identity + addon length.
pub const MIN_HANDSHAKE_LEN: usize = 1 + IDENTITY_LEN + 1;

/// The only supported command: open a TCP stream.
pub const CMD_TCP: u8 = 1;

pub const ATYP_IPV4: u8 = 1;
pub const ATYP_DOMAIN: u8 = 2;
pub const ATYP_IPV6: u8 = 3;

/// Why a handshake was refused.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HandshakeError {
    #[error("first message was not binary")]
    NotBinary,

    #[error("handshake too short: {0} bytes")]
    TooShort(usize),

    #[error("identity mismatch")]
    IdentityMismatch,

    #[error("truncated while reading {0}")]
    Truncated(&'static str),

    #[error("unsupported command: {0}")]
    UnsupportedCommand(u8),

    #[error("unsupported address type: {0}")]
    UnsupportedAddressType(u8),

    #[error("invalid domain name")]
    InvalidDomain,

    #[error("addon too long: {0} bytes")]
    AddonTooLong(usize),
}

/// Destination host requested by the client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TargetAddr {
    Ipv4(Ipv4Addr),
    Domain(String),
    Ipv6(Ipv6Addr),
}

impl fmt::Display for TargetAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TargetAddr::Ipv4(ip) => write!(f, "{ip}"),
            TargetAddr::Domain(name) => f.write_str(name),
            TargetAddr::Ipv6(ip) => write!(f, "[{ip}]"),
        }
    }
}

/// A validated handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Handshake {
    /// Protocol version byte, echoed back in the acknowledgement.
    pub version: u8,
    /// Destination host.
    pub target: TargetAddr,
    /// Destination port.
    pub port: u16,
    /// Bytes that followed the address; first uplink chunk.
    pub payload: Vec<u8>,
}

impl Handshake {
    /// The 2-byte acknowledgement the server sends before relaying.
    pub fn ack(&self) -> [u8; 2] {
        [self.version, 0]
    }

    /// `host:port` for logs.
    pub fn endpoint(&self) -> String {
        format!("{}:{}", self.target, self.port)
    }

    /// Serialize back to wire form (the client side of the exchange).
    ///
    /// Fails only when a domain target does not fit in a length byte.
    pub fn encode(&self, identity: &Identity, addon: &[u8]) -> Result<Vec<u8>, HandshakeError> {
        let addon_len = u8::try_from(addon.len()).map_err(|_| HandshakeError::AddonTooLong(addon.len()))?;

        let mut out = Vec::with_capacity(MIN_HANDSHAKE_LEN + addon.len() + 24 + self.payload.len());
        out.push(self.version);
        out.extend_from_slice(identity.as_bytes());
        out.push(addon_len);
        out.extend_from_slice(addon);
        out.push(CMD_TCP);
        out.extend_from_slice(&self.port.to_be_bytes());
        match &self.target {
            TargetAddr::Ipv4(ip) => {
                out.push(ATYP_IPV4);
                out.extend_from_slice(&ip.octets());
            }
            TargetAddr::Domain(name) => {
                let len = u8::try_from(name.len()).map_err(|_| HandshakeError::InvalidDomain)?;
                if len == 0 {
                    return Err(HandshakeError::InvalidDomain);
                }
                out.push(ATYP_DOMAIN);
                out.push(len);
                out.extend_from_slice(name.as_bytes());
            }
            TargetAddr::Ipv6(ip) => {
                out.push(ATYP_IPV6);
                out.extend_from_slice(&ip.octets());
            }
        }
        out.extend_from_slice(&self.payload);
        Ok(out)
    }
}

/// Forward-only cursor over the handshake bytes.
struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn take(&mut self, n: usize, field: &'static str) -> Result<&'a [u8], HandshakeError> {
        let end = self
            .pos
            .checked_add(n)
            .filter(|end| *end <= self.buf.len())
            .ok_or(HandshakeError::Truncated(field))?;
        let slice = &self.buf[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn byte(&mut self, field: &'static str) -> Result<u8, HandshakeError> {
        Ok(self.take(1, field)?[0])
    }

    fn rest(self) -> &'a [u8] {
        &self.buf[self.pos..]
    }
}

/// Parse and validate the first client message against `identity`.
///
/// Checks run in wire order and stop at the first failure.
pub fn parse_handshake(message: &[u8], identity: &Identity) -> Result<Handshake, HandshakeError> {
    if message.len() < MIN_HANDSHAKE_LEN {
        return Err(HandshakeError::TooShort(message.len()));
    }

    let mut r = Reader::new(message);
    let version = r.byte("version")?;

    if !identity.matches(r.take(IDENTITY_LEN, "identity")?) {
        return Err(HandshakeError::IdentityMismatch);
    }

    let addon_len = r.byte("addon length")? as usize;
    r.take(addon_len, "addon")?;

    let command = r.byte("command")?;
    if command != CMD_TCP {
        return Err(HandshakeError::UnsupportedCommand(command));
    }

    let port_bytes = r.take(2, "port")?;
    let port = u16::from_be_bytes([port_bytes[0], port_bytes[1]]);

    let target = match r.byte("address type")? {
        ATYP_IPV4 => {
            let b = r.take(4, "ipv4 address")?;
            TargetAddr::Ipv4(Ipv4Addr::new(b[0], b[1], b[2], b[3]))
        }
        ATYP_DOMAIN => {
            let len = r.byte("domain length")? as usize;
            let raw = r.take(len, "domain")?;
            let name = std::str::from_utf8(raw).map_err(|_| HandshakeError::InvalidDomain)?;
            if name.is_empty() {
                return Err(HandshakeError::InvalidDomain);
            }
            TargetAddr::Domain(name.to_string())
        }
        ATYP_IPV6 => {
            let b = r.take(16, "ipv6 address")?;
            let mut octets = [0u8; 16];
            octets.copy_from_slice(b);
            TargetAddr::Ipv6(Ipv6Addr::from(octets))
        }
        other => return Err(HandshakeError::UnsupportedAddressType(other)),
    };

    Ok(Handshake {
        version,
        target,
        port,
        payload: r.rest().to_vec(),
    })
}
