//! SDF Filter Parser
//!
//! Parses IPFilterRule flow descriptions of the form
//! `permit out <proto> from <src> [<ports>] to <dst> [<ports>]` into the match
//! rule handed to the forwarding plane.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use crate::error::{UpfError, UpfResult};

// ============================================================================
// Match rule types
// ============================================================================

/// Protocol codes understood by the forwarding plane
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum SdfProtocol {
    Icmp = 0,
    Ip = 1,
    Tcp = 2,
    Udp = 3,
    Icmp6 = 4,
}

impl SdfProtocol {
    fn parse(token: &str) -> UpfResult<Self> {
        Ok(match token {
            "icmp" => Self::Icmp,
            "ip" => Self::Ip,
            "tcp" => Self::Tcp,
            "udp" => Self::Udp,
            "icmp6" => Self::Icmp6,
            _ => match token.parse::<u8>() {
                Ok(1) => Self::Icmp,
                Ok(6) => Self::Tcp,
                Ok(17) => Self::Udp,
                Ok(58) => Self::Icmp6,
                Ok(_) => Self::Ip,
                Err(_) => return Err(malformed(format!("unknown protocol '{token}'"))),
            },
        })
    }

    pub fn code(&self) -> u8 {
        *self as u8
    }
}

/// Address match, either a wildcard or an address normalized to its prefix
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IpWithMask {
    Any,
    V4 { addr: Ipv4Addr, prefix_len: u8 },
    V6 { addr: Ipv6Addr, prefix_len: u8 },
}

impl IpWithMask {
    /// Type tag used by the forwarding plane: 0 any, 1 IPv4, 2 IPv6
    pub fn type_tag(&self) -> u8 {
        match self {
            Self::Any => 0,
            Self::V4 { .. } => 1,
            Self::V6 { .. } => 2,
        }
    }

    pub fn v4(addr: Ipv4Addr, prefix_len: u8) -> Self {
        let mask = v4_mask(prefix_len);
        Self::V4 {
            addr: Ipv4Addr::from(u32::from(addr) & mask),
            prefix_len,
        }
    }

    pub fn v6(addr: Ipv6Addr, prefix_len: u8) -> Self {
        let mask = v6_mask(prefix_len);
        Self::V6 {
            addr: Ipv6Addr::from(u128::from(addr) & mask),
            prefix_len,
        }
    }

    /// Mask octets, 4 for IPv4, 16 for IPv6, empty for a wildcard
    pub fn mask_octets(&self) -> Vec<u8> {
        match self {
            Self::Any => Vec::new(),
            Self::V4 { prefix_len, .. } => v4_mask(*prefix_len).to_be_bytes().to_vec(),
            Self::V6 { prefix_len, .. } => v6_mask(*prefix_len).to_be_bytes().to_vec(),
        }
    }

    fn parse(token: &str, allow_assigned: bool) -> UpfResult<Self> {
        match token {
            "any" => return Ok(Self::Any),
            "assigned" if allow_assigned => return Ok(Self::Any),
            "assigned" => return Err(malformed("'assigned' is only valid as destination")),
            _ => {}
        }

        let (addr, prefix) = match token.split_once('/') {
            Some(("any", _)) => return Err(malformed("'any' cannot carry a mask")),
            Some((addr, prefix)) => {
                let prefix = prefix
                    .parse::<u8>()
                    .map_err(|_| malformed(format!("invalid prefix length in '{token}'")))?;
                (addr, Some(prefix))
            }
            None => (token, None),
        };

        match addr.parse::<IpAddr>() {
            Ok(IpAddr::V4(v4)) => {
                let prefix_len = prefix.unwrap_or(32);
                if prefix_len > 32 {
                    return Err(malformed(format!("prefix length {prefix_len} exceeds 32")));
                }
                Ok(Self::v4(v4, prefix_len))
            }
            Ok(IpAddr::V6(v6)) => {
                let prefix_len = prefix.unwrap_or(128);
                if prefix_len > 128 {
                    return Err(malformed(format!("prefix length {prefix_len} exceeds 128")));
                }
                Ok(Self::v6(v6, prefix_len))
            }
            Err(_) => Err(malformed(format!("invalid address '{addr}'"))),
        }
    }
}

impl fmt::Display for IpWithMask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Any => f.write_str("any"),
            Self::V4 { addr, prefix_len } => write!(f, "{addr}/{prefix_len}"),
            Self::V6 { addr, prefix_len } => write!(f, "{addr}/{prefix_len}"),
        }
    }
}

fn v4_mask(prefix_len: u8) -> u32 {
    match prefix_len {
        0 => 0,
        len => u32::MAX << (32 - u32::from(len.min(32))),
    }
}

fn v6_mask(prefix_len: u8) -> u128 {
    match prefix_len {
        0 => 0,
        len => u128::MAX << (128 - u32::from(len.min(128))),
    }
}

/// Inclusive port range
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PortRange {
    pub lower: u16,
    pub upper: u16,
}

impl PortRange {
    pub const FULL: Self = Self {
        lower: 0,
        upper: u16::MAX,
    };

    pub fn single(port: u16) -> Self {
        Self {
            lower: port,
            upper: port,
        }
    }

    fn parse(token: &str) -> UpfResult<Self> {
        let (lower, upper) = match token.split_once('-') {
            Some((lower, upper)) => (parse_port(lower)?, parse_port(upper)?),
            None => {
                let port = parse_port(token)?;
                (port, port)
            }
        };
        if lower > upper {
            return Err(malformed(format!("port range {lower}-{upper} is reversed")));
        }
        Ok(Self { lower, upper })
    }
}

impl Default for PortRange {
    fn default() -> Self {
        Self::FULL
    }
}

fn parse_port(token: &str) -> UpfResult<u16> {
    let value = token
        .parse::<u32>()
        .map_err(|_| malformed(format!("invalid port '{token}'")))?;
    u16::try_from(value).map_err(|_| malformed(format!("port {value} exceeds 65535")))
}

/// Structured SDF match rule
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SdfFilter {
    pub protocol: SdfProtocol,
    pub src: IpWithMask,
    pub src_ports: PortRange,
    pub dst: IpWithMask,
    pub dst_ports: PortRange,
}

fn malformed(reason: impl Into<String>) -> UpfError {
    UpfError::MalformedFilter(reason.into())
}

// ============================================================================
// Parser
// ============================================================================

/// Parse a flow description into an [`SdfFilter`]
pub fn parse_sdf_filter(description: &str) -> UpfResult<SdfFilter> {
    let mut tokens = description.split_whitespace().peekable();

    expect(tokens.next(), "permit")?;
    expect(tokens.next(), "out")?;
    let protocol = SdfProtocol::parse(tokens.next().ok_or_else(|| malformed("missing protocol"))?)?;
    expect(tokens.next(), "from")?;

    let src = IpWithMask::parse(
        tokens.next().ok_or_else(|| malformed("missing source address"))?,
        false,
    )?;
    let src_ports = match tokens.peek() {
        Some(&token) if token != "to" => {
            tokens.next();
            PortRange::parse(token)?
        }
        _ => PortRange::FULL,
    };

    expect(tokens.next(), "to")?;
    let dst = IpWithMask::parse(
        tokens.next().ok_or_else(|| malformed("missing destination address"))?,
        true,
    )?;
    let dst_ports = match tokens.next() {
        Some(token) => PortRange::parse(token)?,
        None => PortRange::FULL,
    };

    if let Some(extra) = tokens.next() {
        return Err(malformed(format!("unexpected trailing token '{extra}'")));
    }

    Ok(SdfFilter {
        protocol,
        src,
        src_ports,
        dst,
        dst_ports,
    })
}

fn expect(token: Option<&str>, keyword: &str) -> UpfResult<()> {
    match token {
        Some(t) if t == keyword => Ok(()),
        Some(t) => Err(malformed(format!("expected '{keyword}', found '{t}'"))),
        None => Err(malformed(format!("expected '{keyword}'"))),
    }
}
