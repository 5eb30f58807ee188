//! IPv4 utilities. Addresses and CIDR blocks are represented as inclusive
//! integer intervals so that rule matching and destination checks reduce to
//! interval containment.

use std::fmt;

/// An inclusive interval of IPv4 addresses. A single address is an interval
/// of width one; a CIDR block `a.b.c.d/p` is the interval of width
/// `2^(32 - p)` aligned on its prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct IpRange {
    low: u32,
    high: u32,
}

impl IpRange {
    /// Parses either a dotted-quad address (`10.0.0.1`) or a CIDR block
    /// (`10.0.0.0/24`). CIDR lows are aligned by zeroing the host bits.
    pub fn parse(s: &str) -> Result<Self, IpError> {
        let (addr, prefix) = match s.split_once('/') {
            Some((addr, p)) => {
                let prefix = p
                    .parse::<u32>()
                    .ok()
                    .filter(|&p| p <= 32)
                    .ok_or_else(|| IpError::BadPrefix(s.to_string()))?;
                (addr, prefix)
            }
            None => (s, 32),
        };
        let value = parse_dotted_quad(addr).ok_or_else(|| IpError::BadAddress(s.to_string()))?;
        let width = 32 - prefix;
        let low = if width == 32 {
            0
        } else {
            (value >> width) << width
        };
        let span = if width == 32 {
            u32::MAX
        } else {
            (1u32 << width) - 1
        };
        Ok(Self {
            low,
            high: low + span,
        })
    }

    /// Returns true iff `other` lies entirely within `self`.
    pub fn contains(&self, other: &IpRange) -> bool {
        self.low <= other.low && other.high <= self.high
    }

    /// The lowest address in the interval.
    pub fn low(&self) -> u32 {
        self.low
    }

    /// The highest address in the interval.
    pub fn high(&self) -> u32 {
        self.high
    }
}

impl fmt::Display for IpRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", int_to_ip(self.low), int_to_ip(self.high))
    }
}

fn parse_dotted_quad(s: &str) -> Option<u32> {
    let mut octets = s.split('.');
    let mut value = 0u32;
    for _ in 0..4 {
        let field = octets.next()?;
        // digits only, so no signs or whitespace sneak through
        if field.is_empty() || !field.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        let octet = field.parse::<u32>().ok().filter(|&v| v <= 255)?;
        value = (value << 8) | octet;
    }
    octets.next().is_none().then_some(value)
}

/// Lexical check for IP or CIDR format. Cheaper than [`IpRange::parse`] and
/// used by flow validation, which only needs a yes/no answer.
pub fn is_ip_format(s: &str) -> bool {
    let (addr, prefix) = match s.split_once('/') {
        Some((addr, p)) => (addr, Some(p)),
        None => (s, None),
    };
    if let Some(p) = prefix {
        if p.parse::<u32>().ok().filter(|&p| p <= 32).is_none() {
            return false;
        }
    }
    parse_dotted_quad(addr).is_some()
}

/// Renders a 32-bit integer as a dotted-quad address.
pub fn int_to_ip(value: u32) -> String {
    format!(
        "{}.{}.{}.{}",
        value >> 24,
        (value >> 16) & 0xff,
        (value >> 8) & 0xff,
        value & 0xff
    )
}

/// The error type for IPv4 parsing.
#[derive(Debug, Clone, thiserror::Error)]
pub enum IpError {
    /// Not a dotted-quad address.
    #[error("malformed IPv4 address `{0}`")]
    BadAddress(String),

    /// CIDR prefix missing, non-numeric, or greater than 32.
    #[error("malformed CIDR prefix in `{0}`")]
    BadPrefix(String),
}
