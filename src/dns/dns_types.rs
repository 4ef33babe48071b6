//! DNS Type Definitions
//!
//! Record types, response codes and the error type shared by the wire codec,
//! the request dispatcher and the network listeners.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::{Ipv4Addr, Ipv6Addr};

/// Query/record types handled by the director
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "UPPERCASE")]
pub enum RecordType {
    /// IPv4 address record
    A,
    /// Name server
    NS,
    /// Canonical name (alias)
    CNAME,
    /// Start of authority
    SOA,
    /// Text record (carries the gossip control channel)
    TXT,
    /// IPv6 address record
    AAAA,
    /// EDNS0 pseudo record
    OPT,
    /// Any type (QTYPE only)
    ANY,
    /// Anything else, kept by value so it can be logged
    Other(u16),
}

impl RecordType {
    /// Wire value of the type
    pub fn code(&self) -> u16 {
        match self {
            RecordType::A => 1,
            RecordType::NS => 2,
            RecordType::CNAME => 5,
            RecordType::SOA => 6,
            RecordType::TXT => 16,
            RecordType::AAAA => 28,
            RecordType::OPT => 41,
            RecordType::ANY => 255,
            RecordType::Other(code) => *code,
        }
    }

    /// Map a wire value to a type
    pub fn from_code(code: u16) -> Self {
        match code {
            1 => RecordType::A,
            2 => RecordType::NS,
            5 => RecordType::CNAME,
            6 => RecordType::SOA,
            16 => RecordType::TXT,
            28 => RecordType::AAAA,
            41 => RecordType::OPT,
            255 => RecordType::ANY,
            other => RecordType::Other(other),
        }
    }
}

impl fmt::Display for RecordType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RecordType::A => write!(f, "A"),
            RecordType::NS => write!(f, "NS"),
            RecordType::CNAME => write!(f, "CNAME"),
            RecordType::SOA => write!(f, "SOA"),
            RecordType::TXT => write!(f, "TXT"),
            RecordType::AAAA => write!(f, "AAAA"),
            RecordType::OPT => write!(f, "OPT"),
            RecordType::ANY => write!(f, "ANY"),
            RecordType::Other(code) => write!(f, "TYPE{}", code),
        }
    }
}

/// DNS response codes used by the director
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseCode {
    NoError,
    FormErr,
    ServFail,
    NXDomain,
    NotImp,
    Refused,
}

impl ResponseCode {
    /// 4-bit RCODE value
    pub fn code(&self) -> u8 {
        match self {
            ResponseCode::NoError => 0,
            ResponseCode::FormErr => 1,
            ResponseCode::ServFail => 2,
            ResponseCode::NXDomain => 3,
            ResponseCode::NotImp => 4,
            ResponseCode::Refused => 5,
        }
    }

    pub fn is_success(&self) -> bool {
        *self == ResponseCode::NoError
    }
}

/// Start of authority data. Timers come from configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Soa {
    /// Primary nameserver
    pub mname: String,
    /// Admin mailbox in DNS form (admin.example.com)
    pub rname: String,
    pub serial: u32,
    pub refresh: u32,
    pub retry: u32,
    pub expire: u32,
    pub minimum: u32,
}

/// Record data the director can emit
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordData {
    A(Ipv4Addr),
    AAAA(Ipv6Addr),
    CNAME(String),
    NS(String),
    SOA(Soa),
}

impl RecordData {
    pub fn record_type(&self) -> RecordType {
        match self {
            RecordData::A(_) => RecordType::A,
            RecordData::AAAA(_) => RecordType::AAAA,
            RecordData::CNAME(_) => RecordType::CNAME,
            RecordData::NS(_) => RecordType::NS,
            RecordData::SOA(_) => RecordType::SOA,
        }
    }
}

/// A resource record ready to be encoded
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceRecord {
    /// Owner name, without trailing dot
    pub name: String,
    pub ttl: u32,
    pub data: RecordData,
}

impl ResourceRecord {
    pub fn new(name: impl Into<String>, ttl: u32, data: RecordData) -> Self {
        Self {
            name: name.into(),
            ttl,
            data,
        }
    }

    /// Short text form used in the per-query log line
    pub fn summary(&self) -> String {
        match &self.data {
            RecordData::A(ip) => format!("A {}", ip),
            RecordData::AAAA(ip) => format!("AAAA {}", ip),
            RecordData::CNAME(target) => format!("CNAME {}.", target),
            RecordData::NS(host) => format!("NS {}.", host),
            RecordData::SOA(_) => "SOA".to_string(),
        }
    }
}

/// DNS error types
#[derive(Debug, thiserror::Error)]
pub enum DnsError {
    #[error("Malformed packet: {0}")]
    MalformedPacket(String),

    #[error("Encode error: {0}")]
    Encode(String),

    #[error("Server error: {0}")]
    ServerError(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),
}
