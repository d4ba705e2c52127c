use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;
use time::OffsetDateTime;

/// How a probe ended. The discriminants are the integers stored in `raw_data.result`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum ResultCode {
    ConnectFailed = 0,
    TcpHandshakeTimeout = 1,
    TlsHandshakeCompleted = 2,
    TlsHandshakeTimeout = 3,
    TlsError = 4,
}

impl ResultCode {
    pub fn as_i64(self) -> i64 {
        self as u8 as i64
    }

    pub fn from_i64(v: i64) -> Option<Self> {
        match v {
            0 => Some(Self::ConnectFailed),
            1 => Some(Self::TcpHandshakeTimeout),
            2 => Some(Self::TlsHandshakeCompleted),
            3 => Some(Self::TlsHandshakeTimeout),
            4 => Some(Self::TlsError),
            _ => None,
        }
    }

    pub fn is_timeout(self) -> bool {
        matches!(self, Self::TcpHandshakeTimeout | Self::TlsHandshakeTimeout)
    }
}

impl std::fmt::Display for ResultCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::ConnectFailed => "connect-failed",
            Self::TcpHandshakeTimeout => "tcp-timeout",
            Self::TlsHandshakeCompleted => "tls-completed",
            Self::TlsHandshakeTimeout => "tls-timeout",
            Self::TlsError => "tls-error",
        };
        f.write_str(s)
    }
}

/// Result of probing one address. Addresses are host-order integers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanOutcome {
    pub address: u32,
    pub port: u16,
    pub result: ResultCode,
    pub raw: Vec<u8>,
    pub fetched_at_ms: u64,
}

impl ScanOutcome {
    pub fn connect_failed(address: u32, port: u16, fetched_at_ms: u64) -> Self {
        ScanOutcome { address, port, result: ResultCode::ConnectFailed, raw: Vec::new(), fetched_at_ms }
    }
}

/// A `raw_data` row read back for offline processing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawRow {
    pub ip: u32,
    pub port: u16,
    pub fetched_at_ms: u64,
    pub result: i64,
    pub response: Vec<u8>,
}

impl From<ScanOutcome> for RawRow {
    fn from(o: ScanOutcome) -> Self {
        RawRow { ip: o.address, port: o.port, fetched_at_ms: o.fetched_at_ms, result: o.result.as_i64(), response: o.raw }
    }
}

/// Public-key family of a harvested certificate. Discriminants are the stored `KeyType` values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum KeyType {
    Rsa = 0,
    Ec = 1,
    Dsa = 2,
    Dh = 3,
}

impl KeyType {
    pub fn as_i64(self) -> i64 {
        self as u8 as i64
    }

    pub fn from_i64(v: i64) -> Option<Self> {
        match v {
            0 => Some(Self::Rsa),
            1 => Some(Self::Ec),
            2 => Some(Self::Dsa),
            3 => Some(Self::Dh),
            _ => None,
        }
    }
}

impl std::fmt::Display for KeyType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Rsa => "RSA",
            Self::Ec => "EC",
            Self::Dsa => "DSA",
            Self::Dh => "DH",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertificateRecord {
    pub key_type: KeyType,
    pub bit_length: u32,
    pub der: Vec<u8>,
}

pub fn format_ipv4(address: u32) -> String {
    Ipv4Addr::from(address).to_string()
}

/// Wall-clock time as Unix epoch milliseconds.
pub fn unix_millis() -> u64 {
    let ms = OffsetDateTime::now_utc().unix_timestamp_nanos() / 1_000_000;
    u64::try_from(ms).unwrap_or(0)
}
