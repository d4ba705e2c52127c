//! Core types shared by the scanner, the certificate extractor and the stores.

pub mod dedup;
pub mod digest;
pub mod outcome;
pub mod sink;

pub use dedup::{Deduplicator, Observation};
pub use digest::{CertificateDigest, ContentHasher, DigestParseError};
pub use outcome::{format_ipv4, unix_millis, CertificateRecord, KeyType, RawRow, ResultCode, ScanOutcome};
pub use sink::{BatchReport, CertificateSink, RawResultSink, Transactional, TransactionWindow};

pub const fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
