//! Offline stage: pull X.509 certificates out of stored handshake captures,
//! deduplicate them by SHA-256 and classify their public keys.

pub mod classify;
pub mod harvest;
pub mod record;

pub use classify::{CertificateClassifier, ClassifyError, KeyInfo, X509Classifier};
pub use harvest::{HarvestStats, Harvester};
pub use record::{
    certificate_entries, extract_certificates, record_at, Extraction, HandshakeMessageView, HandshakeMessages, ParseIssue,
    ResponseKind, TlsRecordView, CONTENT_TYPE_HANDSHAKE, HANDSHAKE_CERTIFICATE,
};
