use crate::classify::CertificateClassifier;
use crate::record::{extract_certificates, ParseIssue, ResponseKind};
use anyhow::Result;
use observatory_core::{format_ipv4, CertificateDigest, CertificateRecord, CertificateSink, Deduplicator, Observation, RawRow, TransactionWindow};
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct HarvestStats {
    pub rows: u64,
    pub empty: u64,
    pub handshake: u64,
    pub other: u64,
    pub records: u64,
    pub certificates_seen: u64,
    pub unique: u64,
    pub duplicates: u64,
    pub unclassified: u64,
    pub stored: u64,
    pub store_failures: u64,
    pub truncated_records: u64,
    pub truncated_messages: u64,
    pub truncated_containers: u64,
}

impl HarvestStats {
    fn count_issue(&mut self, issue: &ParseIssue) {
        match issue {
            ParseIssue::TruncatedRecord { .. } => self.truncated_records += 1,
            ParseIssue::TruncatedHandshakeMessage { .. } => self.truncated_messages += 1,
            ParseIssue::TruncatedCertificateContainer { .. } => self.truncated_containers += 1,
        }
    }
}

/// Offline stage: captures in, unique classified certificates out.
pub struct Harvester<S, C> {
    dedup: Arc<Deduplicator>,
    classifier: C,
    window: TransactionWindow<S>,
    stats: HarvestStats,
}

impl<S: CertificateSink, C: CertificateClassifier> Harvester<S, C> {
    pub fn new(sink: S, classifier: C, dedup: Arc<Deduplicator>, commit_interval: Duration) -> Self {
        Harvester { dedup, classifier, window: TransactionWindow::new(sink, commit_interval), stats: HarvestStats::default() }
    }

    pub fn stats(&self) -> &HarvestStats {
        &self.stats
    }

    pub fn process_row(&mut self, row: &RawRow) {
        self.process_response(row.ip, &row.response);
    }

    /// `source` only shows up in debug logs.
    pub fn process_response(&mut self, source: u32, response: &[u8]) {
        self.stats.rows += 1;
        match ResponseKind::of(response) {
            ResponseKind::Empty => {
                self.stats.empty += 1;
                return;
            }
            ResponseKind::Handshake => self.stats.handshake += 1,
            ResponseKind::Other => self.stats.other += 1,
        }
        let extraction = extract_certificates(response);
        self.stats.records += extraction.records as u64;
        for issue in &extraction.issues {
            tracing::debug!(ip = %format_ipv4(source), %issue, "capture truncated");
            self.stats.count_issue(issue);
        }
        for der in extraction.certificates {
            self.stats.certificates_seen += 1;
            match self.dedup.observe(CertificateDigest::of(der)) {
                Observation::Duplicate => self.stats.duplicates += 1,
                Observation::First => {
                    self.stats.unique += 1;
                    self.store(source, der);
                }
            }
        }
    }

    fn store(&mut self, source: u32, der: &[u8]) {
        let info = match self.classifier.classify(der) {
            Ok(info) => info,
            Err(e) => {
                tracing::debug!(ip = %format_ipv4(source), error = %e, "certificate not classified");
                self.stats.unclassified += 1;
                return;
            }
        };
        let record = CertificateRecord { key_type: info.key_type, bit_length: info.bit_length, der: der.to_vec() };
        match self.window.store_certificate(&record, Instant::now()) {
            Ok(()) => self.stats.stored += 1,
            Err(e) => {
                tracing::warn!(error = %e, "certificate insert failed");
                self.stats.store_failures += 1;
            }
        }
    }

    /// Commits the open transaction and hands back the sink.
    pub fn finish(mut self) -> Result<(HarvestStats, S)> {
        self.window.flush()?;
        Ok((self.stats, self.window.into_inner()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classify::{ClassifyError, KeyInfo};
    use crate::record::tests::{certificate_message, record, CERT_A, CERT_B};
    use observatory_core::{KeyType, Transactional};

    #[derive(Default)]
    struct MemoryCerts {
        rows: Vec<CertificateRecord>,
        commits: usize,
    }

    impl Transactional for MemoryCerts {
        fn begin_transaction(&mut self) -> Result<()> {
            Ok(())
        }
        fn commit_transaction(&mut self) -> Result<()> {
            self.commits += 1;
            Ok(())
        }
    }

    impl CertificateSink for MemoryCerts {
        fn insert_certificate(&mut self, record: &CertificateRecord) -> Result<()> {
            self.rows.push(record.clone());
            Ok(())
        }
    }

    /// RSA with eight bits per byte; refuses anything starting with `x`.
    struct ByLength;

    impl CertificateClassifier for ByLength {
        fn classify(&self, der: &[u8]) -> Result<KeyInfo, ClassifyError> {
            if der.first() == Some(&b'x') {
                return Err(ClassifyError::Undecodable);
            }
            Ok(KeyInfo { key_type: KeyType::Rsa, bit_length: der.len() as u32 * 8 })
        }
    }

    fn harvester() -> Harvester<MemoryCerts, ByLength> {
        Harvester::new(MemoryCerts::default(), ByLength, Arc::new(Deduplicator::new()), Duration::from_secs(5))
    }

    #[test]
    fn identical_certificates_are_stored_once() {
        let capture = record(22, &certificate_message(&[CERT_A, CERT_B]));
        let mut h = harvester();
        h.process_response(1, &capture);
        h.process_response(2, &capture);
        let reordered = record(22, &certificate_message(&[CERT_B, CERT_A]));
        h.process_response(3, &reordered);

        let (stats, sink) = h.finish().unwrap();
        assert_eq!(stats.certificates_seen, 6);
        assert_eq!(stats.unique, 2);
        assert_eq!(stats.duplicates, 4);
        assert_eq!(stats.stored, 2);
        assert_eq!(sink.commits, 1);
        assert_eq!(sink.rows.len(), 2);
        assert_eq!(sink.rows[0].der, CERT_A);
        assert_eq!(sink.rows[0].bit_length, 24);
        assert_eq!(sink.rows[1].der, CERT_B);
    }

    #[test]
    fn unclassified_certificates_are_counted_not_stored() {
        let capture = record(22, &certificate_message(&[b"xyz", CERT_A]));
        let mut h = harvester();
        h.process_response(1, &capture);
        h.process_response(1, &capture);
        let (stats, sink) = h.finish().unwrap();
        assert_eq!(stats.unclassified, 1);
        assert_eq!(stats.stored, 1);
        assert_eq!(stats.duplicates, 2);
        assert_eq!(sink.rows.len(), 1);
    }

    #[test]
    fn triage_and_issue_counters() {
        let mut h = harvester();
        h.process_row(&RawRow { ip: 1, port: 443, fetched_at_ms: 0, result: 2, response: vec![] });
        h.process_row(&RawRow { ip: 2, port: 443, fetched_at_ms: 0, result: 4, response: vec![21, 3, 3, 0, 2, 2, 40] });
        let mut truncated = record(22, &certificate_message(&[CERT_A]));
        truncated.truncate(truncated.len() - 1);
        h.process_row(&RawRow { ip: 3, port: 443, fetched_at_ms: 0, result: 4, response: truncated });

        let stats = *h.stats();
        assert_eq!((stats.rows, stats.empty, stats.other, stats.handshake), (3, 1, 1, 1));
        assert_eq!(stats.truncated_records, 1);
        assert_eq!(stats.certificates_seen, 0);
    }

    #[test]
    fn shared_deduplicator_spans_harvesters() {
        let dedup = Arc::new(Deduplicator::new());
        let capture = record(22, &certificate_message(&[CERT_A]));
        let mut first = Harvester::new(MemoryCerts::default(), ByLength, dedup.clone(), Duration::from_secs(5));
        first.process_response(1, &capture);
        let mut second = Harvester::new(MemoryCerts::default(), ByLength, dedup.clone(), Duration::from_secs(5));
        second.process_response(2, &capture);
        assert_eq!(first.stats().stored, 1);
        assert_eq!(second.stats().duplicates, 1);
        assert_eq!(dedup.len(), 1);
    }
}
