use crate::{Db, RunCounters, RunMeta};
use anyhow::Result;
use observatory_core::{CertificateRecord, CertificateSink, RawResultSink, ScanOutcome, Transactional};
use rusqlite::params;
use uuid::Uuid;

impl Db {
    pub fn begin_run(&self, meta: &RunMeta) -> Result<Uuid> {
        self.conn.execute(
            "INSERT INTO runs(run_id, started_at, tool_version, args_json, seed) VALUES (?,?,?,?,?)",
            // the seed is stored bit-for-bit as a signed integer
            params![meta.run_id.to_string(), meta.started_at, meta.tool_version, meta.args_json, meta.seed.map(|s| s as i64)],
        )?;
        Ok(meta.run_id)
    }

    pub fn finish_run(&self, run_id: &Uuid, finished_at: i64, counters: &RunCounters) -> Result<()> {
        self.conn.execute(
            "UPDATE runs SET finished_at=?, attempted=?, completed=?, stored=?, error_count=? WHERE run_id=?",
            params![finished_at, counters.attempted, counters.completed, counters.stored, counters.error_count, run_id.to_string()],
        )?;
        Ok(())
    }
}

impl Transactional for Db {
    fn begin_transaction(&mut self) -> Result<()> {
        self.conn.execute_batch("BEGIN")?;
        Ok(())
    }

    fn commit_transaction(&mut self) -> Result<()> {
        self.conn.execute_batch("COMMIT")?;
        Ok(())
    }
}

impl RawResultSink for Db {
    fn insert_raw(&mut self, outcome: &ScanOutcome) -> Result<()> {
        let mut stmt = self.conn.prepare_cached("INSERT INTO raw_data(ip, port, fetchTime, result, response) VALUES (?,?,?,?,?)")?;
        stmt.execute(params![
            i64::from(outcome.address),
            i64::from(outcome.port),
            outcome.fetched_at_ms as i64,
            outcome.result.as_i64(),
            outcome.raw
        ])?;
        Ok(())
    }
}

impl CertificateSink for Db {
    fn insert_certificate(&mut self, record: &CertificateRecord) -> Result<()> {
        let mut stmt = self.conn.prepare_cached("INSERT INTO certificates(KeyType, BitLen, Data) VALUES (?,?,?)")?;
        stmt.execute(params![record.key_type.as_i64(), i64::from(record.bit_length), record.der])?;
        Ok(())
    }
}
