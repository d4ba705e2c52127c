use crate::{Db, RunCounters, RunRecord};
use anyhow::{bail, Result};
use observatory_core::{CertificateRecord, KeyType, RawRow};
use rusqlite::types::ValueRef;
use rusqlite::{OptionalExtension, Row};

/// Reads a BLOB column that older captures may have stored as TEXT. NULL is empty.
pub(crate) fn lenient_bytes(row: &Row<'_>, idx: usize) -> rusqlite::Result<Vec<u8>> {
    Ok(match row.get_ref(idx)? {
        ValueRef::Blob(b) | ValueRef::Text(b) => b.to_vec(),
        ValueRef::Null => Vec::new(),
        ValueRef::Integer(i) => i.to_string().into_bytes(),
        ValueRef::Real(f) => f.to_string().into_bytes(),
    })
}

const COUNTABLE: &[&str] = &["runs", "raw_data", "certificates"];

impl Db {
    pub fn table_exists(&self, name: &str) -> Result<bool> {
        let cnt: i64 = self.conn.query_row(
            "SELECT COUNT(1) FROM sqlite_master WHERE type='table' AND name=?",
            [name],
            |r| r.get(0),
        )?;
        Ok(cnt > 0)
    }

    pub fn count_rows(&self, table: &str) -> Result<u64> {
        if !COUNTABLE.contains(&table) {
            bail!("unsupported table: {table}");
        }
        let n: i64 = self.conn.query_row(&format!("SELECT COUNT(1) FROM {table}"), [], |r| r.get(0))?;
        Ok(n as u64)
    }

    /// Streams every `raw_data` row in insertion order.
    pub fn for_each_raw_row(&self, mut f: impl FnMut(RawRow) -> Result<()>) -> Result<u64> {
        let mut stmt = self.conn.prepare("SELECT ip, port, fetchTime, result, response FROM raw_data ORDER BY rowid")?;
        let mut rows = stmt.query([])?;
        let mut n = 0;
        while let Some(row) = rows.next()? {
            let raw = RawRow {
                ip: row.get::<_, i64>(0)? as u32,
                port: row.get::<_, i64>(1)? as u16,
                fetched_at_ms: row.get::<_, Option<i64>>(2)?.unwrap_or(0) as u64,
                result: row.get::<_, Option<i64>>(3)?.unwrap_or(-1),
                response: lenient_bytes(row, 4)?,
            };
            f(raw)?;
            n += 1;
        }
        Ok(n)
    }

    /// `(result code, rows)` pairs, ascending by code.
    pub fn raw_result_counts(&self) -> Result<Vec<(i64, u64)>> {
        let mut stmt = self.conn.prepare("SELECT result, COUNT(1) FROM raw_data GROUP BY result ORDER BY result")?;
        let rows = stmt.query_map([], |r| Ok((r.get::<_, Option<i64>>(0)?.unwrap_or(-1), r.get::<_, i64>(1)? as u64)))?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    pub fn certificates(&self) -> Result<Vec<CertificateRecord>> {
        let mut stmt = self.conn.prepare("SELECT KeyType, BitLen, Data FROM certificates ORDER BY rowid")?;
        let mut rows = stmt.query([])?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            let code: i64 = row.get(0)?;
            let Some(key_type) = KeyType::from_i64(code) else {
                bail!("unknown KeyType {code} in certificates table");
            };
            out.push(CertificateRecord { key_type, bit_length: row.get::<_, i64>(1)? as u32, der: lenient_bytes(row, 2)? });
        }
        Ok(out)
    }

    pub fn get_run(&self, run_id: &str) -> Result<Option<RunRecord>> {
        let run = self
            .conn
            .query_row(
                "SELECT run_id, started_at, finished_at, tool_version, args_json, seed, attempted, completed, stored, error_count FROM runs WHERE run_id=?",
                [run_id],
                |r| {
                    Ok(RunRecord {
                        run_id: r.get(0)?,
                        started_at: r.get(1)?,
                        finished_at: r.get(2)?,
                        tool_version: r.get(3)?,
                        args_json: r.get(4)?,
                        seed: r.get::<_, Option<i64>>(5)?.map(|s| s as u64),
                        counters: RunCounters {
                            attempted: r.get::<_, Option<i64>>(6)?.unwrap_or(0),
                            completed: r.get::<_, Option<i64>>(7)?.unwrap_or(0),
                            stored: r.get::<_, Option<i64>>(8)?.unwrap_or(0),
                            error_count: r.get::<_, Option<i64>>(9)?.unwrap_or(0),
                        },
                    })
                },
            )
            .optional()?;
        Ok(run)
    }
}
