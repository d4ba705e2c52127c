use anyhow::Result;
use arrow::array::{ArrayRef, BinaryBuilder, Int64Builder};
use arrow::datatypes::Schema;
use arrow::record_batch::RecordBatch;
use parquet::arrow::arrow_writer::ArrowWriter;
use parquet::file::properties::WriterProperties;
use rusqlite::{Connection, Row};
use std::sync::Arc;

use crate::arrow_schemas;
use crate::query::lenient_bytes;

const CHUNK: usize = 10_000;

#[derive(Clone, Copy)]
enum TableKind {
    RawData,
    Certificates,
}

impl TableKind {
    fn parse(table: &str) -> Result<Self> {
        match table {
            "raw_data" => Ok(TableKind::RawData),
            "certificates" => Ok(TableKind::Certificates),
            other => anyhow::bail!("unsupported table: {other}"),
        }
    }

    fn select(self) -> &'static str {
        match self {
            TableKind::RawData => "SELECT ip, port, fetchTime, result, response FROM raw_data ORDER BY rowid",
            TableKind::Certificates => "SELECT KeyType, BitLen, Data FROM certificates ORDER BY rowid",
        }
    }

    fn schema(self) -> Schema {
        match self {
            TableKind::RawData => arrow_schemas::raw_data_schema(),
            TableKind::Certificates => arrow_schemas::certificates_schema(),
        }
    }
}

/// Writes `raw_data` or `certificates` to a ZSTD-compressed Parquet file.
/// Returns the number of rows written.
pub fn export_table_to_parquet(conn: &Connection, table: &str, out: &std::path::Path) -> Result<u64> {
    let kind = TableKind::parse(table)?;
    let schema = Arc::new(kind.schema());
    let mut stmt = conn.prepare(kind.select())?;
    let mut rows = stmt.query([])?;
    let file = std::fs::File::create(out)?;

    let props = WriterProperties::builder()
        .set_compression(parquet::basic::Compression::ZSTD(Default::default()))
        .build();
    let mut writer = ArrowWriter::try_new(file, schema.clone(), Some(props))?;

    let mut total = 0u64;
    loop {
        let mut batch = RowBatch::new(kind);
        let mut count = 0;
        while count < CHUNK {
            let Some(row) = rows.next()? else { break; };
            batch.push(row)?;
            count += 1;
        }
        if count == 0 {
            break;
        }
        let rb = RecordBatch::try_new(schema.clone(), batch.finish())?;
        writer.write(&rb)?;
        total += count as u64;
    }

    writer.close()?;
    tracing::info!(table, rows = total, out = %out.display(), "parquet export written");
    Ok(total)
}

enum RowBatch {
    RawData { ip: Int64Builder, port: Int64Builder, fetch_time: Int64Builder, result: Int64Builder, response: BinaryBuilder },
    Certificates { key_type: Int64Builder, bit_len: Int64Builder, data: BinaryBuilder },
}

impl RowBatch {
    fn new(kind: TableKind) -> Self {
        match kind {
            TableKind::RawData => RowBatch::RawData {
                ip: Int64Builder::new(),
                port: Int64Builder::new(),
                fetch_time: Int64Builder::new(),
                result: Int64Builder::new(),
                response: BinaryBuilder::new(),
            },
            TableKind::Certificates => {
                RowBatch::Certificates { key_type: Int64Builder::new(), bit_len: Int64Builder::new(), data: BinaryBuilder::new() }
            }
        }
    }

    fn push(&mut self, row: &Row<'_>) -> Result<()> {
        match self {
            RowBatch::RawData { ip, port, fetch_time, result, response } => {
                ip.append_value(row.get::<_, i64>(0)?);
                port.append_value(row.get::<_, i64>(1)?);
                fetch_time.append_value(row.get::<_, Option<i64>>(2)?.unwrap_or(0));
                result.append_value(row.get::<_, Option<i64>>(3)?.unwrap_or(-1));
                response.append_value(lenient_bytes(row, 4)?);
            }
            RowBatch::Certificates { key_type, bit_len, data } => {
                key_type.append_value(row.get::<_, i64>(0)?);
                bit_len.append_value(row.get::<_, i64>(1)?);
                data.append_value(lenient_bytes(row, 2)?);
            }
        }
        Ok(())
    }

    fn finish(self) -> Vec<ArrayRef> {
        match self {
            RowBatch::RawData { mut ip, mut port, mut fetch_time, mut result, mut response } => vec![
                Arc::new(ip.finish()) as ArrayRef,
                Arc::new(port.finish()) as ArrayRef,
                Arc::new(fetch_time.finish()) as ArrayRef,
                Arc::new(result.finish()) as ArrayRef,
                Arc::new(response.finish()) as ArrayRef,
            ],
            RowBatch::Certificates { mut key_type, mut bit_len, mut data } => {
                vec![Arc::new(key_type.finish()) as ArrayRef, Arc::new(bit_len.finish()) as ArrayRef, Arc::new(data.finish()) as ArrayRef]
            }
        }
    }
}
