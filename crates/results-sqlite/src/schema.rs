pub const MIG_0001_INIT: &str = r#"
BEGIN;

CREATE TABLE runs (
  run_id          TEXT PRIMARY KEY,
  started_at      INTEGER NOT NULL,
  finished_at     INTEGER,
  tool_version    TEXT NOT NULL,
  args_json       TEXT NOT NULL,
  seed            INTEGER,
  attempted       INTEGER DEFAULT 0,
  completed       INTEGER DEFAULT 0,
  stored          INTEGER DEFAULT 0,
  error_count     INTEGER DEFAULT 0
);

CREATE TABLE IF NOT EXISTS raw_data (
  ip              INTEGER,
  port            INTEGER,
  fetchTime       INTEGER,
  result          INTEGER,
  response        BLOB
);

CREATE TABLE IF NOT EXISTS certificates (
  KeyType         INTEGER,
  BitLen          INTEGER,
  Data            BLOB
);

CREATE INDEX IF NOT EXISTS idx_raw_result ON raw_data(result);

COMMIT;
"#
;
