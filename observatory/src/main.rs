use anyhow::{anyhow, bail, Context, Result};
use cert_extract::{HarvestStats, Harvester, ResponseKind, X509Classifier};
use clap::{Args, Parser, Subcommand, ValueEnum};
use observatory_core::{format_ipv4, Deduplicator, ResultCode};
use results_sqlite::{Db, RunCounters, RunMeta};
use serde::Serialize;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use sweep::Sweeper;
use tls_probe::{HandshakeFactory, Orchestrator, RustlsFactory, ScanConfig, ScanProgress, ScanSummary, WorkerConfig};
use tokio::sync::oneshot;
use tracing_subscriber::EnvFilter;

mod config;
use config::{load_config, Config, HarvestSection, ScanSection};

const DEFAULT_DB: &str = "tls_observatory.db";
const DEFAULT_CERTS_DB: &str = "certs.db";

#[derive(Debug, Parser)]
#[command(name = "observatory", version, about = "TLS certificate observatory: sweep IPv4 ranges, capture handshakes, harvest certificates")]
struct Cli {
    /// Path to YAML config file (default: ./observatory.yaml if present)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum OutputFormat {
    Text,
    Json,
}

impl OutputFormat {
    fn from_config(s: &str) -> Self {
        match s {
            "json" => OutputFormat::Json,
            _ => OutputFormat::Text,
        }
    }
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Print version information
    Version,
    /// Probe every address of the given ranges once and store the raw server replies
    Scan(ScanArgs),
    /// Extract, deduplicate and classify certificates from stored replies
    Harvest {
        /// Database holding raw_data (default: the scan database)
        #[arg(long)]
        raw_db: Option<PathBuf>,
        /// Database receiving unique certificates
        #[arg(long)]
        certs_db: Option<PathBuf>,
        #[arg(long)]
        commit_interval_ms: Option<u64>,
        #[arg(long, value_enum)]
        format: Option<OutputFormat>,
    },
    /// Count stored replies as valid (handshake), error (other bytes) or invalid (empty)
    Triage {
        #[arg(long)]
        db: Option<PathBuf>,
        /// Write a per-row listing to FILE (JSON lines unless --csv)
        #[arg(long)]
        out: Option<PathBuf>,
        /// Write the listing as CSV
        #[arg(long, default_value_t = false)]
        csv: bool,
        #[arg(long, value_enum, default_value_t = OutputFormat::Text)]
        format: OutputFormat,
    },
    /// Export a table (raw_data or certificates) to Parquet
    Export {
        #[arg(long)]
        db: PathBuf,
        #[arg(long, default_value = "certificates")]
        table: String,
        #[arg(long)]
        out: PathBuf,
    },
}

#[derive(Debug, Clone, Default, Args)]
struct ScanArgs {
    /// CIDR blocks to sweep, e.g. 192.0.2.0/24
    ranges: Vec<String>,
    /// File with one CIDR block per line ('#' starts a comment)
    #[arg(long)]
    ranges_file: Option<PathBuf>,
    /// Destination port
    #[arg(long)]
    port: Option<u16>,
    /// Worker threads; each sweeps its own shard
    #[arg(long)]
    workers: Option<usize>,
    /// Concurrent connections per worker
    #[arg(long)]
    connections: Option<usize>,
    /// Per-connection deadline covering TCP connect and TLS handshake
    #[arg(long)]
    timeout_ms: Option<u64>,
    #[arg(long)]
    poll_interval_ms: Option<u64>,
    /// Maximum age of an open result transaction
    #[arg(long)]
    commit_interval_ms: Option<u64>,
    /// Progress log interval
    #[arg(long)]
    report_interval_ms: Option<u64>,
    /// Feistel rounds of the address permutation
    #[arg(long)]
    rounds: Option<u32>,
    /// Permutation seed (random when omitted); reuse it to reproduce a sweep order
    #[arg(long)]
    seed: Option<u64>,
    /// Also store hosts that never completed the TCP handshake
    #[arg(long, default_value_t = false)]
    store_unanswered: bool,
    #[arg(long)]
    db: Option<PathBuf>,
    #[arg(long, value_enum)]
    format: Option<OutputFormat>,
}

/// Effective scan configuration; recorded as the run's `args_json`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
struct ScanSettings {
    ranges: Vec<String>,
    port: u16,
    workers: usize,
    connections: usize,
    timeout_ms: u64,
    poll_interval_ms: u64,
    commit_interval_ms: u64,
    report_interval_ms: u64,
    rounds: u32,
    seed: u64,
    store_unanswered: bool,
    db: PathBuf,
}

impl ScanSettings {
    /// Flags win over the config section, which wins over built-in defaults.
    fn resolve(args: ScanArgs, section: Option<&ScanSection>) -> Result<(Self, OutputFormat)> {
        let s = section.cloned().unwrap_or_default();
        let mut ranges = args.ranges;
        if let Some(path) = &args.ranges_file {
            ranges.extend(read_ranges_file(path)?);
        }
        if ranges.is_empty() {
            ranges = s.ranges.unwrap_or_default();
        }
        if ranges.is_empty() {
            bail!("no ranges given: pass CIDR blocks, --ranges-file, or scan.ranges in the config");
        }
        let format = match (args.format, &s.format) {
            (Some(f), _) => f,
            (None, Some(f)) => OutputFormat::from_config(f),
            (None, None) => OutputFormat::Text,
        };
        let settings = ScanSettings {
            ranges,
            port: args.port.or(s.port).unwrap_or(443),
            workers: args.workers.or(s.workers).unwrap_or(4),
            connections: args.connections.or(s.connections).unwrap_or(1024),
            timeout_ms: args.timeout_ms.or(s.timeout_ms).unwrap_or(5000),
            poll_interval_ms: args.poll_interval_ms.or(s.poll_interval_ms).unwrap_or(100),
            commit_interval_ms: args.commit_interval_ms.or(s.commit_interval_ms).unwrap_or(5000),
            report_interval_ms: args.report_interval_ms.or(s.report_interval_ms).unwrap_or(5000),
            rounds: args.rounds.or(s.rounds).unwrap_or(sweep::DEFAULT_ROUNDS),
            seed: args.seed.or(s.seed).unwrap_or_else(rand::random),
            store_unanswered: args.store_unanswered || s.store_unanswered.unwrap_or(false),
            db: args.db.or_else(|| s.db.map(PathBuf::from)).unwrap_or_else(|| PathBuf::from(DEFAULT_DB)),
        };
        if settings.workers == 0 || settings.connections == 0 {
            bail!("--workers and --connections must be > 0");
        }
        Ok((settings, format))
    }

    fn scan_config(&self) -> ScanConfig {
        ScanConfig {
            workers: self.workers,
            worker: WorkerConfig {
                port: self.port,
                max_connections: self.connections,
                timeout: Duration::from_millis(self.timeout_ms),
                poll_interval: Duration::from_millis(self.poll_interval_ms),
                store_unanswered: self.store_unanswered,
            },
            commit_interval: Duration::from_millis(self.commit_interval_ms),
        }
    }
}

fn read_ranges_file(path: &Path) -> Result<Vec<String>> {
    let text = std::fs::read_to_string(path).with_context(|| format!("read ranges file {}", path.display()))?;
    Ok(text
        .lines()
        .map(|l| l.split('#').next().unwrap_or("").trim())
        .filter(|l| !l.is_empty())
        .map(str::to_string)
        .collect())
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_writer(std::io::stderr).init();
}

fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let loaded_cfg: Option<Config> = load_config(cli.config.as_deref())?;

    match cli.command {
        Commands::Version => {
            println!("observatory {} (core {})", env!("CARGO_PKG_VERSION"), observatory_core::version());
        }
        Commands::Scan(args) => {
            let section = loaded_cfg.as_ref().and_then(|c| c.scan.as_ref());
            let (settings, format) = ScanSettings::resolve(args, section)?;
            run_scan(settings, format)?;
        }
        Commands::Harvest { mut raw_db, mut certs_db, mut commit_interval_ms, format } => {
            let mut format = format;
            if let Some(cfg) = &loaded_cfg {
                if let Some(h) = &cfg.harvest {
                    apply_harvest_section(h, &mut raw_db, &mut certs_db, &mut commit_interval_ms);
                    if format.is_none() {
                        format = h.format.as_deref().map(OutputFormat::from_config);
                    }
                }
                if raw_db.is_none() {
                    raw_db = cfg.scan.as_ref().and_then(|s| s.db.clone()).map(PathBuf::from);
                }
            }
            let raw_db = raw_db.unwrap_or_else(|| PathBuf::from(DEFAULT_DB));
            let certs_db = certs_db.unwrap_or_else(|| PathBuf::from(DEFAULT_CERTS_DB));
            let commit = Duration::from_millis(commit_interval_ms.unwrap_or(5000));
            let stats = run_harvest(&raw_db, &certs_db, commit)?;
            match format.unwrap_or(OutputFormat::Text) {
                OutputFormat::Text => {
                    println!("harvested {} -> {}", raw_db.display(), certs_db.display());
                    println!("  rows          {} (valid {}, error {}, invalid {})", stats.rows, stats.handshake, stats.other, stats.empty);
                    println!("  certificates  {} seen, {} unique, {} duplicates", stats.certificates_seen, stats.unique, stats.duplicates);
                    println!("  stored        {} ({} unclassified, {} insert failures)", stats.stored, stats.unclassified, stats.store_failures);
                    println!(
                        "  truncated     {} records, {} messages, {} certificate lists",
                        stats.truncated_records, stats.truncated_messages, stats.truncated_containers
                    );
                }
                OutputFormat::Json => {
                    let obj = serde_json::json!({
                        "raw_db": raw_db.display().to_string(),
                        "certs_db": certs_db.display().to_string(),
                        "stats": stats,
                    });
                    println!("{}", serde_json::to_string_pretty(&obj)?);
                }
            }
        }
        Commands::Triage { db, out, csv, format } => {
            let db = db
                .or_else(|| loaded_cfg.as_ref().and_then(|c| c.harvest.as_ref()).and_then(|h| h.raw_db.clone()).map(PathBuf::from))
                .or_else(|| loaded_cfg.as_ref().and_then(|c| c.scan.as_ref()).and_then(|s| s.db.clone()).map(PathBuf::from))
                .unwrap_or_else(|| PathBuf::from(DEFAULT_DB));
            if !db.exists() {
                bail!("database not found: {}", db.display());
            }
            let store = Db::open_or_create(&db)?;
            let listing = match &out {
                Some(path) => Some(RowListing::create(path, csv)?),
                None => None,
            };
            let totals = triage(&store, listing)?;
            let by_result = store.raw_result_counts()?;
            match format {
                OutputFormat::Text => {
                    println!("{} rows in {}", totals.rows, db.display());
                    println!("  valid    {}", totals.valid);
                    println!("  error    {}", totals.error);
                    println!("  invalid  {}", totals.invalid);
                    for (code, n) in &by_result {
                        println!("  result {:<16} {}", result_label(*code), n);
                    }
                    if let Some(path) = &out {
                        println!("wrote {}", path.display());
                    }
                }
                OutputFormat::Json => {
                    let results: serde_json::Map<String, serde_json::Value> =
                        by_result.iter().map(|(code, n)| (result_label(*code), serde_json::json!(n))).collect();
                    let obj = serde_json::json!({ "db": db.display().to_string(), "totals": totals, "results": results });
                    println!("{}", serde_json::to_string_pretty(&obj)?);
                }
            }
        }
        Commands::Export { db, table, out } => {
            if !db.exists() {
                bail!("database not found: {}", db.display());
            }
            let store = Db::open_or_create(&db)?;
            let rows = results_sqlite::export_table_to_parquet(&store.conn, &table, &out)?;
            println!("exported {rows} rows from {table} to {}", out.display());
        }
    }
    Ok(())
}

fn apply_harvest_section(h: &HarvestSection, raw_db: &mut Option<PathBuf>, certs_db: &mut Option<PathBuf>, commit: &mut Option<u64>) {
    if raw_db.is_none() {
        *raw_db = h.raw_db.clone().map(PathBuf::from);
    }
    if certs_db.is_none() {
        *certs_db = h.certs_db.clone().map(PathBuf::from);
    }
    if commit.is_none() {
        *commit = h.commit_interval_ms;
    }
}

fn result_label(code: i64) -> String {
    match ResultCode::from_i64(code) {
        Some(rc) => rc.to_string(),
        None => format!("unknown({code})"),
    }
}

fn run_scan(settings: ScanSettings, format: OutputFormat) -> Result<()> {
    let mut sweeper = Sweeper::with_params(settings.seed, settings.rounds);
    for range in &settings.ranges {
        sweeper.add_cidr(range).with_context(|| format!("range {range}"))?;
    }
    let db = Db::open_or_create(&settings.db)?;
    let meta = RunMeta::new(env!("CARGO_PKG_VERSION"), &settings, Some(settings.seed))?;
    let run_id = db.begin_run(&meta)?;
    tracing::info!(%run_id, db = %settings.db.display(), addresses = sweeper.total_length(), port = settings.port, "run started");

    let factory: Arc<dyn HandshakeFactory> = Arc::new(RustlsFactory::new()?);
    let orchestrator = Orchestrator::new(sweeper, settings.scan_config());
    let progress = orchestrator.progress();
    let shutdown = orchestrator.shutdown_handle();
    let (done_tx, done_rx) = oneshot::channel::<()>();
    let handle = std::thread::Builder::new()
        .name("scan-orchestrator".into())
        .spawn(move || {
            let result = orchestrator.run(db, factory);
            let _ = done_tx.send(());
            result
        })
        .context("spawn scan thread")?;

    let rt = tokio::runtime::Builder::new_current_thread().enable_all().build()?;
    rt.block_on(supervise(done_rx, progress, shutdown, Duration::from_millis(settings.report_interval_ms)));

    let (summary, db) = handle.join().map_err(|_| anyhow!("scan thread panicked"))??;
    let p = summary.progress;
    let counters = RunCounters {
        attempted: p.attempted as i64,
        completed: p.completed as i64,
        stored: p.stored as i64,
        error_count: (p.tls_error + p.store_failures) as i64,
    };
    db.finish_run(&run_id, observatory_core::unix_millis() as i64, &counters)?;
    print_scan_summary(&run_id.to_string(), &settings, &summary, format)
}

/// Logs progress on a fixed interval and turns Ctrl-C into a cooperative
/// shutdown, until the scan thread signals completion.
async fn supervise(mut done: oneshot::Receiver<()>, progress: Arc<ScanProgress>, shutdown: Arc<AtomicBool>, every: Duration) {
    let mut ticker = tokio::time::interval(every.max(Duration::from_millis(10)));
    ticker.tick().await;
    let mut listening = true;
    loop {
        tokio::select! {
            _ = &mut done => break,
            res = tokio::signal::ctrl_c(), if listening => {
                listening = false;
                match res {
                    Ok(()) => {
                        tracing::warn!("interrupt received, stopping workers");
                        shutdown.store(true, Ordering::Relaxed);
                    }
                    Err(e) => tracing::warn!(error = %e, "ctrl-c handler unavailable"),
                }
            }
            _ = ticker.tick() => {
                let s = progress.snapshot();
                tracing::info!(
                    attempted = s.attempted,
                    finished = s.finished(),
                    completed = s.completed,
                    tls_error = s.tls_error,
                    timeouts = s.tcp_timeout + s.tls_timeout,
                    stored = s.stored,
                    "progress"
                );
            }
        }
    }
}

fn print_scan_summary(run_id: &str, settings: &ScanSettings, summary: &ScanSummary, format: OutputFormat) -> Result<()> {
    match format {
        OutputFormat::Text => {
            let p = &summary.progress;
            println!(
                "run {run_id}: {} addresses on port {} with {} workers in {} ms (seed {}){}",
                summary.total_addresses,
                settings.port,
                summary.workers,
                summary.elapsed_ms,
                summary.seed,
                if summary.interrupted { ", interrupted" } else { "" }
            );
            println!("  attempted       {}", p.attempted);
            println!("  connect failed  {}", p.connect_failed);
            println!("  tcp timeout     {}", p.tcp_timeout);
            println!("  tls completed   {}", p.completed);
            println!("  tls timeout     {}", p.tls_timeout);
            println!("  tls error       {}", p.tls_error);
            println!("  stored          {} ({} failed) -> {}", p.stored, p.store_failures, settings.db.display());
        }
        OutputFormat::Json => {
            let obj = serde_json::json!({ "run_id": run_id, "settings": settings, "summary": summary });
            println!("{}", serde_json::to_string_pretty(&obj)?);
        }
    }
    Ok(())
}

fn run_harvest(raw_db: &Path, certs_db: &Path, commit: Duration) -> Result<HarvestStats> {
    if !raw_db.exists() {
        bail!("raw database not found: {}", raw_db.display());
    }
    let raw = Db::open_or_create(raw_db)?;
    let certs = Db::open_or_create(certs_db)?;
    let mut harvester = Harvester::new(certs, X509Classifier, Arc::new(Deduplicator::new()), commit);
    let rows = raw.for_each_raw_row(|row| {
        harvester.process_row(&row);
        Ok(())
    })?;
    let (stats, certs) = harvester.finish()?;
    tracing::info!(rows, unique = stats.unique, stored = stats.stored, total = certs.count_rows("certificates")?, "harvest finished");
    Ok(stats)
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
struct TriageTotals {
    rows: u64,
    valid: u64,
    error: u64,
    invalid: u64,
}

#[derive(Debug, Serialize)]
struct TriageRow {
    ip: String,
    port: u16,
    fetch_time_ms: u64,
    result: String,
    kind: &'static str,
    response_len: usize,
}

enum RowListing {
    Csv(csv::Writer<File>),
    Jsonl(BufWriter<File>),
}

impl RowListing {
    fn create(path: &Path, csv: bool) -> Result<Self> {
        let file = File::create(path).with_context(|| format!("create {}", path.display()))?;
        Ok(if csv { RowListing::Csv(csv::Writer::from_writer(file)) } else { RowListing::Jsonl(BufWriter::new(file)) })
    }

    fn write(&mut self, row: &TriageRow) -> Result<()> {
        match self {
            RowListing::Csv(w) => w.serialize(row)?,
            RowListing::Jsonl(w) => {
                serde_json::to_writer(&mut *w, row)?;
                w.write_all(b"\n")?;
            }
        }
        Ok(())
    }

    fn finish(self) -> Result<()> {
        match self {
            RowListing::Csv(mut w) => w.flush()?,
            RowListing::Jsonl(mut w) => w.flush()?,
        }
        Ok(())
    }
}

fn triage(db: &Db, mut listing: Option<RowListing>) -> Result<TriageTotals> {
    let mut totals = TriageTotals::default();
    db.for_each_raw_row(|row| {
        let kind = ResponseKind::of(&row.response);
        totals.rows += 1;
        match kind {
            ResponseKind::Handshake => totals.valid += 1,
            ResponseKind::Other => totals.error += 1,
            ResponseKind::Empty => totals.invalid += 1,
        }
        if let Some(out) = listing.as_mut() {
            out.write(&TriageRow {
                ip: format_ipv4(row.ip),
                port: row.port,
                fetch_time_ms: row.fetched_at_ms,
                result: result_label(row.result),
                kind: kind.label(),
                response_len: row.response.len(),
            })?;
        }
        Ok(())
    })?;
    if let Some(out) = listing {
        out.finish()?;
    }
    Ok(totals)
}

#[cfg(test)]
mod tests {
    use super::*;
    use observatory_core::{RawResultSink, ScanOutcome};

    fn args(ranges: &[&str]) -> ScanArgs {
        ScanArgs { ranges: ranges.iter().map(|s| s.to_string()).collect(), ..ScanArgs::default() }
    }

    #[test]
    fn cli_parses_scan_flags() {
        let cli = Cli::try_parse_from([
            "observatory", "scan", "192.0.2.0/24", "198.51.100.0/24", "--port", "8443", "--seed", "7", "--store-unanswered", "--format", "json",
        ])
        .unwrap();
        match cli.command {
            Commands::Scan(a) => {
                assert_eq!(a.ranges, vec!["192.0.2.0/24", "198.51.100.0/24"]);
                assert_eq!(a.port, Some(8443));
                assert_eq!(a.seed, Some(7));
                assert!(a.store_unanswered);
                assert_eq!(a.format, Some(OutputFormat::Json));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn defaults_apply_without_config() {
        let (s, format) = ScanSettings::resolve(ScanArgs { seed: Some(1), ..args(&["192.0.2.0/24"]) }, None).unwrap();
        assert_eq!(format, OutputFormat::Text);
        assert_eq!((s.port, s.workers, s.connections), (443, 4, 1024));
        assert_eq!((s.timeout_ms, s.poll_interval_ms, s.commit_interval_ms, s.report_interval_ms), (5000, 100, 5000, 5000));
        assert_eq!(s.rounds, 4);
        assert!(!s.store_unanswered);
        assert_eq!(s.db, PathBuf::from(DEFAULT_DB));
    }

    #[test]
    fn flags_override_config_which_overrides_defaults() {
        let section = ScanSection {
            ranges: Some(vec!["10.0.0.0/8".into()]),
            port: Some(8443),
            workers: Some(8),
            seed: Some(99),
            store_unanswered: Some(true),
            db: Some("cfg.db".into()),
            format: Some("json".into()),
            ..ScanSection::default()
        };
        let (s, format) = ScanSettings::resolve(ScanArgs { workers: Some(2), ..args(&[]) }, Some(&section)).unwrap();
        assert_eq!(s.ranges, vec!["10.0.0.0/8"]);
        assert_eq!(s.port, 8443);
        assert_eq!(s.workers, 2);
        assert_eq!(s.seed, 99);
        assert!(s.store_unanswered);
        assert_eq!(s.db, PathBuf::from("cfg.db"));
        assert_eq!(format, OutputFormat::Json);

        let (s, _) = ScanSettings::resolve(args(&["192.0.2.0/24"]), Some(&section)).unwrap();
        assert_eq!(s.ranges, vec!["192.0.2.0/24"]);
    }

    #[test]
    fn missing_ranges_and_zero_workers_are_rejected() {
        assert!(ScanSettings::resolve(args(&[]), None).is_err());
        assert!(ScanSettings::resolve(ScanArgs { workers: Some(0), ..args(&["192.0.2.0/24"]) }, None).is_err());
    }

    #[test]
    fn ranges_file_skips_comments_and_blanks() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ranges.txt");
        std::fs::write(&path, "# lab\n192.0.2.0/24\n\n  198.51.100.0/25  # dmz\n").unwrap();
        assert_eq!(read_ranges_file(&path).unwrap(), vec!["192.0.2.0/24", "198.51.100.0/25"]);
    }

    #[test]
    fn scan_config_carries_settings() {
        let (s, _) = ScanSettings::resolve(
            ScanArgs { timeout_ms: Some(250), connections: Some(16), store_unanswered: true, ..args(&["192.0.2.0/24"]) },
            None,
        )
        .unwrap();
        let c = s.scan_config();
        assert_eq!(c.workers, 4);
        assert_eq!(c.worker.max_connections, 16);
        assert_eq!(c.worker.timeout, Duration::from_millis(250));
        assert!(c.worker.store_unanswered);
    }

    #[test]
    fn triage_counts_and_writes_csv() {
        let mut db = Db::open_in_memory().unwrap();
        let outcome = |address: u32, result: ResultCode, raw: &[u8]| ScanOutcome { address, port: 443, result, raw: raw.to_vec(), fetched_at_ms: 1 };
        db.insert_raw(&outcome(0xC000_0201, ResultCode::TlsHandshakeCompleted, &[22, 3, 3, 0, 0])).unwrap();
        db.insert_raw(&outcome(0xC000_0202, ResultCode::TlsError, b"HTTP/1.1 400")).unwrap();
        db.insert_raw(&outcome(0xC000_0203, ResultCode::TlsHandshakeTimeout, &[])).unwrap();

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("triage.csv");
        let totals = triage(&db, Some(RowListing::create(&path, true).unwrap())).unwrap();
        assert_eq!(totals, TriageTotals { rows: 3, valid: 1, error: 1, invalid: 1 });

        let text = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines[0], "ip,port,fetch_time_ms,result,kind,response_len");
        assert_eq!(lines[1], "192.0.2.1,443,1,tls-completed,valid,5");
        assert_eq!(lines[3], "192.0.2.3,443,1,tls-timeout,invalid,0");
    }

    #[test]
    fn harvest_requires_existing_raw_db() {
        let dir = tempfile::tempdir().unwrap();
        let err = run_harvest(&dir.path().join("missing.db"), &dir.path().join("certs.db"), Duration::from_secs(1)).unwrap_err();
        assert!(err.to_string().contains("raw database not found"));
    }

    #[test]
    fn harvest_stores_unique_certificates() {
        let dir = tempfile::tempdir().unwrap();
        let raw_path = dir.path().join("raw.db");
        let certs_path = dir.path().join("certs.db");
        let der = include_bytes!("../../modules/cert-extract/testdata/ec256.der");
        let capture = certificate_capture(der);
        {
            let mut raw = Db::open_or_create(&raw_path).unwrap();
            for address in 1..=3u32 {
                let o = ScanOutcome { address, port: 443, result: ResultCode::TlsHandshakeCompleted, raw: capture.clone(), fetched_at_ms: 0 };
                raw.insert_raw(&o).unwrap();
            }
        }
        let stats = run_harvest(&raw_path, &certs_path, Duration::from_secs(5)).unwrap();
        assert_eq!(stats.rows, 3);
        assert_eq!(stats.unique, 1);
        assert_eq!(stats.duplicates, 2);
        assert_eq!(stats.stored, 1);
        let certs = Db::open_or_create(&certs_path).unwrap().certificates().unwrap();
        assert_eq!(certs.len(), 1);
        assert_eq!(certs[0].der, der.to_vec());
        assert_eq!(certs[0].bit_length, 256);
    }

    /// One handshake record holding a Certificate message with a single entry.
    fn certificate_capture(der: &[u8]) -> Vec<u8> {
        let u24 = |n: usize| [(n >> 16) as u8, (n >> 8) as u8, n as u8];
        let mut list = u24(der.len()).to_vec();
        list.extend_from_slice(der);
        let mut body = u24(list.len()).to_vec();
        body.extend_from_slice(&list);
        let mut msg = vec![11];
        msg.extend_from_slice(&u24(body.len()));
        msg.extend_from_slice(&body);
        let mut rec = vec![22, 3, 3];
        rec.extend_from_slice(&(msg.len() as u16).to_be_bytes());
        rec.extend_from_slice(&msg);
        rec
    }
}
