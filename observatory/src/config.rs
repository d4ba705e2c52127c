use anyhow::{Context, Result};
use serde::Deserialize;
use std::fs;
use std::path::Path;

pub const DEFAULT_CONFIG_FILE: &str = "observatory.yaml";

#[derive(Debug, Default, Deserialize, Clone)]
#[serde(deny_unknown_fields)]
pub struct ScanSection {
    pub ranges: Option<Vec<String>>,
    pub port: Option<u16>,
    pub workers: Option<usize>,
    pub connections: Option<usize>,
    pub timeout_ms: Option<u64>,
    pub poll_interval_ms: Option<u64>,
    pub commit_interval_ms: Option<u64>,
    pub report_interval_ms: Option<u64>,
    pub rounds: Option<u32>,
    pub seed: Option<u64>,
    pub store_unanswered: Option<bool>,
    pub db: Option<String>,
    pub format: Option<String>,
}

#[derive(Debug, Default, Deserialize, Clone)]
#[serde(deny_unknown_fields)]
pub struct HarvestSection {
    pub raw_db: Option<String>,
    pub certs_db: Option<String>,
    pub commit_interval_ms: Option<u64>,
    pub format: Option<String>,
}

#[derive(Debug, Default, Deserialize, Clone)]
pub struct Config {
    pub scan: Option<ScanSection>,
    pub harvest: Option<HarvestSection>,
}

/// Reads `path`, or `observatory.yaml` from the working directory when no path
/// is given and that file exists.
pub fn load_config(path: Option<&Path>) -> Result<Option<Config>> {
    let path = match path {
        Some(p) => p.to_path_buf(),
        None => {
            let p = Path::new(DEFAULT_CONFIG_FILE);
            if p.exists() { p.to_path_buf() } else { return Ok(None); }
        }
    };
    let s = fs::read_to_string(&path).with_context(|| format!("read config {}", path.display()))?;
    let cfg = serde_yaml::from_str(&s).with_context(|| format!("parse config {}", path.display()))?;
    Ok(Some(cfg))
}
