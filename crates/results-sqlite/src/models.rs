use anyhow::Result;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunMeta {
    pub run_id: Uuid,
    pub started_at: i64,
    pub tool_version: String,
    pub args_json: String,
    pub seed: Option<u64>,
}

impl RunMeta {
    /// New run identified by a time-ordered UUID, with `args` recorded as JSON.
    pub fn new(tool_version: &str, args: &impl Serialize, seed: Option<u64>) -> Result<Self> {
        Ok(RunMeta {
            run_id: Uuid::now_v7(),
            started_at: observatory_core::unix_millis() as i64,
            tool_version: tool_version.to_string(),
            args_json: serde_json::to_string(args)?,
            seed,
        })
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunCounters {
    pub attempted: i64,
    pub completed: i64,
    pub stored: i64,
    pub error_count: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunRecord {
    pub run_id: String,
    pub started_at: i64,
    pub finished_at: Option<i64>,
    pub tool_version: String,
    pub args_json: String,
    pub seed: Option<u64>,
    pub counters: RunCounters,
}
