//! Result and log sinks
//!
//! The result sink is `last_run.json` under the state directory, rewritten
//! whole after every ladder run. The log sink keeps full stage output: one
//! file per run under `logs/`, mirrored to `latest.log` for tailing.

use crate::ladder::{FirstFailure, Mode, RunVerdict};
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::warn;

pub const RESULT_FILE: &str = "last_run.json";
pub const LATEST_LOG: &str = "latest.log";
const LOG_DIR: &str = "logs";

/// Externally visible outcome of one ladder run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunRecord {
    pub run_id: u64,
    pub finished_at: DateTime<Utc>,
    pub mode: String,
    pub scope: Option<String>,
    pub success: bool,
    pub coverage_failed: bool,
    pub coverage_target: Option<String>,
    pub coverage_threshold: f64,
    pub coverage_percent: Option<f64>,
    pub first_failure: Option<FirstFailure>,
    /// Full output for this run
    pub log_path: Option<PathBuf>,
}

impl RunRecord {
    pub fn from_verdict(verdict: &RunVerdict, mode: &Mode, log_path: Option<PathBuf>) -> Self {
        Self {
            run_id: verdict.run_id,
            finished_at: Utc::now(),
            mode: mode.label().to_string(),
            scope: mode.spec().map(str::to_string),
            success: verdict.success,
            coverage_failed: verdict.coverage_failed,
            coverage_target: verdict.coverage_target.clone(),
            coverage_threshold: verdict.coverage_threshold,
            coverage_percent: verdict.coverage_percent,
            first_failure: verdict.first_failure.clone(),
            log_path,
        }
    }
}

/// Overwrite the result sink. Readers never observe a partial record.
pub fn write_run_record(state_dir: &Path, record: &RunRecord) -> Result<()> {
    fs::create_dir_all(state_dir)
        .with_context(|| format!("Failed to create {}", state_dir.display()))?;
    let content = serde_json::to_string_pretty(record)?;
    let path = state_dir.join(RESULT_FILE);
    let tmp_path = path.with_extension("json.tmp");
    {
        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&tmp_path)
            .with_context(|| format!("Failed to open {}", tmp_path.display()))?;
        file.write_all(content.as_bytes())?;
        file.write_all(b"\n")?;
    }
    if let Err(err) = fs::rename(&tmp_path, &path) {
        let _ = fs::remove_file(&tmp_path);
        return Err(err).with_context(|| format!("Failed to replace {}", path.display()));
    }
    Ok(())
}

pub fn read_run_record(state_dir: &Path) -> Result<Option<RunRecord>> {
    let path = state_dir.join(RESULT_FILE);
    let content = match fs::read_to_string(&path) {
        Ok(content) => content,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(err).with_context(|| format!("Failed to read {}", path.display())),
    };
    let record = serde_json::from_str(&content)
        .with_context(|| format!("Failed to parse {}", path.display()))?;
    Ok(Some(record))
}

/// Append-only log for one ladder run. Safe to share across the stage
/// worker threads; each append lands as one contiguous block.
pub struct RunLog {
    path: PathBuf,
    files: Mutex<(File, File)>,
}

impl RunLog {
    /// Create `logs/run-<id>-<timestamp>.log` and truncate `latest.log`.
    pub fn create(state_dir: &Path, run_id: u64) -> Result<Self> {
        let log_dir = state_dir.join(LOG_DIR);
        fs::create_dir_all(&log_dir)
            .with_context(|| format!("Failed to create {}", log_dir.display()))?;
        let stamp = Utc::now().format("%Y%m%dT%H%M%S");
        let path = log_dir.join(format!("run-{run_id:04}-{stamp}.log"));
        let run_file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("Failed to open {}", path.display()))?;
        let latest_path = state_dir.join(LATEST_LOG);
        let latest = File::create(&latest_path)
            .with_context(|| format!("Failed to open {}", latest_path.display()))?;
        Ok(Self {
            path,
            files: Mutex::new((run_file, latest)),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write `text` to both files. Failures are logged, never returned:
    /// losing log output must not change a verdict.
    pub fn append(&self, text: &str) {
        let Ok(mut files) = self.files.lock() else {
            warn!("run log mutex poisoned; output dropped");
            return;
        };
        let (run_file, latest) = &mut *files;
        for file in [run_file, latest] {
            if let Err(err) = file.write_all(text.as_bytes()) {
                warn!(error = %err, path = %self.path.display(), "failed to append run log");
                return;
            }
        }
    }

    pub fn append_stage_output(
        &self,
        id: &str,
        command: &str,
        output: &str,
        timeout_note: Option<&str>,
    ) {
        let mut block = format!("==> [{id}] $ {command}\n");
        block.push_str(output);
        if !output.is_empty() && !output.ends_with('\n') {
            block.push('\n');
        }
        if let Some(note) = timeout_note {
            block.push_str(&format!("[patchwarden] {note}\n"));
        }
        self.append(&block);
    }
}

/// Last `max_lines` lines of `latest.log`, or empty when there is none.
pub fn latest_log_tail(state_dir: &Path, max_lines: usize) -> String {
    fs::read_to_string(state_dir.join(LATEST_LOG))
        .map(|text| crate::util::tail_lines(&text, max_lines))
        .unwrap_or_default()
}
