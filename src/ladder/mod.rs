//! Staged Verification Ladder
//!
//! Cheap checks first, expensive ones later, style gates last and in
//! parallel. Every stage runs on every run; the verdict reports the first
//! failure in declaration order.

mod exec;
mod stages;
mod verdict;

pub use exec::{
    failure_reason_from_output, run_groups, run_stage, ExecContext, MAX_PARALLEL_WORKERS,
};
pub use stages::{build_stages, collect_command, Mode, Stage, StageGroup};
pub use verdict::{
    aggregate, parse_collected_count, parse_coverage_percent, FirstFailure, RunVerdict, StageResult,
};

use crate::config::Config;
use crate::sink::RunLog;
use crate::util::{program_available_on_path, run_command_with_timeout, shell_command};
use anyhow::Result;
use std::path::Path;
use std::time::Duration;
use tracing::{info, warn};

/// Inputs for one ladder run.
pub struct LadderContext<'a> {
    pub repo_root: &'a Path,
    pub config: &'a Config,
    pub run_id: u64,
    pub log: &'a RunLog,
}

/// Build the stage list from current configuration and run it.
pub fn run(mode: &Mode, ctx: &LadderContext<'_>) -> RunVerdict {
    let groups = build_stages(mode, ctx.config, program_available_on_path);
    run_with_groups(&groups, ctx)
}

pub fn run_with_groups(groups: &[StageGroup], ctx: &LadderContext<'_>) -> RunVerdict {
    let exec = ExecContext {
        cwd: ctx.repo_root,
        log: ctx.log,
        tail_lines: ctx.config.output_tail_lines,
    };
    let results = run_groups(groups, &exec);
    let verdict = aggregate(
        ctx.run_id,
        results,
        ctx.config.coverage_target.clone(),
        ctx.config.coverage_min,
    );

    match &verdict.first_failure {
        None => info!(run_id = ctx.run_id, stages = verdict.results.len(), "ladder green"),
        Some(failure) => info!(
            run_id = ctx.run_id,
            stage = %failure.id,
            reason = %failure.reason,
            coverage_failed = verdict.coverage_failed,
            "ladder red"
        ),
    }
    verdict
}

/// Number of tests the runner collects, or `None` when the count could not
/// be determined. Output goes to `log` like any stage.
pub fn collected_test_count(
    repo_root: &Path,
    config: &Config,
    log: &RunLog,
) -> Result<Option<usize>> {
    let command_line = collect_command(config);
    let mut command = shell_command(repo_root, &command_line);
    let result = run_command_with_timeout(
        &mut command,
        Some(Duration::from_secs(config.collect_timeout_secs)),
    )
    .map_err(|e| anyhow::anyhow!("Failed to run '{}': {}", command_line, e))?;

    let output = result.combined_output();
    log.append_stage_output("collect", &command_line, &output, None);
    if result.timed_out {
        warn!(command = %command_line, "test collection timed out");
        return Ok(None);
    }
    Ok(parse_collected_count(&output))
}
