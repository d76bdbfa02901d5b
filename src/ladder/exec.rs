use super::stages::{Stage, StageGroup};
use super::verdict::{parse_coverage_percent, StageResult};
use crate::sink::RunLog;
use crate::util::{run_command_with_timeout, shell_command, tail_lines, truncate};
use std::path::Path;
use std::sync::mpsc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Upper bound on concurrently running stages in a parallel group.
pub const MAX_PARALLEL_WORKERS: usize = 5;

const FAILURE_REASON_MAX_CHARS: usize = 160;

/// Where and how stages execute.
pub struct ExecContext<'a> {
    pub cwd: &'a Path,
    pub log: &'a RunLog,
    pub tail_lines: usize,
}

/// Run one stage as `sh -c <command>`. Never fails: spawn errors and
/// timeouts become failing results.
pub fn run_stage(stage: &Stage, index: usize, ctx: &ExecContext<'_>) -> StageResult {
    let mut command = shell_command(ctx.cwd, &stage.command);
    let start = Instant::now();
    let outcome = run_command_with_timeout(&mut command, stage.timeout);
    let elapsed = start.elapsed();

    let (success, timed_out, output, exit_code, spawn_error) = match outcome {
        Ok(result) => (
            result.success(),
            result.timed_out,
            result.combined_output(),
            result.status.and_then(|s| s.code()),
            None,
        ),
        Err(err) => (false, false, String::new(), None, Some(err)),
    };

    let timeout_note = timed_out.then(|| {
        format!(
            "stage {} timed out after {}",
            stage.id,
            format_timeout(stage.timeout.unwrap_or_default())
        )
    });
    ctx.log.append_stage_output(
        &stage.id,
        &stage.command,
        spawn_error.as_deref().unwrap_or(&output),
        timeout_note.as_deref(),
    );

    let failure_reason = if success {
        None
    } else if let Some(note) = timeout_note {
        Some(note)
    } else if let Some(err) = spawn_error {
        Some(truncate(&err, FAILURE_REASON_MAX_CHARS))
    } else {
        Some(
            failure_reason_from_output(&output).unwrap_or_else(|| match exit_code {
                Some(code) => format!("exited with status {code}"),
                None => "terminated by signal".to_string(),
            }),
        )
    };

    debug!(
        stage = %stage.id,
        success,
        timed_out,
        elapsed_ms = elapsed.as_millis() as u64,
        "stage finished"
    );

    StageResult {
        index,
        id: stage.id.clone(),
        description: stage.description.clone(),
        command: stage.command.clone(),
        elapsed,
        success,
        timed_out,
        coverage: stage.coverage,
        output_tail: tail_lines(&output, ctx.tail_lines),
        failure_reason,
        coverage_percent: if stage.coverage {
            parse_coverage_percent(&output)
        } else {
            None
        },
    }
}

fn format_timeout(timeout: Duration) -> String {
    if timeout.as_secs() > 0 && timeout.subsec_millis() == 0 {
        format!("{}s", timeout.as_secs())
    } else {
        format!("{}ms", timeout.as_millis())
    }
}

/// First non-empty line that is not a skip notice, truncated.
pub fn failure_reason_from_output(output: &str) -> Option<String> {
    output
        .lines()
        .map(str::trim)
        .find(|line| !line.is_empty() && !is_skip_line(line))
        .map(|line| truncate(line, FAILURE_REASON_MAX_CHARS))
}

fn is_skip_line(line: &str) -> bool {
    let lower = line.to_ascii_lowercase();
    lower.starts_with("skip") || lower.starts_with("[skip")
}

/// Run every stage of every group. A failure never stops later stages or
/// groups. Parallel groups return in completion order.
pub fn run_groups(groups: &[StageGroup], ctx: &ExecContext<'_>) -> Vec<StageResult> {
    let mut results = Vec::new();
    let mut next_index = 0;
    for group in groups {
        if group.stages.is_empty() {
            continue;
        }
        debug!(
            group = %group.title,
            stages = group.stages.len(),
            parallel = group.parallel,
            "running stage group"
        );
        let group_results = if group.parallel && group.stages.len() > 1 {
            run_parallel(&group.stages, next_index, ctx)
        } else {
            run_sequential(&group.stages, next_index, ctx)
        };
        next_index += group.stages.len();
        results.extend(group_results);
    }
    results
}

fn run_sequential(
    stages: &[Stage],
    first_index: usize,
    ctx: &ExecContext<'_>,
) -> Vec<StageResult> {
    stages
        .iter()
        .enumerate()
        .map(|(offset, stage)| run_stage(stage, first_index + offset, ctx))
        .collect()
}

/// Results come back in completion order; callers sort by index.
fn run_parallel(
    stages: &[Stage],
    first_index: usize,
    ctx: &ExecContext<'_>,
) -> Vec<StageResult> {
    let workers = stages.len().min(MAX_PARALLEL_WORKERS);
    let pool = match rayon::ThreadPoolBuilder::new()
        .num_threads(workers)
        .thread_name(|i| format!("ladder-stage-{i}"))
        .build()
    {
        Ok(pool) => pool,
        Err(err) => {
            warn!(error = %err, "failed to start stage worker pool; running sequentially");
            return run_sequential(stages, first_index, ctx);
        }
    };

    let (tx, rx) = mpsc::channel();
    pool.scope(|scope| {
        for (offset, stage) in stages.iter().enumerate() {
            let tx = tx.clone();
            scope.spawn(move |_| {
                let _ = tx.send(run_stage(stage, first_index + offset, ctx));
            });
        }
    });
    drop(tx);
    rx.into_iter().collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stage(id: &str, command: &str, timeout: Option<Duration>) -> Stage {
        Stage {
            id: id.to_string(),
            description: format!("stage {id}"),
            command: command.to_string(),
            timeout,
            coverage: false,
        }
    }

    #[test]
    fn test_timeout_produces_failing_result() {
        let tmp = tempfile::tempdir().unwrap();
        let log = RunLog::create(&tmp.path().join(".patchwarden"), 1).unwrap();
        let ctx = ExecContext {
            cwd: tmp.path(),
            log: &log,
            tail_lines: 40,
        };
        let result = run_stage(
            &stage("02.1", "echo partial; exec sleep 5", Some(Duration::from_millis(300))),
            0,
            &ctx,
        );
        assert!(!result.success);
        assert!(result.timed_out);
        assert_eq!(
            result.failure_reason.as_deref(),
            Some("stage 02.1 timed out after 300ms")
        );
        let logged = std::fs::read_to_string(log.path()).unwrap();
        assert!(logged.contains("partial"));
        assert!(logged.contains("[patchwarden] stage 02.1 timed out"));
    }

    #[test]
    fn test_failure_reason_skips_blank_and_skip_lines() {
        let output = "\n  \nSKIPPED [1] tests/test_a.py:3: needs db\nE   assert 1 == 2\nmore\n";
        assert_eq!(
            failure_reason_from_output(output).as_deref(),
            Some("E   assert 1 == 2")
        );
        let long = "x".repeat(400);
        assert_eq!(
            failure_reason_from_output(&long).unwrap().chars().count(),
            FAILURE_REASON_MAX_CHARS
        );
        assert_eq!(failure_reason_from_output("\n\n"), None);
    }

    #[test]
    fn test_failure_without_output_reports_exit_status() {
        let tmp = tempfile::tempdir().unwrap();
        let log = RunLog::create(tmp.path(), 1).unwrap();
        let ctx = ExecContext {
            cwd: tmp.path(),
            log: &log,
            tail_lines: 40,
        };
        let result = run_stage(&stage("00.1", "exit 3", None), 0, &ctx);
        assert_eq!(result.failure_reason.as_deref(), Some("exited with status 3"));
    }

    #[test]
    fn test_output_tail_is_bounded() {
        let tmp = tempfile::tempdir().unwrap();
        let log = RunLog::create(tmp.path(), 1).unwrap();
        let ctx = ExecContext {
            cwd: tmp.path(),
            log: &log,
            tail_lines: 3,
        };
        let result = run_stage(&stage("00.1", "seq 1 10", None), 0, &ctx);
        assert!(result.success);
        assert_eq!(result.output_tail, "8\n9\n10");
        let logged = std::fs::read_to_string(log.path()).unwrap();
        assert!(logged.contains("1\n2\n3\n"));
    }

    #[test]
    fn test_unbounded_stage_timeouts_run_to_completion() {
        let tmp = tempfile::tempdir().unwrap();
        let log = RunLog::create(tmp.path(), 1).unwrap();
        let ctx = ExecContext {
            cwd: tmp.path(),
            log: &log,
            tail_lines: 40,
        };
        for timeout in [None, Some(Duration::from_secs(u64::MAX))] {
            let result = run_stage(&stage("02.1", "true", timeout), 0, &ctx);
            assert!(result.success);
            assert!(!result.timed_out);
            assert_eq!(result.failure_reason, None);
        }
    }

    #[test]
    fn test_failing_group_does_not_stop_later_groups() {
        let tmp = tempfile::tempdir().unwrap();
        let log = RunLog::create(tmp.path(), 1).unwrap();
        let ctx = ExecContext {
            cwd: tmp.path(),
            log: &log,
            tail_lines: 40,
        };
        let groups = vec![
            StageGroup {
                title: "first".to_string(),
                stages: vec![stage("00.1", "false", None), stage("00.2", "true", None)],
                parallel: false,
            },
            StageGroup {
                title: "gates".to_string(),
                stages: vec![
                    stage("05.1", "sleep 0.2; echo slow; exit 1", None),
                    stage("05.2", "echo fast; exit 1", None),
                    stage("05.3", "true", None),
                ],
                parallel: true,
            },
        ];
        let mut results = run_groups(&groups, &ctx);
        assert_eq!(results.len(), 5);
        results.sort_by_key(|r| r.index);
        let ids: Vec<&str> = results.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["00.1", "00.2", "05.1", "05.2", "05.3"]);
        let success: Vec<bool> = results.iter().map(|r| r.success).collect();
        assert_eq!(success, vec![false, true, false, false, true]);
        assert_eq!(results[2].failure_reason.as_deref(), Some("slow"));
    }
}
