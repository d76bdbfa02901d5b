//! Mechanical-fix and acceptance state machine
//!
//! One [`Controller`] drives one invocation. Each pass verifies, tries a
//! deterministic formatting round, and then asks the generator for exactly
//! one patch. A patch is vetted by the guard, applied inside a
//! snapshot/revert bracket, and only persisted when every post-apply check
//! holds. Any rejection reverts the attempt in full and ends the run.

use crate::config::Config;
use crate::diff::{extract_diff, parse_patch};
use crate::error::{ExitStatus, InfraError};
use crate::generator::{PatchGenerator, PatchRequest, LOG_TAIL_LINES};
use crate::git_ops::{self, ApplyOutcome};
use crate::guard::{GuardDecision, GuardLimits, LedgerRules, PatchGuard, Scope};
use crate::hermetic::HermeticChecker;
use crate::ladder::{self, LadderContext, Mode, RunVerdict};
use crate::lock::ensure_state_dir;
use crate::rejection::Rejection;
use crate::sink::{latest_log_tail, write_run_record, RunLog, RunRecord};
use crate::snapshot::{self, is_cache_path, ProtectedPathSnapshot};
use crate::telemetry::EventBus;
use crate::util::{
    command_program, program_available_on_path, run_command_with_timeout, shell_command,
};
use anyhow::Result;
use serde_json::json;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info, warn};

/// How the controller verifies the working tree.
pub trait Verifier {
    /// One physical ladder run.
    fn verify(&mut self, mode: &Mode, run_id: u64, log: &RunLog) -> RunVerdict;

    /// Collect-only test count used as a regression oracle.
    fn collected_tests(&mut self, log: &RunLog) -> Result<Option<usize>>;
}

/// The real verifier: the staged ladder plus the test runner's collect mode.
pub struct LadderVerifier {
    repo_root: PathBuf,
    config: Config,
}

impl LadderVerifier {
    pub fn new(repo_root: &Path, config: &Config) -> Self {
        Self {
            repo_root: repo_root.to_path_buf(),
            config: config.clone(),
        }
    }
}

impl Verifier for LadderVerifier {
    fn verify(&mut self, mode: &Mode, run_id: u64, log: &RunLog) -> RunVerdict {
        let ctx = LadderContext {
            repo_root: &self.repo_root,
            config: &self.config,
            run_id,
            log,
        };
        ladder::run(mode, &ctx)
    }

    fn collected_tests(&mut self, log: &RunLog) -> Result<Option<usize>> {
        ladder::collected_test_count(&self.repo_root, &self.config, log)
    }
}

#[derive(Debug, Clone)]
pub struct RunOptions {
    pub mode: Mode,
    pub max_passes: u32,
    /// Ask the generator for patches
    pub llm_enabled: bool,
    /// Commit accepted patches; otherwise leave them staged
    pub commit: bool,
}

impl RunOptions {
    pub fn from_config(mode: Mode, config: &Config) -> Self {
        Self {
            mode,
            max_passes: config.max_passes,
            llm_enabled: config.llm_enabled,
            commit: true,
        }
    }
}

/// Terminal result of [`Controller::run`].
#[derive(Debug, Clone, PartialEq)]
pub enum RunOutcome {
    Green { passes: u32 },
    MaxPassesExhausted { passes: u32 },
    Rejected(Rejection),
}

impl RunOutcome {
    pub fn exit_status(&self) -> ExitStatus {
        match self {
            RunOutcome::Green { .. } => ExitStatus::Green,
            RunOutcome::MaxPassesExhausted { .. } => ExitStatus::PassBudgetExhausted,
            RunOutcome::Rejected(_) => ExitStatus::PatchRejected,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
enum AttemptOutcome {
    Accepted { paths: BTreeSet<String> },
    Rejected(Rejection),
}

/// Fail with [`InfraError::ToolMissing`] unless git and the test runner are on PATH.
pub fn preflight(config: &Config) -> Result<(), InfraError> {
    let runner = command_program(&config.stages.test_runner).unwrap_or_default();
    for tool in ["git", runner] {
        if !program_available_on_path(tool) {
            return Err(InfraError::ToolMissing {
                tool: tool.to_string(),
            });
        }
    }
    Ok(())
}

/// State for one invocation: counters, sinks, and collaborators.
pub struct Controller {
    repo_root: PathBuf,
    config: Config,
    state_dir: PathBuf,
    guard: PatchGuard,
    hermetic: HermeticChecker,
    verifier: Box<dyn Verifier>,
    generator: Option<Box<dyn PatchGenerator>>,
    events: EventBus,
    run_counter: u64,
    pass: u32,
    attempt: u32,
    log: Option<RunLog>,
}

impl Controller {
    pub fn new(
        repo_root: &Path,
        config: Config,
        verifier: Box<dyn Verifier>,
        generator: Option<Box<dyn PatchGenerator>>,
    ) -> Result<Self> {
        config.validate()?;
        let ledger =
            LedgerRules::new(&config.ledger.status_pattern, &config.ledger.allowed_sections)
                .map_err(|e| InfraError::Config(e.to_string()))?;
        let guard = PatchGuard::new(
            GuardLimits {
                max_files: config.max_patch_files,
                max_lines: config.max_patch_lines,
            },
            ledger,
        );
        let state_dir = config.state_dir(repo_root);
        ensure_state_dir(repo_root, &state_dir)?;
        let events = EventBus::start(&state_dir);

        Ok(Self {
            repo_root: repo_root.to_path_buf(),
            config,
            state_dir,
            guard,
            hermetic: HermeticChecker::new(),
            verifier,
            generator,
            events,
            run_counter: 0,
            pass: 0,
            attempt: 0,
            log: None,
        })
    }

    pub fn runs(&self) -> u64 {
        self.run_counter
    }

    /// Drive passes until green, a rejection, or the pass budget runs out.
    pub fn run(&mut self, options: &RunOptions) -> Result<RunOutcome> {
        options.mode.validate()?;
        let max_passes = options.max_passes.max(1);
        let outcome = self.run_passes(options, max_passes)?;
        self.events.emit(
            "outcome",
            json!({
                "outcome": outcome_label(&outcome),
                "passes": self.pass,
                "runs": self.run_counter,
            }),
        );
        info!(
            outcome = outcome_label(&outcome),
            passes = self.pass,
            runs = self.run_counter,
            "run finished"
        );
        Ok(outcome)
    }

    fn run_passes(&mut self, options: &RunOptions, max_passes: u32) -> Result<RunOutcome> {
        for pass in 1..=max_passes {
            self.pass = pass;
            self.attempt = 0;
            self.events
                .emit("pass_started", json!({ "pass": pass, "mode": options.mode.label() }));

            let verdict = self.verify(&options.mode)?;
            if verdict.success {
                return Ok(RunOutcome::Green { passes: pass });
            }

            let verdict = if self.mechanical_fix(&options.mode)? {
                let verdict = self.verify(&options.mode)?;
                if verdict.success {
                    return Ok(RunOutcome::Green { passes: pass });
                }
                verdict
            } else {
                debug!(pass, "mechanical fix changed nothing; requesting a patch");
                verdict
            };

            match self.request_patch(options, &verdict)? {
                AttemptOutcome::Rejected(rejection) => {
                    warn!(pass, code = rejection.code(), reason = %rejection, "patch rejected");
                    self.events.emit(
                        "patch_rejected",
                        json!({ "pass": pass, "rejection": &rejection }),
                    );
                    return Ok(RunOutcome::Rejected(rejection));
                }
                AttemptOutcome::Accepted { paths } => {
                    info!(pass, files = paths.len(), "patch accepted");
                    self.events
                        .emit("patch_accepted", json!({ "pass": pass, "paths": &paths }));
                }
            }

            if self.verify(&options.mode)?.success {
                return Ok(RunOutcome::Green { passes: pass });
            }
        }
        Ok(RunOutcome::MaxPassesExhausted { passes: max_passes })
    }

    /// One ladder run, recorded to the result and log sinks.
    pub fn verify(&mut self, mode: &Mode) -> Result<RunVerdict> {
        mode.validate()?;
        self.run_counter += 1;
        self.attempt += 1;
        let run_id = self.run_counter;
        let log = RunLog::create(&self.state_dir, run_id)?;
        info!(
            run_id,
            pass = self.pass,
            attempt = self.attempt,
            mode = mode.label(),
            "verifying"
        );

        let verdict = self.verifier.verify(mode, run_id, &log);
        let record = RunRecord::from_verdict(&verdict, mode, Some(log.path().to_path_buf()));
        write_run_record(&self.state_dir, &record)?;
        self.events.emit(
            "run_finished",
            json!({
                "run_id": run_id,
                "pass": self.pass,
                "attempt": self.attempt,
                "success": verdict.success,
                "first_failure": verdict.first_failure.as_ref().map(|f| &f.id),
            }),
        );
        self.log = Some(log);
        Ok(verdict)
    }

    /// Directories a patch or a formatter may write to in `mode`.
    fn allowed_prefixes(&self, mode: &Mode) -> Vec<String> {
        match mode {
            Mode::Global => self.config.runtime_allowlist.clone(),
            Mode::Scoped { spec } => vec![self.config.scope_prefix(spec)],
        }
    }

    /// One round of auto-formatting. Returns whether any file in scope
    /// changed. Formatter writes outside the scope are reverted like a
    /// rejected patch.
    fn mechanical_fix(&mut self, mode: &Mode) -> Result<bool> {
        let prefixes = self.allowed_prefixes(mode);
        let targets: Vec<String> = prefixes
            .iter()
            .filter(|prefix| self.repo_root.join(prefix).exists())
            .cloned()
            .collect();
        let commands: Vec<String> = self
            .config
            .format_commands
            .iter()
            .filter(|command| command_program(command).is_some_and(program_available_on_path))
            .cloned()
            .collect();
        if targets.is_empty() || commands.is_empty() {
            return Ok(false);
        }

        let excluded = vec![self.config.state_dir.clone()];
        let protected = self.config.protected_paths.clone();
        let status_before = self.working_changes()?;
        let protected_before = snapshot::snapshot(&self.repo_root, &protected, &excluded)?;
        let before = snapshot::snapshot(&self.repo_root, &targets, &excluded)?;

        let timeout = Duration::from_secs(self.config.stage_timeout_secs);
        for command_line in &commands {
            let full = format!("{} {}", command_line, targets.join(" "));
            let mut command = shell_command(&self.repo_root, &full);
            match run_command_with_timeout(&mut command, Some(timeout)) {
                Ok(result) => {
                    if let Some(log) = &self.log {
                        log.append_stage_output("fix", &full, &result.combined_output(), None);
                    }
                    debug!(command = %full, success = result.success(), "format command finished");
                }
                Err(err) => warn!(command = %full, error = %err, "format command failed to start"),
            }
        }

        let scope = Scope::with_prefixes(&prefixes);
        let status_after = self.working_changes()?;
        let protected_after = snapshot::snapshot(&self.repo_root, &protected, &excluded)?;
        let mut stray: BTreeSet<String> = status_after
            .difference(&status_before)
            .filter(|path| !scope.contains(path))
            .cloned()
            .collect();
        stray.extend(
            snapshot::diff(&protected_before, &protected_after)
                .into_iter()
                .filter(|path| !scope.contains(path)),
        );
        if !stray.is_empty() {
            warn!(paths = ?stray, "formatter wrote outside its targets; reverting those paths");
            self.revert_attempt(&stray, &protected_before, &protected, &excluded)?;
        }

        let after = snapshot::snapshot(&self.repo_root, &targets, &excluded)?;
        let changed = snapshot::diff(&before, &after);
        self.events.emit(
            "mechanical_fix",
            json!({
                "pass": self.pass,
                "changed": changed.len(),
                "reverted": stray.len(),
            }),
        );
        Ok(!changed.is_empty())
    }

    fn scope_for(&self, mode: &Mode) -> Result<Scope> {
        let mut scope = Scope::with_prefixes(&self.allowed_prefixes(mode));
        let ledger_path = self.config.ledger.path.trim();
        if !ledger_path.is_empty() {
            let baseline = git_ops::read_file_from_head(&self.repo_root, Path::new(ledger_path))?;
            scope = scope.with_tracked_document(ledger_path, baseline);
        }
        Ok(scope)
    }

    fn scope_label(mode: &Mode) -> String {
        match mode {
            Mode::Global => "runtime sources".to_string(),
            Mode::Scoped { spec } => format!("feature spec '{spec}'"),
        }
    }

    /// Rejection when no usable generator is configured.
    fn generator_unavailable(&self) -> Option<Rejection> {
        let Some(generator) = self.generator.as_ref() else {
            return Some(Rejection::ToolingUnavailable {
                tool: "generator".to_string(),
            });
        };
        generator
            .required_tool()
            .filter(|tool| !program_available_on_path(tool))
            .map(|tool| Rejection::ToolingUnavailable {
                tool: tool.to_string(),
            })
    }

    /// Ask the generator once and vet what comes back.
    fn request_patch(
        &mut self,
        options: &RunOptions,
        verdict: &RunVerdict,
    ) -> Result<AttemptOutcome> {
        if !options.llm_enabled {
            return Ok(AttemptOutcome::Rejected(Rejection::LlmDisabled));
        }
        if let Some(rejection) = self.generator_unavailable() {
            return Ok(AttemptOutcome::Rejected(rejection));
        }

        let scope = self.scope_for(&options.mode)?;
        let request = PatchRequest::new(&self.repo_root, Self::scope_label(&options.mode))
            .with_allowed_prefixes(scope.allowed_prefixes.clone())
            .with_tracked_document(scope.tracked_document.as_ref().map(|d| d.path.clone()))
            .with_limits(self.config.max_patch_files, self.config.max_patch_lines)
            .with_failure(verdict.first_failure.clone())
            .with_guardrails_from(&self.repo_root, self.config.guardrails_path.as_deref())
            .with_log_tail(latest_log_tail(&self.state_dir, LOG_TAIL_LINES));

        let Some(generator) = self.generator.as_mut() else {
            return Ok(AttemptOutcome::Rejected(Rejection::ToolingUnavailable {
                tool: "generator".to_string(),
            }));
        };
        let raw = match generator.generate(&request) {
            Ok(raw) => raw,
            Err(err) => {
                warn!(error = %err, "generator failed");
                return Ok(AttemptOutcome::Rejected(Rejection::ToolingUnavailable {
                    tool: generator.required_tool().unwrap_or("generator").to_string(),
                }));
            }
        };

        let diff = extract_diff(&raw, |path| scope.contains(path));
        if let GuardDecision::Reject(rejection) = self.guard.evaluate(&diff, &scope) {
            return Ok(AttemptOutcome::Rejected(rejection));
        }
        let patch = parse_patch(&diff).unwrap_or_default();
        let findings = self.hermetic.check_patch(&patch);
        if !findings.is_empty() {
            return Ok(AttemptOutcome::Rejected(Rejection::HermeticViolation {
                findings: findings.iter().map(|v| v.to_string()).collect(),
            }));
        }

        self.apply_and_check(&diff, &patch.touched_paths(), &scope, options)
    }

    /// Apply inside a snapshot/revert bracket. Every rejection path reverts
    /// everything the attempt changed before returning.
    fn apply_and_check(
        &mut self,
        diff: &str,
        diff_paths: &BTreeSet<String>,
        scope: &Scope,
        options: &RunOptions,
    ) -> Result<AttemptOutcome> {
        if self.log.is_none() {
            self.log = Some(RunLog::create(&self.state_dir, self.run_counter)?);
        }
        let log = self
            .log
            .as_ref()
            .ok_or_else(|| anyhow::anyhow!("run log unavailable"))?;
        let excluded = vec![self.config.state_dir.clone()];
        let protected = self.config.protected_paths.clone();

        let baseline_count = self.verifier.collected_tests(log)?;
        let status_before = self.working_changes()?;
        let snap_before = snapshot::snapshot(&self.repo_root, &protected, &excluded)?;

        let applied = git_ops::apply_patch(&self.repo_root, diff)?;
        let after_count = match &applied {
            ApplyOutcome::Applied => self.verifier.collected_tests(log)?,
            ApplyOutcome::Refused(reason) => {
                warn!(reason = %reason, "git refused the patch");
                baseline_count
            }
        };
        let status_after = self.working_changes()?;
        let snap_after = snapshot::snapshot(&self.repo_root, &protected, &excluded)?;

        let drift: BTreeSet<String> = snapshot::diff(&snap_before, &snap_after)
            .into_iter()
            .filter(|path| !scope.contains(path))
            .collect();
        let mut changed: BTreeSet<String> =
            status_after.difference(&status_before).cloned().collect();
        if matches!(applied, ApplyOutcome::Applied) {
            changed.extend(diff_paths.iter().cloned());
        }
        changed.extend(drift.iter().cloned());

        let rejection = self.post_apply_rejection(
            &applied,
            &drift,
            &changed,
            scope,
            baseline_count,
            after_count,
        )?;

        if let Some(rejection) = rejection {
            self.revert_attempt(&changed, &snap_before, &protected, &excluded)?;
            return Ok(AttemptOutcome::Rejected(rejection));
        }

        git_ops::stage_paths(&self.repo_root, &changed)?;
        if options.commit {
            let message = format!(
                "patchwarden: accept patch (pass {}, {})",
                self.pass,
                Self::scope_label(&options.mode)
            );
            let oid = git_ops::commit(&self.repo_root, &changed, &message)?;
            info!(commit = %oid, "accepted patch committed");
        }
        Ok(AttemptOutcome::Accepted { paths: changed })
    }

    fn post_apply_rejection(
        &self,
        applied: &ApplyOutcome,
        drift: &BTreeSet<String>,
        changed: &BTreeSet<String>,
        scope: &Scope,
        baseline_count: Option<usize>,
        after_count: Option<usize>,
    ) -> Result<Option<Rejection>> {
        if !drift.is_empty() {
            return Ok(Some(Rejection::ProtectedPathsModified {
                paths: drift.iter().cloned().collect(),
            }));
        }
        let outside: Vec<String> = changed
            .iter()
            .filter(|p| !scope.contains(p))
            .cloned()
            .collect();
        if !outside.is_empty() {
            return Ok(Some(Rejection::NonRuntimeChanges { paths: outside }));
        }
        if matches!(applied, ApplyOutcome::Refused(_)) || changed.is_empty() {
            return Ok(Some(Rejection::EmptyDiff));
        }

        let (files, lines) = git_ops::numstat(&self.repo_root, changed)?;
        let limits = self.guard.limits();
        if limits.exceeded(files, lines) {
            return Ok(Some(Rejection::PatchSizeExceeded {
                files,
                lines,
                max_files: limits.max_files,
                max_lines: limits.max_lines,
            }));
        }

        if let Some(before) = baseline_count {
            let after = after_count.unwrap_or(0);
            if after < before {
                return Ok(Some(Rejection::TestCountDecreased { before, after }));
            }
        }
        Ok(None)
    }

    /// Revert `changed` to HEAD and confirm protected paths match the
    /// pre-attempt snapshot again.
    fn revert_attempt(
        &mut self,
        changed: &BTreeSet<String>,
        snap_before: &ProtectedPathSnapshot,
        protected: &[String],
        excluded: &[String],
    ) -> Result<()> {
        let report = snapshot::revert(&self.repo_root, changed);
        debug!(
            restored = report.restored.len(),
            removed = report.removed.len(),
            failed = report.failed.len(),
            "attempt reverted"
        );
        self.events.emit(
            "attempt_reverted",
            json!({
                "pass": self.pass,
                "restored": report.restored,
                "removed": report.removed,
                "failed": report.failed.len(),
            }),
        );

        let snap_now = snapshot::snapshot(&self.repo_root, protected, excluded)?;
        let residue = snapshot::diff(snap_before, &snap_now);
        if !residue.is_empty() {
            return Err(InfraError::RevertIncomplete {
                paths: residue.into_iter().collect(),
            }
            .into());
        }
        Ok(())
    }

    /// Changed paths from git status, minus tool caches and our own state.
    fn working_changes(&self) -> Result<BTreeSet<String>> {
        Ok(git_ops::changed_paths(&self.repo_root)?
            .into_iter()
            .filter(|path| {
                !is_cache_path(path)
                    && !crate::guard::path_has_prefix(path, &self.config.state_dir)
            })
            .collect())
    }
}

fn outcome_label(outcome: &RunOutcome) -> &'static str {
    match outcome {
        RunOutcome::Green { .. } => "green",
        RunOutcome::MaxPassesExhausted { .. } => "max_passes_exhausted",
        RunOutcome::Rejected(rejection) => rejection.code(),
    }
}
