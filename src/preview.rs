//! Runs a plan's preview checks and its first run, one after another.
//!
//! Check failures are reported, never fatal: only the confirmation gates
//! stand between a plan and its real command.

use crate::executor::{CommandRunner, OutputLine};
use crate::metrics::Metrics;
use crate::types::ExecutionPlan;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepOutcome {
    pub name: String,
    pub command: String,
    pub passed: bool,
    pub output: String,
    pub error: Option<String>,
    pub timed_out: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PreviewReport {
    pub checks: Vec<StepOutcome>,
    /// `None` when the first run was skipped.
    pub first_run: Option<StepOutcome>,
}

impl PreviewReport {
    pub fn first_run_passed(&self) -> bool {
        self.first_run.as_ref().map_or(true, |r| r.passed)
    }

    pub fn failed_checks(&self) -> impl Iterator<Item = &StepOutcome> {
        self.checks.iter().filter(|c| !c.passed)
    }
}

pub async fn run_step<R: CommandRunner>(
    runner: &R,
    name: &str,
    command: &str,
    timeout: Duration,
    updates: Option<mpsc::Sender<OutputLine>>,
) -> StepOutcome {
    debug!(name, command, "running step");
    match runner.run(command, timeout, updates).await {
        Ok(output) => StepOutcome {
            name: name.to_string(),
            command: command.to_string(),
            passed: true,
            output: output.combined(),
            error: None,
            timed_out: false,
        },
        Err(e) => StepOutcome {
            name: name.to_string(),
            command: command.to_string(),
            passed: false,
            output: e.output().map(|o| o.combined()).unwrap_or_default(),
            timed_out: e.is_timeout(),
            error: Some(e.to_string()),
        },
    }
}

/// Runs every check in order, then the first-run command unless
/// `skip_first_run` is set.
pub async fn run_preview<R: CommandRunner>(
    runner: &R,
    plan: &ExecutionPlan,
    skip_first_run: bool,
    timeout: Duration,
    metrics: &mut Metrics,
    updates: Option<mpsc::Sender<OutputLine>>,
) -> PreviewReport {
    let mut report = PreviewReport::default();

    for check in &plan.checks {
        let outcome = run_step(runner, &check.name, &check.command, timeout, updates.clone()).await;
        metrics.record_validation(outcome.passed);
        info!(check = %check.name, passed = outcome.passed, "preview check");
        report.checks.push(outcome);
    }

    if !skip_first_run {
        let name = if plan.first_run_is_real() {
            "run"
        } else {
            "dry run"
        };
        let outcome = run_step(runner, name, &plan.first_run_command, timeout, updates).await;
        if plan.first_run_is_real() {
            metrics.record_execution(outcome.passed);
        } else {
            metrics.record_validation(outcome.passed);
        }
        report.first_run = Some(outcome);
    }

    report
}
