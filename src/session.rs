//! Walks one command at a time through plan, preview, confirmation and
//! execution, feeding failures of the real command into self-correction.

use crate::config::SafetyConfig;
use crate::confirm::{AbandonReason, ConfirmError, ConfirmEvent, ConfirmationMachine, Effect};
use crate::correction::{CorrectionDecision, CorrectionTracker};
use crate::executor::{CommandRunner, OutputLine};
use crate::metrics::Metrics;
use crate::planner::build_plan;
use crate::preview::{run_preview, PreviewReport, StepOutcome};
use crate::types::ExecutionPlan;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{info, warn};

/// Result of a real command run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Execution {
    pub command: String,
    pub succeeded: bool,
    pub output: String,
    pub error: Option<String>,
    pub timed_out: bool,
    pub correction: CorrectionDecision,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Next {
    AwaitSecondConfirm,
    AwaitTypedConfirm { literal: String },
    /// The first run was the real command.
    Executed(Execution),
    Abandoned(AbandonReason),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Submission {
    pub plan: ExecutionPlan,
    pub report: PreviewReport,
    pub superseded: Option<String>,
    pub next: Next,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfirmOutcome {
    Executed(Execution),
    Reprompt { literal: String },
}

pub struct Session<R: CommandRunner> {
    runner: R,
    machine: ConfirmationMachine,
    corrections: CorrectionTracker,
    metrics: Metrics,
    preview_timeout: Duration,
    exec_timeout: Duration,
}

impl<R: CommandRunner> Session<R> {
    pub fn new(runner: R, safety: &SafetyConfig) -> Self {
        Self {
            runner,
            machine: ConfirmationMachine::new(safety.typed_literal()),
            corrections: CorrectionTracker::new(safety.max_consecutive_corrections),
            metrics: Metrics::default(),
            preview_timeout: safety.preview_timeout(),
            exec_timeout: safety.exec_timeout(),
        }
    }

    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    pub fn pending(&self) -> Option<&ExecutionPlan> {
        self.machine.pending()
    }

    /// Starts a fresh operator request; corrections of earlier requests no
    /// longer count against it.
    pub fn begin_request(&mut self) {
        self.corrections.reset();
    }

    /// Plans and previews `command`. `updates` receives the output of the
    /// first run only when that run is the real command.
    pub async fn submit(
        &mut self,
        command: &str,
        updates: Option<mpsc::Sender<OutputLine>>,
    ) -> Result<Submission, ConfirmError> {
        let plan = build_plan(command);
        info!(
            command = %plan.original,
            level = %plan.danger_level,
            checks = plan.checks.len(),
            "plan built"
        );

        let submitted = self.machine.apply(ConfirmEvent::Submit(plan.clone()))?;
        let (skip_first_run, superseded) = match submitted {
            Effect::RunPreview {
                skip_first_run,
                superseded,
            } => (skip_first_run, superseded),
            other => {
                warn!(?other, "unexpected effect on submit");
                return Err(ConfirmError::NoPendingPlan);
            }
        };

        // a read-only first run is the real command: real budget, live output
        let real_first_run = plan.first_run_is_real() && !skip_first_run;
        let (timeout, updates) = if real_first_run {
            (self.exec_timeout, updates)
        } else {
            (self.preview_timeout, None)
        };
        let report = run_preview(
            &self.runner,
            &plan,
            skip_first_run,
            timeout,
            &mut self.metrics,
            updates,
        )
        .await;

        let effect = self.machine.apply(ConfirmEvent::FirstRunFinished {
            passed: report.first_run_passed(),
        })?;
        let next = match effect {
            Effect::AwaitSecondConfirm => Next::AwaitSecondConfirm,
            Effect::AwaitTypedConfirm => Next::AwaitTypedConfirm {
                literal: self.machine.typed_literal().to_string(),
            },
            Effect::Completed => {
                let execution = match &report.first_run {
                    Some(run) => self.settle(run.clone()),
                    None => self.settle(StepOutcome {
                        name: "run".to_string(),
                        command: plan.original.clone(),
                        passed: true,
                        output: String::new(),
                        error: None,
                        timed_out: false,
                    }),
                };
                Next::Executed(execution)
            }
            Effect::Abandoned { reason, .. } => {
                info!(command = %plan.original, ?reason, "plan abandoned");
                Next::Abandoned(reason)
            }
            other => {
                warn!(?other, "unexpected effect after first run");
                return Err(ConfirmError::NoPendingPlan);
            }
        };

        Ok(Submission {
            plan,
            report,
            superseded,
            next,
        })
    }

    pub async fn confirm(
        &mut self,
        updates: Option<mpsc::Sender<OutputLine>>,
    ) -> Result<ConfirmOutcome, ConfirmError> {
        let effect = self.machine.apply(ConfirmEvent::Confirm)?;
        self.follow(effect, updates).await
    }

    pub async fn confirm_typed(
        &mut self,
        input: &str,
        updates: Option<mpsc::Sender<OutputLine>>,
    ) -> Result<ConfirmOutcome, ConfirmError> {
        let effect = self
            .machine
            .apply(ConfirmEvent::TypedConfirm(input.to_string()))?;
        self.follow(effect, updates).await
    }

    /// Drops the pending plan, returning its command if there was one.
    pub fn cancel(&mut self) -> Option<String> {
        match self.machine.apply(ConfirmEvent::Cancel) {
            Ok(Effect::Abandoned { original, .. }) => {
                info!(command = %original, "plan cancelled");
                Some(original)
            }
            _ => None,
        }
    }

    async fn follow(
        &mut self,
        effect: Effect,
        updates: Option<mpsc::Sender<OutputLine>>,
    ) -> Result<ConfirmOutcome, ConfirmError> {
        match effect {
            Effect::RunReal(command) => {
                info!(command = %command, "running confirmed command");
                let outcome = crate::preview::run_step(
                    &self.runner,
                    "run",
                    &command,
                    self.exec_timeout,
                    updates,
                )
                .await;
                self.metrics.record_execution(outcome.passed);
                Ok(ConfirmOutcome::Executed(self.settle(outcome)))
            }
            Effect::Reprompt { literal } => Ok(ConfirmOutcome::Reprompt { literal }),
            other => {
                warn!(?other, "unexpected effect on confirmation");
                Err(ConfirmError::NoPendingPlan)
            }
        }
    }

    fn settle(&mut self, run: StepOutcome) -> Execution {
        let correction = if run.passed {
            self.corrections.on_success();
            CorrectionDecision::NotNeeded
        } else {
            let error_text = match &run.error {
                Some(error) if run.output.trim().is_empty() => error.clone(),
                Some(error) => format!("{}\n{}", error, run.output),
                None => run.output.clone(),
            };
            let decision = self.corrections.on_failure(&run.command, &error_text);
            if matches!(decision, CorrectionDecision::Request(_)) {
                self.metrics.record_correction();
            }
            decision
        };
        Execution {
            command: run.command,
            succeeded: run.passed,
            output: run.output,
            error: run.error,
            timed_out: run.timed_out,
            correction,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::{CommandOutput, ExecError};
    use std::sync::Mutex;

    /// Fails commands listed in `failing` exactly, records everything.
    #[derive(Default)]
    struct FakeRunner {
        failing: Vec<&'static str>,
        seen: Mutex<Vec<String>>,
    }

    impl FakeRunner {
        fn failing(commands: Vec<&'static str>) -> Self {
            Self {
                failing: commands,
                seen: Mutex::new(Vec::new()),
            }
        }

        fn seen(&self) -> Vec<String> {
            self.seen.lock().unwrap().clone()
        }
    }

    impl CommandRunner for FakeRunner {
        async fn run(
            &self,
            command: &str,
            _timeout: Duration,
            updates: Option<mpsc::Sender<OutputLine>>,
        ) -> Result<CommandOutput, ExecError> {
            self.seen.lock().unwrap().push(command.to_string());
            if let Some(tx) = updates {
                let _ = tx.send(OutputLine::Stdout(format!("ok: {}", command))).await;
            }
            if self.failing.contains(&command) {
                return Err(ExecError::NonZeroExit {
                    command: command.to_string(),
                    code: 1,
                    output: CommandOutput {
                        stdout: String::new(),
                        stderr: "error: the server could not find the requested resource"
                            .to_string(),
                    },
                });
            }
            Ok(CommandOutput {
                stdout: format!("ok: {}", command),
                stderr: String::new(),
            })
        }
    }

    fn session(runner: FakeRunner) -> Session<FakeRunner> {
        Session::new(runner, &SafetyConfig::default())
    }

    #[tokio::test]
    async fn test_read_only_runs_once_without_confirmation() {
        let mut s = session(FakeRunner::default());
        let sub = s.submit("kubectl get pods -n web", None).await.unwrap();
        let Next::Executed(execution) = sub.next else {
            panic!("expected the command to run");
        };
        assert!(execution.succeeded);
        assert_eq!(execution.output, "ok: kubectl get pods -n web");
        assert_eq!(execution.correction, CorrectionDecision::NotNeeded);
        assert_eq!(s.runner.seen(), vec!["kubectl get pods -n web"]);
        assert_eq!(s.metrics().commands_executed, 1);
        assert!(s.pending().is_none());
    }

    #[tokio::test]
    async fn test_read_only_output_streams_live() {
        let mut s = session(FakeRunner::default());
        let (tx, mut rx) = mpsc::channel(8);
        s.submit("kubectl get pods -n web", Some(tx)).await.unwrap();
        assert_eq!(
            rx.recv().await,
            Some(OutputLine::Stdout("ok: kubectl get pods -n web".to_string()))
        );
        assert_eq!(rx.recv().await, None);
    }

    #[tokio::test]
    async fn test_dry_run_output_is_not_streamed() {
        let mut s = session(FakeRunner::default());
        let (tx, mut rx) = mpsc::channel(8);
        s.submit("kubectl apply -f d.yaml", Some(tx)).await.unwrap();
        assert_eq!(rx.recv().await, None);
    }

    #[tokio::test]
    async fn test_blank_typed_literal_never_accepts_empty_input() {
        let mut safety = SafetyConfig::default();
        safety.typed_confirm_literal = String::new();
        let mut s = Session::new(FakeRunner::default(), &safety);
        let sub = s.submit("kubectl delete pods --all -n web", None).await.unwrap();
        assert_eq!(
            sub.next,
            Next::AwaitTypedConfirm {
                literal: "yes".to_string()
            }
        );
        assert!(matches!(
            s.confirm_typed("", None).await.unwrap(),
            ConfirmOutcome::Reprompt { .. }
        ));
        assert!(!s
            .runner
            .seen()
            .contains(&"kubectl delete pods --all -n web".to_string()));
    }

    #[tokio::test]
    async fn test_apply_runs_dry_run_then_waits() {
        let mut s = session(FakeRunner::default());
        let sub = s.submit("kubectl apply -f d.yaml", None).await.unwrap();
        assert_eq!(sub.next, Next::AwaitSecondConfirm);
        assert_eq!(s.runner.seen(), vec!["kubectl apply -f d.yaml --dry-run=client"]);
        assert_eq!(s.metrics().validations_passed, 1);

        let ConfirmOutcome::Executed(execution) = s.confirm(None).await.unwrap() else {
            panic!("expected execution");
        };
        assert!(execution.succeeded);
        assert_eq!(s.runner.seen().last().map(String::as_str), Some("kubectl apply -f d.yaml"));
        assert_eq!(s.metrics().commands_executed, 1);
    }

    #[tokio::test]
    async fn test_typed_confirmation_gates_bulk_delete() {
        let mut s = session(FakeRunner::default());
        let sub = s.submit("kubectl delete pods --all -n web", None).await.unwrap();
        assert_eq!(
            sub.next,
            Next::AwaitTypedConfirm {
                literal: "yes".to_string()
            }
        );
        assert!(s.confirm(None).await.is_err());
        assert_eq!(
            s.confirm_typed("y", None).await.unwrap(),
            ConfirmOutcome::Reprompt {
                literal: "yes".to_string()
            }
        );
        assert!(!s
            .runner
            .seen()
            .contains(&"kubectl delete pods --all -n web".to_string()));

        let outcome = s.confirm_typed("yes", None).await.unwrap();
        assert!(matches!(outcome, ConfirmOutcome::Executed(ref e) if e.succeeded));
        assert_eq!(
            s.runner.seen().last().map(String::as_str),
            Some("kubectl delete pods --all -n web")
        );
    }

    #[tokio::test]
    async fn test_unknown_tool_never_runs_before_confirmation() {
        let mut s = session(FakeRunner::default());
        let sub = s.submit("terraform apply", None).await.unwrap();
        assert_eq!(sub.next, Next::AwaitSecondConfirm);
        assert!(sub.report.first_run.is_none());
        assert!(s.runner.seen().is_empty());

        s.confirm(None).await.unwrap();
        assert_eq!(s.runner.seen(), vec!["terraform apply"]);
    }

    #[tokio::test]
    async fn test_failed_dry_run_abandons_without_real_run() {
        let runner = FakeRunner::failing(vec!["kubectl apply -f bad.yaml --dry-run=client"]);
        let mut s = session(runner);
        let sub = s.submit("kubectl apply -f bad.yaml", None).await.unwrap();
        assert_eq!(sub.next, Next::Abandoned(AbandonReason::DryRunFailed));
        assert_eq!(s.metrics().validations_failed, 1);
        assert!(s.pending().is_none());
        assert_eq!(s.runner.seen().len(), 1);
    }

    #[tokio::test]
    async fn test_real_failure_requests_correction_until_cap() {
        let runner = FakeRunner::failing(vec!["kubectl apply -f d.yaml"]);
        let mut s = session(runner);
        s.begin_request();

        for _ in 0..3 {
            s.submit("kubectl apply -f d.yaml", None).await.unwrap();
            let ConfirmOutcome::Executed(execution) = s.confirm(None).await.unwrap() else {
                panic!("expected execution");
            };
            assert!(!execution.succeeded);
            let CorrectionDecision::Request(prompt) = execution.correction else {
                panic!("expected a correction request");
            };
            assert!(prompt.contains("kubectl apply -f d.yaml"));
            assert!(prompt.contains("could not find the requested resource"));
        }

        s.submit("kubectl apply -f d.yaml", None).await.unwrap();
        let ConfirmOutcome::Executed(execution) = s.confirm(None).await.unwrap() else {
            panic!("expected execution");
        };
        assert_eq!(execution.correction, CorrectionDecision::GiveUp { attempts: 3 });
        assert_eq!(s.metrics().corrections_requested, 3);
        assert_eq!(s.metrics().commands_failed, 4);
    }

    #[tokio::test]
    async fn test_failed_read_only_command_feeds_correction() {
        let runner = FakeRunner::failing(vec!["kubectl get deploy missing"]);
        let mut s = session(runner);
        let sub = s.submit("kubectl get deploy missing", None).await.unwrap();
        let Next::Executed(execution) = sub.next else {
            panic!("expected the command to run");
        };
        assert!(!execution.succeeded);
        assert!(matches!(execution.correction, CorrectionDecision::Request(_)));
    }

    #[tokio::test]
    async fn test_resubmission_supersedes_and_cancel_clears() {
        let mut s = session(FakeRunner::default());
        s.submit("kubectl delete ns web", None).await.unwrap();
        let sub = s.submit("kubectl scale deploy api --replicas=2", None).await.unwrap();
        assert_eq!(sub.superseded.as_deref(), Some("kubectl delete ns web"));

        assert_eq!(
            s.cancel().as_deref(),
            Some("kubectl scale deploy api --replicas=2")
        );
        assert_eq!(s.cancel(), None);
        assert!(s.confirm(None).await.is_err());
        assert!(!s.runner.seen().iter().any(|c| c == "kubectl delete ns web"));
    }
}
