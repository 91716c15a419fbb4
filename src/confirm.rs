//! Confirmation state machine. The only path to the real command of a plan
//! that needs confirmation is a transition into `Resolved` that returns
//! [`Effect::RunReal`].

use crate::types::ExecutionPlan;
use tracing::{debug, info};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfirmState {
    NoPlan,
    AwaitingFirstRun(ExecutionPlan),
    AwaitingSecondConfirm(ExecutionPlan),
    AwaitingTypedConfirm(ExecutionPlan),
    Resolved(ExecutionPlan),
}

impl ConfirmState {
    pub fn name(&self) -> &'static str {
        match self {
            ConfirmState::NoPlan => "no plan",
            ConfirmState::AwaitingFirstRun(_) => "awaiting first run",
            ConfirmState::AwaitingSecondConfirm(_) => "awaiting confirmation",
            ConfirmState::AwaitingTypedConfirm(_) => "awaiting typed confirmation",
            ConfirmState::Resolved(_) => "resolved",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfirmEvent {
    Submit(ExecutionPlan),
    FirstRunFinished { passed: bool },
    Confirm,
    TypedConfirm(String),
    Cancel,
}

impl ConfirmEvent {
    fn name(&self) -> &'static str {
        match self {
            ConfirmEvent::Submit(_) => "submit",
            ConfirmEvent::FirstRunFinished { .. } => "first run finished",
            ConfirmEvent::Confirm => "confirm",
            ConfirmEvent::TypedConfirm(_) => "typed confirm",
            ConfirmEvent::Cancel => "cancel",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbandonReason {
    Cancelled,
    Superseded,
    DryRunFailed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Effect {
    /// Run the plan's checks, then its first run unless skipped.
    RunPreview {
        skip_first_run: bool,
        superseded: Option<String>,
    },
    AwaitSecondConfirm,
    AwaitTypedConfirm,
    Reprompt { literal: String },
    RunReal(String),
    /// The first run was the real command; nothing more to do.
    Completed,
    Abandoned {
        original: String,
        reason: AbandonReason,
    },
    Idle,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfirmError {
    #[error("cannot {event} while {state}")]
    InvalidTransition {
        state: &'static str,
        event: &'static str,
    },
    #[error("no plan is waiting for confirmation")]
    NoPendingPlan,
}

#[derive(Debug)]
pub struct ConfirmationMachine {
    state: ConfirmState,
    typed_literal: String,
}

impl ConfirmationMachine {
    pub fn new(typed_literal: impl Into<String>) -> Self {
        Self {
            state: ConfirmState::NoPlan,
            typed_literal: typed_literal.into(),
        }
    }

    pub fn state(&self) -> &ConfirmState {
        &self.state
    }

    pub fn typed_literal(&self) -> &str {
        &self.typed_literal
    }

    /// The plan still waiting on the first run or on the operator.
    pub fn pending(&self) -> Option<&ExecutionPlan> {
        match &self.state {
            ConfirmState::AwaitingFirstRun(plan)
            | ConfirmState::AwaitingSecondConfirm(plan)
            | ConfirmState::AwaitingTypedConfirm(plan) => Some(plan),
            ConfirmState::NoPlan | ConfirmState::Resolved(_) => None,
        }
    }

    fn literal_matches(&self, input: &str) -> bool {
        input.trim().eq_ignore_ascii_case(&self.typed_literal)
    }

    pub fn apply(&mut self, event: ConfirmEvent) -> Result<Effect, ConfirmError> {
        let state_name = self.state.name();
        let event_name = event.name();
        let invalid = || ConfirmError::InvalidTransition {
            state: state_name,
            event: event_name,
        };

        let current = std::mem::replace(&mut self.state, ConfirmState::NoPlan);
        let (next, effect) = match (current, event) {
            (current, ConfirmEvent::Submit(plan)) => {
                let superseded = match current {
                    ConfirmState::AwaitingFirstRun(old)
                    | ConfirmState::AwaitingSecondConfirm(old)
                    | ConfirmState::AwaitingTypedConfirm(old) => {
                        info!(command = %old.original, "pending plan superseded");
                        Some(old.original)
                    }
                    ConfirmState::NoPlan | ConfirmState::Resolved(_) => None,
                };
                let skip_first_run = plan.needs_confirmation() && plan.first_run_is_real();
                (
                    ConfirmState::AwaitingFirstRun(plan),
                    Effect::RunPreview {
                        skip_first_run,
                        superseded,
                    },
                )
            }

            (ConfirmState::AwaitingFirstRun(plan), ConfirmEvent::FirstRunFinished { passed }) => {
                if !passed && !(plan.first_run_is_real() && !plan.needs_confirmation()) {
                    let original = plan.original;
                    (
                        ConfirmState::NoPlan,
                        Effect::Abandoned {
                            original,
                            reason: AbandonReason::DryRunFailed,
                        },
                    )
                } else if plan.require_typed_confirm {
                    (ConfirmState::AwaitingTypedConfirm(plan), Effect::AwaitTypedConfirm)
                } else if plan.require_second_confirm {
                    (ConfirmState::AwaitingSecondConfirm(plan), Effect::AwaitSecondConfirm)
                } else {
                    (ConfirmState::Resolved(plan), Effect::Completed)
                }
            }

            (ConfirmState::AwaitingSecondConfirm(plan), ConfirmEvent::Confirm) => {
                let real = plan.original.clone();
                (ConfirmState::Resolved(plan), Effect::RunReal(real))
            }

            (ConfirmState::AwaitingTypedConfirm(plan), ConfirmEvent::TypedConfirm(input)) => {
                if self.literal_matches(&input) {
                    let real = plan.original.clone();
                    (ConfirmState::Resolved(plan), Effect::RunReal(real))
                } else {
                    debug!("typed confirmation did not match");
                    (
                        ConfirmState::AwaitingTypedConfirm(plan),
                        Effect::Reprompt {
                            literal: self.typed_literal.clone(),
                        },
                    )
                }
            }

            (
                ConfirmState::AwaitingFirstRun(plan)
                | ConfirmState::AwaitingSecondConfirm(plan)
                | ConfirmState::AwaitingTypedConfirm(plan),
                ConfirmEvent::Cancel,
            ) => (
                ConfirmState::NoPlan,
                Effect::Abandoned {
                    original: plan.original,
                    reason: AbandonReason::Cancelled,
                },
            ),

            (
                current @ (ConfirmState::NoPlan | ConfirmState::Resolved(_)),
                ConfirmEvent::Cancel,
            ) => (current, Effect::Idle),

            (current @ (ConfirmState::NoPlan | ConfirmState::Resolved(_)), _) => {
                self.state = current;
                return Err(ConfirmError::NoPendingPlan);
            }

            (current, _) => {
                self.state = current;
                return Err(invalid());
            }
        };

        debug!(from = state_name, to = next.name(), event = event_name, "confirmation transition");
        self.state = next;
        Ok(effect)
    }
}
