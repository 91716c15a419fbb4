//! ReAct-lite investigation loop.
//!
//! The model proposes one read-only command per turn; whitelisted commands
//! run, anything else ends the session. The step budget bounds the loop
//! even if the model never gives a final answer.

use crate::executor::CommandRunner;
use crate::metrics::Metrics;
use crate::ollama::{LanguageModel, LlmError};
use crate::prompts::{agent_prompt, agent_wrap_up_prompt};
use crate::redact::redact;
use crate::safety::is_whitelisted;
use crate::types::PromptMode;
use std::time::Duration;
use tracing::{debug, info, warn};

pub const DEFAULT_MAX_STEPS: usize = 5;

const MAX_MALFORMED_TURNS: usize = 2;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReActStep {
    pub action: String,
    pub observation: String,
    pub allowed: bool,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentPhase {
    Thinking,
    Acting,
    Completed,
    Terminated,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AgentError {
    #[error("maximum steps reached ({max})")]
    MaxStepsReached { max: usize },
    #[error("action not whitelisted: {action}")]
    NotWhitelisted { action: String },
    #[error("model reply has neither an Action: nor a Final: line")]
    MalformedResponse,
    #[error("agent session is closed")]
    SessionClosed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Turn {
    Completed(String),
    Observed(ReActStep),
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Marker {
    Final(String),
    Action(String),
}

fn parse_marker(text: &str) -> Option<Marker> {
    let mut lines = text.lines();
    while let Some(line) = lines.next() {
        let line = line.trim();
        if let Some(answer) = line.strip_prefix("Final:") {
            // the answer may continue on the following lines
            let mut answer = answer.trim().to_string();
            let rest = lines.by_ref().collect::<Vec<_>>().join("\n");
            if !rest.trim().is_empty() {
                if !answer.is_empty() {
                    answer.push('\n');
                }
                answer.push_str(rest.trim());
            }
            return Some(Marker::Final(answer));
        }
        if let Some(action) = line.strip_prefix("Action:") {
            return Some(Marker::Action(action.trim().trim_matches('`').trim().to_string()));
        }
    }
    None
}

#[derive(Debug, Clone)]
pub struct ReActSession {
    max_steps: usize,
    steps: Vec<ReActStep>,
    current_step: usize,
    phase: AgentPhase,
    final_answer: String,
}

impl Default for ReActSession {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_STEPS)
    }
}

impl ReActSession {
    pub fn new(max_steps: usize) -> Self {
        Self {
            max_steps,
            steps: Vec::new(),
            current_step: 0,
            phase: AgentPhase::Thinking,
            final_answer: String::new(),
        }
    }

    pub fn max_steps(&self) -> usize {
        self.max_steps
    }

    pub fn steps(&self) -> &[ReActStep] {
        &self.steps
    }

    pub fn current_step(&self) -> usize {
        self.current_step
    }

    pub fn phase(&self) -> AgentPhase {
        self.phase
    }

    pub fn completed(&self) -> bool {
        self.phase == AgentPhase::Completed
    }

    pub fn final_answer(&self) -> &str {
        &self.final_answer
    }

    pub fn remaining(&self) -> usize {
        self.max_steps.saturating_sub(self.current_step)
    }

    pub fn budget_exhausted(&self) -> bool {
        self.current_step >= self.max_steps || self.steps.len() >= self.max_steps
    }

    fn transition(&mut self, next: AgentPhase) -> Result<(), AgentError> {
        use AgentPhase::*;
        match (self.phase, next) {
            (Thinking, Acting)
            | (Acting, Thinking)
            | (Thinking, Completed)
            | (Thinking, Terminated) => {
                debug!(from = ?self.phase, to = ?next, "agent transition");
                self.phase = next;
                Ok(())
            }
            _ => Err(AgentError::SessionClosed),
        }
    }

    pub async fn process_model_response<R: CommandRunner>(
        &mut self,
        runner: &R,
        text: &str,
        timeout: Duration,
    ) -> Result<Turn, AgentError> {
        if self.phase != AgentPhase::Thinking {
            return Err(AgentError::SessionClosed);
        }
        match parse_marker(text) {
            Some(Marker::Final(answer)) if !answer.is_empty() => {
                self.transition(AgentPhase::Completed)?;
                info!(steps = self.current_step, "agent finished");
                self.final_answer = answer;
                Ok(Turn::Completed(self.final_answer.clone()))
            }
            Some(Marker::Action(action)) if !action.is_empty() => self
                .execute_action(runner, &action, timeout)
                .await
                .map(Turn::Observed),
            _ => Err(AgentError::MalformedResponse),
        }
    }

    pub async fn execute_action<R: CommandRunner>(
        &mut self,
        runner: &R,
        action: &str,
        timeout: Duration,
    ) -> Result<ReActStep, AgentError> {
        if self.phase != AgentPhase::Thinking {
            return Err(AgentError::SessionClosed);
        }
        if self.budget_exhausted() {
            return Err(AgentError::MaxStepsReached {
                max: self.max_steps,
            });
        }

        if !is_whitelisted(action) {
            warn!(action, "agent action blocked");
            self.transition(AgentPhase::Terminated)?;
            self.steps.push(ReActStep {
                action: action.to_string(),
                observation: String::new(),
                allowed: false,
                error: Some("not whitelisted".to_string()),
            });
            return Err(AgentError::NotWhitelisted {
                action: action.to_string(),
            });
        }

        self.transition(AgentPhase::Acting)?;
        let step = match runner.run(action, timeout, None).await {
            Ok(output) => ReActStep {
                action: action.to_string(),
                observation: redact(&output.combined()),
                allowed: true,
                error: None,
            },
            Err(e) => ReActStep {
                action: action.to_string(),
                observation: redact(&e.output().map(|o| o.combined()).unwrap_or_default()),
                allowed: true,
                error: Some(redact(&e.to_string())),
            },
        };
        self.steps.push(step.clone());
        self.current_step += 1;
        self.transition(AgentPhase::Thinking)?;
        Ok(step)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AgentOutcome {
    Answered {
        answer: String,
        steps: Vec<ReActStep>,
    },
    Blocked {
        action: String,
        steps: Vec<ReActStep>,
    },
    Exhausted {
        steps: Vec<ReActStep>,
    },
    Malformed {
        steps: Vec<ReActStep>,
    },
}

pub struct AgentSettings<'a> {
    pub max_steps: usize,
    pub step_timeout: Duration,
    pub banner: Option<&'a str>,
}

/// Drives a session until it answers, gets blocked or runs out of steps.
pub async fn investigate<L: LanguageModel, R: CommandRunner>(
    llm: &L,
    runner: &R,
    question: &str,
    settings: &AgentSettings<'_>,
    metrics: &mut Metrics,
    mut on_step: impl FnMut(&ReActStep),
) -> Result<AgentOutcome, LlmError> {
    let mut session = ReActSession::new(settings.max_steps);
    let mut malformed = 0;

    while !session.budget_exhausted() {
        let prompt = agent_prompt(question, settings.banner, session.steps(), session.remaining());
        let reply = llm.complete(&prompt, PromptMode::Agent).await?;

        match session
            .process_model_response(runner, &reply, settings.step_timeout)
            .await
        {
            Ok(Turn::Completed(answer)) => {
                return Ok(AgentOutcome::Answered {
                    answer,
                    steps: session.steps().to_vec(),
                })
            }
            Ok(Turn::Observed(step)) => {
                malformed = 0;
                metrics.record_agent_step();
                on_step(&step);
            }
            Err(AgentError::NotWhitelisted { action }) => {
                metrics.record_safety_block();
                if let Some(step) = session.steps().last() {
                    on_step(step);
                }
                return Ok(AgentOutcome::Blocked {
                    action,
                    steps: session.steps().to_vec(),
                });
            }
            Err(AgentError::MalformedResponse) => {
                malformed += 1;
                warn!(malformed, "malformed agent reply");
                if malformed > MAX_MALFORMED_TURNS {
                    return Ok(AgentOutcome::Malformed {
                        steps: session.steps().to_vec(),
                    });
                }
            }
            Err(e @ (AgentError::MaxStepsReached { .. } | AgentError::SessionClosed)) => {
                debug!("agent loop stopped: {}", e);
                break;
            }
        }
    }

    // one last chance to summarise the partial findings
    let prompt = agent_wrap_up_prompt(question, session.steps());
    let reply = llm.complete(&prompt, PromptMode::Agent).await?;
    if let Some(Marker::Final(answer)) = parse_marker(&reply) {
        if !answer.is_empty() {
            return Ok(AgentOutcome::Answered {
                answer,
                steps: session.steps().to_vec(),
            });
        }
    }
    Ok(AgentOutcome::Exhausted {
        steps: session.steps().to_vec(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::{CommandOutput, ExecError, OutputLine};
    use crate::ollama::tests::ScriptedModel;
    use std::sync::Mutex;
    use tokio::sync::mpsc;

    const STEP: Duration = Duration::from_secs(1);

    #[derive(Default)]
    struct EchoRunner {
        ran: Mutex<Vec<String>>,
    }

    impl CommandRunner for EchoRunner {
        async fn run(
            &self,
            command: &str,
            _timeout: Duration,
            _updates: Option<mpsc::Sender<OutputLine>>,
        ) -> Result<CommandOutput, ExecError> {
            self.ran.lock().unwrap().push(command.to_string());
            if command.contains("missing") {
                return Err(ExecError::NonZeroExit {
                    command: command.to_string(),
                    code: 1,
                    output: CommandOutput {
                        stdout: String::new(),
                        stderr: "Error from server (NotFound)".to_string(),
                    },
                });
            }
            Ok(CommandOutput {
                stdout: format!("output of {}", command),
                stderr: String::new(),
            })
        }
    }

    #[tokio::test]
    async fn test_final_answer_completes_without_steps() {
        let runner = EchoRunner::default();
        let mut session = ReActSession::default();
        let turn = session
            .process_model_response(&runner, "Final: root cause is X", STEP)
            .await
            .unwrap();
        assert_eq!(turn, Turn::Completed("root cause is X".to_string()));
        assert!(session.completed());
        assert_eq!(session.final_answer(), "root cause is X");
        assert!(session.steps().is_empty());
        assert!(runner.ran.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_blocked_action_records_step_without_running() {
        let runner = EchoRunner::default();
        let mut session = ReActSession::new(1);
        let err = session
            .process_model_response(&runner, "Action: kubectl delete pod x", STEP)
            .await
            .unwrap_err();
        assert_eq!(
            err,
            AgentError::NotWhitelisted {
                action: "kubectl delete pod x".to_string()
            }
        );
        assert_eq!(session.steps().len(), 1);
        assert!(!session.steps()[0].allowed);
        assert!(session.steps()[0].observation.is_empty());
        assert_eq!(session.current_step(), 0);
        assert!(!session.completed());
        assert_eq!(session.phase(), AgentPhase::Terminated);
        assert!(runner.ran.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_allowed_action_is_observed() {
        let runner = EchoRunner::default();
        let mut session = ReActSession::new(3);
        let turn = session
            .process_model_response(
                &runner,
                "Thought: check pods\nAction: `kubectl get pods -n web`",
                STEP,
            )
            .await
            .unwrap();
        let Turn::Observed(step) = turn else {
            panic!("expected an observation");
        };
        assert_eq!(step.action, "kubectl get pods -n web");
        assert_eq!(step.observation, "output of kubectl get pods -n web");
        assert_eq!(session.current_step(), 1);
        assert_eq!(session.phase(), AgentPhase::Thinking);
    }

    #[tokio::test]
    async fn test_failed_action_records_error_and_counts() {
        let runner = EchoRunner::default();
        let mut session = ReActSession::new(3);
        let step = session
            .execute_action(&runner, "kubectl get pod missing", STEP)
            .await
            .unwrap();
        assert!(step.allowed);
        assert!(step.error.is_some());
        assert_eq!(step.observation, "Error from server (NotFound)");
        assert_eq!(session.current_step(), 1);
    }

    #[tokio::test]
    async fn test_step_budget_is_enforced() {
        let runner = EchoRunner::default();
        let mut session = ReActSession::new(2);
        for _ in 0..2 {
            session
                .execute_action(&runner, "kubectl get pods", STEP)
                .await
                .unwrap();
        }
        let before = session.steps().to_vec();
        let err = session
            .execute_action(&runner, "kubectl get nodes", STEP)
            .await
            .unwrap_err();
        assert_eq!(err, AgentError::MaxStepsReached { max: 2 });
        assert_eq!(session.steps(), before.as_slice());
        assert!(session.steps().len() <= session.max_steps());
    }

    #[tokio::test]
    async fn test_malformed_reply_does_not_mutate() {
        let runner = EchoRunner::default();
        let mut session = ReActSession::new(2);
        let err = session
            .process_model_response(&runner, "I think the pods are fine.", STEP)
            .await
            .unwrap_err();
        assert_eq!(err, AgentError::MalformedResponse);
        assert!(session.steps().is_empty());
        assert_eq!(session.phase(), AgentPhase::Thinking);

        // an empty final answer is not an answer
        assert_eq!(
            session
                .process_model_response(&runner, "Final:   ", STEP)
                .await
                .unwrap_err(),
            AgentError::MalformedResponse
        );
    }

    #[tokio::test]
    async fn test_closed_session_rejects_more_turns() {
        let runner = EchoRunner::default();
        let mut session = ReActSession::new(3);
        session
            .process_model_response(&runner, "Final: done", STEP)
            .await
            .unwrap();
        assert_eq!(
            session
                .process_model_response(&runner, "Action: kubectl get pods", STEP)
                .await
                .unwrap_err(),
            AgentError::SessionClosed
        );
    }

    #[test]
    fn test_whitelist_agrees_with_execute_action() {
        let rt = tokio::runtime::Builder::new_current_thread()
            .build()
            .unwrap();
        for action in [
            "kubectl get pods",
            "kubectl logs api-1 --tail=50",
            "helm get values web",
            "kubectl delete pod x",
            "kubectl get pods; rm -rf /",
            "helm upgrade web ./c",
            "cat /etc/passwd",
            "/tmp/x/kubectl get pods",
            "./helm list",
            "kubectl --cache-dir get delete namespace prod",
        ] {
            let runner = EchoRunner::default();
            let mut session = ReActSession::new(5);
            let result = rt.block_on(session.execute_action(&runner, action, STEP));
            let rejected = matches!(result, Err(AgentError::NotWhitelisted { .. }));
            assert_eq!(is_whitelisted(action), !rejected, "{action}");
        }

        let runner = EchoRunner::default();
        let mut session = ReActSession::new(5);
        let action = "/tmp/x/kubectl get pods";
        let result = rt.block_on(session.execute_action(&runner, action, STEP));
        assert!(matches!(result, Err(AgentError::NotWhitelisted { .. })));
        assert!(runner.ran.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_investigate_answers() {
        let model = ScriptedModel::new(vec![
            "Action: kubectl get pods -n web",
            "Action: kubectl describe pod api-1 -n web",
            "Final: api-1 is OOMKilled; raise its memory limit",
        ]);
        let runner = EchoRunner::default();
        let mut metrics = Metrics::default();
        let settings = AgentSettings {
            max_steps: 5,
            step_timeout: STEP,
            banner: None,
        };
        let mut seen = 0;
        let outcome = investigate(
            &model,
            &runner,
            "why is api down?",
            &settings,
            &mut metrics,
            |_| seen += 1,
        )
        .await
        .unwrap();

        let AgentOutcome::Answered { answer, steps } = outcome else {
            panic!("expected an answer");
        };
        assert_eq!(answer, "api-1 is OOMKilled; raise its memory limit");
        assert_eq!(steps.len(), 2);
        assert_eq!(seen, 2);
        assert_eq!(metrics.agent_steps, 2);
        assert!(model.prompts().iter().all(|(_, mode)| *mode == PromptMode::Agent));
    }

    #[tokio::test]
    async fn test_investigate_stops_on_blocked_action() {
        let model = ScriptedModel::new(vec!["Action: kubectl delete pod api-1"]);
        let runner = EchoRunner::default();
        let mut metrics = Metrics::default();
        let settings = AgentSettings {
            max_steps: 5,
            step_timeout: STEP,
            banner: None,
        };
        let outcome = investigate(&model, &runner, "fix api", &settings, &mut metrics, |_| {})
            .await
            .unwrap();
        assert!(matches!(
            outcome,
            AgentOutcome::Blocked { ref action, .. } if action == "kubectl delete pod api-1"
        ));
        assert_eq!(metrics.safety_blocks, 1);
        assert!(runner.ran.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_investigate_exhausts_budget() {
        let model = ScriptedModel::new(vec![
            "Action: kubectl get pods",
            "Action: kubectl get events",
            "I could not tell.",
        ]);
        let runner = EchoRunner::default();
        let mut metrics = Metrics::default();
        let settings = AgentSettings {
            max_steps: 2,
            step_timeout: STEP,
            banner: None,
        };
        let outcome = investigate(&model, &runner, "what broke?", &settings, &mut metrics, |_| {})
            .await
            .unwrap();
        assert!(matches!(outcome, AgentOutcome::Exhausted { ref steps } if steps.len() == 2));
    }
}
