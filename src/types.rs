use serde::{Deserialize, Serialize};
use std::fmt;

/// How much damage a command can do. Ordered so that `max` escalates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DangerLevel {
    Low,
    Medium,
    High,
    Critical,
}

impl DangerLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            DangerLevel::Low => "low",
            DangerLevel::Medium => "medium",
            DangerLevel::High => "high",
            DangerLevel::Critical => "critical",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "low" => Some(DangerLevel::Low),
            "medium" => Some(DangerLevel::Medium),
            "high" => Some(DangerLevel::High),
            "critical" => Some(DangerLevel::Critical),
            _ => None,
        }
    }
}

impl fmt::Display for DangerLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PreviewCheck {
    pub name: String,
    pub command: String,
}

impl PreviewCheck {
    pub fn new(name: impl Into<String>, command: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            command: command.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionPlan {
    pub original: String,
    pub first_run_command: String,
    pub checks: Vec<PreviewCheck>,
    pub require_second_confirm: bool,
    pub require_typed_confirm: bool,
    pub danger_level: DangerLevel,
    /// How the plan was put together (dry-run substitutions, skipped steps).
    pub notes: Vec<String>,
    /// Why the command is risky, in detection order.
    pub safety_checks: Vec<String>,
}

impl ExecutionPlan {
    pub fn needs_confirmation(&self) -> bool {
        self.require_second_confirm || self.require_typed_confirm
    }

    /// True when running `first_run_command` would run the real command.
    pub fn first_run_is_real(&self) -> bool {
        self.first_run_command == self.original
    }
}

/// Which system prompt the model is addressed with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PromptMode {
    Command,
    Chat,
    Agent,
}

#[derive(Debug, Clone)]
pub struct HistoryEntry {
    pub request: String,
    pub command: String,
    pub danger_level: DangerLevel,
    pub executed: bool,
    pub succeeded: bool,
}
