use serde::Serialize;
use std::fmt;

/// Counters for one session; separate sessions never share them.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Metrics {
    pub validations_passed: u64,
    pub validations_failed: u64,
    pub safety_blocks: u64,
    pub commands_executed: u64,
    pub commands_failed: u64,
    pub corrections_requested: u64,
    pub agent_steps: u64,
}

impl Metrics {
    pub fn record_validation(&mut self, passed: bool) {
        if passed {
            self.validations_passed += 1;
        } else {
            self.validations_failed += 1;
        }
    }

    pub fn record_execution(&mut self, succeeded: bool) {
        self.commands_executed += 1;
        if !succeeded {
            self.commands_failed += 1;
        }
    }

    pub fn record_safety_block(&mut self) {
        self.safety_blocks += 1;
    }

    pub fn record_correction(&mut self) {
        self.corrections_requested += 1;
    }

    pub fn record_agent_step(&mut self) {
        self.agent_steps += 1;
    }
}

impl fmt::Display for Metrics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "  validations: {} passed, {} failed",
            self.validations_passed, self.validations_failed
        )?;
        writeln!(
            f,
            "  executions:  {} run, {} failed",
            self.commands_executed, self.commands_failed
        )?;
        writeln!(f, "  corrections: {}", self.corrections_requested)?;
        writeln!(f, "  agent steps: {}", self.agent_steps)?;
        write!(f, "  safety blocks: {}", self.safety_blocks)
    }
}
