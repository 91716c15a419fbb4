use crate::ollama::{LanguageModel, LlmError};
use crate::prompts::{correction_prompt, extract_command};
use crate::types::PromptMode;
use tracing::{info, warn};

pub const DEFAULT_MAX_CONSECUTIVE: u32 = 3;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CorrectionDecision {
    /// Nothing to correct: success, or a failure without error text.
    NotNeeded,
    /// Ask the model for a fixed command with this prompt.
    Request(String),
    /// Too many corrections in a row for the same request.
    GiveUp { attempts: u32 },
}

/// Counts consecutive corrections for one operator request.
#[derive(Debug, Clone)]
pub struct CorrectionTracker {
    max_consecutive: u32,
    consecutive: u32,
}

impl CorrectionTracker {
    pub fn new(max_consecutive: u32) -> Self {
        Self {
            max_consecutive,
            consecutive: 0,
        }
    }

    pub fn attempts(&self) -> u32 {
        self.consecutive
    }

    /// Called when the operator submits a fresh request.
    pub fn reset(&mut self) {
        self.consecutive = 0;
    }

    pub fn on_success(&mut self) {
        self.reset();
    }

    pub fn on_failure(&mut self, command: &str, error_text: &str) -> CorrectionDecision {
        if error_text.trim().is_empty() {
            return CorrectionDecision::NotNeeded;
        }
        if self.consecutive >= self.max_consecutive {
            warn!(
                command,
                attempts = self.consecutive,
                "giving up on self-correction"
            );
            let attempts = self.consecutive;
            self.reset();
            return CorrectionDecision::GiveUp { attempts };
        }
        self.consecutive += 1;
        info!(command, attempt = self.consecutive, "requesting correction");
        CorrectionDecision::Request(correction_prompt(command, error_text))
    }
}

/// Sends a correction prompt to the model and pulls the suggested command
/// out of its reply. The suggestion goes back through planning like any
/// other command.
pub async fn request_correction<L: LanguageModel>(
    llm: &L,
    prompt: &str,
) -> Result<Option<String>, LlmError> {
    let reply = llm.complete(prompt, PromptMode::Command).await?;
    Ok(extract_command(&reply))
}
