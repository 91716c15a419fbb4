use crate::config::LlmConfig;
use crate::prompts::system_prompt;
use crate::types::PromptMode;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use std::future::Future;
use tokio::sync::mpsc;
use tracing::debug;

#[derive(Serialize)]
struct OllamaGenerate<'a> {
    model: &'a str,
    prompt: &'a str,
    system: String,
    stream: bool,
}

#[derive(Deserialize)]
struct OllamaGenerateResponse {
    response: String,
    #[serde(default)]
    done: bool,
}

#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    #[error("request to {url} failed: {source}")]
    Http {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("model endpoint returned {status}: {body}")]
    Status { status: u16, body: String },
    #[error("could not decode model response: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("model returned an empty response")]
    Empty,
}

/// Text completion collaborator. Prompts are expected to be redacted
/// already.
pub trait LanguageModel {
    fn complete(
        &self,
        prompt: &str,
        mode: PromptMode,
    ) -> impl Future<Output = Result<String, LlmError>> + Send;
}

pub struct OllamaClient {
    base_url: String,
    model: String,
    agent_max_steps: usize,
    client: reqwest::Client,
}

impl OllamaClient {
    pub fn new(config: &LlmConfig, agent_max_steps: usize) -> Self {
        Self {
            base_url: config.endpoint.trim_end_matches('/').to_string(),
            model: config.model.clone(),
            agent_max_steps,
            client: reqwest::Client::new(),
        }
    }

    async fn post(
        &self,
        prompt: &str,
        mode: PromptMode,
        stream: bool,
    ) -> Result<reqwest::Response, LlmError> {
        let url = format!("{}/api/generate", self.base_url);
        let body = OllamaGenerate {
            model: &self.model,
            prompt,
            system: system_prompt(mode, self.agent_max_steps),
            stream,
        };
        debug!(?mode, stream, prompt_chars = prompt.len(), "calling model");
        let resp = self
            .client
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|source| LlmError::Http { url, source })?;

        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let body = resp.text().await.unwrap_or_default();
            return Err(LlmError::Status { status, body });
        }
        Ok(resp)
    }

    pub async fn generate(&self, prompt: &str, mode: PromptMode) -> Result<String, LlmError> {
        let url = format!("{}/api/generate", self.base_url);
        let resp: OllamaGenerateResponse = self
            .post(prompt, mode, false)
            .await?
            .json()
            .await
            .map_err(|source| LlmError::Http { url, source })?;
        if resp.response.trim().is_empty() {
            return Err(LlmError::Empty);
        }
        Ok(resp.response)
    }

    /// Streams the reply chunk by chunk into `chunks`, returning the full
    /// text once the model signals completion.
    pub async fn stream(
        &self,
        prompt: &str,
        mode: PromptMode,
        chunks: mpsc::Sender<String>,
    ) -> Result<String, LlmError> {
        let url = format!("{}/api/generate", self.base_url);
        let mut body = std::pin::pin!(self.post(prompt, mode, true).await?.bytes_stream());
        let mut buffer: Vec<u8> = Vec::new();
        let mut full = String::new();

        'read: while let Some(bytes) = body.next().await {
            let bytes = bytes.map_err(|source| LlmError::Http {
                url: url.clone(),
                source,
            })?;
            buffer.extend_from_slice(&bytes);

            while let Some(pos) = buffer.iter().position(|b| *b == b'\n') {
                let line: Vec<u8> = buffer.drain(..=pos).collect();
                if let Some(done) = push_chunk(&line, &mut full, &chunks).await? {
                    if done {
                        break 'read;
                    }
                }
            }
        }
        if !buffer.is_empty() {
            push_chunk(&buffer, &mut full, &chunks).await?;
        }

        if full.trim().is_empty() {
            return Err(LlmError::Empty);
        }
        Ok(full)
    }

    pub async fn is_available(&self) -> bool {
        let url = format!("{}/api/tags", self.base_url);
        self.client.get(&url).send().await.is_ok()
    }
}

/// Parses one NDJSON line. Returns `None` for blank lines, otherwise whether
/// the model is done.
async fn push_chunk(
    line: &[u8],
    full: &mut String,
    chunks: &mpsc::Sender<String>,
) -> Result<Option<bool>, LlmError> {
    let line = String::from_utf8_lossy(line);
    let line = line.trim();
    if line.is_empty() {
        return Ok(None);
    }
    let chunk: OllamaGenerateResponse = serde_json::from_str(line)?;
    if !chunk.response.is_empty() {
        full.push_str(&chunk.response);
        // the reader may have gone away; the full text is still returned
        let _ = chunks.send(chunk.response).await;
    }
    Ok(Some(chunk.done))
}

impl LanguageModel for OllamaClient {
    async fn complete(&self, prompt: &str, mode: PromptMode) -> Result<String, LlmError> {
        self.generate(prompt, mode).await
    }
}

#[cfg(test)]
pub mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    /// Replays canned replies in order and records every prompt.
    pub struct ScriptedModel {
        replies: Mutex<VecDeque<String>>,
        prompts: Mutex<Vec<(String, PromptMode)>>,
    }

    impl ScriptedModel {
        pub fn new(replies: Vec<&str>) -> Self {
            Self {
                replies: Mutex::new(replies.into_iter().map(String::from).collect()),
                prompts: Mutex::new(Vec::new()),
            }
        }

        pub fn prompts(&self) -> Vec<(String, PromptMode)> {
            self.prompts.lock().unwrap().clone()
        }
    }

    impl LanguageModel for ScriptedModel {
        async fn complete(&self, prompt: &str, mode: PromptMode) -> Result<String, LlmError> {
            self.prompts.lock().unwrap().push((prompt.to_string(), mode));
            self.replies.lock().unwrap().pop_front().ok_or(LlmError::Empty)
        }
    }

    #[tokio::test]
    async fn test_push_chunk_parses_ndjson() {
        let (tx, mut rx) = mpsc::channel(4);
        let mut full = String::new();

        let done = push_chunk(br#"{"response":"kube","done":false}"#, &mut full, &tx)
            .await
            .unwrap();
        assert_eq!(done, Some(false));
        let done = push_chunk(b"{\"response\":\"ctl\",\"done\":true}\n", &mut full, &tx)
            .await
            .unwrap();
        assert_eq!(done, Some(true));
        assert_eq!(push_chunk(b"  \n", &mut full, &tx).await.unwrap(), None);

        assert_eq!(full, "kubectl");
        assert_eq!(rx.recv().await.as_deref(), Some("kube"));
        assert_eq!(rx.recv().await.as_deref(), Some("ctl"));
    }

    #[tokio::test]
    async fn test_push_chunk_rejects_garbage() {
        let (tx, _rx) = mpsc::channel(1);
        let mut full = String::new();
        assert!(matches!(
            push_chunk(b"not json", &mut full, &tx).await,
            Err(LlmError::Decode(_))
        ));
    }
}
