use std::future::Future;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, warn};

// How long readers may keep draining pipes once the deadline has passed.
const DRAIN_GRACE: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutputLine {
    Stdout(String),
    Stderr(String),
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn combined(&self) -> String {
        let mut combined = self.stdout.trim_end().to_string();
        let stderr = self.stderr.trim_end();
        if !stderr.is_empty() {
            if !combined.is_empty() {
                combined.push('\n');
            }
            combined.push_str(stderr);
        }
        combined
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ExecError {
    #[error("could not start `{command}`: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },
    #[error("`{command}` exited with status {code}")]
    NonZeroExit {
        command: String,
        code: i32,
        output: CommandOutput,
    },
    #[error("`{command}` timed out after {}s", .timeout.as_secs_f32())]
    TimedOut {
        command: String,
        timeout: Duration,
        output: CommandOutput,
    },
    #[error("lost track of `{command}`: {source}")]
    Io {
        command: String,
        #[source]
        source: std::io::Error,
    },
}

impl ExecError {
    pub fn output(&self) -> Option<&CommandOutput> {
        match self {
            ExecError::NonZeroExit { output, .. } | ExecError::TimedOut { output, .. } => {
                Some(output)
            }
            ExecError::Spawn { .. } | ExecError::Io { .. } => None,
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, ExecError::TimedOut { .. })
    }
}

/// Executes shell command strings. Implemented by [`ShellRunner`] and by
/// scripted runners in tests.
pub trait CommandRunner {
    fn run(
        &self,
        command: &str,
        timeout: Duration,
        updates: Option<mpsc::Sender<OutputLine>>,
    ) -> impl Future<Output = Result<CommandOutput, ExecError>> + Send;
}

#[derive(Debug, Clone)]
pub struct ShellRunner {
    shell: String,
}

impl Default for ShellRunner {
    fn default() -> Self {
        Self {
            shell: "sh".to_string(),
        }
    }
}

impl ShellRunner {
    #[cfg(test)]
    pub fn with_shell(shell: impl Into<String>) -> Self {
        Self {
            shell: shell.into(),
        }
    }
}

impl CommandRunner for ShellRunner {
    async fn run(
        &self,
        command: &str,
        timeout: Duration,
        updates: Option<mpsc::Sender<OutputLine>>,
    ) -> Result<CommandOutput, ExecError> {
        debug!(command, timeout_ms = timeout.as_millis() as u64, "spawning");
        let deadline = Instant::now() + timeout;

        let mut child = Command::new(&self.shell)
            .arg("-c")
            .arg(command)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| ExecError::Spawn {
                command: command.to_string(),
                source,
            })?;

        let stdout = child
            .stdout
            .take()
            .map(|s| tokio::spawn(collect_lines(s, updates.clone(), OutputLine::Stdout)));
        let stderr = child
            .stderr
            .take()
            .map(|s| tokio::spawn(collect_lines(s, updates, OutputLine::Stderr)));

        let status = match tokio::time::timeout_at(deadline, child.wait()).await {
            Ok(Ok(status)) => Some(status),
            Ok(Err(source)) => {
                return Err(ExecError::Io {
                    command: command.to_string(),
                    source,
                })
            }
            Err(_) => {
                warn!(command, "deadline reached, killing process");
                if let Err(e) = child.kill().await {
                    warn!(command, "kill failed: {}", e);
                }
                None
            }
        };

        let output = CommandOutput {
            stdout: drain(stdout, deadline.max(Instant::now()) + DRAIN_GRACE).await,
            stderr: drain(stderr, deadline.max(Instant::now()) + DRAIN_GRACE).await,
        };

        match status {
            None => Err(ExecError::TimedOut {
                command: command.to_string(),
                timeout,
                output,
            }),
            Some(status) if status.success() => {
                debug!(command, "finished");
                Ok(output)
            }
            Some(status) => Err(ExecError::NonZeroExit {
                command: command.to_string(),
                code: status.code().unwrap_or(-1),
                output,
            }),
        }
    }
}

async fn collect_lines<R: AsyncRead + Unpin>(
    reader: R,
    updates: Option<mpsc::Sender<OutputLine>>,
    wrap: fn(String) -> OutputLine,
) -> String {
    let mut lines = BufReader::new(reader).lines();
    let mut collected = String::new();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                collected.push_str(&line);
                collected.push('\n');
                if let Some(tx) = &updates {
                    // a closed receiver only stops the live view
                    let _ = tx.send(wrap(line)).await;
                }
            }
            Ok(None) => break,
            Err(e) => {
                warn!("stopped reading output: {}", e);
                break;
            }
        }
    }
    collected
}

async fn drain(task: Option<JoinHandle<String>>, until: Instant) -> String {
    let Some(mut task) = task else {
        return String::new();
    };
    match tokio::time::timeout_at(until, &mut task).await {
        Ok(Ok(text)) => text,
        Ok(Err(e)) => {
            warn!("output reader failed: {}", e);
            String::new()
        }
        Err(_) => {
            // a backgrounded grandchild still holds the pipe open
            task.abort();
            String::new()
        }
    }
}

pub fn truncate_output(output: &str, max_lines: usize) -> String {
    let lines: Vec<&str> = output.lines().collect();
    if lines.len() <= max_lines || max_lines < 2 {
        return lines.join("\n");
    }
    let mut truncated: Vec<String> = lines[..max_lines / 2].iter().map(|l| l.to_string()).collect();
    truncated.push(format!(
        "... [{} lines truncated] ...",
        lines.len() - max_lines
    ));
    truncated.extend(lines[lines.len() - max_lines / 2..].iter().map(|l| l.to_string()));
    truncated.join("\n")
}
