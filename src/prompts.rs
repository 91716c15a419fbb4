use crate::agent::ReActStep;
use crate::redact::redact;
use crate::safety::whitelist_description;
use crate::types::PromptMode;

const MAX_OBSERVATION_CHARS: usize = 2000;

const COMMAND_SYSTEM: &str = r#"You are a Kubernetes operator assistant. Translate the operator's request into exactly ONE kubectl or helm command.

RULES:
1. Output ONLY the command. No explanation, no markdown, no leading "$".
2. Prefer explicit namespaces (-n) over relying on the current one.
3. Never add --force, --grace-period=0 or --all unless the operator asked for it.
4. Do not add --dry-run yourself; the tool runs a dry run before anything real.
5. If the request cannot be done with kubectl or helm, output: echo "cannot do that with kubectl or helm""#;

const CHAT_SYSTEM: &str = "You are a Kubernetes and Helm expert helping an operator. Answer concisely. When you suggest commands, put each one on its own line.";

pub fn system_prompt(mode: PromptMode, max_steps: usize) -> String {
    match mode {
        PromptMode::Command => COMMAND_SYSTEM.to_string(),
        PromptMode::Chat => CHAT_SYSTEM.to_string(),
        PromptMode::Agent => format!(
            r#"You are investigating a Kubernetes cluster on behalf of an operator. You work in turns.

Each turn, output EXACTLY ONE of these lines and nothing else:
Action: <one read-only command>
Final: <your answer for the operator>

ALLOWED COMMANDS (anything else ends the investigation): {whitelist}
STEP BUDGET: at most {max_steps} actions in total.
No pipes, redirects, ";" or "&&". Give a Final answer as soon as you know enough."#,
            whitelist = whitelist_description(),
            max_steps = max_steps,
        ),
    }
}

fn with_banner(banner: Option<&str>, body: String) -> String {
    match banner {
        Some(banner) if !banner.is_empty() => format!("{}\n\n{}", banner, body),
        _ => body,
    }
}

pub fn command_prompt(request: &str, banner: Option<&str>) -> String {
    redact(&with_banner(banner, format!("REQUEST: {}", request)))
}

pub fn chat_prompt(question: &str, banner: Option<&str>) -> String {
    redact(&with_banner(banner, question.to_string()))
}

pub fn correction_prompt(command: &str, error_text: &str) -> String {
    redact(&format!(
        r#"This command failed:
{command}

Error output:
{error}

Reply with ONE corrected command only. If the failure cannot be fixed by changing the command, reply with the same command."#,
        command = command,
        error = truncate_chars(error_text.trim(), MAX_OBSERVATION_CHARS),
    ))
}

fn transcript(steps: &[ReActStep]) -> String {
    steps
        .iter()
        .map(|step| {
            let observation = match &step.error {
                Some(error) if step.observation.is_empty() => format!("ERROR: {}", error),
                Some(error) => format!("ERROR: {}\n{}", error, step.observation),
                None => step.observation.clone(),
            };
            format!(
                "Action: {}\nObservation:\n{}",
                step.action,
                truncate_chars(&observation, MAX_OBSERVATION_CHARS)
            )
        })
        .collect::<Vec<_>>()
        .join("\n\n")
}

pub fn agent_prompt(
    question: &str,
    banner: Option<&str>,
    steps: &[ReActStep],
    remaining: usize,
) -> String {
    let mut body = format!("QUESTION: {}\n", question);
    if !steps.is_empty() {
        body.push_str(&format!("\nSO FAR:\n{}\n", transcript(steps)));
    }
    body.push_str(&format!(
        "\nActions left: {}. Reply with one Action: or Final: line.",
        remaining
    ));
    redact(&with_banner(banner, body))
}

pub fn agent_wrap_up_prompt(question: &str, steps: &[ReActStep]) -> String {
    redact(&format!(
        "QUESTION: {}\n\nSO FAR:\n{}\n\nThe step budget is used up. Reply with a single Final: line summarising what you found.",
        question,
        transcript(steps)
    ))
}

/// Pulls a single command line out of a model reply, tolerating code fences
/// and a leading prompt sign.
pub fn extract_command(reply: &str) -> Option<String> {
    let reply = reply.trim();
    let body = match reply.find("```") {
        Some(start) => {
            let after = &reply[start + 3..];
            // skip the language tag
            let after = after.split_once('\n').map(|(_, rest)| rest).unwrap_or(after);
            after.split("```").next().unwrap_or(after)
        }
        None => reply,
    };

    body.lines()
        .map(str::trim)
        .find(|line| !line.is_empty() && !line.starts_with('#'))
        .map(|line| line.trim_start_matches("$ ").trim_matches('`').trim().to_string())
        .filter(|line| !line.is_empty())
}

fn truncate_chars(text: &str, max: usize) -> String {
    if text.chars().count() <= max {
        text.to_string()
    } else {
        let head: String = text.chars().take(max).collect();
        format!("{}\n... (truncated)", head)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_agent_prompt_states_whitelist_and_budget() {
        let prompt = system_prompt(PromptMode::Agent, 5);
        assert!(prompt.contains(&whitelist_description()));
        assert!(prompt.contains("at most 5 actions"));
        assert!(prompt.contains("Action:"));
        assert!(prompt.contains("Final:"));
    }

    #[test]
    fn test_extract_command_variants() {
        assert_eq!(
            extract_command("kubectl get pods -n web").as_deref(),
            Some("kubectl get pods -n web")
        );
        assert_eq!(
            extract_command("```bash\n$ kubectl get pods\n```\nThis lists pods.").as_deref(),
            Some("kubectl get pods")
        );
        assert_eq!(
            extract_command("`helm list -A`").as_deref(),
            Some("helm list -A")
        );
        assert_eq!(extract_command("   \n"), None);
    }

    #[test]
    fn test_prompts_are_redacted() {
        let prompt = correction_prompt(
            "helm install db ./c --set password=hunter2",
            "Error: token=abc123 rejected",
        );
        assert!(!prompt.contains("hunter2"));
        assert!(!prompt.contains("abc123"));
    }

    #[test]
    fn test_agent_prompt_includes_observations() {
        let steps = vec![ReActStep {
            action: "kubectl get pods".to_string(),
            observation: "api-1 CrashLoopBackOff".to_string(),
            allowed: true,
            error: None,
        }];
        let prompt = agent_prompt("why is api down?", Some("context: dev"), &steps, 4);
        assert!(prompt.starts_with("context: dev"));
        assert!(prompt.contains("api-1 CrashLoopBackOff"));
        assert!(prompt.contains("Actions left: 4"));
    }
}
