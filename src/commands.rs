use crate::agent::{investigate, AgentOutcome, AgentSettings};
use crate::config::{get_config_path, save_config, Config};
use crate::confirm::AbandonReason;
use crate::context::cluster_banner;
use crate::correction::{request_correction, CorrectionDecision};
use crate::db::{get_db_path, get_recent_history, init_db, open_history, save_history};
use crate::executor::{CommandRunner, ShellRunner};
use crate::metrics::Metrics;
use crate::ollama::OllamaClient;
use crate::planner::build_plan;
use crate::prompts::{chat_prompt, command_prompt, extract_command};
use crate::session::{ConfirmOutcome, Execution, Next, Session};
use crate::types::{ExecutionPlan, HistoryEntry, PromptMode};
use crate::ui::{
    print_agent_step, print_history, print_metrics, print_plan, print_preview, prompt_confirm,
    prompt_typed, spawn_output_printer,
};
use anyhow::{bail, Context, Result};
use rusqlite::Connection;
use std::io::Write;
use std::time::Duration;
use std::{env, fs, process::Command};
use tokio::sync::mpsc;
use tracing::{info, warn};

const CHECK_TIMEOUT: Duration = Duration::from_secs(5);

async fn connect(config: &Config) -> Result<OllamaClient> {
    let client = OllamaClient::new(&config.llm, config.safety.agent_max_steps);
    if !client.is_available().await {
        eprintln!("error: cannot connect to ollama");
        eprintln!("  start it with: ollama serve");
        bail!("model endpoint {} not available", config.llm.endpoint);
    }
    Ok(client)
}

fn history(config: &Config) -> Option<Connection> {
    if !config.behavior.record_history {
        return None;
    }
    match open_history() {
        Ok(conn) => Some(conn),
        Err(e) => {
            warn!("history disabled: {:#}", e);
            None
        }
    }
}

fn record(
    conn: Option<&Connection>,
    request: &str,
    plan: &ExecutionPlan,
    execution: Option<&Execution>,
) {
    let Some(conn) = conn else {
        return;
    };
    let entry = HistoryEntry {
        request: request.to_string(),
        command: plan.original.clone(),
        danger_level: plan.danger_level,
        executed: execution.is_some(),
        succeeded: execution.is_some_and(|e| e.succeeded),
    };
    let sample = execution.map(|e| e.output.as_str()).unwrap_or("");
    if let Err(e) = save_history(conn, &entry, sample) {
        warn!("could not record history: {:#}", e);
    }
}

fn report_metrics(metrics: &Metrics, stats: bool) {
    info!(?metrics, "session metrics");
    if stats {
        print_metrics(metrics);
    }
}

/// Walks one command through its plan and the operator's confirmation.
/// Returns the execution if the command actually ran.
async fn walk(
    session: &mut Session<ShellRunner>,
    command: &str,
    config: &Config,
) -> Result<(ExecutionPlan, Option<Execution>)> {
    let max_lines = config.safety.max_output_lines;
    let plan = build_plan(command);
    print_plan(&plan);
    let streamed = plan.first_run_is_real();
    let (tx, printer) = spawn_output_printer(max_lines);
    let submission = session.submit(command, Some(tx)).await?;
    printer.await?;
    if let Some(old) = &submission.superseded {
        println!("  dropped pending: {}", old);
    }
    print_preview(&submission.report, max_lines, streamed);

    let outcome = match submission.next {
        Next::Executed(execution) => return Ok((submission.plan, Some(execution))),
        Next::Abandoned(reason) => {
            if reason == AbandonReason::DryRunFailed {
                println!();
                println!("  dry run failed; nothing was changed.");
            }
            return Ok((submission.plan, None));
        }
        Next::AwaitSecondConfirm => {
            let level = submission.plan.danger_level;
            println!();
            if !tokio::task::spawn_blocking(move || prompt_confirm(level)).await? {
                session.cancel();
                println!("cancelled.");
                return Ok((submission.plan, None));
            }
            let (tx, printer) = spawn_output_printer(max_lines);
            let outcome = session.confirm(Some(tx)).await?;
            printer.await?;
            outcome
        }
        Next::AwaitTypedConfirm { mut literal } => {
            println!();
            println!("  {} risk: this cannot be undone.", submission.plan.danger_level);
            loop {
                let prompt_literal = literal.clone();
                let Some(input) =
                    tokio::task::spawn_blocking(move || prompt_typed(&prompt_literal)).await?
                else {
                    session.cancel();
                    println!("cancelled.");
                    return Ok((submission.plan, None));
                };
                let (tx, printer) = spawn_output_printer(max_lines);
                let outcome = session.confirm_typed(&input, Some(tx)).await?;
                printer.await?;
                match outcome {
                    ConfirmOutcome::Reprompt { literal: expected } => {
                        eprintln!("confirmation did not match.");
                        literal = expected;
                    }
                    executed => break executed,
                }
            }
        }
    };

    match outcome {
        ConfirmOutcome::Executed(execution) => {
            if let Some(error) = execution.error.as_ref().filter(|_| !execution.succeeded) {
                println!("failed: {}", error);
            }
            Ok((submission.plan, Some(execution)))
        }
        ConfirmOutcome::Reprompt { .. } => Ok((submission.plan, None)),
    }
}

/// Runs a command and, while it keeps failing, asks the model for a fixed
/// one. Every suggestion is planned and confirmed from scratch.
async fn drive(
    session: &mut Session<ShellRunner>,
    llm: Option<&OllamaClient>,
    request: &str,
    command: String,
    config: &Config,
) -> Result<()> {
    let conn = history(config);
    let mut command = command;
    session.begin_request();

    loop {
        let (plan, execution) = walk(session, &command, config).await?;
        record(conn.as_ref(), request, &plan, execution.as_ref());

        let Some(execution) = execution else {
            return Ok(());
        };
        match execution.correction {
            CorrectionDecision::NotNeeded => return Ok(()),
            CorrectionDecision::GiveUp { attempts } => {
                println!("giving up after {} corrections.", attempts);
                return Ok(());
            }
            CorrectionDecision::Request(prompt) => {
                let Some(llm) = llm else {
                    return Ok(());
                };
                eprint!("asking for a fix...");
                std::io::stderr().flush().ok();
                let fixed = request_correction(llm, &prompt)
                    .await
                    .context("asking the model for a corrected command")?;
                eprint!("\r                  \r");
                match fixed {
                    Some(fixed) if fixed != command => {
                        println!("suggested fix: {}", fixed);
                        command = fixed;
                    }
                    _ => {
                        println!("no different command suggested.");
                        return Ok(());
                    }
                }
            }
        }
    }
}

pub async fn cmd_query(request: &str, config: &Config, explain: bool, stats: bool) -> Result<()> {
    let client = connect(config).await?;
    let runner = ShellRunner::default();
    let banner = cluster_banner(&runner, config.safety.preview_timeout()).await;

    eprint!("thinking...");
    std::io::stderr().flush().ok();
    let reply = client
        .generate(&command_prompt(request, banner.as_deref()), PromptMode::Command)
        .await
        .context("asking the model for a command")?;
    eprint!("\r           \r");

    let Some(command) = extract_command(&reply) else {
        println!("could not come up with a command for this request.");
        return Ok(());
    };

    if explain {
        print_plan(&build_plan(&command));
        return Ok(());
    }

    let mut session = Session::new(runner, &config.safety);
    let result = drive(&mut session, Some(&client), request, command, config).await;
    report_metrics(session.metrics(), stats);
    result
}

pub async fn cmd_run(command: &str, config: &Config, stats: bool) -> Result<()> {
    let client = OllamaClient::new(&config.llm, config.safety.agent_max_steps);
    let llm = client.is_available().await.then_some(&client);
    if llm.is_none() {
        info!("model endpoint unavailable, self-correction disabled");
    }

    let mut session = Session::new(ShellRunner::default(), &config.safety);
    let result = drive(&mut session, llm, command, command.to_string(), config).await;
    report_metrics(session.metrics(), stats);
    result
}

pub fn cmd_plan(command: &str) -> Result<()> {
    let plan = build_plan(command);
    print_plan(&plan);
    println!();
    if plan.require_typed_confirm {
        println!("  needs typed confirmation");
    } else if plan.require_second_confirm {
        println!("  needs confirmation");
    } else {
        println!("  runs without confirmation");
    }
    Ok(())
}

pub async fn cmd_agent(question: &str, config: &Config, stats: bool) -> Result<()> {
    let client = connect(config).await?;
    let runner = ShellRunner::default();
    let banner = cluster_banner(&runner, config.safety.preview_timeout()).await;
    let settings = AgentSettings {
        max_steps: config.safety.agent_max_steps,
        step_timeout: config.safety.agent_step_timeout(),
        banner: banner.as_deref(),
    };
    let max_lines = config.safety.max_output_lines;
    let mut metrics = Metrics::default();

    println!("investigating (at most {} steps)...", settings.max_steps);
    let outcome = investigate(&client, &runner, question, &settings, &mut metrics, |step| {
        print_agent_step(step, max_lines)
    })
    .await
    .context("agent investigation")?;

    println!();
    match outcome {
        AgentOutcome::Answered { answer, .. } => println!("{}", answer),
        AgentOutcome::Blocked { action, .. } => {
            println!("stopped: the model asked to run `{}`, which is not read-only.", action);
            println!("  review it yourself with: kpls plan {}", action);
        }
        AgentOutcome::Exhausted { steps } => {
            println!(
                "no conclusion after {} steps; the observations above are all there is.",
                steps.len()
            );
        }
        AgentOutcome::Malformed { .. } => {
            println!("stopped: the model kept replying without an Action: or Final: line.");
        }
    }

    report_metrics(&metrics, stats);
    Ok(())
}

pub async fn cmd_chat(question: &str, config: &Config) -> Result<()> {
    let client = connect(config).await?;
    let runner = ShellRunner::default();
    let banner = cluster_banner(&runner, config.safety.preview_timeout()).await;
    let prompt = chat_prompt(question, banner.as_deref());

    if !config.llm.stream {
        let answer = client.generate(&prompt, PromptMode::Chat).await?;
        println!("{}", answer.trim());
        return Ok(());
    }

    let (tx, mut rx) = mpsc::channel::<String>(64);
    let printer = tokio::spawn(async move {
        let mut stdout = std::io::stdout();
        while let Some(chunk) = rx.recv().await {
            print!("{}", chunk);
            stdout.flush().ok();
        }
    });
    let result = client.stream(&prompt, PromptMode::Chat, tx).await;
    printer.await?;
    println!();
    result.context("streaming the answer")?;
    Ok(())
}

pub fn cmd_history(config: &Config) -> Result<()> {
    let db_path = get_db_path();
    if !db_path.exists() {
        println!("no history yet.");
        return Ok(());
    }

    let conn = Connection::open(&db_path)?;
    init_db(&conn)?;
    let entries = get_recent_history(&conn, config.behavior.history_window)?;
    if entries.is_empty() {
        println!("no history yet.");
        return Ok(());
    }
    print_history(&entries);
    Ok(())
}

async fn check_tool(runner: &ShellRunner, label: &str, command: &str, hint: &str) {
    print!("  {} ... ", label);
    std::io::stdout().flush().ok();
    match runner.run(command, CHECK_TIMEOUT, None).await {
        Ok(output) => println!("ok ({})", output.stdout.lines().next().unwrap_or("").trim()),
        Err(e) => {
            println!("failed");
            println!("    error: {}", e);
            println!("    try: {}", hint);
        }
    }
}

pub async fn cmd_doctor(config: &Config) -> Result<()> {
    println!("diagnostics:");
    println!();

    let client = OllamaClient::new(&config.llm, config.safety.agent_max_steps);

    print!("  ollama ... ");
    std::io::stdout().flush().ok();
    let available = client.is_available().await;
    if available {
        println!("ok");
    } else {
        println!("failed");
        println!("    url: {}", config.llm.endpoint);
        println!("    try: ollama serve");
    }

    if available {
        print!("  model ({}) ... ", config.llm.model);
        std::io::stdout().flush().ok();
        match client.generate("Say 'ok' and nothing else.", PromptMode::Chat).await {
            Ok(_) => println!("ok"),
            Err(e) => {
                println!("failed");
                println!("    error: {}", e);
                println!("    try: ollama pull {}", config.llm.model);
            }
        }
    }

    let runner = ShellRunner::default();
    check_tool(&runner, "kubectl", "kubectl version --client", "install kubectl").await;
    check_tool(&runner, "helm", "helm version --short", "install helm").await;

    print!("  cluster ... ");
    std::io::stdout().flush().ok();
    match cluster_banner(&runner, CHECK_TIMEOUT).await {
        Some(banner) => println!("ok ({})", banner),
        None => println!("no current context"),
    }

    let config_path = get_config_path();
    print!("  config ... ");
    std::io::stdout().flush().ok();
    if config_path.exists() {
        println!("ok");
    } else {
        println!("using defaults");
    }

    println!();
    Ok(())
}

pub fn cmd_config() -> Result<()> {
    let config_path = get_config_path();

    if !config_path.exists() {
        if let Some(parent) = config_path.parent() {
            fs::create_dir_all(parent)?;
        }
        save_config(&Config::default())?;
    }

    let editor = env::var("EDITOR").unwrap_or_else(|_| "vi".to_string());
    Command::new(&editor)
        .arg(&config_path)
        .status()
        .with_context(|| format!("launching {}", editor))?;

    Ok(())
}
