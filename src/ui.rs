use crate::agent::ReActStep;
use crate::executor::{truncate_output, OutputLine};
use crate::metrics::Metrics;
use crate::preview::{PreviewReport, StepOutcome};
use crate::types::{DangerLevel, ExecutionPlan, HistoryEntry};
use crossterm::{
    event::{self, Event, KeyCode, KeyModifiers},
    terminal,
};
use std::io::Write;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

pub fn print_plan(plan: &ExecutionPlan) {
    println!();
    println!("  {}", plan.original);
    println!("  risk: {}", plan.danger_level);

    for check in &plan.safety_checks {
        println!("  warning: {}", check);
    }
    for note in &plan.notes {
        println!("  note: {}", note);
    }

    if !plan.checks.is_empty() || !plan.first_run_is_real() {
        println!();
        println!("  preview:");
        for check in &plan.checks {
            println!("    {}: {}", check.name, check.command);
        }
        if !plan.first_run_is_real() {
            println!("    dry run: {}", plan.first_run_command);
        }
    }
}

fn print_step(step: &StepOutcome, max_lines: usize, show_output: bool) {
    let mark = if step.passed {
        "ok"
    } else if step.timed_out {
        "timed out"
    } else {
        "failed"
    };
    println!("  [{}] {}", mark, step.name);
    let output = step.output.trim();
    if show_output && !output.is_empty() {
        for line in truncate_output(output, max_lines).lines() {
            println!("    {}", line);
        }
    }
    if let Some(error) = &step.error {
        if !step.passed && output.is_empty() {
            println!("    {}", error);
        }
    }
}

/// Prints the preview steps. With `streamed` the first run's output was
/// already shown live and only its status is printed.
pub fn print_preview(report: &PreviewReport, max_lines: usize, streamed: bool) {
    if report.checks.is_empty() && report.first_run.is_none() {
        return;
    }
    println!();
    for check in &report.checks {
        print_step(check, max_lines, true);
    }
    if let Some(run) = &report.first_run {
        print_step(run, max_lines, !streamed);
    }
    let failed = report.failed_checks().count();
    if failed > 0 {
        println!("  {} preview check(s) failed, review before confirming", failed);
    }
}

/// Asks for a single key: enter or `y` confirms, anything that means no
/// cancels.
pub fn prompt_confirm(level: DangerLevel) -> bool {
    eprint!("{} risk. [enter]run [n]cancel ", level);
    std::io::stderr().flush().ok();
    if terminal::enable_raw_mode().is_err() {
        return false;
    }
    let result = loop {
        match event::poll(std::time::Duration::from_millis(100)) {
            Ok(true) => {}
            Ok(false) => continue,
            Err(_) => break false,
        }
        match event::read() {
            Ok(Event::Key(k)) => match k.code {
                KeyCode::Enter | KeyCode::Char('y') => break true,
                KeyCode::Char('c') if k.modifiers.contains(KeyModifiers::CONTROL) => break false,
                KeyCode::Char('q') | KeyCode::Char('n') | KeyCode::Esc => break false,
                _ => {}
            },
            Ok(_) => {}
            Err(_) => break false,
        }
    };
    terminal::disable_raw_mode().ok();
    eprintln!();
    result
}

/// Reads one line of typed confirmation. `None` on end of input.
pub fn prompt_typed(literal: &str) -> Option<String> {
    eprint!("type '{}' to run, anything else to retry, ctrl-d to cancel: ", literal);
    std::io::stderr().flush().ok();
    let mut input = String::new();
    match std::io::stdin().read_line(&mut input) {
        Ok(0) | Err(_) => None,
        Ok(_) => Some(input),
    }
}

/// Prints command output as it streams in, up to `max_lines` lines.
pub fn spawn_output_printer(max_lines: usize) -> (mpsc::Sender<OutputLine>, JoinHandle<()>) {
    let (tx, mut rx) = mpsc::channel::<OutputLine>(64);
    let handle = tokio::spawn(async move {
        let mut printed = 0;
        let mut hidden = 0;
        while let Some(line) = rx.recv().await {
            if printed >= max_lines {
                hidden += 1;
                continue;
            }
            printed += 1;
            match line {
                OutputLine::Stdout(text) => println!("{}", text),
                OutputLine::Stderr(text) => eprintln!("{}", text),
            }
        }
        if hidden > 0 {
            println!("... ({} more lines)", hidden);
        }
    });
    (tx, handle)
}

pub fn print_agent_step(step: &ReActStep, max_lines: usize) {
    if !step.allowed {
        println!("  refused: {} (not a read-only command)", step.action);
        return;
    }
    println!("  $ {}", step.action);
    if let Some(error) = &step.error {
        println!("    error: {}", error.lines().next().unwrap_or(""));
    }
    let observation = step.observation.trim();
    if !observation.is_empty() {
        for line in truncate_output(observation, max_lines).lines() {
            println!("    {}", line);
        }
    }
}

pub fn print_history(entries: &[HistoryEntry]) {
    println!("recent commands:");
    println!();
    for entry in entries {
        let status = if entry.executed {
            if entry.succeeded {
                "+"
            } else {
                "x"
            }
        } else {
            "-"
        };
        println!("{} [{}] {}", status, entry.danger_level, entry.command);
        if entry.request != entry.command {
            println!("    {}", entry.request);
        }
    }
}

pub fn print_metrics(metrics: &Metrics) {
    eprintln!();
    eprintln!("session stats:");
    eprintln!("{}", metrics);
}
