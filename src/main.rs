mod agent;
mod commands;
mod config;
mod confirm;
mod context;
mod correction;
mod db;
mod executor;
mod metrics;
mod ollama;
mod planner;
mod preview;
mod prompts;
mod redact;
mod safety;
mod session;
mod types;
mod ui;

use commands::{
    cmd_agent, cmd_chat, cmd_config, cmd_doctor, cmd_history, cmd_plan, cmd_query, cmd_run,
};
use config::load_config;
use std::env;
use tracing_subscriber::EnvFilter;

fn print_usage() {
    eprintln!("usage: kpls [--explain] [--stats] [--] <request>");
    eprintln!("       kpls run [--stats] [--] <command>");
    eprintln!("       kpls plan <command>");
    eprintln!("       kpls agent [--stats] <question>");
    eprintln!("       kpls chat <question>");
    eprintln!("       kpls history | doctor | config");
}

fn init_logging() {
    let filter = EnvFilter::try_from_env("KPLS_LOG").unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

struct Args {
    explain: bool,
    stats: bool,
    text: String,
}

/// Reads kpls options off the front of `args`. Everything from the first
/// other word (or after `--`) is the request, passed through untouched.
fn parse_rest(args: &[String]) -> Args {
    let mut parsed = Args {
        explain: false,
        stats: false,
        text: String::new(),
    };
    let mut rest = args.iter();
    let mut parts = Vec::new();
    for a in rest.by_ref() {
        match a.as_str() {
            "-e" | "--explain" => parsed.explain = true,
            "-s" | "--stats" => parsed.stats = true,
            "--" => break,
            _ => {
                parts.push(a.as_str());
                break;
            }
        }
    }
    parts.extend(rest.map(String::as_str));
    parsed.text = parts.join(" ");
    parsed
}

#[tokio::main]
async fn main() {
    init_logging();
    let args: Vec<String> = env::args().collect();
    let config = load_config();

    if args.len() < 2 {
        print_usage();
        return;
    }

    let rest = parse_rest(&args[2..]);
    let result = match args[1].as_str() {
        "run" | "plan" | "agent" | "chat" if rest.text.is_empty() => {
            print_usage();
            Ok(())
        }
        "run" => cmd_run(&rest.text, &config, rest.stats).await,
        "plan" => cmd_plan(&rest.text),
        "agent" => cmd_agent(&rest.text, &config, rest.stats).await,
        "chat" => cmd_chat(&rest.text, &config).await,
        "history" => cmd_history(&config),
        "doctor" => cmd_doctor(&config).await,
        "config" => cmd_config(),
        "-h" | "--help" | "help" => {
            print_usage();
            Ok(())
        }
        _ => {
            let query = parse_rest(&args[1..]);
            if query.text.is_empty() {
                print_usage();
                Ok(())
            } else {
                cmd_query(&query.text, &config, query.explain, query.stats).await
            }
        }
    };

    if let Err(e) = result {
        eprintln!("kpls: {:#}", e);
        std::process::exit(1);
    }
}
