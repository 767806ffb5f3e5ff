use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, bail};
use serde::Serialize;
use tokio::io::AsyncReadExt;

use mail_dispatch::config::Settings;
use mail_dispatch::dispatch::Dispatcher;

const USAGE: &str = "\
usage: mail-dispatch <command> [args]

commands:
  admit [FILE]            parse a raw message (FILE or stdin) and queue it
  next                    claim the oldest pending command
  show ID                 print one command
  pending [LIMIT]         list pending commands (default 10)
  stats                   count commands per status
  complete ID [RESULT]    mark a claimed command completed
  fail ID [ERROR]         report a failed execution (requeue or fail)";

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    let _log_guard = init_tracing();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let Some(command) = args.first().map(String::as_str) else {
        eprintln!("{USAGE}");
        return Ok(ExitCode::from(2));
    };
    if matches!(command, "-h" | "--help" | "help") {
        println!("{USAGE}");
        return Ok(ExitCode::SUCCESS);
    }

    let (settings, dispatcher) = setup().await.context("Failed to start mail-dispatch")?;
    let queue = Arc::clone(dispatcher.queue());

    match (command, &args[1..]) {
        ("admit", rest) => {
            let raw = match rest.first() {
                Some(path) => tokio::fs::read(path)
                    .await
                    .with_context(|| format!("Failed to read {path}"))?,
                None => {
                    let mut buf = Vec::new();
                    tokio::io::stdin()
                        .read_to_end(&mut buf)
                        .await
                        .context("Failed to read message from stdin")?;
                    buf
                }
            };
            print_json(&dispatcher.admit(&raw).await?)?;
        }
        ("next", []) => print_json(&queue.dequeue().await?)?,
        ("show", [id]) => {
            let id = parse_id(id)?;
            match queue.get_by_id(id).await? {
                Some(cmd) => print_json(&cmd)?,
                None => bail!("No command with id {id}"),
            }
        }
        ("pending", rest) => {
            let limit = match rest.first() {
                Some(raw) => raw
                    .parse::<usize>()
                    .with_context(|| format!("Invalid limit: {raw}"))?,
                None => 10,
            };
            print_json(&queue.get_pending_commands(limit).await?)?;
        }
        ("stats", []) => print_json(&queue.get_stats().await?)?,
        ("complete", [id, rest @ ..]) => {
            let id = parse_id(id)?;
            let result = rest.join(" ");
            let updated = dispatcher.complete(id, &result).await?;
            print_json(&serde_json::json!({ "id": id, "updated": updated }))?;
        }
        ("fail", [id, rest @ ..]) => {
            let id = parse_id(id)?;
            let error = if rest.is_empty() {
                "execution failed".to_string()
            } else {
                rest.join(" ")
            };
            let outcome = dispatcher
                .fail(id, &error, settings.retry.max_retries)
                .await?;
            print_json(&outcome)?;
        }
        _ => {
            eprintln!("{USAGE}");
            return Ok(ExitCode::from(2));
        }
    }

    Ok(ExitCode::SUCCESS)
}

async fn setup() -> mail_dispatch::error::Result<(Settings, Dispatcher)> {
    let settings = Settings::from_env()?;
    let dispatcher = Dispatcher::open(&settings).await?;
    Ok((settings, dispatcher))
}

/// Log to stderr, or to a daily file under `MAIL_DISPATCH_LOG_DIR` when set.
fn init_tracing() -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    match std::env::var("MAIL_DISPATCH_LOG_DIR") {
        Ok(dir) if !dir.trim().is_empty() => {
            let appender = tracing_appender::rolling::daily(dir.trim(), "mail-dispatch.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_target(false)
                .with_ansi(false)
                .with_writer(writer)
                .init();
            Some(guard)
        }
        _ => {
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_target(false)
                .with_writer(std::io::stderr)
                .init();
            None
        }
    }
}

fn parse_id(raw: &str) -> anyhow::Result<i64> {
    raw.parse()
        .with_context(|| format!("Invalid command id: {raw}"))
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
