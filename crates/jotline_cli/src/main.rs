//! CLI entry point.
//!
//! # Responsibility
//! - Provide a small executable over `jotline_core` for local sanity checks.
//! - Drive the same task and journal use-cases the app uses, against a live
//!   sync server.

use clap::{Parser, Subcommand};
use jotline_core::config::ENV_API_BASE_URL;
use jotline_core::{
    init_logging, AppConfig, JournalService, LiveRow, RecordKey, RecordPhase, SyncContext, Task,
    TaskService,
};
use std::error::Error;
use std::process::ExitCode;
use std::time::Duration;

const SYNC_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Parser)]
#[command(name = "jotline", version, about = "Jotline task and journal client")]
struct Cli {
    /// Sync server base URL; overrides JOTLINE_API_BASE_URL.
    #[arg(long, global = true)]
    api_base_url: Option<String>,

    /// Write rolling logs to this directory.
    #[arg(long, global = true)]
    log_dir: Option<String>,

    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Print core linkage info.
    Ping,
    /// List tasks.
    Tasks,
    /// Add a task.
    AddTask { text: String },
    /// Flip a task between open and done.
    ToggleTask { key: String },
    /// Delete a task.
    RemoveTask { key: String },
    /// List journal entries, newest first.
    Entries,
    /// Create a journal entry.
    AddEntry { title: String },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("error: {err}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<(), Box<dyn Error>> {
    if let Command::Ping = cli.command {
        println!("jotline_core ping={}", jotline_core::ping());
        println!("jotline_core version={}", jotline_core::core_version());
        return Ok(());
    }
    if let Some(log_dir) = cli.log_dir.as_deref() {
        init_logging(&cli.log_level, log_dir)?;
    }

    let override_url = cli.api_base_url.clone();
    let config = AppConfig::from_lookup(|name| {
        if name == ENV_API_BASE_URL && override_url.is_some() {
            return override_url.clone();
        }
        std::env::var(name).ok()
    })?;
    let save = config.save;
    let context = SyncContext::new(config);
    context.start_sync()?;
    tokio::time::timeout(SYNC_TIMEOUT, context.wait_until_up_to_date())
        .await
        .map_err(|_| "timed out waiting for the initial sync")?;

    let tasks = TaskService::new(context.tasks().clone());
    let journal = JournalService::new(context.entries().clone(), save);

    let ticket = match cli.command {
        Command::Ping => None,
        Command::Tasks => {
            tasks.list().iter().for_each(print_task);
            None
        }
        Command::Entries => {
            for row in journal.list() {
                println!(
                    "{:>10}  {}  {}{}",
                    row.key.to_string(),
                    row.updated_at.format("%Y-%m-%d %H:%M"),
                    row.value.title,
                    phase_suffix(row.phase)
                );
            }
            None
        }
        Command::AddTask { text } => Some(tasks.add(&text)?),
        Command::ToggleTask { key } => Some(tasks.toggle(RecordKey::parse(&key)?)?),
        Command::RemoveTask { key } => Some(tasks.remove(RecordKey::parse(&key)?)?),
        Command::AddEntry { title } => Some(journal.create(&title)?),
    };

    if let Some(ticket) = ticket {
        let receipt = ticket.confirmed().await?;
        match receipt.txid {
            Some(txid) => println!("ok key={} txid={txid}", receipt.key),
            None => println!("ok key={}", receipt.key),
        }
    }
    context.shutdown().await;
    Ok(())
}

fn print_task(row: &LiveRow<Task>) {
    let mark = if row.value.completed { "x" } else { " " };
    println!(
        "{:>10}  [{mark}] {}{}",
        row.key.to_string(),
        row.value.text,
        phase_suffix(row.phase)
    );
}

fn phase_suffix(phase: RecordPhase) -> &'static str {
    match phase {
        RecordPhase::PendingCreate => "  (saving)",
        RecordPhase::Synced => "",
        RecordPhase::PendingDelete => "  (deleting)",
    }
}
