//! event_history - print recent decisions from the doorman event log

use anyhow::{anyhow, Result};
use clap::Parser;
use serde_json::json;
use std::sync::Arc;

use doorman::{now_ms, start_of_day_ms, EventLog, RetryPolicy, SqliteStore};

#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// Path to the doorman database.
    #[arg(long, env = "DOORMAN_DB_PATH", default_value = "doorman.db")]
    db_path: String,
    /// Number of newest events to print.
    #[arg(long, default_value_t = 20)]
    limit: usize,
    /// Verify the event hash chain before printing.
    #[arg(long)]
    verify_chain: bool,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();
    let args = Args::parse();

    if !args.db_path.starts_with("file:") && !std::path::Path::new(&args.db_path).exists() {
        return Err(anyhow!("database {} does not exist", args.db_path));
    }
    let store = Arc::new(SqliteStore::open(&args.db_path)?);

    if args.verify_chain {
        let checked = store.verify_chain()?;
        eprintln!("event chain OK ({} entries)", checked);
    }

    let log = EventLog::new(store, RetryPolicy::default());
    for event in log.recent(args.limit)? {
        println!("{}", serde_json::to_string(&event)?);
    }
    let today = log.stats_since(start_of_day_ms(now_ms()))?;
    println!("{}", json!({ "today": today }));
    Ok(())
}
