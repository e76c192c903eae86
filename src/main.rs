//! datagate CLI
//!
//! Commands:
//! - `search` - rank records from a JSON file, optionally merged with a remote search
//! - `fetch` - GET through the deduplicating, caching gateway
//! - `session` - status, login, refresh and logout of the stored session

mod cli;

use anyhow::{Context, Result};
use clap::Parser;
use cli::{Cli, Commands, FetchArgs, SearchArgs, SessionCommands};
use datagate::auth::Credentials;
use datagate::config::{load_config, RuntimeConfig};
use datagate::error::{validate_query, AppError};
use datagate::runtime::{self, Runtime};
use datagate::search::fuzzy::field_text;
use datagate::search::{highlight, Record, SearchCoordinator, SearchHit, SearchPhase};
use futures::future::join_all;
use std::io::{self, Write};
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging based on verbosity flags; RUST_LOG wins when set
    let log_level = if cli.quiet {
        "error"
    } else if cli.verbose {
        "debug"
    } else {
        "info"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr) // Log to stderr to keep stdout clean
        .init();

    let result = run(cli).await;
    runtime::shutdown();

    match result {
        Ok(output) => {
            if !output.is_empty() {
                println!("{}", output);
            }
            Ok(())
        }
        Err(e) => {
            eprintln!("Error: {:#}", e);
            std::process::exit(get_exit_code(&e));
        }
    }
}

async fn run(cli: Cli) -> Result<String> {
    let config = load_config(cli.config.as_deref())?;
    debug!("Loaded config: {:?}", config);

    match cli.command {
        Commands::Search(args) => execute_search(config, args).await,
        Commands::Fetch(args) => execute_fetch(config, args).await,
        Commands::Session(args) => execute_session(config, args.command).await,
    }
}

async fn execute_search(config: RuntimeConfig, args: SearchArgs) -> Result<String> {
    validate_query(&args.query)?;

    let data = std::fs::read_to_string(&args.file)
        .with_context(|| format!("Failed to read {}", args.file.display()))?;
    let records: Vec<Record> =
        serde_json::from_str(&data).context("Record file must hold a JSON array")?;
    info!("Searching {} records", records.len());

    let coordinator = match args.remote.as_deref() {
        Some(path) => {
            let runtime = runtime::init(Runtime::from_config(config)?);
            runtime.search_coordinator(records, args.fields.clone(), Some(path))
        }
        None => SearchCoordinator::new(records, args.fields.clone(), config.search.options()),
    };

    coordinator.set_query(&args.query);
    coordinator.wait_idle().await;
    let hits = coordinator.get_results();

    if args.json {
        let shown: Vec<&SearchHit> = hits.iter().take(args.limit).collect();
        return Ok(serde_json::to_string_pretty(&shown)?);
    }

    let mut out = format_hits(&args.query, &hits, args.limit);
    if coordinator.phase() == SearchPhase::RemoteFailed {
        out.push_str("\n_Remote search failed; showing local matches._\n");
    }
    Ok(out)
}

/// Markdown listing with matched characters in bold
fn format_hits(query: &str, hits: &[SearchHit], limit: usize) -> String {
    let mut out = format!("Found {} results for \"{}\"\n\n", hits.len(), query);
    for (i, hit) in hits.iter().take(limit).enumerate() {
        match &hit.match_info {
            Some(info) => {
                out.push_str(&format!("{}. score {:.1}\n", i + 1, info.score));
                for field in &info.fields {
                    let text = field_text(&hit.record, &field.field).unwrap_or_default();
                    out.push_str(&format!("   {}: {}\n", field.field, highlight(&text, &field.spans)));
                }
            }
            None => out.push_str(&format!("{}. {}\n", i + 1, hit.record)),
        }
    }
    if hits.len() > limit {
        out.push_str(&format!("\n... {} more\n", hits.len() - limit));
    }
    out
}

async fn execute_fetch(config: RuntimeConfig, args: FetchArgs) -> Result<String> {
    let runtime = runtime::init(Runtime::from_config(config)?);
    let params: Vec<(&str, &str)> = args
        .params
        .iter()
        .map(|(k, v)| (k.as_str(), v.as_str()))
        .collect();

    let calls = (0..args.repeat.max(1)).map(|_| runtime.fetch(&args.path, &params, args.fresh));
    let mut results = join_all(calls).await;
    let payload = results.swap_remove(0)?;

    let stats = runtime.stats();
    Ok(format!(
        "{}\n\nGateway: {} issued, {} shared, {} cache hits",
        serde_json::to_string_pretty(&payload)?,
        stats.invocations,
        stats.deduplicated,
        stats.hits
    ))
}

async fn execute_session(config: RuntimeConfig, command: SessionCommands) -> Result<String> {
    let runtime = runtime::init(Runtime::from_config(config)?);
    let auth = runtime.auth();

    match command {
        SessionCommands::Status => Ok(serde_json::to_string_pretty(&auth.status())?),
        SessionCommands::Login { username, password } => {
            let password = match password {
                Some(p) => p,
                None => prompt("Password: ")?,
            };
            let grant = runtime.login(&Credentials { username, password }).await?;
            Ok(format!("Logged in; token expires {}", grant.expires_at.to_rfc3339()))
        }
        SessionCommands::Refresh => {
            let user = auth.ensure_session().await?;
            Ok(serde_json::to_string_pretty(&user)?)
        }
        SessionCommands::Logout => {
            runtime.clear_all()?;
            Ok("Logged out".to_string())
        }
    }
}

fn prompt(label: &str) -> Result<String> {
    eprint!("{}", label);
    io::stderr().flush()?;
    let mut input = String::new();
    io::stdin().read_line(&mut input)?;
    Ok(input.trim_end_matches(['\r', '\n']).to_string())
}

/// Map errors to exit codes
fn get_exit_code(err: &anyhow::Error) -> i32 {
    match err.downcast_ref::<AppError>() {
        Some(AppError::ValidationError(_)) => 1,
        Some(AppError::Timeout(_)) => 4,
        Some(e) if e.is_network() => 2,
        Some(AppError::StorageError(_)) => 3,
        Some(_) => 5,
        None => {
            let err_str = err.to_string().to_lowercase();
            if err_str.contains("invalid") || err_str.contains("parse") {
                1
            } else {
                5
            }
        }
    }
}
