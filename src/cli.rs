//! Command-line interface
//!
//! Thin surface over the library: search a JSON record file, fetch through
//! the gateway, and manage the stored session.

use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

/// datagate CLI
#[derive(Parser, Debug)]
#[command(name = "datagate")]
#[command(about = "Deduplicating API client, session manager and fuzzy record search", long_about = None)]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Suppress non-error output
    #[arg(long, global = true)]
    pub quiet: bool,

    /// Config file (defaults to the user config directory)
    #[arg(long, global = true, env = "DATAGATE_CONFIG")]
    pub config: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Rank records from a JSON file against a query
    Search(SearchArgs),
    /// GET an API path through the deduplicating cache
    Fetch(FetchArgs),
    /// Inspect or change the stored session
    Session(SessionArgs),
}

#[derive(Args, Debug, Clone)]
pub struct SearchArgs {
    /// JSON file holding an array of records
    #[arg(short = 'f', long)]
    pub file: PathBuf,

    /// Fields to match, comma separated; dotted paths reach nested values
    #[arg(long, value_delimiter = ',', required = true)]
    pub fields: Vec<String>,

    /// Search terms (case-insensitive)
    #[arg(short = 'q', long)]
    pub query: String,

    /// Maximum number of results
    #[arg(short = 'l', long, default_value_t = 20)]
    pub limit: usize,

    /// API path for remote full-text search; its results take precedence
    #[arg(long)]
    pub remote: Option<String>,

    /// Print results as JSON instead of markdown
    #[arg(long)]
    pub json: bool,
}

#[derive(Args, Debug, Clone)]
pub struct FetchArgs {
    /// Path relative to the API base URL, or an absolute URL
    pub path: String,

    /// Query parameter, repeatable
    #[arg(short = 'p', long = "param", value_parser = parse_key_value)]
    pub params: Vec<(String, String)>,

    /// Issue the same request this many times concurrently
    #[arg(short = 'n', long, default_value_t = 1)]
    pub repeat: usize,

    /// Skip the cache (in-flight requests are still shared)
    #[arg(long)]
    pub fresh: bool,
}

#[derive(Args, Debug, Clone)]
pub struct SessionArgs {
    #[command(subcommand)]
    pub command: SessionCommands,
}

#[derive(Subcommand, Debug, Clone)]
pub enum SessionCommands {
    /// Show token expiry and cache state
    Status,
    /// Log in and store the session
    Login {
        #[arg(short = 'u', long)]
        username: String,

        /// Password (prompted when omitted)
        #[arg(short = 'p', long, env = "DATAGATE_PASSWORD", hide_env_values = true)]
        password: Option<String>,
    },
    /// Refresh the token if it is near expiry and load the user
    Refresh,
    /// Remove the stored session and cached responses
    Logout,
}

fn parse_key_value(raw: &str) -> Result<(String, String), String> {
    raw.split_once('=')
        .map(|(k, v)| (k.trim().to_string(), v.to_string()))
        .filter(|(k, _)| !k.is_empty())
        .ok_or_else(|| format!("expected key=value, got {:?}", raw))
}
