//! CLI argument definitions for flowlens.
//!
//! # Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `get` | Issue one request against an upstream endpoint |
//! | `analyze` | Run the analysis pipeline for one or more tickers |
//! | `refresh` | Refresh stock info snapshots for a watchlist |
//!
//! # Global Options
//!
//! | Option | Default | Description |
//! |--------|---------|-------------|
//! | `--config` | none | JSON config file, environment still overrides it |
//! | `--pretty` | `false` | Pretty-print JSON output |
//!
//! # Examples
//!
//! ```bash
//! flowlens get /api/market/overview
//! flowlens get /api/earnings/calendar --param limit=10 --bypass-cache
//! flowlens analyze AAPL MSFT NVDA --max-concurrent 2 --pretty
//! flowlens refresh AAPL TSLA
//! ```

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

/// Rate-limited client and analysis runner for the Unusual Whales API.
///
/// Results are printed to stdout as JSON; logs go to stderr (filter with `RUST_LOG`).
#[derive(Debug, Parser)]
#[command(name = "flowlens", author, version, about = "Unusual Whales API client and ticker analysis runner")]
pub struct Cli {
    /// Path to a JSON configuration file.
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Pretty-print JSON output with indentation.
    #[arg(long, global = true, default_value_t = false)]
    pub pretty: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Issue a single GET request and print the classified result.
    ///
    /// # Examples
    ///
    ///   flowlens get /api/stock/AAPL/info
    ///   flowlens get /api/stock/AAPL/options-flow --param limit=20
    Get(GetArgs),

    /// Run the analysis pipeline for one or more tickers.
    ///
    /// # Examples
    ///
    ///   flowlens analyze AAPL
    ///   flowlens analyze AAPL MSFT GOOGL --max-concurrent 2
    Analyze(AnalyzeArgs),

    /// Refresh stock info snapshots for a watchlist.
    Refresh(RefreshArgs),
}

#[derive(Debug, Args)]
pub struct GetArgs {
    /// Endpoint path, e.g. /api/market/overview.
    pub endpoint: String,

    /// Query parameter as name=value. Repeatable.
    #[arg(long = "param", value_name = "NAME=VALUE", value_parser = parse_param)]
    pub params: Vec<(String, String)>,

    /// Neither read from nor write to the response cache.
    #[arg(long, default_value_t = false)]
    pub bypass_cache: bool,
}

#[derive(Debug, Args)]
pub struct AnalyzeArgs {
    /// One or more tickers (e.g., AAPL, MSFT, BRK.B).
    #[arg(required = true, num_args = 1..)]
    pub tickers: Vec<String>,

    /// Maximum pipelines running at once; defaults to the configured batch limit.
    #[arg(long)]
    pub max_concurrent: Option<usize>,

    /// Ignore cached responses and store fresh ones.
    #[arg(long, default_value_t = false)]
    pub force_refresh: bool,
}

#[derive(Debug, Args)]
pub struct RefreshArgs {
    /// Watchlist tickers; only the first `batch.refresh_limit` are refreshed.
    #[arg(required = true, num_args = 1..)]
    pub tickers: Vec<String>,
}

fn parse_param(raw: &str) -> Result<(String, String), String> {
    let (name, value) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected NAME=VALUE, got '{raw}'"))?;
    let name = name.trim();
    if name.is_empty() {
        return Err(format!("parameter name is empty in '{raw}'"));
    }
    Ok((name.to_owned(), value.to_owned()))
}
