use chrono::Utc;
use clap::{Args, Parser, Subcommand};
use eyre::{Result, WrapErr};
use serde::Serialize;
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use degenscore::{
    cache::{DEFAULT_MAX_ENTRIES, DEFAULT_SWEEP_INTERVAL, DEFAULT_TTL},
    config::Config,
    explorer::{BASE_CHAIN_ID, DEFAULT_API_URL},
    Address, Analyzer, AnalyzerConfig, ExplorerClient, ExplorerConfig, PartialFailurePolicy,
    ScoreResult, TtlCache,
};

#[derive(Parser)]
#[command(
    name = "degenscore",
    version,
    about = "Degen score for Base wallets: airdrops, DeFi, NFTs, bridges and gas, from explorer history."
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

/// Explorer options shared by every subcommand
#[derive(Args)]
struct ExplorerArgs {
    /// Explorer API key
    #[arg(long, env = "ETHERSCAN_API_KEY", hide_env_values = true)]
    api_key: Option<String>,

    /// Explorer API URL
    #[arg(long)]
    api_url: Option<String>,

    /// Partial failure policy: strict or degrade
    #[arg(long)]
    partial_failure: Option<PartialFailurePolicy>,
}

#[derive(Subcommand)]
enum Commands {
    /// Score a single wallet
    Analyze {
        /// Wallet address to analyze
        #[arg(long)]
        address: String,

        /// Output format: json or summary
        #[arg(long, default_value = "summary")]
        format: String,

        #[command(flatten)]
        explorer: ExplorerArgs,
    },

    /// Batch scoring from a file of wallet addresses
    Scan {
        /// Path to file with wallet addresses (one per line)
        #[arg(long)]
        input: PathBuf,

        /// Wallets analyzed at once
        #[arg(long, default_value_t = 4)]
        concurrency: usize,

        #[command(flatten)]
        explorer: ExplorerArgs,
    },

    /// Start the HTTP server
    Serve {
        /// Address to bind to
        #[arg(long)]
        bind: Option<String>,

        /// Rate limit in requests per minute per IP (0 = no limit)
        #[arg(long)]
        rate_limit: Option<u32>,

        /// Cache TTL in seconds
        #[arg(long)]
        cache_ttl: Option<u64>,

        #[command(flatten)]
        explorer: ExplorerArgs,
    },
}

/// Analyze result for JSON output
#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct AnalyzeResult<'a> {
    address: &'a Address,
    #[serde(flatten)]
    score: &'a ScoreResult,
    timestamp: String,
}

/// Build the analyzer from config file values with CLI overrides applied.
/// Also reports whether an explorer API key is configured.
fn build_analyzer(
    cfg: &Config,
    args: &ExplorerArgs,
    cache_ttl: Option<u64>,
) -> Result<(Analyzer, bool)> {
    let explorer_cfg = ExplorerConfig {
        api_url: args
            .api_url
            .clone()
            .or_else(|| cfg.api_url.clone())
            .unwrap_or_else(|| DEFAULT_API_URL.to_string()),
        api_key: args.api_key.clone().or_else(|| cfg.api_key.clone()),
        chain_id: cfg.chain_id.unwrap_or(BASE_CHAIN_ID),
        timeout: Duration::from_secs(cfg.request_timeout_seconds.unwrap_or(10)),
        max_retries: cfg.max_retries.unwrap_or(1),
    };
    let client = ExplorerClient::new(explorer_cfg)?;
    let has_api_key = client.has_api_key();

    let ttl = cache_ttl
        .or(cfg.cache_ttl_seconds)
        .map(Duration::from_secs)
        .unwrap_or(DEFAULT_TTL);
    let cache = TtlCache::new(ttl, cfg.cache_max_entries.unwrap_or(DEFAULT_MAX_ENTRIES));

    let analyzer_cfg = AnalyzerConfig {
        policy: args
            .partial_failure
            .or(cfg.partial_failure)
            .unwrap_or_default(),
        ranks: cfg.rank_table()?,
    };

    Ok((Analyzer::new(Arc::new(client), cache, analyzer_cfg), has_api_key))
}

fn cmd_analyze(address: String, format: String, explorer: ExplorerArgs) -> Result<()> {
    let address = Address::parse(&address)?;
    let cfg = Config::load();
    let (analyzer, has_api_key) = build_analyzer(&cfg, &explorer, None)?;
    if !has_api_key {
        eprintln!("Warning: no explorer API key set (ETHERSCAN_API_KEY), requests may be throttled");
    }

    eprintln!("Fetching activity for {} from Base...", address);
    let rt = tokio::runtime::Runtime::new()?;
    let analysis = rt
        .block_on(analyzer.analyze(&address))
        .wrap_err_with(|| format!("analysis failed for {address}"))?;

    match format.as_str() {
        "json" => {
            let result = AnalyzeResult {
                address: &address,
                score: &analysis.score,
                timestamp: Utc::now().to_rfc3339(),
            };
            println!("{}", serde_json::to_string_pretty(&result)?);
        }
        _ => print!("{}", degenscore::format_summary(&address, &analysis.score)),
    }

    Ok(())
}

fn cmd_scan(input: PathBuf, concurrency: usize, explorer: ExplorerArgs) -> Result<()> {
    use futures::stream::{self, StreamExt};

    let content = fs::read_to_string(&input)
        .wrap_err_with(|| format!("failed to read {}", input.display()))?;
    let wallets: Vec<String> = content
        .lines()
        .map(|l| l.trim().to_string())
        .filter(|l| !l.is_empty() && !l.starts_with('#'))
        .collect();

    eprintln!("Scanning {} wallets...", wallets.len());

    let cfg = Config::load();
    let (analyzer, _) = build_analyzer(&cfg, &explorer, None)?;
    let rt = tokio::runtime::Runtime::new()?;
    let total = wallets.len();

    let failures = rt.block_on(async {
        let outcomes: Vec<bool> = stream::iter(wallets.into_iter().enumerate())
            .map(|(i, wallet)| {
                let analyzer = analyzer.clone();
                async move {
                    eprintln!("[{}/{}] Scanning {}...", i + 1, total, wallet);
                    match degenscore::analyze_address(&analyzer, &wallet).await {
                        Ok(analysis) => {
                            println!(
                                "{}: {}/100 ({}){}",
                                wallet,
                                analysis.score.total_score,
                                analysis.score.rank,
                                if analysis.cached { " [cached]" } else { "" }
                            );
                            true
                        }
                        Err(e) => {
                            eprintln!("  ERROR {}: {}", wallet, e);
                            false
                        }
                    }
                }
            })
            .buffer_unordered(concurrency.max(1))
            .collect()
            .await;

        outcomes.iter().filter(|ok| !**ok).count()
    });

    eprintln!("Done: {} scored, {} failed", total - failures, failures);
    scan_outcome(total, failures)
}

/// A scan with any failed wallet exits non-zero.
fn scan_outcome(total: usize, failures: usize) -> Result<()> {
    if failures > 0 {
        eyre::bail!("{failures} of {total} wallets failed");
    }
    Ok(())
}

fn cmd_serve(
    bind: Option<String>,
    rate_limit: Option<u32>,
    cache_ttl: Option<u64>,
    explorer: ExplorerArgs,
) -> Result<()> {
    use degenscore::server::{run_server, ServerConfig};

    let cfg = Config::load();

    let bind_str = bind
        .or(cfg.bind.clone())
        .unwrap_or_else(|| "127.0.0.1:8080".to_string());
    let bind_addr = bind_str
        .parse()
        .wrap_err_with(|| format!("Invalid bind address: {}", bind_str))?;
    let rate_limit_rpm = rate_limit
        .or(cfg.rate_limit_rpm)
        .unwrap_or(60);
    let sweep_interval = cfg
        .sweep_interval_seconds
        .map(Duration::from_secs)
        .unwrap_or(DEFAULT_SWEEP_INTERVAL);

    let (analyzer, api_key_configured) = build_analyzer(&cfg, &explorer, cache_ttl)?;

    let config = ServerConfig {
        bind_addr,
        rate_limit_rpm,
        allowed_origins: cfg.allowed_origins.clone(),
        sweep_interval,
        api_key_configured,
    };

    tracing::info!("starting degenscore server");

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(run_server(config, analyzer))?;

    Ok(())
}

fn main() {
    // Initialize structured logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("degenscore=info")),
        )
        .init();

    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Analyze {
            address,
            format,
            explorer,
        } => cmd_analyze(address, format, explorer),
        Commands::Scan {
            input,
            concurrency,
            explorer,
        } => cmd_scan(input, concurrency, explorer),
        Commands::Serve {
            bind,
            rate_limit,
            cache_ttl,
            explorer,
        } => cmd_serve(bind, rate_limit, cache_ttl, explorer),
    };

    if let Err(e) = result {
        eprintln!("Error: {e:?}");
        std::process::exit(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scan_outcome_all_scored() {
        assert!(scan_outcome(3, 0).is_ok());
        assert!(scan_outcome(0, 0).is_ok());
    }

    #[test]
    fn test_scan_outcome_fails_on_any_failure() {
        let err = scan_outcome(3, 1).unwrap_err();
        assert_eq!(err.to_string(), "1 of 3 wallets failed");
        assert!(scan_outcome(2, 2).is_err());
    }
}
