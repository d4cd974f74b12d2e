//! degenscore: wallet reputation scores for Base addresses
//!
//! Pulls an address's recent on-chain activity from a block explorer,
//! turns it into a 0-100 "degen" score with a per-category breakdown, and
//! caches results for a short TTL so repeated lookups stay off the
//! rate-limited upstream.
//!
//! # Score Categories
//!
//! - **Airdrop** (max 25): distinct tokens received
//! - **DeFi** (max 25): distinct known DeFi protocols called
//! - **NFT** (max 20): distinct NFT collections touched
//! - **Bridge** (max 15): transactions sent to known bridges
//! - **Gas** (max 15): total gas spent, stepped by ETH thresholds

pub mod address;
pub mod analyzer;
pub mod cache;
pub mod config;
pub mod error;
pub mod explorer;
pub mod metrics;
pub mod records;
pub mod scoring;
pub mod server;

pub use address::Address;
pub use analyzer::{Analysis, Analyzer, AnalyzerConfig, PartialFailurePolicy, RecordsResult};
pub use cache::{AnalysisCache, TtlCache};
pub use error::{AnalysisError, FetchError, FetchFailure, InvalidAddress};
pub use explorer::{ExplorerClient, ExplorerConfig, ExplorerProvider};
pub use records::{ActivityRecord, RecordKind};
pub use scoring::{score_wallet, RankTable, RankTier, ScoreResult};

// ---------------------------------------------------------------------------
// Convenience entry points
// ---------------------------------------------------------------------------

/// Validate `input` as an address and analyze it.
///
/// Invalid input fails before any upstream call.
pub async fn analyze_address(analyzer: &Analyzer, input: &str) -> Result<Analysis, AnalysisError> {
    let address = Address::parse(input)?;
    analyzer.analyze(&address).await
}

/// Format a score as the human-readable summary printed by the CLI.
pub fn format_summary(address: &Address, score: &ScoreResult) -> String {
    let b = &score.breakdown;
    let d = &score.details;
    let mut out = String::new();
    out.push_str("Degen Score Analysis\n");
    out.push_str("====================\n");
    out.push_str(&format!("Wallet:         {address}\n"));
    out.push_str(&format!("Score:          {}/100\n", score.total_score));
    out.push_str(&format!("Rank:           {}\n", score.rank));
    out.push('\n');
    out.push_str("Breakdown:\n");
    out.push_str(&format!("  Airdrop: {:>2}/25  ({} tokens received)\n", b.airdrop, d.tokens_received));
    out.push_str(&format!("  DeFi:    {:>2}/25  ({} protocols)\n", b.defi, d.defi_protocols_used));
    out.push_str(&format!("  NFT:     {:>2}/20  ({} collections)\n", b.nft, d.nft_collections));
    out.push_str(&format!("  Bridge:  {:>2}/15  ({} bridge txs)\n", b.bridge, d.bridge_transactions));
    out.push_str(&format!("  Gas:     {:>2}/15  ({} ETH)\n", b.gas, d.total_gas_spent));
    if !d.defi_protocols.is_empty() {
        out.push('\n');
        out.push_str(&format!("Protocols:      {}\n", d.defi_protocols.join(", ")));
    }
    if !d.unavailable.is_empty() {
        let missing: Vec<String> = d.unavailable.iter().map(|k| k.to_string()).collect();
        out.push_str(&format!("Unavailable:    {}\n", missing.join(", ")));
    }
    out
}
