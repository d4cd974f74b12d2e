//! Deterministic wallet scoring.
//!
//! Five categories, each capped:
//!
//! | category | measure                                        | points      | cap |
//! |----------|------------------------------------------------|-------------|-----|
//! | airdrop  | distinct token contracts received              | 2 each      | 25  |
//! | defi     | distinct known DeFi protocols called           | 5 each      | 25  |
//! | nft      | distinct NFT collections touched               | 2 each      | 20  |
//! | bridge   | transactions sent to a known bridge            | 3 each      | 15  |
//! | gas      | total gas spent, stepped (0.001/0.01/0.05/0.1 ETH) | 4/8/12/15 | 15  |
//!
//! The rank is looked up in a [`RankTable`], which is configuration.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::address::Address;
use crate::records::{NativeTransaction, NftTransfer, RecordKind, TokenTransfer};

// ---------------------------------------------------------------------------
// Allow-lists (Base mainnet)
// ---------------------------------------------------------------------------

/// Known DeFi protocol contracts, lower-case.
pub const DEFI_PROTOCOLS: &[(&str, &str)] = &[
    ("0x4200000000000000000000000000000000000006", "WETH"),
    ("0x50c5725949a6f0c72e6c4a641f24049a917db0cb", "Aerodrome"),
    ("0x2626664c2603336e57b271c5c0b26f421741e481", "BaseSwap"),
    ("0x940181a94a35a4569e4529a3cdfb74e38fd98631", "Aave"),
    ("0x4752ba5dbc23f44d87826276bf6fd6b1c372ad24", "Uniswap V3"),
    ("0xa238dd80c259a72e81d7e4664a9801593f98d1c5", "Aave V3 Pool"),
    ("0xfbb21d0380bee3312b33c4353c8936a0f13ef26c", "Moonwell"),
    ("0xd6681e74eea47d7c54c1c0d4e6ac4a0f4f5a8d0f", "Curve Finance"),
];

/// Known bridge contracts, lower-case.
pub const BRIDGES: &[(&str, &str)] = &[
    ("0x49048044d57e1c92a77f79988d21fa8faf74e97e", "Base Bridge"),
    ("0x3154cf16ccdb4c6d922629664174b904d80f2c35", "Stargate"),
    ("0x866e82a600a1414e583f7f13623f1ac5d58b0afa", "Hop Protocol"),
];

pub const AIRDROP_CAP: u32 = 25;
pub const DEFI_CAP: u32 = 25;
pub const NFT_CAP: u32 = 20;
pub const BRIDGE_CAP: u32 = 15;
pub const GAS_CAP: u32 = 15;

const WEI_PER_ETH: u128 = 1_000_000_000_000_000_000;

/// Gas steps as (exclusive lower bound in wei, points), highest first.
const GAS_STEPS: [(u128, u32); 4] = [
    (WEI_PER_ETH / 10, 15),
    (WEI_PER_ETH / 20, 12),
    (WEI_PER_ETH / 100, 8),
    (WEI_PER_ETH / 1000, 4),
];

fn lookup(list: &'static [(&'static str, &'static str)], addr: &str) -> Option<(&'static str, &'static str)> {
    let addr = addr.trim();
    list.iter().copied().find(|(a, _)| a.eq_ignore_ascii_case(addr))
}

// ---------------------------------------------------------------------------
// Rank table
// ---------------------------------------------------------------------------

/// One rank threshold: totals `>= min_score` get `label`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RankTier {
    pub min_score: u32,
    pub label: String,
}

impl RankTier {
    pub fn new(min_score: u32, label: impl Into<String>) -> Self {
        Self {
            min_score,
            label: label.into(),
        }
    }
}

/// Ordered rank thresholds, highest first. Always has a tier at 0.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RankTable {
    tiers: Vec<RankTier>,
}

impl RankTable {
    /// Build a table from tiers in any order.
    ///
    /// Fails when there is no tier with `min_score == 0`, when two tiers share
    /// a threshold, or when a label is empty.
    pub fn new(mut tiers: Vec<RankTier>) -> Result<Self, String> {
        if !tiers.iter().any(|t| t.min_score == 0) {
            return Err("rank table needs a tier with min_score = 0".to_string());
        }
        if let Some(t) = tiers.iter().find(|t| t.label.trim().is_empty()) {
            return Err(format!("rank tier at {} has an empty label", t.min_score));
        }
        tiers.sort_by(|a, b| b.min_score.cmp(&a.min_score));
        if tiers.windows(2).any(|w| w[0].min_score == w[1].min_score) {
            return Err("rank table has duplicate thresholds".to_string());
        }
        Ok(Self { tiers })
    }

    pub fn rank(&self, total: u32) -> &str {
        self.tiers
            .iter()
            .find(|t| total >= t.min_score)
            .map(|t| t.label.as_str())
            // `new` guarantees a zero tier, so this is only reached on an empty table.
            .unwrap_or("")
    }

    /// Label of the zero tier.
    pub fn lowest(&self) -> &str {
        self.rank(0)
    }

    pub fn tiers(&self) -> &[RankTier] {
        &self.tiers
    }
}

impl Default for RankTable {
    fn default() -> Self {
        Self {
            tiers: vec![
                RankTier::new(90, "ULTRA DEGEN 🦍"),
                RankTier::new(70, "DEGEN KING 👑"),
                RankTier::new(50, "DEGEN PRINCE 🤴"),
                RankTier::new(30, "BABY DEGEN 🐣"),
                RankTier::new(0, "NORMIE 🥲"),
            ],
        }
    }
}

// ---------------------------------------------------------------------------
// Result types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScoreBreakdown {
    pub airdrop: u32,
    pub defi: u32,
    pub nft: u32,
    pub bridge: u32,
    pub gas: u32,
}

impl ScoreBreakdown {
    pub fn total(&self) -> u32 {
        self.airdrop + self.defi + self.nft + self.bridge + self.gas
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScoreDetails {
    pub total_transactions: usize,
    pub nft_collections: usize,
    pub defi_protocols_used: usize,
    /// Names of the DeFi protocols matched, ordered by contract address.
    pub defi_protocols: Vec<String>,
    pub bridge_transactions: usize,
    /// Total gas in ETH, six decimals.
    pub total_gas_spent: String,
    pub tokens_received: usize,
    /// Record kinds that could not be fetched and were scored as empty.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub unavailable: Vec<RecordKind>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScoreResult {
    pub total_score: u32,
    pub rank: String,
    pub breakdown: ScoreBreakdown,
    pub details: ScoreDetails,
}

impl ScoreResult {
    /// Check the sum and per-category ceilings.
    pub fn check(&self) -> Result<(), String> {
        let b = &self.breakdown;
        if b.total() != self.total_score {
            return Err(format!(
                "total {} does not match breakdown sum {}",
                self.total_score,
                b.total()
            ));
        }
        for (name, value, cap) in [
            ("airdrop", b.airdrop, AIRDROP_CAP),
            ("defi", b.defi, DEFI_CAP),
            ("nft", b.nft, NFT_CAP),
            ("bridge", b.bridge, BRIDGE_CAP),
            ("gas", b.gas, GAS_CAP),
        ] {
            if value > cap {
                return Err(format!("{name} score {value} exceeds cap {cap}"));
            }
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Scoring
// ---------------------------------------------------------------------------

fn capped(count: usize, points: u32, cap: u32) -> u32 {
    u32::try_from(count)
        .unwrap_or(u32::MAX)
        .saturating_mul(points)
        .min(cap)
}

/// Map total gas spent (wei) to the stepped gas score.
pub fn gas_score(total_wei: u128) -> u32 {
    GAS_STEPS
        .iter()
        .find(|(floor, _)| total_wei > *floor)
        .map(|(_, points)| *points)
        .unwrap_or(0)
}

/// Format wei as ETH rounded to six decimals.
pub fn format_eth(wei: u128) -> String {
    const WEI_PER_MICRO: u128 = 1_000_000_000_000;
    let micro = wei.saturating_add(WEI_PER_MICRO / 2) / WEI_PER_MICRO;
    format!("{}.{:06}", micro / 1_000_000, micro % 1_000_000)
}

/// Score a wallet from its fetched activity.
///
/// Pure and deterministic. Records with missing fields never match anything.
pub fn score_wallet(
    transactions: &[NativeTransaction],
    nft_transfers: &[NftTransfer],
    token_transfers: &[TokenTransfer],
    address: &Address,
    ranks: &RankTable,
) -> ScoreResult {
    // DeFi: distinct protocols called
    let defi_used: BTreeMap<&str, &str> = transactions
        .iter()
        .filter_map(NativeTransaction::recipient)
        .filter_map(|to| lookup(DEFI_PROTOCOLS, to))
        .collect();
    let defi = capped(defi_used.len(), 5, DEFI_CAP);

    // NFT: distinct collections
    let collections: BTreeSet<String> = nft_transfers
        .iter()
        .filter_map(NftTransfer::contract)
        .map(str::to_ascii_lowercase)
        .collect();
    let nft = capped(collections.len(), 2, NFT_CAP);

    // Bridge: every bridge transaction counts
    let bridge_txs = transactions
        .iter()
        .filter_map(NativeTransaction::recipient)
        .filter(|to| lookup(BRIDGES, to).is_some())
        .count();
    let bridge = capped(bridge_txs, 3, BRIDGE_CAP);

    // Gas
    let total_gas_wei = transactions
        .iter()
        .filter_map(NativeTransaction::gas_cost_wei)
        .fold(0u128, u128::saturating_add);
    let gas = gas_score(total_gas_wei);

    // Airdrop: distinct tokens received
    let received: BTreeSet<String> = token_transfers
        .iter()
        .filter(|t| t.recipient().is_some_and(|to| address.matches(to)))
        .filter_map(TokenTransfer::contract)
        .map(str::to_ascii_lowercase)
        .collect();
    let airdrop = capped(received.len(), 2, AIRDROP_CAP);

    let breakdown = ScoreBreakdown {
        airdrop,
        defi,
        nft,
        bridge,
        gas,
    };
    let total_score = breakdown.total();

    ScoreResult {
        total_score,
        rank: ranks.rank(total_score).to_string(),
        breakdown,
        details: ScoreDetails {
            total_transactions: transactions.len(),
            nft_collections: collections.len(),
            defi_protocols_used: defi_used.len(),
            defi_protocols: defi_used.values().map(|name| name.to_string()).collect(),
            bridge_transactions: bridge_txs,
            total_gas_spent: format_eth(total_gas_wei),
            tokens_received: received.len(),
            unavailable: Vec::new(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const WALLET: &str = "0x1111111111111111111111111111111111111111";
    const UNISWAP: &str = "0x4752ba5dbc23f44d87826276bf6fd6b1c372ad24";
    const STARGATE: &str = "0x3154cf16ccdb4c6d922629664174b904d80f2c35";

    fn wallet() -> Address {
        Address::parse(WALLET).unwrap()
    }

    fn tx(to: &str, gas_used: &str, gas_price: &str) -> NativeTransaction {
        NativeTransaction {
            to: Some(to.to_string()),
            gas_used: Some(gas_used.to_string()),
            gas_price: Some(gas_price.to_string()),
            ..Default::default()
        }
    }

    fn nft(contract: &str) -> NftTransfer {
        NftTransfer {
            contract_address: Some(contract.to_string()),
            ..Default::default()
        }
    }

    fn token(to: &str, contract: &str) -> TokenTransfer {
        TokenTransfer {
            to: Some(to.to_string()),
            contract_address: Some(contract.to_string()),
            ..Default::default()
        }
    }

    fn contract(n: usize) -> String {
        format!("0x{:040x}", n + 0xabc000)
    }

    #[test]
    fn test_empty_activity_scores_zero() {
        let result = score_wallet(&[], &[], &[], &wallet(), &RankTable::default());
        assert_eq!(result.total_score, 0);
        assert_eq!(result.breakdown, ScoreBreakdown::default());
        assert_eq!(result.rank, "NORMIE 🥲");
        assert_eq!(result.details.total_gas_spent, "0.000000");
        result.check().unwrap();
    }

    #[test]
    fn test_defi_and_gas_example() {
        // 3 txs to one DeFi protocol, 0.02 ETH total gas.
        let txs = vec![
            tx(UNISWAP, "1000000", "10000000000"),
            tx(UNISWAP, "1000000", "10000000000"),
            tx(UNISWAP, "0", "10000000000"),
        ];
        let result = score_wallet(&txs, &[], &[], &wallet(), &RankTable::default());
        assert_eq!(result.breakdown.defi, 5);
        assert_eq!(result.breakdown.gas, 8);
        assert_eq!(result.breakdown.nft, 0);
        assert_eq!(result.breakdown.bridge, 0);
        assert_eq!(result.breakdown.airdrop, 0);
        assert_eq!(result.total_score, 13);
        assert_eq!(result.details.total_gas_spent, "0.020000");
        assert_eq!(result.details.defi_protocols, vec!["Uniswap V3".to_string()]);
    }

    #[test]
    fn test_airdrop_caps_at_25() {
        let tokens: Vec<_> = (0..40).map(|i| token(WALLET, &contract(i))).collect();
        let result = score_wallet(&[], &[], &tokens, &wallet(), &RankTable::default());
        assert_eq!(result.breakdown.airdrop, 25);
        assert_eq!(result.total_score, 25);
        assert_eq!(result.details.tokens_received, 40);
    }

    #[test]
    fn test_airdrop_ignores_sent_tokens() {
        let other = "0x2222222222222222222222222222222222222222";
        let tokens = vec![
            token(other, &contract(1)),
            token(&WALLET.to_uppercase().replace("0X", "0x"), &contract(2)),
            token(WALLET, &contract(2)),
        ];
        let result = score_wallet(&[], &[], &tokens, &wallet(), &RankTable::default());
        assert_eq!(result.details.tokens_received, 1);
        assert_eq!(result.breakdown.airdrop, 2);
    }

    #[test]
    fn test_nft_distinct_collections_case_insensitive() {
        let a = contract(1);
        let transfers = vec![nft(&a), nft(&a.to_uppercase().replace("0X", "0x")), nft(&contract(2))];
        let result = score_wallet(&[], &transfers, &[], &wallet(), &RankTable::default());
        assert_eq!(result.details.nft_collections, 2);
        assert_eq!(result.breakdown.nft, 4);
    }

    #[test]
    fn test_bridge_counts_every_transaction() {
        let txs: Vec<_> = (0..4).map(|_| tx(STARGATE, "x", "y")).collect();
        let result = score_wallet(&txs, &[], &[], &wallet(), &RankTable::default());
        assert_eq!(result.details.bridge_transactions, 4);
        assert_eq!(result.breakdown.bridge, 12);

        let txs: Vec<_> = (0..9).map(|_| tx(STARGATE, "x", "y")).collect();
        let result = score_wallet(&txs, &[], &[], &wallet(), &RankTable::default());
        assert_eq!(result.breakdown.bridge, 15);
    }

    #[test]
    fn test_missing_fields_never_match() {
        let txs = vec![NativeTransaction::default(), tx("", "", "")];
        let transfers = vec![NftTransfer::default()];
        let tokens = vec![TokenTransfer::default(), token(WALLET, "")];
        let result = score_wallet(&txs, &transfers, &tokens, &wallet(), &RankTable::default());
        assert_eq!(result.total_score, 0);
        assert_eq!(result.details.total_transactions, 2);
    }

    #[test]
    fn test_gas_steps() {
        let eth = WEI_PER_ETH;
        assert_eq!(gas_score(0), 0);
        assert_eq!(gas_score(eth / 1000), 0);
        assert_eq!(gas_score(eth / 1000 + 1), 4);
        assert_eq!(gas_score(eth / 100), 4);
        assert_eq!(gas_score(eth / 50), 8);
        assert_eq!(gas_score(eth / 20 + 1), 12);
        assert_eq!(gas_score(eth), 15);
    }

    #[test]
    fn test_format_eth() {
        assert_eq!(format_eth(0), "0.000000");
        assert_eq!(format_eth(WEI_PER_ETH), "1.000000");
        assert_eq!(format_eth(1_234_567_890_000_000), "0.001235");
    }

    #[test]
    fn test_all_categories_capped_and_summed() {
        let defi: Vec<_> = DEFI_PROTOCOLS
            .iter()
            .map(|(a, _)| tx(a, "1000000", "1000000000000"))
            .collect();
        let bridges: Vec<_> = (0..10).map(|_| tx(STARGATE, "1", "1")).collect();
        let txs: Vec<_> = defi.into_iter().chain(bridges).collect();
        let transfers: Vec<_> = (0..30).map(|i| nft(&contract(i))).collect();
        let tokens: Vec<_> = (0..30).map(|i| token(WALLET, &contract(i))).collect();

        let result = score_wallet(&txs, &transfers, &tokens, &wallet(), &RankTable::default());
        assert_eq!(result.breakdown.defi, DEFI_CAP);
        assert_eq!(result.breakdown.nft, NFT_CAP);
        assert_eq!(result.breakdown.bridge, BRIDGE_CAP);
        assert_eq!(result.breakdown.gas, GAS_CAP);
        assert_eq!(result.breakdown.airdrop, AIRDROP_CAP);
        assert_eq!(result.total_score, 100);
        assert_eq!(result.rank, "ULTRA DEGEN 🦍");
        result.check().unwrap();
    }

    #[test]
    fn test_rank_table_default_thresholds() {
        let table = RankTable::default();
        assert_eq!(table.rank(100), "ULTRA DEGEN 🦍");
        assert_eq!(table.rank(90), "ULTRA DEGEN 🦍");
        assert_eq!(table.rank(89), "DEGEN KING 👑");
        assert_eq!(table.rank(70), "DEGEN KING 👑");
        assert_eq!(table.rank(50), "DEGEN PRINCE 🤴");
        assert_eq!(table.rank(30), "BABY DEGEN 🐣");
        assert_eq!(table.rank(29), "NORMIE 🥲");
        assert_eq!(table.lowest(), "NORMIE 🥲");
    }

    #[test]
    fn test_rank_table_validation() {
        assert!(RankTable::new(vec![RankTier::new(10, "A")]).is_err());
        assert!(RankTable::new(vec![RankTier::new(0, "A"), RankTier::new(0, "B")]).is_err());
        assert!(RankTable::new(vec![RankTier::new(0, " ")]).is_err());

        let table = RankTable::new(vec![
            RankTier::new(0, "low"),
            RankTier::new(61, "high"),
            RankTier::new(21, "mid"),
        ])
        .unwrap();
        assert_eq!(table.tiers()[0].min_score, 61);
        assert_eq!(table.rank(60), "mid");
    }

    #[test]
    fn test_check_detects_broken_invariant() {
        let mut result = score_wallet(&[], &[], &[], &wallet(), &RankTable::default());
        result.total_score = 3;
        assert!(result.check().is_err());
    }

    #[test]
    fn test_serialized_shape() {
        let result = score_wallet(&[], &[], &[], &wallet(), &RankTable::default());
        let json = serde_json::to_value(&result).unwrap();
        assert_eq!(json["totalScore"], 0);
        assert_eq!(json["breakdown"]["airdrop"], 0);
        assert_eq!(json["details"]["totalGasSpent"], "0.000000");
        assert!(json["details"].get("unavailable").is_none());
    }
}
