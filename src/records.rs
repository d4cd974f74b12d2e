//! Activity records returned by the block explorer.
//!
//! Each record kind is a typed struct holding only the fields the scoring
//! engine reads, as explicit `Option`s. Every other field the explorer sends is
//! kept verbatim in `extra` and serialized back unchanged.

use std::fmt;

use serde::{Deserialize, Deserializer, Serialize};

// ---------------------------------------------------------------------------
// Record kinds
// ---------------------------------------------------------------------------

/// The three categories of on-chain activity fetched per address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordKind {
    /// Native (ETH) transactions.
    Transaction,
    /// ERC-721 / ERC-1155 transfers.
    NftTransfer,
    /// ERC-20 transfers.
    TokenTransfer,
}

impl RecordKind {
    pub const ALL: [RecordKind; 3] = [Self::Transaction, Self::NftTransfer, Self::TokenTransfer];

    /// Explorer `action` parameter for this kind.
    pub fn action(&self) -> &'static str {
        match self {
            Self::Transaction => "txlist",
            Self::NftTransfer => "tokennfttx",
            Self::TokenTransfer => "tokentx",
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Transaction => "transaction",
            Self::NftTransfer => "nft_transfer",
            Self::TokenTransfer => "token_transfer",
        }
    }
}

impl fmt::Display for RecordKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Transaction => "transactions",
            Self::NftTransfer => "NFT transfers",
            Self::TokenTransfer => "token transfers",
        })
    }
}

// ---------------------------------------------------------------------------
// Record shapes
// ---------------------------------------------------------------------------

type Extra = serde_json::Map<String, serde_json::Value>;

/// A native transaction (`txlist`).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NativeTransaction {
    #[serde(default, deserialize_with = "lenient_string", skip_serializing_if = "Option::is_none")]
    pub to: Option<String>,
    #[serde(default, deserialize_with = "lenient_string", skip_serializing_if = "Option::is_none")]
    pub gas_used: Option<String>,
    #[serde(default, deserialize_with = "lenient_string", skip_serializing_if = "Option::is_none")]
    pub gas_price: Option<String>,
    #[serde(flatten)]
    pub extra: Extra,
}

/// An NFT transfer (`tokennfttx`).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NftTransfer {
    #[serde(default, deserialize_with = "lenient_string", skip_serializing_if = "Option::is_none")]
    pub contract_address: Option<String>,
    #[serde(flatten)]
    pub extra: Extra,
}

/// An ERC-20 transfer (`tokentx`).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenTransfer {
    #[serde(default, deserialize_with = "lenient_string", skip_serializing_if = "Option::is_none")]
    pub to: Option<String>,
    #[serde(default, deserialize_with = "lenient_string", skip_serializing_if = "Option::is_none")]
    pub contract_address: Option<String>,
    #[serde(flatten)]
    pub extra: Extra,
}

impl NativeTransaction {
    /// Recipient, if present and non-empty (contract creations have none).
    pub fn recipient(&self) -> Option<&str> {
        non_empty(&self.to)
    }

    /// `gasUsed * gasPrice` in wei, or `None` when either field is missing or
    /// not an unsigned integer.
    pub fn gas_cost_wei(&self) -> Option<u128> {
        let used: u128 = non_empty(&self.gas_used)?.parse().ok()?;
        let price: u128 = non_empty(&self.gas_price)?.parse().ok()?;
        used.checked_mul(price)
    }
}

impl NftTransfer {
    pub fn contract(&self) -> Option<&str> {
        non_empty(&self.contract_address)
    }
}

impl TokenTransfer {
    pub fn recipient(&self) -> Option<&str> {
        non_empty(&self.to)
    }

    pub fn contract(&self) -> Option<&str> {
        non_empty(&self.contract_address)
    }
}

/// One on-chain event, tagged by kind.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum ActivityRecord {
    Transaction(NativeTransaction),
    NftTransfer(NftTransfer),
    TokenTransfer(TokenTransfer),
}

impl ActivityRecord {
    /// Decode a raw explorer result element as the given kind.
    pub fn decode(kind: RecordKind, value: serde_json::Value) -> Result<Self, serde_json::Error> {
        Ok(match kind {
            RecordKind::Transaction => Self::Transaction(serde_json::from_value(value)?),
            RecordKind::NftTransfer => Self::NftTransfer(serde_json::from_value(value)?),
            RecordKind::TokenTransfer => Self::TokenTransfer(serde_json::from_value(value)?),
        })
    }

    pub fn kind(&self) -> RecordKind {
        match self {
            Self::Transaction(_) => RecordKind::Transaction,
            Self::NftTransfer(_) => RecordKind::NftTransfer,
            Self::TokenTransfer(_) => RecordKind::TokenTransfer,
        }
    }
}

/// Activity of one address, split by kind.
#[derive(Debug, Clone, Default)]
pub struct WalletActivity {
    pub transactions: Vec<NativeTransaction>,
    pub nft_transfers: Vec<NftTransfer>,
    pub token_transfers: Vec<TokenTransfer>,
}

impl WalletActivity {
    /// Sort a mixed record list into the typed buckets.
    pub fn extend(&mut self, records: impl IntoIterator<Item = ActivityRecord>) {
        for record in records {
            match record {
                ActivityRecord::Transaction(tx) => self.transactions.push(tx),
                ActivityRecord::NftTransfer(t) => self.nft_transfers.push(t),
                ActivityRecord::TokenTransfer(t) => self.token_transfers.push(t),
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn non_empty(field: &Option<String>) -> Option<&str> {
    field.as_deref().map(str::trim).filter(|s| !s.is_empty())
}

/// Accept strings or numbers; anything else (null, objects) becomes `None`.
fn lenient_string<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<serde_json::Value>::deserialize(deserializer)?;
    Ok(match value {
        Some(serde_json::Value::String(s)) => Some(s),
        Some(serde_json::Value::Number(n)) => Some(n.to_string()),
        _ => None,
    })
}
