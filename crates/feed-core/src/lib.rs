pub mod cursor;
pub mod filter;
pub mod window;
pub mod wire;

use cursor::PageRequest;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

/// Identity and ordering key of anything shown in a live feed.
pub trait FeedItem {
    fn id(&self) -> &str;
    fn timestamp(&self) -> u64;
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum ItemKind {
    Block,
    #[serde(alias = "transaction")]
    Tx,
}

impl ItemKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ItemKind::Block => "block",
            ItemKind::Tx => "tx",
        }
    }
}

impl fmt::Display for ItemKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ItemKind {
    type Err = String;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let normalized = input.trim().to_lowercase();
        match normalized.as_str() {
            "block" | "blocks" => Ok(ItemKind::Block),
            "tx" | "txs" | "transaction" | "transactions" => Ok(ItemKind::Tx),
            other => Err(format!("Unknown item kind: {other}")),
        }
    }
}

// Vertex versions the network marks as blocks (regular, merge mined, poa).
const BLOCK_VERSIONS: [u32; 3] = [0, 3, 5];

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TxSummary {
    #[serde(alias = "hash")]
    pub tx_id: String,
    #[serde(deserialize_with = "deserialize_timestamp")]
    pub timestamp: u64,
    #[serde(default)]
    pub is_block: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<u32>,
    #[serde(default)]
    pub inputs: Vec<TxIo>,
    #[serde(default)]
    pub outputs: Vec<TxIo>,
    #[serde(default, deserialize_with = "deserialize_tokens")]
    pub tokens: Vec<String>,
    #[serde(default, flatten)]
    pub extra: HashMap<String, Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct TxIo {
    #[serde(default)]
    pub token: Option<String>,
    #[serde(default)]
    pub value: Option<u64>,
    #[serde(default)]
    pub decoded: Option<DecodedScript>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct DecodedScript {
    #[serde(default)]
    pub address: Option<String>,
}

impl TxSummary {
    pub fn new(tx_id: impl Into<String>, timestamp: u64, kind: ItemKind) -> Self {
        Self {
            tx_id: tx_id.into(),
            timestamp,
            is_block: kind == ItemKind::Block,
            version: None,
            inputs: Vec::new(),
            outputs: Vec::new(),
            tokens: Vec::new(),
            extra: HashMap::new(),
        }
    }

    pub fn kind(&self) -> ItemKind {
        let versioned_block = self
            .version
            .map(|version| BLOCK_VERSIONS.contains(&version))
            .unwrap_or(false);
        if self.is_block || versioned_block {
            ItemKind::Block
        } else {
            ItemKind::Tx
        }
    }

    pub fn is_block(&self) -> bool {
        self.kind() == ItemKind::Block
    }

    pub fn involves_token(&self, uid: &str) -> bool {
        self.tokens.iter().any(|token| token == uid)
            || self
                .inputs
                .iter()
                .chain(self.outputs.iter())
                .any(|io| io.token.as_deref() == Some(uid))
    }

    pub fn involves_address(&self, address: &str) -> bool {
        self.inputs
            .iter()
            .chain(self.outputs.iter())
            .filter_map(|io| io.decoded.as_ref())
            .any(|decoded| decoded.address.as_deref() == Some(address))
    }
}

impl FeedItem for TxSummary {
    fn id(&self) -> &str {
        &self.tx_id
    }

    fn timestamp(&self) -> u64 {
        self.timestamp
    }
}

/// One REST page, newest first.
#[derive(Debug, Clone, PartialEq)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub has_before: bool,
    pub has_after: bool,
}

impl<T> Page<T> {
    pub fn first(items: Vec<T>, has_more: bool) -> Self {
        Self {
            items,
            has_before: false,
            has_after: has_more,
        }
    }

    /// Maps the backend's single `has_more` flag onto both directions.
    /// `next` walks towards older items, `previous` towards newer ones.
    pub fn from_response(request: &PageRequest, items: Vec<T>, has_more: bool) -> Self {
        match request {
            PageRequest::First => Self::first(items, has_more),
            PageRequest::Next(_) => Self {
                items,
                has_before: true,
                has_after: has_more,
            },
            PageRequest::Previous(_) => Self {
                items,
                has_before: has_more,
                has_after: true,
            },
        }
    }
}

/// Accept a timestamp sent as an integer, a float or a numeric string.
fn deserialize_timestamp<'de, D>(deserializer: D) -> Result<u64, D::Error>
where
    D: Deserializer<'de>,
{
    let val: Value = Value::deserialize(deserializer)?;
    match val {
        Value::Number(n) => n
            .as_u64()
            .or_else(|| n.as_f64().filter(|v| *v >= 0.0).map(|v| v as u64))
            .ok_or_else(|| serde::de::Error::custom(format!("invalid timestamp: {n}"))),
        Value::String(s) => s
            .trim()
            .parse::<u64>()
            .map_err(|_| serde::de::Error::custom(format!("invalid timestamp: {s}"))),
        _ => Err(serde::de::Error::custom(
            "expected number or string for timestamp",
        )),
    }
}

/// Tokens arrive either as bare uids or as `{ "uid": ... }` objects.
fn deserialize_tokens<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let val: Option<Value> = Option::deserialize(deserializer)?;
    let Some(Value::Array(items)) = val else {
        return Ok(Vec::new());
    };
    let mut out = Vec::with_capacity(items.len());
    for item in items {
        match item {
            Value::String(uid) => out.push(uid),
            Value::Object(map) => match map.get("uid").and_then(Value::as_str) {
                Some(uid) => out.push(uid.to_string()),
                None => return Err(serde::de::Error::custom("token object without uid")),
            },
            _ => return Err(serde::de::Error::custom("expected string or object token")),
        }
    }
    Ok(out)
}
