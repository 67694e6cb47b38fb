//! 🚦 Partition Key Router: the bouncer with a clipboard.
//!
//! Name not on the list? Wrong billing code type? No billing code at all?
//! You're not getting in. No hard feelings. No error either. Just `None`.
//!
//! Pure predicate. Call it as often as you like; it touches nothing.

use std::collections::BTreeSet;

use serde::{Deserialize, Deserializer};
use serde_json::Value;

use crate::common::{InNetworkRecord, scalar_to_string};

/// 🎯 How `billing_code_type` is compared against `key_type`.
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
pub enum MatchMode {
    /// `"CPT"` matches `"cpt"` and `" CPT "`, but not `"CPT4"`.
    #[default]
    Exact,
    /// `"CPT"` also matches `"CPT4"` and friends.
    Prefix,
}

/// 🔧 `[routing]`: what kind of codes we keep.
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct RoutingConfig {
    /// Required key type family. Empty string disables the type filter entirely.
    #[serde(default = "default_key_type")]
    pub key_type: String,
    #[serde(default)]
    pub match_mode: MatchMode,
    /// Either a TOML list or one "99213, 99214 99215" string. Both work. Commas optional, vibes mandatory.
    #[serde(default, deserialize_with = "allowlist")]
    pub allowlist: Option<BTreeSet<String>>,
}

fn default_key_type() -> String {
    "CPT".to_string()
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            key_type: default_key_type(),
            match_mode: MatchMode::default(),
            allowlist: None,
        }
    }
}

fn allowlist<'de, D>(deserializer: D) -> Result<Option<BTreeSet<String>>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    let codes: BTreeSet<String> = match value {
        Some(Value::Array(items)) => items.iter().filter_map(scalar_to_string).collect(),
        Some(Value::String(joined)) => joined
            .split(|c: char| c == ',' || c.is_whitespace())
            .map(str::trim)
            .filter(|code| !code.is_empty())
            .map(str::to_string)
            .collect(),
        Some(other) => scalar_to_string(&other).into_iter().collect(),
        None => BTreeSet::new(),
    };
    // -- 🫥 an empty allowlist would drop everything. nobody means that. treat it as "no allowlist".
    Ok((!codes.is_empty()).then_some(codes))
}

/// 🚦 The router itself. Built once per run from `RoutingConfig`.
#[derive(Debug, Clone)]
pub struct Router {
    key_type: String,
    match_mode: MatchMode,
    allowlist: Option<BTreeSet<String>>,
}

impl Router {
    pub fn new(config: &RoutingConfig) -> Self {
        Self {
            key_type: config.key_type.trim().to_uppercase(),
            match_mode: config.match_mode,
            allowlist: config.allowlist.clone(),
        }
    }

    /// Returns the partition key for `record`, or `None` when the record should be dropped.
    pub fn route(&self, record: &InNetworkRecord) -> Option<String> {
        let key = record.billing_code.as_deref()?.trim();
        if key.is_empty() {
            return None;
        }

        if !self.key_type.is_empty() {
            let code_type = record
                .billing_code_type
                .as_deref()
                .unwrap_or_default()
                .trim()
                .to_uppercase();
            let type_matches = match self.match_mode {
                MatchMode::Exact => code_type == self.key_type,
                MatchMode::Prefix => code_type.starts_with(&self.key_type),
            };
            if !type_matches {
                return None;
            }
        }

        if self
            .allowlist
            .as_ref()
            .is_some_and(|allowed| !allowed.contains(key))
        {
            return None;
        }

        Some(key.to_string())
    }
}
