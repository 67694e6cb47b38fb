//! 📦 Common data structures: the shapes we expect to find inside a price transparency file.
//!
//! 🎬 COLD OPEN. INT. PAYER WEBSITE. A 40 GB GZIP FILE SITS QUIETLY
//!
//! Somewhere inside it, a billing code is a string. Two records later the same field is
//! a number. An NPI shows up as `1234567890`, then as `"1234567890"`, then as a lone
//! scalar where an array was promised. A provider reference id is an int, a string, and
//! once, memorably, an object.
//!
//! These structs accept all of it and normalize to strings on the way in, so nothing
//! downstream ever has to ask "but what type is it today?" 🦆
//!
//! Unknown fields are ignored. Missing lists are empty. `null` lists are also empty.

use serde::{Deserialize, Deserializer};
use serde_json::Value;

/// 🎯 One element of the top-level `in_network` array.
#[derive(Debug, Deserialize, Default, Clone)]
pub struct InNetworkRecord {
    #[serde(default, deserialize_with = "lenient_string")]
    pub billing_code: Option<String>,
    #[serde(default, deserialize_with = "lenient_string")]
    pub billing_code_type: Option<String>,
    #[serde(default, deserialize_with = "lenient_string")]
    pub negotiation_arrangement: Option<String>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub negotiated_rates: Vec<NegotiatedRate>,
}

/// 💸 A rate: inline provider groups, references to external ones, or both. Plus prices.
#[derive(Debug, Deserialize, Default, Clone)]
pub struct NegotiatedRate {
    #[serde(default, deserialize_with = "null_as_default")]
    pub provider_groups: Vec<ProviderGroup>,
    #[serde(default, deserialize_with = "reference_ids")]
    pub provider_references: Vec<String>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub negotiated_prices: Vec<NegotiatedPrice>,
}

/// 🏥 A tax identifier and the NPIs billing under it.
#[derive(Debug, Deserialize, Default, Clone, PartialEq)]
pub struct ProviderGroup {
    #[serde(default, deserialize_with = "lenient_string_list")]
    pub npi: Vec<String>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub tin: Tin,
}

#[derive(Debug, Deserialize, Default, Clone, PartialEq)]
pub struct Tin {
    #[serde(rename = "type", default, deserialize_with = "lenient_string_or_empty")]
    pub tin_type: String,
    #[serde(default, deserialize_with = "lenient_string_or_empty")]
    pub value: String,
}

/// 🏷️ One price. `negotiated_rate` stays raw here; the flattener decides if it's a number.
#[derive(Debug, Deserialize, Default, Clone)]
pub struct NegotiatedPrice {
    #[serde(default, deserialize_with = "lenient_string")]
    pub negotiated_type: Option<String>,
    #[serde(default)]
    pub negotiated_rate: Option<Value>,
    #[serde(default, deserialize_with = "lenient_string")]
    pub expiration_date: Option<String>,
    #[serde(default, deserialize_with = "lenient_string_list")]
    pub service_code: Vec<String>,
    #[serde(default, deserialize_with = "lenient_string")]
    pub billing_class: Option<String>,
    #[serde(default, deserialize_with = "lenient_string_list")]
    pub billing_code_modifier: Vec<String>,
}

/// 🔗 One element of the top-level `provider_references` array.
///
/// Usually `{ provider_group_id, location }`. Some payers inline the groups instead of
/// (or next to) the location, in which case no fetch is ever needed.
#[derive(Debug, Deserialize, Default, Clone)]
pub struct ReferenceEntry {
    #[serde(default, deserialize_with = "reference_id")]
    pub provider_group_id: Option<String>,
    #[serde(default, deserialize_with = "lenient_string")]
    pub location: Option<String>,
    #[serde(default)]
    pub provider_groups: Option<Vec<ProviderGroup>>,
}

/// 🔢 Render a JSON number the way a human would write an id: `7.0` → `"7"`.
pub(crate) fn normalize_number(number: &serde_json::Number) -> String {
    if number.is_i64() || number.is_u64() {
        return number.to_string();
    }
    match number.as_f64() {
        Some(f) if f.is_finite() && f.fract() == 0.0 && f.abs() < 1e15 => format!("{f:.0}"),
        _ => number.to_string(),
    }
}

/// Strings stay strings (trimmed), numbers become strings, everything else is nothing.
pub(crate) fn scalar_to_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => {
            let trimmed = s.trim();
            (!trimmed.is_empty()).then(|| trimmed.to_string())
        }
        Value::Number(n) => Some(normalize_number(n)),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

/// 🪪 A reference id may be a scalar or `{ "provider_group_id": scalar }`.
pub(crate) fn reference_id_from_value(value: &Value) -> Option<String> {
    match value {
        Value::Object(map) => map.get("provider_group_id").and_then(scalar_to_string),
        other => scalar_to_string(other),
    }
}

pub(crate) fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de> + Default,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

fn lenient_string<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(value.as_ref().and_then(scalar_to_string))
}

fn lenient_string_or_empty<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(lenient_string(deserializer)?.unwrap_or_default())
}

pub(crate) fn lenient_string_list<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(match value {
        Some(Value::Array(items)) => items.iter().filter_map(scalar_to_string).collect(),
        Some(scalar) => scalar_to_string(&scalar).into_iter().collect(),
        None => Vec::new(),
    })
}

fn reference_id<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(value.as_ref().and_then(reference_id_from_value))
}

fn reference_ids<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(match value {
        Some(Value::Array(items)) => items.iter().filter_map(reference_id_from_value).collect(),
        Some(single) => reference_id_from_value(&single).into_iter().collect(),
        None => Vec::new(),
    })
}
