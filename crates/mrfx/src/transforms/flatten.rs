//! 🥞 Record Flattener: one record in, a stack of pancakes out.
//!
//! Row shape per rate: for each provider group, for each price, for each NPI.
//! Count = prices × Σ(npis per group). Zero on either side means zero rows, no drama.
//!
//! Rows borrow from the record context, the prepared prices, and the groups. Nothing is
//! cloned per row; the CSV encoder serializes each one straight into its buffer.
//!
//! 🧠 Knowledge graph: `fan_out` is the single cross-product. Inline groups go through it
//! during the main pass; groups fetched by the resolver go through the very same function
//! during replay. Same input, same rows. The resolver can't sneak in a different shape.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

use crate::common::{InNetworkRecord, NegotiatedPrice, ProviderGroup};

/// 📋 Output column order. Consumers depend on it. Don't get creative.
pub const OUTPUT_COLUMNS: [&str; 12] = [
    "npi",
    "tin_type",
    "tin_value",
    "negotiated_rate",
    "expiration_date",
    "service_code",
    "billing_code",
    "billing_code_type",
    "negotiation_arrangement",
    "negotiated_type",
    "billing_class",
    "billing_code_modifier",
];

/// Separator for multi-valued fields.
pub const JOIN_DELIMITER: char = '|';
const ESCAPE: char = '\\';

/// 🏷️ Record-level metadata copied onto every row.
/// Serializable because reference rates park it on disk until replay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordContext {
    pub billing_code: String,
    pub billing_code_type: String,
    pub negotiation_arrangement: String,
}

/// 💸 A price with its rate parsed and its lists joined, ready to be stamped onto rows.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PreparedPrice {
    pub negotiated_rate: Option<f64>,
    pub expiration_date: String,
    pub service_code: String,
    pub negotiated_type: String,
    pub billing_class: String,
    pub billing_code_modifier: String,
}

/// 🧾 One output row. Field order is `OUTPUT_COLUMNS` order.
#[derive(Debug, Serialize, PartialEq)]
pub struct FlatRow<'a> {
    pub npi: &'a str,
    pub tin_type: &'a str,
    pub tin_value: &'a str,
    pub negotiated_rate: Option<f64>,
    pub expiration_date: &'a str,
    pub service_code: &'a str,
    pub billing_code: &'a str,
    pub billing_code_type: &'a str,
    pub negotiation_arrangement: &'a str,
    pub negotiated_type: &'a str,
    pub billing_class: &'a str,
    pub billing_code_modifier: &'a str,
}

/// A record after flattening: its context plus one prepared entry per rate.
#[derive(Debug)]
pub struct FlattenedRecord<'r> {
    pub context: RecordContext,
    pub rates: Vec<PreparedRate<'r>>,
}

/// One rate with prices prepared. Groups and references still borrow from the record.
#[derive(Debug)]
pub struct PreparedRate<'r> {
    groups: &'r [ProviderGroup],
    references: &'r [String],
    prices: Vec<PreparedPrice>,
}

impl<'r> PreparedRate<'r> {
    /// Lazy rows for the inline groups of this rate.
    pub fn rows<'a>(&'a self, context: &'a RecordContext) -> impl Iterator<Item = FlatRow<'a>> + 'a {
        fan_out(context, self.groups, &self.prices)
    }

    /// Reference ids that still need resolving. Empty when the rate is fully inline.
    pub fn references(&self) -> &'r [String] {
        self.references
    }

    /// Hand the prepared prices over for replay. The groups stay behind with the record.
    pub fn into_prices(self) -> Vec<PreparedPrice> {
        self.prices
    }
}

/// 🥞 Flatten `record` under partition key `key` (the router's normalized billing code).
pub fn flatten<'r>(key: &str, record: &'r InNetworkRecord) -> FlattenedRecord<'r> {
    let context = RecordContext {
        billing_code: key.to_string(),
        billing_code_type: trimmed(record.billing_code_type.as_deref()),
        negotiation_arrangement: trimmed(record.negotiation_arrangement.as_deref()),
    };
    let rates = record
        .negotiated_rates
        .iter()
        .map(|rate| PreparedRate {
            // -- 🪢 borrowed, not cloned. the record outlives every row we make from it
            groups: &rate.provider_groups,
            references: &rate.provider_references,
            prices: rate
                .negotiated_prices
                .iter()
                // -- 🍳 prices get cooked once per rate, then served to every NPI
                .map(|price| prepare_price(key, price))
                .collect(),
        })
        .collect();
    FlattenedRecord { context, rates }
}

/// ✖️ The cross product. Order: group, then price, then NPI.
pub fn fan_out<'a>(
    context: &'a RecordContext,
    groups: &'a [ProviderGroup],
    prices: &'a [PreparedPrice],
) -> impl Iterator<Item = FlatRow<'a>> + 'a {
    // -- 🪆 three nested loops wearing an iterator trench coat
    groups.iter().flat_map(move |group| {
        prices.iter().flat_map(move |price| {
            group.npi.iter().map(move |npi| FlatRow {
                npi,
                tin_type: &group.tin.tin_type,
                tin_value: &group.tin.value,
                negotiated_rate: price.negotiated_rate,
                expiration_date: &price.expiration_date,
                service_code: &price.service_code,
                billing_code: &context.billing_code,
                billing_code_type: &context.billing_code_type,
                negotiation_arrangement: &context.negotiation_arrangement,
                negotiated_type: &price.negotiated_type,
                billing_class: &price.billing_class,
                billing_code_modifier: &price.billing_code_modifier,
            })
        })
    })
}

/// 🔗 Join with `|`. A literal `|` or `\` inside a value gets a backslash in front,
/// so `["a|b", "c"]` becomes `a\|b|c` and splits back unambiguously.
pub fn join_multi(values: &[String]) -> String {
    let mut joined = String::new();
    for (i, value) in values.iter().enumerate() {
        if i > 0 {
            joined.push(JOIN_DELIMITER);
        }
        for c in value.chars() {
            // -- 🥷 a pipe inside a value is an imposter. give it a backslash disguise
            if c == JOIN_DELIMITER || c == ESCAPE {
                joined.push(ESCAPE);
            }
            joined.push(c);
        }
    }
    joined
}

fn prepare_price(key: &str, price: &NegotiatedPrice) -> PreparedPrice {
    PreparedPrice {
        negotiated_rate: parse_rate(key, price.negotiated_rate.as_ref()),
        expiration_date: trimmed(price.expiration_date.as_deref()),
        service_code: join_multi(&price.service_code),
        negotiated_type: trimmed(price.negotiated_type.as_deref()),
        billing_class: trimmed(price.billing_class.as_deref()),
        billing_code_modifier: join_multi(&price.billing_code_modifier),
    }
}

/// 🧮 Numbers stay numbers, numeric strings become numbers, anything else becomes null + a warning.
fn parse_rate(key: &str, raw: Option<&Value>) -> Option<f64> {
    match raw {
        None | Some(Value::Null) => None,
        Some(Value::Number(n)) => n.as_f64(),
        Some(Value::String(s)) => match s.trim().parse::<f64>() {
            Ok(rate) if rate.is_finite() => Some(rate),
            _ => {
                warn!(key, raw = %s, "⚠️ negotiated_rate is not numeric, writing it as null");
                None
            }
        },
        Some(other) => {
            warn!(key, raw = %other, "⚠️ negotiated_rate is not numeric, writing it as null");
            None
        }
    }
}

/// ✂️ Missing and whitespace-only become the same empty string. CSV can't tell them apart anyway.
fn trimmed(value: Option<&str>) -> String {
    value.map(str::trim).unwrap_or_default().to_string()
}
