use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{Context, Result};
use serde::Serialize;
use tracing::trace;

use crate::common::{ProviderGroup, ReferenceEntry};

pub const INDEX_COLUMNS: [&str; 3] = ["provider_group_id", "location", "inline_groups"];

/// What the document said about one provider reference id.
#[derive(Debug, Clone, Default)]
pub struct IndexedReference {
    pub location: Option<String>,
    pub inline_groups: Option<Arc<Vec<ProviderGroup>>>,
}

/// 📇 Phase 1: id → where to find its groups. First occurrence of an id wins.
#[derive(Debug, Default)]
pub struct ReferenceIndex {
    entries: HashMap<String, IndexedReference>,
    order: Vec<String>,
    duplicates: u64,
    without_id: u64,
}

#[derive(Serialize)]
struct IndexRow<'a> {
    provider_group_id: &'a str,
    location: &'a str,
    inline_groups: usize,
}

impl ReferenceIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `true` when `entry` introduced a new id.
    pub fn insert(&mut self, entry: ReferenceEntry) -> bool {
        let Some(id) = entry.provider_group_id else {
            self.without_id += 1;
            return false;
        };
        // -- 🥇 first one wins; a later duplicate never overwrites what replay will see
        if self.entries.contains_key(&id) {
            trace!(id = %id, "🔁 duplicate reference id, keeping the first one");
            self.duplicates += 1;
            return false;
        }
        self.entries.insert(
            id.clone(),
            IndexedReference {
                location: entry.location,
                inline_groups: entry.provider_groups.map(Arc::new),
            },
        );
        self.order.push(id);
        true
    }

    pub fn get(&self, id: &str) -> Option<&IndexedReference> {
        self.entries.get(id)
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn duplicates(&self) -> u64 {
        self.duplicates
    }

    /// Entries that carried no usable id at all.
    pub fn without_id(&self) -> u64 {
        self.without_id
    }

    /// 🧾 `provider_group_id,location,inline_groups`, in first-seen order.
    pub fn to_csv(&self) -> Result<Vec<u8>> {
        let mut writer = csv::WriterBuilder::new()
            .has_headers(false)
            .from_writer(Vec::new());
        writer.write_record(INDEX_COLUMNS)?;
        for id in &self.order {
            let Some(entry) = self.entries.get(id) else {
                continue;
            };
            writer.serialize(IndexRow {
                provider_group_id: id,
                location: entry.location.as_deref().unwrap_or(""),
                inline_groups: entry.inline_groups.as_ref().map_or(0, |groups| groups.len()),
            })?;
        }
        writer
            .into_inner()
            .context("💀 the reference index refused to leave the csv writer")
    }
}
