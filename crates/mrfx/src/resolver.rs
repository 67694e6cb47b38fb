//! 🔗 Reference resolver: provider groups that live somewhere else.
//!
//! 🧠 Knowledge graph:
//! - Phase 1 (`index`): `provider_references` entries are indexed during the main pass.
//!   First id wins, duplicates are counted, the index is delivered as a CSV.
//! - Phase 2 (`Resolver::resolve`): after the main pass, every id a kept rate pointed at
//!   is looked up. Not indexed → unresolved. Inline groups → resolved on the spot.
//!   A location → fetched, once per distinct location, `fetch_concurrency` at a time,
//!   through the shared `RetryPolicy`.
//! - Payloads are normalized through `ReferencePayload`, an untagged enum with three
//!   accepted shapes. Anything else is `unexpected_shape`.
//!
//! ```text
//!   ids ──dedup──▶ index lookup ──▶ not_indexed
//!                       │──────────▶ inline groups ✅
//!                       └──location──▶ group ids by location ──▶ buffer_unordered(fetch)
//!                                                                  │── payload ok ✅
//!                                                                  │── bad shape ──▶ unexpected_shape
//!                                                                  └── gave up ───▶ fetch_failed
//! ```
//!
//! Resolution order is whatever the network feels like. The rows are not: they are
//! produced later, in input order, from the resolved groups.

mod fetch;
mod index;

pub use fetch::{FetcherBackend, HttpFetcher, InMemoryFetcher, ReferenceFetcher};
pub use index::{INDEX_COLUMNS, IndexedReference, ReferenceIndex};

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use anyhow::{Context, Result};
use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::common::{ProviderGroup, Tin};
use crate::retry::RetryPolicy;

/// 🔧 `[resolver]`
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct ResolverConfig {
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    /// Also deliver every resolved group as `provider_groups.csv`.
    #[serde(default)]
    pub emit_provider_groups: bool,
}

fn default_enabled() -> bool {
    true
}

fn default_connect_timeout_secs() -> u64 {
    10
}

fn default_request_timeout_secs() -> u64 {
    60
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            connect_timeout_secs: default_connect_timeout_secs(),
            request_timeout_secs: default_request_timeout_secs(),
            emit_provider_groups: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UnresolvedReason {
    NotIndexed,
    FetchFailed,
    UnexpectedShape,
    ResolutionDisabled,
}

impl UnresolvedReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            UnresolvedReason::NotIndexed => "not_indexed",
            UnresolvedReason::FetchFailed => "fetch_failed",
            UnresolvedReason::UnexpectedShape => "unexpected_shape",
            UnresolvedReason::ResolutionDisabled => "resolution_disabled",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Resolution {
    Groups(Arc<Vec<ProviderGroup>>),
    Unresolved(UnresolvedReason),
}

/// 📦 The three shapes a location is allowed to answer with.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum ReferencePayload {
    Wrapped { provider_groups: Vec<ProviderGroup> },
    Many(Vec<ProviderGroup>),
    Single(SingleGroup),
}

/// A bare group object. `npi` must be present, or it's just some object.
// -- 🎭 without the required npi, untagged would happily accept `{"error": "nope"}` as a group
#[derive(Debug, Deserialize)]
pub struct SingleGroup {
    #[serde(deserialize_with = "crate::common::lenient_string_list")]
    npi: Vec<String>,
    #[serde(default, deserialize_with = "crate::common::null_as_default")]
    tin: Tin,
}

impl ReferencePayload {
    pub fn into_groups(self) -> Vec<ProviderGroup> {
        match self {
            ReferencePayload::Wrapped { provider_groups } => provider_groups,
            ReferencePayload::Many(groups) => groups,
            ReferencePayload::Single(SingleGroup { npi, tin }) => vec![ProviderGroup { npi, tin }],
        }
    }
}

#[derive(Debug, Default, Clone, PartialEq, Serialize)]
pub struct ResolverStats {
    pub ids_requested: u64,
    pub ids_resolved: u64,
    pub ids_unresolved: BTreeMap<UnresolvedReason, u64>,
    pub locations_fetched: u64,
    pub fetch_attempts: u64,
}

/// 📒 Phase 2 output: one outcome per requested id.
#[derive(Debug, Default)]
pub struct ResolutionTable {
    outcomes: HashMap<String, Resolution>,
    stats: ResolverStats,
}

pub const PROVIDER_GROUP_COLUMNS: [&str; 4] = ["provider_group_id", "npi", "tin_type", "tin_value"];

#[derive(Serialize)]
struct ProviderGroupRow<'a> {
    provider_group_id: &'a str,
    npi: &'a str,
    tin_type: &'a str,
    tin_value: &'a str,
}

impl ResolutionTable {
    /// Every id gets `resolution_disabled`; nothing is fetched.
    pub fn disabled<I: IntoIterator<Item = String>>(ids: I) -> Self {
        let mut table = Self::default();
        for id in ids.into_iter().collect::<BTreeSet<_>>() {
            table.record(id, Resolution::Unresolved(UnresolvedReason::ResolutionDisabled));
        }
        table
    }

    pub fn get(&self, id: &str) -> Option<&Resolution> {
        self.outcomes.get(id)
    }

    pub fn stats(&self) -> &ResolverStats {
        &self.stats
    }

    fn record(&mut self, id: String, resolution: Resolution) {
        // -- 🧮 ids arrive deduped, so requested == resolved + every unresolved bucket
        self.stats.ids_requested += 1;
        match &resolution {
            Resolution::Groups(_) => self.stats.ids_resolved += 1,
            Resolution::Unresolved(reason) => {
                *self.stats.ids_unresolved.entry(*reason).or_insert(0) += 1
            }
        }
        self.outcomes.insert(id, resolution);
    }

    /// 🧾 `provider_group_id,npi,tin_type,tin_value`, one row per NPI, ids sorted.
    pub fn provider_groups_csv(&self) -> Result<Vec<u8>> {
        let mut writer = csv::WriterBuilder::new()
            .has_headers(false)
            .from_writer(Vec::new());
        writer.write_record(PROVIDER_GROUP_COLUMNS)?;
        let resolved: BTreeMap<&str, &Arc<Vec<ProviderGroup>>> = self
            .outcomes
            .iter()
            .filter_map(|(id, resolution)| match resolution {
                Resolution::Groups(groups) => Some((id.as_str(), groups)),
                Resolution::Unresolved(_) => None,
            })
            .collect();
        // -- 🗂️ BTreeMap: rows come out sorted by id
        for (id, groups) in resolved {
            for group in groups.iter() {
                for npi in &group.npi {
                    writer.serialize(ProviderGroupRow {
                        provider_group_id: id,
                        npi,
                        tin_type: &group.tin.tin_type,
                        tin_value: &group.tin.value,
                    })?;
                }
            }
        }
        writer
            .into_inner()
            .context("💀 the provider group table refused to leave the csv writer")
    }
}

/// 🕵️ Phase 2 driver. Holds the fetcher, the retry policy and the concurrency bound.
#[derive(Debug)]
pub struct Resolver {
    fetcher: FetcherBackend,
    retry: RetryPolicy,
    concurrency: usize,
}

impl Resolver {
    pub fn new(fetcher: FetcherBackend, retry: RetryPolicy, concurrency: usize) -> Self {
        Self {
            fetcher,
            retry,
            concurrency: concurrency.max(1),
        }
    }

    /// 🔍 Resolve `ids` against `index`. Each distinct id is decided once, each distinct
    /// location is fetched once, whatever the number of rates that pointed at it.
    pub async fn resolve<I>(&self, index: &ReferenceIndex, ids: I) -> ResolutionTable
    where
        I: IntoIterator<Item = String>,
    {
        let mut table = ResolutionTable::default();
        let mut by_location: BTreeMap<String, Vec<String>> = BTreeMap::new();

        for id in ids.into_iter().collect::<BTreeSet<_>>() {
            match index.get(&id) {
                None => table.record(id, Resolution::Unresolved(UnresolvedReason::NotIndexed)),
                Some(IndexedReference {
                    inline_groups: Some(groups),
                    ..
                }) => table.record(id, Resolution::Groups(groups.clone())),
                Some(IndexedReference {
                    location: Some(location),
                    ..
                }) => by_location.entry(location.clone()).or_default().push(id),
                // -- 🫥 indexed but neither a location nor groups: nothing to resolve it with
                Some(_) => table.record(id, Resolution::Unresolved(UnresolvedReason::NotIndexed)),
            }
        }

        if !by_location.is_empty() {
            info!(
                locations = by_location.len(),
                concurrency = self.concurrency,
                "📡 fetching provider reference payloads"
            );
        }

        // -- 📡 completion order is random; the table is keyed by id, so nobody downstream can tell
        let fetched: Vec<(Vec<String>, Resolution, u32)> = stream::iter(by_location)
            .map(|(location, ids)| async move {
                let (resolution, attempts) = self.fetch_location(&location).await;
                (ids, resolution, attempts)
            })
            .buffer_unordered(self.concurrency)
            .collect()
            .await;

        for (ids, resolution, attempts) in fetched {
            table.stats.locations_fetched += 1;
            table.stats.fetch_attempts += u64::from(attempts);
            // -- 🪞 an Arc clone: every id behind one location shares the same groups
            for id in ids {
                table.record(id, resolution.clone());
            }
        }

        table
    }

    async fn fetch_location(&self, location: &str) -> (Resolution, u32) {
        let fetcher = &self.fetcher;
        let outcome = self
            .retry
            .run(&format!("fetch {location}"), |_| fetcher.fetch(location))
            .await;
        match outcome {
            Ok((body, attempts)) => match serde_json::from_slice::<ReferencePayload>(&body) {
                Ok(payload) => (Resolution::Groups(Arc::new(payload.into_groups())), attempts),
                Err(e) => {
                    warn!(location, error = %e, "⚠️ reference payload has a shape nobody agreed to");
                    (Resolution::Unresolved(UnresolvedReason::UnexpectedShape), attempts)
                }
            },
            Err(e) => {
                warn!(location, error = %e, "⚠️ reference location could not be fetched");
                (Resolution::Unresolved(UnresolvedReason::FetchFailed), e.attempts())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::ReferenceEntry;
    use crate::retry::RetryConfig;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn quick_retry() -> RetryPolicy {
        RetryPolicy::new(&RetryConfig {
            max_retries: 3,
            base_delay_ms: 1,
            backoff: 1.5,
            max_delay_ms: 5,
        })
    }

    fn index_of(entries: &[&str]) -> ReferenceIndex {
        let mut index = ReferenceIndex::new();
        for json in entries {
            let entry: ReferenceEntry = serde_json::from_str(json).expect("💀 entry");
            index.insert(entry);
        }
        index
    }

    fn ids(values: &[&str]) -> Vec<String> {
        values.iter().map(|v| v.to_string()).collect()
    }

    #[test]
    fn the_one_where_all_three_payload_shapes_agree() {
        let wrapped: ReferencePayload =
            serde_json::from_str(r#"{"provider_groups": [{"npi": [1], "tin": {"type": "ein", "value": "x"}}]}"#)
                .expect("💀 wrapped");
        let many: ReferencePayload =
            serde_json::from_str(r#"[{"npi": [1], "tin": {"type": "ein", "value": "x"}}]"#).expect("💀 many");
        let single: ReferencePayload =
            serde_json::from_str(r#"{"npi": 1, "tin": {"type": "ein", "value": "x"}}"#).expect("💀 single");
        let expected = vec![ProviderGroup {
            npi: vec!["1".to_string()],
            tin: Tin {
                tin_type: "ein".to_string(),
                value: "x".to_string(),
            },
        }];
        assert_eq!(wrapped.into_groups(), expected);
        assert_eq!(many.into_groups(), expected);
        assert_eq!(single.into_groups(), expected);
    }

    #[test]
    fn the_one_where_a_random_object_is_not_a_payload() {
        assert!(serde_json::from_str::<ReferencePayload>(r#"{"version": "1.0"}"#).is_err());
        assert!(serde_json::from_str::<ReferencePayload>(r#""nope""#).is_err());
    }

    #[tokio::test]
    async fn the_one_where_many_rates_share_one_fetch() {
        let fetcher = InMemoryFetcher::new(HashMap::from([(
            "mem://groups/7".to_string(),
            br#"{"provider_groups": [{"npi": [1, 2], "tin": {"type": "ein", "value": "x"}}]}"#.to_vec(),
        )]));
        let resolver = Resolver::new(FetcherBackend::InMemory(fetcher.clone()), quick_retry(), 4);
        let index = index_of(&[r#"{"provider_group_id": 7, "location": "mem://groups/7"}"#]);

        let table = resolver.resolve(&index, ids(&["7", "7", "7", "7"])).await;

        assert_eq!(fetcher.attempts(), 1);
        assert_eq!(table.stats().ids_requested, 1);
        assert!(matches!(table.get("7"), Some(Resolution::Groups(groups)) if groups[0].npi.len() == 2));
    }

    #[tokio::test]
    async fn the_one_where_two_ids_share_a_location_and_a_payload() {
        let fetcher = InMemoryFetcher::new(HashMap::from([(
            "mem://shared".to_string(),
            br#"[{"npi": [1], "tin": {"type": "ein", "value": "x"}}]"#.to_vec(),
        )]));
        let resolver = Resolver::new(FetcherBackend::InMemory(fetcher.clone()), quick_retry(), 4);
        let index = index_of(&[
            r#"{"provider_group_id": 1, "location": "mem://shared"}"#,
            r#"{"provider_group_id": 2, "location": "mem://shared"}"#,
        ]);
        let table = resolver.resolve(&index, ids(&["1", "2"])).await;
        assert_eq!(fetcher.attempts(), 1);
        assert_eq!(table.stats().ids_resolved, 2);
    }

    #[tokio::test]
    async fn the_one_where_every_reason_shows_up() {
        let fetcher = InMemoryFetcher::new(HashMap::from([(
            "mem://weird".to_string(),
            br#"{"version": 2}"#.to_vec(),
        )]));
        let resolver = Resolver::new(FetcherBackend::InMemory(fetcher), quick_retry(), 2);
        let index = index_of(&[
            r#"{"provider_group_id": "inline", "provider_groups": [{"npi": [9], "tin": {"type": "npi", "value": "9"}}]}"#,
            r#"{"provider_group_id": "weird", "location": "mem://weird"}"#,
            r#"{"provider_group_id": "gone", "location": "mem://gone"}"#,
        ]);
        let table = resolver
            .resolve(&index, ids(&["inline", "weird", "gone", "ghost"]))
            .await;

        assert!(matches!(table.get("inline"), Some(Resolution::Groups(_))));
        assert_eq!(
            table.get("weird"),
            Some(&Resolution::Unresolved(UnresolvedReason::UnexpectedShape))
        );
        assert_eq!(
            table.get("gone"),
            Some(&Resolution::Unresolved(UnresolvedReason::FetchFailed))
        );
        assert_eq!(
            table.get("ghost"),
            Some(&Resolution::Unresolved(UnresolvedReason::NotIndexed))
        );
        assert_eq!(table.stats().ids_unresolved.values().sum::<u64>(), 3);
    }

    #[tokio::test]
    async fn the_one_where_two_500s_are_followed_by_a_200() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/groups/x"))
            .respond_with(ResponseTemplate::new(500))
            .up_to_n_times(2)
            .expect(2)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/groups/x"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_string(r#"{"provider_groups": [{"npi": [1], "tin": {"type": "ein", "value": "x"}}]}"#),
            )
            .expect(1)
            .mount(&server)
            .await;

        let fetcher = HttpFetcher::new(&ResolverConfig::default()).expect("💀 client");
        let resolver = Resolver::new(FetcherBackend::Http(fetcher), quick_retry(), 2);
        let entry = format!(
            r#"{{"provider_group_id": "X", "location": "{}/groups/x"}}"#,
            server.uri()
        );
        let index = index_of(&[entry.as_str()]);
        let table = resolver.resolve(&index, ids(&["X"])).await;

        assert!(matches!(table.get("X"), Some(Resolution::Groups(_))));
        assert_eq!(table.stats().fetch_attempts, 3);
    }

    #[test]
    fn the_one_where_resolution_is_switched_off() {
        let table = ResolutionTable::disabled(ids(&["a", "b", "a"]));
        assert_eq!(table.stats().ids_requested, 2);
        assert_eq!(
            table.get("a"),
            Some(&Resolution::Unresolved(UnresolvedReason::ResolutionDisabled))
        );
    }

    #[test]
    fn the_one_where_resolved_groups_become_a_table() {
        let mut table = ResolutionTable::default();
        table.record(
            "7".to_string(),
            Resolution::Groups(Arc::new(vec![ProviderGroup {
                npi: vec!["1".to_string(), "2".to_string()],
                tin: Tin {
                    tin_type: "ein".to_string(),
                    value: "x".to_string(),
                },
            }])),
        );
        table.record("8".to_string(), Resolution::Unresolved(UnresolvedReason::FetchFailed));
        let csv = String::from_utf8(table.provider_groups_csv().expect("💀 csv")).expect("💀 utf8");
        assert_eq!(csv, "provider_group_id,npi,tin_type,tin_value\n7,1,ein,x\n7,2,ein,x\n");
    }
}
