//! 🎬 The Supervisor: one run, start to finish.
//!
//! ```text
//!   validate config ─▶ build store ─▶ probe (pick delivery) ─▶ open input
//!        │
//!        ▼  main pass (sequential, input order)
//!   Reference ─▶ index            Record ─▶ parse ─▶ route ─▶ flatten
//!                                                   ├─ inline rows ─▶ writer pool
//!                                                   └─ reference rates ─▶ pending spill (NDJSON in work_dir)
//!        │
//!        ▼  after the last event
//!   index.csv ─▶ resolve ids ─▶ replay pending rates ─▶ close all parts
//!   ─▶ unresolved log ─▶ (provider_groups.csv) ─▶ await uploads ─▶ manifest ─▶ _SUCCESS?
//! ```
//!
//! The main pass never runs two records at once. Part numbers depend on the order keys
//! are seen, and the input cannot be rewound, so there is nothing to gain from it.
//!
//! On a fatal error (broken input, dead decompressor, local disk trouble) the supervisor
//! closes what is open, waits for uploads already queued, and returns the error. No
//! manifest, no marker: a half-run must never look like a finished one.

mod pending_spill;

use std::collections::{BTreeSet, HashSet};
use std::time::Instant;

use anyhow::{Context, Result};
use serde::Serialize;
use tracing::{error, info, warn};

use crate::app_config::AppConfig;
use crate::backends::{DocumentEvent, DocumentStream, ObjectStore, ObjectStoreBackend};
use crate::common::{InNetworkRecord, ReferenceEntry};
use crate::delivery::ArtifactDelivery;
use crate::progress::RunProgress;
use crate::resolver::{
    FetcherBackend, HttpFetcher, ReferenceIndex, Resolution, ResolutionTable, Resolver,
    UnresolvedReason,
};
use crate::retry::RetryPolicy;
use crate::summary::{MANIFEST_NAME, Manifest, RunCounters, RunSummary, SUCCESS_MARKER_NAME};
use crate::transforms::flatten::{FlattenedRecord, fan_out, flatten};
use crate::transforms::{OUTPUT_COLUMNS, Router};
use crate::writer_pool::WriterPool;
use pending_spill::{PendingRateRef, PendingSpill};

pub const INDEX_NAME: &str = "provider_reference_index.csv";
pub const UNRESOLVED_LOG_NAME: &str = "unresolved_provider_references.csv";
pub const PROVIDER_GROUPS_NAME: &str = "provider_groups.csv";
const UNRESOLVED_COLUMNS: [&str; 3] = ["billing_code", "ref_id", "reason"];

#[derive(Debug, Serialize)]
struct UnresolvedRow<'a> {
    billing_code: &'a str,
    ref_id: &'a str,
    reason: &'static str,
}

/// 📦 Owns one run's configuration and, in tests, stand-in collaborators.
pub(crate) struct Supervisor {
    app_config: AppConfig,
    store_override: Option<ObjectStoreBackend>,
    fetcher_override: Option<FetcherBackend>,
}

impl Supervisor {
    pub(crate) fn new(app_config: AppConfig) -> Self {
        Self {
            app_config,
            store_override: None,
            fetcher_override: None,
        }
    }

    #[cfg(test)]
    pub(crate) fn with_store(mut self, store: ObjectStoreBackend) -> Self {
        self.store_override = Some(store);
        self
    }

    #[cfg(test)]
    pub(crate) fn with_fetcher(mut self, fetcher: FetcherBackend) -> Self {
        self.fetcher_override = Some(fetcher);
        self
    }

    /// 🚀 Run the whole thing. `Err` means fatal; undelivered artifacts are NOT errors,
    /// they show up in the summary and keep the marker away.
    pub(crate) async fn run(&self) -> Result<RunSummary> {
        let started = Instant::now();
        let config = &self.app_config;
        config.validate()?;

        let retry = RetryPolicy::new(&config.retry);
        let store = match &self.store_override {
            Some(store) => store.clone(),
            None => ObjectStoreBackend::from_config(&config.delivery.store, &retry)
                .await
                .context("💀 The object store client could not be built from [delivery.store].")?,
        };
        info!(destination = %store.describe(), prefix = %config.output.prefix, "🪣 destination ready");

        let delivery = ArtifactDelivery::new(
            store,
            &config.delivery,
            &config.output,
            retry.clone(),
            config.runtime.upload_concurrency,
        )
        .await?;
        delivery.remove(SUCCESS_MARKER_NAME).await;

        let mut stream = DocumentStream::open(&config.input)?;
        let mut run = RunState {
            router: Router::new(&config.routing),
            pool: WriterPool::new(
                delivery.clone(),
                config.runtime.max_open_sinks,
                config.runtime.flush_rows,
                config.rotation,
            ),
            delivery: delivery.clone(),
            progress: RunProgress::new(
                format!("📄 {}", config.input.file_name.display()),
                config.runtime.progress,
            ),
            index: ReferenceIndex::new(),
            counters: RunCounters::default(),
            pending: PendingSpill::new(&config.output.work_dir),
            requested: BTreeSet::new(),
            unresolved_rows: Vec::new(),
        };

        let outcome = match run.main_pass(&mut stream).await {
            // -- 🚪 close() joins the parse thread and reaps the decompressor before Phase 2
            Ok(()) => match stream.close().await {
                Ok(()) => run.finish_parts(self, retry).await,
                Err(e) => Err(e),
            },
            Err(e) => {
                if let Err(close_error) = stream.close().await {
                    warn!(error = %format!("{close_error:#}"), "⚠️ the input stream did not close cleanly either");
                }
                Err(e)
            }
        };

        if let Err(e) = outcome {
            run.progress.finish();
            error!(error = %format!("{e:#}"), "💀 run failed, flushing what is open before bailing");
            if let Err(close_error) = run.pool.close_all().await {
                warn!(error = %format!("{close_error:#}"), "⚠️ best-effort close failed too");
            }
            let report = delivery.finish().await;
            warn!(
                delivered = report.delivered.len(),
                undelivered = report.undelivered.len(),
                "⚠️ partial output left behind without a manifest"
            );
            return Err(e);
        }

        let report = delivery.finish().await;
        run.counters.rows_discarded = report.rows_discarded;
        run.counters.rows_emitted = run.pool.stats().rows_emitted;
        // -- 🧮 only rows that landed; a staged part that never uploaded doesn't count
        run.counters.rows_written = report.rows_delivered();
        run.progress.finish();

        let input = config.input.file_name.display().to_string();
        let manifest_bytes = Manifest {
            tool: "mrfx",
            version: env!("CARGO_PKG_VERSION"),
            input,
            destination: &report.destination,
            strategy: report.strategy,
            columns: &OUTPUT_COLUMNS,
            counters: &run.counters,
            part_counts: run.pool.part_counts(),
            peak_open_sinks: run.pool.stats().peak_open,
            evictions: run.pool.stats().evictions,
            delivered: &report.delivered,
            undelivered: &report.undelivered,
        }
        .to_json()?;
        let manifest_delivered = delivery.put_small(MANIFEST_NAME, manifest_bytes).await;

        let marker_written = if manifest_delivered && report.is_complete() {
            delivery.put_small(SUCCESS_MARKER_NAME, Vec::new()).await
        } else {
            warn!(
                undelivered = report.undelivered.len(),
                manifest_delivered, "⚠️ not writing the completion marker"
            );
            false
        };

        let report = delivery.finish().await;
        info!(
            records = run.counters.records_seen,
            rows = run.counters.rows_written,
            parts = run.pool.stats().parts_closed,
            complete = marker_written,
            "🏁 run finished"
        );

        Ok(RunSummary {
            counters: run.counters,
            pool: run.pool.stats().clone(),
            part_counts: run.pool.part_counts().clone(),
            delivery: report,
            manifest_delivered,
            marker_written,
            elapsed: started.elapsed(),
        })
    }
}

/// Everything one run accumulates along the way.
struct RunState {
    router: Router,
    pool: WriterPool,
    delivery: ArtifactDelivery,
    progress: RunProgress,
    index: ReferenceIndex,
    counters: RunCounters,
    pending: PendingSpill,
    requested: BTreeSet<String>,
    unresolved_rows: Vec<(String, String, UnresolvedReason)>,
}

impl RunState {
    /// 🚰 Consume every event in input order. Transport and parse failures surface after
    /// the last buffered event, through `next()`.
    async fn main_pass(&mut self, stream: &mut DocumentStream) -> Result<()> {
        while let Some(event) = stream.next().await? {
            match event {
                DocumentEvent::Reference(raw) => self.index_reference(raw.get()),
                DocumentEvent::Record(raw) => {
                    self.counters.records_seen += 1;
                    self.handle_record(raw.get()).await?;
                    self.progress
                        .record_seen(self.pool.stats().rows_emitted, self.pool.open_count());
                }
            }
        }
        self.counters.reference_entries_indexed = self.index.len() as u64;
        self.counters.reference_entries_duplicate = self.index.duplicates();
        self.counters.reference_entries_malformed += self.index.without_id();
        info!(
            records = self.counters.records_seen,
            kept = self.counters.records_kept,
            references = self.index.len(),
            pending_rates = self.pending.len(),
            "📚 main pass complete"
        );
        Ok(())
    }

    fn index_reference(&mut self, raw: &str) {
        match serde_json::from_str::<ReferenceEntry>(raw) {
            Ok(entry) => {
                self.index.insert(entry);
            }
            Err(e) => {
                self.counters.reference_entries_malformed += 1;
                warn!(error = %e, "⚠️ skipping a provider reference entry that does not parse");
            }
        }
    }

    async fn handle_record(&mut self, raw: &str) -> Result<()> {
        let record: InNetworkRecord = match serde_json::from_str(raw) {
            Ok(record) => record,
            Err(e) => {
                self.counters.records_malformed += 1;
                warn!(record = self.counters.records_seen, error = %e, "⚠️ skipping malformed record");
                return Ok(());
            }
        };
        let Some(key) = self.router.route(&record) else {
            self.counters.records_filtered += 1;
            return Ok(());
        };
        self.counters.records_kept += 1;

        let FlattenedRecord { context, rates } = flatten(&key, &record);
        for rate in rates {
            self.pool.write_rows(&key, rate.rows(&context)).await?;
            let ids = rate.references();
            if ids.is_empty() {
                continue;
            }
            self.counters.rates_with_references += 1;
            self.requested.extend(ids.iter().cloned());
            self.pending
                .push(PendingRateRef {
                    record_seq: self.counters.records_seen,
                    key: &key,
                    context: &context,
                    prices: &rate.into_prices(),
                    ids,
                })
                .await?;
        }
        self.pool.end_of_record(&key).await
    }

    /// 🔗 Everything after the main pass that still writes parts or small artifacts.
    async fn finish_parts(&mut self, supervisor: &Supervisor, retry: RetryPolicy) -> Result<()> {
        let config = &supervisor.app_config;
        self.delivery
            .put_small(INDEX_NAME, self.index.to_csv()?)
            .await;

        let table = self.resolve(supervisor, retry).await?;
        self.counters.absorb_resolver(table.stats());
        self.replay(&table).await?;
        self.pool.close_all().await?;

        let log = self.unresolved_log()?;
        self.counters.unresolved_log_rows = self.unresolved_rows.len() as u64;
        self.delivery.put_small(UNRESOLVED_LOG_NAME, log).await;

        if config.resolver.enabled && config.resolver.emit_provider_groups {
            self.delivery
                .put_small(PROVIDER_GROUPS_NAME, table.provider_groups_csv()?)
                .await;
        }
        Ok(())
    }

    async fn resolve(&mut self, supervisor: &Supervisor, retry: RetryPolicy) -> Result<ResolutionTable> {
        let config = &supervisor.app_config;
        let ids = std::mem::take(&mut self.requested);
        if ids.is_empty() {
            return Ok(ResolutionTable::default());
        }
        if !config.resolver.enabled {
            info!(ids = ids.len(), "🔕 reference resolution is disabled, logging every id as unresolved");
            return Ok(ResolutionTable::disabled(ids));
        }
        self.progress.phase(&format!("resolving {} provider references", ids.len()));
        let fetcher = match &supervisor.fetcher_override {
            Some(fetcher) => fetcher.clone(),
            None => FetcherBackend::Http(HttpFetcher::new(&config.resolver)?),
        };
        let resolver = Resolver::new(fetcher, retry, config.runtime.fetch_concurrency);
        let table = resolver.resolve(&self.index, ids).await;
        info!(
            resolved = table.stats().ids_resolved,
            unresolved = table.stats().ids_unresolved.values().sum::<u64>(),
            fetches = table.stats().fetch_attempts,
            "🔗 provider references resolved"
        );
        Ok(table)
    }

    /// 🔁 Feed resolved groups back through the same fan-out as inline data, in input
    /// order, one record at a time so rotation sees the same boundaries.
    async fn replay(&mut self, table: &ResolutionTable) -> Result<()> {
        let mut pending = self.pending.drain().await?;
        let mut current: Option<(u64, String)> = None;
        let mut logged: HashSet<String> = HashSet::new();

        while let Some(rate) = pending.next().await? {
            if current.as_ref().is_some_and(|(seq, _)| *seq != rate.record_seq) {
                if let Some((_, key)) = current.take() {
                    self.pool.end_of_record(&key).await?;
                }
                logged.clear();
            }
            current = Some((rate.record_seq, rate.key.clone()));

            for id in &rate.ids {
                match table.get(id) {
                    Some(Resolution::Groups(groups)) => {
                        self.pool
                            .write_rows(&rate.key, fan_out(&rate.context, groups, &rate.prices))
                            .await?;
                    }
                    Some(Resolution::Unresolved(reason)) => {
                        if logged.insert(id.clone()) {
                            self.unresolved_rows
                                .push((rate.context.billing_code.clone(), id.clone(), *reason));
                        }
                    }
                    None => {
                        if logged.insert(id.clone()) {
                            self.unresolved_rows.push((
                                rate.context.billing_code.clone(),
                                id.clone(),
                                UnresolvedReason::NotIndexed,
                            ));
                        }
                    }
                }
            }
        }
        if let Some((_, key)) = current {
            self.pool.end_of_record(&key).await?;
        }
        Ok(())
    }

    fn unresolved_log(&self) -> Result<Vec<u8>> {
        let mut writer = csv::WriterBuilder::new()
            .has_headers(false)
            .from_writer(Vec::new());
        writer.write_record(UNRESOLVED_COLUMNS)?;
        for (billing_code, ref_id, reason) in &self.unresolved_rows {
            writer.serialize(UnresolvedRow {
                billing_code,
                ref_id,
                reason: reason.as_str(),
            })?;
        }
        writer
            .into_inner()
            .context("💀 the unresolved log refused to leave the csv writer")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::InMemoryStore;
    use crate::delivery::DeliveryStrategy;
    use std::path::Path;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const GROUP_TWO_NPIS: &str = r#"{"npi": [1111111111, "2222222222"], "tin": {"type": "ein", "value": "11-1111111"}}"#;
    const PRICE: &str = r#"{"negotiated_type": "negotiated", "negotiated_rate": 125.5, "expiration_date": "9999-12-31", "service_code": ["11", "22"], "billing_class": "professional"}"#;

    fn inline_record(code: &str) -> String {
        format!(
            r#"{{"billing_code": "{code}", "billing_code_type": "CPT", "negotiation_arrangement": "ffs",
                "negotiated_rates": [{{"provider_groups": [{GROUP_TWO_NPIS}], "negotiated_prices": [{PRICE}]}}]}}"#
        )
    }

    fn reference_record(code: &str, id: &str) -> String {
        format!(
            r#"{{"billing_code": "{code}", "billing_code_type": "CPT", "negotiation_arrangement": "ffs",
                "negotiated_rates": [{{"provider_references": [{id}], "negotiated_prices": [{PRICE}]}}]}}"#
        )
    }

    fn document(records: &[String], references: &[String]) -> String {
        format!(
            r#"{{"reporting_entity_name": "Test Payer", "provider_references": [{}], "in_network": [{}]}}"#,
            references.join(","),
            records.join(",")
        )
    }

    fn config_for(input: &Path, work_dir: &Path, extra: &str) -> AppConfig {
        let text = format!(
            r#"
            {extra}

            [input]
            file_name = '{}'

            [output]
            prefix = "run"
            work_dir = '{}'

            [runtime]
            progress = false

            [retry]
            base_delay_ms = 1
            max_delay_ms = 2

            [delivery]
            store = "InMemory"
            "#,
            input.display(),
            work_dir.display()
        );
        toml::from_str(&text).expect("💀 test config should parse")
    }

    struct Harness {
        _dir: tempfile::TempDir,
        store: InMemoryStore,
        config: AppConfig,
    }

    impl Harness {
        fn new(json: &str, extra: &str) -> Self {
            let dir = tempfile::tempdir().expect("💀 tempdir");
            let input = dir.path().join("in_network.json");
            std::fs::write(&input, json).expect("💀 write input");
            let work_dir = dir.path().join("work");
            let config = config_for(&input, &work_dir, extra);
            Self {
                _dir: dir,
                store: InMemoryStore::new(),
                config,
            }
        }

        fn supervisor(&self) -> Supervisor {
            Supervisor::new(self.config.clone())
                .with_store(ObjectStoreBackend::InMemory(self.store.clone()))
        }

        async fn text(&self, key: &str) -> String {
            let bytes = self
                .store
                .object(key)
                .await
                .unwrap_or_else(|| panic!("💀 expected '{key}' in the store"));
            String::from_utf8(bytes).expect("💀 artifacts are utf8")
        }
    }

    #[tokio::test]
    async fn the_one_where_two_records_make_four_rows() {
        let harness = Harness::new(&document(&[inline_record("100"), inline_record("200")], &[]), "");
        let summary = harness.supervisor().run().await.expect("💀 run should succeed");

        assert_eq!(summary.counters.records_seen, 2);
        assert_eq!(summary.counters.records_kept, 2);
        assert_eq!(summary.counters.rows_written, 4);
        assert!(summary.is_complete());

        let first = harness.text("run/in_network_100.csv").await;
        assert_eq!(
            first,
            "npi,tin_type,tin_value,negotiated_rate,expiration_date,service_code,billing_code,billing_code_type,negotiation_arrangement,negotiated_type,billing_class,billing_code_modifier\n\
             1111111111,ein,11-1111111,125.5,9999-12-31,11|22,100,CPT,ffs,negotiated,professional,\n\
             2222222222,ein,11-1111111,125.5,9999-12-31,11|22,100,CPT,ffs,negotiated,professional,\n"
        );
        assert_eq!(harness.text("run/in_network_200.csv").await.lines().count(), 3);
        assert!(harness.store.object("run/_SUCCESS").await.is_some());
        assert!(harness.store.object("run/manifest.json").await.is_some());
        assert!(harness.store.object("run/provider_reference_index.csv").await.is_some());
    }

    #[tokio::test]
    async fn the_one_where_a_key_comes_back_and_gets_part_one() {
        let harness = Harness::new(
            &document(&[inline_record("100"), inline_record("200"), inline_record("100")], &[]),
            "",
        );
        let summary = harness.supervisor().run().await.expect("💀 run should succeed");

        assert!(harness.store.object("run/in_network_100.csv").await.is_some());
        assert!(harness.store.object("run/in_network_100.part1.csv").await.is_some());
        assert_eq!(summary.part_counts.get("100"), Some(&2));
        assert_eq!(summary.part_counts.get("200"), Some(&1));
    }

    #[tokio::test]
    async fn the_one_where_an_unknown_reference_goes_to_the_log_and_not_the_rows() {
        let harness = Harness::new(&document(&[reference_record("100", r#""X""#)], &[]), "");
        let summary = harness.supervisor().run().await.expect("💀 run should succeed");

        assert_eq!(
            harness.text("run/unresolved_provider_references.csv").await,
            "billing_code,ref_id,reason\n100,X,not_indexed\n"
        );
        assert_eq!(summary.counters.rows_written, 0);
        assert!(harness.store.object("run/in_network_100.csv").await.is_none());
        assert_eq!(
            summary.counters.ids_unresolved.get(&UnresolvedReason::NotIndexed),
            Some(&1)
        );
    }

    #[tokio::test]
    async fn the_one_where_a_flaky_location_still_yields_the_inline_rows() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/groups/7"))
            .respond_with(ResponseTemplate::new(500))
            .up_to_n_times(2)
            .expect(2)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/groups/7"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_string(format!(r#"{{"provider_groups": [{GROUP_TWO_NPIS}]}}"#)),
            )
            .expect(1)
            .mount(&server)
            .await;

        let reference = format!(
            r#"{{"provider_group_id": 7, "location": "{}/groups/7"}}"#,
            server.uri()
        );
        let resolved = Harness::new(&document(&[reference_record("100", "7")], &[reference]), "");
        let summary = resolved.supervisor().run().await.expect("💀 resolved run");

        let inline = Harness::new(&document(&[inline_record("100")], &[]), "");
        inline.supervisor().run().await.expect("💀 inline run");

        assert_eq!(
            resolved.text("run/in_network_100.csv").await,
            inline.text("run/in_network_100.csv").await
        );
        assert_eq!(summary.counters.fetch_attempts, 3);
        assert_eq!(summary.counters.ids_resolved, 1);
        assert!(summary.is_complete());
        // -- wiremock checks the `.expect(..)` counts when the server drops
    }

    #[tokio::test]
    async fn the_one_where_many_rates_share_one_reference_and_one_fetch() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/groups/7"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_string(format!(r#"{{"provider_groups": [{GROUP_TWO_NPIS}]}}"#)),
            )
            .expect(1)
            .mount(&server)
            .await;
        let reference = format!(
            r#"{{"provider_group_id": 7, "location": "{}/groups/7"}}"#,
            server.uri()
        );
        let records: Vec<String> = (0..5).map(|_| reference_record("100", "7")).collect();
        let harness = Harness::new(&document(&records, &[reference]), "");
        let summary = harness.supervisor().run().await.expect("💀 run");
        assert_eq!(summary.counters.rates_with_references, 5);
        assert_eq!(summary.counters.rows_written, 10);
        assert_eq!(summary.counters.fetch_attempts, 1);
    }

    #[tokio::test]
    async fn the_one_where_inline_groups_in_the_index_need_no_network() {
        let reference = format!(r#"{{"provider_group_id": "7", "provider_groups": [{GROUP_TWO_NPIS}]}}"#);
        let harness = Harness::new(&document(&[reference_record("100", "7")], &[reference]), "");
        let fetcher = crate::resolver::InMemoryFetcher::default();
        let summary = harness
            .supervisor()
            .with_fetcher(FetcherBackend::InMemory(fetcher.clone()))
            .run()
            .await
            .expect("💀 run");
        assert_eq!(summary.counters.rows_written, 2);
        assert_eq!(fetcher.attempts(), 0);
    }

    #[tokio::test]
    async fn the_one_where_resolution_is_off_and_every_id_says_so() {
        let harness = Harness::new(
            &document(&[reference_record("100", "7")], &[r#"{"provider_group_id": 7, "location": "http://127.0.0.1:9/x"}"#.to_string()]),
            "[resolver]\nenabled = false",
        );
        let summary = harness.supervisor().run().await.expect("💀 run");
        assert_eq!(
            harness.text("run/unresolved_provider_references.csv").await,
            "billing_code,ref_id,reason\n100,7,resolution_disabled\n"
        );
        assert_eq!(summary.counters.fetch_attempts, 0);
    }

    #[tokio::test]
    async fn the_one_where_hcpcs_and_garbage_are_counted_not_written() {
        let records = vec![
            inline_record("100"),
            r#"{"billing_code": "J1234", "billing_code_type": "HCPCS", "negotiated_rates": []}"#.to_string(),
            r#"{"billing_code": "300", "billing_code_type": "CPT", "negotiated_rates": "oops"}"#.to_string(),
        ];
        let harness = Harness::new(&document(&records, &[]), "");
        let summary = harness.supervisor().run().await.expect("💀 run");
        assert_eq!(summary.counters.records_seen, 3);
        assert_eq!(summary.counters.records_kept, 1);
        assert_eq!(summary.counters.records_filtered, 1);
        assert_eq!(summary.counters.records_malformed, 1);
        assert_eq!(summary.part_counts.len(), 1);
    }

    #[tokio::test]
    async fn the_one_where_a_truncated_file_leaves_no_manifest_behind() {
        let mut json = document(&[inline_record("100"), inline_record("200")], &[]);
        json.truncate(json.len() - 40);
        let harness = Harness::new(&json, "");
        let err = harness.supervisor().run().await.expect_err("💀 broken JSON is fatal");

        assert!(
            err.chain()
                .any(|cause| matches!(cause.downcast_ref::<crate::MrfxError>(), Some(crate::MrfxError::MalformedDocument(_)))),
            "expected a malformed document error, got {err:#}"
        );
        assert!(harness.store.object("run/manifest.json").await.is_none());
        assert!(harness.store.object("run/_SUCCESS").await.is_none());
        // -- the first record was complete and its part was flushed on the way out
        assert!(harness.store.object("run/in_network_100.csv").await.is_some());
    }

    #[tokio::test]
    async fn the_one_where_an_upload_that_never_lands_keeps_the_marker_away() {
        let harness = Harness::new(
            &document(&[inline_record("100"), inline_record("200")], &[]),
            "",
        );
        let mut config = harness.config.clone();
        config.delivery.force_fallback = true;
        harness.store.fail_puts("in_network_100", u32::MAX).await;

        let summary = Supervisor::new(config.clone())
            .with_store(ObjectStoreBackend::InMemory(harness.store.clone()))
            .run()
            .await
            .expect("💀 undelivered artifacts are not fatal");

        assert_eq!(summary.delivery.strategy, DeliveryStrategy::Fallback);
        assert!(!summary.is_complete());
        assert!(summary.manifest_delivered);
        assert_eq!(summary.delivery.undelivered.len(), 1);
        let kept = summary.delivery.undelivered[0]
            .local_path
            .clone()
            .expect("💀 the staged copy should be reported");
        assert!(kept.exists());
        assert!(harness.store.object("run/in_network_200.csv").await.is_some());
        assert!(harness.store.object("run/_SUCCESS").await.is_none());

        let manifest: serde_json::Value =
            serde_json::from_str(&harness.text("run/manifest.json").await).expect("💀 manifest json");
        assert_eq!(manifest["undelivered"][0]["key"], "run/in_network_100.csv");

        // -- 🧮 four rows went into parts, only the two in the part that landed count as written
        assert_eq!(summary.counters.rows_emitted, 4);
        assert_eq!(summary.counters.rows_written, 2);
        assert_eq!(manifest["counters"]["rows_written"], 2);
    }

    #[tokio::test]
    async fn the_one_where_gzip_parts_unzip_to_the_plain_csv() {
        let json = document(&[inline_record("100")], &[]);
        let plain = Harness::new(&json, "");
        plain.supervisor().run().await.expect("💀 plain run");

        let zipped = Harness::new(&json, "");
        let mut config = zipped.config.clone();
        config.output.compression = crate::composers::OutputCompression::Gzip;
        let summary = Supervisor::new(config)
            .with_store(ObjectStoreBackend::InMemory(zipped.store.clone()))
            .run()
            .await
            .expect("💀 gzip run");
        assert!(summary.is_complete());
        assert!(zipped.store.object("run/in_network_100.csv").await.is_none());

        let bytes = zipped
            .store
            .object("run/in_network_100.csv.gz")
            .await
            .expect("💀 the gzip part should be there");
        let mut unzipped = String::new();
        std::io::Read::read_to_string(&mut flate2::read::GzDecoder::new(bytes.as_slice()), &mut unzipped)
            .expect("💀 a valid gzip stream");
        assert_eq!(unzipped, plain.text("run/in_network_100.csv").await);
    }

    #[tokio::test]
    async fn the_one_where_parked_rates_leave_no_file_in_the_work_dir() {
        let reference = format!(r#"{{"provider_group_id": "7", "provider_groups": [{GROUP_TWO_NPIS}]}}"#);
        let records: Vec<String> = (0..3).map(|_| reference_record("100", "7")).collect();
        let harness = Harness::new(&document(&records, &[reference]), "");
        let summary = harness.supervisor().run().await.expect("💀 run");
        assert_eq!(summary.counters.rates_with_references, 3);
        assert_eq!(summary.counters.rows_written, 6);

        let leftovers: Vec<_> = std::fs::read_dir(&harness.config.output.work_dir)
            .map(|entries| {
                entries
                    .filter_map(|entry| entry.ok())
                    .filter(|entry| entry.file_name().to_string_lossy().starts_with(".pending-rates"))
                    .collect()
            })
            .unwrap_or_default();
        assert!(leftovers.is_empty(), "parked rates outlived the run: {leftovers:?}");
    }

    #[tokio::test]
    async fn the_one_where_running_twice_gives_the_same_answer() {
        let json = document(
            &[inline_record("100"), inline_record("200"), inline_record("100")],
            &[],
        );
        let harness = Harness::new(&json, "");
        let first = harness.supervisor().run().await.expect("💀 first run");
        let keys_after_first = harness.store.keys().await;
        let second = harness.supervisor().run().await.expect("💀 second run");
        assert_eq!(first.counters, second.counters);
        assert_eq!(first.part_counts, second.part_counts);
        assert_eq!(keys_after_first, harness.store.keys().await);
    }

    #[tokio::test]
    async fn the_one_where_a_bad_config_stops_before_the_input_is_touched() {
        let harness = Harness::new("this file is never read", "");
        let mut config = harness.config.clone();
        config.runtime.max_open_sinks = 0;
        let err = Supervisor::new(config)
            .with_store(ObjectStoreBackend::InMemory(harness.store.clone()))
            .run()
            .await
            .expect_err("💀 zero capacity is refused");
        assert!(matches!(err.downcast_ref::<crate::MrfxError>(), Some(crate::MrfxError::Config(_))));
        assert!(harness.store.keys().await.is_empty());
    }
}
