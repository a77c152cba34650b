//! Multi-target orchestrator.
//!
//! Turns one free-text request ("these N profile URLs, this query type")
//! into N sequential pagination runs, a per-target report row persisted as
//! each target finishes, and an optional materialization pass at the end.

use std::sync::Arc;
use std::time::Duration;

use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::time::Instant;

use crate::config::RelayConfig;
use crate::error::{RelayError, RelayResult};
use crate::events::{EventBus, RelayEvent};
use crate::ledger::DedupLedger;
use crate::materialize::{MaterializeSummary, Materializer};
use crate::owner::OwnerRules;
use crate::pagination::{AggregationResult, PageSource, Paginator};
use crate::records::RunStore;
use crate::types::{format_hms, QueryTarget, TaggedItem};

/// One caller request: a query type plus its parameters, where
/// `params.url` holds the comma/newline separated target list.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunRequest {
    pub api_name: String,
    pub params: Map<String, Value>,
    /// Hand not-yet-recorded items to the materializer once all targets ran.
    #[serde(default)]
    pub materialize: bool,
}

impl RunRequest {
    pub fn new(api_name: impl Into<String>, params: Map<String, Value>) -> Self {
        Self {
            api_name: api_name.into(),
            params,
            materialize: false,
        }
    }
}

/// Per-target line of a run report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportRow {
    pub url: String,
    pub username: String,
    pub total: usize,
    /// Items already in the ledger.
    pub have: usize,
    pub nohave: usize,
    /// Wall time spent on this target, `HH:MM:SS`.
    pub time: String,
    pub pages: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Result of a whole run.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunReport {
    pub api_name: String,
    pub rows: Vec<ReportRow>,
    pub total_time: String,
    pub items: Vec<TaggedItem>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub materialization: Option<MaterializeSummary>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub materialization_error: Option<String>,
}

/// Split the free-text target field on commas and newlines.
pub fn parse_targets(text: &str) -> Vec<String> {
    text.split([',', '\n'])
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

pub struct Orchestrator {
    source: Arc<dyn PageSource>,
    ledger: Arc<dyn DedupLedger>,
    store: RunStore,
    config: RelayConfig,
    owner_rules: OwnerRules,
    events: Option<Arc<EventBus>>,
    materializer: Option<Arc<dyn Materializer>>,
}

impl Orchestrator {
    pub fn new(
        source: Arc<dyn PageSource>,
        ledger: Arc<dyn DedupLedger>,
        store: RunStore,
        config: RelayConfig,
    ) -> Self {
        Self {
            source,
            ledger,
            store,
            config,
            owner_rules: OwnerRules::default(),
            events: None,
            materializer: None,
        }
    }

    pub fn with_owner_rules(mut self, rules: OwnerRules) -> Self {
        self.owner_rules = rules;
        self
    }

    pub fn with_events(mut self, events: Arc<EventBus>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn with_materializer(mut self, materializer: Arc<dyn Materializer>) -> Self {
        self.materializer = Some(materializer);
        self
    }

    /// Run every target in `request`.
    ///
    /// Fails only on malformed input; per-target failures land in the
    /// target's report row.
    pub async fn run(&self, request: RunRequest) -> RelayResult<RunReport> {
        let api_name = request.api_name.as_str();
        let urls = match request.params.get("url") {
            Some(Value::String(text)) => parse_targets(text),
            Some(_) => return Err(RelayError::InvalidInput("url must be a string".into())),
            None => return Err(RelayError::InvalidInput("missing url parameter".into())),
        };
        if urls.is_empty() {
            return Err(RelayError::NoTargets);
        }

        let randomized = self.config.profiles.get(api_name).randomize_order;
        let urls = if randomized {
            self.shuffle(api_name, urls)
        } else {
            urls
        };

        tracing::info!("Starting {api_name} over {} target(s)", urls.len());
        self.emit(RelayEvent::RunStarted {
            api_name: api_name.to_string(),
            targets: urls.len(),
            randomized,
        });

        let started = Instant::now();
        let paginator = self.paginator();
        let mut rows = Vec::with_capacity(urls.len());
        let mut items = Vec::new();

        for (index, url) in urls.iter().enumerate() {
            let target = QueryTarget::new(url, &self.owner_rules);
            self.emit(RelayEvent::TargetStarted {
                url: url.clone(),
                index,
                total: urls.len(),
            });

            let result = paginator.run(api_name, &request.params, &target, None).await;
            let row = self.report_row(&result);
            if let Err(e) = self.store.record_report(api_name, &row) {
                tracing::warn!("Failed to persist report for {url}: {e}");
            }
            self.emit_target_complete(&row, result.elapsed);
            tracing::info!(
                "Finished {}/{}: {url} (total {}, have {}, nohave {})",
                index + 1,
                urls.len(),
                row.total,
                row.have,
                row.nohave
            );

            rows.push(row);
            items.extend(result.items);

            if index + 1 < urls.len() {
                tokio::time::sleep(self.config.target_delay).await;
            }
        }

        let elapsed = started.elapsed();
        self.emit(RelayEvent::RunComplete {
            api_name: api_name.to_string(),
            targets: rows.len(),
            items: items.len(),
            elapsed_ms: elapsed.as_millis() as u64,
        });

        let mut report = RunReport {
            api_name: api_name.to_string(),
            rows,
            total_time: format_hms(elapsed),
            items,
            materialization: None,
            materialization_error: None,
        };

        if request.materialize {
            self.materialize(&mut report).await;
        }

        Ok(report)
    }

    fn paginator(&self) -> Paginator {
        let paginator = Paginator::new(Arc::clone(&self.source), self.config.page_delay);
        match &self.events {
            Some(events) => paginator.with_events(Arc::clone(events)),
            None => paginator,
        }
    }

    fn shuffle(&self, api_name: &str, mut urls: Vec<String>) -> Vec<String> {
        urls.shuffle(&mut rand::thread_rng());
        if let Err(e) = self.store.record_shuffle(api_name, &urls) {
            tracing::warn!("Failed to persist shuffled order for {api_name}: {e}");
        }
        urls
    }

    fn report_row(&self, result: &AggregationResult) -> ReportRow {
        let have = result
            .items
            .iter()
            .filter(|item| {
                item.id()
                    .is_some_and(|id| self.ledger.has(&item.username, &id))
            })
            .count();
        ReportRow {
            url: result.target.url.clone(),
            username: result.target.owner_id.clone(),
            total: result.items.len(),
            have,
            nohave: result.items.len() - have,
            time: format_hms(result.elapsed),
            pages: result.pages,
            error: result.error().map(ToString::to_string),
        }
    }

    async fn materialize(&self, report: &mut RunReport) {
        let Some(materializer) = &self.materializer else {
            report.materialization_error = Some("no materializer configured".to_string());
            return;
        };

        let fresh: Vec<TaggedItem> = report
            .items
            .iter()
            .filter(|item| match item.id() {
                Some(id) => !self.ledger.has(&item.username, &id),
                None => true,
            })
            .cloned()
            .collect();
        let skipped = report.items.len() - fresh.len();

        match materializer
            .materialize(&report.api_name, &fresh, self.ledger.as_ref())
            .await
        {
            Ok(mut summary) => {
                summary.skipped += skipped;
                tracing::info!(
                    "Materialized {} file(s) with {} error(s), {} already saved",
                    summary.downloaded,
                    summary.errors.len(),
                    summary.skipped
                );
                report.materialization = Some(summary);
            }
            Err(e) => {
                tracing::warn!("Materialization failed: {e}");
                let e = match e {
                    RelayError::Materialization(_) => e,
                    other => RelayError::Materialization(other.to_string()),
                };
                report.materialization_error = Some(e.to_string());
            }
        }
    }

    fn emit(&self, event: RelayEvent) {
        if let Some(events) = &self.events {
            events.emit(event);
        }
    }

    fn emit_target_complete(&self, row: &ReportRow, elapsed: Duration) {
        self.emit(RelayEvent::TargetComplete {
            url: row.url.clone(),
            username: row.username.clone(),
            total: row.total,
            have: row.have,
            nohave: row.nohave,
            pages: row.pages,
            elapsed_ms: elapsed.as_millis() as u64,
            error: row.error.clone(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::QueryProfiles;
    use crate::error::CallError;
    use crate::ledger::MemoryLedger;
    use crate::records::ReportRecord;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::Mutex;
    use tempfile::TempDir;

    /// Answers by target URL; a URL containing "broken" fails.
    struct ByUrlSource {
        calls: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl PageSource for ByUrlSource {
        async fn fetch_page(&self, _api: &str, params: Value) -> Result<Value, CallError> {
            let url = params["url"].as_str().unwrap_or_default().to_string();
            self.calls.lock().unwrap().push(url.clone());
            if url.contains("broken") {
                return Err(CallError::WorkerReportedError("rate limited".into()));
            }
            Ok(json!([{"id": format!("{url}#1")}, {"id": format!("{url}#2"), "cursor": ""}]))
        }
    }

    struct RecordingMaterializer {
        seen: Mutex<Vec<String>>,
        fail: bool,
    }

    #[async_trait]
    impl Materializer for RecordingMaterializer {
        async fn materialize(
            &self,
            _api_name: &str,
            items: &[TaggedItem],
            ledger: &dyn DedupLedger,
        ) -> RelayResult<MaterializeSummary> {
            if self.fail {
                return Err(RelayError::InvalidInput("disk full".into()));
            }
            let mut summary = MaterializeSummary::default();
            for item in items {
                let id = item.id().unwrap();
                self.seen.lock().unwrap().push(id.clone());
                ledger.record(&item.username, &id)?;
                summary.downloaded += 1;
            }
            Ok(summary)
        }
    }

    struct Fixture {
        dir: TempDir,
        source: Arc<ByUrlSource>,
        ledger: Arc<MemoryLedger>,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                dir: TempDir::new().unwrap(),
                source: Arc::new(ByUrlSource {
                    calls: Mutex::new(Vec::new()),
                }),
                ledger: Arc::new(MemoryLedger::new()),
            }
        }

        fn orchestrator(&self, profiles: QueryProfiles) -> Orchestrator {
            let config = RelayConfig {
                profiles,
                ..RelayConfig::default()
            };
            Orchestrator::new(
                self.source.clone(),
                self.ledger.clone(),
                RunStore::new(self.dir.path()),
                config,
            )
        }

        fn store(&self) -> RunStore {
            RunStore::new(self.dir.path())
        }
    }

    fn request(api: &str, urls: &str) -> RunRequest {
        let mut params = Map::new();
        params.insert("url".into(), json!(urls));
        RunRequest::new(api, params)
    }

    #[test]
    fn test_parse_targets() {
        assert_eq!(
            parse_targets(" https://a ,\nhttps://b\n\n,https://c "),
            vec!["https://a", "https://b", "https://c"]
        );
        assert!(parse_targets(" , \n ").is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_empty_and_missing_targets_rejected() {
        let fx = Fixture::new();
        let orch = fx.orchestrator(QueryProfiles::default());

        let err = orch.run(request("api", " , \n")).await.unwrap_err();
        assert!(matches!(err, RelayError::NoTargets));

        let err = orch.run(RunRequest::new("api", Map::new())).await.unwrap_err();
        assert!(matches!(err, RelayError::InvalidInput(_)));
        assert!(fx.source.calls.lock().unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_partial_failure_isolated() {
        let fx = Fixture::new();
        let orch = fx.orchestrator(QueryProfiles::randomized(Vec::<String>::new()));
        let urls = "https://www.instagram.com/a,https://www.instagram.com/broken,https://www.instagram.com/c";

        let report = orch.run(request("get_list_ig_post", urls)).await.unwrap();

        assert_eq!(report.rows.len(), 3);
        assert_eq!(report.rows[0].total, 2);
        assert!(report.rows[0].error.is_none());
        assert_eq!(report.rows[1].total, 0);
        assert_eq!(report.rows[1].pages, 1);
        assert!(report.rows[1].error.as_deref().unwrap().contains("rate limited"));
        assert_eq!(report.rows[2].total, 2);
        assert_eq!(report.items.len(), 4);
        assert!(report.items.iter().all(|i| i.username != "broken"));

        let persisted: Vec<ReportRecord<ReportRow>> = fx.store().reports().unwrap();
        assert_eq!(persisted.len(), 3);
        assert_eq!(persisted[1].report[0].username, "broken");
    }

    #[tokio::test(start_paused = true)]
    async fn test_target_delay_between_targets_only() {
        let fx = Fixture::new();
        let orch = fx.orchestrator(QueryProfiles::randomized(Vec::<String>::new()));
        let started = Instant::now();
        orch.run(request("api", "https://x/1,https://x/2")).await.unwrap();
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_millis(3000));
        assert!(elapsed < Duration::from_millis(3500));
    }

    #[tokio::test(start_paused = true)]
    async fn test_shuffle_persisted_as_permutation() {
        let fx = Fixture::new();
        let orch = fx.orchestrator(QueryProfiles::default());
        let input: Vec<String> = (0..6).map(|i| format!("https://www.instagram.com/u{i}")).collect();

        orch.run(request("get_list_ig_user_stories", &input.join(",")))
            .await
            .unwrap();
        orch.run(request("get_list_ig_user_stories", &input.join("\n")))
            .await
            .unwrap();

        let shuffles = fx.store().shuffles("get_list_ig_user_stories").unwrap();
        assert_eq!(shuffles.len(), 2);
        for record in &shuffles {
            let mut sorted = record.urls.clone();
            sorted.sort();
            assert_eq!(sorted, input);
        }

        // Targets ran in the recorded order.
        let calls = fx.source.calls.lock().unwrap().clone();
        assert_eq!(calls[..6], shuffles[0].urls[..]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_ordered_profile_writes_no_shuffle() {
        let fx = Fixture::new();
        let orch = fx.orchestrator(QueryProfiles::default());
        orch.run(request("get_list_ig_post", "https://x/1,https://x/2"))
            .await
            .unwrap();
        assert!(!fx.store().shuffle_path("get_list_ig_post").unwrap().exists());
        assert_eq!(
            *fx.source.calls.lock().unwrap(),
            vec!["https://x/1".to_string(), "https://x/2".to_string()]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_have_counts_ledger_entries() {
        let fx = Fixture::new();
        let url = "https://www.instagram.com/jane";
        fx.ledger.record("jane", &format!("{url}#1")).unwrap();
        let orch = fx.orchestrator(QueryProfiles::default());
        let report = orch.run(request("api", url)).await.unwrap();
        assert_eq!(report.rows[0].have, 1);
        assert_eq!(report.rows[0].nohave, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_materializes_only_fresh_items() {
        let fx = Fixture::new();
        let url = "https://www.instagram.com/jane";
        fx.ledger.record("jane", &format!("{url}#1")).unwrap();
        let materializer = Arc::new(RecordingMaterializer {
            seen: Mutex::new(Vec::new()),
            fail: false,
        });
        let orch = fx
            .orchestrator(QueryProfiles::default())
            .with_materializer(materializer.clone());

        let mut req = request("api", url);
        req.materialize = true;
        let report = orch.run(req).await.unwrap();

        assert_eq!(*materializer.seen.lock().unwrap(), vec![format!("{url}#2")]);
        let summary = report.materialization.unwrap();
        assert_eq!(summary.downloaded, 1);
        assert_eq!(summary.skipped, 1);
        assert!(fx.ledger.has("jane", &format!("{url}#2")));
    }

    #[tokio::test(start_paused = true)]
    async fn test_materialization_failure_is_noted() {
        let fx = Fixture::new();
        let materializer = Arc::new(RecordingMaterializer {
            seen: Mutex::new(Vec::new()),
            fail: true,
        });
        let orch = fx
            .orchestrator(QueryProfiles::default())
            .with_materializer(materializer);
        let mut req = request("api", "https://www.instagram.com/jane");
        req.materialize = true;

        let report = orch.run(req).await.unwrap();
        assert_eq!(report.rows.len(), 1);
        assert!(report.materialization.is_none());
        assert!(report.materialization_error.unwrap().contains("disk full"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_events_sequence() {
        let fx = Fixture::new();
        let bus = Arc::new(EventBus::new(32));
        let mut rx = bus.subscribe();
        let orch = fx
            .orchestrator(QueryProfiles::default())
            .with_events(Arc::clone(&bus));
        orch.run(request("api", "https://www.instagram.com/jane"))
            .await
            .unwrap();

        let mut kinds = Vec::new();
        while let Ok(event) = rx.try_recv() {
            kinds.push(serde_json::to_value(&event).unwrap()["type"].clone());
        }
        assert_eq!(
            kinds,
            vec![
                json!("RunStarted"),
                json!("TargetStarted"),
                json!("PageFetched"),
                json!("TargetComplete"),
                json!("RunComplete")
            ]
        );
    }
}
