//! Synchronization manager
//!
//! [`Manager::get`] plans a run and returns a [`SyncRun`], a lazy single-pass
//! sequence of `(identifier, record)` pairs. Partitions are walked in planned
//! order, pages within a partition in cursor order, and items within a page in
//! upstream order. Nothing beyond the current page is held in memory.
//!
//! Per-record failures are logged and counted; run-level failures end the
//! sequence with an error and leave the run in [`RunState::Failed`]. The URL
//! inventory and counters stay available through [`SyncRun::outcome`] either
//! way.

use super::fetcher::{HttpFetcher, PageFetcher};
use super::models::{CanonicalRecord, PartitionSpec, RawItem, RunOutcome};
use super::normalizer::{extract_identifier, RecordNormalizer};
use super::planner;
use super::reader::PageReader;
use crate::config::SyncConfig;
use crate::error::{Result, SyncError};
use crate::schema::SchemaValidator;
use crate::store::ResultStore;
use chrono::{DateTime, Utc};
use futures::stream::{self, BoxStream, StreamExt};
use std::collections::{HashSet, VecDeque};
use std::fmt;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, trace, warn, Instrument, Span};
use uuid::Uuid;

/// Where a run currently is
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunState {
    Planning,
    Fetching { partition: PartitionSpec },
    Done,
    Failed,
}

impl RunState {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunState::Planning => "planning",
            RunState::Fetching { .. } => "fetching",
            RunState::Done => "done",
            RunState::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, RunState::Done | RunState::Failed)
    }
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunState::Fetching { partition } => write!(f, "fetching({partition})"),
            other => f.write_str(other.as_str()),
        }
    }
}

/// Per-invocation options of [`Manager::get_with`]
#[derive(Debug, Clone)]
pub struct RunOptions {
    pub skip_if_exists: bool,
    pub last_updated: Option<DateTime<Utc>>,
    /// Reference time for planning and for clipping query windows
    pub now: DateTime<Utc>,
    pub cancel: CancellationToken,
}

impl RunOptions {
    pub fn new(skip_if_exists: bool, last_updated: Option<DateTime<Utc>>) -> Self {
        Self {
            skip_if_exists,
            last_updated,
            now: Utc::now(),
            cancel: CancellationToken::new(),
        }
    }

    pub fn at(mut self, now: DateTime<Utc>) -> Self {
        self.now = now;
        self
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }
}

/// Coordinates planning, paging, normalization and the skip policy
pub struct Manager {
    config: Arc<SyncConfig>,
    fetcher: Arc<dyn PageFetcher>,
    store: Arc<dyn ResultStore>,
    normalizer: RecordNormalizer,
}

impl Manager {
    pub fn new(
        config: Arc<SyncConfig>,
        fetcher: Arc<dyn PageFetcher>,
        store: Arc<dyn ResultStore>,
        schema: Arc<dyn SchemaValidator>,
    ) -> Self {
        Self {
            config,
            fetcher,
            store,
            normalizer: RecordNormalizer::new(schema),
        }
    }

    /// Manager talking to the configured upstream over HTTP
    pub fn from_config(
        config: Arc<SyncConfig>,
        store: Arc<dyn ResultStore>,
        schema: Arc<dyn SchemaValidator>,
    ) -> Result<Self> {
        let fetcher = Arc::new(HttpFetcher::new(&config)?);
        Ok(Self::new(config, fetcher, store, schema))
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn schema(&self) -> &Arc<dyn SchemaValidator> {
        self.normalizer.schema()
    }

    /// Start a run; planning errors surface here, before any request
    pub fn get(
        &self,
        skip_if_exists: bool,
        last_updated: Option<DateTime<Utc>>,
    ) -> Result<SyncRun<'_>> {
        self.get_with(RunOptions::new(skip_if_exists, last_updated))
    }

    pub fn get_with(&self, options: RunOptions) -> Result<SyncRun<'_>> {
        let run_id = Uuid::new_v4();
        let span = info_span!("nvd_sync", run_id = %run_id);

        let partitions = {
            let _enter = span.enter();
            let partitions = planner::plan(
                self.config.start_year(),
                self.config.end_year(),
                options.last_updated,
                self.config.modified_overlap(),
                options.now,
            )?;
            info!(
                partitions = partitions.len(),
                skip_if_exists = options.skip_if_exists,
                last_updated = ?options.last_updated,
                "Planned sync run"
            );
            partitions
        };

        Ok(SyncRun {
            manager: self,
            options,
            partitions: partitions.into(),
            reader: None,
            buffered: VecDeque::new(),
            seen: HashSet::new(),
            outcome: RunOutcome::default(),
            state: RunState::Planning,
            run_id,
            span,
        })
    }
}

/// One in-progress synchronization run
pub struct SyncRun<'a> {
    manager: &'a Manager,
    options: RunOptions,
    partitions: VecDeque<PartitionSpec>,
    reader: Option<PageReader>,
    /// Items of the current page not yet processed, with their page URL
    buffered: VecDeque<(RawItem, String)>,
    /// Lowercase identifiers already yielded or skipped as existing
    seen: HashSet<String>,
    outcome: RunOutcome,
    state: RunState,
    run_id: Uuid,
    span: Span,
}

impl<'a> SyncRun<'a> {
    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    pub fn state(&self) -> &RunState {
        &self.state
    }

    /// URL inventory and counters accumulated so far
    pub fn outcome(&self) -> &RunOutcome {
        &self.outcome
    }

    pub fn into_outcome(self) -> RunOutcome {
        self.outcome
    }

    /// Next surviving `(identifier, record)` pair, or `None` once exhausted
    ///
    /// After an error the run is failed and every later call returns `None`.
    pub async fn next(&mut self) -> Result<Option<(String, CanonicalRecord)>> {
        if self.state.is_terminal() {
            return Ok(None);
        }

        let span = self.span.clone();
        let result = self.advance().instrument(span.clone()).await;
        let _enter = span.enter();

        match result {
            Ok(Some(pair)) => Ok(Some(pair)),
            Ok(None) => {
                self.state = RunState::Done;
                info!(
                    urls = self.outcome.urls.len(),
                    emitted = self.outcome.emitted_count,
                    processed = self.outcome.stats.processed_records,
                    failed = self.outcome.stats.failed_records,
                    duplicates = self.outcome.stats.duplicates_skipped,
                    existing = self.outcome.stats.existing_skipped,
                    "Sync run complete"
                );
                Ok(None)
            },
            Err(e) => {
                self.state = RunState::Failed;
                self.reader = None;
                self.buffered.clear();
                self.partitions.clear();
                error!(
                    error = %e,
                    urls = self.outcome.urls.len(),
                    emitted = self.outcome.emitted_count,
                    "Sync run failed"
                );
                Err(e)
            },
        }
    }

    /// Stream view of [`SyncRun::next`]; ends after the first error
    pub fn records(&mut self) -> BoxStream<'_, Result<(String, CanonicalRecord)>> {
        stream::unfold(self, |run| async move {
            match run.next().await {
                Ok(Some(pair)) => Some((Ok(pair), run)),
                Ok(None) => None,
                Err(e) => Some((Err(e), run)),
            }
        })
        .boxed()
    }

    async fn advance(&mut self) -> Result<Option<(String, CanonicalRecord)>> {
        loop {
            if let Some((raw, url)) = self.buffered.pop_front() {
                if let Some(pair) = self.process(raw, &url).await? {
                    return Ok(Some(pair));
                }
                continue;
            }

            if self.options.cancel.is_cancelled() {
                warn!("Cancellation requested, stopping run");
                return Err(SyncError::Cancelled);
            }

            if self.reader.is_none() {
                let Some(partition) = self.partitions.pop_front() else {
                    return Ok(None);
                };
                info!(partition = %partition, "Fetching partition");
                self.state = RunState::Fetching {
                    partition: partition.clone(),
                };
                self.reader = Some(PageReader::new(
                    partition,
                    &self.manager.config,
                    self.options.now,
                ));
            }

            let Some(reader) = self.reader.as_mut() else {
                continue;
            };
            let fetcher = self.manager.fetcher.as_ref();
            let inventory = &mut self.outcome.urls;
            let cancel = self.options.cancel.clone();

            let fetched = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    warn!("Cancellation requested during page fetch");
                    return Err(SyncError::Cancelled);
                }
                fetched = reader.next_page(fetcher, inventory) => fetched?,
            };

            match fetched {
                Some(fetched) => {
                    debug!(
                        url = %fetched.url,
                        items = fetched.page.items.len(),
                        total = fetched.page.total_results,
                        "Read page"
                    );
                    let url = fetched.url;
                    self.buffered
                        .extend(fetched.page.items.into_iter().map(|item| (item, url.clone())));
                },
                None => {
                    if let Some(reader) = self.reader.take() {
                        info!(partition = %reader.partition(), "Partition complete");
                    }
                },
            }
        }
    }

    /// Apply dedup, the skip policy and normalization to one raw item
    async fn process(
        &mut self,
        raw: RawItem,
        url: &str,
    ) -> Result<Option<(String, CanonicalRecord)>> {
        let identifier = match extract_identifier(&raw) {
            Ok(identifier) => identifier,
            Err(e) => {
                self.record_failure(&e, url);
                self.check_failure_rate()?;
                return Ok(None);
            },
        };

        let key = identifier.to_lowercase();
        if self.seen.contains(&key) {
            trace!(identifier = %identifier, "Skipping duplicate");
            self.outcome.stats.duplicates_skipped += 1;
            return Ok(None);
        }

        if self.options.skip_if_exists && self.manager.store.exists(&key).await? {
            trace!(identifier = %identifier, "Skipping existing result");
            self.outcome.stats.existing_skipped += 1;
            self.seen.insert(key);
            return Ok(None);
        }

        self.outcome.stats.processed_records += 1;
        match self.manager.normalizer.normalize(raw, url) {
            Ok(record) => {
                self.check_failure_rate()?;
                self.seen.insert(key);
                self.outcome.emitted_count += 1;
                Ok(Some((identifier, record)))
            },
            Err(e) => {
                self.outcome.stats.failed_records += 1;
                warn!(url, error = %e, "Skipping invalid record");
                self.check_failure_rate()?;
                Ok(None)
            },
        }
    }

    fn record_failure(&mut self, err: &SyncError, url: &str) {
        self.outcome.stats.processed_records += 1;
        self.outcome.stats.failed_records += 1;
        warn!(url, error = %err, "Skipping invalid record");
    }

    fn check_failure_rate(&self) -> Result<()> {
        let stats = &self.outcome.stats;
        let config = &self.manager.config;
        if stats.processed_records < config.failure_rate_min_sample().max(1) {
            return Ok(());
        }

        let rate = stats.failed_records as f64 / stats.processed_records as f64;
        if rate > config.max_failure_rate() {
            return Err(SyncError::ExcessiveFailureRate {
                failed: stats.failed_records,
                processed: stats.processed_records,
                threshold: config.max_failure_rate(),
            });
        }
        Ok(())
    }
}
