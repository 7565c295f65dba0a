use std::collections::BTreeSet;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Local};
use indicatif::{ProgressBar, ProgressStyle};
use rayon::prelude::*;
use serde::Serialize;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::config::Settings;
use crate::error::{ExtractionError, FetchError, HarvestError};
use crate::fetch::PageFetcher;
use crate::lock::RunLock;
use crate::parser::{DetailExtractor, KeyDiscoverer};
use crate::record::{JobKey, JobRecord};
use crate::store::SheetStore;

/// How a run ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", content = "detail", rename_all = "snake_case")]
pub enum Outcome {
    NoNewRecords,
    Ingested(usize),
    Failed(String),
}

#[derive(Debug, Clone, Serialize)]
pub struct SkippedKey {
    pub key: JobKey,
    pub reason: String,
}

/// Result handed back to whatever triggered the run.
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub started_at: DateTime<Local>,
    pub finished_at: DateTime<Local>,
    pub candidates: usize,
    pub new_keys: usize,
    pub ingested: usize,
    pub skipped: Vec<SkippedKey>,
    pub outcome: Outcome,
}

impl RunSummary {
    fn begin() -> Self {
        let now = Local::now();
        Self {
            started_at: now,
            finished_at: now,
            candidates: 0,
            new_keys: 0,
            ingested: 0,
            skipped: Vec::new(),
            outcome: Outcome::NoNewRecords,
        }
    }

    pub fn is_failure(&self) -> bool {
        matches!(self.outcome, Outcome::Failed(_))
    }
}

impl fmt::Display for RunSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let at = self.finished_at.format("%Y-%m-%d %H:%M:%S");
        match &self.outcome {
            Outcome::NoNewRecords => write!(f, "No new jobs found at {}", at),
            Outcome::Ingested(n) => write!(f, "Found {} new jobs at {}", n, at),
            Outcome::Failed(reason) => write!(f, "Run failed: {}", reason),
        }
    }
}

/// A detail page body (or its fetch error), tagged with its position in the batch.
struct FetchedPage {
    index: usize,
    key: JobKey,
    body: Result<String, FetchError>,
}

/// listing → new keys → detail pages → records → one batched append.
pub struct Harvester {
    settings: Settings,
    fetcher: Arc<dyn PageFetcher>,
    discoverer: KeyDiscoverer,
    extractor: DetailExtractor,
    store: SheetStore,
}

impl Harvester {
    pub fn new(settings: Settings, fetcher: Arc<dyn PageFetcher>) -> Result<Self, HarvestError> {
        settings.validate()?;
        Ok(Self {
            discoverer: KeyDiscoverer::new(&settings)?,
            extractor: DetailExtractor::new(&settings)?,
            store: SheetStore::from_settings(&settings),
            fetcher,
            settings,
        })
    }

    pub fn store(&self) -> &SheetStore {
        &self.store
    }

    /// One full pass. Never errors; failures land in the summary.
    pub async fn run(&self) -> RunSummary {
        let t0 = Instant::now();
        info!("Starting job harvest...");

        let mut summary = RunSummary::begin();
        summary.outcome = match self.ingest(&mut summary).await {
            Ok(0) => Outcome::NoNewRecords,
            Ok(n) => Outcome::Ingested(n),
            Err(e) => {
                error!("Harvest aborted: {}", e);
                Outcome::Failed(e.to_string())
            }
        };
        summary.finished_at = Local::now();

        info!(
            "Harvest finished in {:.1}s: {} candidates, {} new, {} ingested, {} skipped",
            t0.elapsed().as_secs_f64(),
            summary.candidates,
            summary.new_keys,
            summary.ingested,
            summary.skipped.len()
        );
        summary
    }

    async fn ingest(&self, summary: &mut RunSummary) -> Result<usize, HarvestError> {
        let _lock = RunLock::acquire(&self.settings.lock_path())?;

        let existing = self.store.existing_keys().map_err(HarvestError::StoreRead)?;
        info!("Store holds {} keys", existing.len());

        let candidates = self.discover().await?;
        summary.candidates = candidates.len();

        let new_keys: Vec<JobKey> = candidates
            .into_iter()
            .filter(|k| !existing.contains(k))
            .collect();
        summary.new_keys = new_keys.len();
        if new_keys.is_empty() {
            info!("No new jobs found");
            return Ok(0);
        }
        info!("{} new keys to fetch", new_keys.len());

        let pages = self.fetch_details(new_keys).await;
        let (records, skipped) = self.extract_pages(pages);
        summary.skipped = skipped;

        if records.is_empty() {
            warn!("Every new key failed extraction; nothing to write");
            return Ok(0);
        }

        let written = self.store.append(&records).map_err(HarvestError::StoreWrite)?;
        info!("Wrote {} new jobs to {:?}", written, self.store.path());
        summary.ingested = written;
        Ok(written)
    }

    /// Run, sleep `every`, repeat until `stop` resolves, which also abandons a
    /// run in progress. Returns the number of completed runs.
    pub async fn watch(
        &self,
        every: Duration,
        stop: impl Future<Output = ()>,
        mut on_summary: impl FnMut(&RunSummary),
    ) -> usize {
        tokio::pin!(stop);
        let mut runs = 0;
        loop {
            tokio::select! {
                summary = self.run() => {
                    runs += 1;
                    if summary.is_failure() {
                        warn!("Run failed; retrying after the next interval");
                    }
                    on_summary(&summary);
                }
                _ = &mut stop => return runs,
            }
            tokio::select! {
                _ = tokio::time::sleep(every) => {}
                _ = &mut stop => return runs,
            }
        }
    }

    /// Candidate keys currently on the listing page.
    pub async fn discover(&self) -> Result<BTreeSet<JobKey>, HarvestError> {
        info!("Fetching listing page: {}", self.settings.search_url);
        let html = fetch_bounded(self.fetcher.as_ref(), &self.settings.search_url, self.settings.timeout())
            .await
            .map_err(HarvestError::Listing)?;

        let keys = self.discoverer.discover(&html);
        info!("Listing advertises {} candidate keys", keys.len());
        Ok(keys)
    }

    /// Fetch and extract one detail page without touching the store.
    pub async fn extract_one(&self, key: &JobKey) -> Result<JobRecord, ExtractionError> {
        let url = self.settings.detail_url(key.as_str());
        let html = fetch_bounded(self.fetcher.as_ref(), &url, self.settings.timeout()).await?;
        let mut record = self.extractor.extract(&html)?;
        pin_key(&mut record, &self.settings.key_field, key);
        Ok(record)
    }

    /// Fetch detail pages with bounded concurrency. Output is in input order,
    /// one page per key; a task that never reported yields `FetchError::Lost`.
    async fn fetch_details(&self, keys: Vec<JobKey>) -> Vec<FetchedPage> {
        let semaphore = Arc::new(Semaphore::new(self.settings.concurrency));
        let timeout = self.settings.timeout();
        let pb = progress_bar(keys.len());

        let (tx, mut rx) = tokio::sync::mpsc::channel::<FetchedPage>(self.settings.concurrency * 2);
        let mut tasks = JoinSet::new();

        for (index, key) in keys.iter().cloned().enumerate() {
            let fetcher = Arc::clone(&self.fetcher);
            let sem = Arc::clone(&semaphore);
            let tx = tx.clone();
            let url = self.settings.detail_url(key.as_str());

            tasks.spawn(async move {
                let Ok(_permit) = sem.acquire().await else {
                    return;
                };
                debug!("Processing job #{} with key: {}", index + 1, key);
                let body = fetch_bounded(fetcher.as_ref(), &url, timeout).await;
                let _ = tx.send(FetchedPage { index, key, body }).await;
            });
        }

        // rx closes once every task has sent or died and dropped its sender
        drop(tx);

        let mut slots: Vec<Option<FetchedPage>> = keys.iter().map(|_| None).collect();
        while let Some(page) = rx.recv().await {
            if let Some(slot) = slots.get_mut(page.index) {
                *slot = Some(page);
            }
            pb.inc(1);
        }
        pb.finish_and_clear();

        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                error!("Fetch task failed: {}", e);
            }
        }

        slots
            .into_iter()
            .zip(keys)
            .enumerate()
            .map(|(index, (slot, key))| {
                slot.unwrap_or_else(|| FetchedPage {
                    index,
                    key,
                    body: Err(FetchError::Lost),
                })
            })
            .collect()
    }

    /// Parse fetched pages in parallel; failures become skipped keys.
    fn extract_pages(&self, pages: Vec<FetchedPage>) -> (Vec<JobRecord>, Vec<SkippedKey>) {
        let extractor = &self.extractor;
        let key_field = self.settings.key_field.as_str();

        let results: Vec<(JobKey, Result<JobRecord, ExtractionError>)> = pages
            .into_par_iter()
            .map(|page| {
                let record = page
                    .body
                    .map_err(ExtractionError::from)
                    .and_then(|html| extractor.extract(&html))
                    .map(|mut record| {
                        pin_key(&mut record, key_field, &page.key);
                        record
                    });
                (page.key, record)
            })
            .collect();

        let mut records = Vec::new();
        let mut skipped = Vec::new();
        for (key, result) in results {
            match result {
                Ok(record) => {
                    debug!("Extracted job {}: {} fields", key, record.len());
                    records.push(record);
                }
                Err(e) => {
                    warn!("Skipping job {}: {}", key, e);
                    skipped.push(SkippedKey {
                        key,
                        reason: e.to_string(),
                    });
                }
            }
        }
        (records, skipped)
    }
}

async fn fetch_bounded(
    fetcher: &dyn PageFetcher,
    url: &str,
    timeout: Duration,
) -> Result<String, FetchError> {
    match tokio::time::timeout(timeout, fetcher.fetch(url)).await {
        Ok(result) => result,
        Err(_) => Err(FetchError::Timeout(timeout)),
    }
}

fn pin_key(record: &mut JobRecord, field: &str, key: &JobKey) {
    if let Some(previous) = record.pin_key(field, key) {
        warn!(
            "Page for {} reports {} = {:?}; keeping the listing key",
            key, field, previous
        );
    }
}

fn progress_bar(len: usize) -> ProgressBar {
    let pb = ProgressBar::new(len as u64);
    if let Ok(style) =
        ProgressStyle::default_bar().template("[{elapsed_precise}] {bar:40} {pos}/{len} ({per_sec}, eta {eta})")
    {
        pb.set_style(style.progress_chars("=> "));
    }
    pb
}

// ── Tests ──
