//! Fetch, reconcile and sweep the opportunity catalog.

pub mod config;
pub mod reconcile;
pub mod report;
pub mod sweep;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use opcat_adapters::{
    fallback_opportunities, FeedClient, FeedClientConfig, FetchContext, FixtureSource, JsonFeedSource,
    OpportunitySource, StaticSource,
};
use opcat_storage::{DocumentCollection, FileCollection, Filter, PgCollection, Storage};
use tokio::fs;
use tokio::sync::Mutex;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

pub use config::{SourceConfig, SourceRegistry, SyncConfig};
pub use reconcile::{ReconcileError, ReconcileOutcome, Reconciler};
pub use report::{report_daily_markdown, CleanupReport, SourceLedger, SourceReport, SyncReport};
use report::{BRIEF_FILE, SUMMARY_FILE};
pub use sweep::{ExpirationSweep, SweepReport};

pub const CRATE_NAME: &str = "opcat-sync";

pub struct SyncPipeline {
    config: SyncConfig,
    storage: Arc<Storage>,
    sources: Vec<Arc<dyn OpportunitySource>>,
    run_lock: Mutex<()>,
}

impl SyncPipeline {
    pub fn new(config: SyncConfig, storage: Arc<Storage>, sources: Vec<Arc<dyn OpportunitySource>>) -> Self {
        Self {
            config,
            storage,
            sources,
            run_lock: Mutex::new(()),
        }
    }

    /// Wire storage and sources from configuration and `sources.yaml`.
    pub async fn from_config(config: SyncConfig) -> Result<Self> {
        let storage = Arc::new(open_storage(&config)?);
        let registry = SourceRegistry::load(&config.sources_path()).await?;
        let client = Arc::new(FeedClient::new(FeedClientConfig {
            timeout: Duration::from_secs(config.http_timeout_secs),
            user_agent: Some(config.user_agent.clone()),
            ..Default::default()
        })?);
        let sources = registry
            .enabled()
            .map(|source| source_for(&config, source, &client))
            .collect();
        Ok(Self::new(config, storage, sources))
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn storage(&self) -> &Arc<Storage> {
        &self.storage
    }

    /// Fatal problems come back as `success: false`.
    pub async fn run_once(&self) -> SyncReport {
        let run_id = Uuid::new_v4();
        let span = info_span!("sync_run", %run_id);
        self.run_inner(run_id).instrument(span).await
    }

    /// `None` when another run is still in progress.
    pub async fn run_exclusive(&self) -> Option<SyncReport> {
        let _guard = self.run_lock.try_lock().ok()?;
        Some(self.run_once().await)
    }

    async fn run_inner(&self, run_id: Uuid) -> SyncReport {
        let clock = Instant::now();
        let ctx = FetchContext::new(run_id);
        let backend = self.storage.refresh_backend().await;
        let mut report = SyncReport::started(run_id, ctx.fetched_at, backend);
        info!(%backend, sources = self.sources.len(), "sync run started");

        if let Err(err) = self.reconcile_sources(&ctx, &mut report).await {
            error!(error = %format!("{err:#}"), "sync run failed");
            report.error = Some(format!("{err:#}"));
            report.duration = elapsed_ms(clock);
            self.persist_report(&report).await;
            return report;
        }
        report.success = true;

        report.cleanup = Some(match ExpirationSweep::new(self.storage.as_ref()).run().await {
            Ok(sweep) => CleanupReport {
                deactivated: sweep.deactivated,
                error: None,
            },
            Err(err) => {
                warn!(error = %err, "expiration sweep failed");
                CleanupReport {
                    deactivated: 0,
                    error: Some(err.to_string()),
                }
            }
        });

        report.duration = elapsed_ms(clock);
        info!(duration_ms = report.duration, "sync run finished");
        self.persist_report(&report).await;
        report
    }

    async fn reconcile_sources(&self, ctx: &FetchContext, report: &mut SyncReport) -> Result<()> {
        let existing = self
            .storage
            .count(&Filter::new())
            .await
            .with_context(|| format!("reading the {} collection", report.backend))?;
        info!(existing, "collection readable");

        let reconciler = Reconciler::new(self.storage.as_ref())
            .with_freshness_window(chrono::Duration::seconds(self.config.freshness_window_secs));
        for source in &self.sources {
            let ledger = self.sync_source(source.as_ref(), ctx, &reconciler).await;
            let summary = ledger.summarize();
            info!(
                platform = source.platform(),
                new = summary.new,
                updated = summary.updated,
                skipped = summary.skipped,
                failed = ledger.failures(),
                "source reconciled"
            );
            report.record_source(source.platform(), summary);
        }
        Ok(())
    }

    async fn sync_source(
        &self,
        source: &dyn OpportunitySource,
        ctx: &FetchContext,
        reconciler: &Reconciler<'_>,
    ) -> SourceLedger {
        let platform = source.platform();
        let (records, fetch_error) = match source.fetch_opportunities(ctx).await {
            Ok(records) => (records, None),
            Err(err) => {
                warn!(platform, error = %err, "fetch failed; reconciling bundled sample");
                (fallback_opportunities(platform), Some(err.to_string()))
            }
        };

        let mut ledger = SourceLedger::new(fetch_error);
        for record in records {
            let key = reconcile::record_key(&record);
            let outcome = reconciler.reconcile(record).await;
            if let Err(err) = &outcome {
                warn!(platform, record = %key, error = %err, "record skipped");
            }
            ledger.push(outcome);
        }
        ledger
    }

    async fn persist_report(&self, report: &SyncReport) {
        match self.write_reports(report).await {
            Ok(dir) => info!(reports_dir = %dir.display(), "run report written"),
            Err(err) => warn!(error = %format!("{err:#}"), "could not write run report"),
        }
    }

    async fn write_reports(&self, report: &SyncReport) -> Result<PathBuf> {
        let reports_dir = self.config.reports_root().join(report.run_id.to_string());
        fs::create_dir_all(&reports_dir)
            .await
            .with_context(|| format!("creating {}", reports_dir.display()))?;

        let summary = serde_json::to_vec_pretty(report).context("serializing run summary")?;
        fs::write(reports_dir.join(SUMMARY_FILE), summary)
            .await
            .with_context(|| format!("writing {}", SUMMARY_FILE))?;
        fs::write(reports_dir.join(BRIEF_FILE), report.brief_markdown())
            .await
            .with_context(|| format!("writing {}", BRIEF_FILE))?;
        Ok(reports_dir)
    }

    pub async fn maybe_build_scheduler(self: &Arc<Self>) -> Result<Option<JobScheduler>> {
        if !self.config.scheduler_enabled {
            return Ok(None);
        }

        let sched = JobScheduler::new().await.context("creating scheduler")?;
        for cron in [&self.config.sync_cron_1, &self.config.sync_cron_2] {
            let pipeline = Arc::clone(self);
            let job = Job::new_async(cron.as_str(), move |_uuid, _l| {
                let pipeline = Arc::clone(&pipeline);
                Box::pin(async move {
                    match pipeline.run_exclusive().await {
                        Some(report) => info!(success = report.success, "scheduled sync finished"),
                        None => warn!("previous sync still running; tick skipped"),
                    }
                })
            })
            .with_context(|| format!("creating scheduler job for cron {cron}"))?;
            sched.add(job).await.context("adding scheduler job")?;
        }
        Ok(Some(sched))
    }
}

/// File collection, plus the database collection when `DATABASE_URL` is set.
pub fn open_storage(config: &SyncConfig) -> Result<Storage> {
    let file = FileCollection::new(config.data_file.clone());
    match &config.database_url {
        Some(url) => {
            let database = PgCollection::connect_lazy(url, config.collection.clone())
                .context("configuring database collection")?;
            Ok(Storage::with_database(file, Arc::new(database)))
        }
        None => Ok(Storage::file_only(file)),
    }
}

fn source_for(config: &SyncConfig, source: &SourceConfig, client: &Arc<FeedClient>) -> Arc<dyn OpportunitySource> {
    if let Some(url) = &source.feed_url {
        Arc::new(JsonFeedSource::new(&source.platform, url, Arc::clone(client)))
    } else if let Some(path) = &source.fixture_path {
        Arc::new(FixtureSource::new(&source.platform, config.resolve_fixture(path)))
    } else {
        Arc::new(StaticSource::unconfigured(&source.platform))
    }
}

fn elapsed_ms(clock: Instant) -> u64 {
    u64::try_from(clock.elapsed().as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn sources_map_to_feed_fixture_or_unconfigured() {
        let dir = tempdir().expect("tempdir");
        let mut config = SyncConfig::from_lookup(|_| None);
        config.workspace_root = dir.path().to_path_buf();
        std::fs::write(
            config.sources_path(),
            r#"
sources:
  - platform: MLH
    display_name: Major League Hacking
    fixture_path: fixtures/mlh.json
  - platform: Devpost
    display_name: Devpost
  - platform: Unstop
    display_name: Unstop
    enabled: false
"#,
        )
        .unwrap();
        std::fs::create_dir_all(dir.path().join("fixtures")).unwrap();
        std::fs::write(dir.path().join("fixtures/mlh.json"), "[]").unwrap();

        let pipeline = SyncPipeline::from_config(config).await.expect("pipeline");
        let platforms: Vec<_> = pipeline.sources.iter().map(|s| s.platform().to_string()).collect();
        assert_eq!(platforms, vec!["MLH", "Devpost"]);

        let ctx = FetchContext::new(Uuid::new_v4());
        assert!(pipeline.sources[0].fetch_opportunities(&ctx).await.unwrap().is_empty());
        assert!(pipeline.sources[1].fetch_opportunities(&ctx).await.is_err());
    }

    #[tokio::test]
    async fn missing_registry_is_an_error() {
        let dir = tempdir().expect("tempdir");
        let mut config = SyncConfig::from_lookup(|_| None);
        config.workspace_root = dir.path().to_path_buf();
        assert!(SyncPipeline::from_config(config).await.is_err());
    }
}
