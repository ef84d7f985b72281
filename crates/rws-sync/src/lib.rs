//! Report → warehouse sync pipeline: extract, sanitize, stage, reconcile, merge, clean up.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use rws_adapters::{
    LookerConfig, LookerSource, MemoryWarehouse, PostgresWarehouse, ReportId, ReportSource,
    Warehouse, WarehouseError,
};
use rws_core::{
    staging_table_name, target_table_name, MergeJob, MergePolicy, PipelineError, RunStage,
    TableRef,
};
use rws_storage::{HttpClientConfig, HttpFetcher, ScratchArtifact, ScratchSpace};
use serde::Serialize;
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

pub mod clean;
pub mod config;
pub mod extract;
pub mod merge;
pub mod reconcile;
pub mod sanitize;
pub mod stage;

pub use clean::{Cleaner, CleanupReport};
pub use config::{
    AmbiguityPolicy, BatchPolicy, PipelineSettings, ReportRegistry, ReportSpec, SyncConfig,
};
pub use extract::{ExtractedReport, Extractor};
pub use merge::{plan_merge, MergeOutcome, Merger};
pub use reconcile::{ReconciledSchemas, SchemaReconciler, TargetAction};
pub use sanitize::{sanitize_dataset, sanitize_header, Sanitizer};
pub use stage::StagingLoader;

pub const CRATE_NAME: &str = "rws-sync";

/// Run a remote call with an upper bound; running out of time counts as a transient fault.
pub(crate) async fn bounded<T, F>(
    limit: Duration,
    operation: &str,
    fut: F,
) -> Result<T, PipelineError>
where
    F: Future<Output = Result<T, PipelineError>>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result,
        Err(_) => Err(PipelineError::TransientIo {
            operation: operation.to_string(),
            message: format!("timed out after {:?}", limit),
        }),
    }
}

pub(crate) fn warehouse_failure(
    operation: &str,
    table: &TableRef,
    err: WarehouseError,
) -> PipelineError {
    match err {
        WarehouseError::Transport(message) => PipelineError::TransientIo {
            operation: operation.to_string(),
            message,
        },
        WarehouseError::MalformedData(message) => PipelineError::SchemaMismatch {
            table: table.to_string(),
            message,
        },
        other => PipelineError::WarehouseRejected {
            operation: operation.to_string(),
            message: other.to_string(),
        },
    }
}

/// Successful outcome of one report run.
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub report: String,
    pub report_id: String,
    pub target_table: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub dataset_sha256: Option<String>,
    pub rows_staged: usize,
    pub rows_merged: u64,
    pub key_column: String,
    pub policy: MergePolicy,
    pub target_action: TargetAction,
    pub dropped_staging_tables: Vec<String>,
}

impl RunSummary {
    pub fn message(&self) -> String {
        format!(
            "merged {} of {} staged rows from {:?} into {} ({})",
            self.rows_merged,
            self.rows_staged,
            self.report,
            self.target_table,
            self.policy.as_str()
        )
    }
}

#[derive(Debug, Clone)]
pub struct ReportOutcome {
    pub report: String,
    pub result: Result<RunSummary, PipelineError>,
}

#[derive(Debug, Clone, Default)]
pub struct BatchSummary {
    pub outcomes: Vec<ReportOutcome>,
    /// Reports never attempted because the batch aborted.
    pub skipped: Vec<String>,
}

impl BatchSummary {
    pub fn succeeded(&self) -> usize {
        self.outcomes.iter().filter(|o| o.result.is_ok()).count()
    }

    pub fn failures(&self) -> impl Iterator<Item = (&str, &PipelineError)> {
        self.outcomes
            .iter()
            .filter_map(|o| o.result.as_ref().err().map(|e| (o.report.as_str(), e)))
    }

    pub fn first_error(&self) -> Option<&PipelineError> {
        self.failures().next().map(|(_, e)| e)
    }

    pub fn is_success(&self) -> bool {
        self.first_error().is_none() && self.skipped.is_empty()
    }
}

struct StageTracker {
    run_id: Uuid,
    current: RunStage,
}

impl StageTracker {
    fn advance(&mut self, next: RunStage) {
        info!(run_id = %self.run_id, from = %self.current, to = %next, "stage transition");
        self.current = next;
    }
}

/// Everything a run owns, so cleanup can find it whichever stage failed.
struct RunContext {
    stage: StageTracker,
    artifact: Option<ScratchArtifact>,
}

struct MergedRun {
    report_id: ReportId,
    dataset_sha256: Option<String>,
    rows_staged: usize,
    key_column: String,
    target_action: TargetAction,
    rows_merged: u64,
}

pub struct SyncPipeline {
    settings: PipelineSettings,
    source: Arc<dyn ReportSource>,
    warehouse: Arc<dyn Warehouse>,
    scratch: ScratchSpace,
}

impl SyncPipeline {
    pub fn new(
        settings: PipelineSettings,
        source: Arc<dyn ReportSource>,
        warehouse: Arc<dyn Warehouse>,
        scratch: ScratchSpace,
    ) -> Self {
        Self {
            settings,
            source,
            warehouse,
            scratch,
        }
    }

    /// Looker source plus a Postgres warehouse, or an in-memory warehouse when `dry_run`.
    pub async fn from_config(config: &SyncConfig, dry_run: bool) -> Result<Self> {
        let settings = config.settings();
        let http = HttpFetcher::new(HttpClientConfig {
            timeout: settings.remote_timeout,
            user_agent: Some(config.user_agent.clone()),
        })?;
        let looker = LookerConfig::new(
            config
                .looker_base_url
                .clone()
                .context("LOOKER_BASE_URL is not set")?,
            config
                .looker_client_id
                .clone()
                .context("LOOKER_CLIENT_ID is not set")?,
            config
                .looker_client_secret
                .clone()
                .context("LOOKER_CLIENT_SECRET is not set")?,
        );
        let source: Arc<dyn ReportSource> = Arc::new(LookerSource::new(looker, http));

        let warehouse: Arc<dyn Warehouse> = if dry_run {
            warn!("dry run: merging into an in-memory warehouse");
            Arc::new(MemoryWarehouse::new())
        } else {
            Arc::new(
                PostgresWarehouse::connect(&config.database_url)
                    .await
                    .context("connecting to the warehouse")?,
            )
        };

        let scratch = match &config.scratch_dir {
            Some(dir) => ScratchSpace::new(dir.clone()),
            None => ScratchSpace::system(),
        };

        Ok(Self::new(settings, source, warehouse, scratch))
    }

    pub fn settings(&self) -> &PipelineSettings {
        &self.settings
    }

    /// Run one report end to end. Cleanup always happens before this returns.
    pub async fn run_pipeline(&self, report: &ReportSpec) -> Result<RunSummary, PipelineError> {
        let run_id = Uuid::new_v4();
        let span = info_span!("pipeline_run", %run_id, report = %report.name);
        self.run_with_id(run_id, report).instrument(span).await
    }

    async fn run_with_id(
        &self,
        run_id: Uuid,
        report: &ReportSpec,
    ) -> Result<RunSummary, PipelineError> {
        let started_at = Utc::now();
        let target_name = target_table_name(&report.name)?;
        let target = TableRef::new(&self.settings.dataset, target_name);
        let staging = TableRef::new(
            &self.settings.dataset,
            staging_table_name(&target.table, run_id),
        );

        let mut ctx = RunContext {
            stage: StageTracker {
                run_id,
                current: RunStage::Start,
            },
            artifact: None,
        };
        info!(target = %target, staging = %staging, "starting run");

        let outcome = self.advance(report, &target, &staging, &mut ctx).await;
        if let Err(err) = &outcome {
            error!(stage = %ctx.stage.current, kind = err.kind(), error = %err, "run failed");
            ctx.stage.advance(RunStage::Failed);
        }

        let cleanup = Cleaner::new(self.warehouse.as_ref(), self.settings.remote_timeout)
            .clean(&target, &staging, ctx.artifact.take())
            .await;
        ctx.stage.advance(RunStage::CleanedUp);

        match (outcome, cleanup) {
            (Ok(merged), Ok(cleaned)) => {
                let summary = RunSummary {
                    run_id,
                    report: report.name.clone(),
                    report_id: merged.report_id.to_string(),
                    target_table: target.to_string(),
                    started_at,
                    finished_at: Utc::now(),
                    dataset_sha256: merged.dataset_sha256,
                    rows_staged: merged.rows_staged,
                    rows_merged: merged.rows_merged,
                    key_column: merged.key_column,
                    policy: report.policy.clone(),
                    target_action: merged.target_action,
                    dropped_staging_tables: cleaned.dropped_tables,
                };
                info!("{}", summary.message());
                Ok(summary)
            }
            (Ok(_), Err(cleanup_err)) => Err(cleanup_err),
            (Err(err), Ok(_)) => Err(err),
            (Err(err), Err(cleanup_err)) => {
                warn!(error = %cleanup_err, "cleanup after failed run also failed");
                Err(err)
            }
        }
    }

    async fn advance(
        &self,
        report: &ReportSpec,
        target: &TableRef,
        staging: &TableRef,
        ctx: &mut RunContext,
    ) -> Result<MergedRun, PipelineError> {
        let timeout = self.settings.remote_timeout;
        let warehouse = self.warehouse.as_ref();

        let extracted = Extractor::new(
            self.source.as_ref(),
            self.settings.ambiguity_policy,
            timeout,
        )
        .extract(&report.name)
        .await?;
        ctx.stage.advance(RunStage::Extracted);

        let artifact = Sanitizer::new(&self.scratch)
            .sanitize_to_artifact(ctx.stage.run_id, &target.table, &extracted.body)
            .await?;
        let dataset_sha256 = artifact.content_hash().map(str::to_string);
        let artifact = ctx.artifact.insert(artifact);
        ctx.stage.advance(RunStage::Sanitized);

        let load = StagingLoader::new(warehouse, timeout)
            .load(artifact, staging)
            .await?;
        ctx.stage.advance(RunStage::Staged);

        let schemas = SchemaReconciler::new(warehouse, timeout)
            .reconcile(staging, target)
            .await?;
        ctx.stage.advance(RunStage::SchemaReady);

        let key_column = match &report.key_column {
            Some(key) => key.clone(),
            None => schemas
                .staging
                .first()
                .map(|c| c.name.clone())
                .ok_or_else(|| PipelineError::SchemaMismatch {
                    table: staging.to_string(),
                    message: "no column available as key".to_string(),
                })?,
        };
        let job = MergeJob {
            source: staging.clone(),
            target: target.clone(),
            key_column: key_column.clone(),
            policy: report.policy.clone(),
        };
        let merged = Merger::new(warehouse, timeout)
            .merge(&job, &schemas.staging, &schemas.target)
            .await?;
        ctx.stage.advance(RunStage::Merged);
        ctx.stage.advance(RunStage::Done);

        Ok(MergedRun {
            report_id: extracted.report_id,
            dataset_sha256,
            rows_staged: load.rows_loaded,
            key_column,
            target_action: schemas.action,
            rows_merged: merged.rows_affected,
        })
    }

    /// Run reports one after another in the given order, honouring the batch policy.
    pub async fn run_batch(&self, reports: &[ReportSpec]) -> BatchSummary {
        let mut summary = BatchSummary::default();
        let mut pending = reports.iter();

        for report in pending.by_ref() {
            info!(report = %report.name, "starting transfer");
            let result = self.run_pipeline(report).await;
            let failed = result.is_err();
            summary.outcomes.push(ReportOutcome {
                report: report.name.clone(),
                result,
            });
            if failed && self.settings.batch_policy == BatchPolicy::Abort {
                warn!(report = %report.name, "aborting batch after failed report");
                break;
            }
        }

        summary.skipped = pending.map(|r| r.name.clone()).collect();
        summary
    }

    /// Drop leftover staging tables for each report without running anything else.
    pub async fn sweep_staging(
        &self,
        reports: &[ReportSpec],
    ) -> Result<Vec<String>, PipelineError> {
        let cleaner = Cleaner::new(self.warehouse.as_ref(), self.settings.remote_timeout);
        let mut dropped = Vec::new();
        for report in reports {
            let target = TableRef::new(&self.settings.dataset, target_table_name(&report.name)?);
            dropped.extend(cleaner.sweep(&target).await?);
        }
        Ok(dropped)
    }
}

/// Run `names` (or every enabled registry report) once against the configured collaborators.
pub async fn run_sync_once(
    config: &SyncConfig,
    names: &[String],
    dry_run: bool,
) -> Result<BatchSummary> {
    let registry = ReportRegistry::load_or_empty(&config.reports_file, names.is_empty()).await?;
    let selected = registry.select(names);
    if selected.is_empty() {
        bail!("no reports to sync in {}", config.reports_file.display());
    }
    let pipeline = SyncPipeline::from_config(config, dry_run).await?;
    Ok(pipeline.run_batch(&selected).await)
}
