//! Release of everything a run created: its scratch artifact and every staging table of the report.

use std::time::Duration;

use rws_adapters::Warehouse;
use rws_core::{is_staging_table_for, PipelineError, TableRef};
use rws_storage::ScratchArtifact;
use serde::Serialize;
use tracing::{info, warn};

use crate::bounded;

#[derive(Debug, Clone, Default, Serialize)]
pub struct CleanupReport {
    pub dropped_tables: Vec<String>,
    pub artifact_released: bool,
}

pub struct Cleaner<'a> {
    warehouse: &'a dyn Warehouse,
    timeout: Duration,
}

impl<'a> Cleaner<'a> {
    pub fn new(warehouse: &'a dyn Warehouse, timeout: Duration) -> Self {
        Self { warehouse, timeout }
    }

    /// Attempt every release step even when an earlier one fails; the first failure is returned.
    pub async fn clean(
        &self,
        target: &TableRef,
        staging: &TableRef,
        artifact: Option<ScratchArtifact>,
    ) -> Result<CleanupReport, PipelineError> {
        let mut report = CleanupReport::default();
        let mut first_error: Option<PipelineError> = None;

        if let Some(artifact) = artifact {
            let path = artifact.path().display().to_string();
            match artifact.release() {
                Ok(()) => report.artifact_released = true,
                Err(err) => {
                    warn!(path = %path, error = %err, "failed to release scratch artifact");
                    first_error.get_or_insert(PipelineError::Cleanup {
                        table: path,
                        message: err.to_string(),
                    });
                }
            }
        }

        match self.drop_table(staging).await {
            Ok(true) => report.dropped_tables.push(staging.table.clone()),
            Ok(false) => {}
            Err(err) => {
                first_error.get_or_insert(err);
            }
        }

        match self.sweep(target).await {
            Ok(dropped) => report.dropped_tables.extend(dropped),
            Err(err) => {
                first_error.get_or_insert(err);
            }
        }

        match first_error {
            Some(err) => Err(err),
            None => {
                info!(target = %target, dropped = ?report.dropped_tables, "staging cleaned up");
                Ok(report)
            }
        }
    }

    /// Drop every staging table belonging to `target` that is still present in its dataset.
    pub async fn sweep(&self, target: &TableRef) -> Result<Vec<String>, PipelineError> {
        let tables = bounded(self.timeout, "staging listing", async {
            self.warehouse
                .list_tables(&target.dataset)
                .await
                .map_err(|e| cleanup_failure(&target.dataset, e.to_string()))
        })
        .await?;

        let mut dropped = Vec::new();
        let mut first_error = None;
        for table in tables
            .iter()
            .filter(|t| t.table != target.table && is_staging_table_for(&target.table, &t.table))
        {
            match self.drop_table(table).await {
                Ok(true) => dropped.push(table.table.clone()),
                Ok(false) => {}
                Err(err) => {
                    first_error.get_or_insert(err);
                }
            }
        }

        match first_error {
            Some(err) => Err(err),
            None => Ok(dropped),
        }
    }

    async fn drop_table(&self, table: &TableRef) -> Result<bool, PipelineError> {
        let result = bounded(self.timeout, "staging delete", async {
            self.warehouse
                .delete_table(table, true)
                .await
                .map_err(|e| cleanup_failure(&table.to_string(), e.to_string()))
        })
        .await;
        if let Err(err) = &result {
            warn!(table = %table, error = %err, "failed to drop staging table");
        }
        result
    }
}

fn cleanup_failure(table: &str, message: String) -> PipelineError {
    PipelineError::Cleanup {
        table: table.to_string(),
        message,
    }
}
