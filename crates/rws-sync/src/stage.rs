//! Truncate-and-load of the sanitized artifact into the run's staging table.

use std::time::Duration;

use rws_adapters::{LoadJob, Warehouse};
use rws_core::{PipelineError, TableRef};
use rws_storage::ScratchArtifact;
use tracing::info;

use crate::sanitize::scratch_failure;
use crate::{bounded, warehouse_failure};

pub struct StagingLoader<'a> {
    warehouse: &'a dyn Warehouse,
    timeout: Duration,
}

impl<'a> StagingLoader<'a> {
    pub fn new(warehouse: &'a dyn Warehouse, timeout: Duration) -> Self {
        Self { warehouse, timeout }
    }

    /// Replace `staging` with the artifact's rows. Returns only after the load completed.
    pub async fn load(
        &self,
        artifact: &ScratchArtifact,
        staging: &TableRef,
    ) -> Result<LoadJob, PipelineError> {
        let data = artifact
            .read_bytes()
            .await
            .map_err(|e| scratch_failure("reading scratch artifact", e))?;

        let job = bounded(self.timeout, "staging load", async {
            self.warehouse
                .load_table(staging, &data)
                .await
                .map_err(|e| warehouse_failure("staging load", staging, e))
        })
        .await?;

        info!(
            staging = %staging,
            rows = job.rows_loaded,
            columns = job.schema.len(),
            "staged dataset"
        );
        Ok(job)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rws_adapters::{MemoryWarehouse, WarehouseError, WarehouseOp};
    use rws_storage::ScratchSpace;
    use tempfile::tempdir;
    use uuid::Uuid;

    async fn artifact(scratch: &ScratchSpace, body: &[u8]) -> ScratchArtifact {
        let mut artifact = scratch.acquire(Uuid::new_v4(), "t").expect("acquire");
        artifact.write_bytes(body).await.expect("write");
        artifact
    }

    #[tokio::test]
    async fn reloading_replaces_previous_staging_content() {
        let dir = tempdir().expect("tempdir");
        let scratch = ScratchSpace::new(dir.path());
        let warehouse = MemoryWarehouse::new();
        let staging = TableRef::new("ds", "t__staging_00000000");
        let loader = StagingLoader::new(&warehouse, Duration::from_secs(5));

        let first = artifact(&scratch, b"Unique_ID,Col1\n1,a\n2,b\n").await;
        assert_eq!(loader.load(&first, &staging).await.unwrap().rows_loaded, 2);
        let second = artifact(&scratch, b"Unique_ID,Col1\n3,c\n").await;
        assert_eq!(loader.load(&second, &staging).await.unwrap().rows_loaded, 1);

        assert_eq!(warehouse.table(&staging).unwrap().rows.len(), 1);
    }

    #[tokio::test]
    async fn malformed_rows_and_infrastructure_faults_map_differently() {
        let dir = tempdir().expect("tempdir");
        let scratch = ScratchSpace::new(dir.path());
        let warehouse = MemoryWarehouse::new();
        let staging = TableRef::new("ds", "t__staging_00000000");
        let loader = StagingLoader::new(&warehouse, Duration::from_secs(5));

        let ragged = artifact(&scratch, b"Unique_ID,Col1\n1,a,extra\n").await;
        assert!(matches!(
            loader.load(&ragged, &staging).await,
            Err(PipelineError::SchemaMismatch { .. })
        ));

        warehouse.fail_next(
            WarehouseOp::Load,
            WarehouseError::Transport("load job backend unavailable".into()),
        );
        let fine = artifact(&scratch, b"Unique_ID\n1\n").await;
        let err = loader.load(&fine, &staging).await.unwrap_err();
        assert!(err.is_transient());
        assert!(warehouse.table(&staging).is_none());
    }
}
