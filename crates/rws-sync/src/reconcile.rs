//! Make sure the durable target table exists before anything is merged into it.

use std::time::Duration;

use rws_adapters::Warehouse;
use rws_core::{PipelineError, TableRef, TableSchema};
use serde::Serialize;
use tracing::{info, warn};

use crate::{bounded, warehouse_failure};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetAction {
    /// Target was absent and got created from the staging schema.
    Created,
    /// Target existed without columns and was rebuilt from the staging schema.
    Recreated,
    /// Target already had a schema and was left alone.
    Existing,
}

#[derive(Debug, Clone)]
pub struct ReconciledSchemas {
    pub staging: TableSchema,
    pub target: TableSchema,
    pub action: TargetAction,
}

pub struct SchemaReconciler<'a> {
    warehouse: &'a dyn Warehouse,
    timeout: Duration,
}

impl<'a> SchemaReconciler<'a> {
    pub fn new(warehouse: &'a dyn Warehouse, timeout: Duration) -> Self {
        Self { warehouse, timeout }
    }

    pub async fn reconcile(
        &self,
        staging: &TableRef,
        target: &TableRef,
    ) -> Result<ReconciledSchemas, PipelineError> {
        let staging_schema = match self.lookup(staging).await? {
            Some(schema) if !schema.is_empty() => schema,
            Some(_) => {
                return Err(PipelineError::SchemaMismatch {
                    table: staging.to_string(),
                    message: "staging table has no columns".to_string(),
                })
            }
            None => {
                return Err(PipelineError::WarehouseRejected {
                    operation: "staging schema read".to_string(),
                    message: format!("staging table {staging} is missing after load"),
                })
            }
        };

        let (target_schema, action) = match self.lookup(target).await? {
            None => {
                self.create(target, &staging_schema).await?;
                (staging_schema.clone(), TargetAction::Created)
            }
            Some(existing) if existing.is_empty() => {
                bounded(self.timeout, "target delete", async {
                    self.warehouse
                        .delete_table(target, true)
                        .await
                        .map_err(|e| warehouse_failure("target delete", target, e))
                })
                .await?;
                self.create(target, &staging_schema).await?;
                (staging_schema.clone(), TargetAction::Recreated)
            }
            Some(existing) => {
                let unmapped: Vec<&str> = staging_schema
                    .names()
                    .filter(|name| !existing.contains(name))
                    .collect();
                if !unmapped.is_empty() {
                    warn!(
                        target = %target,
                        columns = ?unmapped,
                        "staging columns missing from target are not merged"
                    );
                }
                (existing, TargetAction::Existing)
            }
        };

        info!(
            target = %target,
            action = ?action,
            columns = target_schema.len(),
            "target schema ready"
        );
        Ok(ReconciledSchemas {
            staging: staging_schema,
            target: target_schema,
            action,
        })
    }

    async fn lookup(&self, table: &TableRef) -> Result<Option<TableSchema>, PipelineError> {
        bounded(self.timeout, "schema read", async {
            self.warehouse
                .get_table(table)
                .await
                .map_err(|e| warehouse_failure("schema read", table, e))
        })
        .await
    }

    async fn create(&self, table: &TableRef, schema: &TableSchema) -> Result<(), PipelineError> {
        bounded(self.timeout, "target create", async {
            self.warehouse
                .create_table(table, schema)
                .await
                .map_err(|e| warehouse_failure("target create", table, e))
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rws_adapters::MemoryWarehouse;
    use rws_core::{ColumnDef, ColumnType};

    fn tables() -> (TableRef, TableRef) {
        (
            TableRef::new("ds", "t__staging_00000000"),
            TableRef::new("ds", "t"),
        )
    }

    async fn staged() -> MemoryWarehouse {
        let warehouse = MemoryWarehouse::new();
        let (staging, _) = tables();
        warehouse
            .load_table(&staging, b"Unique_ID,Col1,Col2\n1,a,x\n")
            .await
            .unwrap();
        warehouse
    }

    #[tokio::test]
    async fn absent_target_is_created_from_staging() {
        let warehouse = staged().await;
        let (staging, target) = tables();
        let out = SchemaReconciler::new(&warehouse, Duration::from_secs(5))
            .reconcile(&staging, &target)
            .await
            .unwrap();
        assert_eq!(out.action, TargetAction::Created);
        assert_eq!(warehouse.table(&target).unwrap().schema, out.staging);
        assert!(warehouse.table(&target).unwrap().rows.is_empty());
    }

    #[tokio::test]
    async fn columnless_target_is_rebuilt() {
        let warehouse = staged().await;
        let (staging, target) = tables();
        warehouse.insert_table(target.clone(), TableSchema::default(), vec![]);
        let out = SchemaReconciler::new(&warehouse, Duration::from_secs(5))
            .reconcile(&staging, &target)
            .await
            .unwrap();
        assert_eq!(out.action, TargetAction::Recreated);
        assert_eq!(warehouse.table(&target).unwrap().schema.len(), 3);
    }

    #[tokio::test]
    async fn populated_target_schema_is_never_widened() {
        let warehouse = staged().await;
        let (staging, target) = tables();
        let narrow = TableSchema::new(vec![
            ColumnDef::new("Unique_ID", ColumnType::Integer),
            ColumnDef::new("Col1", ColumnType::String),
        ]);
        warehouse.insert_table(target.clone(), narrow.clone(), vec![]);
        let out = SchemaReconciler::new(&warehouse, Duration::from_secs(5))
            .reconcile(&staging, &target)
            .await
            .unwrap();
        assert_eq!(out.action, TargetAction::Existing);
        assert_eq!(out.target, narrow);
        assert_eq!(warehouse.table(&target).unwrap().schema, narrow);
    }

    #[tokio::test]
    async fn missing_staging_table_is_fatal() {
        let warehouse = MemoryWarehouse::new();
        let (staging, target) = tables();
        let err = SchemaReconciler::new(&warehouse, Duration::from_secs(5))
            .reconcile(&staging, &target)
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::WarehouseRejected { .. }));
        assert!(warehouse.table(&target).is_none());
    }
}
