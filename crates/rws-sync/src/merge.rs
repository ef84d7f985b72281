//! Key-based merge of staging rows into the target table.

use std::time::Duration;

use rws_adapters::Warehouse;
use rws_core::{MergeJob, MergePolicy, MergeStatement, PipelineError, TableSchema};
use tracing::info;

use crate::{bounded, warehouse_failure};

#[derive(Debug, Clone)]
pub struct MergeOutcome {
    pub statement: MergeStatement,
    pub rows_affected: u64,
}

/// Resolve a job against both schemas. Fails closed: nothing is executed on error.
pub fn plan_merge(
    job: &MergeJob,
    staging: &TableSchema,
    target: &TableSchema,
) -> Result<MergeStatement, PipelineError> {
    let key = job.key_column.as_str();
    if !staging.contains(key) {
        return Err(PipelineError::SchemaMismatch {
            table: job.source.to_string(),
            message: format!("key column {key:?} is missing from staging"),
        });
    }
    if !target.contains(key) {
        return Err(PipelineError::SchemaMismatch {
            table: job.target.to_string(),
            message: format!("key column {key:?} is missing from target"),
        });
    }

    let insert_columns: Vec<String> = target
        .names()
        .filter(|name| staging.contains(name))
        .map(str::to_string)
        .collect();

    let update_columns = match &job.policy {
        MergePolicy::InsertOnly => Vec::new(),
        MergePolicy::Upsert { update_columns } if update_columns.is_empty() => insert_columns
            .iter()
            .filter(|name| name.as_str() != key)
            .cloned()
            .collect(),
        MergePolicy::Upsert { update_columns } => {
            for column in update_columns {
                if column == key {
                    return Err(PipelineError::SchemaMismatch {
                        table: job.target.to_string(),
                        message: format!("key column {key:?} cannot be an update column"),
                    });
                }
                if !insert_columns.contains(column) {
                    return Err(PipelineError::SchemaMismatch {
                        table: job.target.to_string(),
                        message: format!(
                            "update column {column:?} must exist in both staging and target"
                        ),
                    });
                }
            }
            update_columns.clone()
        }
    };

    Ok(MergeStatement {
        target: job.target.clone(),
        source: job.source.clone(),
        key_column: job.key_column.clone(),
        insert_columns,
        update_columns,
        target_schema: target.clone(),
    })
}

pub struct Merger<'a> {
    warehouse: &'a dyn Warehouse,
    timeout: Duration,
}

impl<'a> Merger<'a> {
    pub fn new(warehouse: &'a dyn Warehouse, timeout: Duration) -> Self {
        Self { warehouse, timeout }
    }

    pub async fn merge(
        &self,
        job: &MergeJob,
        staging: &TableSchema,
        target: &TableSchema,
    ) -> Result<MergeOutcome, PipelineError> {
        let statement = plan_merge(job, staging, target)?;
        let result = bounded(self.timeout, "merge", async {
            self.warehouse
                .execute_merge(&statement)
                .await
                .map_err(|e| warehouse_failure("merge", &job.target, e))
        })
        .await?;

        info!(
            target = %job.target,
            key = %job.key_column,
            policy = job.policy.as_str(),
            rows = result.rows_affected,
            "merged staging into target"
        );
        Ok(MergeOutcome {
            statement,
            rows_affected: result.rows_affected,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rws_core::{ColumnDef, ColumnType, TableRef};

    fn schema(names: &[&str]) -> TableSchema {
        TableSchema::new(
            names
                .iter()
                .map(|n| ColumnDef::new(*n, ColumnType::String))
                .collect(),
        )
    }

    fn job(key: &str, policy: MergePolicy) -> MergeJob {
        MergeJob {
            source: TableRef::new("ds", "t__staging_00000000"),
            target: TableRef::new("ds", "t"),
            key_column: key.to_string(),
            policy,
        }
    }

    #[test]
    fn missing_key_fails_on_either_side() {
        let staging = schema(&["Unique_ID", "Col1"]);
        let target = schema(&["Other_ID", "Col1"]);
        let err = plan_merge(&job("Unique_ID", MergePolicy::InsertOnly), &staging, &target)
            .unwrap_err();
        assert_eq!(
            err,
            PipelineError::SchemaMismatch {
                table: "ds.t".into(),
                message: "key column \"Unique_ID\" is missing from target".into()
            }
        );
        let err = plan_merge(&job("Other_ID", MergePolicy::InsertOnly), &staging, &target)
            .unwrap_err();
        assert!(matches!(
            err,
            PipelineError::SchemaMismatch { table, .. } if table == "ds.t__staging_00000000"
        ));
    }

    #[test]
    fn insert_columns_follow_target_order_and_skip_staging_extras() {
        let staging = schema(&["Col2", "Unique_ID", "Col1"]);
        let target = schema(&["Unique_ID", "Col1", "Legacy"]);
        let stmt = plan_merge(&job("Unique_ID", MergePolicy::InsertOnly), &staging, &target)
            .unwrap();
        assert_eq!(stmt.insert_columns, vec!["Unique_ID", "Col1"]);
        assert!(stmt.update_columns.is_empty());
        assert_eq!(stmt.target_schema, target);
    }

    #[test]
    fn upsert_defaults_to_every_shared_non_key_column() {
        let both = schema(&["Unique_ID", "Col1", "Col2"]);
        let stmt = plan_merge(
            &job(
                "Unique_ID",
                MergePolicy::Upsert {
                    update_columns: vec![],
                },
            ),
            &both,
            &both,
        )
        .unwrap();
        assert_eq!(stmt.update_columns, vec!["Col1", "Col2"]);
    }

    #[test]
    fn upsert_rejects_key_and_unknown_update_columns() {
        let both = schema(&["Unique_ID", "Col1"]);
        for bad in ["Unique_ID", "Nope"] {
            let err = plan_merge(
                &job(
                    "Unique_ID",
                    MergePolicy::Upsert {
                        update_columns: vec![bad.to_string()],
                    },
                ),
                &both,
                &both,
            )
            .unwrap_err();
            assert!(matches!(err, PipelineError::SchemaMismatch { .. }));
        }
    }
}
