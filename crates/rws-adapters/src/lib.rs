//! Reporting-source and warehouse collaborator contracts + implementations.

use std::fmt;

use async_trait::async_trait;
use rws_core::{MergeStatement, TableRef, TableSchema};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod autodetect;
pub mod looker;
pub mod memory;
pub mod postgres;

pub use looker::{LookerConfig, LookerSource};
pub use memory::{MemoryTable, MemoryWarehouse, StaticReportSource, WarehouseOp};
pub use postgres::PostgresWarehouse;

pub const CRATE_NAME: &str = "rws-adapters";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResultFormat {
    Csv,
}

impl ResultFormat {
    pub fn as_str(self) -> &'static str {
        match self {
            ResultFormat::Csv => "csv",
        }
    }
}

/// Opaque identifier of a saved report in the reporting source.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ReportId(pub String);

impl ReportId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ReportId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SourceError {
    #[error("transport failure: {0}")]
    Transport(String),
    #[error("authentication failed: {0}")]
    Auth(String),
    #[error("source rejected request: {0}")]
    Rejected(String),
}

impl SourceError {
    pub fn is_transient(&self) -> bool {
        matches!(self, SourceError::Transport(_))
    }
}

#[async_trait]
pub trait ReportSource: Send + Sync {
    /// Identifiers of every saved report whose title matches `name`.
    async fn search(&self, name: &str) -> Result<Vec<ReportId>, SourceError>;

    /// Rendered report output.
    async fn run(&self, id: &ReportId, format: ResultFormat) -> Result<Vec<u8>, SourceError>;
}

/// Completed bulk load into a table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadJob {
    pub table: TableRef,
    pub rows_loaded: usize,
    pub schema: TableSchema,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct QueryJob {
    pub rows_affected: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WarehouseError {
    #[error("table {0} not found")]
    NotFound(TableRef),
    #[error("table {0} already exists")]
    AlreadyExists(TableRef),
    #[error("malformed data: {0}")]
    MalformedData(String),
    #[error("transport failure: {0}")]
    Transport(String),
    #[error("rejected: {0}")]
    Rejected(String),
}

impl WarehouseError {
    pub fn is_transient(&self) -> bool {
        matches!(self, WarehouseError::Transport(_))
    }
}

#[async_trait]
pub trait Warehouse: Send + Sync {
    /// Replace `table` with the delimited `data`, detecting column types from the rows.
    /// Returns once the load has finished.
    async fn load_table(&self, table: &TableRef, data: &[u8]) -> Result<LoadJob, WarehouseError>;

    async fn get_table(&self, table: &TableRef) -> Result<Option<TableSchema>, WarehouseError>;

    async fn create_table(
        &self,
        table: &TableRef,
        schema: &TableSchema,
    ) -> Result<(), WarehouseError>;

    /// Returns whether a table was actually removed.
    async fn delete_table(
        &self,
        table: &TableRef,
        ignore_missing: bool,
    ) -> Result<bool, WarehouseError>;

    async fn list_tables(&self, dataset: &str) -> Result<Vec<TableRef>, WarehouseError>;

    async fn execute_query(&self, sql: &str) -> Result<QueryJob, WarehouseError>;

    async fn execute_merge(&self, statement: &MergeStatement) -> Result<QueryJob, WarehouseError> {
        self.execute_query(&statement.to_sql()).await
    }
}
