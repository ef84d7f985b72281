//! Core domain model, naming conventions and error taxonomy for RWS.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

pub const CRATE_NAME: &str = "rws-core";

/// Fixed substring that marks a warehouse table as a staging table.
pub const STAGING_MARKER: &str = "__staging_";

/// Longest identifier the warehouse keeps without truncating it.
pub const MAX_IDENTIFIER_LEN: usize = 63;

const RUN_SUFFIX_LEN: usize = 8;

/// Fully qualified table reference inside a warehouse dataset.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TableRef {
    pub dataset: String,
    pub table: String,
}

impl TableRef {
    pub fn new(dataset: impl Into<String>, table: impl Into<String>) -> Self {
        Self {
            dataset: dataset.into(),
            table: table.into(),
        }
    }

    /// Quoted `"dataset"."table"` form for SQL text.
    pub fn quoted(&self) -> String {
        format!("{}.{}", quote_ident(&self.dataset), quote_ident(&self.table))
    }
}

impl fmt::Display for TableRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.dataset, self.table)
    }
}

pub fn quote_ident(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ColumnType {
    Integer,
    Float,
    Boolean,
    String,
}

impl ColumnType {
    pub fn sql_type(self) -> &'static str {
        match self {
            ColumnType::Integer => "BIGINT",
            ColumnType::Float => "DOUBLE PRECISION",
            ColumnType::Boolean => "BOOLEAN",
            ColumnType::String => "TEXT",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnDef {
    pub name: String,
    pub column_type: ColumnType,
}

impl ColumnDef {
    pub fn new(name: impl Into<String>, column_type: ColumnType) -> Self {
        Self {
            name: name.into(),
            column_type,
        }
    }
}

/// Ordered column list of a warehouse table. May be empty for degenerate tables.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TableSchema {
    pub columns: Vec<ColumnDef>,
}

impl TableSchema {
    pub fn new(columns: Vec<ColumnDef>) -> Self {
        Self { columns }
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    pub fn len(&self) -> usize {
        self.columns.len()
    }

    pub fn column(&self, name: &str) -> Option<&ColumnDef> {
        self.columns.iter().find(|c| c.name == name)
    }

    pub fn position(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c.name == name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.column(name).is_some()
    }

    pub fn first(&self) -> Option<&ColumnDef> {
        self.columns.first()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.columns.iter().map(|c| c.name.as_str())
    }
}

/// How matched rows are treated when staging is merged into the target.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum MergePolicy {
    #[default]
    InsertOnly,
    /// Overwrite `update_columns` on matched rows; an empty list means every shared non-key column.
    Upsert {
        #[serde(default)]
        update_columns: Vec<String>,
    },
}

impl MergePolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            MergePolicy::InsertOnly => "insert_only",
            MergePolicy::Upsert { .. } => "upsert",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergeJob {
    pub source: TableRef,
    pub target: TableRef,
    pub key_column: String,
    pub policy: MergePolicy,
}

/// A merge resolved against both live schemas and ready to execute.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergeStatement {
    pub target: TableRef,
    pub source: TableRef,
    pub key_column: String,
    pub insert_columns: Vec<String>,
    pub update_columns: Vec<String>,
    /// Column types of the target; source values are cast to them.
    pub target_schema: TableSchema,
}

impl MergeStatement {
    /// `source.<column>`, cast to the target column's type when the target declares it.
    fn source_value(&self, column: &str) -> String {
        let quoted = quote_ident(column);
        match self.target_schema.column(column) {
            Some(def) => format!("source.{quoted}::{}", def.column_type.sql_type()),
            None => format!("source.{quoted}"),
        }
    }

    /// Render as a single `MERGE` statement. Null keys are skipped and the source is
    /// reduced to one row per key so the statement can never insert a duplicate key.
    pub fn to_sql(&self) -> String {
        let key = quote_ident(&self.key_column);
        let mut sql = format!(
            "MERGE INTO {target} AS target\n\
             USING (SELECT DISTINCT ON ({key}) * FROM {source} \
             WHERE {key} IS NOT NULL ORDER BY {key}) AS source\n\
             ON target.{key} = {source_key}\n",
            target = self.target.quoted(),
            source = self.source.quoted(),
            source_key = self.source_value(&self.key_column),
        );

        if !self.update_columns.is_empty() {
            let assignments = self
                .update_columns
                .iter()
                .map(|c| format!("{} = {}", quote_ident(c), self.source_value(c)))
                .collect::<Vec<_>>()
                .join(", ");
            sql.push_str(&format!("WHEN MATCHED THEN UPDATE SET {assignments}\n"));
        }

        let columns = self
            .insert_columns
            .iter()
            .map(|c| quote_ident(c))
            .collect::<Vec<_>>();
        let values = self
            .insert_columns
            .iter()
            .map(|c| self.source_value(c))
            .collect::<Vec<_>>();
        sql.push_str(&format!(
            "WHEN NOT MATCHED THEN INSERT ({}) VALUES ({})",
            columns.join(", "),
            values.join(", ")
        ));
        sql
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStage {
    Start,
    Extracted,
    Sanitized,
    Staged,
    SchemaReady,
    Merged,
    Done,
    Failed,
    CleanedUp,
}

impl RunStage {
    pub fn as_str(self) -> &'static str {
        match self {
            RunStage::Start => "start",
            RunStage::Extracted => "extracted",
            RunStage::Sanitized => "sanitized",
            RunStage::Staged => "staged",
            RunStage::SchemaReady => "schema_ready",
            RunStage::Merged => "merged",
            RunStage::Done => "done",
            RunStage::Failed => "failed",
            RunStage::CleanedUp => "cleaned_up",
        }
    }
}

impl fmt::Display for RunStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Replace every whitespace run with a single underscore.
pub fn underscore_whitespace(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut in_run = false;
    for ch in input.chars() {
        if ch.is_whitespace() {
            if !in_run {
                out.push('_');
                in_run = true;
            }
        } else {
            out.push(ch);
            in_run = false;
        }
    }
    out
}

/// Durable table name for a report: whitespace runs become `_`, then lowercased.
pub fn target_table_name(report_name: &str) -> Result<String, PipelineError> {
    let trimmed = report_name.trim();
    if trimmed.is_empty() {
        return Err(PipelineError::FatalConfig(
            "report name must not be empty".to_string(),
        ));
    }
    if trimmed.chars().any(|c| c.is_control() && !c.is_whitespace()) {
        return Err(PipelineError::FatalConfig(format!(
            "report name {report_name:?} contains control characters"
        )));
    }

    let name = underscore_whitespace(trimmed).to_lowercase();
    if name.contains(STAGING_MARKER) {
        return Err(PipelineError::FatalConfig(format!(
            "table name {name:?} collides with the staging marker {STAGING_MARKER:?}"
        )));
    }
    if name.len() + STAGING_MARKER.len() + RUN_SUFFIX_LEN > MAX_IDENTIFIER_LEN {
        return Err(PipelineError::FatalConfig(format!(
            "table name {name:?} is too long to carry a staging suffix"
        )));
    }
    Ok(name)
}

pub fn staging_prefix(target_table: &str) -> String {
    format!("{target_table}{STAGING_MARKER}")
}

/// Staging table name unique to one run of one report.
pub fn staging_table_name(target_table: &str, run_id: Uuid) -> String {
    let run = run_id.simple().to_string();
    format!("{}{}", staging_prefix(target_table), &run[..RUN_SUFFIX_LEN])
}

pub fn is_staging_table_for(target_table: &str, candidate: &str) -> bool {
    candidate.starts_with(&staging_prefix(target_table))
}

pub fn is_staging_table(candidate: &str) -> bool {
    candidate.contains(STAGING_MARKER)
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PipelineError {
    #[error("no report matches {report:?}")]
    NotFound { report: String },
    #[error("{count} reports match {report:?}")]
    AmbiguousMatch { report: String, count: usize },
    #[error("report {report:?} returned an empty result set")]
    EmptyDataset { report: String },
    #[error("schema mismatch on {table}: {message}")]
    SchemaMismatch { table: String, message: String },
    #[error("transient failure during {operation}: {message}")]
    TransientIo { operation: String, message: String },
    #[error("warehouse rejected {operation}: {message}")]
    WarehouseRejected { operation: String, message: String },
    #[error("invalid configuration: {0}")]
    FatalConfig(String),
    #[error("failed to clean up staging table {table}: {message}")]
    Cleanup { table: String, message: String },
}

impl PipelineError {
    /// Whether a later attempt of the same run could succeed unchanged.
    pub fn is_transient(&self) -> bool {
        matches!(self, PipelineError::TransientIo { .. })
    }

    pub fn kind(&self) -> &'static str {
        match self {
            PipelineError::NotFound { .. } => "not_found",
            PipelineError::AmbiguousMatch { .. } => "ambiguous_match",
            PipelineError::EmptyDataset { .. } => "empty_dataset",
            PipelineError::SchemaMismatch { .. } => "schema_mismatch",
            PipelineError::TransientIo { .. } => "transient_io",
            PipelineError::WarehouseRejected { .. } => "warehouse_rejected",
            PipelineError::FatalConfig(_) => "fatal_config",
            PipelineError::Cleanup { .. } => "cleanup",
        }
    }
}
