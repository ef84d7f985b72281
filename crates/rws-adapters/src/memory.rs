//! In-process collaborators for tests and dry runs.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use rws_core::{MergeStatement, TableRef, TableSchema};

use crate::autodetect::{assignable, parse_delimited, Row};
use crate::{
    LoadJob, QueryJob, ReportId, ReportSource, ResultFormat, SourceError, Warehouse,
    WarehouseError,
};

/// Report source backed by a fixed name → (id, body) catalogue.
#[derive(Debug, Default)]
pub struct StaticReportSource {
    titles: BTreeMap<String, Vec<ReportId>>,
    bodies: HashMap<ReportId, Vec<u8>>,
    failures: HashMap<ReportId, SourceError>,
}

impl StaticReportSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a report. Registering the same title twice makes the title ambiguous.
    pub fn with_report(mut self, title: &str, id: &str, body: impl Into<Vec<u8>>) -> Self {
        let id = ReportId::new(id);
        self.titles
            .entry(title.to_string())
            .or_default()
            .push(id.clone());
        self.bodies.insert(id, body.into());
        self
    }

    pub fn with_run_failure(mut self, id: &str, error: SourceError) -> Self {
        self.failures.insert(ReportId::new(id), error);
        self
    }
}

#[async_trait]
impl ReportSource for StaticReportSource {
    async fn search(&self, name: &str) -> Result<Vec<ReportId>, SourceError> {
        Ok(self.titles.get(name).cloned().unwrap_or_default())
    }

    async fn run(&self, id: &ReportId, _format: ResultFormat) -> Result<Vec<u8>, SourceError> {
        if let Some(err) = self.failures.get(id) {
            return Err(err.clone());
        }
        self.bodies
            .get(id)
            .cloned()
            .ok_or_else(|| SourceError::Rejected(format!("unknown report id {id}")))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WarehouseOp {
    Load,
    GetTable,
    CreateTable,
    DeleteTable,
    ListTables,
    Query,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct MemoryTable {
    pub schema: TableSchema,
    pub rows: Vec<Row>,
}

#[derive(Debug, Default)]
struct MemoryState {
    tables: BTreeMap<TableRef, MemoryTable>,
    failures: HashMap<WarehouseOp, VecDeque<WarehouseError>>,
    merges_executed: usize,
}

impl MemoryState {
    fn take_failure(&mut self, op: WarehouseOp) -> Result<(), WarehouseError> {
        match self.failures.get_mut(&op).and_then(|q| q.pop_front()) {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

/// Warehouse held in memory, with scripted failures per operation.
#[derive(Debug, Default)]
pub struct MemoryWarehouse {
    state: Mutex<MemoryState>,
}

impl MemoryWarehouse {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Make the next call of `op` fail with `error`. Failures queue up per operation.
    pub fn fail_next(&self, op: WarehouseOp, error: WarehouseError) {
        self.state()
            .failures
            .entry(op)
            .or_default()
            .push_back(error);
    }

    pub fn insert_table(&self, table: TableRef, schema: TableSchema, rows: Vec<Row>) {
        self.state()
            .tables
            .insert(table, MemoryTable { schema, rows });
    }

    pub fn table(&self, table: &TableRef) -> Option<MemoryTable> {
        self.state().tables.get(table).cloned()
    }

    pub fn table_names(&self, dataset: &str) -> Vec<String> {
        self.state()
            .tables
            .keys()
            .filter(|t| t.dataset == dataset)
            .map(|t| t.table.clone())
            .collect()
    }

    pub fn merges_executed(&self) -> usize {
        self.state().merges_executed
    }
}

#[async_trait]
impl Warehouse for MemoryWarehouse {
    async fn load_table(&self, table: &TableRef, data: &[u8]) -> Result<LoadJob, WarehouseError> {
        let mut state = self.state();
        state.take_failure(WarehouseOp::Load)?;
        let parsed = parse_delimited(data)?;
        let rows_loaded = parsed.rows.len();
        state.tables.insert(
            table.clone(),
            MemoryTable {
                schema: parsed.schema.clone(),
                rows: parsed.rows,
            },
        );
        Ok(LoadJob {
            table: table.clone(),
            rows_loaded,
            schema: parsed.schema,
        })
    }

    async fn get_table(&self, table: &TableRef) -> Result<Option<TableSchema>, WarehouseError> {
        let mut state = self.state();
        state.take_failure(WarehouseOp::GetTable)?;
        Ok(state.tables.get(table).map(|t| t.schema.clone()))
    }

    async fn create_table(
        &self,
        table: &TableRef,
        schema: &TableSchema,
    ) -> Result<(), WarehouseError> {
        let mut state = self.state();
        state.take_failure(WarehouseOp::CreateTable)?;
        if state.tables.contains_key(table) {
            return Err(WarehouseError::AlreadyExists(table.clone()));
        }
        state.tables.insert(
            table.clone(),
            MemoryTable {
                schema: schema.clone(),
                rows: Vec::new(),
            },
        );
        Ok(())
    }

    async fn delete_table(
        &self,
        table: &TableRef,
        ignore_missing: bool,
    ) -> Result<bool, WarehouseError> {
        let mut state = self.state();
        state.take_failure(WarehouseOp::DeleteTable)?;
        match state.tables.remove(table) {
            Some(_) => Ok(true),
            None if ignore_missing => Ok(false),
            None => Err(WarehouseError::NotFound(table.clone())),
        }
    }

    async fn list_tables(&self, dataset: &str) -> Result<Vec<TableRef>, WarehouseError> {
        let mut state = self.state();
        state.take_failure(WarehouseOp::ListTables)?;
        Ok(state
            .tables
            .keys()
            .filter(|t| t.dataset == dataset)
            .cloned()
            .collect())
    }

    async fn execute_query(&self, _sql: &str) -> Result<QueryJob, WarehouseError> {
        let mut state = self.state();
        state.take_failure(WarehouseOp::Query)?;
        Err(WarehouseError::Rejected(
            "memory warehouse only executes structured merges".to_string(),
        ))
    }

    async fn execute_merge(&self, statement: &MergeStatement) -> Result<QueryJob, WarehouseError> {
        let mut state = self.state();
        state.take_failure(WarehouseOp::Query)?;
        let job = apply_merge(&mut state.tables, statement)?;
        state.merges_executed += 1;
        Ok(job)
    }
}

fn column_index(
    schema: &TableSchema,
    table: &TableRef,
    column: &str,
) -> Result<usize, WarehouseError> {
    schema
        .position(column)
        .ok_or_else(|| WarehouseError::Rejected(format!("column {column:?} not found in {table}")))
}

/// Resolve every column pair first so a rejected statement leaves the target untouched.
fn apply_merge(
    tables: &mut BTreeMap<TableRef, MemoryTable>,
    stmt: &MergeStatement,
) -> Result<QueryJob, WarehouseError> {
    let source = tables
        .get(&stmt.source)
        .cloned()
        .ok_or_else(|| WarehouseError::NotFound(stmt.source.clone()))?;
    let target = tables
        .get_mut(&stmt.target)
        .ok_or_else(|| WarehouseError::NotFound(stmt.target.clone()))?;

    let pairs = |columns: &[String]| -> Result<Vec<(usize, usize)>, WarehouseError> {
        columns
            .iter()
            .map(|c| {
                let t = column_index(&target.schema, &stmt.target, c)?;
                let s = column_index(&source.schema, &stmt.source, c)?;
                let (from, to) = (
                    source.schema.columns[s].column_type,
                    target.schema.columns[t].column_type,
                );
                if !assignable(from, to) {
                    return Err(WarehouseError::Rejected(format!(
                        "column {c:?}: cannot assign {from:?} to {to:?}"
                    )));
                }
                Ok((t, s))
            })
            .collect()
    };
    let source_key = column_index(&source.schema, &stmt.source, &stmt.key_column)?;
    let target_key = column_index(&target.schema, &stmt.target, &stmt.key_column)?;
    let inserts = pairs(&stmt.insert_columns)?;
    let updates = pairs(&stmt.update_columns)?;
    let width = target.schema.len();

    let mut index: HashMap<String, usize> = target
        .rows
        .iter()
        .enumerate()
        .filter_map(|(i, row)| row[target_key].clone().map(|k| (k, i)))
        .collect();
    let mut seen = HashSet::new();
    let mut rows_affected = 0u64;

    for row in &source.rows {
        let Some(key) = row[source_key].clone() else {
            continue;
        };
        if !seen.insert(key.clone()) {
            continue;
        }
        match index.get(&key) {
            Some(&i) => {
                if updates.is_empty() {
                    continue;
                }
                for &(t, s) in &updates {
                    target.rows[i][t] = row[s].clone();
                }
                rows_affected += 1;
            }
            None => {
                let mut new_row = vec![None; width];
                for &(t, s) in &inserts {
                    new_row[t] = row[s].clone();
                }
                new_row[target_key] = Some(key.clone());
                target.rows.push(new_row);
                index.insert(key, target.rows.len() - 1);
                rows_affected += 1;
            }
        }
    }

    Ok(QueryJob { rows_affected })
}
