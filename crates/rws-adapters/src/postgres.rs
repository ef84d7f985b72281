//! PostgreSQL warehouse: a dataset is a schema, staging loads run in one transaction.

use async_trait::async_trait;
use rws_core::{quote_ident, ColumnDef, ColumnType, TableRef, TableSchema};
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Postgres, QueryBuilder};
use tracing::debug;

use crate::autodetect::parse_delimited;
use crate::{LoadJob, QueryJob, Warehouse, WarehouseError};

/// Postgres caps bind parameters per statement at `u16::MAX`.
const MAX_BIND_PARAMS: usize = 65_535;

#[derive(Debug, Clone)]
pub struct PostgresWarehouse {
    pool: PgPool,
}

impl PostgresWarehouse {
    pub async fn connect(database_url: &str) -> Result<Self, WarehouseError> {
        let pool = PgPoolOptions::new()
            .max_connections(4)
            .connect(database_url)
            .await
            .map_err(map_sqlx_error)?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

pub fn create_table_sql(table: &TableRef, schema: &TableSchema) -> String {
    let columns = schema
        .columns
        .iter()
        .map(|c| format!("{} {}", quote_ident(&c.name), c.column_type.sql_type()))
        .collect::<Vec<_>>()
        .join(", ");
    format!("CREATE TABLE {} ({columns})", table.quoted())
}

/// Map an `information_schema.columns.data_type` value back onto a detected type.
pub fn column_type_from_pg(data_type: &str) -> ColumnType {
    match data_type {
        "bigint" | "integer" | "smallint" => ColumnType::Integer,
        "double precision" | "real" | "numeric" => ColumnType::Float,
        "boolean" => ColumnType::Boolean,
        _ => ColumnType::String,
    }
}

pub fn map_sqlx_error(err: sqlx::Error) -> WarehouseError {
    match &err {
        sqlx::Error::Database(db) => {
            let code = db.code().map(|c| c.to_string()).unwrap_or_default();
            match code.get(..2) {
                // data exceptions, integrity violations
                Some("22") | Some("23") => WarehouseError::MalformedData(err.to_string()),
                // connection, transaction rollback, resources, operator intervention
                Some("08") | Some("40") | Some("53") | Some("57") => {
                    WarehouseError::Transport(err.to_string())
                }
                _ => WarehouseError::Rejected(err.to_string()),
            }
        }
        sqlx::Error::Io(_)
        | sqlx::Error::Tls(_)
        | sqlx::Error::Protocol(_)
        | sqlx::Error::PoolTimedOut
        | sqlx::Error::PoolClosed
        | sqlx::Error::WorkerCrashed => WarehouseError::Transport(err.to_string()),
        _ => WarehouseError::Rejected(err.to_string()),
    }
}

fn sqlstate(err: &sqlx::Error) -> Option<String> {
    err.as_database_error()
        .and_then(|db| db.code())
        .map(|c| c.to_string())
}

#[async_trait]
impl Warehouse for PostgresWarehouse {
    async fn load_table(&self, table: &TableRef, data: &[u8]) -> Result<LoadJob, WarehouseError> {
        let parsed = parse_delimited(data)?;
        let schema = parsed.schema;
        let column_list = schema
            .names()
            .map(quote_ident)
            .collect::<Vec<_>>()
            .join(", ");

        let mut tx = self.pool.begin().await.map_err(map_sqlx_error)?;
        sqlx::query(&format!("DROP TABLE IF EXISTS {}", table.quoted()))
            .execute(&mut *tx)
            .await
            .map_err(map_sqlx_error)?;
        sqlx::query(&create_table_sql(table, &schema))
            .execute(&mut *tx)
            .await
            .map_err(map_sqlx_error)?;

        let rows_per_statement = (MAX_BIND_PARAMS / schema.len().max(1)).max(1);
        for chunk in parsed.rows.chunks(rows_per_statement) {
            let mut builder: QueryBuilder<Postgres> = QueryBuilder::new(format!(
                "INSERT INTO {} ({column_list}) ",
                table.quoted()
            ));
            builder.push_values(chunk, |mut b, row| {
                for (value, column) in row.iter().zip(&schema.columns) {
                    b.push_bind(value.clone())
                        .push_unseparated(format!("::{}", column.column_type.sql_type()));
                }
            });
            builder
                .build()
                .execute(&mut *tx)
                .await
                .map_err(map_sqlx_error)?;
        }

        tx.commit().await.map_err(map_sqlx_error)?;
        debug!(table = %table, rows = parsed.rows.len(), "loaded staging rows");

        Ok(LoadJob {
            table: table.clone(),
            rows_loaded: parsed.rows.len(),
            schema,
        })
    }

    async fn get_table(&self, table: &TableRef) -> Result<Option<TableSchema>, WarehouseError> {
        let exists: bool = sqlx::query_scalar(
            "SELECT EXISTS (SELECT 1 FROM information_schema.tables \
             WHERE table_schema = $1 AND table_name = $2)",
        )
        .bind(&table.dataset)
        .bind(&table.table)
        .fetch_one(&self.pool)
        .await
        .map_err(map_sqlx_error)?;
        if !exists {
            return Ok(None);
        }

        let columns: Vec<(String, String)> = sqlx::query_as(
            "SELECT column_name::text, data_type::text FROM information_schema.columns \
             WHERE table_schema = $1 AND table_name = $2 ORDER BY ordinal_position",
        )
        .bind(&table.dataset)
        .bind(&table.table)
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx_error)?;

        Ok(Some(TableSchema::new(
            columns
                .into_iter()
                .map(|(name, data_type)| ColumnDef::new(name, column_type_from_pg(&data_type)))
                .collect(),
        )))
    }

    async fn create_table(
        &self,
        table: &TableRef,
        schema: &TableSchema,
    ) -> Result<(), WarehouseError> {
        match sqlx::query(&create_table_sql(table, schema))
            .execute(&self.pool)
            .await
        {
            Ok(_) => Ok(()),
            Err(err) if sqlstate(&err).as_deref() == Some("42P07") => {
                Err(WarehouseError::AlreadyExists(table.clone()))
            }
            Err(err) => Err(map_sqlx_error(err)),
        }
    }

    async fn delete_table(
        &self,
        table: &TableRef,
        ignore_missing: bool,
    ) -> Result<bool, WarehouseError> {
        match sqlx::query(&format!("DROP TABLE {}", table.quoted()))
            .execute(&self.pool)
            .await
        {
            Ok(_) => Ok(true),
            // undefined_table
            Err(err) if sqlstate(&err).as_deref() == Some("42P01") => {
                if ignore_missing {
                    Ok(false)
                } else {
                    Err(WarehouseError::NotFound(table.clone()))
                }
            }
            Err(err) => Err(map_sqlx_error(err)),
        }
    }

    async fn list_tables(&self, dataset: &str) -> Result<Vec<TableRef>, WarehouseError> {
        let names: Vec<String> = sqlx::query_scalar(
            "SELECT table_name::text FROM information_schema.tables \
             WHERE table_schema = $1 AND table_type = 'BASE TABLE' ORDER BY table_name",
        )
        .bind(dataset)
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx_error)?;
        Ok(names
            .into_iter()
            .map(|name| TableRef::new(dataset, name))
            .collect())
    }

    async fn execute_query(&self, sql: &str) -> Result<QueryJob, WarehouseError> {
        let result = sqlx::query(sql)
            .execute(&self.pool)
            .await
            .map_err(map_sqlx_error)?;
        Ok(QueryJob {
            rows_affected: result.rows_affected(),
        })
    }
}
