//! Delimited-text parsing with column type detection.

use std::collections::HashSet;

use csv::ReaderBuilder;
use rws_core::{ColumnDef, ColumnType, TableSchema};

use crate::WarehouseError;

pub type Row = Vec<Option<String>>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DelimitedTable {
    pub schema: TableSchema,
    /// Values in canonical text form for their detected type; empty fields are `None`.
    pub rows: Vec<Row>,
}

/// Parse a header + rows blob and infer one type per column.
pub fn parse_delimited(data: &[u8]) -> Result<DelimitedTable, WarehouseError> {
    let mut reader = ReaderBuilder::new()
        .has_headers(true)
        .flexible(false)
        .from_reader(data);

    let headers = reader
        .headers()
        .map_err(|e| WarehouseError::MalformedData(format!("reading header: {e}")))?
        .clone();
    if headers.is_empty() || headers.iter().all(|h| h.is_empty()) {
        return Err(WarehouseError::MalformedData(
            "dataset has no header row".to_string(),
        ));
    }

    let mut seen = HashSet::new();
    for name in headers.iter() {
        if name.is_empty() {
            return Err(WarehouseError::MalformedData(
                "header contains an empty column name".to_string(),
            ));
        }
        if !seen.insert(name) {
            return Err(WarehouseError::MalformedData(format!(
                "duplicate column name {name:?}"
            )));
        }
    }

    let mut raw_rows: Vec<Row> = Vec::new();
    for record in reader.records() {
        let record = record.map_err(|e| WarehouseError::MalformedData(e.to_string()))?;
        raw_rows.push(
            record
                .iter()
                .map(|v| if v.is_empty() { None } else { Some(v.to_string()) })
                .collect(),
        );
    }

    let mut detected: Vec<Option<ColumnType>> = vec![None; headers.len()];
    for row in &raw_rows {
        for (slot, value) in detected.iter_mut().zip(row) {
            if let Some(value) = value {
                let observed = classify_value(value);
                *slot = Some(match *slot {
                    Some(current) => widen(current, observed),
                    None => observed,
                });
            }
        }
    }

    let columns: Vec<ColumnDef> = headers
        .iter()
        .zip(&detected)
        .map(|(name, ty)| ColumnDef::new(name, ty.unwrap_or(ColumnType::String)))
        .collect();

    let rows = raw_rows
        .into_iter()
        .map(|row| {
            row.into_iter()
                .zip(&columns)
                .map(|(value, col)| value.map(|v| canonicalize(&v, col.column_type)))
                .collect()
        })
        .collect();

    Ok(DelimitedTable {
        schema: TableSchema::new(columns),
        rows,
    })
}

pub fn classify_value(value: &str) -> ColumnType {
    if value.parse::<i64>().is_ok() {
        ColumnType::Integer
    } else if value.parse::<f64>().map(|v| v.is_finite()).unwrap_or(false) {
        ColumnType::Float
    } else if value.eq_ignore_ascii_case("true") || value.eq_ignore_ascii_case("false") {
        ColumnType::Boolean
    } else {
        ColumnType::String
    }
}

/// Narrowest type that holds values of both `a` and `b`.
pub fn widen(a: ColumnType, b: ColumnType) -> ColumnType {
    match (a, b) {
        (x, y) if x == y => x,
        (ColumnType::Integer, ColumnType::Float) | (ColumnType::Float, ColumnType::Integer) => {
            ColumnType::Float
        }
        _ => ColumnType::String,
    }
}

/// Whether a value of type `from` can be written into a column of type `to`.
pub fn assignable(from: ColumnType, to: ColumnType) -> bool {
    from == to || widen(from, to) == to
}

fn canonicalize(value: &str, column_type: ColumnType) -> String {
    match column_type {
        ColumnType::Integer => value
            .parse::<i64>()
            .map(|v| v.to_string())
            .unwrap_or_else(|_| value.to_string()),
        ColumnType::Float => value
            .parse::<f64>()
            .map(|v| v.to_string())
            .unwrap_or_else(|_| value.to_string()),
        ColumnType::Boolean => value.to_ascii_lowercase(),
        ColumnType::String => value.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detects_types_per_column() {
        let table = parse_delimited(
            b"Unique_ID,Amount_Paid,Active,Name,Empty\n1,10,true,Ann,\n2,12.5,FALSE,Bob,\n",
        )
        .unwrap();
        let types: Vec<_> = table
            .schema
            .columns
            .iter()
            .map(|c| (c.name.as_str(), c.column_type))
            .collect();
        assert_eq!(
            types,
            vec![
                ("Unique_ID", ColumnType::Integer),
                ("Amount_Paid", ColumnType::Float),
                ("Active", ColumnType::Boolean),
                ("Name", ColumnType::String),
                ("Empty", ColumnType::String),
            ]
        );
        assert_eq!(table.rows.len(), 2);
        assert_eq!(table.rows[0][1].as_deref(), Some("10"));
        assert_eq!(table.rows[1][2].as_deref(), Some("false"));
        assert_eq!(table.rows[0][4], None);
    }

    #[test]
    fn quoted_fields_keep_embedded_commas() {
        let table = parse_delimited(b"id,label\n1,\"a, b\"\n").unwrap();
        assert_eq!(table.rows[0][1].as_deref(), Some("a, b"));
    }

    #[test]
    fn ragged_rows_are_malformed() {
        let err = parse_delimited(b"id,label\n1,a,extra\n").unwrap_err();
        assert!(matches!(err, WarehouseError::MalformedData(_)));
    }

    #[test]
    fn duplicate_headers_are_malformed() {
        let err = parse_delimited(b"id,id\n1,2\n").unwrap_err();
        assert!(matches!(err, WarehouseError::MalformedData(_)));
    }

    #[test]
    fn header_only_dataset_has_string_columns_and_no_rows() {
        let table = parse_delimited(b"id,label\n").unwrap();
        assert!(table.rows.is_empty());
        assert!(table
            .schema
            .columns
            .iter()
            .all(|c| c.column_type == ColumnType::String));
    }

    #[test]
    fn widening_prefers_float_then_string() {
        assert_eq!(widen(ColumnType::Integer, ColumnType::Float), ColumnType::Float);
        assert_eq!(widen(ColumnType::Boolean, ColumnType::Integer), ColumnType::String);
        assert!(assignable(ColumnType::Integer, ColumnType::Float));
        assert!(assignable(ColumnType::Boolean, ColumnType::String));
        assert!(!assignable(ColumnType::String, ColumnType::Integer));
    }
}
