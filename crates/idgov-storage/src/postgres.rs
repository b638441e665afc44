//! Postgres-backed warehouse sink.

use async_trait::async_trait;
use chrono::{NaiveDate, NaiveDateTime};
use idgov_core::{Cell, Table};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::{Postgres, QueryBuilder, Row};

use crate::warehouse::{WarehouseError, WarehouseSink, DEFAULT_PARAMETER_LIMIT};

const UNDEFINED_TABLE: &str = "42P01";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ColumnKind {
    Bool,
    Int,
    Float,
    Timestamp,
    Date,
    Text,
}

impl ColumnKind {
    fn from_data_type(data_type: &str) -> Self {
        match data_type {
            "boolean" => ColumnKind::Bool,
            "smallint" | "integer" | "bigint" => ColumnKind::Int,
            "real" | "double precision" | "numeric" => ColumnKind::Float,
            "timestamp without time zone" | "timestamp with time zone" => ColumnKind::Timestamp,
            "date" => ColumnKind::Date,
            _ => ColumnKind::Text,
        }
    }

    fn of_cell(cell: &Cell) -> Option<Self> {
        match cell {
            Cell::Null => None,
            Cell::Bool(_) => Some(ColumnKind::Bool),
            Cell::Int(_) => Some(ColumnKind::Int),
            Cell::Float(_) => Some(ColumnKind::Float),
            Cell::Timestamp(_) => Some(ColumnKind::Timestamp),
            Cell::Date(_) => Some(ColumnKind::Date),
            Cell::Text(_) => Some(ColumnKind::Text),
        }
    }

    /// Narrowest kind that holds values of both kinds.
    fn widen(self, other: Self) -> Self {
        match (self, other) {
            (a, b) if a == b => a,
            (ColumnKind::Int, ColumnKind::Float) | (ColumnKind::Float, ColumnKind::Int) => {
                ColumnKind::Float
            }
            (ColumnKind::Date, ColumnKind::Timestamp) | (ColumnKind::Timestamp, ColumnKind::Date) => {
                ColumnKind::Timestamp
            }
            _ => ColumnKind::Text,
        }
    }

    /// Kind of a new column, widened over every non-null value. All-null columns are text.
    fn infer<'a>(cells: impl Iterator<Item = &'a Cell>) -> Self {
        cells
            .filter_map(Self::of_cell)
            .reduce(Self::widen)
            .unwrap_or(ColumnKind::Text)
    }

    fn ddl(&self) -> &'static str {
        match self {
            ColumnKind::Bool => "BOOLEAN",
            ColumnKind::Int => "BIGINT",
            ColumnKind::Float => "DOUBLE PRECISION",
            ColumnKind::Timestamp => "TIMESTAMP",
            ColumnKind::Date => "DATE",
            ColumnKind::Text => "TEXT",
        }
    }
}

/// A cell converted to the type of its destination column.
#[derive(Debug, Clone)]
enum SqlValue {
    Bool(Option<bool>),
    Int(Option<i64>),
    Float(Option<f64>),
    Timestamp(Option<NaiveDateTime>),
    Date(Option<NaiveDate>),
    Text(Option<String>),
}

fn parse_timestamp(text: &str) -> Option<NaiveDateTime> {
    const FORMATS: [&str; 3] = ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M"];
    FORMATS
        .iter()
        .find_map(|f| NaiveDateTime::parse_from_str(text.trim(), f).ok())
        .or_else(|| parse_date(text).and_then(|d| d.and_hms_opt(0, 0, 0)))
}

fn parse_date(text: &str) -> Option<NaiveDate> {
    NaiveDate::parse_from_str(text.trim(), "%Y-%m-%d").ok()
}

fn convert(column: &str, kind: ColumnKind, cell: &Cell) -> Result<SqlValue, WarehouseError> {
    let mismatch = || WarehouseError::TypeMismatch {
        column: column.to_string(),
        expected: kind.ddl().to_string(),
        value: cell.to_string(),
    };

    if cell.is_null() {
        return Ok(match kind {
            ColumnKind::Bool => SqlValue::Bool(None),
            ColumnKind::Int => SqlValue::Int(None),
            ColumnKind::Float => SqlValue::Float(None),
            ColumnKind::Timestamp => SqlValue::Timestamp(None),
            ColumnKind::Date => SqlValue::Date(None),
            ColumnKind::Text => SqlValue::Text(None),
        });
    }

    Ok(match kind {
        ColumnKind::Bool => SqlValue::Bool(Some(cell.as_bool().ok_or_else(mismatch)?)),
        ColumnKind::Int => SqlValue::Int(Some(cell.as_i64().ok_or_else(mismatch)?)),
        ColumnKind::Float => SqlValue::Float(Some(match cell {
            Cell::Int(i) => *i as f64,
            Cell::Float(f) => *f,
            Cell::Text(s) => s.trim().parse().map_err(|_| mismatch())?,
            _ => return Err(mismatch()),
        })),
        ColumnKind::Timestamp => SqlValue::Timestamp(Some(match cell {
            Cell::Timestamp(ts) => *ts,
            Cell::Date(d) => d.and_hms_opt(0, 0, 0).ok_or_else(mismatch)?,
            Cell::Text(s) => parse_timestamp(s).ok_or_else(mismatch)?,
            _ => return Err(mismatch()),
        })),
        ColumnKind::Date => SqlValue::Date(Some(match cell {
            Cell::Date(d) => *d,
            Cell::Timestamp(ts) => ts.date(),
            Cell::Text(s) => parse_date(s).ok_or_else(mismatch)?,
            _ => return Err(mismatch()),
        })),
        ColumnKind::Text => SqlValue::Text(Some(cell.to_string())),
    })
}

fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

fn is_undefined_table(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Database(db) if db.code().as_deref() == Some(UNDEFINED_TABLE))
}

fn cell_from_row(row: &PgRow, idx: usize, kind: ColumnKind) -> Result<Cell, sqlx::Error> {
    Ok(match kind {
        ColumnKind::Bool => row.try_get::<Option<bool>, _>(idx)?.into(),
        ColumnKind::Int => row.try_get::<Option<i64>, _>(idx)?.into(),
        ColumnKind::Float => row
            .try_get::<Option<f64>, _>(idx)?
            .map(Cell::Float)
            .unwrap_or(Cell::Null),
        ColumnKind::Timestamp => row
            .try_get::<Option<NaiveDateTime>, _>(idx)?
            .map(Cell::Timestamp)
            .unwrap_or(Cell::Null),
        ColumnKind::Date => row
            .try_get::<Option<NaiveDate>, _>(idx)?
            .map(Cell::Date)
            .unwrap_or(Cell::Null),
        ColumnKind::Text => row.try_get::<Option<String>, _>(idx)?.into(),
    })
}

/// Column projection that reads every kind back in a type the row decoder accepts.
fn select_expr(name: &str, kind: ColumnKind) -> String {
    let col = quote_ident(name);
    match kind {
        ColumnKind::Int => format!("{col}::BIGINT"),
        ColumnKind::Float => format!("{col}::DOUBLE PRECISION"),
        ColumnKind::Timestamp => format!("{col}::TIMESTAMP"),
        ColumnKind::Text => format!("{col}::TEXT"),
        ColumnKind::Bool | ColumnKind::Date => col,
    }
}

#[derive(Debug, Clone)]
pub struct PgWarehouse {
    pool: PgPool,
    schema: String,
    parameter_limit: usize,
}

impl PgWarehouse {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            schema: "public".into(),
            parameter_limit: DEFAULT_PARAMETER_LIMIT,
        }
    }

    /// Lazily connecting pool; no connection is opened until the first operation.
    pub fn connect_lazy(database_url: &str) -> Result<Self, WarehouseError> {
        let pool = PgPoolOptions::new()
            .max_connections(2)
            .connect_lazy(database_url)?;
        Ok(Self::new(pool))
    }

    pub fn with_schema(mut self, schema: impl Into<String>) -> Self {
        self.schema = schema.into();
        self
    }

    pub fn with_parameter_limit(mut self, limit: usize) -> Self {
        self.parameter_limit = limit.max(1);
        self
    }

    fn qualified(&self, table: &str) -> String {
        format!("{}.{}", quote_ident(&self.schema), quote_ident(table))
    }

    fn map_err(&self, table: &str, err: sqlx::Error) -> WarehouseError {
        if is_undefined_table(&err) {
            WarehouseError::TableNotFound(table.to_string())
        } else {
            WarehouseError::Database(err)
        }
    }

    /// Existing columns in ordinal order; empty when the table does not exist.
    async fn column_kinds(&self, table: &str) -> Result<Vec<(String, ColumnKind)>, WarehouseError> {
        let mut conn = self.pool.acquire().await?;
        let rows = sqlx::query(
            "SELECT column_name::TEXT, data_type::TEXT FROM information_schema.columns \
             WHERE table_schema = $1 AND table_name = $2 ORDER BY ordinal_position",
        )
        .bind(&self.schema)
        .bind(table)
        .fetch_all(&mut *conn)
        .await?;

        rows.iter()
            .map(|row| {
                let name: String = row.try_get(0)?;
                let data_type: String = row.try_get(1)?;
                Ok((name, ColumnKind::from_data_type(&data_type)))
            })
            .collect::<Result<Vec<_>, sqlx::Error>>()
            .map_err(WarehouseError::from)
    }

    async fn create_table(
        &self,
        table: &str,
        columns: &[String],
        rows: &[Vec<Cell>],
    ) -> Result<Vec<(String, ColumnKind)>, WarehouseError> {
        let kinds: Vec<(String, ColumnKind)> = columns
            .iter()
            .enumerate()
            .map(|(i, name)| {
                (
                    name.clone(),
                    ColumnKind::infer(rows.iter().map(|r| &r[i])),
                )
            })
            .collect();
        let ddl = format!(
            "CREATE TABLE IF NOT EXISTS {} ({})",
            self.qualified(table),
            kinds
                .iter()
                .map(|(name, kind)| format!("{} {}", quote_ident(name), kind.ddl()))
                .collect::<Vec<_>>()
                .join(", ")
        );

        let mut conn = self.pool.acquire().await?;
        sqlx::query(&ddl).execute(&mut *conn).await?;
        tracing::info!(table, columns = kinds.len(), "table created");
        Ok(kinds)
    }
}

#[async_trait]
impl WarehouseSink for PgWarehouse {
    fn parameter_limit(&self) -> usize {
        self.parameter_limit
    }

    async fn ensure_table(&self, table: &str, rows: &Table) -> Result<(), WarehouseError> {
        if self.column_kinds(table).await?.is_empty() {
            self.create_table(table, rows.columns(), rows.rows()).await?;
        }
        Ok(())
    }

    async fn delete_all(&self, table: &str) -> Result<u64, WarehouseError> {
        let mut conn = self.pool.acquire().await?;
        let sql = format!("DELETE FROM {}", self.qualified(table));
        let result = sqlx::query(&sql)
            .execute(&mut *conn)
            .await
            .map_err(|e| self.map_err(table, e))?;
        Ok(result.rows_affected())
    }

    async fn delete_where(
        &self,
        table: &str,
        column: &str,
        value: &Cell,
    ) -> Result<u64, WarehouseError> {
        let mut conn = self.pool.acquire().await?;
        let sql = format!(
            "DELETE FROM {} WHERE CAST({} AS TEXT) = $1",
            self.qualified(table),
            quote_ident(column)
        );
        let result = sqlx::query(&sql)
            .bind(value.to_string())
            .execute(&mut *conn)
            .await
            .map_err(|e| self.map_err(table, e))?;
        Ok(result.rows_affected())
    }

    async fn insert_batch(
        &self,
        table: &str,
        columns: &[String],
        rows: &[Vec<Cell>],
    ) -> Result<(), WarehouseError> {
        if let Some(bad) = rows.iter().find(|r| r.len() != columns.len()) {
            return Err(WarehouseError::Arity {
                expected: columns.len(),
                actual: bad.len(),
            });
        }

        let mut existing = self.column_kinds(table).await?;
        if existing.is_empty() {
            existing = self.create_table(table, columns, rows).await?;
        }

        let mut kinds = Vec::with_capacity(columns.len());
        let mut unknown = Vec::new();
        for name in columns {
            match existing.iter().find(|(c, _)| c == name) {
                Some((_, kind)) => kinds.push(*kind),
                None => unknown.push(name.clone()),
            }
        }
        if !unknown.is_empty() {
            return Err(WarehouseError::UnknownColumns {
                table: table.to_string(),
                columns: unknown,
            });
        }

        let values = rows
            .iter()
            .map(|row| {
                row.iter()
                    .zip(columns.iter().zip(&kinds))
                    .map(|(cell, (name, kind))| convert(name, *kind, cell))
                    .collect::<Result<Vec<_>, _>>()
            })
            .collect::<Result<Vec<_>, _>>()?;

        let mut qb: QueryBuilder<'_, Postgres> = QueryBuilder::new(format!(
            "INSERT INTO {} ({}) ",
            self.qualified(table),
            columns
                .iter()
                .map(|c| quote_ident(c))
                .collect::<Vec<_>>()
                .join(", ")
        ));
        qb.push_values(values, |mut b, row| {
            for value in row {
                match value {
                    SqlValue::Bool(v) => b.push_bind(v),
                    SqlValue::Int(v) => b.push_bind(v),
                    SqlValue::Float(v) => b.push_bind(v),
                    SqlValue::Timestamp(v) => b.push_bind(v),
                    SqlValue::Date(v) => b.push_bind(v),
                    SqlValue::Text(v) => b.push_bind(v),
                };
            }
        });

        let mut conn = self.pool.acquire().await?;
        qb.build()
            .persistent(false)
            .execute(&mut *conn)
            .await
            .map_err(|e| self.map_err(table, e))?;
        Ok(())
    }

    async fn read_table(&self, table: &str) -> Result<Table, WarehouseError> {
        let kinds = self.column_kinds(table).await?;
        if kinds.is_empty() {
            return Err(WarehouseError::TableNotFound(table.to_string()));
        }

        let sql = format!(
            "SELECT {} FROM {}",
            kinds
                .iter()
                .map(|(name, kind)| select_expr(name, *kind))
                .collect::<Vec<_>>()
                .join(", "),
            self.qualified(table)
        );
        let mut conn = self.pool.acquire().await?;
        let rows = sqlx::query(&sql)
            .fetch_all(&mut *conn)
            .await
            .map_err(|e| self.map_err(table, e))?;

        let mut out = Table::new(kinds.iter().map(|(n, _)| n.clone()).collect());
        for row in &rows {
            let cells = kinds
                .iter()
                .enumerate()
                .map(|(i, (_, kind))| cell_from_row(row, i, *kind))
                .collect::<Result<Vec<_>, _>>()?;
            out.push_row(cells).map_err(|_| WarehouseError::Arity {
                expected: kinds.len(),
                actual: row.len(),
            })?;
        }
        Ok(out)
    }

    async fn max_value(&self, table: &str, column: &str) -> Result<Option<Cell>, WarehouseError> {
        let kinds = self.column_kinds(table).await?;
        if kinds.is_empty() {
            return Err(WarehouseError::TableNotFound(table.to_string()));
        }
        let kind = kinds
            .iter()
            .find(|(name, _)| name == column)
            .map(|(_, kind)| *kind)
            .ok_or_else(|| WarehouseError::UnknownColumns {
                table: table.to_string(),
                columns: vec![column.to_string()],
            })?;

        let sql = format!(
            "SELECT {} FROM (SELECT MAX({}) AS {} FROM {}) m",
            select_expr(column, kind),
            quote_ident(column),
            quote_ident(column),
            self.qualified(table)
        );
        let mut conn = self.pool.acquire().await?;
        let row = sqlx::query(&sql)
            .fetch_one(&mut *conn)
            .await
            .map_err(|e| self.map_err(table, e))?;
        let cell = cell_from_row(&row, 0, kind)?;
        Ok((!cell.is_null()).then_some(cell))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identifiers_are_quoted() {
        assert_eq!(quote_ident("directory_users"), "\"directory_users\"");
        assert_eq!(quote_ident("we\"ird"), "\"we\"\"ird\"");
    }

    #[test]
    fn inferred_kinds_skip_nulls() {
        let kind = ColumnKind::infer([Cell::Null, Cell::Int(3)].iter());
        assert_eq!(kind, ColumnKind::Int);
        assert_eq!(ColumnKind::infer([Cell::Null].iter()), ColumnKind::Text);
        assert_eq!(
            ColumnKind::from_data_type("timestamp without time zone"),
            ColumnKind::Timestamp
        );
    }

    #[test]
    fn inferred_kinds_widen_over_every_value() {
        let storage_used = [Cell::Int(1), Cell::Null, Cell::Float(2.5)];
        let kind = ColumnKind::infer(storage_used.iter());
        assert_eq!(kind, ColumnKind::Float);
        for cell in &storage_used {
            assert!(convert("storage_used", kind, cell).is_ok());
        }

        let date = NaiveDate::from_ymd_opt(2026, 3, 1).expect("date");
        let seen = [
            Cell::Date(date),
            Cell::Timestamp(date.and_hms_opt(8, 15, 0).expect("time")),
        ];
        assert_eq!(ColumnKind::infer(seen.iter()), ColumnKind::Timestamp);

        let mixed = [Cell::Int(7), Cell::Bool(true), Cell::text("n/a")];
        let kind = ColumnKind::infer(mixed.iter());
        assert_eq!(kind, ColumnKind::Text);
        assert!(mixed.iter().all(|cell| convert("status", kind, cell).is_ok()));
    }

    #[test]
    fn cells_convert_to_column_types() {
        assert!(matches!(
            convert("n", ColumnKind::Int, &Cell::text("42")),
            Ok(SqlValue::Int(Some(42)))
        ));
        assert!(matches!(
            convert("d", ColumnKind::Timestamp, &Cell::text("2026-03-01 08:15:00")),
            Ok(SqlValue::Timestamp(Some(_)))
        ));
        assert!(matches!(
            convert("b", ColumnKind::Bool, &Cell::text("maybe")),
            Err(WarehouseError::TypeMismatch { .. })
        ));
        assert!(matches!(
            convert("t", ColumnKind::Text, &Cell::Null),
            Ok(SqlValue::Text(None))
        ));
    }
}
