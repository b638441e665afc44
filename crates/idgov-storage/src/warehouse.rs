//! Warehouse sinks and the erase-then-append sync driver.

use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use idgov_core::{Cell, Table};
use thiserror::Error;
use tracing::{info, warn};

/// Per-statement bound-parameter ceiling assumed when none is configured.
pub const DEFAULT_PARAMETER_LIMIT: usize = 2100;

#[derive(Debug, Error)]
pub enum WarehouseError {
    #[error("table `{0}` does not exist")]
    TableNotFound(String),
    #[error("table `{table}` has no column(s) {columns:?}")]
    UnknownColumns { table: String, columns: Vec<String> },
    #[error("value `{value}` does not fit column `{column}` of type {expected}")]
    TypeMismatch {
        column: String,
        expected: String,
        value: String,
    },
    #[error("row has {actual} cells but {expected} columns were given")]
    Arity { expected: usize, actual: usize },
    #[error(transparent)]
    Database(#[from] sqlx::Error),
}

/// Physical table store. Implementations acquire and release their connection per call.
#[async_trait]
pub trait WarehouseSink: Send + Sync {
    /// Bound parameters allowed in one statement.
    fn parameter_limit(&self) -> usize;

    /// Creates a missing table typed from every row about to be appended.
    async fn ensure_table(&self, _table: &str, _rows: &Table) -> Result<(), WarehouseError> {
        Ok(())
    }

    async fn delete_all(&self, table: &str) -> Result<u64, WarehouseError>;

    async fn delete_where(&self, table: &str, column: &str, value: &Cell)
        -> Result<u64, WarehouseError>;

    /// Inserts rows, creating the table from the batch's shape if it does not exist.
    async fn insert_batch(
        &self,
        table: &str,
        columns: &[String],
        rows: &[Vec<Cell>],
    ) -> Result<(), WarehouseError>;

    async fn read_table(&self, table: &str) -> Result<Table, WarehouseError>;

    async fn max_value(&self, table: &str, column: &str) -> Result<Option<Cell>, WarehouseError>;
}

/// Rows per insert so that `columns * rows` stays under `limit`.
pub fn batch_size(columns: usize, limit: usize) -> usize {
    (limit / columns.max(1)).saturating_sub(1).max(1)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteSummary {
    pub table: String,
    pub rows: usize,
    pub batches: usize,
}

#[derive(Clone)]
pub struct Warehouse {
    sink: Arc<dyn WarehouseSink>,
}

impl std::fmt::Debug for Warehouse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Warehouse")
            .field("parameter_limit", &self.sink.parameter_limit())
            .finish()
    }
}

impl Warehouse {
    pub fn new(sink: Arc<dyn WarehouseSink>) -> Self {
        Self { sink }
    }

    /// Deletes every row. A missing table is expected on a first run and is not an error.
    pub async fn erase(&self, table: &str) -> Result<(), WarehouseError> {
        match self.sink.delete_all(table).await {
            Ok(deleted) => {
                info!(table, deleted, "table erased");
                Ok(())
            }
            Err(WarehouseError::TableNotFound(_)) => {
                warn!(table, "erase skipped, table does not exist yet");
                Ok(())
            }
            Err(err) => Err(err),
        }
    }

    /// Deletes rows where `column = value`, tolerating a missing table.
    pub async fn erase_rows(
        &self,
        table: &str,
        column: &str,
        value: &Cell,
    ) -> Result<(), WarehouseError> {
        match self.sink.delete_where(table, column, value).await {
            Ok(deleted) => {
                info!(table, column, %value, deleted, "rows erased");
                Ok(())
            }
            Err(WarehouseError::TableNotFound(_)) => {
                warn!(table, "row erase skipped, table does not exist yet");
                Ok(())
            }
            Err(err) => Err(err),
        }
    }

    /// Appends in parameter-limited batches. Batches already committed stay committed
    /// when a later one fails.
    pub async fn append(&self, table: &str, rows: &Table) -> Result<WriteSummary, WarehouseError> {
        if rows.is_empty() {
            info!(table, rows = 0, "append skipped, no rows");
            return Ok(WriteSummary {
                table: table.to_string(),
                rows: 0,
                batches: 0,
            });
        }

        self.sink.ensure_table(table, rows).await?;
        let size = batch_size(rows.width(), self.sink.parameter_limit());
        let mut batches = 0;
        for chunk in rows.rows().chunks(size) {
            self.sink.insert_batch(table, rows.columns(), chunk).await?;
            batches += 1;
        }

        info!(table, rows = rows.len(), batches, batch_size = size, "rows appended");
        Ok(WriteSummary {
            table: table.to_string(),
            rows: rows.len(),
            batches,
        })
    }

    /// Full-table replace.
    pub async fn refresh(&self, table: &str, rows: &Table) -> Result<WriteSummary, WarehouseError> {
        self.erase(table).await?;
        self.append(table, rows).await
    }

    /// Replaces only the rows matching `key_column = key_value`.
    pub async fn refresh_rows(
        &self,
        table: &str,
        rows: &Table,
        key_column: &str,
        key_value: &Cell,
    ) -> Result<WriteSummary, WarehouseError> {
        self.erase_rows(table, key_column, key_value).await?;
        self.append(table, rows).await
    }

    pub async fn get_table(&self, table: &str) -> Result<Table, WarehouseError> {
        self.sink.read_table(table).await
    }

    pub async fn get_max(&self, table: &str, column: &str) -> Result<Option<Cell>, WarehouseError> {
        self.sink.max_value(table, column).await
    }
}

fn cells_equal(a: &Cell, b: &Cell) -> bool {
    a == b || a.compare(b) == Some(Ordering::Equal)
}

/// In-process sink with the same semantics as the database one. Records every batch size.
#[derive(Debug)]
pub struct MemoryWarehouse {
    parameter_limit: usize,
    tables: Mutex<HashMap<String, Table>>,
    batches: Mutex<HashMap<String, Vec<usize>>>,
}

impl Default for MemoryWarehouse {
    fn default() -> Self {
        Self::new(DEFAULT_PARAMETER_LIMIT)
    }
}

impl MemoryWarehouse {
    pub fn new(parameter_limit: usize) -> Self {
        Self {
            parameter_limit,
            tables: Mutex::new(HashMap::new()),
            batches: Mutex::new(HashMap::new()),
        }
    }

    fn tables(&self) -> std::sync::MutexGuard<'_, HashMap<String, Table>> {
        self.tables.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Installs a table as if a previous job had written it.
    pub fn seed(&self, name: &str, table: Table) {
        self.tables().insert(name.to_string(), table);
    }

    pub fn table(&self, name: &str) -> Option<Table> {
        self.tables().get(name).cloned()
    }

    pub fn table_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tables().keys().cloned().collect();
        names.sort();
        names
    }

    pub fn batch_sizes(&self, name: &str) -> Vec<usize> {
        self.batches
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(name)
            .cloned()
            .unwrap_or_default()
    }
}

#[async_trait]
impl WarehouseSink for MemoryWarehouse {
    fn parameter_limit(&self) -> usize {
        self.parameter_limit
    }

    async fn delete_all(&self, table: &str) -> Result<u64, WarehouseError> {
        let mut tables = self.tables();
        let existing = tables
            .get_mut(table)
            .ok_or_else(|| WarehouseError::TableNotFound(table.to_string()))?;
        let deleted = existing.len() as u64;
        *existing = Table::new(existing.columns().to_vec());
        Ok(deleted)
    }

    async fn delete_where(
        &self,
        table: &str,
        column: &str,
        value: &Cell,
    ) -> Result<u64, WarehouseError> {
        let mut tables = self.tables();
        let existing = tables
            .get_mut(table)
            .ok_or_else(|| WarehouseError::TableNotFound(table.to_string()))?;
        if !existing.has_column(column) {
            return Err(WarehouseError::UnknownColumns {
                table: table.to_string(),
                columns: vec![column.to_string()],
            });
        }
        let before = existing.len();
        *existing = existing.filter(|row| !cells_equal(row.cell(column), value));
        Ok((before - existing.len()) as u64)
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

        {
            let mut tables = self.tables();
            let target = tables
                .entry(table.to_string())
                .or_insert_with(|| Table::new(columns.to_vec()));

            let unknown: Vec<String> = columns
                .iter()
                .filter(|c| !target.has_column(c))
                .cloned()
                .collect();
            if !unknown.is_empty() {
                return Err(WarehouseError::UnknownColumns {
                    table: table.to_string(),
                    columns: unknown,
                });
            }

            let mapping: Vec<Option<usize>> = target
                .columns()
                .iter()
                .map(|c| columns.iter().position(|incoming| incoming == c))
                .collect();
            for row in rows {
                let aligned = mapping
                    .iter()
                    .map(|m| m.map(|i| row[i].clone()).unwrap_or(Cell::Null))
                    .collect();
                target.push_row(aligned).map_err(|_| WarehouseError::Arity {
                    expected: columns.len(),
                    actual: row.len(),
                })?;
            }
        }

        self.batches
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .entry(table.to_string())
            .or_default()
            .push(rows.len());
        Ok(())
    }

    async fn read_table(&self, table: &str) -> Result<Table, WarehouseError> {
        self.tables()
            .get(table)
            .cloned()
            .ok_or_else(|| WarehouseError::TableNotFound(table.to_string()))
    }

    async fn max_value(&self, table: &str, column: &str) -> Result<Option<Cell>, WarehouseError> {
        let tables = self.tables();
        let existing = tables
            .get(table)
            .ok_or_else(|| WarehouseError::TableNotFound(table.to_string()))?;
        existing
            .max_of(column)
            .map_err(|_| WarehouseError::UnknownColumns {
                table: table.to_string(),
                columns: vec![column.to_string()],
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn wide_table(columns: usize, rows: usize) -> Table {
        Table::from_rows(
            (0..columns).map(|c| format!("c{c}")).collect(),
            (0..rows)
                .map(|r| (0..columns).map(|c| Cell::Int((r * columns + c) as i64)).collect())
                .collect(),
        )
        .expect("table")
    }

    fn warehouse() -> (Arc<MemoryWarehouse>, Warehouse) {
        let sink = Arc::new(MemoryWarehouse::default());
        (sink.clone(), Warehouse::new(sink))
    }

    #[test]
    fn batch_size_respects_parameter_limit() {
        assert_eq!(batch_size(30, 2100), 69);
        assert_eq!(batch_size(3000, 2100), 1);
        assert_eq!(batch_size(0, 2100), 2099);
    }

    #[tokio::test]
    async fn append_splits_into_limit_sized_batches() {
        let (sink, wh) = warehouse();
        let summary = wh.append("wide", &wide_table(30, 200)).await.expect("append");
        assert_eq!(summary.batches, 3);
        assert_eq!(sink.batch_sizes("wide"), vec![69, 69, 62]);
        assert_eq!(sink.table("wide").map(|t| t.len()), Some(200));
    }

    #[tokio::test]
    async fn refresh_is_idempotent_and_creates_missing_tables() {
        let (sink, wh) = warehouse();
        let rows = wide_table(3, 5);
        wh.refresh("t", &rows).await.expect("first refresh");
        wh.refresh("t", &rows).await.expect("second refresh");
        assert_eq!(sink.table("t"), Some(rows));
    }

    #[tokio::test]
    async fn erase_swallows_only_missing_tables() {
        let (_, wh) = warehouse();
        wh.erase("never_written").await.expect("missing table is fine");
        let err = wh.get_table("never_written").await.unwrap_err();
        assert!(matches!(err, WarehouseError::TableNotFound(_)));
    }

    #[tokio::test]
    async fn refresh_rows_replaces_only_the_matching_slice() {
        let (sink, wh) = warehouse();
        let day = |d: &str, n: i64| {
            Table::from_rows(
                vec!["refresh_date".into(), "value".into()],
                vec![vec![Cell::text(d), Cell::Int(n)]],
            )
            .expect("table")
        };
        wh.append("usage", &day("2026-01-01", 1)).await.expect("seed");
        wh.append("usage", &day("2026-01-02", 2)).await.expect("seed");
        wh.refresh_rows("usage", &day("2026-01-02", 3), "refresh_date", &Cell::text("2026-01-02"))
            .await
            .expect("refresh rows");

        let table = sink.table("usage").expect("table");
        assert_eq!(table.len(), 2);
        assert_eq!(table.value(1, "value"), Some(&Cell::Int(3)));
        assert_eq!(
            wh.get_max("usage", "refresh_date").await.expect("max"),
            Some(Cell::text("2026-01-02"))
        );
    }

    #[tokio::test]
    async fn schema_drift_is_surfaced() {
        let (_, wh) = warehouse();
        wh.append("t", &wide_table(2, 1)).await.expect("create");
        let err = wh.append("t", &wide_table(3, 1)).await.unwrap_err();
        assert!(matches!(err, WarehouseError::UnknownColumns { columns, .. } if columns == vec!["c2".to_string()]));
    }

    #[tokio::test]
    async fn empty_append_is_a_no_op() {
        let (sink, wh) = warehouse();
        let summary = wh.append("t", &Table::with_columns(&["a"])).await.expect("append");
        assert_eq!(summary.rows, 0);
        assert!(sink.table("t").is_none());
    }
}
