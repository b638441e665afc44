use std::cmp::Ordering;
use std::collections::HashSet;
use std::fmt;

use chrono::{NaiveDate, NaiveDateTime};
use serde_json::Value as JsonValue;
use thiserror::Error;

#[derive(Debug, Error, PartialEq)]
pub enum TableError {
    #[error("missing column `{0}`")]
    MissingColumn(String),
    #[error("duplicate column `{0}`")]
    DuplicateColumn(String),
    #[error("row has {actual} cells, table has {expected} columns")]
    Arity { expected: usize, actual: usize },
}

/// One scalar value in a normalized table.
#[derive(Debug, Clone, PartialEq)]
pub enum Cell {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    Timestamp(NaiveDateTime),
    Date(NaiveDate),
}

impl Cell {
    pub fn text(value: impl Into<String>) -> Self {
        Cell::Text(value.into())
    }

    /// Converts a decoded JSON value. Arrays and objects are kept as compact JSON text.
    pub fn from_json(value: &JsonValue) -> Self {
        match value {
            JsonValue::Null => Cell::Null,
            JsonValue::Bool(b) => Cell::Bool(*b),
            JsonValue::Number(n) => match n.as_i64() {
                Some(i) => Cell::Int(i),
                None => n.as_f64().map(Cell::Float).unwrap_or(Cell::Null),
            },
            JsonValue::String(s) => Cell::Text(s.clone()),
            other => Cell::Text(other.to_string()),
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Cell::Null)
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Cell::Text(s) => Some(s.as_str()),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Cell::Int(i) => Some(*i),
            Cell::Float(f) if f.fract() == 0.0 => Some(*f as i64),
            Cell::Text(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Cell::Bool(b) => Some(*b),
            Cell::Text(s) => match s.trim().to_ascii_lowercase().as_str() {
                "true" | "t" | "yes" => Some(true),
                "false" | "f" | "no" => Some(false),
                _ => None,
            },
            _ => None,
        }
    }

    /// Rendering used when the cell takes part in a join key. `Null` never yields a key.
    pub fn join_key(&self) -> Option<String> {
        match self {
            Cell::Null => None,
            Cell::Float(f) if f.fract() == 0.0 && f.is_finite() => Some((*f as i64).to_string()),
            other => Some(other.to_string()),
        }
    }

    /// Orders two cells of the same kind; mixed kinds and nulls are incomparable.
    pub fn compare(&self, other: &Cell) -> Option<Ordering> {
        match (self, other) {
            (Cell::Bool(a), Cell::Bool(b)) => Some(a.cmp(b)),
            (Cell::Int(a), Cell::Int(b)) => Some(a.cmp(b)),
            (Cell::Float(a), Cell::Float(b)) => a.partial_cmp(b),
            (Cell::Int(a), Cell::Float(b)) => (*a as f64).partial_cmp(b),
            (Cell::Float(a), Cell::Int(b)) => a.partial_cmp(&(*b as f64)),
            (Cell::Text(a), Cell::Text(b)) => Some(a.cmp(b)),
            (Cell::Timestamp(a), Cell::Timestamp(b)) => Some(a.cmp(b)),
            (Cell::Date(a), Cell::Date(b)) => Some(a.cmp(b)),
            _ => None,
        }
    }

    pub fn to_json(&self) -> JsonValue {
        match self {
            Cell::Null => JsonValue::Null,
            Cell::Bool(b) => JsonValue::Bool(*b),
            Cell::Int(i) => JsonValue::from(*i),
            Cell::Float(f) => serde_json::Number::from_f64(*f)
                .map(JsonValue::Number)
                .unwrap_or(JsonValue::Null),
            Cell::Text(s) => JsonValue::String(s.clone()),
            Cell::Timestamp(ts) => JsonValue::String(ts.format("%Y-%m-%dT%H:%M:%S").to_string()),
            Cell::Date(d) => JsonValue::String(d.format("%Y-%m-%d").to_string()),
        }
    }
}

impl fmt::Display for Cell {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Cell::Null => Ok(()),
            Cell::Bool(b) => write!(f, "{b}"),
            Cell::Int(i) => write!(f, "{i}"),
            Cell::Float(x) => write!(f, "{x}"),
            Cell::Text(s) => f.write_str(s),
            Cell::Timestamp(ts) => write!(f, "{}", ts.format("%Y-%m-%d %H:%M:%S")),
            Cell::Date(d) => write!(f, "{}", d.format("%Y-%m-%d")),
        }
    }
}

impl From<&str> for Cell {
    fn from(value: &str) -> Self {
        Cell::Text(value.to_string())
    }
}

impl From<String> for Cell {
    fn from(value: String) -> Self {
        Cell::Text(value)
    }
}

impl From<i64> for Cell {
    fn from(value: i64) -> Self {
        Cell::Int(value)
    }
}

impl From<bool> for Cell {
    fn from(value: bool) -> Self {
        Cell::Bool(value)
    }
}

impl<T: Into<Cell>> From<Option<T>> for Cell {
    fn from(value: Option<T>) -> Self {
        value.map(Into::into).unwrap_or(Cell::Null)
    }
}

/// Ordered `(column, value)` pairs for one record before it becomes a table row.
pub type Record = Vec<(String, Cell)>;

/// A named-column row set. Every row has exactly one cell per column.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Table {
    columns: Vec<String>,
    rows: Vec<Vec<Cell>>,
}

/// Borrowed view of one row with by-name access.
#[derive(Debug, Clone, Copy)]
pub struct RowRef<'a> {
    columns: &'a [String],
    cells: &'a [Cell],
}

impl<'a> RowRef<'a> {
    pub fn get(&self, column: &str) -> Option<&'a Cell> {
        self.columns
            .iter()
            .position(|c| c == column)
            .map(|idx| &self.cells[idx])
    }

    /// Like `get`, treating a missing column as null.
    pub fn cell(&self, column: &str) -> &'a Cell {
        self.get(column).unwrap_or(&Cell::Null)
    }

    pub fn str(&self, column: &str) -> Option<&'a str> {
        self.get(column).and_then(Cell::as_str)
    }

    pub fn cells(&self) -> &'a [Cell] {
        self.cells
    }
}

impl Table {
    pub fn new(columns: Vec<String>) -> Self {
        Self {
            columns,
            rows: Vec::new(),
        }
    }

    pub fn with_columns(columns: &[&str]) -> Self {
        Self::new(columns.iter().map(|c| c.to_string()).collect())
    }

    pub fn from_rows(columns: Vec<String>, rows: Vec<Vec<Cell>>) -> Result<Self, TableError> {
        let mut table = Self::new(columns);
        for row in rows {
            table.push_row(row)?;
        }
        Ok(table)
    }

    /// Builds a table from heterogeneous records. Columns appear in first-seen order and
    /// records lacking a column get `Null`.
    pub fn from_records(records: Vec<Record>) -> Self {
        let mut columns: Vec<String> = Vec::new();
        for record in &records {
            for (name, _) in record {
                if !columns.contains(name) {
                    columns.push(name.clone());
                }
            }
        }

        let rows = records
            .into_iter()
            .map(|record| {
                let mut row = vec![Cell::Null; columns.len()];
                for (name, value) in record {
                    if let Some(idx) = columns.iter().position(|c| *c == name) {
                        row[idx] = value;
                    }
                }
                row
            })
            .collect();

        Self { columns, rows }
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn rows(&self) -> &[Vec<Cell>] {
        &self.rows
    }

    pub fn into_rows(self) -> Vec<Vec<Cell>> {
        self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn width(&self) -> usize {
        self.columns.len()
    }

    pub fn has_column(&self, name: &str) -> bool {
        self.column_index(name).is_some()
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c == name)
    }

    pub fn require_column(&self, name: &str) -> Result<usize, TableError> {
        self.column_index(name)
            .ok_or_else(|| TableError::MissingColumn(name.to_string()))
    }

    pub fn push_row(&mut self, row: Vec<Cell>) -> Result<(), TableError> {
        if row.len() != self.columns.len() {
            return Err(TableError::Arity {
                expected: self.columns.len(),
                actual: row.len(),
            });
        }
        self.rows.push(row);
        Ok(())
    }

    pub fn iter(&self) -> impl Iterator<Item = RowRef<'_>> {
        self.rows.iter().map(move |cells| RowRef {
            columns: &self.columns,
            cells,
        })
    }

    pub fn row(&self, idx: usize) -> Option<RowRef<'_>> {
        self.rows.get(idx).map(|cells| RowRef {
            columns: &self.columns,
            cells,
        })
    }

    pub fn value(&self, row: usize, column: &str) -> Option<&Cell> {
        let idx = self.column_index(column)?;
        self.rows.get(row).map(|r| &r[idx])
    }

    pub fn column_values(&self, name: &str) -> Result<Vec<&Cell>, TableError> {
        let idx = self.require_column(name)?;
        Ok(self.rows.iter().map(|r| &r[idx]).collect())
    }

    /// Keeps the named columns in the given order.
    pub fn select(&self, names: &[&str]) -> Result<Table, TableError> {
        let indices = names
            .iter()
            .map(|n| self.require_column(n))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Table {
            columns: names.iter().map(|n| n.to_string()).collect(),
            rows: self
                .rows
                .iter()
                .map(|r| indices.iter().map(|&i| r[i].clone()).collect())
                .collect(),
        })
    }

    /// Like `select`, but absent columns come back as all-null instead of failing.
    pub fn project(&self, names: &[&str]) -> Table {
        let indices: Vec<Option<usize>> = names.iter().map(|n| self.column_index(n)).collect();
        Table {
            columns: names.iter().map(|n| n.to_string()).collect(),
            rows: self
                .rows
                .iter()
                .map(|r| {
                    indices
                        .iter()
                        .map(|i| i.map(|i| r[i].clone()).unwrap_or(Cell::Null))
                        .collect()
                })
                .collect(),
        }
    }

    /// Drops the named columns; names that are not present are ignored.
    pub fn drop_columns(&self, names: &[&str]) -> Table {
        let keep: Vec<usize> = (0..self.columns.len())
            .filter(|&i| !names.contains(&self.columns[i].as_str()))
            .collect();
        Table {
            columns: keep.iter().map(|&i| self.columns[i].clone()).collect(),
            rows: self
                .rows
                .iter()
                .map(|r| keep.iter().map(|&i| r[i].clone()).collect())
                .collect(),
        }
    }

    pub fn rename(&mut self, from: &str, to: &str) -> Result<(), TableError> {
        let idx = self.require_column(from)?;
        if from != to && self.has_column(to) {
            return Err(TableError::DuplicateColumn(to.to_string()));
        }
        self.columns[idx] = to.to_string();
        Ok(())
    }

    /// Renames every pair whose source column exists.
    pub fn rename_present(&mut self, pairs: &[(&str, &str)]) -> Result<(), TableError> {
        for (from, to) in pairs {
            if self.has_column(from) {
                self.rename(from, to)?;
            }
        }
        Ok(())
    }

    pub fn prefixed(&self, prefix: &str) -> Table {
        Table {
            columns: self
                .columns
                .iter()
                .map(|c| format!("{prefix}{c}"))
                .collect(),
            rows: self.rows.clone(),
        }
    }

    pub fn add_column<F>(&mut self, name: &str, mut f: F) -> Result<(), TableError>
    where
        F: FnMut(RowRef<'_>) -> Cell,
    {
        if self.has_column(name) {
            return Err(TableError::DuplicateColumn(name.to_string()));
        }
        let values: Vec<Cell> = self.iter().map(&mut f).collect();
        self.columns.push(name.to_string());
        for (row, value) in self.rows.iter_mut().zip(values) {
            row.push(value);
        }
        Ok(())
    }

    /// Sets a column from a row function, adding it when absent.
    pub fn set_column<F>(&mut self, name: &str, mut f: F)
    where
        F: FnMut(RowRef<'_>) -> Cell,
    {
        let values: Vec<Cell> = self.iter().map(&mut f).collect();
        let idx = match self.column_index(name) {
            Some(idx) => idx,
            None => {
                self.columns.push(name.to_string());
                for row in &mut self.rows {
                    row.push(Cell::Null);
                }
                self.columns.len() - 1
            }
        };
        for (row, value) in self.rows.iter_mut().zip(values) {
            row[idx] = value;
        }
    }

    pub fn map_column<F>(&mut self, name: &str, mut f: F) -> Result<(), TableError>
    where
        F: FnMut(&Cell) -> Cell,
    {
        let idx = self.require_column(name)?;
        for row in &mut self.rows {
            row[idx] = f(&row[idx]);
        }
        Ok(())
    }

    /// Like [`Table::map_column`] for optional columns; returns whether the column exists.
    pub fn map_present<F>(&mut self, name: &str, mut f: F) -> bool
    where
        F: FnMut(&Cell) -> Cell,
    {
        let Some(idx) = self.column_index(name) else {
            return false;
        };
        for row in &mut self.rows {
            row[idx] = f(&row[idx]);
        }
        true
    }

    pub fn filter<F>(&self, mut keep: F) -> Table
    where
        F: FnMut(RowRef<'_>) -> bool,
    {
        Table {
            columns: self.columns.clone(),
            rows: self
                .rows
                .iter()
                .filter(|cells| {
                    keep(RowRef {
                        columns: &self.columns,
                        cells,
                    })
                })
                .cloned()
                .collect(),
        }
    }

    /// Stacks tables vertically over the union of their columns, first-seen order.
    pub fn concat(tables: &[Table]) -> Table {
        let mut columns: Vec<String> = Vec::new();
        for table in tables {
            for col in &table.columns {
                if !columns.contains(col) {
                    columns.push(col.clone());
                }
            }
        }

        let mut rows = Vec::new();
        for table in tables {
            let mapping: Vec<Option<usize>> =
                columns.iter().map(|c| table.column_index(c)).collect();
            for row in &table.rows {
                rows.push(
                    mapping
                        .iter()
                        .map(|m| m.map(|i| row[i].clone()).unwrap_or(Cell::Null))
                        .collect(),
                );
            }
        }

        Table { columns, rows }
    }

    /// Removes repeated rows, keeping first occurrences.
    pub fn distinct(&self) -> Table {
        let mut seen = HashSet::new();
        self.filter(|row| seen.insert(format!("{:?}", row.cells())))
    }

    /// Keeps the first row per value of `key`.
    pub fn distinct_by(&self, key: &str) -> Result<Table, TableError> {
        let idx = self.require_column(key)?;
        let mut seen = HashSet::new();
        Ok(self.filter(|row| seen.insert(format!("{:?}", row.cells()[idx]))))
    }

    /// Keeps, per value of `key`, the row with the greatest `order` value.
    /// Rows whose order cell is null lose against any non-null one.
    pub fn latest_by(&self, key: &str, order: &str) -> Result<Table, TableError> {
        let key_idx = self.require_column(key)?;
        let order_idx = self.require_column(order)?;
        let mut best: Vec<usize> = Vec::new();
        let mut slot_for_key: std::collections::HashMap<String, usize> =
            std::collections::HashMap::new();

        for (i, row) in self.rows.iter().enumerate() {
            let k = format!("{:?}", row[key_idx]);
            match slot_for_key.get(&k) {
                None => {
                    slot_for_key.insert(k, best.len());
                    best.push(i);
                }
                Some(&slot) => {
                    let current = &self.rows[best[slot]][order_idx];
                    let candidate = &row[order_idx];
                    let newer = match (current.is_null(), candidate.is_null()) {
                        (true, false) => true,
                        (_, true) => false,
                        _ => candidate.compare(current) == Some(Ordering::Greater),
                    };
                    if newer {
                        best[slot] = i;
                    }
                }
            }
        }

        Ok(Table {
            columns: self.columns.clone(),
            rows: best.into_iter().map(|i| self.rows[i].clone()).collect(),
        })
    }

    /// Largest non-null value of a column, comparing same-kind cells only.
    pub fn max_of(&self, column: &str) -> Result<Option<Cell>, TableError> {
        let idx = self.require_column(column)?;
        let mut best: Option<&Cell> = None;
        for row in &self.rows {
            let cell = &row[idx];
            if cell.is_null() {
                continue;
            }
            best = match best {
                None => Some(cell),
                Some(current) if cell.compare(current) == Some(Ordering::Greater) => Some(cell),
                keep => keep,
            };
        }
        Ok(best.cloned())
    }
}
