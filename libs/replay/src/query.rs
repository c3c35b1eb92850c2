//! Time-windowed column queries against a read-only SQLite store.
//!
//! Every request is answered independently: [`Store::query_multiple`] never
//! lets one missing table blank the rest of a batch. Failed requests come back
//! as [`QueryError`]s next to the chunks that did load.

use std::{path::Path, sync::Mutex};

use chrono::NaiveDateTime;
use rusqlite::{Connection, OpenFlags, params_from_iter, types::Value};
use tracing::{debug, info, warn};

use crate::{ColumnSet, Error, QueryError, SignalId};

pub const DEFAULT_TIMESTAMP_COLUMN: &str = "date_time";
pub const DEFAULT_INDEX_COLUMN: &str = "time";
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Inclusive filter on a run's wall-clock timestamp and/or its relative time
/// index. A row matches only if it satisfies every predicate that is set.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct TimeWindow {
    pub timestamps: Option<(NaiveDateTime, NaiveDateTime)>,
    pub index: Option<(f64, f64)>,
}

impl TimeWindow {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn with_timestamps(mut self, start: NaiveDateTime, end: NaiveDateTime) -> Result<Self, Error> {
        if start > end {
            return Err(Error::InvalidWindow(format!(
                "timestamp start {start} is after end {end}"
            )));
        }
        self.timestamps = Some((start, end));
        Ok(self)
    }

    pub fn with_index(mut self, start: f64, end: f64) -> Result<Self, Error> {
        if !(start <= end) {
            return Err(Error::InvalidWindow(format!(
                "index start {start} is after end {end}"
            )));
        }
        self.index = Some((start, end));
        Ok(self)
    }

    pub fn parse_timestamp(s: &str) -> Result<NaiveDateTime, Error> {
        NaiveDateTime::parse_from_str(s.trim(), TIMESTAMP_FORMAT)
            .map_err(|err| Error::InvalidWindow(format!("bad timestamp {s:?}: {err}")))
    }

    pub fn contains_index(&self, index: f64) -> bool {
        self.index
            .map(|(start, end)| start <= index && index <= end)
            .unwrap_or(true)
    }
}

/// One table's worth of columns to load for a signal.
#[derive(Clone, Debug)]
pub struct ColumnRequest {
    pub signal: SignalId,
    pub table: String,
    pub window: TimeWindow,
    pub columns: Vec<String>,
    pub timestamp_column: String,
    pub index_column: String,
}

impl ColumnRequest {
    /// Requests `columns` from the table named after `signal`.
    pub fn new(signal: impl Into<SignalId>, columns: impl IntoIterator<Item = impl ToString>) -> Self {
        let signal = signal.into();
        ColumnRequest {
            table: signal.to_string(),
            signal,
            window: TimeWindow::all(),
            columns: columns.into_iter().map(|c| c.to_string()).collect(),
            timestamp_column: DEFAULT_TIMESTAMP_COLUMN.to_string(),
            index_column: DEFAULT_INDEX_COLUMN.to_string(),
        }
    }

    pub fn table(mut self, table: impl ToString) -> Self {
        self.table = table.to_string();
        self
    }

    pub fn window(mut self, window: TimeWindow) -> Self {
        self.window = window;
        self
    }

    pub fn timestamp_column(mut self, column: impl ToString) -> Self {
        self.timestamp_column = column.to_string();
        self
    }

    pub fn index_column(mut self, column: impl ToString) -> Self {
        self.index_column = column.to_string();
        self
    }

    fn sql(&self) -> Result<(String, Vec<Value>), Error> {
        let projection = self
            .columns
            .iter()
            .map(|c| quote_ident(c))
            .collect::<Result<Vec<_>, _>>()?
            .join(", ");
        let index_column = quote_ident(&self.index_column)?;
        let mut sql = format!("SELECT {projection} FROM {}", quote_ident(&self.table)?);

        let mut predicates = Vec::new();
        let mut params = Vec::new();
        if let Some((start, end)) = self.window.timestamps {
            let column = quote_ident(&self.timestamp_column)?;
            predicates.push(format!("{column} >= ? AND {column} <= ?"));
            params.push(Value::Text(start.format(TIMESTAMP_FORMAT).to_string()));
            params.push(Value::Text(end.format(TIMESTAMP_FORMAT).to_string()));
        }
        if let Some((start, end)) = self.window.index {
            predicates.push(format!("{index_column} >= ? AND {index_column} <= ?"));
            params.push(Value::Real(start));
            params.push(Value::Real(end));
        }
        if !predicates.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&predicates.join(" AND "));
        }
        sql.push_str(&format!(" ORDER BY {index_column} ASC"));
        Ok((sql, params))
    }
}

fn quote_ident(ident: &str) -> Result<String, Error> {
    if ident.is_empty() || ident.contains('\0') {
        return Err(Error::InvalidIdentifier(ident.to_string()));
    }
    Ok(format!("\"{}\"", ident.replace('"', "\"\"")))
}

/// SQLite reads an unknown double-quoted identifier as a string literal, so
/// columns are checked up front. An unknown table is left for `prepare` to
/// reject.
fn check_columns(conn: &Connection, table: &str, columns: &[&str]) -> Result<(), Error> {
    let mut stmt = conn.prepare("SELECT name FROM pragma_table_info(?1)")?;
    let known = stmt
        .query_map([table], |row| row.get::<_, String>(0))?
        .collect::<Result<Vec<_>, _>>()?;
    if known.is_empty() {
        return Ok(());
    }
    for column in columns {
        if !known.iter().any(|k| k.eq_ignore_ascii_case(column)) {
            return Err(Error::ColumnNotFound(format!("{table}.{column}")));
        }
    }
    Ok(())
}

/// Result of a batched query: the chunks that loaded, in request order, and
/// one error per request that did not.
#[derive(Debug, Default)]
pub struct QueryBatch {
    pub chunks: Vec<(SignalId, ColumnSet)>,
    pub errors: Vec<QueryError>,
}

impl QueryBatch {
    pub fn is_complete(&self) -> bool {
        self.errors.is_empty()
    }
}

pub struct Store {
    conn: Mutex<Connection>,
}

impl Store {
    /// Opens an existing database read-only.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, Error> {
        let path = path.as_ref();
        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;
        info!(?path, "opened store");
        Ok(Store {
            conn: Mutex::new(conn),
        })
    }

    pub fn query_columns(&self, request: &ColumnRequest) -> Result<ColumnSet, QueryError> {
        self.query_columns_inner(request)
            .map_err(|err| QueryError::new(request.signal.clone(), err))
    }

    fn query_columns_inner(&self, request: &ColumnRequest) -> Result<ColumnSet, Error> {
        let (sql, params) = request.sql()?;
        debug!(signal = %request.signal, %sql, "querying columns");
        let conn = self.conn.lock().expect("poisoned lock");
        let mut used: Vec<&str> = request.columns.iter().map(String::as_str).collect();
        used.push(&request.index_column);
        if request.window.timestamps.is_some() {
            used.push(&request.timestamp_column);
        }
        check_columns(&conn, &request.table, &used)?;
        let mut stmt = conn.prepare(&sql)?;
        if stmt.column_count() != request.columns.len() {
            return Err(Error::ColumnCount {
                expected: request.columns.len(),
                actual: stmt.column_count(),
            });
        }
        let mut data: Vec<Vec<f64>> = vec![Vec::new(); request.columns.len()];
        let mut rows = stmt.query(params_from_iter(params.iter()))?;
        while let Some(row) = rows.next()? {
            for (i, column) in data.iter_mut().enumerate() {
                let value: Option<f64> = row.get(i)?;
                column.push(value.unwrap_or(f64::NAN));
            }
        }
        ColumnSet::try_new(&request.columns, data)
    }

    pub fn query_multiple(&self, requests: &[ColumnRequest]) -> QueryBatch {
        let mut batch = QueryBatch::default();
        for request in requests {
            match self.query_columns(request) {
                Ok(set) => {
                    debug!(signal = %request.signal, rows = set.row_count(), "loaded chunk");
                    batch.chunks.push((request.signal.clone(), set));
                }
                Err(err) => {
                    warn!(signal = %request.signal, %err, "failed to load chunk");
                    batch.errors.push(err);
                }
            }
        }
        batch
    }

    /// User tables in the store, sorted by name.
    pub fn table_names(&self) -> Result<Vec<String>, Error> {
        let conn = self.conn.lock().expect("poisoned lock");
        let mut stmt = conn.prepare(
            "SELECT name FROM sqlite_master WHERE type = 'table' AND name NOT LIKE 'sqlite_%' ORDER BY name",
        )?;
        let names = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(names)
    }

    /// Distinct run timestamps recorded in `table`, ascending.
    pub fn run_timestamps(&self, table: &str, timestamp_column: &str) -> Result<Vec<String>, Error> {
        let column = quote_ident(timestamp_column)?;
        let sql = format!(
            "SELECT DISTINCT {column} FROM {} ORDER BY {column} ASC",
            quote_ident(table)?
        );
        let conn = self.conn.lock().expect("poisoned lock");
        check_columns(&conn, table, &[timestamp_column])?;
        let mut stmt = conn.prepare(&sql)?;
        let values = stmt
            .query_map([], |row| row.get::<_, Value>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(values
            .into_iter()
            .filter_map(|value| match value {
                Value::Text(s) => Some(s),
                Value::Integer(i) => Some(i.to_string()),
                Value::Real(f) => Some(f.to_string()),
                Value::Null | Value::Blob(_) => None,
            })
            .collect())
    }
}
