//! Ad-hoc store inspection: run one windowed query, or list tables and their
//! recorded runs, and print the result as a terminal table.

use std::path::PathBuf;

use tabled::builder::Builder;

use crate::{ColumnRequest, ColumnSet, Store, TimeWindow, query::DEFAULT_TIMESTAMP_COLUMN};

/// Arguments for the `query` subcommand.
#[derive(Clone, Debug)]
pub struct QueryArgs {
    pub store: PathBuf,
    pub table: String,
    pub columns: Vec<String>,
    pub window: TimeWindow,
    pub timestamp_column: Option<String>,
    pub index_column: Option<String>,
    /// Show only the first N rows.
    pub head: Option<usize>,
    /// Show only the last N rows.
    pub tail: Option<usize>,
}

pub fn run_query(args: QueryArgs) -> miette::Result<()> {
    let QueryArgs {
        store,
        table,
        columns,
        window,
        timestamp_column,
        index_column,
        head,
        tail,
    } = args;

    let store = Store::open(&store).map_err(|e| miette::miette!("{e}"))?;
    let mut request = ColumnRequest::new(table.as_str(), columns).window(window);
    if let Some(column) = timestamp_column {
        request = request.timestamp_column(column);
    }
    if let Some(column) = index_column {
        request = request.index_column(column);
    }
    let set = store
        .query_columns(&request)
        .map_err(|e| miette::miette!("{e}"))?;

    if set.is_empty() {
        println!("(no rows)");
        return Ok(());
    }

    let total_rows = set.row_count();
    let (table, shown) = render_column_set(&set, head, tail)?;
    println!("{table}");
    if shown < total_rows {
        eprintln!("(showing {} of {} rows)", shown, total_rows);
    }
    Ok(())
}

/// Renders `set` as a rounded table, limited to the first `head` or last
/// `tail` rows. Returns the table and the number of rows shown.
pub fn render_column_set(
    set: &ColumnSet,
    head: Option<usize>,
    tail: Option<usize>,
) -> miette::Result<(String, usize)> {
    let total_rows = set.row_count();
    let (start, len) = match (head, tail) {
        (Some(n), None) => (0, n.min(total_rows)),
        (None, Some(n)) => (total_rows.saturating_sub(n), n.min(total_rows)),
        (Some(_), Some(_)) => {
            return Err(miette::miette!("cannot use both --head and --tail"));
        }
        (None, None) => (0, total_rows),
    };

    let mut builder = Builder::default();
    builder.push_record(set.names().map(str::to_string));
    for row in start..start + len {
        let mut record = Vec::with_capacity(set.column_count());
        for column in 0..set.column_count() {
            let value = set.value(column, row).map_err(|e| miette::miette!("{e}"))?;
            record.push(value.to_string());
        }
        builder.push_record(record);
    }

    let mut table = builder.build();
    table.with(tabled::settings::style::Style::rounded());
    Ok((table.to_string(), len))
}

/// Lists the store's tables with the run timestamps each one holds.
pub fn list_tables(store: PathBuf, timestamp_column: Option<String>) -> miette::Result<()> {
    let store = Store::open(&store).map_err(|e| miette::miette!("{e}"))?;
    let timestamp_column = timestamp_column.unwrap_or_else(|| DEFAULT_TIMESTAMP_COLUMN.to_string());
    let tables = store.table_names().map_err(|e| miette::miette!("{e}"))?;
    if tables.is_empty() {
        println!("(no tables)");
        return Ok(());
    }

    let mut builder = Builder::default();
    builder.push_record(["table", "runs", "first run", "last run"]);
    for table in tables {
        match store.run_timestamps(&table, &timestamp_column) {
            Ok(runs) => {
                let first = runs.first().cloned().unwrap_or_default();
                let last = runs.last().cloned().unwrap_or_default();
                builder.push_record([table, runs.len().to_string(), first, last]);
            }
            // tables without a timestamp column still get listed
            Err(_) => builder.push_record([table, "-".to_string(), "-".to_string(), "-".to_string()]),
        }
    }
    let mut table = builder.build();
    table.with(tabled::settings::style::Style::rounded());
    println!("{table}");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn set() -> ColumnSet {
        ColumnSet::try_new(
            &["time", "ch3_watts"],
            vec![vec![0.0, 1.0, 2.0, 3.0], vec![5.0, 6.5, 7.0, f64::NAN]],
        )
        .unwrap()
    }

    #[test]
    fn test_render_head_and_tail() {
        let (table, shown) = render_column_set(&set(), Some(2), None).unwrap();
        assert_eq!(shown, 2);
        assert!(table.contains("ch3_watts"));
        assert!(table.contains("6.5"));
        assert!(!table.contains("NaN"));

        let (table, shown) = render_column_set(&set(), None, Some(1)).unwrap();
        assert_eq!(shown, 1);
        assert!(table.contains("NaN"));
        assert!(!table.contains("6.5"));

        let (_, shown) = render_column_set(&set(), Some(100), None).unwrap();
        assert_eq!(shown, 4);
    }

    #[test]
    fn test_head_and_tail_conflict() {
        assert!(render_column_set(&set(), Some(1), Some(1)).is_err());
    }
}
