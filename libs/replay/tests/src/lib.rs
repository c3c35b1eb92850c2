#[cfg(test)]
mod tests {
    use std::{
        path::{Path, PathBuf},
        time::Duration,
    };

    use rusqlite::{Connection, params};
    use telemetry_replay::{
        ChunkBuffer, ColumnRequest, Config, Engine, Error, ReplayStatus, SignalId, SignalState,
        StateShape, Store, TimeWindow,
    };

    const RUN_A: &str = "2023-02-13 13:55:00";
    const RUN_B: &str = "2023-02-14 09:00:00";
    const PREDICTED: [&str; 4] = ["time", "predicted", "reported", "delta"];

    fn init_tracing() {
        let subscriber = tracing_subscriber::FmtSubscriber::new();
        let _ = tracing::subscriber::set_global_default(subscriber);
    }

    /// Prediction tables holding two runs: run A with time 0..=60 (inserted in
    /// reverse) and run B with time 0..=10 and predicted values from 1000.
    fn create_store(path: &Path, tables: &[&str]) {
        let conn = Connection::open(path).unwrap();
        for table in tables {
            conn.execute_batch(&format!(
                "CREATE TABLE \"{table}\" (date_time TEXT, time REAL, predicted REAL, reported REAL, delta REAL)"
            ))
            .unwrap();
            let sql = format!(
                "INSERT INTO \"{table}\" (date_time, time, predicted, reported, delta) VALUES (?1, ?2, ?3, ?4, ?5)"
            );
            for i in (0..=60).rev() {
                let t = i as f64;
                conn.execute(&sql, params![RUN_A, t, t * 2.0, t * 2.0 + 1.0, 1.0])
                    .unwrap();
            }
            for i in 0..=10 {
                let t = i as f64;
                conn.execute(&sql, params![RUN_B, t, 1000.0 + t, 1000.0 + t, 0.0])
                    .unwrap();
            }
        }
    }

    fn fixture(tables: &[&str]) -> (tempfile::TempDir, PathBuf) {
        init_tracing();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("isu_predictions.db");
        create_store(&path, tables);
        (dir, path)
    }

    fn run_a() -> TimeWindow {
        let ts = TimeWindow::parse_timestamp(RUN_A).unwrap();
        TimeWindow::all().with_timestamps(ts, ts).unwrap()
    }

    fn predicted(state: &SignalState) -> f64 {
        match state {
            SignalState::Predicted(s) => s.predicted,
            other => panic!("unexpected state {other:?}"),
        }
    }

    #[test]
    fn test_window_returns_matching_rows_ascending() {
        let (_dir, path) = fixture(&["Temp"]);
        let store = Store::open(&path).unwrap();
        let window = run_a().with_index(0.0, 50.0).unwrap();
        let request = ColumnRequest::new("Temp", PREDICTED).window(window.clone());
        let set = store.query_columns(&request).unwrap();

        assert_eq!(set.row_count(), 51);
        let times: Vec<f64> = set.time().values().iter().copied().collect();
        assert_eq!(times, (0..=50).map(|i| i as f64).collect::<Vec<_>>());
        assert!(times.iter().all(|t| window.contains_index(*t)));
        assert_eq!(set.value(1, 50).unwrap(), 100.0);
    }

    #[test]
    fn test_timestamp_window_excludes_other_runs() {
        let (_dir, path) = fixture(&["Temp"]);
        let store = Store::open(&path).unwrap();
        let ts = TimeWindow::parse_timestamp(RUN_B).unwrap();
        let window = TimeWindow::all().with_timestamps(ts, ts).unwrap();
        let set = store
            .query_columns(&ColumnRequest::new("Temp", PREDICTED).window(window))
            .unwrap();
        assert_eq!(set.row_count(), 11);
        let predicted = set.column_by_name("predicted").unwrap();
        assert!(predicted.values().iter().all(|v| *v >= 1000.0));

        let all = store
            .query_columns(&ColumnRequest::new("Temp", PREDICTED))
            .unwrap();
        assert_eq!(all.row_count(), 72);
    }

    #[test]
    fn test_partial_failure_keeps_successful_chunks() {
        let (_dir, path) = fixture(&["Temp"]);
        let store = Store::open(&path).unwrap();
        let batch = store.query_multiple(&[
            ColumnRequest::new("missing", PREDICTED).window(run_a()),
            ColumnRequest::new("Temp", PREDICTED).window(run_a()),
            ColumnRequest::new("bad_column", ["time", "nope"]).table("Temp"),
        ]);
        assert!(!batch.is_complete());
        assert_eq!(batch.chunks.len(), 1);
        let failed: Vec<&str> = batch.errors.iter().map(|e| e.signal.as_str()).collect();
        assert_eq!(failed, ["missing", "bad_column"]);
        assert!(matches!(batch.errors[0].cause, Error::Store(_)));
        assert!(matches!(batch.errors[1].cause, Error::ColumnNotFound(_)));

        let buffer = ChunkBuffer::new();
        let errors = buffer.populate(batch);
        assert_eq!(errors.len(), 2);
        assert!(buffer.get("missing").unwrap_err().is_not_found());
        assert_eq!(buffer.row_count("Temp").unwrap(), 61);
    }

    #[test]
    fn test_chunk_columns_share_row_count() {
        let (_dir, path) = fixture(&["Temp", "Ch2_Watts"]);
        let store = Store::open(&path).unwrap();
        let buffer = ChunkBuffer::new();
        buffer.populate(store.query_multiple(&[
            ColumnRequest::new("Temp", PREDICTED),
            ColumnRequest::new("Ch2_Watts", PREDICTED).window(run_a()),
        ]));
        for signal in buffer.signals() {
            let chunk = buffer.get(&signal).unwrap();
            for i in 0..chunk.column_count() {
                assert_eq!(chunk.column(i).unwrap().len(), chunk.row_count());
            }
        }
    }

    #[test]
    fn test_null_values_become_nan() {
        let (_dir, path) = fixture(&["Temp"]);
        let conn = Connection::open(&path).unwrap();
        conn.execute(
            "INSERT INTO Temp (date_time, time, predicted, reported, delta) VALUES (?1, 99, 1.0, NULL, NULL)",
            params![RUN_A],
        )
        .unwrap();
        drop(conn);

        let store = Store::open(&path).unwrap();
        let window = run_a().with_index(99.0, 99.0).unwrap();
        let set = store
            .query_columns(&ColumnRequest::new("Temp", PREDICTED).window(window))
            .unwrap();
        assert_eq!(set.row_count(), 1);
        assert!(set.value(2, 0).unwrap().is_nan());
    }

    #[test]
    fn test_open_missing_store_fails() {
        let dir = tempfile::tempdir().unwrap();
        let res = Store::open(dir.path().join("nope.db"));
        assert!(matches!(res, Err(Error::Store(_))));
        assert!(!dir.path().join("nope.db").exists());
    }

    #[test]
    fn test_table_names_and_run_timestamps() {
        let (_dir, path) = fixture(&["Temp", "Ch2_Watts", "FCR_cm"]);
        let store = Store::open(&path).unwrap();
        assert_eq!(store.table_names().unwrap(), ["Ch2_Watts", "FCR_cm", "Temp"]);
        assert_eq!(
            store.run_timestamps("Temp", "date_time").unwrap(),
            [RUN_A, RUN_B]
        );
        assert!(store.run_timestamps("Temp", "nope").is_err());
    }

    fn write_config(dir: &Path, body: &str) -> Config {
        let path = dir.join("replay.toml");
        std::fs::write(&path, body).unwrap();
        Config::load(&path).unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn test_engine_replays_loaded_history() {
        let (dir, _) = fixture(&["Temp", "Ch2_Watts"]);
        let config = write_config(
            dir.path(),
            r#"
[[replay]]
name = "predictions"
store = "isu_predictions.db"
shape = "predicted"
interval_ms = 1000
signals = ["Temp", "Ch2_Watts", "missing"]

[replay.window]
start_timestamp = "2023-02-13 13:55:00"
end_timestamp = "2023-02-13 13:55:00"
start_index = 0
end_index = 2
"#,
        );
        let engine = Engine::load(&config).unwrap();
        assert_eq!(engine.query_errors().len(), 1);
        assert_eq!(engine.query_errors()[0].signal.as_str(), "missing");
        assert_eq!(engine.chunks().row_count("Temp").unwrap(), 3);

        let handles = engine.spawn(None).unwrap();
        assert_eq!(handles.len(), 1);
        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert_eq!(predicted(&engine.states().get("Temp").unwrap()), 2.0);
        assert_eq!(predicted(&engine.states().get("Ch2_Watts").unwrap()), 2.0);

        let mut handles = handles;
        let replay = handles.pop().unwrap().wait().await.unwrap();
        assert_eq!(replay.status(), ReplayStatus::Exhausted);
        assert_eq!(replay.rows_written(), 6);
        assert_eq!(predicted(&engine.states().get("Temp").unwrap()), 4.0);
        assert_eq!(
            *engine.states().get("missing").unwrap(),
            StateShape::Predicted.default_state()
        );
    }

    #[test]
    fn test_engine_discovers_tables() {
        let (dir, _) = fixture(&["Temp", "Ch2_Watts"]);
        let config = write_config(
            dir.path(),
            r#"
[[replay]]
name = "all"
store = "isu_predictions.db"
shape = "predicted"
discover = true
"#,
        );
        let engine = Engine::load(&config).unwrap();
        assert!(engine.query_errors().is_empty());
        assert_eq!(
            engine.states().signals(),
            [SignalId::from("Ch2_Watts"), SignalId::from("Temp")]
        );
        assert_eq!(engine.chunks().row_count("Temp").unwrap(), 72);
    }

    #[test]
    fn test_engine_survives_unavailable_store() {
        init_tracing();
        let dir = tempfile::tempdir().unwrap();
        let config = write_config(
            dir.path(),
            r#"
[[replay]]
name = "gone"
store = "gone.db"
shape = "reactor"
signals = ["ch3_engineering_data"]
"#,
        );
        let engine = Engine::load(&config).unwrap();
        assert_eq!(engine.query_errors().len(), 1);
        assert!(matches!(
            engine.query_errors()[0].cause,
            Error::StoreUnavailable(_)
        ));
        let mut replays = engine.replays().unwrap();
        replays[0].start().unwrap();
        assert_eq!(replays[0].status(), ReplayStatus::Exhausted);
    }

    #[test]
    fn test_engine_load_survives_corrupt_discovered_store() {
        let (dir, _) = fixture(&["Temp"]);
        std::fs::write(dir.path().join("corrupt.db"), [0xA5u8; 1024]).unwrap();
        let config = write_config(
            dir.path(),
            r#"
[[replay]]
name = "broken"
store = "corrupt.db"
shape = "reactor"
discover = true
signals = ["ch3_engineering_data"]

[[replay]]
name = "predictions"
store = "isu_predictions.db"
shape = "predicted"
signals = ["Temp"]

[replay.window]
start_timestamp = "2023-02-13 13:55:00"
end_timestamp = "2023-02-13 13:55:00"
"#,
        );
        let engine = Engine::load(&config).unwrap();
        assert_eq!(engine.query_errors().len(), 1);
        assert_eq!(
            engine.query_errors()[0].signal.as_str(),
            "ch3_engineering_data"
        );
        assert!(matches!(
            engine.query_errors()[0].cause,
            Error::StoreUnavailable(_)
        ));
        assert_eq!(engine.chunks().row_count("Temp").unwrap(), 61);
        assert_eq!(engine.chunks().len(), 1);
        assert_eq!(
            engine.replay_names().collect::<Vec<_>>(),
            ["broken", "predictions"]
        );
        assert_eq!(
            *engine.states().get("ch3_engineering_data").unwrap(),
            StateShape::Reactor.default_state()
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_engine_spawn_skips_group_that_fails_to_start() {
        let (dir, path) = fixture(&["Temp", "Ch2_Watts", "FCR_cm"]);
        let conn = Connection::open(&path).unwrap();
        conn.execute(
            "INSERT INTO Ch2_Watts (date_time, time, predicted, reported, delta) VALUES (?1, 61, 1.0, 1.0, 0.0)",
            params![RUN_A],
        )
        .unwrap();
        drop(conn);
        let config = write_config(
            dir.path(),
            r#"
[[replay]]
name = "mismatch"
store = "isu_predictions.db"
shape = "predicted"
cursor = "shared"
signals = ["Temp", "Ch2_Watts"]

[[replay]]
name = "healthy"
store = "isu_predictions.db"
shape = "predicted"
interval_ms = 1000
signals = ["FCR_cm"]

[replay.window]
start_timestamp = "2023-02-13 13:55:00"
end_timestamp = "2023-02-13 13:55:00"
start_index = 0
end_index = 2
"#,
        );
        let engine = Engine::load(&config).unwrap();
        assert!(engine.query_errors().is_empty());
        assert_eq!(engine.chunks().row_count("Temp").unwrap(), 72);
        assert_eq!(engine.chunks().row_count("Ch2_Watts").unwrap(), 73);

        let handles = engine.spawn(None).unwrap();
        assert_eq!(handles.len(), 1);
        assert_eq!(handles[0].name(), "healthy");

        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert_eq!(predicted(&engine.states().get("FCR_cm").unwrap()), 2.0);
        assert_eq!(
            *engine.states().get("Temp").unwrap(),
            StateShape::Predicted.default_state()
        );
        assert_eq!(
            *engine.states().get("Ch2_Watts").unwrap(),
            StateShape::Predicted.default_state()
        );

        let handle = handles.into_iter().next().unwrap();
        handle.cancel();
        let replay = handle.wait().await.unwrap();
        assert_eq!(replay.status(), ReplayStatus::Idle);
        assert_eq!(replay.rows_written(), 2);
        tokio::time::sleep(Duration::from_millis(2000)).await;
        assert_eq!(predicted(&engine.states().get("FCR_cm").unwrap()), 2.0);
    }

    #[tokio::test]
    async fn test_engine_loads_and_reloads_on_blocking_pool() {
        let (dir, _) = fixture(&["Temp"]);
        let config = write_config(
            dir.path(),
            r#"
[[replay]]
name = "predictions"
store = "isu_predictions.db"
shape = "predicted"
signals = ["Temp"]
"#,
        );
        let engine = tokio::task::spawn_blocking(move || Engine::load(&config))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(engine.chunks().row_count("Temp").unwrap(), 72);

        let (engine, failed) = tokio::task::spawn_blocking(move || {
            let mut engine = engine;
            let failed = engine.reload().len();
            (engine, failed)
        })
        .await
        .unwrap();
        assert_eq!(failed, 0);
        assert_eq!(engine.chunks().row_count("Temp").unwrap(), 72);
    }

    #[test]
    fn test_engine_reload_replaces_chunks() {
        let (dir, path) = fixture(&["Temp"]);
        let config = write_config(
            dir.path(),
            r#"
[[replay]]
name = "predictions"
store = "isu_predictions.db"
shape = "predicted"
signals = ["Temp"]

[replay.window]
start_timestamp = "2023-02-13 13:55:00"
end_timestamp = "2023-02-13 13:55:00"
"#,
        );
        let mut engine = Engine::load(&config).unwrap();
        let before = engine.chunks().get("Temp").unwrap();
        assert_eq!(before.row_count(), 61);

        let conn = Connection::open(&path).unwrap();
        conn.execute(
            "INSERT INTO Temp (date_time, time, predicted, reported, delta) VALUES (?1, 61, 1.0, 1.0, 0.0)",
            params![RUN_A],
        )
        .unwrap();
        drop(conn);

        assert!(engine.reload().is_empty());
        assert_eq!(engine.chunks().row_count("Temp").unwrap(), 62);
        assert_eq!(before.row_count(), 61);
    }

    #[test]
    fn test_engine_rejects_signal_claimed_twice() {
        let (dir, _) = fixture(&["Temp"]);
        let config = write_config(
            dir.path(),
            r#"
[[replay]]
name = "predictions"
store = "isu_predictions.db"
shape = "predicted"
signals = ["Temp"]
"#,
        );
        let engine = Engine::load(&config).unwrap();
        let replays = engine.replays().unwrap();
        assert!(matches!(engine.replays(), Err(Error::AlreadyClaimed(_))));
        drop(replays);
        engine.replays().unwrap();
    }
}
