//! Time-stepped playback of retained chunks into the signal state store.
//!
//! A [`Replay`] is a plain state machine: [`Replay::start`] arms it and each
//! [`Replay::tick`] moves one row per driven signal into the state store.
//! [`Replay::spawn`] puts it on a tokio task that ticks at a fixed interval
//! until the data runs out or the returned [`ReplayHandle`] stops it.
//!
//! Two cursor modes exist. In [`CursorMode::Shared`] every driven signal is
//! read at the same row and playback ends at the first signal's row count;
//! `start` refuses to arm when the driven chunks differ in length. In
//! [`CursorMode::Independent`] each signal keeps its own cursor and wraps (or
//! halts) at its own length.

use std::{sync::Arc, time::Duration};

use serde::{Deserialize, Serialize};
use tokio::{
    sync::{mpsc, watch},
    task::JoinHandle,
    time::Instant,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{ChunkBuffer, Error, SignalId, StateShape, StateWriter, TickError};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CursorMode {
    #[default]
    Shared,
    Independent,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReplayStatus {
    Idle,
    Running,
    Exhausted,
}

#[derive(Clone, Debug)]
pub struct ReplayConfig {
    pub name: String,
    pub interval: Duration,
    pub repeat: bool,
    pub cursor: CursorMode,
}

impl ReplayConfig {
    pub fn new(name: impl ToString, interval: Duration) -> Self {
        ReplayConfig {
            name: name.to_string(),
            interval,
            repeat: false,
            cursor: CursorMode::Shared,
        }
    }

    pub fn repeat(mut self, repeat: bool) -> Self {
        self.repeat = repeat;
        self
    }

    pub fn cursor(mut self, cursor: CursorMode) -> Self {
        self.cursor = cursor;
        self
    }
}

struct Driven {
    signal: SignalId,
    shape: StateShape,
    cursor: usize,
    halted: bool,
}

pub struct Replay {
    config: ReplayConfig,
    chunks: Arc<ChunkBuffer>,
    writer: StateWriter,
    driven: Vec<Driven>,
    cursor: usize,
    status: ReplayStatus,
    rows_written: u64,
    errors: Option<mpsc::UnboundedSender<TickError>>,
}

impl Replay {
    /// Drives every signal owned by `writer`, in the writer's order.
    pub fn new(config: ReplayConfig, chunks: Arc<ChunkBuffer>, writer: StateWriter) -> Self {
        Replay {
            config,
            chunks,
            writer,
            driven: Vec::new(),
            cursor: 0,
            status: ReplayStatus::Idle,
            rows_written: 0,
            errors: None,
        }
    }

    /// Tick failures are sent here in addition to being logged.
    pub fn with_error_sink(mut self, errors: mpsc::UnboundedSender<TickError>) -> Self {
        self.errors = Some(errors);
        self
    }

    pub fn config(&self) -> &ReplayConfig {
        &self.config
    }

    pub fn status(&self) -> ReplayStatus {
        self.status
    }

    /// Shared cursor position. Meaningless in independent mode.
    pub fn cursor(&self) -> usize {
        self.cursor
    }

    pub fn cursor_of(&self, signal: &str) -> Option<usize> {
        let driven = self.driven.iter().find(|d| d.signal.as_str() == signal)?;
        Some(match self.config.cursor {
            CursorMode::Shared => self.cursor,
            CursorMode::Independent => driven.cursor,
        })
    }

    /// Signals that had history when the replay was started.
    pub fn driven_signals(&self) -> impl Iterator<Item = &SignalId> {
        self.driven.iter().map(|d| &d.signal)
    }

    pub fn rows_written(&self) -> u64 {
        self.rows_written
    }

    pub fn start(&mut self) -> Result<(), Error> {
        let mut driven = Vec::new();
        let mut shared_len: Option<(SignalId, usize)> = None;
        let mut total_rows = 0;
        for signal in self.writer.signals() {
            let shape = self.writer.store().shape(signal)?;
            let rows = match self.chunks.row_count(signal) {
                Ok(rows) => rows,
                Err(_) => {
                    warn!(replay = %self.config.name, %signal, "no history loaded, signal keeps its default state");
                    continue;
                }
            };
            if self.config.cursor == CursorMode::Shared {
                match &shared_len {
                    None => shared_len = Some((signal.clone(), rows)),
                    Some((_, expected)) if *expected != rows => {
                        return Err(Error::RowCountMismatch {
                            signal: signal.clone(),
                            expected: *expected,
                            actual: rows,
                        });
                    }
                    Some(_) => {}
                }
            }
            total_rows += rows;
            driven.push(Driven {
                signal: signal.clone(),
                shape,
                cursor: 0,
                halted: rows == 0,
            });
        }

        self.driven = driven;
        self.cursor = 0;
        self.status = if total_rows == 0 {
            warn!(replay = %self.config.name, "nothing to replay");
            ReplayStatus::Exhausted
        } else {
            ReplayStatus::Running
        };
        info!(
            replay = %self.config.name,
            signals = self.driven.len(),
            rows = total_rows,
            interval = ?self.config.interval,
            repeat = self.config.repeat,
            "replay started"
        );
        Ok(())
    }

    pub fn stop(&mut self) {
        if self.status != ReplayStatus::Idle {
            debug!(replay = %self.config.name, "replay stopped");
        }
        self.status = ReplayStatus::Idle;
    }

    /// Writes the current row of every driven signal and advances. Does
    /// nothing unless the replay is running.
    pub fn tick(&mut self) -> ReplayStatus {
        if self.status != ReplayStatus::Running {
            return self.status;
        }
        let errors = match self.config.cursor {
            CursorMode::Shared => self.tick_shared(),
            CursorMode::Independent => self.tick_independent(),
        };
        for err in errors {
            self.report(err);
        }
        self.status
    }

    fn tick_shared(&mut self) -> Vec<TickError> {
        let mut errors = Vec::new();
        let Some(first) = self.driven.first() else {
            self.exhaust();
            return errors;
        };
        // re-read every tick, a reload may have replaced the chunk
        let len = self.chunks.row_count(&first.signal).unwrap_or(0);
        if self.cursor >= len {
            if self.config.repeat && len > 0 {
                self.cursor = 0;
            } else {
                self.exhaust();
                return errors;
            }
        }

        let row = self.cursor;
        for driven in &self.driven {
            match write_row(&self.chunks, &self.writer, &driven.signal, driven.shape, row) {
                Ok(()) => self.rows_written += 1,
                Err(cause) => errors.push(TickError {
                    signal: driven.signal.clone(),
                    cursor: row,
                    cause,
                }),
            }
        }

        self.cursor += 1;
        if self.cursor >= len {
            if self.config.repeat {
                debug!(replay = %self.config.name, "replay wrapped");
                self.cursor = 0;
            } else {
                self.exhaust();
            }
        }
        errors
    }

    fn tick_independent(&mut self) -> Vec<TickError> {
        let mut errors = Vec::new();
        let repeat = self.config.repeat;
        for driven in self.driven.iter_mut().filter(|d| !d.halted) {
            let len = self.chunks.row_count(&driven.signal).unwrap_or(0);
            if driven.cursor >= len {
                if repeat && len > 0 {
                    driven.cursor = 0;
                } else {
                    driven.halted = true;
                    continue;
                }
            }

            let row = driven.cursor;
            match write_row(&self.chunks, &self.writer, &driven.signal, driven.shape, row) {
                Ok(()) => self.rows_written += 1,
                Err(cause) => errors.push(TickError {
                    signal: driven.signal.clone(),
                    cursor: row,
                    cause,
                }),
            }

            driven.cursor += 1;
            if driven.cursor >= len {
                if repeat {
                    driven.cursor = 0;
                } else {
                    driven.halted = true;
                }
            }
        }
        if self.driven.iter().all(|d| d.halted) {
            self.exhaust();
        }
        errors
    }

    fn exhaust(&mut self) {
        info!(replay = %self.config.name, rows = self.rows_written, "replay exhausted");
        self.status = ReplayStatus::Exhausted;
    }

    fn report(&self, err: TickError) {
        warn!(
            replay = %self.config.name,
            signal = %err.signal,
            cursor = err.cursor,
            cause = %err.cause,
            "tick failed"
        );
        if let Some(errors) = &self.errors {
            let _ = errors.send(err);
        }
    }

    /// Starts the replay and ticks it on a tokio task, once immediately and
    /// then every interval. Must be called from within a tokio runtime.
    pub fn spawn(mut self) -> Result<ReplayHandle, Error> {
        self.start()?;
        let name = self.config.name.clone();
        let cancel = CancellationToken::new();
        let (status_tx, status_rx) = watch::channel(self.status);
        let task = tokio::spawn(run(self, cancel.clone(), status_tx));
        Ok(ReplayHandle {
            name,
            cancel,
            status: status_rx,
            task,
        })
    }
}

fn write_row(
    chunks: &ChunkBuffer,
    writer: &StateWriter,
    signal: &SignalId,
    shape: StateShape,
    row: usize,
) -> Result<(), Error> {
    let chunk = chunks.get(signal)?;
    let state = shape.from_row(&chunk, row)?;
    writer.set(signal, state)
}

async fn run(
    mut replay: Replay,
    cancel: CancellationToken,
    status: watch::Sender<ReplayStatus>,
) -> Replay {
    loop {
        if cancel.is_cancelled() {
            replay.stop();
            break;
        }
        let start = Instant::now();
        let current = replay.tick();
        status.send_replace(current);
        if current != ReplayStatus::Running {
            break;
        }
        let sleep_time = replay.config.interval.saturating_sub(start.elapsed());
        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                replay.stop();
                break;
            }
            _ = tokio::time::sleep(sleep_time) => {}
        }
    }
    status.send_replace(replay.status());
    replay
}

/// Control handle for a spawned [`Replay`].
pub struct ReplayHandle {
    name: String,
    cancel: CancellationToken,
    status: watch::Receiver<ReplayStatus>,
    task: JoinHandle<Replay>,
}

impl ReplayHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn status(&self) -> ReplayStatus {
        *self.status.borrow()
    }

    /// Requests a stop without waiting for the task. The next tick will not fire.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Stops the replay and returns it, idle, once the task has wound down.
    pub async fn stop(self) -> Result<Replay, Error> {
        self.cancel.cancel();
        Ok(self.task.await?)
    }

    /// Waits for a non-repeating replay to run out of rows.
    pub async fn wait(self) -> Result<Replay, Error> {
        Ok(self.task.await?)
    }
}
