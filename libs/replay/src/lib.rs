use std::{borrow::Borrow, fmt, ops::Deref, path::PathBuf, sync::Arc};

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{error, info, warn};

pub use chunk::ChunkBuffer;
pub use column_set::ColumnSet;
pub use config::{Config, ReplayGroupConfig, WindowConfig};
pub use error::{Error, QueryError, TickError};
pub use query::{ColumnRequest, QueryBatch, Store, TimeWindow};
pub use replay::{CursorMode, Replay, ReplayConfig, ReplayHandle, ReplayStatus};
pub use state::{
    FromRow, PredictedState, ReactorState, RodState, SignalState, SignalStateStore, StateShape,
    StateWriter,
};

mod chunk;
mod column_set;
pub mod config;
mod error;
pub mod export;
pub mod inspect;
pub mod query;
pub mod replay;
mod state;

/// Name of one logical time series. Doubles as the table it is loaded from.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SignalId(String);

impl SignalId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Deref for SignalId {
    type Target = str;

    fn deref(&self) -> &str {
        &self.0
    }
}

impl Borrow<str> for SignalId {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SignalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SignalId {
    fn from(s: &str) -> Self {
        SignalId(s.to_string())
    }
}

impl From<String> for SignalId {
    fn from(s: String) -> Self {
        SignalId(s)
    }
}

struct Group {
    replay: ReplayConfig,
    store: PathBuf,
    signals: Vec<SignalId>,
    requests: Vec<ColumnRequest>,
}

/// Wires the query layer, chunk buffer, state store and replays together
/// from a [`Config`].
pub struct Engine {
    states: Arc<SignalStateStore>,
    chunks: Arc<ChunkBuffer>,
    groups: Vec<Group>,
    query_errors: Vec<QueryError>,
}

impl Engine {
    /// Loads every replay group's history into a fresh chunk buffer. Query
    /// failures are logged and kept, not returned; only configuration problems
    /// fail the load.
    ///
    /// Runs SQLite queries on the calling thread. From async code call it
    /// through `tokio::task::spawn_blocking`.
    pub fn load(config: &Config) -> Result<Self, Error> {
        config.validate()?;
        let chunks = Arc::new(ChunkBuffer::new());
        let mut shapes = Vec::new();
        let mut groups = Vec::with_capacity(config.replay.len());
        let mut query_errors = Vec::new();

        for group in &config.replay {
            let path = config.store_path(group);
            // the connection opens lazily, so a corrupt file first fails during discovery
            let opened = Store::open(&path).and_then(|store| {
                let signals = group.resolve_signals(&store)?;
                Ok((store, signals))
            });
            let (signals, requests) = match opened {
                Ok((store, signals)) => {
                    let requests = group.requests(&signals)?;
                    query_errors.extend(chunks.populate(store.query_multiple(&requests)));
                    (signals, requests)
                }
                Err(err) => {
                    warn!(replay = %group.name, ?path, %err, "store unavailable");
                    let signals = group.signals.clone();
                    let requests = group.requests(&signals)?;
                    query_errors.extend(signals.iter().map(|signal| {
                        QueryError::new(signal.clone(), Error::StoreUnavailable(err.to_string()))
                    }));
                    (signals, requests)
                }
            };
            info!(
                replay = %group.name,
                signals = signals.len(),
                shape = group.shape.name(),
                "loaded replay group"
            );
            shapes.extend(signals.iter().map(|signal| (signal.clone(), group.shape)));
            groups.push(Group {
                replay: group.replay_config(),
                store: path,
                signals,
                requests,
            });
        }

        let states = Arc::new(SignalStateStore::new(shapes)?);
        Ok(Engine {
            states,
            chunks,
            groups,
            query_errors,
        })
    }

    pub fn states(&self) -> &Arc<SignalStateStore> {
        &self.states
    }

    pub fn chunks(&self) -> &Arc<ChunkBuffer> {
        &self.chunks
    }

    /// Failures from the most recent load or reload.
    pub fn query_errors(&self) -> &[QueryError] {
        &self.query_errors
    }

    pub fn replay_names(&self) -> impl Iterator<Item = &str> {
        self.groups.iter().map(|g| g.replay.name.as_str())
    }

    /// Re-runs every group's queries and swaps the chunks that load. Running
    /// replays pick the new chunks up on their next tick. Blocks like
    /// [`Engine::load`].
    pub fn reload(&mut self) -> &[QueryError] {
        let mut query_errors = Vec::new();
        for group in &self.groups {
            match Store::open(&group.store) {
                Ok(store) => {
                    query_errors.extend(self.chunks.populate(store.query_multiple(&group.requests)))
                }
                Err(err) => {
                    warn!(replay = %group.replay.name, path = ?group.store, %err, "store unavailable");
                    query_errors.extend(group.signals.iter().map(|signal| {
                        QueryError::new(signal.clone(), Error::StoreUnavailable(err.to_string()))
                    }));
                }
            }
        }
        self.query_errors = query_errors;
        &self.query_errors
    }

    /// Builds one idle replay per group, each holding its group's signals.
    pub fn replays(&self) -> Result<Vec<Replay>, Error> {
        self.groups
            .iter()
            .map(|group| {
                let writer = self.states.claim(&group.signals)?;
                Ok(Replay::new(group.replay.clone(), self.chunks.clone(), writer))
            })
            .collect()
    }

    /// Spawns every replay on the current tokio runtime. A group that fails to
    /// start is logged and left out.
    pub fn spawn(
        &self,
        errors: Option<mpsc::UnboundedSender<TickError>>,
    ) -> Result<Vec<ReplayHandle>, Error> {
        let mut handles = Vec::with_capacity(self.groups.len());
        for replay in self.replays()? {
            let replay = match &errors {
                Some(errors) => replay.with_error_sink(errors.clone()),
                None => replay,
            };
            let name = replay.config().name.clone();
            match replay.spawn() {
                Ok(handle) => handles.push(handle),
                Err(err) => error!(replay = %name, %err, "replay failed to start"),
            }
        }
        Ok(handles)
    }
}
