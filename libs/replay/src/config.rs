//! TOML configuration for the replay engine.

use std::{
    collections::HashSet,
    path::{Path, PathBuf},
    time::Duration,
};

use serde::Deserialize;

use crate::{
    ColumnRequest, CursorMode, Error, ReplayConfig, SignalId, StateShape, Store, TimeWindow,
};

pub const CONFIG_ENV: &str = "TELEMETRY_REPLAY_CONFIG";
pub const DEFAULT_CONFIG_PATH: &str = "replay.toml";

fn default_poll_interval_ms() -> u64 {
    1500
}

fn default_interval_ms() -> u64 {
    1000
}

#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default)]
    pub replay: Vec<ReplayGroupConfig>,
    /// Directory relative store paths are resolved against.
    #[serde(skip)]
    pub base_dir: PathBuf,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ReplayGroupConfig {
    pub name: String,
    pub store: PathBuf,
    pub shape: StateShape,
    #[serde(default = "default_interval_ms")]
    pub interval_ms: u64,
    #[serde(default)]
    pub repeat: bool,
    #[serde(default)]
    pub cursor: CursorMode,
    #[serde(default)]
    pub signals: Vec<SignalId>,
    /// Also drive every table found in the store.
    #[serde(default)]
    pub discover: bool,
    pub columns: Option<Vec<String>>,
    pub timestamp_column: Option<String>,
    pub index_column: Option<String>,
    #[serde(default)]
    pub window: WindowConfig,
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WindowConfig {
    pub start_timestamp: Option<String>,
    pub end_timestamp: Option<String>,
    pub start_index: Option<f64>,
    pub end_index: Option<f64>,
}

impl WindowConfig {
    pub fn to_window(&self) -> Result<TimeWindow, Error> {
        let mut window = TimeWindow::all();
        match (&self.start_timestamp, &self.end_timestamp) {
            (Some(start), Some(end)) => {
                window = window.with_timestamps(
                    TimeWindow::parse_timestamp(start)?,
                    TimeWindow::parse_timestamp(end)?,
                )?;
            }
            (None, None) => {}
            _ => {
                return Err(Error::InvalidWindow(
                    "start_timestamp and end_timestamp must be set together".to_string(),
                ));
            }
        }
        match (self.start_index, self.end_index) {
            (Some(start), Some(end)) => window = window.with_index(start, end)?,
            (None, None) => {}
            _ => {
                return Err(Error::InvalidWindow(
                    "start_index and end_index must be set together".to_string(),
                ));
            }
        }
        Ok(window)
    }
}

impl Config {
    /// Config path from `TELEMETRY_REPLAY_CONFIG`, falling back to `replay.toml`.
    pub fn default_path() -> PathBuf {
        std::env::var_os(CONFIG_ENV)
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH))
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, Error> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)?;
        let mut config = Self::parse(&contents)?;
        config.base_dir = path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_default();
        Ok(config)
    }

    pub fn parse(contents: &str) -> Result<Self, Error> {
        let config: Config = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), Error> {
        if self.poll_interval_ms == 0 {
            return Err(Error::Config("poll_interval_ms must be non-zero".to_string()));
        }
        let mut names = HashSet::new();
        let mut signals = HashSet::new();
        for group in &self.replay {
            if !names.insert(group.name.as_str()) {
                return Err(Error::Config(format!("duplicate replay {:?}", group.name)));
            }
            group.validate()?;
            for signal in &group.signals {
                if !signals.insert(signal) {
                    return Err(Error::Config(format!(
                        "signal {signal} is driven by more than one replay"
                    )));
                }
            }
        }
        Ok(())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn store_path(&self, group: &ReplayGroupConfig) -> PathBuf {
        if group.store.is_absolute() {
            group.store.clone()
        } else {
            self.base_dir.join(&group.store)
        }
    }
}

impl ReplayGroupConfig {
    fn validate(&self) -> Result<(), Error> {
        if self.name.is_empty() {
            return Err(Error::Config("replay name must not be empty".to_string()));
        }
        if self.interval_ms == 0 {
            return Err(Error::Config(format!(
                "replay {}: interval_ms must be non-zero",
                self.name
            )));
        }
        if self.signals.is_empty() && !self.discover {
            return Err(Error::Config(format!(
                "replay {}: no signals and discovery disabled",
                self.name
            )));
        }
        let columns = self.columns();
        if columns.len() != self.shape.arity() {
            return Err(Error::Config(format!(
                "replay {}: {} state needs {} columns, got {}",
                self.name,
                self.shape.name(),
                self.shape.arity(),
                columns.len()
            )));
        }
        self.window
            .to_window()
            .map_err(|err| Error::Config(format!("replay {}: {err}", self.name)))?;
        Ok(())
    }

    pub fn columns(&self) -> Vec<String> {
        match &self.columns {
            Some(columns) => columns.clone(),
            None => self
                .shape
                .default_columns()
                .iter()
                .map(|c| c.to_string())
                .collect(),
        }
    }

    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn replay_config(&self) -> ReplayConfig {
        ReplayConfig::new(&self.name, self.interval())
            .repeat(self.repeat)
            .cursor(self.cursor)
    }

    /// Configured signals, followed by any undeclared tables when discovery is on.
    pub fn resolve_signals(&self, store: &Store) -> Result<Vec<SignalId>, Error> {
        let mut signals = self.signals.clone();
        if self.discover {
            for table in store.table_names()? {
                let signal = SignalId::from(table);
                if !signals.contains(&signal) {
                    signals.push(signal);
                }
            }
        }
        Ok(signals)
    }

    pub fn requests(&self, signals: &[SignalId]) -> Result<Vec<ColumnRequest>, Error> {
        let window = self.window.to_window()?;
        let columns = self.columns();
        Ok(signals
            .iter()
            .map(|signal| {
                let mut request =
                    ColumnRequest::new(signal.clone(), columns.iter()).window(window.clone());
                if let Some(column) = &self.timestamp_column {
                    request = request.timestamp_column(column);
                }
                if let Some(column) = &self.index_column {
                    request = request.index_column(column);
                }
                request
            })
            .collect())
    }
}
