//! Current per-signal values, as written by the replay scheduler.
//!
//! Each signal holds one record of a fixed [`StateShape`]. Records are swapped
//! in whole through [`ArcSwap`], so pollers never see a half-written row.
//! Write access goes through a [`StateWriter`], which is handed out once per
//! signal: two replays can never drive the same signal.

use std::{
    collections::HashMap,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};

use arc_swap::ArcSwap;
use serde::{Deserialize, Serialize};

use crate::{ColumnSet, Error, SignalId};

/// Maps one row of a [`ColumnSet`] onto a state record. Column 0 is always the
/// time index; value columns follow in the order of `COLUMNS`.
pub trait FromRow: Sized + Default {
    const COLUMNS: &'static [&'static str];

    fn from_row(columns: &ColumnSet, row: usize) -> Result<Self, Error>;
}

fn check_arity<T: FromRow>(columns: &ColumnSet) -> Result<(), Error> {
    if columns.column_count() != T::COLUMNS.len() {
        return Err(Error::ColumnCount {
            expected: T::COLUMNS.len(),
            actual: columns.column_count(),
        });
    }
    Ok(())
}

#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct PredictedState {
    pub time: f64,
    pub predicted: f64,
    pub reported: f64,
    pub delta: f64,
}

impl FromRow for PredictedState {
    const COLUMNS: &'static [&'static str] = &["time", "predicted", "reported", "delta"];

    fn from_row(columns: &ColumnSet, row: usize) -> Result<Self, Error> {
        check_arity::<Self>(columns)?;
        Ok(PredictedState {
            time: columns.value(0, row)?,
            predicted: columns.value(1, row)?,
            reported: columns.value(2, row)?,
            delta: columns.value(3, row)?,
        })
    }
}

/// Up/engaged/down indicators for the fine, coarse and two starter rods.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct RodState {
    pub fcr_up: f64,
    pub fcr_engaged: f64,
    pub fcr_down: f64,
    pub ccr_up: f64,
    pub ccr_engaged: f64,
    pub ccr_down: f64,
    pub sr1_up: f64,
    pub sr1_engaged: f64,
    pub sr1_down: f64,
    pub sr2_up: f64,
    pub sr2_engaged: f64,
    pub sr2_down: f64,
}

impl FromRow for RodState {
    const COLUMNS: &'static [&'static str] = &[
        "time",
        "fcr_up",
        "fcr_engaged",
        "fcr_down",
        "ccr_up",
        "ccr_engaged",
        "ccr_down",
        "sr1_up",
        "sr1_engaged",
        "sr1_down",
        "sr2_up",
        "sr2_engaged",
        "sr2_down",
    ];

    fn from_row(columns: &ColumnSet, row: usize) -> Result<Self, Error> {
        check_arity::<Self>(columns)?;
        // the time column is projected for ordering but not kept
        columns.value(0, row)?;
        Ok(RodState {
            fcr_up: columns.value(1, row)?,
            fcr_engaged: columns.value(2, row)?,
            fcr_down: columns.value(3, row)?,
            ccr_up: columns.value(4, row)?,
            ccr_engaged: columns.value(5, row)?,
            ccr_down: columns.value(6, row)?,
            sr1_up: columns.value(7, row)?,
            sr1_engaged: columns.value(8, row)?,
            sr1_down: columns.value(9, row)?,
            sr2_up: columns.value(10, row)?,
            sr2_engaged: columns.value(11, row)?,
            sr2_down: columns.value(12, row)?,
        })
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct ReactorState {
    pub time: f64,
    pub watts: f64,
    pub reactivity: f64,
    pub inv_period: f64,
}

impl FromRow for ReactorState {
    const COLUMNS: &'static [&'static str] =
        &["time", "ch3_watts", "ch3_reactivity", "ch3_inv_period"];

    fn from_row(columns: &ColumnSet, row: usize) -> Result<Self, Error> {
        check_arity::<Self>(columns)?;
        Ok(ReactorState {
            time: columns.value(0, row)?,
            watts: columns.value(1, row)?,
            reactivity: columns.value(2, row)?,
            inv_period: columns.value(3, row)?,
        })
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StateShape {
    Predicted,
    Rods,
    Reactor,
}

impl StateShape {
    pub fn name(self) -> &'static str {
        match self {
            StateShape::Predicted => "predicted",
            StateShape::Rods => "rods",
            StateShape::Reactor => "reactor",
        }
    }

    /// Column projection used when a config does not override it.
    pub fn default_columns(self) -> &'static [&'static str] {
        match self {
            StateShape::Predicted => PredictedState::COLUMNS,
            StateShape::Rods => RodState::COLUMNS,
            StateShape::Reactor => ReactorState::COLUMNS,
        }
    }

    pub fn arity(self) -> usize {
        self.default_columns().len()
    }

    pub fn default_state(self) -> SignalState {
        match self {
            StateShape::Predicted => SignalState::Predicted(PredictedState::default()),
            StateShape::Rods => SignalState::Rods(RodState::default()),
            StateShape::Reactor => SignalState::Reactor(ReactorState::default()),
        }
    }

    pub fn from_row(self, columns: &ColumnSet, row: usize) -> Result<SignalState, Error> {
        Ok(match self {
            StateShape::Predicted => SignalState::Predicted(PredictedState::from_row(columns, row)?),
            StateShape::Rods => SignalState::Rods(RodState::from_row(columns, row)?),
            StateShape::Reactor => SignalState::Reactor(ReactorState::from_row(columns, row)?),
        })
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum SignalState {
    Predicted(PredictedState),
    Rods(RodState),
    Reactor(ReactorState),
}

impl SignalState {
    pub fn shape(&self) -> StateShape {
        match self {
            SignalState::Predicted(_) => StateShape::Predicted,
            SignalState::Rods(_) => StateShape::Rods,
            SignalState::Reactor(_) => StateShape::Reactor,
        }
    }

    /// Named values in display order.
    pub fn fields(&self) -> Vec<(&'static str, f64)> {
        match self {
            SignalState::Predicted(s) => vec![
                ("time", s.time),
                ("predicted", s.predicted),
                ("reported", s.reported),
                ("delta", s.delta),
            ],
            SignalState::Rods(s) => vec![
                ("fcr_up", s.fcr_up),
                ("fcr_engaged", s.fcr_engaged),
                ("fcr_down", s.fcr_down),
                ("ccr_up", s.ccr_up),
                ("ccr_engaged", s.ccr_engaged),
                ("ccr_down", s.ccr_down),
                ("sr1_up", s.sr1_up),
                ("sr1_engaged", s.sr1_engaged),
                ("sr1_down", s.sr1_down),
                ("sr2_up", s.sr2_up),
                ("sr2_engaged", s.sr2_engaged),
                ("sr2_down", s.sr2_down),
            ],
            SignalState::Reactor(s) => vec![
                ("time", s.time),
                ("watts", s.watts),
                ("reactivity", s.reactivity),
                ("inv_period", s.inv_period),
            ],
        }
    }
}

struct Entry {
    shape: StateShape,
    state: ArcSwap<SignalState>,
    claimed: AtomicBool,
}

pub struct SignalStateStore {
    order: Vec<SignalId>,
    entries: HashMap<SignalId, Entry>,
}

impl SignalStateStore {
    /// Creates a zeroed record for every signal. The set is fixed from here on.
    pub fn new(signals: impl IntoIterator<Item = (SignalId, StateShape)>) -> Result<Self, Error> {
        let mut order = Vec::new();
        let mut entries = HashMap::new();
        for (signal, shape) in signals {
            if entries.contains_key(&signal) {
                return Err(Error::Config(format!("duplicate signal {signal}")));
            }
            entries.insert(
                signal.clone(),
                Entry {
                    shape,
                    state: ArcSwap::from_pointee(shape.default_state()),
                    claimed: AtomicBool::new(false),
                },
            );
            order.push(signal);
        }
        Ok(SignalStateStore { order, entries })
    }

    fn entry(&self, signal: &str) -> Result<&Entry, Error> {
        self.entries
            .get(signal)
            .ok_or_else(|| Error::NotFound(SignalId::from(signal)))
    }

    pub fn get(&self, signal: &str) -> Result<Arc<SignalState>, Error> {
        Ok(self.entry(signal)?.state.load_full())
    }

    pub fn shape(&self, signal: &str) -> Result<StateShape, Error> {
        Ok(self.entry(signal)?.shape)
    }

    pub fn signals(&self) -> &[SignalId] {
        &self.order
    }

    pub fn snapshot(&self) -> Vec<(SignalId, Arc<SignalState>)> {
        self.order
            .iter()
            .filter_map(|signal| {
                let entry = self.entries.get(signal)?;
                Some((signal.clone(), entry.state.load_full()))
            })
            .collect()
    }

    /// Grants exclusive write access to `signals` until the writer is dropped.
    pub fn claim(self: &Arc<Self>, signals: &[SignalId]) -> Result<StateWriter, Error> {
        let mut claimed: Vec<SignalId> = Vec::with_capacity(signals.len());
        for signal in signals {
            let res = self.entry(signal).and_then(|entry| {
                entry
                    .claimed
                    .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                    .map_err(|_| Error::AlreadyClaimed(signal.clone()))
            });
            if let Err(err) = res {
                self.release(&claimed);
                return Err(err);
            }
            claimed.push(signal.clone());
        }
        Ok(StateWriter {
            store: self.clone(),
            signals: claimed,
        })
    }

    fn release(&self, signals: &[SignalId]) {
        for signal in signals {
            if let Some(entry) = self.entries.get(signal) {
                entry.claimed.store(false, Ordering::Release);
            }
        }
    }
}

pub struct StateWriter {
    store: Arc<SignalStateStore>,
    signals: Vec<SignalId>,
}

impl StateWriter {
    pub fn signals(&self) -> &[SignalId] {
        &self.signals
    }

    pub fn store(&self) -> &Arc<SignalStateStore> {
        &self.store
    }

    pub fn set(&self, signal: &str, state: SignalState) -> Result<(), Error> {
        if !self.signals.iter().any(|s| s.as_str() == signal) {
            return Err(Error::NotOwned(SignalId::from(signal)));
        }
        let entry = self.store.entry(signal)?;
        if entry.shape != state.shape() {
            return Err(Error::ShapeMismatch {
                signal: SignalId::from(signal),
                expected: entry.shape.name(),
                actual: state.shape().name(),
            });
        }
        entry.state.store(Arc::new(state));
        Ok(())
    }
}

impl Drop for StateWriter {
    fn drop(&mut self) {
        self.store.release(&self.signals);
    }
}
