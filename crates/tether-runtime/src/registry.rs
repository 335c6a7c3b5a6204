//! Core registry: configured helpers, their status and load
//!
//! The set of cores is fixed at construction. Each entry has its own lock,
//! so operations on different cores never contend.

use std::collections::BTreeMap;
use std::time::Instant;

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use tether_core::{CoreConfig, CoreId, CoreStatus, RuntimeConfig, TetherError, TetherResult};

/// Live state of one helper core
#[derive(Clone, Debug)]
pub struct CoreState {
    pub config: CoreConfig,
    pub status: CoreStatus,
    /// Requests dispatched and not yet settled
    pub load: u64,
    pub consecutive_failures: u32,
    pub last_health_check: Option<Instant>,
}

impl CoreState {
    fn new(config: CoreConfig) -> Self {
        CoreState {
            config,
            status: CoreStatus::Initialized,
            load: 0,
            consecutive_failures: 0,
            last_health_check: None,
        }
    }

    pub fn id(&self) -> CoreId {
        self.config.id
    }
}

/// Registry of all configured cores
#[derive(Debug)]
pub struct CoreRegistry {
    entries: BTreeMap<CoreId, Mutex<CoreState>>,
}

impl CoreRegistry {
    pub fn new(cores: &[CoreConfig]) -> Self {
        let entries = cores
            .iter()
            .map(|c| (c.id, Mutex::new(CoreState::new(c.clone()))))
            .collect();
        CoreRegistry { entries }
    }

    /// Validate a runtime configuration and register its cores
    pub fn configure(config: &RuntimeConfig) -> TetherResult<Self> {
        config.validate()?;
        let registry = Self::new(&config.cores());
        info!(
            implementation = %config.implementation,
            cores = registry.len(),
            "core registry configured"
        );
        Ok(registry)
    }

    fn entry(&self, core: CoreId) -> TetherResult<&Mutex<CoreState>> {
        self.entries.get(&core).ok_or(TetherError::UnknownCore(core))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, core: CoreId) -> bool {
        self.entries.contains_key(&core)
    }

    /// Configured core ids, ascending
    pub fn ids(&self) -> Vec<CoreId> {
        self.entries.keys().copied().collect()
    }

    pub fn status(&self, core: CoreId) -> TetherResult<CoreStatus> {
        Ok(self.entry(core)?.lock().status)
    }

    pub fn load(&self, core: CoreId) -> TetherResult<u64> {
        Ok(self.entry(core)?.lock().load)
    }

    /// Copy of one core's state
    pub fn state(&self, core: CoreId) -> TetherResult<CoreState> {
        Ok(self.entry(core)?.lock().clone())
    }

    /// Set the status, returning the previous one
    ///
    /// `Trusted` and `Busy` are interchangeable inputs: the stored value
    /// follows the load.
    pub fn set_status(&self, core: CoreId, status: CoreStatus) -> TetherResult<CoreStatus> {
        let mut state = self.entry(core)?.lock();
        let previous = state.status;
        state.status = match status {
            CoreStatus::Trusted | CoreStatus::Busy if state.load > 0 => CoreStatus::Busy,
            CoreStatus::Trusted | CoreStatus::Busy => CoreStatus::Trusted,
            other => other,
        };
        if previous != state.status {
            info!(core = %core, from = %previous, to = %state.status, "core status changed");
        }
        Ok(previous)
    }

    /// Run `f` against one entry under its lock
    pub fn update<R>(&self, core: CoreId, f: impl FnOnce(&mut CoreState) -> R) -> TetherResult<R> {
        let mut state = self.entry(core)?.lock();
        Ok(f(&mut state))
    }

    pub fn increment_load(&self, core: CoreId) -> TetherResult<u64> {
        let mut state = self.entry(core)?.lock();
        state.load += 1;
        if state.status == CoreStatus::Trusted {
            state.status = CoreStatus::Busy;
        }
        Ok(state.load)
    }

    pub fn decrement_load(&self, core: CoreId) -> TetherResult<u64> {
        let mut state = self.entry(core)?.lock();
        if state.load == 0 {
            warn!(core = %core, "load decrement without matching increment");
            return Ok(0);
        }
        state.load -= 1;
        if state.load == 0 && state.status == CoreStatus::Busy {
            state.status = CoreStatus::Trusted;
        }
        Ok(state.load)
    }

    /// Selectable core with the lowest load
    ///
    /// Only `Trusted`/`Busy` cores that also satisfy `predicate` qualify.
    /// Ties go to the lowest core number.
    pub fn least_loaded_core<P>(&self, predicate: P) -> TetherResult<CoreId>
    where
        P: Fn(&CoreState) -> bool,
    {
        let mut best: Option<(u64, CoreId)> = None;
        for (id, entry) in &self.entries {
            let state = entry.lock();
            if !state.status.is_selectable() || !predicate(&state) {
                continue;
            }
            // Ascending iteration: strict comparison keeps the lowest id on ties
            if best.map_or(true, |(load, _)| state.load < load) {
                best = Some((state.load, *id));
            }
        }

        match best {
            Some((load, id)) => {
                debug!(core = %id, load, "selected least loaded core");
                Ok(id)
            }
            None => Err(TetherError::NoCoreAvailable),
        }
    }

    /// Lowest-numbered core currently in `status`
    pub fn first_with_status(&self, status: CoreStatus) -> Option<CoreId> {
        self.entries
            .iter()
            .find(|(_, entry)| entry.lock().status == status)
            .map(|(id, _)| *id)
    }

    /// Copies of every entry, ascending by id
    pub fn snapshot(&self) -> Vec<CoreState> {
        self.entries.values().map(|e| e.lock().clone()).collect()
    }

    /// Mark every core closed
    pub fn close_all(&self) {
        for entry in self.entries.values() {
            entry.lock().status = CoreStatus::Closed;
        }
        info!(cores = self.entries.len(), "all cores closed");
    }
}
