// Watchpoint configuration state
//
// Each observable change to a watchpoint's configuration is announced with
// exactly one event on the owning target's broadcaster. Setting a value equal
// to the current one changes nothing and announces nothing.

use crate::broadcaster::{Broadcaster, DispatchGuard};
use crate::error::{WatchpointError, WatchpointResult};
use crate::event::{EventPayload, WatchpointEventData, WatchpointEventType};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WatchpointId(pub u32);

impl fmt::Display for WatchpointId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Which accesses trigger the watchpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WatchKind {
    pub read: bool,
    pub write: bool,
}

impl WatchKind {
    pub const READ: WatchKind = WatchKind { read: true, write: false };
    pub const WRITE: WatchKind = WatchKind { read: false, write: true };
    pub const READ_WRITE: WatchKind = WatchKind { read: true, write: true };

    pub fn is_valid(self) -> bool {
        self.read || self.write
    }
}

impl fmt::Display for WatchKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.read, self.write) {
            (true, true) => f.write_str("rw"),
            (true, false) => f.write_str("r"),
            (false, true) => f.write_str("w"),
            (false, false) => f.write_str("-"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Watchpoint {
    pub id: WatchpointId,
    pub address: u64,
    pub size: usize,
    pub kind: WatchKind,
    pub enabled: bool,
    pub ignore_count: u32,
    pub condition: Option<String>,
    pub commands: Vec<String>,
    pub thread_id: Option<u64>,
    pub hit_count: u32,
}

impl Watchpoint {
    fn overlaps(&self, address: u64, size: usize) -> bool {
        let end = address.saturating_add(size as u64);
        let own_end = self.address.saturating_add(self.size as u64);
        address < own_end && self.address < end
    }
}

impl fmt::Display for Watchpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Watchpoint {}: addr = {:#x} size = {} state = {} type = {}",
            self.id,
            self.address,
            self.size,
            if self.enabled { "enabled" } else { "disabled" },
            self.kind
        )?;
        write!(f, " hit_count = {}", self.hit_count)?;
        if self.ignore_count > 0 {
            write!(f, " ignore = {}", self.ignore_count)?;
        }
        if let Some(condition) = &self.condition {
            write!(f, " condition = '{}'", condition)?;
        }
        Ok(())
    }
}

struct WatchpointTable {
    next_id: u32,
    watchpoints: BTreeMap<WatchpointId, Watchpoint>,
}

/// Watchpoints of one target
///
/// Mutations and their broadcasts happen under one lock, so listeners see
/// events in the same order the changes were applied. Each mutation also
/// holds the broadcaster's dispatch guard, so a concurrent `destroy()` lands
/// either before the change, which then fails as stale, or after its event.
pub struct WatchpointList {
    broadcaster: Broadcaster,
    table: Mutex<WatchpointTable>,
}

impl WatchpointList {
    pub fn new(broadcaster: Broadcaster) -> Self {
        Self {
            broadcaster,
            table: Mutex::new(WatchpointTable {
                next_id: 1,
                watchpoints: BTreeMap::new(),
            }),
        }
    }

    pub fn broadcaster(&self) -> &Broadcaster {
        &self.broadcaster
    }

    /// Watch `size` bytes at `address`. Announces `Added`.
    pub fn add(&self, address: u64, size: usize, kind: WatchKind) -> WatchpointResult<WatchpointId> {
        if !matches!(size, 1 | 2 | 4 | 8) {
            return Err(WatchpointError::InvalidSize(size));
        }
        if !kind.is_valid() {
            return Err(WatchpointError::InvalidKind);
        }

        let mut table = self.table.lock();
        let mut dispatch = self.broadcaster.begin_dispatch()?;

        if let Some(existing) = table
            .watchpoints
            .values()
            .find(|wp| wp.overlaps(address, size))
        {
            return Err(WatchpointError::Overlap {
                address,
                size,
                existing: existing.id,
            });
        }

        let id = WatchpointId(table.next_id);
        table.next_id += 1;

        let watchpoint = Watchpoint {
            id,
            address,
            size,
            kind,
            enabled: true,
            ignore_count: 0,
            condition: None,
            commands: Vec::new(),
            thread_id: None,
            hit_count: 0,
        };
        info!("Added {}", watchpoint);
        table.watchpoints.insert(id, watchpoint.clone());
        announce(&mut dispatch, WatchpointEventType::Added, watchpoint);

        Ok(id)
    }

    /// Delete a watchpoint. Announces `Removed` with its final state.
    pub fn remove(&self, id: WatchpointId) -> WatchpointResult<Watchpoint> {
        let mut table = self.table.lock();
        let mut dispatch = self.broadcaster.begin_dispatch()?;

        let watchpoint = table
            .watchpoints
            .remove(&id)
            .ok_or(WatchpointError::NotFound(id))?;
        info!("Removed watchpoint {}", id);
        announce(&mut dispatch, WatchpointEventType::Removed, watchpoint.clone());

        Ok(watchpoint)
    }

    /// Delete every watchpoint, one `Removed` event each
    pub fn remove_all(&self) -> WatchpointResult<usize> {
        let mut table = self.table.lock();
        let mut dispatch = self.broadcaster.begin_dispatch()?;

        let removed = std::mem::take(&mut table.watchpoints);
        let count = removed.len();
        for (_, watchpoint) in removed {
            announce(&mut dispatch, WatchpointEventType::Removed, watchpoint);
        }
        info!("Removed all {} watchpoint(s)", count);

        Ok(count)
    }

    pub fn set_enabled(&self, id: WatchpointId, enabled: bool) -> WatchpointResult<bool> {
        self.update(id, |wp| {
            if wp.enabled == enabled {
                return None;
            }
            wp.enabled = enabled;
            Some(if enabled {
                WatchpointEventType::Enabled
            } else {
                WatchpointEventType::Disabled
            })
        })
    }

    pub fn set_ignore_count(&self, id: WatchpointId, count: u32) -> WatchpointResult<bool> {
        self.update(id, |wp| {
            if wp.ignore_count == count {
                return None;
            }
            wp.ignore_count = count;
            Some(WatchpointEventType::IgnoreChanged)
        })
    }

    /// Set or clear the stop condition. An empty string clears it.
    pub fn set_condition(&self, id: WatchpointId, condition: Option<&str>) -> WatchpointResult<bool> {
        let condition = condition.filter(|c| !c.is_empty()).map(str::to_string);
        self.update(id, |wp| {
            if wp.condition == condition {
                return None;
            }
            wp.condition = condition;
            Some(WatchpointEventType::ConditionChanged)
        })
    }

    pub fn set_commands(&self, id: WatchpointId, commands: Vec<String>) -> WatchpointResult<bool> {
        self.update(id, |wp| {
            if wp.commands == commands {
                return None;
            }
            wp.commands = commands;
            Some(WatchpointEventType::CommandChanged)
        })
    }

    pub fn set_thread_id(&self, id: WatchpointId, thread_id: Option<u64>) -> WatchpointResult<bool> {
        self.update(id, |wp| {
            if wp.thread_id == thread_id {
                return None;
            }
            wp.thread_id = thread_id;
            Some(WatchpointEventType::ThreadChanged)
        })
    }

    pub fn set_kind(&self, id: WatchpointId, kind: WatchKind) -> WatchpointResult<bool> {
        if !kind.is_valid() {
            return Err(WatchpointError::InvalidKind);
        }
        self.update(id, |wp| {
            if wp.kind == kind {
                return None;
            }
            wp.kind = kind;
            Some(WatchpointEventType::TypeChanged)
        })
    }

    pub fn get(&self, id: WatchpointId) -> Option<Watchpoint> {
        self.table.lock().watchpoints.get(&id).cloned()
    }

    pub fn list(&self) -> Vec<Watchpoint> {
        self.table.lock().watchpoints.values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.table.lock().watchpoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.lock().watchpoints.is_empty()
    }

    // Apply `change` and announce the event type it reports, if any.
    // Returns whether the watchpoint changed.
    fn update(
        &self,
        id: WatchpointId,
        change: impl FnOnce(&mut Watchpoint) -> Option<WatchpointEventType>,
    ) -> WatchpointResult<bool> {
        let mut table = self.table.lock();
        let mut dispatch = self.broadcaster.begin_dispatch()?;

        let watchpoint = table
            .watchpoints
            .get_mut(&id)
            .ok_or(WatchpointError::NotFound(id))?;

        match change(watchpoint) {
            Some(event_type) => {
                let snapshot = watchpoint.clone();
                debug!("Watchpoint {} changed: {}", id, event_type);
                announce(&mut dispatch, event_type, snapshot);
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

fn announce(dispatch: &mut DispatchGuard<'_>, event_type: WatchpointEventType, watchpoint: Watchpoint) {
    let payload = EventPayload::Watchpoint(WatchpointEventData { watchpoint });
    dispatch.broadcast(event_type, Some(payload));
}
