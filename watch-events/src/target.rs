// Debug target: owner of a broadcaster and the watchpoints announced on it

use crate::broadcaster::Broadcaster;
use crate::watchpoint::WatchpointList;
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::info;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TargetId(pub u32);

impl fmt::Display for TargetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

pub struct Target {
    id: TargetId,
    name: String,
    watchpoints: WatchpointList,
}

impl Target {
    pub(crate) fn new(id: TargetId, name: String, broadcaster: Broadcaster) -> Self {
        Self {
            id,
            name,
            watchpoints: WatchpointList::new(broadcaster),
        }
    }

    pub fn id(&self) -> TargetId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn broadcaster(&self) -> &Broadcaster {
        self.watchpoints.broadcaster()
    }

    pub fn watchpoints(&self) -> &WatchpointList {
        &self.watchpoints
    }

    /// Retire the target's broadcaster; later changes fail as stale
    pub fn destroy(&self) {
        info!("Destroying target {} ({})", self.name, self.id);
        self.broadcaster().destroy();
    }
}

impl fmt::Debug for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Target")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("broadcaster", self.broadcaster())
            .field("watchpoints", &self.watchpoints.len())
            .finish()
    }
}
