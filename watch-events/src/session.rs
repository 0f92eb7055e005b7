// Debug session registry
//
// A session owns its targets and hands out broadcaster ids. Anything that
// needs to broadcast or subscribe is given the session (or a target) by
// reference; there is no process-wide event bus.

use crate::broadcaster::{Broadcaster, BroadcasterId};
use crate::config::SessionConfig;
use crate::error::EventResult;
use crate::listener::Listener;
use crate::target::{Target, TargetId};
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use tracing::info;

pub struct Session {
    config: SessionConfig,
    targets: RwLock<BTreeMap<TargetId, Arc<Target>>>,
    next_target_id: AtomicU32,
    next_broadcaster_id: AtomicU64,
}

impl Default for Session {
    fn default() -> Self {
        Self::build(SessionConfig::default())
    }
}

impl Session {
    pub fn new(config: SessionConfig) -> EventResult<Self> {
        config.validate()?;
        Ok(Self::build(config))
    }

    fn build(config: SessionConfig) -> Self {
        Self {
            config,
            targets: RwLock::new(BTreeMap::new()),
            next_target_id: AtomicU32::new(1),
            next_broadcaster_id: AtomicU64::new(1),
        }
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Broadcaster with a session-unique id, for producers other than targets
    pub fn create_broadcaster(&self, name: impl Into<String>) -> Broadcaster {
        let id = BroadcasterId(self.next_broadcaster_id.fetch_add(1, Ordering::SeqCst));
        Broadcaster::new(id, name)
    }

    pub fn create_target(&self, name: impl Into<String>) -> Arc<Target> {
        let name = name.into();
        let id = TargetId(self.next_target_id.fetch_add(1, Ordering::SeqCst));
        let broadcaster = self.create_broadcaster(format!("target.{}", name));
        let target = Arc::new(Target::new(id, name, broadcaster));

        info!("Created target {} ({})", target.name(), id);
        self.targets.write().insert(id, Arc::clone(&target));
        target
    }

    pub fn target(&self, id: TargetId) -> Option<Arc<Target>> {
        self.targets.read().get(&id).cloned()
    }

    pub fn targets(&self) -> Vec<Arc<Target>> {
        self.targets.read().values().cloned().collect()
    }

    /// Remove a target and retire its broadcaster
    pub fn delete_target(&self, id: TargetId) -> bool {
        let removed = self.targets.write().remove(&id);
        match removed {
            Some(target) => {
                target.destroy();
                true
            }
            None => false,
        }
    }

    /// Listener using this session's queue settings
    pub fn create_listener(&self, name: impl Into<String>) -> Listener {
        // Session config was validated on construction
        Listener::build(name.into(), self.config.queue.clone())
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        for target in self.targets.get_mut().values() {
            target.destroy();
        }
    }
}
