// Server-side session state
//
// Holds the debug session plus the listeners clients have created, keyed by
// the ids handed back to them.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::info;
use watch_events::{EventResult, Listener, Session, SessionConfig, Target, TargetId};

pub type ListenerId = String;

pub struct SessionManager {
    session: Mutex<Arc<Session>>,
    listeners: Mutex<HashMap<ListenerId, Listener>>,
    next_listener: AtomicU64,
}

impl SessionManager {
    pub fn new() -> Self {
        Self {
            session: Mutex::new(Arc::new(Session::default())),
            listeners: Mutex::new(HashMap::new()),
            next_listener: AtomicU64::new(1),
        }
    }

    /// Start over with a fresh session; existing listeners are dropped
    pub async fn reset(&self, config: SessionConfig) -> EventResult<()> {
        let session = Session::new(config)?;
        info!("Starting session (queue capacity={})", session.config().queue.capacity);
        *self.session.lock().await = Arc::new(session);
        self.listeners.lock().await.clear();
        Ok(())
    }

    pub async fn session(&self) -> Arc<Session> {
        Arc::clone(&*self.session.lock().await)
    }

    pub async fn target(&self, id: u32) -> Option<Arc<Target>> {
        self.session().await.target(TargetId(id))
    }

    pub async fn create_listener(&self, name: &str) -> ListenerId {
        let listener = self.session().await.create_listener(name);
        let id = format!(
            "listener_{}",
            self.next_listener.fetch_add(1, Ordering::SeqCst)
        );
        self.listeners.lock().await.insert(id.clone(), listener);
        id
    }

    pub async fn listener(&self, id: &str) -> Option<Listener> {
        self.listeners.lock().await.get(id).cloned()
    }

    pub async fn remove_listener(&self, id: &str) -> bool {
        self.listeners.lock().await.remove(id).is_some()
    }
}
