// Watchpoint event core for debugger sessions
//
// Broadcasters announce watchpoint configuration changes; listeners queue
// them for pull-based consumers:
// - Event and event-type masks
// - Broadcaster registration and fan-out
// - Listener queues with blocking wait and peek
// - Watchpoint list, targets and the session registry that own broadcasters

pub mod broadcaster;
pub mod config;
pub mod error;
pub mod event;
pub mod listener;
pub mod session;
pub mod target;
pub mod watchpoint;

pub use broadcaster::{Broadcaster, BroadcasterId, DispatchGuard, DispatchReport};
pub use config::{OverflowPolicy, QueueConfig, SessionConfig};
pub use error::{EventError, EventResult, WatchpointError, WatchpointResult};
pub use event::{Event, EventPayload, EventTypeMask, WatchpointEventData, WatchpointEventType};
pub use listener::{Listener, WeakListener};
pub use session::Session;
pub use target::{Target, TargetId};
pub use watchpoint::{WatchKind, Watchpoint, WatchpointId, WatchpointList};
