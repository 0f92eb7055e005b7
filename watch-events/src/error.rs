// Error types for the event core and the watchpoint collaborator

use crate::broadcaster::BroadcasterId;
use crate::watchpoint::WatchpointId;
use thiserror::Error;

pub type EventResult<T> = Result<T, EventError>;

pub type WatchpointResult<T> = Result<T, WatchpointError>;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EventError {
    #[error("Invalid listener")]
    InvalidListener,

    #[error("Broadcaster {name} ({id}) has been destroyed")]
    StaleBroadcaster { id: BroadcasterId, name: String },

    #[error("Listener '{listener}' queue overflowed, {dropped} event(s) dropped")]
    QueueOverflow { listener: String, dropped: u64 },

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WatchpointError {
    #[error("Watchpoint {0} not found")]
    NotFound(WatchpointId),

    #[error("Invalid watch size {0}: must be 1, 2, 4 or 8 bytes")]
    InvalidSize(usize),

    #[error("Watchpoint must watch reads, writes or both")]
    InvalidKind,

    #[error("Address range {address:#x}+{size} overlaps watchpoint {existing}")]
    Overlap {
        address: u64,
        size: usize,
        existing: WatchpointId,
    },

    #[error("Event error: {0}")]
    Event(#[from] EventError),
}
