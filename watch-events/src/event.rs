// Event records and event-type masks
//
// Watchpoint changes are announced with one bit each. A listener's
// subscription to a broadcaster is a single mask built from these bits.

use crate::broadcaster::BroadcasterId;
use crate::watchpoint::{Watchpoint, WatchpointId};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::{BitAnd, BitAndAssign, BitOr, BitOrAssign, Not};

// Bit positions match the debugger's watchpoint event numbering
pub mod event_bits {
    pub const ADDED: u32 = 1 << 1;
    pub const REMOVED: u32 = 1 << 2;
    pub const ENABLED: u32 = 1 << 6;
    pub const DISABLED: u32 = 1 << 7;
    pub const COMMAND_CHANGED: u32 = 1 << 8;
    pub const CONDITION_CHANGED: u32 = 1 << 9;
    pub const IGNORE_CHANGED: u32 = 1 << 10;
    pub const THREAD_CHANGED: u32 = 1 << 11;
    pub const TYPE_CHANGED: u32 = 1 << 12;
}

/// A single kind of watchpoint transition
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
#[repr(u32)]
pub enum WatchpointEventType {
    Added = event_bits::ADDED,
    Removed = event_bits::REMOVED,
    Enabled = event_bits::ENABLED,
    Disabled = event_bits::DISABLED,
    CommandChanged = event_bits::COMMAND_CHANGED,
    ConditionChanged = event_bits::CONDITION_CHANGED,
    IgnoreChanged = event_bits::IGNORE_CHANGED,
    ThreadChanged = event_bits::THREAD_CHANGED,
    TypeChanged = event_bits::TYPE_CHANGED,
}

impl WatchpointEventType {
    pub const ALL: [WatchpointEventType; 9] = [
        WatchpointEventType::Added,
        WatchpointEventType::Removed,
        WatchpointEventType::Enabled,
        WatchpointEventType::Disabled,
        WatchpointEventType::CommandChanged,
        WatchpointEventType::ConditionChanged,
        WatchpointEventType::IgnoreChanged,
        WatchpointEventType::ThreadChanged,
        WatchpointEventType::TypeChanged,
    ];

    pub fn bit(self) -> u32 {
        self as u32
    }

    pub fn mask(self) -> EventTypeMask {
        EventTypeMask(self.bit())
    }

    pub fn from_bit(bit: u32) -> Option<Self> {
        Self::ALL.iter().copied().find(|t| t.bit() == bit)
    }

    pub fn name(self) -> &'static str {
        match self {
            WatchpointEventType::Added => "added",
            WatchpointEventType::Removed => "removed",
            WatchpointEventType::Enabled => "enabled",
            WatchpointEventType::Disabled => "disabled",
            WatchpointEventType::CommandChanged => "command-changed",
            WatchpointEventType::ConditionChanged => "condition-changed",
            WatchpointEventType::IgnoreChanged => "ignore-changed",
            WatchpointEventType::ThreadChanged => "thread-changed",
            WatchpointEventType::TypeChanged => "type-changed",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|t| t.name() == name)
    }
}

impl fmt::Display for WatchpointEventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Fixed-width set of `WatchpointEventType` bits
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventTypeMask(u32);

impl EventTypeMask {
    pub const NONE: EventTypeMask = EventTypeMask(0);
    pub const ADDED: EventTypeMask = EventTypeMask(event_bits::ADDED);
    pub const REMOVED: EventTypeMask = EventTypeMask(event_bits::REMOVED);
    pub const ENABLED: EventTypeMask = EventTypeMask(event_bits::ENABLED);
    pub const DISABLED: EventTypeMask = EventTypeMask(event_bits::DISABLED);
    pub const COMMAND_CHANGED: EventTypeMask = EventTypeMask(event_bits::COMMAND_CHANGED);
    pub const CONDITION_CHANGED: EventTypeMask = EventTypeMask(event_bits::CONDITION_CHANGED);
    pub const IGNORE_CHANGED: EventTypeMask = EventTypeMask(event_bits::IGNORE_CHANGED);
    pub const THREAD_CHANGED: EventTypeMask = EventTypeMask(event_bits::THREAD_CHANGED);
    pub const TYPE_CHANGED: EventTypeMask = EventTypeMask(event_bits::TYPE_CHANGED);
    pub const ALL: EventTypeMask = EventTypeMask(
        event_bits::ADDED
            | event_bits::REMOVED
            | event_bits::ENABLED
            | event_bits::DISABLED
            | event_bits::COMMAND_CHANGED
            | event_bits::CONDITION_CHANGED
            | event_bits::IGNORE_CHANGED
            | event_bits::THREAD_CHANGED
            | event_bits::TYPE_CHANGED,
    );

    /// Build a mask from raw bits, discarding anything outside the known set
    pub fn from_bits_truncate(bits: u32) -> Self {
        EventTypeMask(bits & Self::ALL.0)
    }

    pub fn bits(self) -> u32 {
        self.0
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn contains(self, other: EventTypeMask) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn intersects(self, other: EventTypeMask) -> bool {
        self.0 & other.0 != 0
    }

    pub fn includes(self, event_type: WatchpointEventType) -> bool {
        self.0 & event_type.bit() != 0
    }

    pub fn types(self) -> impl Iterator<Item = WatchpointEventType> {
        WatchpointEventType::ALL
            .into_iter()
            .filter(move |t| self.includes(*t))
    }
}

impl From<WatchpointEventType> for EventTypeMask {
    fn from(event_type: WatchpointEventType) -> Self {
        event_type.mask()
    }
}

impl FromIterator<WatchpointEventType> for EventTypeMask {
    fn from_iter<I: IntoIterator<Item = WatchpointEventType>>(iter: I) -> Self {
        iter.into_iter().fold(EventTypeMask::NONE, |mask, t| mask | t)
    }
}

impl BitOr for EventTypeMask {
    type Output = EventTypeMask;

    fn bitor(self, rhs: EventTypeMask) -> EventTypeMask {
        EventTypeMask(self.0 | rhs.0)
    }
}

impl BitOr<WatchpointEventType> for EventTypeMask {
    type Output = EventTypeMask;

    fn bitor(self, rhs: WatchpointEventType) -> EventTypeMask {
        EventTypeMask(self.0 | rhs.bit())
    }
}

impl BitOr for WatchpointEventType {
    type Output = EventTypeMask;

    fn bitor(self, rhs: WatchpointEventType) -> EventTypeMask {
        EventTypeMask(self.bit() | rhs.bit())
    }
}

impl BitOrAssign for EventTypeMask {
    fn bitor_assign(&mut self, rhs: EventTypeMask) {
        self.0 |= rhs.0;
    }
}

impl BitAnd for EventTypeMask {
    type Output = EventTypeMask;

    fn bitand(self, rhs: EventTypeMask) -> EventTypeMask {
        EventTypeMask(self.0 & rhs.0)
    }
}

impl BitAndAssign for EventTypeMask {
    fn bitand_assign(&mut self, rhs: EventTypeMask) {
        self.0 &= rhs.0;
    }
}

// Complement stays within the known bits
impl Not for EventTypeMask {
    type Output = EventTypeMask;

    fn not(self) -> EventTypeMask {
        EventTypeMask(!self.0 & Self::ALL.0)
    }
}

impl fmt::Display for EventTypeMask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return f.write_str("none");
        }
        let mut first = true;
        for event_type in self.types() {
            if !first {
                f.write_str("|")?;
            }
            f.write_str(event_type.name())?;
            first = false;
        }
        Ok(())
    }
}

/// Watchpoint state captured right after a transition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WatchpointEventData {
    pub watchpoint: Watchpoint,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventPayload {
    Watchpoint(WatchpointEventData),
    Opaque { data: Bytes },
}

/// Immutable notification delivered to listener queues
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    broadcaster: BroadcasterId,
    sequence: u64,
    event_type: WatchpointEventType,
    payload: Option<EventPayload>,
}

impl Event {
    pub(crate) fn new(
        broadcaster: BroadcasterId,
        sequence: u64,
        event_type: WatchpointEventType,
        payload: Option<EventPayload>,
    ) -> Self {
        Self {
            broadcaster,
            sequence,
            event_type,
            payload,
        }
    }

    pub fn broadcaster(&self) -> BroadcasterId {
        self.broadcaster
    }

    /// Position of this event in its broadcaster's stream, starting at 1
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    pub fn event_type(&self) -> WatchpointEventType {
        self.event_type
    }

    pub fn payload(&self) -> Option<&EventPayload> {
        self.payload.as_ref()
    }

    pub fn matches(&self, broadcaster: BroadcasterId, mask: EventTypeMask) -> bool {
        self.broadcaster == broadcaster && mask.includes(self.event_type)
    }

    pub fn is_watchpoint_event(&self) -> bool {
        matches!(self.payload, Some(EventPayload::Watchpoint(_)))
    }

    /// Transition type, only for events carrying watchpoint data
    pub fn watchpoint_event_type(&self) -> Option<WatchpointEventType> {
        self.is_watchpoint_event().then_some(self.event_type)
    }

    pub fn watchpoint(&self) -> Option<&Watchpoint> {
        match &self.payload {
            Some(EventPayload::Watchpoint(data)) => Some(&data.watchpoint),
            _ => None,
        }
    }

    pub fn watchpoint_id(&self) -> Option<WatchpointId> {
        self.watchpoint().map(|wp| wp.id)
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "event #{} from broadcaster {}: {}",
            self.sequence, self.broadcaster, self.event_type
        )?;
        if let Some(id) = self.watchpoint_id() {
            write!(f, " (watchpoint {})", id)?;
        }
        Ok(())
    }
}
