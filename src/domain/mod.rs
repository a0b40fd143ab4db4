//! Domain models - device state, events, schedule and session types
//!
//! This module contains the canonical data types used throughout the system:
//! - `DeviceState` / `PowerMode` - state machine state and derived reader mode
//! - `Event` / `EventQueue` - sensor and recognition events feeding the dispatcher
//! - `ClassInfo` / `Session` - class schedule and attendance session bookkeeping
//! - `CardId` / `FaceMatch` / `AttendanceEvent` - identification records

pub mod events;
pub mod schedule;
pub mod types;

pub use events::{create_event_queue, Event, EventQueue, EventReceiver, QueuedEvent};
pub use schedule::{current_class, ClassInfo, Session};
pub use types::{AttendanceEvent, CardId, DeviceState, FaceMatch, PowerMode};
