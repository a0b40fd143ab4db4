//! Device state transition table
//!
//! Each row is `(state, trigger, next_state, effects)`. Effects run in
//! order after the new state has been committed. Pairs missing from the
//! table are ignored by the dispatcher.

use crate::domain::{DeviceState, Event};

/// What moved the state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    Motion,
    Card,
    Timeout,
}

impl Trigger {
    /// Map a queued event to its trigger; informational events have none
    pub fn for_event(event: &Event) -> Option<Self> {
        match event {
            Event::MotionDetected { .. } => Some(Trigger::Motion),
            Event::CardScanned { .. } => Some(Trigger::Card),
            Event::Timeout => Some(Trigger::Timeout),
            Event::RecognitionCompleted { .. } => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Trigger::Motion => "motion",
            Trigger::Card => "card",
            Trigger::Timeout => "timeout",
        }
    }
}

/// Action attached to a transition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Effect {
    /// Card reader back to fast polling
    ExitLowPower,
    /// Card reader to slow polling
    EnterLowPower,
    CameraOn,
    CameraOff,
    /// lastMotionTime = event time
    MarkMotion,
    /// lastStreamingTime = event time
    MarkStreaming,
    /// Run the attendance workflow for the scanned card
    HandleAttendance,
}

impl Effect {
    pub fn as_str(&self) -> &'static str {
        match self {
            Effect::ExitLowPower => "exit_low_power",
            Effect::EnterLowPower => "enter_low_power",
            Effect::CameraOn => "camera_on",
            Effect::CameraOff => "camera_off",
            Effect::MarkMotion => "mark_motion",
            Effect::MarkStreaming => "mark_streaming",
            Effect::HandleAttendance => "handle_attendance",
        }
    }
}

pub type Transition = (DeviceState, Trigger, DeviceState, &'static [Effect]);

use DeviceState::{Active, Idle, Streaming};
use Effect::*;

pub static TRANSITIONS: &[Transition] = &[
    (Idle, Trigger::Motion, Active, &[ExitLowPower, CameraOn, MarkMotion]),
    (Idle, Trigger::Card, Active, &[ExitLowPower, CameraOn, MarkMotion]),
    (Active, Trigger::Motion, Active, &[MarkMotion]),
    (Active, Trigger::Card, Streaming, &[CameraOn, MarkStreaming, HandleAttendance]),
    (Active, Trigger::Timeout, Idle, &[EnterLowPower, CameraOff]),
    (Streaming, Trigger::Card, Streaming, &[MarkStreaming, HandleAttendance]),
    (Streaming, Trigger::Motion, Streaming, &[MarkMotion]),
    (Streaming, Trigger::Timeout, Active, &[]),
];

/// Look up the row for `(state, trigger)`
pub fn next_transition(
    state: DeviceState,
    trigger: Trigger,
) -> Option<(DeviceState, &'static [Effect])> {
    TRANSITIONS
        .iter()
        .find(|(from, on, _, _)| *from == state && *on == trigger)
        .map(|(_, _, to, effects)| (*to, *effects))
}
