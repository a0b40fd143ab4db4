//! Device events and the event queue feeding the dispatcher
//!
//! Producers (proximity monitor, card poller, recognition workers) hold an
//! [`EventQueue`] clone; the dispatcher owns the single [`EventReceiver`].
//! The queue is unbounded so producers never block on a slow dispatcher.

use crate::domain::types::CardId;
use std::time::Instant;
use tokio::sync::mpsc;
use tracing::warn;

/// Input to the device state machine
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    MotionDetected { distance_cm: f64 },
    CardScanned { card_id: CardId },
    RecognitionCompleted { student_id: CardId, identity: String, confidence: f32 },
    Timeout,
}

impl Event {
    pub fn as_str(&self) -> &'static str {
        match self {
            Event::MotionDetected { .. } => "motion_detected",
            Event::CardScanned { .. } => "card_scanned",
            Event::RecognitionCompleted { .. } => "recognition_completed",
            Event::Timeout => "timeout",
        }
    }
}

/// Event plus the instant it entered the queue
#[derive(Debug, Clone)]
pub struct QueuedEvent {
    pub event: Event,
    pub received_at: Instant,
}

impl QueuedEvent {
    pub fn new(event: Event) -> Self {
        Self { event, received_at: Instant::now() }
    }

    pub fn at(event: Event, received_at: Instant) -> Self {
        Self { event, received_at }
    }
}

/// Producer handle for the event queue
#[derive(Debug, Clone)]
pub struct EventQueue {
    tx: mpsc::UnboundedSender<QueuedEvent>,
}

/// Consumer side of the event queue
pub type EventReceiver = mpsc::UnboundedReceiver<QueuedEvent>;

impl EventQueue {
    /// Enqueue an event stamped with the current instant
    ///
    /// Returns false if the dispatcher is gone (shutdown in progress).
    pub fn push(&self, event: Event) -> bool {
        let kind = event.as_str();
        match self.tx.send(QueuedEvent::new(event)) {
            Ok(()) => true,
            Err(_) => {
                warn!(event = %kind, "event_queue_closed");
                false
            }
        }
    }
}

/// Create the event queue: cloneable producer handle plus the single receiver
pub fn create_event_queue() -> (EventQueue, EventReceiver) {
    let (tx, rx) = mpsc::unbounded_channel();
    (EventQueue { tx }, rx)
}
