//! Device state machine and event dispatch
//!
//! The Dispatcher is the single consumer of the event queue and the only
//! owner of the device state. It:
//! - Applies state transitions from the transition table
//! - Runs the attached side effects (reader power mode, camera, attendance)
//! - Checks inactivity timeouts after every wake

mod transitions;
#[cfg(test)]
mod tests;

pub use transitions::{next_transition, Effect, Trigger, TRANSITIONS};

use crate::domain::{CardId, DeviceState, Event, EventReceiver, PowerMode, QueuedEvent};
use crate::infra::config::Config;
use crate::infra::metrics::Metrics;
use crate::io::camera::CameraService;
use crate::services::attendance::AttendanceError;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Peripheral actions driven by state transitions
#[async_trait]
pub trait Peripherals: Send {
    async fn set_power_mode(&mut self, mode: PowerMode) -> anyhow::Result<()>;

    async fn camera_on(&mut self) -> anyhow::Result<()>;

    async fn camera_off(&mut self) -> anyhow::Result<()>;
}

/// Attendance workflow entry point invoked on card scans
#[async_trait]
pub trait AttendanceHandler: Send {
    async fn handle_attendance_event(&mut self, card_id: &CardId) -> Result<(), AttendanceError>;
}

/// Production peripherals: power mode published to the card poller, real camera
pub struct DevicePeripherals {
    power_tx: watch::Sender<PowerMode>,
    camera: Arc<CameraService>,
}

impl DevicePeripherals {
    /// Returns the peripherals and the power mode receiver for the card poller
    pub fn new(camera: Arc<CameraService>) -> (Self, watch::Receiver<PowerMode>) {
        let (power_tx, power_rx) = watch::channel(PowerMode::for_state(DeviceState::Idle));
        (Self { power_tx, camera }, power_rx)
    }
}

#[async_trait]
impl Peripherals for DevicePeripherals {
    async fn set_power_mode(&mut self, mode: PowerMode) -> anyhow::Result<()> {
        let previous = self.power_tx.send_replace(mode);
        if previous != mode {
            info!(mode = %mode.as_str(), "card_reader_power_mode");
        }
        Ok(())
    }

    async fn camera_on(&mut self) -> anyhow::Result<()> {
        self.camera.turn_on().await?;
        Ok(())
    }

    async fn camera_off(&mut self) -> anyhow::Result<()> {
        self.camera.turn_off().await?;
        Ok(())
    }
}

/// Dispatcher timing knobs
#[derive(Debug, Clone, Copy)]
pub struct DispatcherTimings {
    /// ACTIVE -> IDLE after this long without motion
    pub motion_timeout: Duration,
    /// STREAMING -> ACTIVE after this long without a card scan
    pub streaming_timeout: Duration,
    /// Bounded wait on the queue between timeout checks
    pub dispatch_wait: Duration,
}

impl DispatcherTimings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            motion_timeout: config.motion_timeout(),
            streaming_timeout: config.streaming_timeout(),
            dispatch_wait: config.dispatch_wait(),
        }
    }
}

impl Default for DispatcherTimings {
    fn default() -> Self {
        Self {
            motion_timeout: Duration::from_secs(20),
            streaming_timeout: Duration::from_secs(60),
            dispatch_wait: Duration::from_millis(500),
        }
    }
}

/// Single consumer of the event queue; owns the device state
pub struct Dispatcher<P: Peripherals, H: AttendanceHandler> {
    state: DeviceState,
    last_motion: Option<Instant>,
    last_streaming: Option<Instant>,
    peripherals: P,
    attendance: H,
    timings: DispatcherTimings,
    metrics: Arc<Metrics>,
}

impl<P: Peripherals, H: AttendanceHandler> Dispatcher<P, H> {
    pub fn new(peripherals: P, attendance: H, timings: DispatcherTimings, metrics: Arc<Metrics>) -> Self {
        Self {
            state: DeviceState::Idle,
            last_motion: None,
            last_streaming: None,
            peripherals,
            attendance,
            timings,
            metrics,
        }
    }

    /// Consume events until shutdown or until every producer is gone
    pub async fn run(mut self, mut rx: EventReceiver, mut shutdown: watch::Receiver<bool>) {
        info!(
            state = %self.state,
            motion_timeout_secs = %self.timings.motion_timeout.as_secs(),
            streaming_timeout_secs = %self.timings.streaming_timeout.as_secs(),
            "dispatcher_started"
        );

        loop {
            if *shutdown.borrow() {
                break;
            }

            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                received = tokio::time::timeout(self.timings.dispatch_wait, rx.recv()) => {
                    match received {
                        Ok(Some(event)) => self.process_event(event).await,
                        Ok(None) => {
                            info!("event_queue_closed");
                            break;
                        }
                        Err(_) => {}
                    }
                }
            }

            self.check_timeouts(Instant::now()).await;
        }

        info!(state = %self.state, "dispatcher_stopped");
    }

    /// Apply one event: look up the transition, commit the state, run effects
    pub async fn process_event(&mut self, queued: QueuedEvent) {
        let QueuedEvent { event, received_at } = queued;

        match Trigger::for_event(&event) {
            Some(trigger) => {
                let card = match &event {
                    Event::CardScanned { card_id } => Some(card_id),
                    _ => None,
                };
                self.apply(trigger, card, received_at).await;
            }
            None => {
                if let Event::RecognitionCompleted { student_id, identity, confidence } = &event {
                    info!(
                        student_id = %student_id,
                        identity = %identity,
                        confidence = %confidence,
                        "recognition_completed"
                    );
                }
            }
        }

        let latency_us = received_at.elapsed().as_micros() as u64;
        self.metrics.record_event_processed(latency_us);
    }

    /// Apply at most one timeout transition whose deadline has passed
    pub async fn check_timeouts(&mut self, now: Instant) {
        let expired = |since: Option<Instant>, limit: Duration| {
            since.map_or(true, |t| now.saturating_duration_since(t) > limit)
        };

        let timed_out = match self.state {
            DeviceState::Active => expired(self.last_motion, self.timings.motion_timeout),
            DeviceState::Streaming => expired(self.last_streaming, self.timings.streaming_timeout),
            DeviceState::Idle => false,
        };

        if timed_out {
            self.apply(Trigger::Timeout, None, now).await;
        }
    }

    async fn apply(&mut self, trigger: Trigger, card: Option<&CardId>, at: Instant) {
        let Some((next, effects)) = next_transition(self.state, trigger) else {
            debug!(state = %self.state, trigger = %trigger.as_str(), "transition_ignored");
            return;
        };

        let previous = self.state;
        self.state = next;
        if previous != next {
            self.metrics.record_transition(next);
            info!(from = %previous, to = %next, trigger = %trigger.as_str(), "state_changed");
        } else {
            debug!(state = %next, trigger = %trigger.as_str(), "state_refreshed");
        }

        for &effect in effects {
            self.run_effect(effect, card, at).await;
        }
    }

    async fn run_effect(&mut self, effect: Effect, card: Option<&CardId>, at: Instant) {
        let result = match effect {
            Effect::ExitLowPower => self.peripherals.set_power_mode(PowerMode::Active).await,
            Effect::EnterLowPower => self.peripherals.set_power_mode(PowerMode::LowPower).await,
            Effect::CameraOn => self.peripherals.camera_on().await,
            Effect::CameraOff => self.peripherals.camera_off().await,
            Effect::MarkMotion => {
                self.last_motion = Some(at);
                Ok(())
            }
            Effect::MarkStreaming => {
                self.last_streaming = Some(at);
                Ok(())
            }
            Effect::HandleAttendance => {
                let Some(card) = card else {
                    warn!("attendance_without_card");
                    return;
                };
                if let Err(e) = self.attendance.handle_attendance_event(card).await {
                    warn!(card_id = %card, error = %e, "attendance_failed");
                }
                return;
            }
        };

        if let Err(e) = result {
            self.metrics.record_effect_failure();
            warn!(effect = %effect.as_str(), state = %self.state, error = %e, "effect_failed");
        }
    }

    pub fn state(&self) -> DeviceState {
        self.state
    }

    pub fn last_motion(&self) -> Option<Instant> {
        self.last_motion
    }

    pub fn last_streaming(&self) -> Option<Instant> {
        self.last_streaming
    }

    pub fn peripherals(&self) -> &P {
        &self.peripherals
    }

    pub fn attendance(&self) -> &H {
        &self.attendance
    }
}
