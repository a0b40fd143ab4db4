//! Proximity monitor - turns range readings into motion events
//!
//! Motion means someone is close (below the threshold) and the distance
//! moved by more than the noise margin since the last valid reading.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, trace};

use crate::domain::{Event, EventQueue};
use crate::infra::config::ProximityConfig;
use crate::infra::metrics::Metrics;
use crate::io::range_sensor::RangeSensor;

#[derive(Debug, Clone, Copy)]
pub struct ProximitySettings {
    pub threshold_cm: f64,
    pub noise_margin_cm: f64,
    pub poll_interval: Duration,
    /// Pause after a motion event
    pub cooldown: Duration,
}

impl ProximitySettings {
    pub fn from_config(config: &ProximityConfig) -> Self {
        Self {
            threshold_cm: config.threshold_cm,
            noise_margin_cm: config.noise_margin_cm,
            poll_interval: Duration::from_millis(config.poll_interval_ms),
            cooldown: Duration::from_millis(config.cooldown_ms),
        }
    }
}

/// Motion test for one pair of readings
#[inline]
pub fn is_motion(last_cm: f64, new_cm: f64, threshold_cm: f64, noise_margin_cm: f64) -> bool {
    new_cm < threshold_cm && (new_cm - last_cm).abs() > noise_margin_cm
}

pub struct ProximityMonitor<S: RangeSensor> {
    sensor: S,
    settings: ProximitySettings,
    events: EventQueue,
    metrics: Arc<Metrics>,
    /// Last valid reading; survives failed reads
    last_distance: Option<f64>,
}

impl<S: RangeSensor> ProximityMonitor<S> {
    pub fn new(sensor: S, settings: ProximitySettings, events: EventQueue, metrics: Arc<Metrics>) -> Self {
        Self { sensor, settings, events, metrics, last_distance: None }
    }

    /// Take one reading; returns true if a motion event was emitted
    pub async fn poll_once(&mut self) -> bool {
        let Some(distance_cm) = self.sensor.read_distance().await else {
            self.metrics.record_sensor_fault();
            trace!("range_read_skipped");
            return false;
        };

        let motion = self.last_distance.is_some_and(|last| {
            is_motion(last, distance_cm, self.settings.threshold_cm, self.settings.noise_margin_cm)
        });
        self.last_distance = Some(distance_cm);

        if motion {
            self.metrics.record_motion();
            debug!(distance_cm = %distance_cm, "motion_detected");
            self.events.push(Event::MotionDetected { distance_cm });
        }
        motion
    }

    /// Poll until shutdown
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        info!(
            threshold_cm = %self.settings.threshold_cm,
            noise_margin_cm = %self.settings.noise_margin_cm,
            "proximity_monitor_started"
        );

        loop {
            if *shutdown.borrow() {
                break;
            }

            let pause = if self.poll_once().await {
                self.settings.cooldown
            } else {
                self.settings.poll_interval
            };

            tokio::select! {
                _ = tokio::time::sleep(pause) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        info!("proximity_monitor_stopped");
    }
}
