//! Card poller - owns the NFC reader and emits card scan events
//!
//! The polling interval follows the power mode published by the
//! dispatcher: slow while idle, fast while someone is at the device.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{info, warn};

use crate::domain::{Event, EventQueue, PowerMode};
use crate::infra::config::NfcConfig;
use crate::infra::metrics::Metrics;
use crate::io::card_reader::CardReader;

#[derive(Debug, Clone, Copy)]
pub struct PollerSettings {
    pub idle_poll: Duration,
    pub active_poll: Duration,
    /// Pause after a successful scan
    pub cooldown: Duration,
}

impl PollerSettings {
    pub fn from_config(config: &NfcConfig) -> Self {
        Self {
            idle_poll: Duration::from_millis(config.idle_poll_ms),
            active_poll: Duration::from_millis(config.active_poll_ms),
            cooldown: Duration::from_millis(config.cooldown_ms),
        }
    }

    pub fn interval_for(&self, mode: PowerMode) -> Duration {
        match mode {
            PowerMode::LowPower => self.idle_poll,
            PowerMode::Active => self.active_poll,
        }
    }
}

pub struct CardPoller<R: CardReader> {
    reader: R,
    power_rx: watch::Receiver<PowerMode>,
    /// Mode last applied to the reader
    applied: Option<PowerMode>,
    settings: PollerSettings,
    events: EventQueue,
    metrics: Arc<Metrics>,
}

impl<R: CardReader> CardPoller<R> {
    pub fn new(
        reader: R,
        power_rx: watch::Receiver<PowerMode>,
        settings: PollerSettings,
        events: EventQueue,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self { reader, power_rx, applied: None, settings, events, metrics }
    }

    /// One poll cycle; returns how long to pause before the next one
    pub async fn poll_once(&mut self) -> Duration {
        let mode = *self.power_rx.borrow_and_update();
        if self.applied != Some(mode) {
            self.apply_mode(mode).await;
        }

        let interval = self.settings.interval_for(mode);
        match self.reader.read_card(interval).await {
            Ok(Some(card_id)) => {
                self.metrics.record_card_scan();
                info!(card_id = %card_id, mode = %mode.as_str(), "card_scanned");
                self.events.push(Event::CardScanned { card_id });
                self.settings.cooldown
            }
            Ok(None) => Duration::ZERO,
            Err(e) => {
                self.metrics.record_card_read_error();
                warn!(error = %e, backoff_ms = %interval.as_millis(), "card_read_failed");
                interval
            }
        }
    }

    async fn apply_mode(&mut self, mode: PowerMode) {
        let result = match mode {
            PowerMode::LowPower => self.reader.enter_low_power().await,
            PowerMode::Active => self.reader.exit_low_power().await,
        };
        match result {
            Ok(()) => {
                self.applied = Some(mode);
                info!(mode = %mode.as_str(), "card_reader_mode_applied");
            }
            Err(e) => {
                self.metrics.record_card_read_error();
                warn!(mode = %mode.as_str(), error = %e, "card_reader_mode_failed");
            }
        }
    }

    /// Poll until shutdown
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        info!(
            idle_poll_ms = %self.settings.idle_poll.as_millis(),
            active_poll_ms = %self.settings.active_poll.as_millis(),
            "card_poller_started"
        );

        loop {
            if *shutdown.borrow() {
                break;
            }

            let pause = tokio::select! {
                pause = self.poll_once() => pause,
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                    continue;
                }
            };

            if pause.is_zero() {
                continue;
            }
            tokio::select! {
                _ = tokio::time::sleep(pause) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        info!("card_poller_stopped");
    }
}
