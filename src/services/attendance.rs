//! Attendance workflow coordinator
//!
//! Invoked by the dispatcher on every accepted card scan:
//! - Resolves the class in progress from the cached room schedule
//! - Opens a backend session (with one placeholder record per student)
//!   when the class changes, retrying lazily after failures
//! - Captures a photo and hands recognition to the worker pool
//!
//! Nothing here waits on recognition; the dispatcher only pays for the
//! schedule/session round trips and the photo capture.

use async_trait::async_trait;
use chrono::{DateTime, Local, NaiveDate};
use rustc_hash::FxHashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::domain::{current_class, AttendanceEvent, CardId, ClassInfo, Session};
use crate::infra::config::Config;
use crate::infra::metrics::Metrics;
use crate::infra::shutdown::Shutdown;
use crate::io::backend::{BackendClient, BackendError};
use crate::io::camera::{CameraError, CameraService};
use crate::services::dispatcher::AttendanceHandler;
use crate::services::recognition_job::{RecognitionJob, RecognitionPipeline};
use crate::services::worker_pool::{SubmitError, WorkerPool};

#[derive(Debug, Error)]
pub enum AttendanceError {
    #[error("no class scheduled for the rest of the day")]
    NoCurrentClass,
    #[error("schedule unavailable: {0}")]
    Schedule(#[source] BackendError),
    #[error("session creation failed: {0}")]
    Session(#[source] BackendError),
    #[error("photo capture failed: {0}")]
    Capture(#[from] CameraError),
    #[error("recognition job rejected: {0}")]
    Rejected(#[from] SubmitError),
}

#[derive(Debug, Clone)]
pub struct AttendanceSettings {
    pub room: String,
    pub schedule_refresh: Duration,
    /// Repeated taps of one card within this window are coalesced
    pub dedup_window: Duration,
}

impl AttendanceSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            room: config.room().to_string(),
            schedule_refresh: config.schedule_refresh(),
            dedup_window: Duration::from_secs(config.recognition().dedup_window_secs),
        }
    }
}

struct CachedSchedule {
    classes: Vec<ClassInfo>,
    day: NaiveDate,
    fetched_at: Instant,
}

pub struct AttendanceCoordinator {
    backend: Arc<dyn BackendClient>,
    camera: Arc<CameraService>,
    pool: Arc<WorkerPool<RecognitionPipeline>>,
    metrics: Arc<Metrics>,
    shutdown: Shutdown,
    settings: AttendanceSettings,
    schedule: Option<CachedSchedule>,
    session: Option<Session>,
    /// Last accepted tap per card
    recent: FxHashMap<CardId, Instant>,
}

impl AttendanceCoordinator {
    pub fn new(
        backend: Arc<dyn BackendClient>,
        camera: Arc<CameraService>,
        pool: Arc<WorkerPool<RecognitionPipeline>>,
        metrics: Arc<Metrics>,
        shutdown: Shutdown,
        settings: AttendanceSettings,
    ) -> Self {
        Self {
            backend,
            camera,
            pool,
            metrics,
            shutdown,
            settings,
            schedule: None,
            session: None,
            recent: FxHashMap::default(),
        }
    }

    /// Run the workflow for a tap at wall-clock `now` / monotonic `at`
    pub async fn handle_attendance_event_at(
        &mut self,
        card: &CardId,
        now: DateTime<Local>,
        at: Instant,
    ) -> Result<(), AttendanceError> {
        let window = self.settings.dedup_window;
        self.recent.retain(|_, last| at.saturating_duration_since(*last) < window);
        if self.recent.contains_key(card) {
            self.metrics.record_card_deduped();
            debug!(card_id = %card, "attendance_deduped");
            return Ok(());
        }

        self.metrics.record_attendance_attempt();
        match self.attempt(card, now, at).await {
            Ok(()) => {
                self.recent.insert(card.clone(), at);
                Ok(())
            }
            Err(e) => {
                self.metrics.record_attendance_failure();
                Err(e)
            }
        }
    }

    async fn attempt(
        &mut self,
        card: &CardId,
        now: DateTime<Local>,
        at: Instant,
    ) -> Result<(), AttendanceError> {
        let class = self.resolve_class(now, at).await?;
        self.ensure_session(&class, now.date_naive()).await?;

        let (session_id, record_id) = match &self.session {
            Some(session) => (session.session_id.clone(), session.record_for(card).map(str::to_string)),
            None => return Err(AttendanceError::NoCurrentClass),
        };
        if record_id.is_none() {
            warn!(card_id = %card, class_id = %class.class_id, "card_not_in_roster");
        }

        let filename = format!("{}_{}.jpg", card, now.format("%Y%m%d_%H%M%S"));
        let captured = self.camera.take_picture(Some(&filename)).await?;

        let attempt_id = Uuid::now_v7();
        let job = RecognitionJob {
            attempt_id,
            event: AttendanceEvent {
                student_id: card.clone(),
                captured_image_path: captured.clone(),
                timestamp: now,
            },
            record_id,
        };

        if let Err(e) = self.pool.submit(job) {
            if e == SubmitError::QueueFull {
                self.metrics.record_recognition_dropped();
            }
            warn!(attempt_id = %attempt_id, card_id = %card, error = %e, "recognition_job_dropped");
            let _ = tokio::fs::remove_file(&captured).await;
            return Err(e.into());
        }

        info!(
            attempt_id = %attempt_id,
            card_id = %card,
            class_id = %class.class_id,
            session_id = %session_id,
            queued = %self.pool.queued(),
            "attendance_submitted"
        );
        Ok(())
    }

    /// Class in progress (or next up) today, refreshing the schedule if stale
    async fn resolve_class(
        &mut self,
        now: DateTime<Local>,
        at: Instant,
    ) -> Result<ClassInfo, AttendanceError> {
        let today = now.date_naive();
        let stale = match &self.schedule {
            Some(cached) => {
                cached.day != today
                    || at.saturating_duration_since(cached.fetched_at) >= self.settings.schedule_refresh
            }
            None => true,
        };

        if stale {
            match self.backend.get_schedule(&self.settings.room).await {
                Ok(classes) => {
                    info!(room = %self.settings.room, classes = classes.len(), "schedule_refreshed");
                    self.schedule = Some(CachedSchedule { classes, day: today, fetched_at: at });
                }
                Err(e) => {
                    self.check_fatal(&e);
                    match &self.schedule {
                        Some(cached) if cached.day == today => {
                            warn!(error = %e, "schedule_refresh_failed_using_cached");
                        }
                        _ => return Err(AttendanceError::Schedule(e)),
                    }
                }
            }
        }

        let classes = self.schedule.as_ref().map(|s| s.classes.as_slice()).unwrap_or_default();
        match current_class(classes, now.time()) {
            Some(class) => Ok(class.clone()),
            None => {
                if let Some(session) = self.session.take() {
                    info!(session_id = %session.session_id, "session_closed");
                }
                warn!(room = %self.settings.room, "no_current_class");
                Err(AttendanceError::NoCurrentClass)
            }
        }
    }

    /// Open a session for this period of `class` unless one is already active for it
    async fn ensure_session(&mut self, class: &ClassInfo, day: NaiveDate) -> Result<(), AttendanceError> {
        if let Some(session) = &self.session {
            let (start_time, end_time) = class.bounds_on(day);
            if session.class_id == class.class_id
                && session.start_time == start_time
                && session.end_time == end_time
            {
                return Ok(());
            }
            info!(
                session_id = %session.session_id,
                from_class = %session.class_id,
                to_class = %class.class_id,
                period_start = %start_time,
                "class_period_changed"
            );
            self.session = None;
        }

        match self.create_session(class, day).await {
            Ok(session) => {
                info!(
                    session_id = %session.session_id,
                    class_id = %session.class_id,
                    students = session.records.len(),
                    "session_created"
                );
                self.session = Some(session);
                Ok(())
            }
            Err(e) => {
                self.check_fatal(&e);
                warn!(class_id = %class.class_id, error = %e, "session_creation_failed");
                Err(AttendanceError::Session(e))
            }
        }
    }

    async fn create_session(&self, class: &ClassInfo, day: NaiveDate) -> Result<Session, BackendError> {
        let (start_time, end_time) = class.bounds_on(day);
        let session_id = self.backend.create_session(class, start_time, end_time).await?;
        let roster = self.backend.get_roster(&class.class_id).await?;

        let mut records = FxHashMap::default();
        for student in roster {
            let record_id = self.backend.create_attendance_placeholder(&session_id, &student).await?;
            records.insert(student, record_id);
        }

        Ok(Session { session_id, class_id: class.class_id.clone(), start_time, end_time, records })
    }

    fn check_fatal(&self, error: &BackendError) {
        if error.is_fatal() {
            self.shutdown.trigger_fatal(error.to_string());
        }
    }

    pub fn session(&self) -> Option<&Session> {
        self.session.as_ref()
    }
}

#[async_trait]
impl AttendanceHandler for AttendanceCoordinator {
    async fn handle_attendance_event(&mut self, card_id: &CardId) -> Result<(), AttendanceError> {
        self.handle_attendance_event_at(card_id, Local::now(), Instant::now()).await
    }
}
