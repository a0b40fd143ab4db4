//! Recognition job: identify the face, upload the portrait, record the check-in
//!
//! Runs on the worker pool. Every step handles its own failure; only a
//! failed recognition ends the job early. An unauthorized backend response
//! requests process shutdown.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::domain::{AttendanceEvent, CardId, Event, EventQueue, FaceMatch};
use crate::infra::metrics::Metrics;
use crate::infra::shutdown::Shutdown;
use crate::io::backend::{AttendanceUpdate, BackendClient, BackendError};
use crate::io::camera::CameraService;
use crate::io::recognition::RecognitionService;
use crate::services::worker_pool::JobRunner;

/// One submitted attendance attempt
#[derive(Debug)]
pub struct RecognitionJob {
    pub attempt_id: Uuid,
    pub event: AttendanceEvent,
    /// Attendance record for the card; None when the card is not on the roster
    pub record_id: Option<String>,
}

pub struct RecognitionPipeline {
    recognizer: Arc<dyn RecognitionService>,
    backend: Arc<dyn BackendClient>,
    camera: Arc<CameraService>,
    events: EventQueue,
    metrics: Arc<Metrics>,
    shutdown: Shutdown,
    clip_on_flag: bool,
}

impl RecognitionPipeline {
    pub fn new(
        recognizer: Arc<dyn RecognitionService>,
        backend: Arc<dyn BackendClient>,
        camera: Arc<CameraService>,
        events: EventQueue,
        metrics: Arc<Metrics>,
        shutdown: Shutdown,
        clip_on_flag: bool,
    ) -> Self {
        Self { recognizer, backend, camera, events, metrics, shutdown, clip_on_flag }
    }

    /// Returns true when the job ran to completion
    async fn process(&self, job: &RecognitionJob) -> bool {
        let card = &job.event.student_id;

        let faces = match self.recognizer.identify(&job.event.captured_image_path).await {
            Ok(faces) => faces,
            Err(e) => {
                warn!(attempt_id = %job.attempt_id, card_id = %card, error = %e, "recognition_failed");
                return false;
            }
        };

        let Some(face) = faces.into_iter().next() else {
            info!(attempt_id = %job.attempt_id, card_id = %card, "no_face_detected");
            return true;
        };

        self.events.push(Event::RecognitionCompleted {
            student_id: card.clone(),
            identity: face.identity.clone(),
            confidence: face.confidence,
        });

        let portrait_url = match self.backend.upload_image(&face.cropped_image_path).await {
            Ok(url) => Some(url),
            Err(e) => {
                self.check_fatal(&e);
                warn!(attempt_id = %job.attempt_id, error = %e, "portrait_upload_failed");
                None
            }
        };

        let flagged = is_flagged(&face, card);
        if flagged {
            info!(
                attempt_id = %job.attempt_id,
                card_id = %card,
                identity = %face.identity,
                confidence = %face.confidence,
                "identity_mismatch"
            );
            if self.clip_on_flag {
                self.save_clip(job).await;
            }
        }

        let Some(record_id) = &job.record_id else {
            warn!(attempt_id = %job.attempt_id, card_id = %card, "student_not_in_roster");
            return true;
        };

        let update = AttendanceUpdate {
            check_in: job.event.timestamp,
            portrait_url,
            identified_id: if face.is_unknown() { String::new() } else { face.identity.clone() },
            flagged,
        };
        match self.backend.update_attendance(record_id, &update).await {
            Ok(()) => {
                self.metrics.record_attendance_update();
                info!(
                    attempt_id = %job.attempt_id,
                    card_id = %card,
                    record_id = %record_id,
                    identity = %update.identified_id,
                    flagged = %flagged,
                    "attendance_updated"
                );
                true
            }
            Err(e) => {
                self.check_fatal(&e);
                warn!(
                    attempt_id = %job.attempt_id,
                    record_id = %record_id,
                    error = %e,
                    "attendance_update_failed"
                );
                false
            }
        }
    }

    async fn save_clip(&self, job: &RecognitionJob) {
        let filename = format!(
            "flag_{}_{}",
            job.event.student_id,
            job.event.timestamp.format("%Y%m%d_%H%M%S")
        );
        match self.camera.save_video_clip(&filename).await {
            Ok(path) => info!(attempt_id = %job.attempt_id, path = %path.display(), "flag_clip_saved"),
            Err(e) => warn!(attempt_id = %job.attempt_id, error = %e, "flag_clip_failed"),
        }
    }

    fn check_fatal(&self, error: &BackendError) {
        if error.is_fatal() {
            self.shutdown.trigger_fatal(error.to_string());
        }
    }
}

/// Recognized as someone else, or not recognized at all
fn is_flagged(face: &FaceMatch, card: &CardId) -> bool {
    face.is_unknown() || CardId::parse(&face.identity).as_ref() != Some(card)
}

#[async_trait]
impl JobRunner for RecognitionPipeline {
    type Job = RecognitionJob;

    async fn run(&self, job: RecognitionJob) {
        let started = Instant::now();
        let ok = self.process(&job).await;

        if let Err(e) = tokio::fs::remove_file(&job.event.captured_image_path).await {
            debug!(path = %job.event.captured_image_path.display(), error = %e, "capture_cleanup_failed");
        }

        let duration_ms = started.elapsed().as_millis() as u64;
        self.metrics.record_recognition(ok, duration_ms);
        debug!(attempt_id = %job.attempt_id, ok = %ok, duration_ms = %duration_ms, "recognition_job_done");
    }
}
