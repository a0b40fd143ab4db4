//! In-memory backend and recognizer doubles shared by unit tests

use async_trait::async_trait;
use chrono::NaiveDateTime;
use parking_lot::Mutex;
use serde_json::Value;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use crate::domain::schedule::parse_time_of_day;
use crate::domain::{CardId, ClassInfo, FaceMatch};
use crate::io::backend::{AttendanceUpdate, BackendClient, BackendError};
use crate::io::recognition::RecognitionService;

pub(crate) fn class(id: &str, start: &str, end: &str) -> ClassInfo {
    ClassInfo {
        class_id: id.to_string(),
        name: None,
        start_time: parse_time_of_day(start).unwrap(),
        end_time: parse_time_of_day(end).unwrap(),
        professor_id: Some("prof-1".to_string()),
    }
}

#[derive(Default)]
pub(crate) struct MockBackend {
    pub calls: Mutex<Vec<String>>,
    pub schedule: Mutex<Vec<ClassInfo>>,
    pub roster: Mutex<Vec<CardId>>,
    pub updates: Mutex<Vec<(String, AttendanceUpdate)>>,
    pub logs: Mutex<Vec<(String, Value)>>,
    /// Number of upcoming create_session calls that fail
    pub session_failures: AtomicUsize,
    pub fail_schedule: AtomicBool,
    pub fail_upload: AtomicBool,
    pub fail_logs: AtomicBool,
    pub unauthorized: AtomicBool,
    next_id: AtomicUsize,
}

impl MockBackend {
    pub fn with_schedule(schedule: Vec<ClassInfo>, roster: Vec<CardId>) -> Self {
        Self { schedule: Mutex::new(schedule), roster: Mutex::new(roster), ..Default::default() }
    }

    pub fn count(&self, call: &str) -> usize {
        self.calls.lock().iter().filter(|c| c.starts_with(call)).count()
    }

    fn record(&self, call: String) -> Result<(), BackendError> {
        self.calls.lock().push(call);
        if self.unauthorized.load(Ordering::SeqCst) {
            return Err(BackendError::Unauthorized(401));
        }
        Ok(())
    }

    fn unavailable() -> BackendError {
        BackendError::Status { status: 503, body: "unavailable".to_string() }
    }
}

#[async_trait]
impl BackendClient for MockBackend {
    async fn get_schedule(&self, room: &str) -> Result<Vec<ClassInfo>, BackendError> {
        self.record(format!("get_schedule:{}", room))?;
        if self.fail_schedule.load(Ordering::SeqCst) {
            return Err(Self::unavailable());
        }
        Ok(self.schedule.lock().clone())
    }

    async fn create_session(
        &self,
        class: &ClassInfo,
        _start: NaiveDateTime,
        _end: NaiveDateTime,
    ) -> Result<String, BackendError> {
        self.record(format!("create_session:{}", class.class_id))?;
        let remaining = self.session_failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.session_failures.store(remaining - 1, Ordering::SeqCst);
            return Err(Self::unavailable());
        }
        Ok(format!("session-{}", self.next_id.fetch_add(1, Ordering::SeqCst)))
    }

    async fn get_roster(&self, class_id: &str) -> Result<Vec<CardId>, BackendError> {
        self.record(format!("get_roster:{}", class_id))?;
        Ok(self.roster.lock().clone())
    }

    async fn create_attendance_placeholder(
        &self,
        session_id: &str,
        student: &CardId,
    ) -> Result<String, BackendError> {
        self.record(format!("create_placeholder:{}:{}", session_id, student))?;
        Ok(format!("record-{}-{}", session_id, student))
    }

    async fn update_attendance(
        &self,
        record_id: &str,
        update: &AttendanceUpdate,
    ) -> Result<(), BackendError> {
        self.record(format!("update_attendance:{}", record_id))?;
        self.updates.lock().push((record_id.to_string(), update.clone()));
        Ok(())
    }

    async fn upload_image(&self, path: &Path) -> Result<String, BackendError> {
        self.record(format!("upload_image:{}", path.display()))?;
        if self.fail_upload.load(Ordering::SeqCst) {
            return Err(Self::unavailable());
        }
        let name = path.file_name().and_then(|n| n.to_str()).unwrap_or("image.jpg");
        Ok(format!("https://cdn.test/{}", name))
    }

    async fn log(&self, action: &str, metadata: Value) -> Result<(), BackendError> {
        self.record(format!("log:{}", action))?;
        if self.fail_logs.load(Ordering::SeqCst) {
            return Err(Self::unavailable());
        }
        self.logs.lock().push((action.to_string(), metadata));
        Ok(())
    }
}

#[derive(Default)]
pub(crate) struct MockRecognizer {
    pub faces: Mutex<Vec<FaceMatch>>,
    pub fail: AtomicBool,
    pub calls: AtomicUsize,
}

impl MockRecognizer {
    pub fn returning(faces: Vec<FaceMatch>) -> Self {
        Self { faces: Mutex::new(faces), ..Default::default() }
    }
}

#[async_trait]
impl RecognitionService for MockRecognizer {
    async fn identify(&self, _image_path: &Path) -> anyhow::Result<Vec<FaceMatch>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail.load(Ordering::SeqCst) {
            anyhow::bail!("recognizer crashed");
        }
        Ok(self.faces.lock().clone())
    }
}

pub(crate) fn face(identity: &str, cropped: &Path) -> FaceMatch {
    FaceMatch {
        identity: identity.to_string(),
        confidence: 0.9,
        cropped_image_path: cropped.to_path_buf(),
    }
}
