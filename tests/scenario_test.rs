//! End-to-end classroom scenario with in-memory peripherals and backend

use async_trait::async_trait;
use attendance_controller::domain::{create_event_queue, CardId, ClassInfo, Event, FaceMatch, PowerMode};
use attendance_controller::infra::config::CameraConfig;
use attendance_controller::infra::{Metrics, Shutdown};
use attendance_controller::io::{
    AttendanceUpdate, BackendClient, BackendError, CameraDriver, CameraError, CameraService,
    RecognitionService,
};
use attendance_controller::services::{
    AttendanceCoordinator, AttendanceSettings, DevicePeripherals, Dispatcher, DispatcherTimings,
    RecognitionPipeline, WorkerPool,
};
use bytes::Bytes;
use chrono::{NaiveDateTime, NaiveTime};
use parking_lot::Mutex;
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

const STUDENT: &str = "E2EEC801";

#[derive(Default)]
struct Backend {
    sessions: AtomicUsize,
    updates: Mutex<Vec<(String, AttendanceUpdate)>>,
}

#[async_trait]
impl BackendClient for Backend {
    async fn get_schedule(&self, _room: &str) -> Result<Vec<ClassInfo>, BackendError> {
        // One class spanning the whole day so the test never depends on the clock
        Ok(vec![ClassInfo {
            class_id: "all-day".to_string(),
            name: Some("Homeroom".to_string()),
            start_time: NaiveTime::MIN,
            end_time: NaiveTime::from_hms_opt(23, 59, 59).unwrap(),
            professor_id: None,
        }])
    }

    async fn create_session(
        &self,
        _class: &ClassInfo,
        _start: NaiveDateTime,
        _end: NaiveDateTime,
    ) -> Result<String, BackendError> {
        self.sessions.fetch_add(1, Ordering::SeqCst);
        Ok("session-1".to_string())
    }

    async fn get_roster(&self, _class_id: &str) -> Result<Vec<CardId>, BackendError> {
        Ok(vec![CardId::parse(STUDENT).unwrap()])
    }

    async fn create_attendance_placeholder(
        &self,
        _session_id: &str,
        student: &CardId,
    ) -> Result<String, BackendError> {
        Ok(format!("record-{}", student))
    }

    async fn update_attendance(
        &self,
        record_id: &str,
        update: &AttendanceUpdate,
    ) -> Result<(), BackendError> {
        self.updates.lock().push((record_id.to_string(), update.clone()));
        Ok(())
    }

    async fn upload_image(&self, path: &Path) -> Result<String, BackendError> {
        Ok(format!("https://cdn.test/{}", path.display()))
    }

    async fn log(&self, _action: &str, _metadata: Value) -> Result<(), BackendError> {
        Ok(())
    }
}

#[derive(Default)]
struct Camera {
    starts: AtomicUsize,
    stops: AtomicUsize,
}

#[async_trait]
impl CameraDriver for Camera {
    async fn start(&self) -> Result<(), CameraError> {
        self.starts.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn stop(&self) -> Result<(), CameraError> {
        self.stops.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn capture_jpeg(&self) -> Result<Bytes, CameraError> {
        Ok(Bytes::from_static(&[0xFF, 0xD8, 0xFF, 0xD9]))
    }
}

struct Recognizer;

#[async_trait]
impl RecognitionService for Recognizer {
    async fn identify(&self, _image_path: &Path) -> anyhow::Result<Vec<FaceMatch>> {
        Ok(vec![FaceMatch {
            identity: STUDENT.to_string(),
            confidence: 0.91,
            cropped_image_path: PathBuf::from("crop.jpg"),
        }])
    }
}

async fn wait_until(what: &str, mut condition: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !condition() {
        assert!(tokio::time::Instant::now() < deadline, "timed out waiting for {}", what);
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[tokio::test]
async fn test_classroom_day() {
    let dir = tempfile::tempdir().unwrap();
    let backend = Arc::new(Backend::default());
    let driver = Arc::new(Camera::default());
    let camera_config = CameraConfig {
        capture_dir: dir.path().join("captures"),
        clip_dir: dir.path().join("clips"),
        ..CameraConfig::default()
    };
    let camera = Arc::new(CameraService::new(&camera_config, driver.clone()));
    let metrics = Arc::new(Metrics::new());
    let shutdown = Shutdown::new();
    let (events, event_rx) = create_event_queue();

    let pipeline = RecognitionPipeline::new(
        Arc::new(Recognizer),
        backend.clone(),
        camera.clone(),
        events.clone(),
        metrics.clone(),
        shutdown.clone(),
        false,
    );
    let pool = Arc::new(WorkerPool::new(Arc::new(pipeline), 2, 4));
    let coordinator = AttendanceCoordinator::new(
        backend.clone(),
        camera.clone(),
        pool.clone(),
        metrics.clone(),
        shutdown.clone(),
        AttendanceSettings {
            room: "B-204".to_string(),
            schedule_refresh: Duration::from_secs(3600),
            dedup_window: Duration::from_secs(5),
        },
    );
    let (peripherals, power_rx) = DevicePeripherals::new(camera.clone());
    let timings = DispatcherTimings {
        motion_timeout: Duration::from_millis(300),
        streaming_timeout: Duration::from_millis(200),
        dispatch_wait: Duration::from_millis(20),
    };
    let dispatcher = Dispatcher::new(peripherals, coordinator, timings, metrics.clone());
    let handle = tokio::spawn(dispatcher.run(event_rx, shutdown.subscribe()));

    // Someone walks up: IDLE -> ACTIVE, reader wakes, camera on
    assert_eq!(*power_rx.borrow(), PowerMode::LowPower);
    events.push(Event::MotionDetected { distance_cm: 35.0 });
    wait_until("active", || *power_rx.borrow() == PowerMode::Active && camera.is_active()).await;
    assert_eq!(metrics.device_state(), 1);

    // Card tap: ACTIVE -> STREAMING, attendance recorded in the background
    let card = CardId::parse(STUDENT).unwrap();
    events.push(Event::CardScanned { card_id: card.clone() });
    wait_until("attendance update", || !backend.updates.lock().is_empty()).await;
    {
        let updates = backend.updates.lock();
        assert_eq!(updates[0].0, format!("record-{}", STUDENT));
        assert_eq!(updates[0].1.identified_id, STUDENT);
        assert!(!updates[0].1.flagged);
    }
    assert_eq!(backend.sessions.load(Ordering::SeqCst), 1);

    // Nobody around: STREAMING -> ACTIVE -> IDLE, camera off, reader back to low power
    wait_until("idle", || *power_rx.borrow() == PowerMode::LowPower && !camera.is_active()).await;
    assert_eq!(metrics.device_state(), 0);
    assert_eq!(driver.starts.load(Ordering::SeqCst), 1);
    assert_eq!(driver.stops.load(Ordering::SeqCst), 1);

    // Captured photo is removed once recognition has used it
    let captures = dir.path().join("captures");
    wait_until("capture cleanup", || std::fs::read_dir(&captures).unwrap().count() == 0).await;

    shutdown.trigger();
    tokio::time::timeout(Duration::from_secs(2), handle).await.unwrap().unwrap();
    pool.shutdown(Duration::from_secs(2)).await;

    let summary = metrics.report();
    assert_eq!(summary.attendance_attempts_total, 1);
    assert_eq!(summary.recognition_completed_total, 1);
    assert_eq!(summary.transitions_total, 4);
    assert_eq!(summary.effect_failures_total, 0);
}
