//! Tests for the Dispatcher module

use super::*;
use crate::domain::create_event_queue;

#[derive(Default)]
struct MockPeripherals {
    calls: Vec<&'static str>,
    fail_camera: bool,
}

impl MockPeripherals {
    fn count(&self, call: &str) -> usize {
        self.calls.iter().filter(|c| **c == call).count()
    }
}

#[async_trait]
impl Peripherals for MockPeripherals {
    async fn set_power_mode(&mut self, mode: PowerMode) -> anyhow::Result<()> {
        self.calls.push(match mode {
            PowerMode::LowPower => "low_power",
            PowerMode::Active => "active_power",
        });
        Ok(())
    }

    async fn camera_on(&mut self) -> anyhow::Result<()> {
        self.calls.push("camera_on");
        if self.fail_camera {
            anyhow::bail!("camera unplugged");
        }
        Ok(())
    }

    async fn camera_off(&mut self) -> anyhow::Result<()> {
        self.calls.push("camera_off");
        Ok(())
    }
}

#[derive(Default)]
struct MockAttendance {
    cards: Vec<CardId>,
    fail: bool,
}

#[async_trait]
impl AttendanceHandler for MockAttendance {
    async fn handle_attendance_event(&mut self, card_id: &CardId) -> Result<(), AttendanceError> {
        self.cards.push(card_id.clone());
        if self.fail {
            return Err(AttendanceError::NoCurrentClass);
        }
        Ok(())
    }
}

type TestDispatcher = Dispatcher<MockPeripherals, MockAttendance>;

fn create_test_dispatcher() -> TestDispatcher {
    create_test_dispatcher_with(MockPeripherals::default(), MockAttendance::default())
}

fn create_test_dispatcher_with(
    peripherals: MockPeripherals,
    attendance: MockAttendance,
) -> TestDispatcher {
    Dispatcher::new(peripherals, attendance, DispatcherTimings::default(), Arc::new(Metrics::new()))
}

fn secs(s: u64) -> Duration {
    Duration::from_secs(s)
}

fn card() -> CardId {
    CardId::from_uid(&[0xE2, 0xEE, 0xC8, 0x01])
}

fn motion(at: Instant) -> QueuedEvent {
    QueuedEvent::at(Event::MotionDetected { distance_cm: 30.0 }, at)
}

fn scan(at: Instant) -> QueuedEvent {
    QueuedEvent::at(Event::CardScanned { card_id: card() }, at)
}

#[tokio::test]
async fn test_motion_in_idle_activates() {
    let mut dispatcher = create_test_dispatcher();
    let t0 = Instant::now();

    dispatcher.process_event(motion(t0)).await;

    assert_eq!(dispatcher.state(), DeviceState::Active);
    assert_eq!(dispatcher.last_motion(), Some(t0));
    assert_eq!(dispatcher.peripherals().calls, ["active_power", "camera_on"]);
}

#[tokio::test]
async fn test_card_in_idle_activates_without_attendance() {
    let mut dispatcher = create_test_dispatcher();

    dispatcher.process_event(scan(Instant::now())).await;

    assert_eq!(dispatcher.state(), DeviceState::Active);
    assert!(dispatcher.attendance().cards.is_empty());
}

#[tokio::test]
async fn test_active_motion_timeout_goes_idle_once() {
    let mut dispatcher = create_test_dispatcher();
    let t0 = Instant::now();
    dispatcher.process_event(motion(t0)).await;

    dispatcher.check_timeouts(t0 + secs(10)).await;
    assert_eq!(dispatcher.state(), DeviceState::Active);

    dispatcher.check_timeouts(t0 + secs(21)).await;
    assert_eq!(dispatcher.state(), DeviceState::Idle);

    dispatcher.check_timeouts(t0 + secs(40)).await;
    let peripherals = dispatcher.peripherals();
    assert_eq!(peripherals.count("low_power"), 1);
    assert_eq!(peripherals.count("camera_off"), 1);
}

#[tokio::test]
async fn test_motion_refreshes_active_deadline() {
    let mut dispatcher = create_test_dispatcher();
    let t0 = Instant::now();
    dispatcher.process_event(motion(t0)).await;
    dispatcher.process_event(motion(t0 + secs(15))).await;

    dispatcher.check_timeouts(t0 + secs(30)).await;
    assert_eq!(dispatcher.state(), DeviceState::Active);
    assert_eq!(dispatcher.peripherals().count("camera_on"), 1);

    dispatcher.check_timeouts(t0 + secs(36)).await;
    assert_eq!(dispatcher.state(), DeviceState::Idle);
}

#[tokio::test]
async fn test_card_in_active_starts_streaming() {
    let mut dispatcher = create_test_dispatcher();
    let t0 = Instant::now();
    dispatcher.process_event(motion(t0)).await;

    dispatcher.process_event(scan(t0 + secs(2))).await;

    assert_eq!(dispatcher.state(), DeviceState::Streaming);
    assert_eq!(dispatcher.last_streaming(), Some(t0 + secs(2)));
    assert_eq!(dispatcher.attendance().cards, [card()]);
}

#[tokio::test]
async fn test_rescan_in_streaming_skips_entry_action() {
    let mut dispatcher = create_test_dispatcher();
    let t0 = Instant::now();
    dispatcher.process_event(motion(t0)).await;
    dispatcher.process_event(scan(t0 + secs(1))).await;
    let camera_on_before = dispatcher.peripherals().count("camera_on");

    dispatcher.process_event(scan(t0 + secs(30))).await;

    assert_eq!(dispatcher.state(), DeviceState::Streaming);
    assert_eq!(dispatcher.attendance().cards.len(), 2);
    assert_eq!(dispatcher.last_streaming(), Some(t0 + secs(30)));
    assert_eq!(dispatcher.peripherals().count("camera_on"), camera_on_before);
}

#[tokio::test]
async fn test_motion_in_streaming_only_refreshes_motion_time() {
    let mut dispatcher = create_test_dispatcher();
    let t0 = Instant::now();
    dispatcher.process_event(motion(t0)).await;
    dispatcher.process_event(scan(t0 + secs(1))).await;
    let calls_before = dispatcher.peripherals().calls.len();

    dispatcher.process_event(motion(t0 + secs(20))).await;

    assert_eq!(dispatcher.state(), DeviceState::Streaming);
    assert_eq!(dispatcher.last_motion(), Some(t0 + secs(20)));
    assert_eq!(dispatcher.last_streaming(), Some(t0 + secs(1)));
    assert_eq!(dispatcher.peripherals().calls.len(), calls_before);
}

#[tokio::test]
async fn test_timeout_in_idle_is_ignored() {
    let mut dispatcher = create_test_dispatcher();

    dispatcher.process_event(QueuedEvent::new(Event::Timeout)).await;
    dispatcher.check_timeouts(Instant::now() + secs(3600)).await;

    assert_eq!(dispatcher.state(), DeviceState::Idle);
    assert!(dispatcher.peripherals().calls.is_empty());
}

#[tokio::test]
async fn test_recognition_completed_is_informational() {
    let mut dispatcher = create_test_dispatcher();
    let metrics = dispatcher.metrics.clone();

    dispatcher
        .process_event(QueuedEvent::new(Event::RecognitionCompleted {
            student_id: card(),
            identity: "E2EEC801".into(),
            confidence: 0.93,
        }))
        .await;

    assert_eq!(dispatcher.state(), DeviceState::Idle);
    assert_eq!(metrics.events_total(), 1);
    assert_eq!(metrics.transitions_total(), 0);
}

#[tokio::test]
async fn test_effect_failure_still_commits_transition() {
    let peripherals = MockPeripherals { fail_camera: true, ..Default::default() };
    let mut dispatcher = create_test_dispatcher_with(peripherals, MockAttendance::default());
    let metrics = dispatcher.metrics.clone();
    let t0 = Instant::now();

    dispatcher.process_event(motion(t0)).await;

    assert_eq!(dispatcher.state(), DeviceState::Active);
    assert_eq!(dispatcher.last_motion(), Some(t0));
    assert_eq!(metrics.effect_failures_total(), 1);
}

#[tokio::test]
async fn test_attendance_failure_keeps_streaming() {
    let attendance = MockAttendance { fail: true, ..Default::default() };
    let mut dispatcher = create_test_dispatcher_with(MockPeripherals::default(), attendance);
    let t0 = Instant::now();
    dispatcher.process_event(motion(t0)).await;

    dispatcher.process_event(scan(t0 + secs(1))).await;

    assert_eq!(dispatcher.state(), DeviceState::Streaming);
    assert_eq!(dispatcher.attendance().cards.len(), 1);
}

#[tokio::test]
async fn test_classroom_scenario() {
    let mut dispatcher = create_test_dispatcher();
    let t0 = Instant::now();
    assert_eq!(dispatcher.state(), DeviceState::Idle);

    dispatcher.process_event(motion(t0)).await;
    assert_eq!(dispatcher.state(), DeviceState::Active);

    dispatcher.process_event(scan(t0 + secs(5))).await;
    assert_eq!(dispatcher.state(), DeviceState::Streaming);
    assert_eq!(dispatcher.attendance().cards, [card()]);

    dispatcher.check_timeouts(t0 + secs(66)).await;
    assert_eq!(dispatcher.state(), DeviceState::Active);

    dispatcher.check_timeouts(t0 + secs(90)).await;
    assert_eq!(dispatcher.state(), DeviceState::Idle);

    let peripherals = dispatcher.peripherals();
    assert_eq!(
        peripherals.calls,
        ["active_power", "camera_on", "camera_on", "low_power", "camera_off"]
    );
}

#[tokio::test]
async fn test_one_timeout_transition_per_check() {
    let mut dispatcher = create_test_dispatcher();
    let t0 = Instant::now();
    dispatcher.process_event(motion(t0)).await;
    dispatcher.process_event(scan(t0 + secs(1))).await;

    // Both deadlines have passed; only STREAMING -> ACTIVE applies
    dispatcher.check_timeouts(t0 + secs(120)).await;
    assert_eq!(dispatcher.state(), DeviceState::Active);

    dispatcher.check_timeouts(t0 + secs(120)).await;
    assert_eq!(dispatcher.state(), DeviceState::Idle);
}

#[tokio::test]
async fn test_run_exits_on_shutdown() {
    let dispatcher = create_test_dispatcher();
    let (queue, rx) = create_event_queue();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let handle = tokio::spawn(dispatcher.run(rx, shutdown_rx));
    assert!(queue.push(Event::MotionDetected { distance_cm: 20.0 }));
    shutdown_tx.send(true).unwrap();

    tokio::time::timeout(secs(2), handle).await.unwrap().unwrap();
}

#[tokio::test]
async fn test_run_exits_when_producers_gone() {
    let dispatcher = create_test_dispatcher();
    let (queue, rx) = create_event_queue();
    let (_shutdown_tx, shutdown_rx) = watch::channel(false);

    let handle = tokio::spawn(dispatcher.run(rx, shutdown_rx));
    drop(queue);

    tokio::time::timeout(secs(2), handle).await.unwrap().unwrap();
}
