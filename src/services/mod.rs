//! Services - business logic and state management
//!
//! This module contains the core business logic services:
//! - `dispatcher` - Device state machine, single consumer of the event queue
//! - `proximity` - Range readings to motion events
//! - `card_poller` - NFC polling driven by the power mode
//! - `attendance` - Schedule, session and photo capture per card scan
//! - `recognition_job` - Recognition, portrait upload and check-in update
//! - `worker_pool` - Bounded pool running recognition jobs

pub mod attendance;
pub mod card_poller;
pub mod dispatcher;
pub mod proximity;
pub mod recognition_job;
pub mod worker_pool;

// Re-export commonly used types
pub use attendance::{AttendanceCoordinator, AttendanceError, AttendanceSettings};
pub use card_poller::{CardPoller, PollerSettings};
pub use dispatcher::{DevicePeripherals, Dispatcher, DispatcherTimings};
pub use proximity::{ProximityMonitor, ProximitySettings};
pub use recognition_job::{RecognitionJob, RecognitionPipeline};
pub use worker_pool::{SubmitError, WorkerPool};
