//! IO modules - external system interfaces
//!
//! This module contains all external IO operations:
//! - `range_sensor` - Serial time-of-flight range sensor
//! - `card_reader` - PN532 NFC reader over UART
//! - `camera` - Camera driver, still capture and rolling clip buffer
//! - `recognition` - Out-of-process face recognizer
//! - `backend` - Attendance backend REST client
//! - `log_forwarder` - Ships log records to the backend
//! - `prometheus` - Prometheus metrics HTTP endpoint

pub mod backend;
pub mod camera;
pub mod card_reader;
pub mod log_forwarder;
pub mod prometheus;
pub mod range_sensor;
pub mod recognition;

// Re-export commonly used types
pub use backend::{AttendanceUpdate, BackendClient, BackendError, HttpBackend};
pub use camera::{CameraDriver, CameraError, CameraService, CommandCamera};
pub use card_reader::{CardReader, CardReaderError, Pn532Reader};
pub use log_forwarder::LogForwarder;
pub use range_sensor::{RangeSensor, SerialRangeSensor};
pub use recognition::{CommandRecognizer, RecognitionService};
