//! UART ultrasonic range sensor
//!
//! Protocol (A02YYUW / JSN-SR04T mode 1):
//! - Baud: 9600, 8N1, sensor streams continuously
//! - Frame: 4 bytes `0xFF, H, L, SUM`
//! - Checksum: `(0xFF + H + L) & 0xFF`
//! - Distance: `H * 256 + L` millimetres, 0 means no echo

use async_trait::async_trait;
use std::io::ErrorKind;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::time::Instant;
use tokio_serial::{ClearBuffer, SerialPort, SerialPortBuilderExt, SerialStream};
use tracing::{debug, info, warn};

use crate::infra::config::ProximityConfig;

const START_BYTE: u8 = 0xFF;
const FRAME_LEN: usize = 4;

/// Source of distance readings for the proximity monitor
///
/// `None` means no usable reading this cycle (no echo, timeout, bad frame,
/// port fault). Implementations never fail hard.
#[async_trait]
pub trait RangeSensor: Send {
    async fn read_distance(&mut self) -> Option<f64>;
}

pub struct SerialRangeSensor {
    device: String,
    baud: u32,
    read_timeout: Duration,
    port: Option<SerialStream>,
    /// Bytes carried between reads; frames can arrive split across reads
    read_buffer: Vec<u8>,
}

impl SerialRangeSensor {
    pub fn new(config: &ProximityConfig) -> Self {
        Self {
            device: config.device.clone(),
            baud: config.baud,
            read_timeout: Duration::from_millis(config.read_timeout_ms),
            port: None,
            read_buffer: Vec::with_capacity(32),
        }
    }

    fn ensure_open(&mut self) -> Option<&mut SerialStream> {
        if self.port.is_none() {
            match tokio_serial::new(&self.device, self.baud).open_native_async() {
                Ok(port) => {
                    info!(device = %self.device, baud = %self.baud, "range_sensor_opened");
                    self.port = Some(port);
                }
                Err(e) => {
                    debug!(device = %self.device, error = %e, "range_sensor_open_failed");
                    return None;
                }
            }
        }
        self.port.as_mut()
    }
}

#[async_trait]
impl RangeSensor for SerialRangeSensor {
    async fn read_distance(&mut self) -> Option<f64> {
        let read_timeout = self.read_timeout;
        let port = self.ensure_open()?;

        // The sensor streams continuously; only a frame newer than this call counts
        if let Err(e) = port.clear(ClearBuffer::Input) {
            debug!(error = %e, "range_sensor_flush_failed");
        }
        self.read_buffer.clear();

        let deadline = Instant::now() + read_timeout;
        let mut temp_buf = [0u8; 32];

        loop {
            if let Some(mm) = extract_frame(&mut self.read_buffer) {
                return millimetres_to_cm(mm);
            }

            let port = self.port.as_mut()?;
            let result = tokio::time::timeout_at(deadline, port.read(&mut temp_buf)).await;
            match result {
                Ok(Ok(n)) if n > 0 => self.read_buffer.extend_from_slice(&temp_buf[..n]),
                Ok(Ok(_)) => {}
                Ok(Err(e)) if e.kind() == ErrorKind::TimedOut => {}
                Ok(Err(e)) => {
                    warn!(device = %self.device, error = %e, "range_sensor_read_error");
                    // Reopen on the next call
                    self.port = None;
                    return None;
                }
                Err(_) => {
                    debug!(buffered = self.read_buffer.len(), "range_sensor_no_frame");
                    return None;
                }
            }
        }
    }
}

fn millimetres_to_cm(mm: u16) -> Option<f64> {
    if mm == 0 {
        return None;
    }
    Some(f64::from(mm) / 10.0)
}

/// Pull the next valid frame out of the buffer
///
/// Bytes before a start byte are discarded; a frame with a bad checksum
/// drops its start byte and the scan resumes after it. Returns the distance
/// in millimetres.
fn extract_frame(buffer: &mut Vec<u8>) -> Option<u16> {
    loop {
        match buffer.iter().position(|&b| b == START_BYTE) {
            Some(0) => {}
            Some(idx) => {
                buffer.drain(..idx);
            }
            None => {
                buffer.clear();
                return None;
            }
        }

        if buffer.len() < FRAME_LEN {
            return None;
        }

        let (high, low, sum) = (buffer[1], buffer[2], buffer[3]);
        let expected = START_BYTE.wrapping_add(high).wrapping_add(low);
        if sum == expected {
            buffer.drain(..FRAME_LEN);
            return Some(u16::from_be_bytes([high, low]));
        }

        tracing::trace!(high, low, sum, expected, "range_sensor_checksum_failed");
        buffer.drain(..1);
    }
}
