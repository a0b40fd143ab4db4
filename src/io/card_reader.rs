//! PN532 NFC card reader over HSU (UART)
//!
//! Protocol:
//! - Baud: 115200, 8N1
//! - Information frame: `00 00 FF LEN LCS TFI CMD DATA.. DCS 00`
//!   - TFI: 0xD4 host to reader, 0xD5 reader to host
//!   - LCS: `LEN + LCS == 0`, DCS: `TFI + CMD + sum(DATA) + DCS == 0`
//! - ACK frame: `00 00 FF 00 FF 00`
//! - A response carries command code + 1
//!
//! Low power is a software mode: between polls the RF field is switched
//! off and the poller slows down.

use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::time::Instant;
use tokio_serial::{SerialPortBuilderExt, SerialStream};
use tracing::{debug, info, warn};

use crate::domain::CardId;
use crate::infra::config::NfcConfig;

const TFI_HOST: u8 = 0xD4;
const TFI_READER: u8 = 0xD5;
const TFI_ERROR: u8 = 0x7F;

const CMD_SAM_CONFIGURATION: u8 = 0x14;
const CMD_RF_CONFIGURATION: u8 = 0x32;
const CMD_IN_LIST_PASSIVE_TARGET: u8 = 0x4A;

/// SAM normal mode, 1 s virtual card timeout, use IRQ
const SAM_NORMAL_MODE: [u8; 3] = [0x01, 0x14, 0x01];
/// One target, 106 kbps type A
const LIST_ONE_ISO14443A: [u8; 2] = [0x01, 0x00];
const RF_FIELD_ITEM: u8 = 0x01;

const ACK_FRAME: [u8; 6] = [0x00, 0x00, 0xFF, 0x00, 0xFF, 0x00];
/// HSU wake-up: long preamble so the reader leaves its power-down state
const WAKEUP_PREAMBLE: [u8; 16] =
    [0x55, 0x55, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00];

const ACK_TIMEOUT: Duration = Duration::from_millis(100);
const COMMAND_TIMEOUT: Duration = Duration::from_millis(500);

#[derive(Debug, Error)]
pub enum CardReaderError {
    #[error("serial port unavailable: {0}")]
    Port(#[from] tokio_serial::Error),
    #[error("serial I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("reader did not acknowledge command 0x{0:02X}")]
    NoAck(u8),
    #[error("reader rejected command 0x{0:02X}")]
    Rejected(u8),
    #[error("no response to command 0x{0:02X}")]
    NoResponse(u8),
    #[error("serial port not open")]
    NotOpen,
}

/// Card reader used by the card poller
#[async_trait]
pub trait CardReader: Send {
    /// Wait up to `timeout` for a card. `Ok(None)` when nothing was presented.
    async fn read_card(&mut self, timeout: Duration) -> Result<Option<CardId>, CardReaderError>;

    async fn enter_low_power(&mut self) -> Result<(), CardReaderError>;

    async fn exit_low_power(&mut self) -> Result<(), CardReaderError>;
}

/// Decoded frame from the reader
#[derive(Debug, Clone, PartialEq, Eq)]
enum Frame {
    Ack,
    Nack,
    /// Application-level error frame
    Error,
    Response { command: u8, data: Vec<u8> },
}

/// Encode an information frame
fn encode_frame(tfi: u8, command: u8, params: &[u8]) -> Vec<u8> {
    let len = (params.len() + 2) as u8;
    let mut frame = Vec::with_capacity(params.len() + 9);
    frame.extend_from_slice(&[0x00, 0x00, 0xFF, len, 0u8.wrapping_sub(len), tfi, command]);
    frame.extend_from_slice(params);
    let sum = params.iter().fold(tfi.wrapping_add(command), |acc, &b| acc.wrapping_add(b));
    frame.push(0u8.wrapping_sub(sum));
    frame.push(0x00);
    frame
}

/// Pull the next complete frame out of the buffer
///
/// Leading noise and frames failing their checksums are discarded.
fn extract_frame(buffer: &mut Vec<u8>) -> Option<Frame> {
    loop {
        let Some(start) = buffer.windows(2).position(|w| w == [0x00, 0xFF]) else {
            // A trailing 0x00 may be the first half of the next start code
            let keep = usize::from(buffer.last() == Some(&0x00));
            let drop_len = buffer.len() - keep;
            buffer.drain(..drop_len);
            return None;
        };
        buffer.drain(..start);

        if buffer.len() < 4 {
            return None;
        }
        let (len, lcs) = (buffer[2], buffer[3]);

        match (len, lcs) {
            (0x00, 0xFF) => {
                buffer.drain(..4);
                return Some(Frame::Ack);
            }
            (0xFF, 0x00) => {
                buffer.drain(..4);
                return Some(Frame::Nack);
            }
            _ if len.wrapping_add(lcs) != 0 => {
                tracing::trace!(len, lcs, "pn532_bad_length_checksum");
                buffer.drain(..2);
                continue;
            }
            _ => {}
        }

        let body_end = 4 + len as usize;
        if buffer.len() < body_end + 1 {
            return None;
        }
        let body = &buffer[4..body_end];
        let dcs = buffer[body_end];
        let sum = body.iter().fold(dcs, |acc, &b| acc.wrapping_add(b));
        if sum != 0 {
            tracing::trace!(len, "pn532_bad_data_checksum");
            buffer.drain(..2);
            continue;
        }

        let frame = match body {
            [TFI_READER, command, data @ ..] => {
                Some(Frame::Response { command: *command, data: data.to_vec() })
            }
            [TFI_ERROR, ..] => Some(Frame::Error),
            _ => None,
        };
        buffer.drain(..body_end + 1);
        if let Some(frame) = frame {
            return Some(frame);
        }
    }
}

/// UID of the first target in an InListPassiveTarget response
///
/// Layout: `NbTg, Tg, SENS_RES(2), SEL_RES, NFCIDLength, NFCID1..`
fn parse_target_uid(data: &[u8]) -> Option<&[u8]> {
    match data {
        [0, ..] => None,
        [_, _tg, _sens_hi, _sens_lo, _sel, uid_len, rest @ ..] => {
            let uid_len = *uid_len as usize;
            if uid_len == 0 || rest.len() < uid_len {
                return None;
            }
            Some(&rest[..uid_len])
        }
        _ => None,
    }
}

pub struct Pn532Reader {
    device: String,
    baud: u32,
    port: Option<SerialStream>,
    read_buffer: Vec<u8>,
    configured: bool,
    low_power: bool,
}

impl Pn532Reader {
    pub fn new(config: &NfcConfig) -> Self {
        Self {
            device: config.device.clone(),
            baud: config.baud,
            port: None,
            read_buffer: Vec::with_capacity(64),
            configured: false,
            low_power: false,
        }
    }

    /// Open the port and configure the SAM if not done yet
    async fn ensure_ready(&mut self) -> Result<(), CardReaderError> {
        if self.port.is_none() {
            let port = tokio_serial::new(&self.device, self.baud).open_native_async()?;
            info!(device = %self.device, baud = %self.baud, "pn532_port_opened");
            self.port = Some(port);
            self.configured = false;
        }

        if !self.configured {
            self.write(&WAKEUP_PREAMBLE).await?;
            self.command(CMD_SAM_CONFIGURATION, &SAM_NORMAL_MODE, COMMAND_TIMEOUT)
                .await?
                .ok_or(CardReaderError::NoResponse(CMD_SAM_CONFIGURATION))?;
            self.configured = true;
            info!(device = %self.device, "pn532_configured");
        }
        Ok(())
    }

    async fn write(&mut self, bytes: &[u8]) -> Result<(), CardReaderError> {
        let port = self.port.as_mut().ok_or(CardReaderError::NotOpen)?;
        port.write_all(bytes).await?;
        port.flush().await?;
        Ok(())
    }

    /// Read frames until one arrives or the deadline passes
    async fn next_frame(&mut self, deadline: Instant) -> Result<Option<Frame>, CardReaderError> {
        let mut temp_buf = [0u8; 64];
        loop {
            if let Some(frame) = extract_frame(&mut self.read_buffer) {
                return Ok(Some(frame));
            }
            let port = self.port.as_mut().ok_or(CardReaderError::NotOpen)?;
            let result = tokio::time::timeout_at(deadline, port.read(&mut temp_buf)).await;
            match result {
                Ok(Ok(n)) => self.read_buffer.extend_from_slice(&temp_buf[..n]),
                Ok(Err(e)) if e.kind() == std::io::ErrorKind::TimedOut => {}
                Ok(Err(e)) => return Err(e.into()),
                Err(_) => return Ok(None),
            }
        }
    }

    /// Send a command and wait for its response
    ///
    /// `Ok(None)` when the response did not arrive before `timeout`; the
    /// pending command is aborted in that case.
    async fn command(
        &mut self,
        command: u8,
        params: &[u8],
        timeout: Duration,
    ) -> Result<Option<Vec<u8>>, CardReaderError> {
        self.read_buffer.clear();
        self.write(&encode_frame(TFI_HOST, command, params)).await?;

        match self.next_frame(Instant::now() + ACK_TIMEOUT).await? {
            Some(Frame::Ack) => {}
            Some(Frame::Error) => return Err(CardReaderError::Rejected(command)),
            _ => return Err(CardReaderError::NoAck(command)),
        }

        let deadline = Instant::now() + timeout;
        loop {
            match self.next_frame(deadline).await? {
                Some(Frame::Response { command: code, data }) if code == command.wrapping_add(1) => {
                    // Acknowledge receipt
                    self.write(&ACK_FRAME).await?;
                    return Ok(Some(data));
                }
                Some(Frame::Error) => return Err(CardReaderError::Rejected(command)),
                Some(other) => debug!(frame = ?other, "pn532_unexpected_frame"),
                None => {
                    // An ACK from the host aborts the pending command
                    self.write(&ACK_FRAME).await?;
                    return Ok(None);
                }
            }
        }
    }

    async fn set_rf_field(&mut self, on: bool) -> Result<(), CardReaderError> {
        self.command(CMD_RF_CONFIGURATION, &[RF_FIELD_ITEM, u8::from(on)], COMMAND_TIMEOUT)
            .await?
            .ok_or(CardReaderError::NoResponse(CMD_RF_CONFIGURATION))?;
        Ok(())
    }

    /// Drop the port so the next call reopens and reconfigures
    fn reset(&mut self) {
        self.port = None;
        self.configured = false;
        self.read_buffer.clear();
    }

    async fn poll_once(&mut self, timeout: Duration) -> Result<Option<CardId>, CardReaderError> {
        self.ensure_ready().await?;

        let response =
            self.command(CMD_IN_LIST_PASSIVE_TARGET, &LIST_ONE_ISO14443A, timeout).await?;

        if self.low_power {
            if let Err(e) = self.set_rf_field(false).await {
                debug!(error = %e, "pn532_rf_off_failed");
            }
        }

        Ok(response.as_deref().and_then(parse_target_uid).map(CardId::from_uid))
    }
}

#[async_trait]
impl CardReader for Pn532Reader {
    async fn read_card(&mut self, timeout: Duration) -> Result<Option<CardId>, CardReaderError> {
        let result = self.poll_once(timeout).await;
        if let Err(e) = &result {
            if matches!(e, CardReaderError::Io(_) | CardReaderError::NoAck(_)) {
                warn!(device = %self.device, error = %e, "pn532_reset");
                self.reset();
            }
        }
        result
    }

    async fn enter_low_power(&mut self) -> Result<(), CardReaderError> {
        self.low_power = true;
        if self.port.is_some() && self.configured {
            self.set_rf_field(false).await?;
        }
        debug!("pn532_low_power");
        Ok(())
    }

    async fn exit_low_power(&mut self) -> Result<(), CardReaderError> {
        self.low_power = false;
        debug!("pn532_active");
        Ok(())
    }
}
