//! X-BUS sub-messages tunneled inside `LAN_X_BUS` frames
//!
//! Format: `[x_header][db0][data...][xor]` where `xor` is the running
//! exclusive-or of every preceding byte.

use bytes::{BufMut, Bytes, BytesMut};
use std::fmt;

use super::headers::*;
use super::{CodecError, FunctionBank, ThrottleSteps};

/// Bytes preceding the checksum: X-header and DB0
const MIN_BODY_SIZE: usize = 2;

/// XOR of all bytes
pub fn xor_checksum(bytes: &[u8]) -> u8 {
    bytes.iter().fold(0u8, |acc, b| acc ^ b)
}

/// Address bytes for loco commands; long addresses carry `0xC0` in the MSB
pub fn loco_address_bytes(address: u16) -> [u8; 2] {
    let mut msb = (address >> 8) as u8;
    if address >= 128 {
        msb |= 0xC0;
    }
    [msb, (address & 0xFF) as u8]
}

/// Inverse of [`loco_address_bytes`]
pub fn loco_address_from_bytes(msb: u8, lsb: u8) -> u16 {
    (((msb & 0x3F) as u16) << 8) | lsb as u16
}

/// A tunneled X-BUS command or reply
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubMessage {
    /// X-header
    pub command: u8,
    /// DB0
    pub sub_command: u8,
    /// DB1 onwards
    pub data: Vec<u8>,
}

impl SubMessage {
    pub fn new(command: u8, sub_command: u8, data: impl Into<Vec<u8>>) -> Self {
        Self {
            command,
            sub_command,
            data: data.into(),
        }
    }

    /// XOR over the command, sub-command and data bytes
    pub fn checksum(&self) -> u8 {
        self.data
            .iter()
            .fold(self.command ^ self.sub_command, |acc, b| acc ^ b)
    }

    /// All data bytes after the X-header (DB0, DB1, ...)
    pub fn data_bytes(&self) -> Vec<u8> {
        let mut dbs = Vec::with_capacity(self.data.len() + 1);
        dbs.push(self.sub_command);
        dbs.extend_from_slice(&self.data);
        dbs
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.data.len() + 3);
        buf.put_u8(self.command);
        buf.put_u8(self.sub_command);
        buf.put_slice(&self.data);
        buf.put_u8(self.checksum());
        buf.freeze()
    }

    pub fn decode(buf: &[u8]) -> Result<Self, CodecError> {
        if buf.len() < MIN_BODY_SIZE + 1 {
            return Err(CodecError::MalformedSubMessage(format!(
                "need at least {} bytes before the checksum, got {}",
                MIN_BODY_SIZE,
                buf.len().saturating_sub(1)
            )));
        }

        let (body, trailer) = buf.split_at(buf.len() - 1);
        let calculated = xor_checksum(body);
        if calculated != trailer[0] {
            return Err(CodecError::ChecksumMismatch {
                calculated,
                received: trailer[0],
            });
        }

        Ok(Self::new(body[0], body[1], &body[2..]))
    }

    pub fn get_version() -> Self {
        Self::new(X_GET_VERSION, DB0_GET_VERSION, Vec::new())
    }

    pub fn get_firmware_version() -> Self {
        Self::new(X_GET_FIRMWARE_VERSION, DB0_FIRMWARE_VERSION, Vec::new())
    }

    pub fn track_power_on() -> Self {
        Self::new(X_SET_TRACK_POWER, DB0_TRACK_POWER_ON, Vec::new())
    }

    /// Track power off; every locomotive stops
    pub fn track_power_off() -> Self {
        Self::new(X_SET_TRACK_POWER, DB0_TRACK_POWER_OFF, Vec::new())
    }

    pub fn loco_get_info(address: u16) -> Self {
        Self::new(X_GET_LOCO_INFO, DB0_LOCO_INFO, loco_address_bytes(address))
    }

    /// Drive command; `speed_byte` is `RVVVVVVV` with R=1 for forward
    pub fn loco_drive(address: u16, steps: ThrottleSteps, speed_byte: u8) -> Self {
        let [msb, lsb] = loco_address_bytes(address);
        Self::new(X_SET_LOCO, steps.drive_db0(), [msb, lsb, speed_byte])
    }

    /// Absolute state of one function bank
    pub fn loco_function_bank(address: u16, bank: FunctionBank, bits: u8) -> Self {
        let [msb, lsb] = loco_address_bytes(address);
        Self::new(X_SET_LOCO, bank.db0(), [msb, lsb, bits])
    }

    pub fn turnout_get_info(address: u16) -> Self {
        Self::new(X_TURNOUT_INFO, (address >> 8) as u8, [(address & 0xFF) as u8])
    }

    /// Turnout output command: `10Q0A00P`
    pub fn set_turnout(address: u16, output: u8, activate: bool, queue: bool) -> Self {
        let mut byte = 0x80 | (output & 0x01);
        if queue {
            byte |= 0x20;
        }
        if activate {
            byte |= 0x08;
        }
        Self::new(
            X_SET_TURNOUT,
            (address >> 8) as u8,
            [(address & 0xFF) as u8, byte],
        )
    }
}

impl fmt::Display for SubMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "SubMessage(x_header={:#04x} [{}], db0={:#04x}, xor={:#04x})",
            self.command,
            x_name(self.command).unwrap_or("UNKNOWN"),
            self.sub_command,
            self.checksum()
        )
    }
}
