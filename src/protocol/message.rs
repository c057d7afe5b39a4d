//! Typed payloads carried by Z21 frames
//!
//! Decoders for station, locomotive, RailCom and turnout reports, and the
//! bit layouts used by locomotive commands.

use bytes::Buf;
use serde::{Deserialize, Serialize};
use std::fmt;

use super::headers::{X_BC_STOPPED, X_BC_TRACK_POWER};
use super::xbus::loco_address_from_bytes;
use super::{CodecError, SubMessage};

fn expect_len(what: &str, data: &[u8], len: usize) -> Result<(), CodecError> {
    if data.len() != len {
        return Err(CodecError::InvalidPayload(format!(
            "{} requires {} bytes, got {}",
            what,
            len,
            data.len()
        )));
    }
    Ok(())
}

/// DCC speed step resolution of a decoder
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "u16", into = "u16")]
pub enum ThrottleSteps {
    Steps14,
    Steps28,
    #[default]
    Steps128,
}

/// A decoded speed code
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SpeedStep {
    Stop,
    EmergencyStop,
    /// Running step, 1 up to the mode's maximum
    Running(u8),
}

impl ThrottleSteps {
    /// Number of steps as written by users: 14, 28 or 128
    pub fn count(self) -> u16 {
        match self {
            ThrottleSteps::Steps14 => 14,
            ThrottleSteps::Steps28 => 28,
            ThrottleSteps::Steps128 => 128,
        }
    }

    pub fn from_count(count: u16) -> Option<Self> {
        match count {
            14 => Some(ThrottleSteps::Steps14),
            28 => Some(ThrottleSteps::Steps28),
            128 => Some(ThrottleSteps::Steps128),
            _ => None,
        }
    }

    /// Highest running step; 128-step mode reserves two codes for stop
    pub fn max_step(self) -> u8 {
        match self {
            ThrottleSteps::Steps14 => 14,
            ThrottleSteps::Steps28 => 28,
            ThrottleSteps::Steps128 => 126,
        }
    }

    /// DB0 of `LAN_X_SET_LOCO_DRIVE`
    pub fn drive_db0(self) -> u8 {
        match self {
            ThrottleSteps::Steps14 => 0x10,
            ThrottleSteps::Steps28 => 0x12,
            ThrottleSteps::Steps128 => 0x13,
        }
    }

    /// Stepping bits (`KKK`) of the loco-info DB2 byte
    pub fn from_info_bits(byte: u8) -> Option<Self> {
        match byte & 0x07 {
            0 => Some(ThrottleSteps::Steps14),
            2 => Some(ThrottleSteps::Steps28),
            4 => Some(ThrottleSteps::Steps128),
            _ => None,
        }
    }

    pub fn info_bits(self) -> u8 {
        match self {
            ThrottleSteps::Steps14 => 0,
            ThrottleSteps::Steps28 => 2,
            ThrottleSteps::Steps128 => 4,
        }
    }

    /// 7-bit speed code for a step; codes 0 and 1 are stop and emergency stop
    pub fn encode_step(self, step: SpeedStep) -> u8 {
        match step {
            SpeedStep::Stop => 0x00,
            SpeedStep::EmergencyStop => 0x01,
            SpeedStep::Running(n) => {
                let n = n.clamp(1, self.max_step());
                match self {
                    ThrottleSteps::Steps14 | ThrottleSteps::Steps128 => n + 1,
                    // 28-step codes interleave the half step into bit 4
                    ThrottleSteps::Steps28 => {
                        let v = n + 3;
                        (v >> 1) | ((v & 0x01) << 4)
                    }
                }
            }
        }
    }

    /// Inverse of [`ThrottleSteps::encode_step`]; the direction bit is ignored
    pub fn decode_step(self, code: u8) -> SpeedStep {
        let value = match self {
            ThrottleSteps::Steps14 => code & 0x0F,
            ThrottleSteps::Steps28 => code & 0x0F,
            ThrottleSteps::Steps128 => code & 0x7F,
        };
        match value {
            0 => SpeedStep::Stop,
            1 => SpeedStep::EmergencyStop,
            v => match self {
                ThrottleSteps::Steps28 => {
                    let half = (code >> 4) & 0x01;
                    SpeedStep::Running(((v << 1) | half) - 3)
                }
                _ => SpeedStep::Running(v - 1),
            },
        }
    }

    /// Magnitude in percent for a step
    pub fn percentage(self, step: SpeedStep) -> f32 {
        match step {
            SpeedStep::Running(n) => n as f32 / self.max_step() as f32 * 100.0,
            _ => 0.0,
        }
    }
}

impl TryFrom<u16> for ThrottleSteps {
    type Error = String;

    fn try_from(value: u16) -> Result<Self, Self::Error> {
        ThrottleSteps::from_count(value)
            .ok_or_else(|| format!("throttle steps must be 14, 28 or 128, got {}", value))
    }
}

impl From<ThrottleSteps> for u16 {
    fn from(steps: ThrottleSteps) -> Self {
        steps.count()
    }
}

impl fmt::Display for ThrottleSteps {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} steps", self.count())
    }
}

/// Direction of travel
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Direction {
    #[default]
    Forward,
    Reverse,
}

impl Direction {
    /// Bit 7 of a speed byte is set when driving forward
    pub fn speed_bit(self) -> u8 {
        match self {
            Direction::Forward => 0x80,
            Direction::Reverse => 0x00,
        }
    }

    pub fn from_speed_byte(byte: u8) -> Self {
        if byte & 0x80 != 0 {
            Direction::Forward
        } else {
            Direction::Reverse
        }
    }
}

/// Action to perform on a locomotive function
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FunctionAction {
    Off,
    On,
    /// Flip the locally cached state; not a protocol primitive
    Toggle,
}

/// The four logical function groups of the protocol
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FunctionGroup {
    F0ToF12,
    F13ToF20,
    F21ToF28,
    F29ToF31,
}

/// Wire banks of `LAN_X_SET_LOCO_FUNCTION_GROUP`
///
/// The F0-F12 group spans three banks of at most five bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FunctionBank {
    F0ToF4,
    F5ToF8,
    F9ToF12,
    F13ToF20,
    F21ToF28,
    F29ToF31,
}

impl FunctionBank {
    pub fn for_function(index: u8) -> Option<Self> {
        match index {
            0..=4 => Some(FunctionBank::F0ToF4),
            5..=8 => Some(FunctionBank::F5ToF8),
            9..=12 => Some(FunctionBank::F9ToF12),
            13..=20 => Some(FunctionBank::F13ToF20),
            21..=28 => Some(FunctionBank::F21ToF28),
            29..=31 => Some(FunctionBank::F29ToF31),
            _ => None,
        }
    }

    pub fn db0(self) -> u8 {
        match self {
            FunctionBank::F0ToF4 => 0x20,
            FunctionBank::F5ToF8 => 0x21,
            FunctionBank::F9ToF12 => 0x22,
            FunctionBank::F13ToF20 => 0x23,
            FunctionBank::F21ToF28 => 0x28,
            FunctionBank::F29ToF31 => 0x29,
        }
    }

    pub fn group(self) -> FunctionGroup {
        match self {
            FunctionBank::F0ToF4 | FunctionBank::F5ToF8 | FunctionBank::F9ToF12 => {
                FunctionGroup::F0ToF12
            }
            FunctionBank::F13ToF20 => FunctionGroup::F13ToF20,
            FunctionBank::F21ToF28 => FunctionGroup::F21ToF28,
            FunctionBank::F29ToF31 => FunctionGroup::F29ToF31,
        }
    }

    /// Pack the bank's bits out of a function set
    pub fn pack(self, functions: Functions) -> u8 {
        let bits = functions.bits();
        match self {
            // 000 F0 F4 F3 F2 F1
            FunctionBank::F0ToF4 => (((bits >> 1) & 0x0F) | ((bits & 0x01) << 4)) as u8,
            FunctionBank::F5ToF8 => ((bits >> 5) & 0x0F) as u8,
            FunctionBank::F9ToF12 => ((bits >> 9) & 0x0F) as u8,
            FunctionBank::F13ToF20 => ((bits >> 13) & 0xFF) as u8,
            FunctionBank::F21ToF28 => ((bits >> 21) & 0xFF) as u8,
            FunctionBank::F29ToF31 => ((bits >> 29) & 0x07) as u8,
        }
    }
}

/// Function state F0..F31, bit n is Fn
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Functions(u32);

impl Functions {
    pub const COUNT: u8 = 32;

    pub fn from_bits(bits: u32) -> Self {
        Self(bits)
    }

    pub fn bits(&self) -> u32 {
        self.0
    }

    pub fn get(&self, index: u8) -> bool {
        index < Self::COUNT && self.0 & (1 << index) != 0
    }

    pub fn set(&mut self, index: u8, on: bool) {
        if index >= Self::COUNT {
            return;
        }
        if on {
            self.0 |= 1 << index;
        } else {
            self.0 &= !(1 << index);
        }
    }

    /// Replace the bits selected by `mask` with those of `other`
    pub fn merge(&mut self, other: Functions, mask: u32) {
        self.0 = (self.0 & !mask) | (other.0 & mask);
    }

    /// Indices of the functions that are on
    pub fn active(&self) -> Vec<u8> {
        (0..Self::COUNT).filter(|i| self.get(*i)).collect()
    }
}

/// `LAN_X_LOCO_INFO` report
///
/// The station sends 2 to 9 data bytes; fields beyond the received length
/// stay `None` and `functions_mask` marks which function bits were present.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocoInfo {
    pub address: u16,
    pub busy: Option<bool>,
    pub steps: Option<ThrottleSteps>,
    pub direction: Option<Direction>,
    pub speed: Option<SpeedStep>,
    pub double_traction: Option<bool>,
    pub smart_search: Option<bool>,
    pub functions: Functions,
    pub functions_mask: u32,
}

impl LocoInfo {
    /// Decode from the X-BUS data bytes, DB0 onwards
    pub fn decode(dbs: &[u8]) -> Result<Self, CodecError> {
        if dbs.len() < 2 {
            return Err(CodecError::InvalidPayload(format!(
                "loco info requires at least 2 bytes, got {}",
                dbs.len()
            )));
        }

        let mut info = LocoInfo {
            address: loco_address_from_bytes(dbs[0], dbs[1]),
            busy: None,
            steps: None,
            direction: None,
            speed: None,
            double_traction: None,
            smart_search: None,
            functions: Functions::default(),
            functions_mask: 0,
        };

        if let Some(db2) = dbs.get(2) {
            info.busy = Some(db2 & 0x08 != 0);
            info.steps = ThrottleSteps::from_info_bits(*db2);
        }

        if let Some(db3) = dbs.get(3) {
            info.direction = Some(Direction::from_speed_byte(*db3));
            info.speed = info.steps.map(|steps| steps.decode_step(*db3));
        }

        let mut bits = 0u32;
        if let Some(db4) = dbs.get(4) {
            info.double_traction = Some(db4 & 0x40 != 0);
            info.smart_search = Some(db4 & 0x20 != 0);
            bits |= ((db4 >> 4) & 0x01) as u32;
            bits |= ((db4 & 0x0F) as u32) << 1;
            info.functions_mask |= 0x1F;
        }
        if let Some(db5) = dbs.get(5) {
            bits |= (*db5 as u32) << 5;
            info.functions_mask |= 0xFF << 5;
        }
        if let Some(db6) = dbs.get(6) {
            bits |= (*db6 as u32) << 13;
            info.functions_mask |= 0xFF << 13;
        }
        if let Some(db7) = dbs.get(7) {
            bits |= (*db7 as u32) << 21;
            info.functions_mask |= 0xFF << 21;
        }
        if let Some(db8) = dbs.get(8) {
            bits |= ((db8 & 0x07) as u32) << 29;
            info.functions_mask |= 0x07 << 29;
        }
        info.functions = Functions::from_bits(bits);

        Ok(info)
    }

    /// Signed speed in percent, negative when reversing
    pub fn speed_percentage(&self) -> Option<f32> {
        let steps = self.steps?;
        let magnitude = steps.percentage(self.speed?);
        match self.direction? {
            Direction::Forward => Some(magnitude),
            Direction::Reverse => Some(-magnitude),
        }
    }
}

/// Station state from `LAN_SYSTEMSTATE_DATACHANGED` (16 bytes)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SystemState {
    /// Main track current in mA
    pub main_current: i16,
    /// Programming track current in mA
    pub prog_current: i16,
    /// Smoothed main track current in mA
    pub filtered_main_current: i16,
    /// Internal temperature in °C
    pub temperature: i16,
    /// Supply voltage in mV
    pub supply_voltage: u16,
    /// Track voltage in mV
    pub vcc_voltage: u16,
    pub central_state: u8,
    pub central_state_ex: u8,
    pub reserved: u8,
    pub capabilities: u8,
}

impl SystemState {
    pub const SIZE: usize = 16;

    pub fn decode(data: &[u8]) -> Result<Self, CodecError> {
        expect_len("system state", data, Self::SIZE)?;
        let mut buf = data;
        Ok(Self {
            main_current: buf.get_i16_le(),
            prog_current: buf.get_i16_le(),
            filtered_main_current: buf.get_i16_le(),
            temperature: buf.get_i16_le(),
            supply_voltage: buf.get_u16_le(),
            vcc_voltage: buf.get_u16_le(),
            central_state: buf.get_u8(),
            central_state_ex: buf.get_u8(),
            reserved: buf.get_u8(),
            capabilities: buf.get_u8(),
        })
    }

    pub fn is_emergency_stop(&self) -> bool {
        self.central_state & 0x01 != 0
    }

    pub fn is_track_voltage_off(&self) -> bool {
        self.central_state & 0x02 != 0
    }

    pub fn is_short_circuit(&self) -> bool {
        self.central_state & 0x04 != 0
    }

    pub fn is_programming_mode(&self) -> bool {
        self.central_state & 0x20 != 0
    }
}

/// RailCom feedback from `LAN_RAILCOM_DATACHANGED` (13 bytes)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RailComData {
    pub address: u16,
    /// Valid RailCom messages received
    pub receive_counter: u32,
    /// RailCom reception errors
    pub error_counter: u16,
    pub options: u8,
    pub speed: u8,
    /// Quality of service, higher is better
    pub qos: u8,
}

impl RailComData {
    pub const SIZE: usize = 13;

    pub const OPTION_SPEED1: u8 = 0x01;
    pub const OPTION_SPEED2: u8 = 0x02;
    pub const OPTION_QOS: u8 = 0x04;

    pub fn decode(data: &[u8]) -> Result<Self, CodecError> {
        expect_len("RailCom data", data, Self::SIZE)?;
        let mut buf = data;
        let address = buf.get_u16_le();
        let receive_counter = buf.get_u32_le();
        let error_counter = buf.get_u16_le();
        buf.advance(1);
        let options = buf.get_u8();
        let speed = buf.get_u8();
        let qos = buf.get_u8();
        Ok(Self {
            address,
            receive_counter,
            error_counter,
            options,
            speed,
            qos,
        })
    }

    pub fn has_speed1(&self) -> bool {
        self.options & Self::OPTION_SPEED1 != 0
    }

    pub fn has_speed2(&self) -> bool {
        self.options & Self::OPTION_SPEED2 != 0
    }

    pub fn has_qos(&self) -> bool {
        self.options & Self::OPTION_QOS != 0
    }

    /// Error rate in percent, 0 when nothing has been received
    pub fn error_rate(&self) -> f32 {
        let total = self.receive_counter as f64 + self.error_counter as f64;
        if total == 0.0 {
            return 0.0;
        }
        (self.error_counter as f64 / total * 100.0) as f32
    }
}

/// Turnout position (`ZZ` bits of `LAN_X_TURNOUT_INFO`)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TurnoutPosition {
    /// Not switched yet
    Unknown,
    /// Output 1
    P0,
    /// Output 2
    P1,
    Invalid,
}

impl TurnoutPosition {
    pub fn from_bits(bits: u8) -> Self {
        match bits & 0x03 {
            0 => TurnoutPosition::Unknown,
            1 => TurnoutPosition::P0,
            2 => TurnoutPosition::P1,
            _ => TurnoutPosition::Invalid,
        }
    }

    /// Output number driven to reach this position
    pub fn output(self) -> Option<u8> {
        match self {
            TurnoutPosition::P0 => Some(0),
            TurnoutPosition::P1 => Some(1),
            _ => None,
        }
    }
}

/// `LAN_X_TURNOUT_INFO` report
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TurnoutInfo {
    pub address: u16,
    pub position: TurnoutPosition,
}

impl TurnoutInfo {
    /// Decode from the X-BUS data bytes: address MSB, LSB, status
    pub fn decode(dbs: &[u8]) -> Result<Self, CodecError> {
        expect_len("turnout info", dbs, 3)?;
        Ok(Self {
            address: ((dbs[0] as u16) << 8) | dbs[1] as u16,
            position: TurnoutPosition::from_bits(dbs[2]),
        })
    }
}

/// Track power broadcasts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TrackPower {
    Off,
    On,
    ProgrammingMode,
    ShortCircuit,
    EmergencyStop,
}

impl TrackPower {
    /// `None` for messages that are not track power broadcasts
    pub fn from_message(msg: &SubMessage) -> Option<Self> {
        match (msg.command, msg.sub_command) {
            (X_BC_TRACK_POWER, 0x00) => Some(TrackPower::Off),
            (X_BC_TRACK_POWER, 0x01) => Some(TrackPower::On),
            (X_BC_TRACK_POWER, 0x02) => Some(TrackPower::ProgrammingMode),
            (X_BC_TRACK_POWER, 0x08) => Some(TrackPower::ShortCircuit),
            (X_BC_STOPPED, 0x00) => Some(TrackPower::EmergencyStop),
            _ => None,
        }
    }
}

fn from_bcd(byte: u8) -> u8 {
    (byte >> 4) * 10 + (byte & 0x0F)
}

/// Station firmware version
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FirmwareVersion {
    pub major: u8,
    pub minor: u8,
}

impl FirmwareVersion {
    /// Decode from the data bytes after DB0 (BCD major, BCD minor)
    pub fn decode(data: &[u8]) -> Result<Self, CodecError> {
        if data.len() < 2 {
            return Err(CodecError::InvalidPayload(
                "firmware version requires 2 bytes".to_string(),
            ));
        }
        Ok(Self {
            major: from_bcd(data[0]),
            minor: from_bcd(data[1]),
        })
    }
}

impl fmt::Display for FirmwareVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{:02}", self.major, self.minor)
    }
}

/// X-BUS protocol version and command station id
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct XBusVersion {
    /// BCD encoded, 0x36 is version 3.6
    pub version: u8,
    pub station_id: u8,
}

impl XBusVersion {
    pub fn decode(data: &[u8]) -> Result<Self, CodecError> {
        if data.len() < 2 {
            return Err(CodecError::InvalidPayload(
                "X-BUS version requires 2 bytes".to_string(),
            ));
        }
        Ok(Self {
            version: data[0],
            station_id: data[1],
        })
    }
}

impl fmt::Display for XBusVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "X-BUS {}.{} (station id {:#04x})",
            self.version >> 4,
            self.version & 0x0F,
            self.station_id
        )
    }
}
