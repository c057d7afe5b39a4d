//! Command header constants and symbolic lookup
//!
//! The tables are immutable statics; lookups never allocate or lock.

/// LAN headers (outer frame command ids)
pub const LAN_GET_SERIAL_NUMBER: u16 = 0x10;
pub const LAN_GET_HWINFO: u16 = 0x1A;
pub const LAN_LOGOFF: u16 = 0x30;
pub const LAN_X_BUS: u16 = 0x40;
pub const LAN_SET_BROADCASTFLAGS: u16 = 0x50;
pub const LAN_GET_BROADCASTFLAGS: u16 = 0x51;
pub const LAN_SYSTEMSTATE_DATACHANGED: u16 = 0x84;
pub const LAN_SYSTEMSTATE_GETDATA: u16 = 0x85;
pub const LAN_RAILCOM_DATACHANGED: u16 = 0x88;
pub const LAN_RAILCOM_GETDATA: u16 = 0x89;

/// X-BUS headers (first byte of a tunneled sub-message)
pub const X_GET_VERSION: u8 = 0x21;
pub const X_SET_TRACK_POWER: u8 = 0x21;
pub const X_TURNOUT_INFO: u8 = 0x43;
pub const X_SET_TURNOUT: u8 = 0x53;
pub const X_BC_TRACK_POWER: u8 = 0x61;
pub const X_STATUS_CHANGED: u8 = 0x62;
pub const X_GET_VERSION_REPLY: u8 = 0x63;
pub const X_BC_STOPPED: u8 = 0x81;
pub const X_GET_LOCO_INFO: u8 = 0xE3;
pub const X_SET_LOCO: u8 = 0xE4;
pub const X_LOCO_INFO: u8 = 0xEF;
pub const X_GET_FIRMWARE_VERSION: u8 = 0xF1;
pub const X_GET_FIRMWARE_VERSION_REPLY: u8 = 0xF3;

/// DB0 values that select the variant of a shared X-header
pub const DB0_GET_VERSION: u8 = 0x21;
pub const DB0_TRACK_POWER_OFF: u8 = 0x80;
pub const DB0_TRACK_POWER_ON: u8 = 0x81;
pub const DB0_FIRMWARE_VERSION: u8 = 0x0A;
pub const DB0_LOCO_INFO: u8 = 0xF0;

/// Broadcast flags for `LAN_SET_BROADCASTFLAGS`
pub const BROADCAST_LOCO_INFO: u32 = 0x0000_0001;
pub const BROADCAST_RAILCOM_SUBSCRIBED: u32 = 0x0000_0004;
pub const BROADCAST_SYSTEMSTATE: u32 = 0x0000_0100;
pub const BROADCAST_RAILCOM_ALL: u32 = 0x0004_0000;

static LAN_HEADERS: &[(u16, &str)] = &[
    (LAN_GET_SERIAL_NUMBER, "LAN_GET_SERIAL_NUMBER"),
    (LAN_GET_HWINFO, "LAN_GET_HWINFO"),
    (LAN_LOGOFF, "LAN_LOGOFF"),
    (LAN_X_BUS, "LAN_X_BUS"),
    (LAN_SET_BROADCASTFLAGS, "LAN_SET_BROADCASTFLAGS"),
    (LAN_GET_BROADCASTFLAGS, "LAN_GET_BROADCASTFLAGS"),
    (LAN_SYSTEMSTATE_DATACHANGED, "LAN_SYSTEMSTATE_DATACHANGED"),
    (LAN_SYSTEMSTATE_GETDATA, "LAN_SYSTEMSTATE_GETDATA"),
    (LAN_RAILCOM_DATACHANGED, "LAN_RAILCOM_DATACHANGED"),
    (LAN_RAILCOM_GETDATA, "LAN_RAILCOM_GETDATA"),
];

// X_GET_VERSION and X_SET_TRACK_POWER share 0x21; the first entry wins.
static X_HEADERS: &[(u8, &str)] = &[
    (X_GET_VERSION, "LAN_X_GET_VERSION"),
    (X_TURNOUT_INFO, "LAN_X_TURNOUT_INFO"),
    (X_SET_TURNOUT, "LAN_X_SET_TURNOUT"),
    (X_BC_TRACK_POWER, "LAN_X_BC_TRACK_POWER"),
    (X_STATUS_CHANGED, "LAN_X_STATUS_CHANGED"),
    (X_GET_VERSION_REPLY, "LAN_X_GET_VERSION_REPLY"),
    (X_BC_STOPPED, "LAN_X_BC_STOPPED"),
    (X_GET_LOCO_INFO, "LAN_X_GET_LOCO_INFO"),
    (X_SET_LOCO, "LAN_X_SET_LOCO"),
    (X_LOCO_INFO, "LAN_X_LOCO_INFO"),
    (X_GET_FIRMWARE_VERSION, "LAN_X_GET_FIRMWARE_VERSION"),
    (X_GET_FIRMWARE_VERSION_REPLY, "LAN_X_GET_FIRMWARE_VERSION_REPLY"),
];

/// Symbolic name of a LAN header, `None` if the header is unknown
pub fn lan_name(header: u16) -> Option<&'static str> {
    LAN_HEADERS
        .iter()
        .find(|(id, _)| *id == header)
        .map(|(_, name)| *name)
}

/// Reverse lookup of a LAN header by its symbolic name
pub fn lan_header(name: &str) -> Option<u16> {
    LAN_HEADERS
        .iter()
        .find(|(_, n)| *n == name)
        .map(|(id, _)| *id)
}

/// Symbolic name of an X-BUS header, `None` if the header is unknown
pub fn x_name(header: u8) -> Option<&'static str> {
    X_HEADERS
        .iter()
        .find(|(id, _)| *id == header)
        .map(|(_, name)| *name)
}

/// Reverse lookup of an X-BUS header by its symbolic name
pub fn x_header(name: &str) -> Option<u8> {
    X_HEADERS
        .iter()
        .find(|(_, n)| *n == name)
        .map(|(id, _)| *id)
}

/// Whether inbound frames with this header are handled at all
pub fn is_known(header: u16) -> bool {
    lan_name(header).is_some()
}
