//! Function codes for Tuya BLE protocol communication.
//!
//! OTA and protocol-v4 codes are named but inert — their state machines
//! aren't implemented by this core.

pub type Opcode = u16;

// Sender functions (commands we send to the device).
pub const DEVICE_INFO: Opcode = 0x0000;
pub const PAIR: Opcode = 0x0001;
pub const SENDER_DPS: Opcode = 0x0002;
pub const DEVICE_STATUS: Opcode = 0x0003;
pub const UNBIND: Opcode = 0x0005;
pub const DEVICE_RESET: Opcode = 0x0006;

// OTA — reserved, not implemented.
pub const OTA_START: Opcode = 0x000C;
pub const OTA_FILE: Opcode = 0x000D;
pub const OTA_OFFSET: Opcode = 0x000E;
pub const OTA_UPGRADE: Opcode = 0x000F;
pub const OTA_OVER: Opcode = 0x0010;

// Protocol v4 — reserved, not implemented.
pub const SENDER_DPS_V4: Opcode = 0x0027;

// Receiver functions (commands the device sends to us).
pub const RECEIVE_DP: Opcode = 0x8001;
pub const RECEIVE_TIME_DP: Opcode = 0x8003;
pub const RECEIVE_SIGN_DP: Opcode = 0x8004;
pub const RECEIVE_SIGN_TIME_DP: Opcode = 0x8005;

// Protocol v4 receivers — reserved, not implemented.
pub const RECEIVE_DP_V4: Opcode = 0x8006;
pub const RECEIVE_TIME_DP_V4: Opcode = 0x8007;

pub const RECEIVE_TIME1_REQ: Opcode = 0x8011;
pub const RECEIVE_TIME2_REQ: Opcode = 0x8012;

/// Opcodes at or above this value originate from the device and never
/// resolve a pending response future.
pub const DEVICE_ORIGINATED_THRESHOLD: Opcode = 0x8000;

pub fn is_device_originated(opcode: Opcode) -> bool {
    opcode >= DEVICE_ORIGINATED_THRESHOLD
}

/// Name an opcode for logging, including reserved-but-unimplemented ones.
pub fn name(opcode: Opcode) -> &'static str {
    match opcode {
        DEVICE_INFO => "DEVICE_INFO",
        PAIR => "PAIR",
        SENDER_DPS => "SENDER_DPS",
        DEVICE_STATUS => "DEVICE_STATUS",
        UNBIND => "UNBIND",
        DEVICE_RESET => "DEVICE_RESET",
        OTA_START => "OTA_START",
        OTA_FILE => "OTA_FILE",
        OTA_OFFSET => "OTA_OFFSET",
        OTA_UPGRADE => "OTA_UPGRADE",
        OTA_OVER => "OTA_OVER",
        SENDER_DPS_V4 => "SENDER_DPS_V4",
        RECEIVE_DP => "RECEIVE_DP",
        RECEIVE_TIME_DP => "RECEIVE_TIME_DP",
        RECEIVE_SIGN_DP => "RECEIVE_SIGN_DP",
        RECEIVE_SIGN_TIME_DP => "RECEIVE_SIGN_TIME_DP",
        RECEIVE_DP_V4 => "RECEIVE_DP_V4",
        RECEIVE_TIME_DP_V4 => "RECEIVE_TIME_DP_V4",
        RECEIVE_TIME1_REQ => "RECEIVE_TIME1_REQ",
        RECEIVE_TIME2_REQ => "RECEIVE_TIME2_REQ",
        _ => "UNKNOWN",
    }
}
