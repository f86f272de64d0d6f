//! Session state machine: Idle → Connecting → AwaitingDeviceInfo →
//! AwaitingPair → Paired → Operational → Idle.

use crate::crypto::{self, SecurityFlag};
use crate::error::Error;

/// Current phase of the connection lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Connecting,
    AwaitingDeviceInfo,
    AwaitingPair,
    Paired,
    Operational,
}

/// Fields extracted from a `DEVICE_INFO` reply: bytes 0-1 firmware
/// version, 2-3 protocol version, 4 flags, 5 bound flag, 6-11 `srand`,
/// 12-13 hardware version, 14-45 `auth_key`.
#[derive(Debug, Clone)]
pub struct DeviceInfo {
    pub firmware_version: u16,
    pub protocol_version: u16,
    pub flags: u8,
    pub bound: bool,
    pub srand: [u8; 6],
    pub hardware_version: u16,
    pub auth_key: [u8; 32],
}

const DEVICE_INFO_MIN_LEN: usize = 46;

impl DeviceInfo {
    pub fn parse(body: &[u8]) -> Result<Self, Error> {
        if body.len() < DEVICE_INFO_MIN_LEN {
            return Err(Error::Length("device-info reply shorter than 46 bytes"));
        }
        let mut srand = [0u8; 6];
        srand.copy_from_slice(&body[6..12]);
        let mut auth_key = [0u8; 32];
        auth_key.copy_from_slice(&body[14..46]);

        Ok(DeviceInfo {
            firmware_version: u16::from_be_bytes([body[0], body[1]]),
            protocol_version: u16::from_be_bytes([body[2], body[3]]),
            flags: body[4],
            bound: body[5] != 0,
            srand,
            hardware_version: u16::from_be_bytes([body[12], body[13]]),
            auth_key,
        })
    }
}

/// Pair-reply result byte: 0 = success, 2 = already paired (also success).
pub fn pair_reply_is_success(result_byte: u8) -> bool {
    result_byte == 0 || result_byte == 2
}

/// Build a pair-request body: `uuid ‖ local_key_prefix ‖ device_id`,
/// zero-padded to 44 bytes.
pub fn build_pair_request(uuid: &str, local_key_prefix: &[u8; 6], device_id: &str) -> Vec<u8> {
    let mut body = Vec::with_capacity(44);
    body.extend_from_slice(uuid.as_bytes());
    body.extend_from_slice(local_key_prefix);
    body.extend_from_slice(device_id.as_bytes());
    body.resize(44, 0);
    body.truncate(44);
    body
}

/// Owns the per-connection key material and current phase. Reset to
/// `Idle` drops the session key and sets `srand`/`auth_key` back to empty.
pub struct Session {
    pub state: SessionState,
    login_key: [u8; 16],
    session_key: Option<[u8; 16]>,
    local_key_prefix: [u8; 6],
    pub device_info: Option<DeviceInfo>,
}

impl Session {
    pub fn new(local_key: &str) -> Self {
        let local_key_prefix = crypto::local_key_prefix(local_key);
        Session {
            state: SessionState::Idle,
            login_key: crypto::login_key(&local_key_prefix),
            session_key: None,
            local_key_prefix,
            device_info: None,
        }
    }

    pub fn begin_connecting(&mut self) {
        self.state = SessionState::Connecting;
    }

    pub fn begin_awaiting_device_info(&mut self) {
        self.state = SessionState::AwaitingDeviceInfo;
    }

    /// Process a device-info reply: stores parsed fields and derives
    /// `session_key`, transitioning to `AwaitingPair`.
    pub fn on_device_info_reply(&mut self, body: &[u8]) -> Result<(), Error> {
        let info = DeviceInfo::parse(body)?;
        self.session_key = Some(crypto::session_key(&self.local_key_prefix, &info.srand));
        self.device_info = Some(info);
        self.state = SessionState::AwaitingPair;
        Ok(())
    }

    /// Process a pair reply, transitioning to `Paired`/`Operational` on
    /// success.
    pub fn on_pair_reply(&mut self, result_byte: u8) -> Result<(), Error> {
        if !pair_reply_is_success(result_byte) {
            return Err(Error::Device(result_byte));
        }
        self.state = SessionState::Paired;
        self.state = SessionState::Operational;
        Ok(())
    }

    pub fn is_paired(&self) -> bool {
        matches!(self.state, SessionState::Paired | SessionState::Operational)
    }

    /// Resolve which key backs a given security flag.
    pub fn key_for_flag(&self, flag: SecurityFlag) -> Option<[u8; 16]> {
        match flag {
            SecurityFlag::Login => Some(self.login_key),
            SecurityFlag::Session => self.session_key,
            SecurityFlag::Auth => None,
        }
    }

    pub fn login_key(&self) -> [u8; 16] {
        self.login_key
    }

    pub fn session_key(&self) -> Option<[u8; 16]> {
        self.session_key
    }

    pub fn local_key_prefix(&self) -> [u8; 6] {
        self.local_key_prefix
    }

    /// Reset to `Idle`: drops the session key and parsed device-info.
    pub fn reset(&mut self) {
        self.state = SessionState::Idle;
        self.session_key = None;
        self.device_info = None;
    }
}
