//! Key schedule: `login_key` and `session_key` derivation.
//!
//! Both keys are plain MD5 over ASCII byte prefixes — no KDF, no salt
//! beyond the device-supplied `srand`.

/// Security flag values selecting which key decrypts/encrypts a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SecurityFlag {
    /// `auth_key`, reserved — not used by this core.
    Auth = 0x01,
    /// `login_key`, used only for the first `DEVICE_INFO` exchange.
    Login = 0x04,
    /// `session_key`, used for all subsequent traffic.
    Session = 0x05,
}

impl SecurityFlag {
    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            0x01 => Some(SecurityFlag::Auth),
            0x04 => Some(SecurityFlag::Login),
            0x05 => Some(SecurityFlag::Session),
            _ => None,
        }
    }

    pub fn as_byte(self) -> u8 {
        self as u8
    }
}

/// First six ASCII bytes of the device's `local_key`, used as the seed for
/// both `login_key` and `session_key`.
pub fn local_key_prefix(local_key: &str) -> [u8; 6] {
    let bytes = local_key.as_bytes();
    let mut prefix = [0u8; 6];
    let n = bytes.len().min(6);
    prefix[..n].copy_from_slice(&bytes[..n]);
    prefix
}

/// `login_key = MD5(local_key_prefix)`.
pub fn login_key(local_key_prefix: &[u8; 6]) -> [u8; 16] {
    md5::compute(local_key_prefix).0
}

/// `session_key = MD5(local_key_prefix ‖ srand)`, where `srand` is the
/// 6-byte random nonce the device supplies in its device-info reply.
pub fn session_key(local_key_prefix: &[u8; 6], srand: &[u8; 6]) -> [u8; 16] {
    let mut seed = [0u8; 12];
    seed[..6].copy_from_slice(local_key_prefix);
    seed[6..].copy_from_slice(srand);
    md5::compute(seed).0
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Scenario A: `local_key = "abcdef…"`, first six bytes `0x61 62 63 64
    /// 65 66`, `login_key = MD5(0x616263646566) =
    /// e80b5017098950fc58aad83c8c14978e`.
    #[test]
    fn scenario_a_login_key_derivation() {
        let prefix = local_key_prefix("abcdefGHIJ");
        assert_eq!(prefix, *b"abcdef");
        let key = login_key(&prefix);
        assert_eq!(
            key,
            [
                0xe8, 0x0b, 0x50, 0x17, 0x09, 0x89, 0x50, 0xfc, 0x58, 0xaa, 0xd8, 0x3c, 0x8c,
                0x14, 0x97, 0x8e,
            ]
        );
    }

    #[test]
    fn session_key_depends_on_srand() {
        let prefix = local_key_prefix("abcdefGHIJ");
        let srand_a = [0u8; 6];
        let srand_b = [1u8; 6];
        assert_ne!(session_key(&prefix, &srand_a), session_key(&prefix, &srand_b));
    }
}
