//! Single-message encrypt/decrypt.
//!
//! Frame layout once encrypted: `security_flag(1) ‖ iv(16) ‖
//! AES-128-CBC(header(12) ‖ body ‖ crc16(2) ‖ zero_pad)`.

use aes::Aes128;
use aes::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit, block_padding::NoPadding};
use rand::RngCore;

use crate::crypto::SecurityFlag;
use crate::error::Error;
use crate::opcode::{self, Opcode};

type Aes128CbcEnc = cbc::Encryptor<Aes128>;
type Aes128CbcDec = cbc::Decryptor<Aes128>;

const HEADER_SIZE: usize = 12;
const CRC_SIZE: usize = 2;
const IV_SIZE: usize = 16;
const BLOCK_SIZE: usize = 16;

/// A decoded inbound message, header fields plus the decrypted body.
#[derive(Debug, Clone)]
pub struct DecodedMessage {
    pub seq_num: u32,
    pub response_to: u32,
    pub opcode: Opcode,
    pub body: Vec<u8>,
}

/// Choose `login_key` exactly for the `DEVICE_INFO` opcode; `session_key`
/// for everything else.
pub fn security_flag_for_opcode(opcode: Opcode) -> SecurityFlag {
    if opcode == opcode::DEVICE_INFO {
        SecurityFlag::Login
    } else {
        SecurityFlag::Session
    }
}

fn crc16_modbus(data: &[u8]) -> u16 {
    crc16::State::<crc16::MODBUS>::calculate(data)
}

/// Encode one logical message into an encrypted, CRC-protected,
/// zero-padded frame ready for fragmentation.
pub fn encode(
    seq_num: u32,
    response_to: u32,
    opcode: Opcode,
    body: &[u8],
    flag: SecurityFlag,
    key: &[u8; 16],
) -> Vec<u8> {
    let mut raw = Vec::with_capacity(HEADER_SIZE + body.len() + CRC_SIZE + BLOCK_SIZE);
    raw.extend_from_slice(&seq_num.to_be_bytes());
    raw.extend_from_slice(&response_to.to_be_bytes());
    raw.extend_from_slice(&opcode.to_be_bytes());
    raw.extend_from_slice(&(body.len() as u16).to_be_bytes());
    raw.extend_from_slice(body);

    let crc = crc16_modbus(&raw);
    raw.extend_from_slice(&crc.to_be_bytes());

    while raw.len() % BLOCK_SIZE != 0 {
        raw.push(0);
    }

    let mut iv = [0u8; IV_SIZE];
    rand::thread_rng().fill_bytes(&mut iv);

    let msg_len = raw.len();
    let ciphertext = Aes128CbcEnc::new(key.into(), &iv.into())
        .encrypt_padded_mut::<NoPadding>(&mut raw, msg_len)
        .expect("plaintext is already block-aligned by zero-padding")
        .to_vec();

    let mut out = Vec::with_capacity(1 + IV_SIZE + ciphertext.len());
    out.push(flag.as_byte());
    out.extend_from_slice(&iv);
    out.extend_from_slice(&ciphertext);
    out
}

/// Decode a reassembled encrypted buffer into header fields and body.
///
/// `key_for_flag` resolves the security flag read from the wire to the
/// matching key (`login_key`, `session_key`, or `auth_key`); it returns
/// `None` when that key isn't available yet (e.g. `session_key` before
/// device-info completes), which is treated as a transport-level error by
/// the caller rather than a protocol error.
pub fn decode(
    buf: &[u8],
    key_for_flag: impl FnOnce(SecurityFlag) -> Option<[u8; 16]>,
) -> Result<DecodedMessage, Error> {
    if buf.len() < 1 + IV_SIZE {
        return Err(Error::Length("buffer shorter than security flag + iv"));
    }

    let flag = SecurityFlag::from_byte(buf[0])
        .ok_or(Error::Length("unrecognized security flag byte"))?;
    let key = key_for_flag(flag).ok_or(Error::Length("no key available for security flag"))?;

    let iv: [u8; IV_SIZE] = buf[1..1 + IV_SIZE].try_into().unwrap();
    let mut ciphertext = buf[1 + IV_SIZE..].to_vec();

    if ciphertext.is_empty() || ciphertext.len() % BLOCK_SIZE != 0 {
        return Err(Error::Length("ciphertext not a multiple of the block size"));
    }

    let plaintext = Aes128CbcDec::new(key.as_ref().into(), &iv.into())
        .decrypt_padded_mut::<NoPadding>(&mut ciphertext)
        .map_err(|_| Error::Length("AES-CBC decryption failed"))?;

    if plaintext.len() < HEADER_SIZE {
        return Err(Error::Length("decrypted buffer shorter than header"));
    }

    let seq_num = u32::from_be_bytes(plaintext[0..4].try_into().unwrap());
    let response_to = u32::from_be_bytes(plaintext[4..8].try_into().unwrap());
    let opcode = u16::from_be_bytes(plaintext[8..10].try_into().unwrap());
    let length = u16::from_be_bytes(plaintext[10..12].try_into().unwrap()) as usize;

    let data_end = HEADER_SIZE + length;
    let raw_length = plaintext.len();
    if raw_length < data_end {
        return Err(Error::Length("declared body length exceeds decrypted buffer"));
    }

    if raw_length > data_end && raw_length >= data_end + CRC_SIZE {
        let calc_crc = crc16_modbus(&plaintext[..data_end]);
        let wire_crc = u16::from_be_bytes(plaintext[data_end..data_end + CRC_SIZE].try_into().unwrap());
        if calc_crc != wire_crc {
            return Err(Error::Crc {
                expected: calc_crc,
                actual: wire_crc,
            });
        }
    }

    let body = plaintext[HEADER_SIZE..data_end].to_vec();

    Ok(DecodedMessage {
        seq_num,
        response_to,
        opcode,
        body,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const TEST_KEY: [u8; 16] = *b"0123456789abcdef";

    /// Scenario B: header `seq=1 response_to=0 opcode=0x0000 length=0` ->
    /// bytes `00 00 00 01 00 00 00 00 00 00 00 00`; CRC-16/MODBUS = 0x3118.
    #[test]
    fn scenario_b_crc_vector() {
        let header = [0x00u8, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00];
        assert_eq!(crc16_modbus(&header), 0x3118);
    }

    #[test]
    fn encode_decode_roundtrip() {
        let body = b"hello tuya ble";
        let encoded = encode(7, 0, opcode::DEVICE_STATUS, body, SecurityFlag::Session, &TEST_KEY);
        let decoded = decode(&encoded, |flag| {
            assert_eq!(flag, SecurityFlag::Session);
            Some(TEST_KEY)
        })
        .unwrap();

        assert_eq!(decoded.seq_num, 7);
        assert_eq!(decoded.response_to, 0);
        assert_eq!(decoded.opcode, opcode::DEVICE_STATUS);
        assert_eq!(decoded.body, body);
    }

    #[test]
    fn encrypted_payload_is_block_aligned() {
        let encoded = encode(1, 0, opcode::DEVICE_INFO, &[], SecurityFlag::Login, &TEST_KEY);
        let ciphertext_len = encoded.len() - 1 - IV_SIZE;
        assert_eq!(ciphertext_len % BLOCK_SIZE, 0);
    }

    #[test]
    fn device_info_uses_login_key_selector() {
        assert_eq!(security_flag_for_opcode(opcode::DEVICE_INFO), SecurityFlag::Login);
        assert_eq!(security_flag_for_opcode(opcode::DEVICE_STATUS), SecurityFlag::Session);
        assert_eq!(security_flag_for_opcode(opcode::RECEIVE_DP), SecurityFlag::Session);
    }

    #[test]
    fn empty_body_roundtrip() {
        let encoded = encode(2, 0, opcode::DEVICE_STATUS, &[], SecurityFlag::Session, &TEST_KEY);
        let decoded = decode(&encoded, |_| Some(TEST_KEY)).unwrap();
        assert!(decoded.body.is_empty());
    }

    #[test]
    fn tolerates_trailing_zero_padding_beyond_crc() {
        // A 1-byte body forces several zero-padding bytes after the CRC;
        // decode must still verify CRC against exactly header+body and
        // ignore the rest.
        let encoded = encode(3, 0, opcode::DEVICE_STATUS, &[0x42], SecurityFlag::Session, &TEST_KEY);
        let decoded = decode(&encoded, |_| Some(TEST_KEY)).unwrap();
        assert_eq!(decoded.body, vec![0x42]);
    }

    #[test]
    fn crc_mismatch_is_rejected() {
        let mut encoded = encode(4, 0, opcode::DEVICE_STATUS, b"abc", SecurityFlag::Session, &TEST_KEY);
        // Flip a bit inside the ciphertext; CBC diffusion corrupts the
        // decrypted block, so this should surface as an error (CRC
        // mismatch or a length inconsistency), never a silent success.
        let last = encoded.len() - 1;
        encoded[last] ^= 0xFF;
        assert!(decode(&encoded, |_| Some(TEST_KEY)).is_err());
    }
}
