//! Optional BLE advertisement decoding: service-data product-id prefix and
//! manufacturer-data flags/version/AES-CBC-encrypted-uuid layout.

use aes::Aes128;
use aes::cipher::{BlockDecryptMut, KeyIvInit, block_padding::NoPadding};

type Aes128CbcDec = cbc::Decryptor<Aes128>;

/// Fields recovered from advertisement payloads, when present.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AdvertisementInfo {
    pub product_id: Option<Vec<u8>>,
    pub bound: Option<bool>,
    pub protocol_version: Option<u8>,
    pub uuid: Option<String>,
}

/// Service-data payload under the Tuya service UUID: leading byte `0x00`
/// marks the remainder as the raw product-id suffix.
pub fn decode_service_data(service_data: &[u8]) -> Option<Vec<u8>> {
    if service_data.len() > 1 && service_data[0] == 0 {
        Some(service_data[1..].to_vec())
    } else {
        None
    }
}

/// Manufacturer-data payload under company id `0x07D0`: `flags(1)` (high
/// bit = bound), `protocol_version(1)`, 4 reserved bytes, then an
/// AES-128-CBC-encrypted 16-byte UUID (key = iv = MD5(product_id)).
pub fn decode_manufacturer_data(manufacturer_data: &[u8], product_id: Option<&[u8]>) -> (bool, u8, Option<String>) {
    if manufacturer_data.len() <= 6 {
        return (false, 0, None);
    }
    let bound = manufacturer_data[0] & 0x80 != 0;
    let protocol_version = manufacturer_data[1];
    let raw_uuid = &manufacturer_data[6..];

    let uuid = match product_id {
        Some(product_id) if !raw_uuid.is_empty() && raw_uuid.len() % 16 == 0 => {
            let key = md5::compute(product_id).0;
            let mut buf = raw_uuid.to_vec();
            Aes128CbcDec::new(key.as_ref().into(), key.as_ref().into())
                .decrypt_padded_mut::<NoPadding>(&mut buf)
                .ok()
                .and_then(|plain| std::str::from_utf8(plain).ok().map(str::to_string))
        }
        _ => None,
    };

    (bound, protocol_version, uuid)
}

/// Decode both service-data and manufacturer-data sections of an
/// advertisement into one `AdvertisementInfo`.
pub fn decode(service_data: Option<&[u8]>, manufacturer_data: Option<&[u8]>) -> AdvertisementInfo {
    let product_id = service_data.and_then(decode_service_data);

    let (bound, protocol_version, uuid) = match manufacturer_data {
        Some(data) => decode_manufacturer_data(data, product_id.as_deref()),
        None => (false, 0, None),
    };

    AdvertisementInfo {
        product_id,
        bound: manufacturer_data.map(|_| bound),
        protocol_version: manufacturer_data.map(|_| protocol_version),
        uuid,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use aes::cipher::BlockEncryptMut;

    #[test]
    fn service_data_extracts_product_id_suffix() {
        let data = [0x00, b'p', b'r', b'o', b'd'];
        assert_eq!(decode_service_data(&data), Some(b"prod".to_vec()));
    }

    #[test]
    fn service_data_with_nonzero_leading_byte_is_ignored() {
        let data = [0x01, b'x'];
        assert_eq!(decode_service_data(&data), None);
    }

    #[test]
    fn manufacturer_data_decrypts_uuid_roundtrip() {
        let product_id = b"prod-0001";
        let key = md5::compute(product_id).0;
        let uuid_plain = b"0123456789abcdef"; // 16 bytes, block-aligned
        let mut ciphertext = uuid_plain.to_vec();
        let encrypted = cbc::Encryptor::<Aes128>::new(key.as_ref().into(), key.as_ref().into())
            .encrypt_padded_mut::<aes::cipher::block_padding::NoPadding>(&mut ciphertext, uuid_plain.len())
            .unwrap()
            .to_vec();

        let mut manufacturer_data = vec![0x80, 3, 0, 0, 0, 0];
        manufacturer_data.extend_from_slice(&encrypted);

        let (bound, version, uuid) = decode_manufacturer_data(&manufacturer_data, Some(product_id));
        assert!(bound);
        assert_eq!(version, 3);
        assert_eq!(uuid.unwrap(), "0123456789abcdef");
    }

    #[test]
    fn short_manufacturer_data_is_ignored() {
        let (bound, version, uuid) = decode_manufacturer_data(&[0x80, 1], None);
        assert!(!bound);
        assert_eq!(version, 0);
        assert!(uuid.is_none());
    }
}
