//! Parsing seed material and picking the target key from CLI input

use seedkey::{MAX_EXT_STATE_SIZE, SEED_SIZE};
use seedkey_transport::TransportDeviceInfo;
use thiserror::Error;

/// Rejected command-line input
#[derive(Error, Debug, PartialEq)]
pub enum SeedInputError {
    #[error("not valid hex: {0}")]
    Hex(#[from] hex::FromHexError),

    #[error("seed must be exactly 32 bytes (64 hex digits), got {0} bytes")]
    SeedLength(usize),

    #[error("extension state may be at most 256 bytes, got {0}")]
    ExtStateLength(usize),
}

fn decode_hex(input: &str) -> Result<Vec<u8>, SeedInputError> {
    let trimmed = input.trim();
    let digits = trimmed
        .strip_prefix("0x")
        .or_else(|| trimmed.strip_prefix("0X"))
        .unwrap_or(trimmed);
    Ok(hex::decode(digits)?)
}

/// Parse a 32-byte seed from hex
pub fn parse_seed(input: &str) -> Result<[u8; SEED_SIZE], SeedInputError> {
    let bytes = decode_hex(input)?;
    bytes
        .as_slice()
        .try_into()
        .map_err(|_| SeedInputError::SeedLength(bytes.len()))
}

/// Parse optional extension state from hex (empty when absent)
pub fn parse_ext_state(input: Option<&str>) -> Result<Vec<u8>, SeedInputError> {
    let Some(input) = input else {
        return Ok(Vec::new());
    };
    let bytes = decode_hex(input)?;
    if bytes.len() > MAX_EXT_STATE_SIZE {
        return Err(SeedInputError::ExtStateLength(bytes.len()));
    }
    Ok(bytes)
}

/// True if `selector` names this device by product name, serial or path
pub fn matches_selector(device: &TransportDeviceInfo, selector: &str) -> bool {
    device.product_name.as_deref() == Some(selector)
        || device.serial.as_deref() == Some(selector)
        || device.device_path == selector
}

/// Pick the target device: the first one matching `selector`, or the first
/// one at all when no selector was given.
pub fn select_device<'a>(
    devices: &'a [TransportDeviceInfo],
    selector: Option<&str>,
) -> Option<&'a TransportDeviceInfo> {
    match selector {
        Some(selector) => devices.iter().find(|d| matches_selector(d, selector)),
        None => devices.first(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SEED_HEX: &str = "000102030405060708090a0b0c0d0e0f101112131415161718191a1b1c1d1e1f";

    #[test]
    fn test_parse_seed() {
        let seed = parse_seed(SEED_HEX).unwrap();
        assert_eq!(seed[0], 0x00);
        assert_eq!(seed[31], 0x1f);

        // Prefix, surrounding whitespace and upper case are accepted
        let upper = format!("  0x{}\n", SEED_HEX.to_uppercase());
        assert_eq!(parse_seed(&upper).unwrap(), seed);
    }

    #[test]
    fn test_parse_seed_rejects_wrong_length() {
        assert_eq!(
            parse_seed(&SEED_HEX[..62]),
            Err(SeedInputError::SeedLength(31))
        );
        assert_eq!(
            parse_seed(&format!("{SEED_HEX}20")),
            Err(SeedInputError::SeedLength(33))
        );
        assert_eq!(parse_seed(""), Err(SeedInputError::SeedLength(0)));
    }

    #[test]
    fn test_parse_seed_rejects_bad_hex() {
        assert!(matches!(
            parse_seed(&SEED_HEX[..63]),
            Err(SeedInputError::Hex(hex::FromHexError::OddLength))
        ));
        let bad = format!("zz{}", &SEED_HEX[2..]);
        assert!(matches!(
            parse_seed(&bad),
            Err(SeedInputError::Hex(hex::FromHexError::InvalidHexCharacter { .. }))
        ));
    }

    #[test]
    fn test_parse_ext_state() {
        assert!(parse_ext_state(None).unwrap().is_empty());
        assert_eq!(parse_ext_state(Some("cafe")).unwrap(), vec![0xca, 0xfe]);
        assert_eq!(
            parse_ext_state(Some(&"00".repeat(257))),
            Err(SeedInputError::ExtStateLength(257))
        );
    }

    fn device(path: &str, serial: &str, name: &str) -> TransportDeviceInfo {
        TransportDeviceInfo {
            vid: 0x0483,
            pid: 0xa2ca,
            device_path: path.into(),
            serial: Some(serial.into()),
            product_name: Some(name.into()),
            usage_page: 0xF1D0,
        }
    }

    #[test]
    fn test_select_device() {
        let devices = vec![
            device("/dev/hidraw2", "111", "Solo 4.1.5"),
            device("/dev/hidraw5", "222", "Solo Hacker"),
        ];

        assert_eq!(select_device(&devices, None).unwrap().serial.as_deref(), Some("111"));
        assert_eq!(
            select_device(&devices, Some("Solo Hacker")).unwrap().device_path,
            "/dev/hidraw5"
        );
        assert_eq!(
            select_device(&devices, Some("222")).unwrap().device_path,
            "/dev/hidraw5"
        );
        assert_eq!(
            select_device(&devices, Some("/dev/hidraw2")).unwrap().serial.as_deref(),
            Some("111")
        );
        assert!(select_device(&devices, Some("Nitrokey")).is_none());
        assert!(select_device(&[], None).is_none());
    }
}
