//! Bluetooth UUID constants and short-form expansion.
//!
//! BLE identifies standard services and characteristics by 16- or 32-bit
//! aliases of the Bluetooth base UUID. [`expand`] turns those short literals
//! into full [`Uuid`]s so call sites can write `expand("feed")` instead of
//! spelling out the 128-bit form.

use uuid::{uuid, Uuid};

use crate::error::UuidError;

/// The Bluetooth SIG base UUID. Short UUIDs are aliases into its top 32 bits.
pub const BLUETOOTH_BASE: Uuid = uuid!("00000000-0000-1000-8000-00805f9b34fb");

/// Client Characteristic Configuration descriptor (CCCD).
///
/// Writing this descriptor enables or disables notifications/indications on
/// its characteristic.
pub const CLIENT_CHARACTERISTIC_CONFIG: Uuid = uuid!("00002902-0000-1000-8000-00805f9b34fb");

/// CCCD payload that enables notifications.
pub const ENABLE_NOTIFICATION_VALUE: [u8; 2] = [0x01, 0x00];

/// CCCD payload that disables notifications and indications.
pub const DISABLE_NOTIFICATION_VALUE: [u8; 2] = [0x00, 0x00];

/// Expand a UUID literal into a full 128-bit UUID.
///
/// Accepts three forms:
/// - a full UUID (`f0cd1400-95da-4f4b-9ac8-aa55d312af0c`), returned as-is,
/// - a 16-bit alias (`feed`), merged into bits 16..32 of the base UUID,
/// - a 32-bit alias (`0000feed`), replacing the top 32 bits of the base UUID.
///
/// # Example
///
/// ```
/// use bluesmart_types::uuid::expand;
///
/// let full = expand("feed").unwrap();
/// assert_eq!(full.to_string(), "0000feed-0000-1000-8000-00805f9b34fb");
/// ```
pub fn expand(literal: &str) -> Result<Uuid, UuidError> {
    expand_with_base(BLUETOOTH_BASE, literal)
}

/// Expand a UUID literal against a vendor base UUID instead of the
/// Bluetooth SIG base.
///
/// Vendors commonly define a private base UUID and address characteristics
/// by 16-bit offsets into it; this merges such an offset the same way
/// [`expand`] does for the standard base.
pub fn expand_with_base(base: Uuid, literal: &str) -> Result<Uuid, UuidError> {
    let trimmed = literal.trim();

    if trimmed.len() == 36 {
        return Uuid::parse_str(trimmed).map_err(|_| UuidError::Malformed(trimmed.to_string()));
    }

    if !trimmed.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(UuidError::Malformed(trimmed.to_string()));
    }

    let alias = match trimmed.len() {
        4 => u32::from_str_radix(trimmed, 16).map_err(|_| UuidError::Malformed(trimmed.to_string()))?,
        8 => u32::from_str_radix(trimmed, 16).map_err(|_| UuidError::Malformed(trimmed.to_string()))?,
        _ => return Err(UuidError::BadLength(trimmed.len())),
    };

    let mut bytes = *base.as_bytes();
    let alias_bytes = alias.to_be_bytes();
    if trimmed.len() == 4 {
        // 16-bit alias lands in bytes 2..4, keeping the base's top 16 bits.
        bytes[2] = alias_bytes[2];
        bytes[3] = alias_bytes[3];
    } else {
        bytes[..4].copy_from_slice(&alias_bytes);
    }
    Ok(Uuid::from_bytes(bytes))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expands_16_bit_alias() {
        let uuid = expand("180f").unwrap();
        assert_eq!(uuid.to_string(), "0000180f-0000-1000-8000-00805f9b34fb");
    }

    #[test]
    fn expands_32_bit_alias() {
        let uuid = expand("f0cd1400").unwrap();
        assert_eq!(uuid.to_string(), "f0cd1400-0000-1000-8000-00805f9b34fb");
    }

    #[test]
    fn passes_full_uuid_through() {
        let literal = "f0cd1400-95da-4f4b-9ac8-aa55d312af0c";
        assert_eq!(expand(literal).unwrap().to_string(), literal);
    }

    #[test]
    fn expands_against_vendor_base() {
        let base = expand("f0cd1400-95da-4f4b-9ac8-aa55d312af0c").unwrap();
        let uuid = expand_with_base(base, "3001").unwrap();
        assert_eq!(uuid.to_string(), "f0cd3001-95da-4f4b-9ac8-aa55d312af0c");
    }

    #[test]
    fn rejects_odd_lengths() {
        assert!(matches!(expand("feeds"), Err(UuidError::BadLength(5))));
        assert!(matches!(expand("f"), Err(UuidError::BadLength(1))));
    }

    #[test]
    fn rejects_non_hex() {
        assert!(matches!(expand("wxyz"), Err(UuidError::Malformed(_))));
        assert!(matches!(
            expand("not-a-uuid-string-of-thirty-six-chr!"),
            Err(UuidError::Malformed(_))
        ));
    }

    #[test]
    fn cccd_is_short_2902() {
        assert_eq!(expand("2902").unwrap(), CLIENT_CHARACTERISTIC_CONFIG);
    }
}
