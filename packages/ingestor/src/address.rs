//! Account Addresses
//!
//! `MsgAddress` covers the two address shapes that appear in the messages this
//! crate decodes: `addr_none` and `addr_std` (workchain + 256-bit account id).
//! The canonical text form is the user-friendly base64url encoding with a
//! CRC16 checksum; the raw `workchain:hex` form is accepted as input too.

use std::fmt;
use std::str::FromStr;

use base64ct::{Base64, Base64Url, Encoding};
use crc::{Crc, CRC_16_XMODEM};

use crate::cell::DecodeError;

/// Flag byte of a bounceable user-friendly address
pub const FLAG_BOUNCEABLE: u8 = 0x11;

/// Flag byte of a non-bounceable user-friendly address
pub const FLAG_NON_BOUNCEABLE: u8 = 0x51;

/// Bit set in the flag byte for testnet-only addresses
pub const FLAG_TESTNET: u8 = 0x80;

/// Decoded length of a user-friendly address: flag, workchain, hash, crc
const FRIENDLY_LEN: usize = 36;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum MsgAddress {
    /// `addr_none$00`
    #[default]
    None,
    /// `addr_std$10` without anycast
    Std { workchain: i8, hash: [u8; 32] },
}

impl MsgAddress {
    pub fn std(workchain: i8, hash: [u8; 32]) -> Self {
        MsgAddress::Std { workchain, hash }
    }

    pub fn is_none(&self) -> bool {
        matches!(self, MsgAddress::None)
    }

    /// Raw form, e.g. `0:27a393…`. Empty for `addr_none`.
    pub fn to_raw(&self) -> String {
        match self {
            MsgAddress::None => String::new(),
            MsgAddress::Std { workchain, hash } => format!("{}:{}", workchain, hex::encode(hash)),
        }
    }

    /// User-friendly base64url form. Empty for `addr_none`.
    pub fn to_friendly(&self, bounceable: bool, testnet: bool) -> String {
        let MsgAddress::Std { workchain, hash } = self else {
            return String::new();
        };
        let mut flag = if bounceable { FLAG_BOUNCEABLE } else { FLAG_NON_BOUNCEABLE };
        if testnet {
            flag |= FLAG_TESTNET;
        }
        let mut bytes = Vec::with_capacity(FRIENDLY_LEN);
        bytes.push(flag);
        bytes.push(*workchain as u8);
        bytes.extend_from_slice(hash);
        let crc = crc16(&bytes);
        bytes.extend_from_slice(&crc.to_be_bytes());
        Base64Url::encode_string(&bytes)
    }

    fn parse_raw(s: &str) -> Result<Self, DecodeError> {
        let (workchain, account) = s
            .split_once(':')
            .ok_or_else(|| DecodeError::InvalidAddress(s.to_string()))?;
        let workchain: i8 = workchain
            .parse()
            .map_err(|_| DecodeError::InvalidAddress(format!("bad workchain in {s}")))?;
        let bytes =
            hex::decode(account).map_err(|e| DecodeError::InvalidAddress(format!("{s}: {e}")))?;
        let hash: [u8; 32] = bytes
            .try_into()
            .map_err(|_| DecodeError::InvalidAddress(format!("account id of {s} is not 32 bytes")))?;
        Ok(MsgAddress::Std { workchain, hash })
    }

    fn parse_friendly(s: &str) -> Result<Self, DecodeError> {
        let decoded = if s.contains(['+', '/']) {
            Base64::decode_vec(s)
        } else {
            Base64Url::decode_vec(s)
        }
        .map_err(|e| DecodeError::InvalidAddress(format!("{s}: {e}")))?;

        if decoded.len() != FRIENDLY_LEN {
            return Err(DecodeError::InvalidAddress(format!(
                "{s}: expected {FRIENDLY_LEN} bytes, got {}",
                decoded.len()
            )));
        }
        let flag = decoded[0] & !FLAG_TESTNET;
        if flag != FLAG_BOUNCEABLE && flag != FLAG_NON_BOUNCEABLE {
            return Err(DecodeError::InvalidAddress(format!("{s}: unknown flag {:#04x}", decoded[0])));
        }
        let expected = crc16(&decoded[..34]);
        let actual = u16::from_be_bytes([decoded[34], decoded[35]]);
        if expected != actual {
            return Err(DecodeError::InvalidAddress(format!("{s}: checksum mismatch")));
        }
        let mut hash = [0u8; 32];
        hash.copy_from_slice(&decoded[2..34]);
        Ok(MsgAddress::Std {
            workchain: decoded[1] as i8,
            hash,
        })
    }
}

impl fmt::Display for MsgAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_friendly(true, false))
    }
}

impl FromStr for MsgAddress {
    type Err = DecodeError;

    /// Parses the raw (`wc:hex`) or user-friendly form. An empty string is `addr_none`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() {
            return Ok(MsgAddress::None);
        }
        if s.contains(':') {
            return Self::parse_raw(s);
        }
        Self::parse_friendly(s)
    }
}

const XMODEM: Crc<u16> = Crc::<u16>::new(&CRC_16_XMODEM);

/// CRC16/XMODEM as used by user-friendly addresses
pub fn crc16(data: &[u8]) -> u16 {
    XMODEM.checksum(data)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cell::CellBuilder;

    const RAW: &str = "0:27a393c4327b0cb76e9b3e09d778530e055cd2347a2bd9cb60c802eb837a03e5";
    const NON_BOUNCEABLE: &str = "UQAno5PEMnsMt26bPgnXeFMOBVzSNHor2ctgyALrg3oD5aF6";
    const BOUNCEABLE: &str = "EQAno5PEMnsMt26bPgnXeFMOBVzSNHor2ctgyALrg3oD5fy_";

    // ==================== parsing tests ====================

    #[test]
    fn test_parse_raw_address() {
        let address: MsgAddress = RAW.parse().unwrap();
        assert_eq!(address.to_raw(), RAW);
    }

    #[test]
    fn test_parse_non_bounceable_friendly_address() {
        let address: MsgAddress = NON_BOUNCEABLE.parse().unwrap();
        assert_eq!(address.to_raw(), RAW);
        assert_eq!(address.to_friendly(false, false), NON_BOUNCEABLE);
    }

    #[test]
    fn test_display_is_bounceable_friendly() {
        let address: MsgAddress = RAW.parse().unwrap();
        assert_eq!(address.to_string(), BOUNCEABLE);
    }

    #[test]
    fn test_parse_rejects_bad_checksum() {
        let mut tampered = NON_BOUNCEABLE.to_string();
        tampered.replace_range(10..11, "A");
        assert!(matches!(
            tampered.parse::<MsgAddress>(),
            Err(DecodeError::InvalidAddress(_))
        ));
    }

    #[test]
    fn test_parse_rejects_short_raw_account() {
        assert!("0:abcd".parse::<MsgAddress>().is_err());
        assert!("x:00".parse::<MsgAddress>().is_err());
    }

    #[test]
    fn test_empty_string_is_none() {
        assert_eq!("".parse::<MsgAddress>().unwrap(), MsgAddress::None);
        assert_eq!(MsgAddress::None.to_string(), "");
    }

    #[test]
    fn test_masterchain_workchain() {
        let address = MsgAddress::std(-1, [0x33; 32]);
        let parsed: MsgAddress = address.to_raw().parse().unwrap();
        assert_eq!(parsed, address);
        assert!(address.to_raw().starts_with("-1:"));
    }

    #[test]
    fn test_crc16_check_value() {
        // CRC-16/XMODEM check value
        assert_eq!(crc16(b"123456789"), 0x31c3);
    }

    // ==================== cell encoding tests ====================

    #[test]
    fn test_read_std_address_from_cell() {
        let address: MsgAddress = RAW.parse().unwrap();
        let mut builder = CellBuilder::new();
        builder.store_address(&address).unwrap();
        let cell = builder.build();
        assert_eq!(cell.bit_len(), 267);
        assert_eq!(cell.reader().read_address().unwrap(), address);
    }

    #[test]
    fn test_read_none_address_from_cell() {
        let mut builder = CellBuilder::new();
        builder.store_address(&MsgAddress::None).unwrap();
        let cell = builder.build();
        assert_eq!(cell.reader().read_address().unwrap(), MsgAddress::None);
    }

    #[test]
    fn test_read_extern_address_rejected() {
        let mut builder = CellBuilder::new();
        builder.store_uint(0b01, 2).unwrap().store_uint(0, 9).unwrap();
        let cell = builder.build();
        assert_eq!(
            cell.reader().read_address(),
            Err(DecodeError::UnsupportedAddress(0b01))
        );
    }

    #[test]
    fn test_read_anycast_address_rejected() {
        let mut builder = CellBuilder::new();
        builder.store_uint(0b10, 2).unwrap().store_bit(true).unwrap();
        let cell = builder.build();
        assert_eq!(cell.reader().read_address(), Err(DecodeError::AnycastAddress));
    }

    #[test]
    fn test_read_truncated_address() {
        let mut builder = CellBuilder::new();
        builder.store_uint(0b10, 2).unwrap().store_bit(false).unwrap().store_uint(0, 8).unwrap();
        let cell = builder.build();
        let mut reader = cell.reader();
        assert!(matches!(reader.read_address(), Err(DecodeError::NotEnoughBits { .. })));
        assert_eq!(reader.remaining_bits(), 11);
    }
}
