//! Property tests for the CRC-16 codec and request framing (properties 1-2).

use modbus_gateway_bridge::crc::{append_crc, verify_crc};
use modbus_gateway_bridge::frame::build_request;
use proptest::prelude::*;

proptest! {
    /// `verify_crc(append_crc(b)) == true` for any byte string long enough
    /// that the framed result clears `verify_crc`'s own 4-byte floor
    /// (`append_crc` always adds exactly 2 bytes, so `b.len() >= 2`
    /// guarantees that).
    #[test]
    fn append_then_verify_always_succeeds(bytes in prop::collection::vec(any::<u8>(), 2..256)) {
        let framed = append_crc(&bytes);
        prop_assert!(verify_crc(&framed));
    }

    /// Flipping any single bit in a framed buffer must break verification.
    #[test]
    fn corrupting_any_byte_breaks_verification(
        bytes in prop::collection::vec(any::<u8>(), 2..256),
        flip_index in 0usize..256,
        flip_bit in 0u8..8,
    ) {
        let mut framed = append_crc(&bytes);
        let index = flip_index % framed.len();
        framed[index] ^= 1 << flip_bit;
        prop_assert!(!verify_crc(&framed));
    }

    /// `build_request` always produces exactly 8 bytes laid out as
    /// `[slave, function, addr-hi, addr-lo, count-hi, count-lo, crc-lo, crc-hi]`.
    #[test]
    fn build_request_has_the_documented_layout(
        slave: u8,
        function: u8,
        address: u16,
        count: u16,
    ) {
        let frame = build_request(slave, function, address, count);
        prop_assert_eq!(frame.len(), 8);
        prop_assert_eq!(frame[0], slave);
        prop_assert_eq!(frame[1], function);
        prop_assert_eq!(frame[2], (address >> 8) as u8);
        prop_assert_eq!(frame[3], (address & 0xff) as u8);
        prop_assert_eq!(frame[4], (count >> 8) as u8);
        prop_assert_eq!(frame[5], (count & 0xff) as u8);
        prop_assert!(verify_crc(&frame));
    }
}
