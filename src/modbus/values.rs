//! Conversions between 32-bit quantities and register pairs (high word first).

const WRAP_32: i64 = 0x1_0000_0000;
const SIGN_32: i64 = 0x8000_0000;

/// Joins two registers into one 32-bit value, optionally reinterpreting it as signed.
pub fn combine_32bit(high: u16, low: u16, signed: bool) -> i64 {
    let value = ((high as i64) << 16) | low as i64;
    if signed && value >= SIGN_32 {
        value - WRAP_32
    } else {
        value
    }
}

/// Splits a value into `(high, low)` registers. Negative values are written
/// in 32-bit two's complement.
pub fn split_32bit(value: i64) -> (u16, u16) {
    let value = if value < 0 { value + WRAP_32 } else { value };
    (((value >> 16) & 0xFFFF) as u16, (value & 0xFFFF) as u16)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_combine_unsigned() {
        assert_eq!(combine_32bit(0x0001, 0x0002, false), 0x0001_0002);
        assert_eq!(combine_32bit(0xFFFF, 0xFFFF, false), 0xFFFF_FFFF);
    }

    #[test]
    fn test_combine_signed() {
        assert_eq!(combine_32bit(0xFFFF, 0xFFFF, true), -1);
        assert_eq!(combine_32bit(0x8000, 0x0000, true), -2_147_483_648);
        assert_eq!(combine_32bit(0x7FFF, 0xFFFF, true), 2_147_483_647);
    }

    #[test]
    fn test_split() {
        assert_eq!(split_32bit(0), (0, 0));
        assert_eq!(split_32bit(-1), (0xFFFF, 0xFFFF));
        assert_eq!(split_32bit(-1000), (0xFFFF, 0xFC18));
        assert_eq!(split_32bit(100_000), (0x0001, 0x86A0));
    }

    #[test]
    fn test_round_trip_over_i32_range() {
        let samples = [
            0i64,
            1,
            -1,
            1000,
            -1000,
            65_535,
            65_536,
            -65_536,
            i32::MAX as i64,
            i32::MIN as i64,
        ];
        for v in samples {
            let (high, low) = split_32bit(v);
            assert_eq!(combine_32bit(high, low, v < 0), v, "value {}", v);
        }
    }
}
