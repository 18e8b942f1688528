//! sample <-> wire byte conversion for the four wire depths
//!
//! The host always works in 32 bit float; the wire carries whatever depth the
//! session negotiated.  Quantization floors toward negative infinity.  The
//! 24 bit format is a 16 bit word plus one unsigned byte holding the residual
//! above the 16 bit step; the residual is never negative, so reconstruction
//! leans positive by up to half a 24 bit step.  That lean is part of the wire
//! format and stays: existing peers decode it that way.
use byteorder::{ByteOrder, LittleEndian};

use crate::common::packet::BitResolution;

/// quantize one sample into `out`, which must be exactly `res.bytes()` long
pub fn sample_to_bits(sample: f32, out: &mut [u8], res: BitResolution) -> () {
    match res {
        BitResolution::Bit8 => {
            // 8 bit integer between -128 and 127
            out[0] = (f64::from(sample) * 128.0).floor() as i8 as u8;
        }
        BitResolution::Bit16 => {
            // 16 bit integer between -32768 and 32767
            let q = (f64::from(sample) * 32768.0).floor() as i16;
            LittleEndian::write_i16(out, q);
        }
        BitResolution::Bit24 => {
            // quantize to 16 bit first, then the leftover above that step
            // goes into one unsigned byte
            let scaled = f64::from(sample) * 32768.0;
            let word = scaled.floor();
            let residual = ((scaled - word) * 256.0).floor() as u8;
            LittleEndian::write_i16(&mut out[0..2], word as i16);
            out[2] = residual;
        }
        BitResolution::Bit32 => {
            LittleEndian::write_f32(out, sample);
        }
    }
}

/// recover a sample from `input`, which must be exactly `res.bytes()` long
pub fn bits_to_sample(input: &[u8], res: BitResolution) -> f32 {
    match res {
        BitResolution::Bit8 => (input[0] as i8) as f32 / 128.0,
        BitResolution::Bit16 => LittleEndian::read_i16(input) as f32 / 32768.0,
        BitResolution::Bit24 => {
            let word = LittleEndian::read_i16(&input[0..2]) as f32;
            let residual = input[2] as f32 / 256.0;
            (word + residual) / 32768.0
        }
        BitResolution::Bit32 => LittleEndian::read_f32(input),
    }
}

#[cfg(test)]
mod test_codec {
    use super::*;

    fn round_trip(v: f32, res: BitResolution) -> f32 {
        let mut buf = [0u8; 4];
        sample_to_bits(v, &mut buf[..res.bytes()], res);
        bits_to_sample(&buf[..res.bytes()], res)
    }

    #[test]
    fn thirty_two_bit_is_identity() {
        for v in [0.0f32, 0.5, -0.5, 1.0, -1.0, 0.12345, -0.9999] {
            assert_eq!(round_trip(v, BitResolution::Bit32), v);
        }
    }

    #[test]
    fn sixteen_bit_known_values() {
        // the S-curve of interesting points: exact, clipped, and quantized
        assert_eq!(round_trip(0.0, BitResolution::Bit16), 0.0);
        assert_eq!(round_trip(0.5, BitResolution::Bit16), 0.5);
        assert_eq!(round_trip(-0.5, BitResolution::Bit16), -0.5);
        assert_eq!(round_trip(1.0, BitResolution::Bit16), 32767.0 / 32768.0);
        assert_eq!(round_trip(-1.0, BitResolution::Bit16), -1.0);
        let expect = (0.12345f64 * 32768.0).floor() as f32 / 32768.0;
        assert!((round_trip(0.12345, BitResolution::Bit16) - expect).abs() <= 1.0 / 32768.0);
    }

    #[test]
    fn sixteen_bit_error_bound() {
        let step = 1.0 / 32768.0f32;
        let mut v = -1.0f32;
        while v < 1.0 {
            let err = (round_trip(v, BitResolution::Bit16) - v).abs();
            assert!(err <= step, "error {} at {}", err, v);
            v += 0.0137;
        }
    }

    #[test]
    fn eight_bit_error_bound() {
        let step = 1.0 / 128.0f32;
        let mut v = -1.0f32;
        while v < 1.0 {
            let err = (round_trip(v, BitResolution::Bit8) - v).abs();
            assert!(err <= step, "error {} at {}", err, v);
            v += 0.0137;
        }
    }

    #[test]
    fn twenty_four_bit_beats_sixteen() {
        // residual byte should tighten the error by roughly 2^8
        let step = 1.0 / (32768.0 * 256.0) as f32;
        for v in [0.1234567f32, -0.7654321, 0.000123, 0.9999] {
            let err = round_trip(v, BitResolution::Bit24) - v;
            // reconstruction leans positive, never below the input step
            assert!(err.abs() <= 2.0 * step, "error {} at {}", err, v);
        }
    }

    #[test]
    fn twenty_four_bit_layout() {
        // 16 bit word little endian, then the residual byte
        let mut buf = [0u8; 3];
        sample_to_bits(0.5, &mut buf, BitResolution::Bit24);
        assert_eq!(LittleEndian::read_i16(&buf[0..2]), 16384);
        assert_eq!(buf[2], 0);
    }

    #[test]
    fn wire_bytes_are_little_endian() {
        let mut buf = [0u8; 2];
        sample_to_bits(0.5, &mut buf, BitResolution::Bit16);
        // 16384 = 0x4000
        assert_eq!(buf, [0x00, 0x40]);
    }
}
