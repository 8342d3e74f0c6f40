//! Leaf value codecs: integers, enums, floats, fixed-point and strings.
//!
//! Every atom keeps its raw bytes as the source of truth; the functions
//! here decode values out of those bytes on demand and encode mutations
//! back in. This is what makes the round-trip invariant trivial for leaves:
//! serialization just returns the buffer.

use byteorder::{BigEndian, ByteOrder as _, LittleEndian};
use encoding::all::{ISO_8859_1, UTF_16BE, UTF_16LE};
use encoding::{DecoderTrap, Encoding};

use crate::err::{Error, Result};
use crate::order::ByteOrder;

/// Fixed-width integer layout. Widths up to 16 bytes.
#[derive(Clone, Copy, Debug)]
pub struct IntSpec {
    pub width: u8,
    pub signed: bool,
}

impl IntSpec {
    pub fn new(width: u8, signed: bool) -> IntSpec {
        assert!((1..=16).contains(&width), "integer width out of range");
        IntSpec { width, signed }
    }
}

/// Decodes an unsigned integer of `bytes.len()` bytes (1..=16).
pub(crate) fn decode_uint(bytes: &[u8], order: ByteOrder) -> u128 {
    if bytes.is_empty() {
        return 0;
    }
    match order {
        ByteOrder::Little => LittleEndian::read_uint128(bytes, bytes.len()),
        ByteOrder::Big => BigEndian::read_uint128(bytes, bytes.len()),
    }
}

/// Decodes a two's-complement signed integer.
pub(crate) fn decode_sint(bytes: &[u8], order: ByteOrder) -> i128 {
    let raw = decode_uint(bytes, order);
    sign_extend(raw, bytes.len() as u32 * 8)
}

pub(crate) fn sign_extend(value: u128, width_bits: u32) -> i128 {
    if width_bits == 0 || width_bits >= 128 {
        return value as i128;
    }
    let sign = 1u128 << (width_bits - 1);
    if value & sign != 0 {
        (value as i128) - (1i128 << width_bits)
    } else {
        value as i128
    }
}

/// Encodes the low `width` bytes of `value`.
pub(crate) fn encode_uint(value: u128, width: usize, order: ByteOrder) -> Vec<u8> {
    let mut buf = vec![0u8; width];
    match order {
        ByteOrder::Little => LittleEndian::write_uint128(&mut buf, value, width),
        ByteOrder::Big => BigEndian::write_uint128(&mut buf, value, width),
    }
    buf
}

/// Name table for enum atoms.
#[derive(Clone, Debug, Default)]
pub struct EnumNames {
    entries: Vec<(&'static str, u128)>,
}

impl EnumNames {
    pub fn new(entries: &[(&'static str, u128)]) -> EnumNames {
        EnumNames {
            entries: entries.to_vec(),
        }
    }

    pub fn name_of(&self, value: u128) -> Option<&'static str> {
        self.entries
            .iter()
            .find(|(_, v)| *v == value)
            .map(|(n, _)| *n)
    }

    pub fn value_of(&self, name: &str) -> Option<u128> {
        self.entries
            .iter()
            .find(|(n, _)| *n == name)
            .map(|(_, v)| *v)
    }
}

/// Decoded float value. Non-finite bit patterns load as a sentinel that
/// serializes back to the identical bits.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum FloatVal {
    Finite(f64),
    NonFinite { bits: u128 },
}

impl FloatVal {
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            FloatVal::Finite(v) => Some(*v),
            FloatVal::NonFinite { .. } => None,
        }
    }
}

/// A `(sign, exponent, mantissa)` float layout. Covers IEEE half, single
/// and double as well as the odd custom-mantissa formats image codecs use.
#[derive(Clone, Copy, Debug)]
pub struct FloatSpec {
    pub sign_bits: u32,
    pub exp_bits: u32,
    pub mant_bits: u32,
}

impl FloatSpec {
    pub fn new(sign_bits: u32, exp_bits: u32, mant_bits: u32) -> FloatSpec {
        let total = sign_bits + exp_bits + mant_bits;
        assert!(sign_bits <= 1, "more than one sign bit");
        assert!(exp_bits >= 2 && mant_bits >= 1, "degenerate float layout");
        assert!(
            total % 8 == 0 && total <= 128,
            "float width must be a whole number of bytes up to 16"
        );
        FloatSpec {
            sign_bits,
            exp_bits,
            mant_bits,
        }
    }

    pub fn half() -> FloatSpec {
        FloatSpec::new(1, 5, 10)
    }

    pub fn single() -> FloatSpec {
        FloatSpec::new(1, 8, 23)
    }

    pub fn double() -> FloatSpec {
        FloatSpec::new(1, 11, 52)
    }

    pub fn width_bytes(&self) -> usize {
        ((self.sign_bits + self.exp_bits + self.mant_bits) / 8) as usize
    }

    fn bias(&self) -> i64 {
        (1i64 << (self.exp_bits - 1)) - 1
    }

    fn exp_mask(&self) -> u128 {
        (1u128 << self.exp_bits) - 1
    }

    fn mant_mask(&self) -> u128 {
        (1u128 << self.mant_bits) - 1
    }

    /// Reconstructs a value from raw bits.
    pub fn decode(&self, bits: u128) -> FloatVal {
        let mant = bits & self.mant_mask();
        let exp = (bits >> self.mant_bits) & self.exp_mask();
        let negative = self.sign_bits == 1 && (bits >> (self.mant_bits + self.exp_bits)) & 1 == 1;

        if exp == self.exp_mask() {
            // Infinity or NaN; kept verbatim.
            return FloatVal::NonFinite { bits };
        }

        let frac = mant as f64 / (self.mant_mask() as f64 + 1.0);
        let magnitude = if exp == 0 {
            // Subnormal (or zero).
            frac * (2f64).powi((1 - self.bias()) as i32)
        } else {
            (1.0 + frac) * (2f64).powi((exp as i64 - self.bias()) as i32)
        };

        FloatVal::Finite(if negative { -magnitude } else { magnitude })
    }

    /// Encodes `v` into raw bits, truncating excess mantissa precision
    /// toward zero. Values beyond the exponent range clamp to infinity.
    pub fn encode(&self, v: f64) -> u128 {
        let sign_bit = if self.sign_bits == 1 && v.is_sign_negative() {
            1u128 << (self.mant_bits + self.exp_bits)
        } else {
            0
        };

        if v.is_nan() {
            return sign_bit | (self.exp_mask() << self.mant_bits) | (1u128 << (self.mant_bits - 1));
        }
        if v.is_infinite() {
            return sign_bit | (self.exp_mask() << self.mant_bits);
        }
        if v == 0.0 {
            return sign_bit;
        }

        // Pull apart the f64 representation and rebias.
        let bits64 = v.to_bits();
        let e64 = ((bits64 >> 52) & 0x7ff) as i64;
        let mut frac52 = (bits64 & ((1u64 << 52) - 1)) as u128;
        let mut unbiased = e64 - 1023;
        if e64 == 0 {
            // f64 subnormal; normalize so the implicit bit is explicit.
            let shift = 52 - (127 - frac52.leading_zeros());
            frac52 = (frac52 << shift) & ((1u128 << 52) - 1);
            unbiased = -1022 - shift as i64;
        }

        let te = unbiased + self.bias();
        let max_exp = self.exp_mask() as i64;

        if te >= max_exp {
            // Overflows the target exponent: clamp to infinity.
            return sign_bit | (self.exp_mask() << self.mant_bits);
        }

        let mant = if te <= 0 {
            // Target subnormal: shift the full significand (implicit bit
            // included) down past the exponent deficit.
            let full = (1u128 << 52) | frac52;
            let shift = (52 - self.mant_bits as i64) + (1 - te);
            if shift >= 128 {
                0
            } else {
                full >> shift
            }
        } else if self.mant_bits <= 52 {
            frac52 >> (52 - self.mant_bits)
        } else {
            frac52 << (self.mant_bits - 52)
        };

        let exp_field = if te <= 0 { 0 } else { te as u128 };
        sign_bit | (exp_field << self.mant_bits) | (mant & self.mant_mask())
    }
}

/// Fixed-point layout: `total_bytes` of storage, the low `frac_bits`
/// fractional. Exact round-trip by construction (the raw integer is kept).
#[derive(Clone, Copy, Debug)]
pub struct FixedSpec {
    pub total_bytes: u8,
    pub frac_bits: u32,
    pub signed: bool,
}

impl FixedSpec {
    pub fn new(total_bytes: u8, frac_bits: u32, signed: bool) -> FixedSpec {
        assert!((1..=16).contains(&total_bytes), "fixed-point width out of range");
        assert!(
            frac_bits < u32::from(total_bytes) * 8,
            "fractional bits exceed storage"
        );
        FixedSpec {
            total_bytes,
            frac_bits,
            signed,
        }
    }

    /// Rational interpretation of the raw integer: `(numerator, denominator)`.
    pub fn ratio(&self, bytes: &[u8], order: ByteOrder) -> (i128, u128) {
        let num = if self.signed {
            decode_sint(bytes, order)
        } else {
            decode_uint(bytes, order) as i128
        };
        (num, 1u128 << self.frac_bits)
    }

    pub fn to_f64(&self, bytes: &[u8], order: ByteOrder) -> f64 {
        let (num, den) = self.ratio(bytes, order);
        num as f64 / den as f64
    }

    /// Encodes the nearest representable value.
    pub fn from_f64(&self, v: f64, order: ByteOrder) -> Vec<u8> {
        let raw = (v * (1u128 << self.frac_bits) as f64).round() as i128;
        encode_uint(raw as u128, usize::from(self.total_bytes), order)
    }
}

/// Character unit of a string atom. No transcoding happens at load time;
/// raw units are preserved verbatim.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CharUnit {
    One,
    Two,
    Four,
}

impl CharUnit {
    pub fn bytes(&self) -> usize {
        match self {
            CharUnit::One => 1,
            CharUnit::Two => 2,
            CharUnit::Four => 4,
        }
    }
}

/// String sizing rule. Length-prefixed strings are declared at the schema
/// level with a late field producer that computes `Units(n)`.
#[derive(Clone, Copy, Debug)]
pub enum StrPolicy {
    /// Exactly this many units.
    Units(u64),
    /// Consume units until one equals `terminator`; it is included in the
    /// serialized form.
    Terminated { terminator: u32 },
}

/// Best-effort display decoding of raw string units. Unit-1 strings decode
/// as Latin-1, unit-2 as UTF-16 in the region's byte order, unit-4 as
/// Unicode scalars. A trailing terminator unit is excluded by the caller.
pub(crate) fn decode_text(bytes: &[u8], unit: CharUnit, order: ByteOrder) -> Result<String> {
    let decode_err = |message: String| Error::Codec {
        codec: "text",
        message,
    };

    match unit {
        CharUnit::One => ISO_8859_1
            .decode(bytes, DecoderTrap::Replace)
            .map_err(|e| decode_err(e.into_owned())),
        CharUnit::Two => {
            let enc: &dyn Encoding = match order {
                ByteOrder::Little => UTF_16LE,
                ByteOrder::Big => UTF_16BE,
            };
            enc.decode(bytes, DecoderTrap::Replace)
                .map_err(|e| decode_err(e.into_owned()))
        }
        CharUnit::Four => {
            let mut out = String::with_capacity(bytes.len() / 4);
            for chunk in bytes.chunks_exact(4) {
                let cp = decode_uint(chunk, order) as u32;
                out.push(char::from_u32(cp).unwrap_or(char::REPLACEMENT_CHARACTER));
            }
            Ok(out)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_uint_round_trip_both_orders() {
        for order in [ByteOrder::Little, ByteOrder::Big] {
            for width in [1usize, 2, 3, 4, 8, 16] {
                let mask = if width == 16 {
                    u128::MAX
                } else {
                    (1u128 << (width * 8)) - 1
                };
                let value = 0x1122_3344_5566_7788_u128 & mask;
                let bytes = encode_uint(value, width, order);
                assert_eq!(bytes.len(), width);
                assert_eq!(decode_uint(&bytes, order), value);
            }
        }
    }

    #[test]
    fn test_byte_orders_disagree() {
        assert_eq!(decode_uint(&[0x34, 0x12], ByteOrder::Little), 0x1234);
        assert_eq!(decode_uint(&[0x34, 0x12], ByteOrder::Big), 0x3412);
    }

    #[test]
    fn test_signed_decode() {
        assert_eq!(decode_sint(&[0xff], ByteOrder::Little), -1);
        assert_eq!(decode_sint(&[0xfe, 0xff], ByteOrder::Little), -2);
        assert_eq!(decode_sint(&[0x7f], ByteOrder::Little), 127);
    }

    #[test]
    fn test_half_float_decode() {
        // 0x3c00 = 1.0, 0xc000 = -2.0 in IEEE half.
        let half = FloatSpec::half();
        assert_eq!(half.decode(0x3c00), FloatVal::Finite(1.0));
        assert_eq!(half.decode(0xc000), FloatVal::Finite(-2.0));
        assert_eq!(half.decode(0x0000), FloatVal::Finite(0.0));
    }

    #[test]
    fn test_half_float_encode_round_trip() {
        let half = FloatSpec::half();
        for v in [0.0, 1.0, -2.0, 0.5, 65504.0, -0.25] {
            let bits = half.encode(v);
            assert_eq!(half.decode(bits), FloatVal::Finite(v), "value {v}");
        }
    }

    #[test]
    fn test_half_float_subnormal() {
        let half = FloatSpec::half();
        // Smallest positive half subnormal: 2^-24.
        let tiny = (2f64).powi(-24);
        assert_eq!(half.encode(tiny), 0x0001);
        assert_eq!(half.decode(0x0001), FloatVal::Finite(tiny));
    }

    #[test]
    fn test_non_finite_is_a_sentinel() {
        let half = FloatSpec::half();
        assert_eq!(half.decode(0x7c00), FloatVal::NonFinite { bits: 0x7c00 });
        assert_eq!(half.decode(0x7e00), FloatVal::NonFinite { bits: 0x7e00 });
    }

    #[test]
    fn test_single_matches_ieee() {
        let single = FloatSpec::single();
        for v in [1.5f64, -1024.0, 0.1f32 as f64, 3.25] {
            let expected = (v as f32).to_bits() as u128;
            assert_eq!(single.encode(v), expected, "value {v}");
        }
    }

    #[test]
    fn test_custom_mantissa_layout() {
        // A 24-bit float with a 16-bit mantissa.
        let spec = FloatSpec::new(1, 7, 16);
        let bits = spec.encode(12.375);
        assert_eq!(spec.decode(bits), FloatVal::Finite(12.375));
    }

    #[test]
    fn test_float_overflow_clamps_to_infinity() {
        let half = FloatSpec::half();
        let bits = half.encode(1e30);
        assert_eq!(half.decode(bits), FloatVal::NonFinite { bits: 0x7c00 });
    }

    #[test]
    fn test_fixed_point() {
        // 16.16 fixed point.
        let spec = FixedSpec::new(4, 16, true);
        let bytes = spec.from_f64(-1.5, ByteOrder::Big);
        assert_eq!(spec.to_f64(&bytes, ByteOrder::Big), -1.5);
        let (num, den) = spec.ratio(&bytes, ByteOrder::Big);
        assert_eq!((num, den), (-98304, 65536));
    }

    #[test]
    fn test_enum_names() {
        let names = EnumNames::new(&[("PE32", 0x10b), ("PE32+", 0x20b)]);
        assert_eq!(names.name_of(0x10b), Some("PE32"));
        assert_eq!(names.value_of("PE32+"), Some(0x20b));
        assert_eq!(names.name_of(0), None);
    }

    #[test]
    fn test_text_decoding() {
        assert_eq!(
            decode_text(b"Hi", CharUnit::One, ByteOrder::Little).unwrap(),
            "Hi"
        );
        assert_eq!(
            decode_text(&[0x48, 0x00, 0x69, 0x00], CharUnit::Two, ByteOrder::Little).unwrap(),
            "Hi"
        );
        assert_eq!(
            decode_text(&[0x00, 0x00, 0x00, 0x41], CharUnit::Four, ByteOrder::Big).unwrap(),
            "A"
        );
    }
}
