//! Arbitrary-width bit integers.
//!
//! A [`Bitmap`] is an `(value, width)` pair holding up to 128 bits. It is
//! the unit of currency for bit records: fields are consumed from the high
//! end in stream order, concatenated with [`Bitmap::push`], and scanned for
//! runs when a format calls for it. Keeping this arithmetic in one place
//! means the bit-container code never does ad-hoc shift/mask work.

use crate::err::{Error, Result};

/// A fixed-width unsigned bit string. Position 0 is the most significant
/// (first consumed) bit.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Bitmap {
    value: u128,
    width: u32,
}

impl Bitmap {
    pub const MAX_WIDTH: u32 = 128;

    /// Builds a bitmap from an integer, keeping the low `width` bits.
    pub fn new(value: u128, width: u32) -> Bitmap {
        assert!(width <= Self::MAX_WIDTH, "bitmap wider than 128 bits");
        Bitmap {
            value: value & Self::mask(width),
            width,
        }
    }

    pub fn zero(width: u32) -> Bitmap {
        Bitmap::new(0, width)
    }

    pub fn empty() -> Bitmap {
        Bitmap::new(0, 0)
    }

    fn mask(width: u32) -> u128 {
        if width == 0 {
            0
        } else if width == 128 {
            u128::MAX
        } else {
            (1u128 << width) - 1
        }
    }

    pub fn value(&self) -> u128 {
        self.value
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn is_empty(&self) -> bool {
        self.width == 0
    }

    /// The value reinterpreted as a two's-complement signed integer of
    /// `width` bits.
    pub fn signed_value(&self) -> i128 {
        if self.width == 0 || self.width == 128 {
            return self.value as i128;
        }
        let sign = 1u128 << (self.width - 1);
        if self.value & sign != 0 {
            (self.value as i128) - (1i128 << self.width)
        } else {
            self.value as i128
        }
    }

    /// Concatenates `other` onto the low end, growing the width.
    pub fn push(self, other: Bitmap) -> Bitmap {
        assert!(
            self.width + other.width <= Self::MAX_WIDTH,
            "bitmap concatenation exceeds 128 bits"
        );
        Bitmap {
            value: (self.value << other.width) | other.value,
            width: self.width + other.width,
        }
    }

    /// Pops `k` bits off the high end, returning them and shrinking `self`.
    pub fn consume(&mut self, k: u32) -> Result<Bitmap> {
        if k > self.width {
            return Err(Error::ShortRead {
                offset: 0,
                wanted: u64::from(k),
                got: u64::from(self.width),
            });
        }
        let rest_width = self.width - k;
        let taken = Bitmap::new(self.value >> rest_width, k);
        self.value &= Self::mask(rest_width);
        self.width = rest_width;
        Ok(taken)
    }

    /// Shifts left by `k`: returns the `k` bits spilled out of the high end
    /// and the same-width remainder, zero-filled at the low end.
    pub fn shift_left(self, k: u32) -> (Bitmap, Bitmap) {
        let k = k.min(self.width);
        if k == 0 {
            return (Bitmap::empty(), self);
        }
        // k >= 1 here, so width - k < 128. A full-width remainder shift
        // would be a shift by 128; clear it directly instead.
        let spilled = Bitmap::new(self.value >> (self.width - k), k);
        let rest = if k == Self::MAX_WIDTH {
            Bitmap::zero(self.width)
        } else {
            Bitmap::new(self.value << k, self.width)
        };
        (spilled, rest)
    }

    /// Shifts right by `k`: returns the same-width remainder, zero-filled at
    /// the high end, and the `k` bits spilled out of the low end.
    pub fn shift_right(self, k: u32) -> (Bitmap, Bitmap) {
        let k = k.min(self.width);
        if k == 0 {
            return (self, Bitmap::empty());
        }
        let spilled = Bitmap::new(self.value, k);
        let rest = if k == Self::MAX_WIDTH {
            Bitmap::zero(self.width)
        } else {
            Bitmap::new(self.value >> k, self.width)
        };
        (rest, spilled)
    }

    /// The bit at `pos`, counted from the most significant end.
    pub fn get(&self, pos: u32) -> bool {
        assert!(pos < self.width, "bit position out of range");
        self.value >> (self.width - 1 - pos) & 1 == 1
    }

    /// Replaces the bit at `pos`.
    pub fn set(&mut self, pos: u32, bit: bool) {
        assert!(pos < self.width, "bit position out of range");
        let mask = 1u128 << (self.width - 1 - pos);
        if bit {
            self.value |= mask;
        } else {
            self.value &= !mask;
        }
    }

    /// Position of the first bit equal to `bit` at or after `from`.
    pub fn scan(&self, from: u32, bit: bool) -> Option<u32> {
        (from..self.width).find(|&pos| self.get(pos) == bit)
    }

    /// Length of the run of bits equal to the bit at `from`.
    pub fn run_length(&self, from: u32) -> u32 {
        if from >= self.width {
            return 0;
        }
        let lead = self.get(from);
        match self.scan(from, !lead) {
            Some(end) => end - from,
            None => self.width - from,
        }
    }

    /// Iterates `(bit, length)` runs from the most significant end.
    pub fn runs(&self) -> Runs {
        Runs {
            bitmap: *self,
            pos: 0,
        }
    }
}

pub struct Runs {
    bitmap: Bitmap,
    pos: u32,
}

impl Iterator for Runs {
    type Item = (bool, u32);

    fn next(&mut self) -> Option<(bool, u32)> {
        if self.pos >= self.bitmap.width() {
            return None;
        }
        let bit = self.bitmap.get(self.pos);
        let len = self.bitmap.run_length(self.pos);
        self.pos += len;
        Some((bit, len))
    }
}

impl std::fmt::Debug for Bitmap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Bitmap({:#x}, {})", self.value, self.width)
    }
}

impl std::fmt::Display for Bitmap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for pos in 0..self.width {
            f.write_str(if self.get(pos) { "1" } else { "0" })?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_new_masks_to_width() {
        let b = Bitmap::new(0x1ff, 8);
        assert_eq!(b.value(), 0xff);
        assert_eq!(b.width(), 8);
    }

    #[test]
    fn test_push_concatenates_on_low_end() {
        let b = Bitmap::new(0b101, 3).push(Bitmap::new(0b01, 2));
        assert_eq!(b.value(), 0b10101);
        assert_eq!(b.width(), 5);
    }

    #[test]
    fn test_consume_pops_from_high_end() {
        let mut b = Bitmap::new(0b1010_0110, 8);
        assert_eq!(b.consume(1).unwrap().value(), 1);
        assert_eq!(b.consume(3).unwrap().value(), 0b010);
        assert_eq!(b.consume(4).unwrap().value(), 0b0110);
        assert!(b.is_empty());
        assert!(b.consume(1).is_err());
    }

    #[test]
    fn test_shift_left_spills_high_bits() {
        let (spilled, rest) = Bitmap::new(0b1100_0001, 8).shift_left(2);
        assert_eq!(spilled.value(), 0b11);
        assert_eq!(rest.value(), 0b0000_0100);
        assert_eq!(rest.width(), 8);
    }

    #[test]
    fn test_shift_right_spills_low_bits() {
        let (rest, spilled) = Bitmap::new(0b1100_0001, 8).shift_right(2);
        assert_eq!(spilled.value(), 0b01);
        assert_eq!(rest.value(), 0b0011_0000);
        assert_eq!(rest.width(), 8);
    }

    #[test]
    fn test_signed_value_sign_extends() {
        assert_eq!(Bitmap::new(0b111, 3).signed_value(), -1);
        assert_eq!(Bitmap::new(0b100, 3).signed_value(), -4);
        assert_eq!(Bitmap::new(0b011, 3).signed_value(), 3);
    }

    #[test]
    fn test_scan_and_runs() {
        let b = Bitmap::new(0b1110_0110, 8);
        assert_eq!(b.scan(0, false), Some(3));
        assert_eq!(b.scan(3, true), Some(5));
        assert_eq!(b.run_length(0), 3);
        assert_eq!(
            b.runs().collect::<Vec<_>>(),
            vec![(true, 3), (false, 2), (true, 2), (false, 1)]
        );
    }

    #[test]
    fn test_shift_by_zero_and_full_width() {
        let b = Bitmap::new(u128::MAX, 128);

        let (spilled, rest) = b.shift_left(0);
        assert!(spilled.is_empty());
        assert_eq!(rest, b);

        let (spilled, rest) = b.shift_left(128);
        assert_eq!(spilled, b);
        assert_eq!(rest, Bitmap::zero(128));

        let (rest, spilled) = b.shift_right(0);
        assert!(spilled.is_empty());
        assert_eq!(rest, b);

        let (rest, spilled) = b.shift_right(128);
        assert_eq!(spilled, b);
        assert_eq!(rest, Bitmap::zero(128));
    }

    #[test]
    fn test_full_width_bitmap() {
        let b = Bitmap::new(u128::MAX, 128);
        assert_eq!(b.value(), u128::MAX);
        assert_eq!(b.signed_value(), -1);
    }
}
