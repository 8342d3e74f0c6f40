//! Bit-addressed composition.
//!
//! Bit records mirror byte records but declare field widths in bits. The
//! reader/writer pair here is the only place that knows how a bit stream
//! maps onto bytes: `MsbFirst` fills each byte from the most significant
//! bit down, `LsbFirst` from the least significant bit up, and a bit
//! container with little-endian byte order reads its backing bytes swapped
//! end-to-end.

use std::borrow::Cow;

use crate::bitmap::Bitmap;
use crate::err::{Error, Result};
use crate::order::BitOrder;
use crate::ty::{Ty, TyKind};

/// One field of a bit record.
#[derive(Clone, Debug)]
pub struct BitField {
    pub(crate) name: Cow<'static, str>,
    pub(crate) kind: BitFieldKind,
}

#[derive(Clone, Debug)]
pub enum BitFieldKind {
    /// An unsigned integer of this many bits.
    Bits(u32),
    /// A two's-complement integer of this many bits.
    SignedBits(u32),
    /// A nested bit record.
    Nested(Ty),
    /// A fixed-count array of bit elements.
    Array { elem: Box<BitFieldKind>, count: u64 },
}

impl BitField {
    pub fn bits(name: impl Into<Cow<'static, str>>, width: u32) -> BitField {
        BitField {
            name: name.into(),
            kind: BitFieldKind::Bits(width),
        }
    }

    pub fn signed_bits(name: impl Into<Cow<'static, str>>, width: u32) -> BitField {
        BitField {
            name: name.into(),
            kind: BitFieldKind::SignedBits(width),
        }
    }

    pub fn nested(name: impl Into<Cow<'static, str>>, ty: Ty) -> BitField {
        BitField {
            name: name.into(),
            kind: BitFieldKind::Nested(ty),
        }
    }

    pub fn array(name: impl Into<Cow<'static, str>>, elem: BitFieldKind, count: u64) -> BitField {
        BitField {
            name: name.into(),
            kind: BitFieldKind::Array {
                elem: Box::new(elem),
                count,
            },
        }
    }
}

/// Total width in bits of a field kind. Widths are static by construction.
pub(crate) fn kind_bits(kind: &BitFieldKind) -> u64 {
    match kind {
        BitFieldKind::Bits(w) | BitFieldKind::SignedBits(w) => u64::from(*w),
        BitFieldKind::Nested(ty) => match ty.kind() {
            TyKind::BitRecord(spec) => spec.total_bits(),
            _ => 0,
        },
        BitFieldKind::Array { elem, count } => kind_bits(elem) * count,
    }
}

#[derive(Debug)]
pub(crate) struct BitRecordSpec {
    pub(crate) fields: Vec<BitField>,
    total: u64,
}

impl BitRecordSpec {
    pub(crate) fn new(name: Cow<'static, str>, fields: Vec<BitField>) -> Result<BitRecordSpec> {
        let mut total = 0u64;
        for (i, field) in fields.iter().enumerate() {
            if fields[..i].iter().any(|f| f.name == field.name) {
                return Err(Error::DuplicateField {
                    record: name.into_owned(),
                    field: field.name.clone().into_owned(),
                });
            }
            validate_kind(&name, &field.name, &field.kind)?;
            total += kind_bits(&field.kind);
        }
        Ok(BitRecordSpec { fields, total })
    }

    pub(crate) fn total_bits(&self) -> u64 {
        self.total
    }
}

fn validate_kind(record: &str, field: &str, kind: &BitFieldKind) -> Result<()> {
    match kind {
        BitFieldKind::Bits(w) | BitFieldKind::SignedBits(w) => {
            if !(1..=128).contains(w) {
                return Err(Error::NotSupported {
                    ty: format!("{record}.{field}"),
                    op: "bit field widths outside 1..=128",
                });
            }
        }
        BitFieldKind::Nested(ty) => {
            if !matches!(ty.kind(), TyKind::BitRecord(_)) {
                return Err(Error::NotSupported {
                    ty: format!("{record}.{field}"),
                    op: "nesting byte-addressed types inside a bit record",
                });
            }
        }
        BitFieldKind::Array { elem, .. } => validate_kind(record, field, elem)?,
    }
    Ok(())
}

/// Pulls bit fields out of a byte buffer in stream order.
pub(crate) struct BitReader<'a> {
    bytes: &'a [u8],
    pos: u64,
    order: BitOrder,
}

impl<'a> BitReader<'a> {
    pub(crate) fn new(bytes: &'a [u8], order: BitOrder) -> BitReader<'a> {
        BitReader {
            bytes,
            pos: 0,
            order,
        }
    }

    pub(crate) fn position(&self) -> u64 {
        self.pos
    }

    pub(crate) fn remaining(&self) -> u64 {
        self.bytes.len() as u64 * 8 - self.pos
    }

    fn stream_bit(&self, index: u64) -> bool {
        let byte = self.bytes[(index / 8) as usize];
        let shift = match self.order {
            BitOrder::MsbFirst => 7 - (index % 8) as u32,
            BitOrder::LsbFirst => (index % 8) as u32,
        };
        byte >> shift & 1 == 1
    }

    /// The next `width` bits as a field value, or `None` if the buffer runs
    /// out. Under `MsbFirst` the first stream bit is the field's most
    /// significant bit; under `LsbFirst` it is the least significant.
    pub(crate) fn take(&mut self, width: u32) -> Option<Bitmap> {
        if u64::from(width) > self.remaining() {
            return None;
        }
        let mut acc = Bitmap::empty();
        for i in 0..u64::from(width) {
            let bit = Bitmap::new(u128::from(self.stream_bit(self.pos + i)), 1);
            acc = match self.order {
                BitOrder::MsbFirst => acc.push(bit),
                BitOrder::LsbFirst => bit.push(acc),
            };
        }
        self.pos += u64::from(width);
        Some(acc)
    }
}

/// Packs bit fields back into bytes; the inverse of [`BitReader`].
pub(crate) struct BitWriter {
    bytes: Vec<u8>,
    pos: u64,
    order: BitOrder,
}

impl BitWriter {
    pub(crate) fn new(order: BitOrder) -> BitWriter {
        BitWriter {
            bytes: Vec::new(),
            pos: 0,
            order,
        }
    }

    fn put_stream_bit(&mut self, bit: bool) {
        let byte_index = (self.pos / 8) as usize;
        if byte_index == self.bytes.len() {
            self.bytes.push(0);
        }
        let shift = match self.order {
            BitOrder::MsbFirst => 7 - (self.pos % 8) as u32,
            BitOrder::LsbFirst => (self.pos % 8) as u32,
        };
        if bit {
            self.bytes[byte_index] |= 1 << shift;
        }
        self.pos += 1;
    }

    pub(crate) fn put(&mut self, bm: Bitmap) {
        for i in 0..bm.width() {
            let bit = match self.order {
                BitOrder::MsbFirst => bm.get(i),
                BitOrder::LsbFirst => bm.value() >> i & 1 == 1,
            };
            self.put_stream_bit(bit);
        }
    }

    /// The packed bytes, trailing bits zero-padded.
    pub(crate) fn finish(self) -> Vec<u8> {
        self.bytes
    }
}

/// Internal leaf type for a bit integer; instantiated by the bit-container
/// loader, never directly by schemas.
pub(crate) fn bit_int_ty(width: u32, signed: bool) -> Ty {
    let name = format!("{}{}", if signed { "s" } else { "u" }, width);
    Ty::make_internal(name, TyKind::BitInt { width, signed })
}

/// Internal type for a bit array field.
pub(crate) fn bit_array_ty(elem: &BitFieldKind, count: u64) -> Ty {
    let name = format!("bits[{count}]");
    Ty::make_internal(
        name,
        TyKind::BitArray {
            elem: std::rc::Rc::new(elem.clone()),
            count,
        },
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    // 0b1010_0110 split as widths {1, 3, 4}.
    #[test]
    fn test_reader_msb_first() {
        let bytes = [0b1010_0110u8];
        let mut r = BitReader::new(&bytes, BitOrder::MsbFirst);
        assert_eq!(r.take(1).unwrap().value(), 1);
        assert_eq!(r.take(3).unwrap().value(), 0b010);
        assert_eq!(r.take(4).unwrap().value(), 0b0110);
        assert_eq!(r.take(1), None);
    }

    #[test]
    fn test_reader_lsb_first() {
        let bytes = [0b1010_0110u8];
        let mut r = BitReader::new(&bytes, BitOrder::LsbFirst);
        assert_eq!(r.take(1).unwrap().value(), 0);
        assert_eq!(r.take(3).unwrap().value(), 0b011);
        assert_eq!(r.take(4).unwrap().value(), 0b1010);
    }

    #[test]
    fn test_writer_inverts_reader() {
        for order in [BitOrder::MsbFirst, BitOrder::LsbFirst] {
            let bytes = [0xa6u8, 0x3c, 0x01];
            let mut r = BitReader::new(&bytes, order);
            let mut w = BitWriter::new(order);
            for width in [1u32, 3, 4, 7, 9] {
                w.put(r.take(width).unwrap());
            }
            assert_eq!(w.finish(), bytes.to_vec());
        }
    }

    #[test]
    fn test_duplicate_bit_field_is_a_definition_error() {
        let err = BitRecordSpec::new(
            Cow::Borrowed("flags"),
            vec![BitField::bits("x", 1), BitField::bits("x", 2)],
        )
        .unwrap_err();
        assert!(matches!(err, Error::DuplicateField { .. }));
    }

    #[test]
    fn test_total_width() {
        let spec = BitRecordSpec::new(
            Cow::Borrowed("hdr"),
            vec![
                BitField::bits("a", 1),
                BitField::bits("b", 3),
                BitField::array("pad", BitFieldKind::Bits(2), 2),
            ],
        )
        .unwrap();
        assert_eq!(spec.total_bits(), 8);
    }
}
