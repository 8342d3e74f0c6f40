//! Pointer resolution.
//!
//! A pointer region stores an integer and a rule for turning it into a
//! source offset. Resolution happens lazily on the first dereference; the
//! resolver variants here cover the addressing conventions real formats
//! use (absolute offsets, section-relative offsets, file offsets that
//! ignore in-memory relocation, and flag-carrying packed offsets).

use std::borrow::Cow;

use crate::err::{Error, Result};
use crate::region::Region;
use crate::source::{outermost, SharedSource};

/// How a stored integer maps to a target offset.
#[derive(Clone, Debug)]
pub enum Resolver {
    /// The stored value is an absolute offset in the pointer's source.
    Absolute,
    /// The stored value is added to the pointer's own offset.
    Relative,
    /// The stored value is added to the offset of the nearest ancestor
    /// marked with [`crate::Ty::boundary`].
    Boundary,
    /// The stored value is added to the offset of the nearest ancestor
    /// whose type has this name.
    Ancestor(Cow<'static, str>),
    /// The stored value is an offset in the outermost source of the window
    /// chain, independent of any window base.
    FileOffset,
}

/// Splits a stored integer into offset and flag bits, for pointers that
/// pack a type selector into their high bit(s).
#[derive(Clone, Copy, Debug)]
pub struct PtrMask {
    pub offset_mask: u64,
    pub flag_mask: u64,
}

impl PtrMask {
    pub fn new(offset_mask: u64, flag_mask: u64) -> PtrMask {
        assert!(offset_mask & flag_mask == 0, "overlapping pointer masks");
        PtrMask {
            offset_mask,
            flag_mask,
        }
    }

    /// The common case: the top bit of a `width_bits`-wide value is the
    /// flag and the rest is the offset (e.g. 31-bit resource offsets).
    pub fn high_bit(width_bits: u32) -> PtrMask {
        assert!((2..=64).contains(&width_bits));
        let flag = 1u64 << (width_bits - 1);
        PtrMask::new(flag - 1, flag)
    }

    pub fn split(&self, stored: u64) -> (u64, u64) {
        let flag = (stored & self.flag_mask) >> self.flag_mask.trailing_zeros();
        (stored & self.offset_mask, flag)
    }
}

/// Computes the `(source, offset)` a pointer's stored value designates.
pub(crate) fn resolve(
    resolver: &Resolver,
    node: &Region,
    stored: i128,
) -> Result<(SharedSource, u64)> {
    let source = node.source();
    match resolver {
        Resolver::Absolute => Ok((source, stored as u64)),
        Resolver::Relative => Ok((source, add_offset(node.offset(), stored))),
        Resolver::Boundary => {
            let anchor = node.boundary_ancestor().ok_or_else(|| Error::UnresolvedAnchor {
                offset: node.offset(),
                anchor: "boundary".to_owned(),
            })?;
            Ok((source, add_offset(anchor.offset(), stored)))
        }
        Resolver::Ancestor(name) => {
            let anchor = node
                .ancestor_named(name)
                .ok_or_else(|| Error::UnresolvedAnchor {
                    offset: node.offset(),
                    anchor: format!("`{name}`"),
                })?;
            Ok((source, add_offset(anchor.offset(), stored)))
        }
        Resolver::FileOffset => Ok((outermost(&source), stored as u64)),
    }
}

fn add_offset(base: u64, delta: i128) -> u64 {
    (base as i128 + delta) as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_high_bit_mask_splits() {
        let mask = PtrMask::high_bit(32);
        assert_eq!(mask.split(0x8000_0010), (0x10, 1));
        assert_eq!(mask.split(0x0000_0010), (0x10, 0));
    }

    #[test]
    fn test_high_bit_mask_31() {
        let mask = PtrMask::high_bit(31);
        assert_eq!(mask.split(0x4000_0100), (0x100, 1));
        assert_eq!(mask.split(0x3fff_ffff), (0x3fff_ffff, 0));
    }
}
