use std::cell::Cell;

/// Byte ordering of multi-byte atoms. Inherited from the parent region
/// unless a type declares its own.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ByteOrder {
    Little,
    Big,
}

/// Direction in which bit-record fields pack into each byte.
///
/// `MsbFirst` assigns the first declared field the most significant bits of
/// the first byte; `LsbFirst` assigns it the least significant bits.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BitOrder {
    MsbFirst,
    LsbFirst,
}

thread_local! {
    static DEFAULT_BYTEORDER: Cell<ByteOrder> = const { Cell::new(ByteOrder::Little) };
    static DEFAULT_BITORDER: Cell<BitOrder> = const { Cell::new(BitOrder::MsbFirst) };
}

/// The thread's default byte order, consulted by regions whose type and
/// ancestry declare none.
pub fn default_byteorder() -> ByteOrder {
    DEFAULT_BYTEORDER.with(Cell::get)
}

/// The thread's default bit order.
pub fn default_bitorder() -> BitOrder {
    DEFAULT_BITORDER.with(Cell::get)
}

/// Overrides the thread default. Intended for program start and test
/// harnesses; changing it after a load has already happened on this thread
/// leaves existing trees interpreting bytes with the old order.
pub fn set_default_byteorder(order: ByteOrder) {
    DEFAULT_BYTEORDER.with(|cell| cell.set(order));
}

/// Overrides the thread default bit order. Same caveats as
/// [`set_default_byteorder`].
pub fn set_default_bitorder(order: BitOrder) {
    DEFAULT_BITORDER.with(|cell| cell.set(order));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_little_endian_msb_first() {
        assert_eq!(default_byteorder(), ByteOrder::Little);
        assert_eq!(default_bitorder(), BitOrder::MsbFirst);
    }

    #[test]
    fn test_defaults_are_per_thread() {
        set_default_byteorder(ByteOrder::Big);
        assert_eq!(default_byteorder(), ByteOrder::Big);
        set_default_byteorder(ByteOrder::Little);

        let handle = std::thread::spawn(|| default_byteorder());
        assert_eq!(handle.join().unwrap(), ByteOrder::Little);
    }
}
