#![forbid(unsafe_code)]
#![deny(unused_must_use)]
//! A lazy, offset-addressed binary-structure engine.
//!
//! Format parsers are written as schema declarations over a small
//! vocabulary of typed regions: fixed-width atoms, records with late-bound
//! fields, arrays with count/budget/terminator policies, bit records,
//! tagged unions dispatched through registries, typed pointers and codec
//! wrappers. Loading is lazy where it matters (pointer targets, encoded
//! windows) and tolerant everywhere: truncated or malformed input yields a
//! partially loaded tree with precise per-field diagnostics instead of an
//! error, and serializing any loaded tree reproduces the input bytes.
//!
//! ```
//! use binregion::{Field, Ty};
//!
//! let header = Ty::record(
//!     "header",
//!     vec![
//!         Field::new("magic", Ty::u16()),
//!         Field::new("len", Ty::u8()),
//!         Field::late("body", |r| Ok(Ty::block(r.field("len")?.as_u64()?))),
//!     ],
//! )
//! .unwrap();
//!
//! let r = header.parse(vec![0x4d, 0x5a, 0x02, 0xde, 0xad]);
//! assert!(r.state().is_loaded());
//! assert_eq!(r.field("magic").unwrap().as_u64().unwrap(), 0x5a4d);
//! assert_eq!(r.field("body").unwrap().as_bytes().unwrap(), vec![0xde, 0xad]);
//! assert_eq!(r.serialize().unwrap(), vec![0x4d, 0x5a, 0x02, 0xde, 0xad]);
//! ```

pub mod atom;
pub mod bitmap;
pub mod bits;
pub mod encoded;
pub mod err;
pub mod hexdump;
pub mod order;
pub mod pointer;
pub mod region;
pub mod registry;
pub mod source;
pub mod ty;
pub mod walk;

pub use atom::{CharUnit, EnumNames, FixedSpec, FloatSpec, FloatVal, IntSpec, StrPolicy};
pub use bitmap::Bitmap;
pub use bits::{BitField, BitFieldKind};
pub use encoded::{Codec, DeflateCodec, ZlibCodec};
pub use err::{Error, LoadState, Result};
pub use order::{
    default_bitorder, default_byteorder, set_default_bitorder, set_default_byteorder, BitOrder,
    ByteOrder,
};
pub use pointer::{PtrMask, Resolver};
pub use region::Region;
pub use registry::{Key, Registry};
pub use source::{
    FileSource, IterSource, MemSource, SharedSource, Source, WindowSource,
};
pub use ty::{Field, Ty};

#[cfg(feature = "bzip2-codec")]
pub use encoded::Bzip2Codec;
#[cfg(feature = "lzma-codec")]
pub use encoded::XzCodec;
#[cfg(target_os = "linux")]
pub use source::ProcSource;

#[cfg(test)]
static LOGGER_INIT: std::sync::Once = std::sync::Once::new();

// Rust runs the tests concurrently, so unless we synchronize logging access
// it will crash when attempting to run `cargo test` with some logging
// facilities.
#[cfg(test)]
pub(crate) fn ensure_env_logger_initialized() {
    use std::io::Write;

    LOGGER_INIT.call_once(|| {
        let mut builder = env_logger::Builder::from_default_env();
        builder
            .format(|buf, record| writeln!(buf, "[{}] - {}", record.level(), record.args()))
            .init();
    });
}
