use std::io;
use std::rc::Rc;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("read failed at offset 0x{offset:x}: {source}")]
    Read { offset: u64, source: io::Error },

    #[error("write failed at offset 0x{offset:x}: {source}")]
    Write { offset: u64, source: io::Error },

    #[error("short read at offset 0x{offset:x}: wanted {wanted} bytes, got {got}")]
    ShortRead { offset: u64, wanted: u64, got: u64 },

    #[error("source is not writable")]
    ReadOnlySource,

    #[error("bit container is {bits} bits wide, not a whole number of bytes")]
    Misaligned { bits: u64 },

    #[error("block array overshot its {budget}-byte budget by {excess} bytes")]
    Overshoot { budget: u64, excess: u64 },

    #[error("block array filled only {loaded} bytes of its {budget}-byte budget")]
    Undershoot { budget: u64, loaded: u64 },

    #[error("registry `{registry}` has no entry for key {key} and no default")]
    InvalidDiscriminator { registry: &'static str, key: String },

    #[error("registry `{registry}` already has an entry for key {key}")]
    DuplicateKey { registry: &'static str, key: String },

    #[error("record `{record}` declares field `{field}` more than once")]
    DuplicateField { record: String, field: String },

    #[error("dereference of null pointer stored at offset 0x{offset:x}")]
    NullPointer { offset: u64 },

    #[error("pointer at offset 0x{offset:x} has no {anchor} ancestor to resolve against")]
    UnresolvedAnchor { offset: u64, anchor: String },

    #[error("codec `{codec}` failed: {message}")]
    Codec {
        codec: &'static str,
        message: String,
    },

    #[error("codec `{codec}` did not round-trip")]
    RoundTrip { codec: &'static str },

    #[error("no field named `{name}` in `{ty}`")]
    NoSuchField { ty: String, name: String },

    #[error("index {index} out of bounds for `{ty}` of length {len}")]
    IndexOutOfBounds {
        ty: String,
        index: usize,
        len: usize,
    },

    #[error("`{ty}` does not support {op}")]
    NotSupported { ty: String, op: &'static str },

    #[error("`{path}`: {source}")]
    At { path: String, source: Rc<Error> },
}

impl Error {
    /// Prefixes a path segment onto a captured child error, building the
    /// `record.field`-style annotation paths that partial loads report.
    pub(crate) fn at(path: impl Into<String>, source: Rc<Error>) -> Error {
        Error::At {
            path: path.into(),
            source,
        }
    }

    /// Walks through `At` wrappers down to the error that started the cascade.
    pub fn root_cause(&self) -> &Error {
        let mut cur = self;
        while let Error::At { source, .. } = cur {
            cur = source;
        }
        cur
    }

    /// True if the cascade bottoms out in a short read (truncated input).
    pub fn is_short_read(&self) -> bool {
        matches!(self.root_cause(), Error::ShortRead { .. })
    }
}

/// Lifecycle state of a region. Regions begin uninitialized, and `load`
/// moves them to `Loaded`, `Partial` (some children loaded, annotated with
/// the error that stopped the rest) or `Failed` (nothing usable decoded).
#[derive(Clone, Debug, Default)]
pub enum LoadState {
    #[default]
    Uninitialized,
    Loaded,
    Partial(Rc<Error>),
    Failed(Rc<Error>),
}

impl LoadState {
    pub fn is_loaded(&self) -> bool {
        matches!(self, LoadState::Loaded)
    }

    pub fn is_partial(&self) -> bool {
        matches!(self, LoadState::Partial(_))
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, LoadState::Failed(_))
    }

    /// Loaded or partial, i.e. the region has a defined size.
    pub fn is_initialized(&self) -> bool {
        matches!(self, LoadState::Loaded | LoadState::Partial(_))
    }

    pub fn error(&self) -> Option<&Rc<Error>> {
        match self {
            LoadState::Partial(e) | LoadState::Failed(e) => Some(e),
            _ => None,
        }
    }
}

impl std::fmt::Display for LoadState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LoadState::Uninitialized => f.write_str("uninitialized"),
            LoadState::Loaded => f.write_str("loaded"),
            LoadState::Partial(e) => write!(f, "partial ({e})"),
            LoadState::Failed(e) => write!(f, "failed ({e})"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_root_cause_unwraps_path_prefixes() {
        let inner = Rc::new(Error::ShortRead {
            offset: 8,
            wanted: 4,
            got: 2,
        });
        let wrapped = Error::at("header", Rc::new(Error::at("c", inner)));

        assert!(wrapped.is_short_read());
        assert_eq!(
            format!("{wrapped}"),
            "`header`: `c`: short read at offset 0x8: wanted 4 bytes, got 2"
        );
    }
}
