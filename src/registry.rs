//! Keyed polymorphism: a registry maps discriminator values to concrete
//! types, with an optional default for unknown keys. Registries back every
//! tagged-union dispatch point (chunk types, table row types, method
//! identifiers) and are populated before any load, then read-only.

use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;

use crate::err::{Error, Result};
use crate::ty::Ty;

type Map<K, V> = hashbrown::HashMap<K, V, ahash::RandomState>;

/// A discriminator value. Anything hashable a format uses to pick a type:
/// integers, byte strings, short names, four-char codes, GUIDs.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum Key {
    Int(u64),
    Bytes(Vec<u8>),
    Str(String),
    FourCc([u8; 4]),
    Guid([u8; 16]),
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Key::Int(v) => write!(f, "{v} (0x{v:x})"),
            Key::Bytes(b) => write!(f, "{b:02x?}"),
            Key::Str(s) => write!(f, "`{s}`"),
            Key::FourCc(cc) => write!(f, "'{}'", String::from_utf8_lossy(cc)),
            Key::Guid(g) => write!(f, "{g:02x?}"),
        }
    }
}

impl From<u64> for Key {
    fn from(v: u64) -> Key {
        Key::Int(v)
    }
}

impl From<&str> for Key {
    fn from(v: &str) -> Key {
        Key::Str(v.to_owned())
    }
}

impl From<[u8; 4]> for Key {
    fn from(v: [u8; 4]) -> Key {
        Key::FourCc(v)
    }
}

type DefaultFn = dyn Fn(&Key, Option<u64>) -> Ty;

struct RegistryInner {
    name: &'static str,
    entries: RefCell<Map<Key, Ty>>,
    default: RefCell<Option<Rc<DefaultFn>>>,
}

/// A shared `discriminator -> type` map. Cloning shares the underlying
/// table, so a registry can be referenced from many schema declarations.
#[derive(Clone)]
pub struct Registry {
    inner: Rc<RegistryInner>,
}

impl Registry {
    pub fn new(name: &'static str) -> Registry {
        Registry {
            inner: Rc::new(RegistryInner {
                name,
                entries: RefCell::new(Map::default()),
                default: RefCell::new(None),
            }),
        }
    }

    pub fn name(&self) -> &'static str {
        self.inner.name
    }

    /// Adds an entry. Duplicate keys are a schema bug and error here, at
    /// registration time.
    pub fn register(&self, key: impl Into<Key>, ty: Ty) -> Result<()> {
        let key = key.into();
        let mut entries = self.inner.entries.borrow_mut();
        if entries.contains_key(&key) {
            return Err(Error::DuplicateKey {
                registry: self.inner.name,
                key: key.to_string(),
            });
        }
        entries.insert(key, ty);
        Ok(())
    }

    /// Installs the fallback invoked as `(key, expected_size)` for keys with
    /// no entry. Conventionally an opaque block sized to `expected_size`, so
    /// every input byte stays represented by some region.
    pub fn set_default(&self, f: impl Fn(&Key, Option<u64>) -> Ty + 'static) {
        *self.inner.default.borrow_mut() = Some(Rc::new(f));
    }

    /// Installs the conventional default: an opaque block of the expected
    /// size (zero-length when no size hint is available).
    pub fn set_block_default(&self) {
        self.set_default(|_, expected_size| Ty::block(expected_size.unwrap_or(0)));
    }

    /// Resolves a discriminator to a concrete type, falling back to the
    /// default when no entry matches.
    pub fn lookup(&self, key: &Key, expected_size: Option<u64>) -> Result<Ty> {
        if let Some(ty) = self.inner.entries.borrow().get(key) {
            return Ok(ty.clone());
        }
        match &*self.inner.default.borrow() {
            Some(default) => Ok(default(key, expected_size)),
            None => Err(Error::InvalidDiscriminator {
                registry: self.inner.name,
                key: key.to_string(),
            }),
        }
    }

    pub fn contains(&self, key: &Key) -> bool {
        self.inner.entries.borrow().contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.inner.entries.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl fmt::Debug for Registry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Registry({}, {} entries)", self.inner.name, self.len())
    }
}
