//! The region tree.
//!
//! A [`Region`] is a typed view over a contiguous byte (or bit) window of a
//! source: it knows its offset, its size once loaded, its parent, and how
//! to decode itself. Loading is eager per node but tolerant end to end: a
//! child that cannot finish marks its ancestors `Partial` with a path
//! annotation and the rest of the tree stays navigable. Raw bytes are kept
//! as the source of truth on every leaf, so serializing a loaded (or
//! partially loaded) tree reproduces the input bytes exactly.
//!
//! Handles are `Rc`-backed and cheap to clone; parent links are weak, so a
//! tree is dropped when its root handle goes away. A single tree is
//! single-threaded by construction.

use std::borrow::Cow;
use std::cell::{Ref, RefCell};
use std::fmt;
use std::rc::{Rc, Weak};

use log::{debug, trace};

use crate::atom::{self, CharUnit, FloatVal, StrPolicy};
use crate::bitmap::Bitmap;
use crate::bits::{self, BitField, BitFieldKind, BitReader, BitWriter};
use crate::err::{Error, LoadState, Result};
use crate::order::{default_bitorder, default_byteorder, BitOrder, ByteOrder};
use crate::source::{read_at, store_at, MemSource, SharedSource};
use crate::ty::{ArrayPolicy, FieldTy, LenSpec, Ty, TyKind};

/// Addressing unit of a region. Descendants of a bit record are
/// bit-addressed; everything else is byte-addressed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Unit {
    Bytes,
    Bits,
}

pub(crate) enum Payload {
    /// Nothing decoded (uninitialized or failed).
    None,
    /// Leaf bytes, verbatim from the source.
    Bytes(Vec<u8>),
    /// Named children of a record.
    Fields(Vec<(Cow<'static, str>, Region)>),
    /// Indexed children of an array.
    Elems(Vec<Region>),
    /// A bit record in byte context: the raw window plus the decoded
    /// bit-addressed children.
    BitRoot {
        raw: Vec<u8>,
        fields: Vec<(Cow<'static, str>, Region)>,
    },
    /// A bit-addressed integer leaf.
    Bits(Bitmap),
    /// A union's chosen variant.
    Variant { key: String, child: Region },
    /// A pointer's stored bytes plus the lazily resolved target.
    Pointer {
        raw: Vec<u8>,
        target: Option<Region>,
    },
    /// An encoded window plus the lazily decoded child tree.
    Encoded {
        raw: Vec<u8>,
        child: Option<Region>,
    },
}

pub(crate) struct RegionInner {
    ty: Ty,
    source: SharedSource,
    /// Absolute offset in the source, in `unit`.
    offset: u64,
    unit: Unit,
    byteorder: ByteOrder,
    bitorder: BitOrder,
    /// Size in `unit`; meaningful once the state is initialized.
    size: u64,
    state: LoadState,
    parent: Weak<RefCell<RegionInner>>,
    payload: Payload,
}

/// A shared handle to one node of a region tree.
#[derive(Clone)]
pub struct Region {
    inner: Rc<RefCell<RegionInner>>,
}

/// Loads a fresh tree of `ty` at `offset`. The returned root is always
/// navigable; inspect its state for partial or failed loads.
pub(crate) fn load_root(ty: &Ty, source: SharedSource, offset: u64) -> Region {
    let root = Region::alloc(ty, source, offset, Unit::Bytes, None);
    load_node(&root);
    debug!(
        "loaded root `{}` at 0x{offset:x}: {}",
        root.name(),
        root.state()
    );
    root
}

impl Region {
    fn alloc(
        ty: &Ty,
        source: SharedSource,
        offset: u64,
        unit: Unit,
        parent: Option<&Region>,
    ) -> Region {
        let byteorder = ty
            .inner
            .byteorder
            .or_else(|| parent.map(Region::byteorder))
            .unwrap_or_else(default_byteorder);
        let bitorder = ty
            .inner
            .bitorder
            .or_else(|| parent.map(Region::bitorder))
            .unwrap_or_else(default_bitorder);
        Region {
            inner: Rc::new(RefCell::new(RegionInner {
                ty: ty.clone(),
                source,
                offset,
                unit,
                byteorder,
                bitorder,
                size: 0,
                state: LoadState::Uninitialized,
                parent: parent.map_or_else(Weak::new, |p| Rc::downgrade(&p.inner)),
                payload: Payload::None,
            })),
        }
    }

    fn borrow(&self) -> Ref<'_, RegionInner> {
        self.inner.borrow()
    }

    fn finish(&self, state: LoadState, size: u64, payload: Payload) {
        let mut inner = self.inner.borrow_mut();
        inner.state = state;
        inner.size = size;
        inner.payload = payload;
    }

    // --- identity and layout ------------------------------------------

    pub fn ty(&self) -> Ty {
        self.borrow().ty.clone()
    }

    pub fn name(&self) -> String {
        self.borrow().ty.name().to_owned()
    }

    pub fn state(&self) -> LoadState {
        self.borrow().state.clone()
    }

    /// Absolute offset in the region's source, in bytes (bits for the
    /// descendants of a bit record).
    pub fn offset(&self) -> u64 {
        self.borrow().offset
    }

    /// Size in the region's addressing unit. Zero until initialized; for a
    /// partial load it covers only what did load.
    pub fn size(&self) -> u64 {
        self.borrow().size
    }

    pub fn byteorder(&self) -> ByteOrder {
        self.borrow().byteorder
    }

    pub fn bitorder(&self) -> BitOrder {
        self.borrow().bitorder
    }

    pub fn source(&self) -> SharedSource {
        Rc::clone(&self.borrow().source)
    }

    pub(crate) fn is_bit_unit(&self) -> bool {
        self.borrow().unit == Unit::Bits
    }

    /// True when two handles refer to the same node of the same tree.
    pub fn ptr_eq(&self, other: &Region) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }

    /// True iff `offset` (in bytes) falls inside this region's window.
    pub fn contains(&self, offset: u64) -> bool {
        let inner = self.borrow();
        inner.unit == Unit::Bytes
            && inner.state.is_initialized()
            && offset >= inner.offset
            && offset < inner.offset + inner.size
    }

    fn not_supported(&self, op: &'static str) -> Error {
        Error::NotSupported {
            ty: self.name(),
            op,
        }
    }

    // --- navigation -----------------------------------------------------

    pub fn parent(&self) -> Option<Region> {
        self.borrow().parent.upgrade().map(|inner| Region { inner })
    }

    /// The root of this region's tree (follows pointer and codec back
    /// edges too, since those parent links are set at dereference time).
    pub fn root(&self) -> Region {
        let mut cur = self.clone();
        while let Some(p) = cur.parent() {
            cur = p;
        }
        cur
    }

    /// Nearest ancestor (self included) whose type has this name.
    pub fn ancestor_named(&self, name: &str) -> Option<Region> {
        let mut cur = Some(self.clone());
        while let Some(node) = cur {
            if node.borrow().ty.name() == name {
                return Some(node);
            }
            cur = node.parent();
        }
        None
    }

    /// Nearest ancestor (self included) marked [`Ty::boundary`].
    pub fn boundary_ancestor(&self) -> Option<Region> {
        let mut cur = Some(self.clone());
        while let Some(node) = cur {
            if node.borrow().ty.is_boundary() {
                return Some(node);
            }
            cur = node.parent();
        }
        None
    }

    /// A named child. Unions delegate to their chosen variant.
    pub fn field(&self, name: &str) -> Result<Region> {
        let found = match &self.borrow().payload {
            Payload::Fields(fields) | Payload::BitRoot { fields, .. } => fields
                .iter()
                .find(|(n, _)| n == name)
                .map(|(_, r)| r.clone()),
            Payload::Variant { child, .. } => return child.field(name),
            _ => None,
        };
        found.ok_or_else(|| Error::NoSuchField {
            ty: self.name(),
            name: name.to_owned(),
        })
    }

    /// A named child of this region's parent.
    pub fn sibling(&self, name: &str) -> Result<Region> {
        let parent = self.parent().ok_or_else(|| Error::NoSuchField {
            ty: self.name(),
            name: name.to_owned(),
        })?;
        parent.field(name)
    }

    /// The `i`th element of an array.
    pub fn index(&self, i: usize) -> Result<Region> {
        match &self.borrow().payload {
            Payload::Elems(elems) => elems.get(i).cloned().ok_or_else(|| Error::IndexOutOfBounds {
                ty: self.name(),
                index: i,
                len: elems.len(),
            }),
            Payload::Variant { child, .. } => child.index(i),
            _ => Err(self.not_supported("indexing")),
        }
    }

    /// Number of children (elements or fields).
    pub fn len(&self) -> usize {
        match &self.borrow().payload {
            Payload::Elems(elems) => elems.len(),
            Payload::Fields(fields) | Payload::BitRoot { fields, .. } => fields.len(),
            Payload::Variant { child, .. } => child.len(),
            _ => 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// All direct children, in load order. Pointer targets and decoded
    /// codec children appear once dereferenced.
    pub fn children(&self) -> Vec<Region> {
        match &self.borrow().payload {
            Payload::Fields(fields) | Payload::BitRoot { fields, .. } => {
                fields.iter().map(|(_, r)| r.clone()).collect()
            }
            Payload::Elems(elems) => elems.clone(),
            Payload::Variant { child, .. } => vec![child.clone()],
            Payload::Pointer { target, .. } => target.iter().cloned().collect(),
            Payload::Encoded { child, .. } => child.iter().cloned().collect(),
            _ => Vec::new(),
        }
    }

    /// The chosen variant of a union.
    pub fn variant(&self) -> Result<Region> {
        match &self.borrow().payload {
            Payload::Variant { child, .. } => Ok(child.clone()),
            _ => Err(self.not_supported("variant access")),
        }
    }

    pub fn variant_key(&self) -> Result<String> {
        match &self.borrow().payload {
            Payload::Variant { key, .. } => Ok(key.clone()),
            _ => Err(self.not_supported("variant access")),
        }
    }

    // --- value access -----------------------------------------------------

    pub fn as_u128(&self) -> Result<u128> {
        let inner = self.borrow();
        match (&inner.ty.inner.kind, &inner.payload) {
            (TyKind::Int(_) | TyKind::Enum(..), Payload::Bytes(raw)) => {
                Ok(atom::decode_uint(raw, inner.byteorder))
            }
            (TyKind::Pointer(_), Payload::Pointer { raw, .. }) => {
                Ok(atom::decode_uint(raw, inner.byteorder))
            }
            (TyKind::BitInt { .. }, Payload::Bits(bm)) => Ok(bm.value()),
            _ => Err(self.not_supported("integer access")),
        }
    }

    pub fn as_i128(&self) -> Result<i128> {
        let ty = self.ty();
        match ty.kind() {
            TyKind::Int(spec) if spec.signed => {
                let inner = self.borrow();
                match &inner.payload {
                    Payload::Bytes(raw) => Ok(atom::decode_sint(raw, inner.byteorder)),
                    _ => Err(self.not_supported("integer access")),
                }
            }
            TyKind::BitInt { signed: true, .. } => match &self.borrow().payload {
                Payload::Bits(bm) => Ok(bm.signed_value()),
                _ => Err(self.not_supported("integer access")),
            },
            _ => self.as_u128().map(|v| v as i128),
        }
    }

    pub fn as_u64(&self) -> Result<u64> {
        Ok(self.as_u128()? as u64)
    }

    pub fn as_i64(&self) -> Result<i64> {
        Ok(self.as_i128()? as i64)
    }

    /// Float value, with non-finite bit patterns as a sentinel.
    pub fn float_val(&self) -> Result<FloatVal> {
        let ty = self.ty();
        let spec = match ty.kind() {
            TyKind::Float(spec) => *spec,
            _ => return Err(self.not_supported("float access")),
        };
        let inner = self.borrow();
        match &inner.payload {
            Payload::Bytes(raw) => Ok(spec.decode(atom::decode_uint(raw, inner.byteorder))),
            _ => Err(self.not_supported("float access")),
        }
    }

    pub fn as_f64(&self) -> Result<f64> {
        let ty = self.ty();
        match ty.kind() {
            TyKind::Float(_) => self
                .float_val()?
                .as_f64()
                .ok_or_else(|| self.not_supported("finite float access (value is non-finite)")),
            TyKind::Fixed(spec) => {
                let spec = *spec;
                let inner = self.borrow();
                match &inner.payload {
                    Payload::Bytes(raw) => Ok(spec.to_f64(raw, inner.byteorder)),
                    _ => Err(self.not_supported("float access")),
                }
            }
            _ => Err(self.not_supported("float access")),
        }
    }

    /// The symbolic name of an enum atom's current value, if registered.
    pub fn enum_name(&self) -> Result<Option<&'static str>> {
        let ty = self.ty();
        let names = match ty.kind() {
            TyKind::Enum(_, names) => Rc::clone(names),
            _ => return Err(self.not_supported("enum access")),
        };
        Ok(names.name_of(self.as_u128()?))
    }

    /// Raw bytes of a leaf (block, string, atom or opaque window).
    pub fn as_bytes(&self) -> Result<Vec<u8>> {
        match &self.borrow().payload {
            Payload::Bytes(raw)
            | Payload::Pointer { raw, .. }
            | Payload::Encoded { raw, .. }
            | Payload::BitRoot { raw, .. } => Ok(raw.clone()),
            _ => Err(self.not_supported("raw byte access")),
        }
    }

    /// Best-effort text decoding of a string region. A trailing terminator
    /// unit is excluded.
    pub fn to_text(&self) -> Result<String> {
        let ty = self.ty();
        let (unit, policy) = match ty.kind() {
            TyKind::Str { unit, policy } => (*unit, *policy),
            _ => return Err(self.not_supported("text access")),
        };
        let raw = match &self.borrow().payload {
            Payload::Bytes(raw) => raw.clone(),
            _ => return Err(self.not_supported("text access")),
        };
        let order = self.byteorder();

        let ub = unit.bytes();
        let body = match policy {
            StrPolicy::Terminated { terminator }
                if raw.len() >= ub
                    && atom::decode_uint(&raw[raw.len() - ub..], order) as u32 == terminator =>
            {
                &raw[..raw.len() - ub]
            }
            _ => &raw[..],
        };
        atom::decode_text(body, unit, order)
    }

    // --- mutation -----------------------------------------------------------

    /// Replaces an integer atom's value in place. Bit-record fields update
    /// their bitmap; byte atoms re-encode their buffer.
    pub fn set_uint(&self, value: u128) -> Result<()> {
        let ty = self.ty();
        let order = self.byteorder();
        match ty.kind() {
            TyKind::Int(spec) | TyKind::Enum(spec, _) => {
                self.replace_raw(atom::encode_uint(value, usize::from(spec.width), order))
            }
            TyKind::Pointer(spec) => {
                self.replace_raw(atom::encode_uint(value, usize::from(spec.stored.width), order))
            }
            TyKind::BitInt { width, .. } => self.replace_bits(Bitmap::new(value, *width)),
            _ => Err(self.not_supported("integer mutation")),
        }
    }

    pub fn set_sint(&self, value: i128) -> Result<()> {
        self.set_uint(value as u128)
    }

    pub fn set_f64(&self, value: f64) -> Result<()> {
        let ty = self.ty();
        let order = self.byteorder();
        match ty.kind() {
            TyKind::Float(spec) => {
                self.replace_raw(atom::encode_uint(spec.encode(value), spec.width_bytes(), order))
            }
            TyKind::Fixed(spec) => self.replace_raw(spec.from_f64(value, order)),
            _ => Err(self.not_supported("float mutation")),
        }
    }

    /// Replaces a block or string leaf's bytes. The region's size follows
    /// the new length; enclosing sizes are not recomputed.
    pub fn set_bytes(&self, bytes: impl Into<Vec<u8>>) -> Result<()> {
        let ty = self.ty();
        if !matches!(ty.kind(), TyKind::Block(_) | TyKind::Str { .. }) {
            return Err(self.not_supported("byte mutation"));
        }
        let bytes = bytes.into();
        let len = bytes.len() as u64;
        let replaced = {
            let mut guard = self.inner.borrow_mut();
            let inner = &mut *guard;
            match &mut inner.payload {
                Payload::Bytes(raw) => {
                    *raw = bytes;
                    inner.size = len;
                    true
                }
                _ => false,
            }
        };
        if replaced {
            Ok(())
        } else {
            Err(self.not_supported("mutation before load"))
        }
    }

    fn replace_raw(&self, bytes: Vec<u8>) -> Result<()> {
        let replaced = {
            let mut inner = self.inner.borrow_mut();
            match &mut inner.payload {
                Payload::Bytes(raw) => {
                    *raw = bytes;
                    true
                }
                Payload::Pointer { raw, target } => {
                    *raw = bytes;
                    // The old target no longer matches the stored value.
                    *target = None;
                    true
                }
                _ => false,
            }
        };
        if replaced {
            Ok(())
        } else {
            Err(self.not_supported("mutation before load"))
        }
    }

    fn replace_bits(&self, bm: Bitmap) -> Result<()> {
        let replaced = {
            let mut inner = self.inner.borrow_mut();
            match &mut inner.payload {
                Payload::Bits(slot) => {
                    *slot = bm;
                    true
                }
                _ => false,
            }
        };
        if replaced {
            Ok(())
        } else {
            Err(self.not_supported("mutation before load"))
        }
    }

    // --- serialization ------------------------------------------------------

    /// The region's bytes, exactly as they would appear in the source.
    /// Partial regions serialize the prefix that did load.
    pub fn serialize(&self) -> Result<Vec<u8>> {
        if self.is_bit_unit() {
            return Err(self.not_supported("byte serialization of a bit-addressed field"));
        }
        let inner = self.borrow();
        match &inner.payload {
            Payload::None => Ok(Vec::new()),
            Payload::Bytes(raw) | Payload::Pointer { raw, .. } | Payload::Encoded { raw, .. } => {
                Ok(raw.clone())
            }
            Payload::Fields(fields) => {
                let mut out = Vec::with_capacity(inner.size as usize);
                for (_, child) in fields {
                    out.extend(child.serialize()?);
                }
                Ok(out)
            }
            Payload::Elems(elems) => {
                let mut out = Vec::with_capacity(inner.size as usize);
                for child in elems {
                    out.extend(child.serialize()?);
                }
                Ok(out)
            }
            Payload::Variant { child, .. } => child.serialize(),
            Payload::BitRoot { raw, fields } => {
                if !inner.state.is_loaded() {
                    // Truncated container: the raw prefix is all we have.
                    return Ok(raw.clone());
                }
                let mut writer = BitWriter::new(inner.bitorder);
                for (_, child) in fields {
                    pack_bits(child, &mut writer)?;
                }
                let mut bytes = writer.finish();
                if inner.byteorder == ByteOrder::Little {
                    bytes.reverse();
                }
                Ok(bytes)
            }
            Payload::Bits(_) => unreachable!("bit leaf in byte context"),
        }
    }

    /// Writes `serialize()` back to the source at this region's offset.
    pub fn commit(&self) -> Result<()> {
        let bytes = self.serialize()?;
        store_at(&self.source(), self.offset(), &bytes)?;
        Ok(())
    }

    /// A deep copy over a private in-memory source, isolated from the
    /// original tree and its source.
    pub fn copy(&self) -> Result<Region> {
        let bytes = self.serialize()?;
        Ok(self.ty().load(MemSource::shared(bytes), 0))
    }

    /// Reinterprets the bytes at this region's offset as another type,
    /// sharing the source and the parent link.
    pub fn cast(&self, ty: &Ty) -> Region {
        let parent = self.parent();
        let node = Region::alloc(ty, self.source(), self.offset(), Unit::Bytes, parent.as_ref());
        load_node(&node);
        node
    }

    // --- pointers -------------------------------------------------------------

    /// The integer a pointer stores, sign-extended when declared signed.
    pub fn stored(&self) -> Result<i128> {
        let inner = self.borrow();
        match (&inner.ty.inner.kind, &inner.payload) {
            (TyKind::Pointer(spec), Payload::Pointer { raw, .. }) => {
                if spec.stored.signed {
                    Ok(atom::decode_sint(raw, inner.byteorder))
                } else {
                    Ok(atom::decode_uint(raw, inner.byteorder) as i128)
                }
            }
            _ => Err(self.not_supported("pointer access")),
        }
    }

    /// The flag bits of a masked pointer (zero when unmasked).
    pub fn flag(&self) -> Result<u64> {
        let spec = match &self.borrow().ty.inner.kind {
            TyKind::Pointer(spec) => Rc::clone(spec),
            _ => return Err(self.not_supported("pointer access")),
        };
        let stored = self.stored()? as u64;
        Ok(spec.mask.map_or(0, |m| m.split(stored).1))
    }

    /// Dereferences a pointer, loading and caching its target on first
    /// call. A stored zero is a [`Error::NullPointer`], recoverable by the
    /// caller. Repeated calls return the same child.
    pub fn deref(&self) -> Result<Region> {
        let spec = match &self.borrow().ty.inner.kind {
            TyKind::Pointer(spec) => Rc::clone(spec),
            _ => return Err(self.not_supported("dereference")),
        };
        if let Payload::Pointer {
            target: Some(cached),
            ..
        } = &self.borrow().payload
        {
            return Ok(cached.clone());
        }

        let stored = self.stored()?;
        if stored == 0 {
            return Err(Error::NullPointer {
                offset: self.offset(),
            });
        }
        let (offset_part, flag) = match spec.mask {
            Some(mask) => {
                let (off, flag) = mask.split(stored as u64);
                (off as i128, flag)
            }
            None => (stored, 0),
        };

        let (source, target_offset) = crate::pointer::resolve(&spec.resolver, self, offset_part)?;
        let target_ty = (spec.target)(self, flag)?;
        trace!(
            "deref `{}` at 0x{:x}: target `{}` at 0x{target_offset:x}",
            self.name(),
            self.offset(),
            target_ty.name()
        );

        let target = Region::alloc(&target_ty, source, target_offset, Unit::Bytes, Some(self));
        load_node(&target);

        if let Payload::Pointer { target: slot, .. } = &mut self.inner.borrow_mut().payload {
            *slot = Some(target.clone());
        }
        Ok(target)
    }

    // --- encoded regions ----------------------------------------------------

    /// Decodes an encoded region's window and loads the child tree over a
    /// synthetic in-memory source. Cached after the first call.
    pub fn decoded(&self) -> Result<Region> {
        let spec = match &self.borrow().ty.inner.kind {
            TyKind::Encoded(spec) => Rc::clone(spec),
            _ => return Err(self.not_supported("decoding")),
        };
        if let Payload::Encoded {
            child: Some(cached),
            ..
        } = &self.borrow().payload
        {
            return Ok(cached.clone());
        }

        let raw = self.as_bytes()?;
        let plain = spec.codec.decode(&raw)?;
        debug!(
            "decoded `{}`: {} -> {} bytes",
            self.name(),
            raw.len(),
            plain.len()
        );
        let child = Region::alloc(
            &spec.target,
            MemSource::shared(plain),
            0,
            Unit::Bytes,
            Some(self),
        );
        load_node(&child);

        if let Payload::Encoded { child: slot, .. } = &mut self.inner.borrow_mut().payload {
            *slot = Some(child.clone());
        }
        Ok(child)
    }

    /// Re-encodes the (possibly mutated) decoded child and replaces the
    /// opaque window. The new window need not match the old bytes, only
    /// decode to the same plain bytes.
    pub fn reencode(&self) -> Result<()> {
        let spec = match &self.borrow().ty.inner.kind {
            TyKind::Encoded(spec) => Rc::clone(spec),
            _ => return Err(self.not_supported("encoding")),
        };
        let child = self.decoded()?;
        let plain = child.serialize()?;
        let encoded = spec.codec.encode(&plain)?;

        let mut inner = self.inner.borrow_mut();
        inner.size = encoded.len() as u64;
        if let Payload::Encoded { raw, .. } = &mut inner.payload {
            *raw = encoded;
        }
        Ok(())
    }

    /// Checks that re-encoding the decoded window yields a window that
    /// decodes to the same plain bytes (codec losslessness on this input).
    pub fn verify_roundtrip(&self) -> Result<()> {
        let spec = match &self.borrow().ty.inner.kind {
            TyKind::Encoded(spec) => Rc::clone(spec),
            _ => return Err(self.not_supported("encoding")),
        };
        let plain = spec.codec.decode(&self.as_bytes()?)?;
        let again = spec.codec.decode(&spec.codec.encode(&plain)?)?;
        if plain != again {
            return Err(Error::RoundTrip {
                codec: spec.codec.name(),
            });
        }
        Ok(())
    }
}

impl fmt::Display for Region {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.borrow();
        let unit = match inner.unit {
            Unit::Bytes => "",
            Unit::Bits => " bits",
        };
        write!(
            f,
            "{} {{ {}, offset: 0x{:x}, size: {}{unit} }}",
            inner.ty.name(),
            inner.state,
            inner.offset,
            inner.size
        )
    }
}

impl fmt::Debug for Region {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

// ---------------------------------------------------------------------------
// Loader
// ---------------------------------------------------------------------------

fn load_node(node: &Region) {
    let ty = node.ty();
    match ty.kind() {
        TyKind::Int(spec) => load_leaf(node, u64::from(spec.width)),
        TyKind::Enum(spec, _) => load_leaf(node, u64::from(spec.width)),
        TyKind::Float(spec) => load_leaf(node, spec.width_bytes() as u64),
        TyKind::Fixed(spec) => load_leaf(node, u64::from(spec.total_bytes)),
        TyKind::Str { unit, policy } => load_str(node, *unit, *policy),
        TyKind::Block(len) => match len.resolve(node) {
            Ok(n) => load_leaf(node, n),
            Err(e) => node.finish(LoadState::Failed(Rc::new(e)), 0, Payload::None),
        },
        TyKind::Record(spec) => load_record(node, &spec.fields.clone()),
        TyKind::Array(spec) => load_array(node, &Rc::clone(spec)),
        TyKind::BitRecord(spec) => load_bit_container(node, &Rc::clone(spec)),
        TyKind::Pointer(spec) => load_pointer(node, u64::from(spec.stored.width)),
        TyKind::Encoded(spec) => load_encoded(node, &spec.window.clone()),
        TyKind::Union(spec) => load_union(node, &Rc::clone(spec)),
        // Bit-unit kinds are instantiated by the bit-container loader only.
        TyKind::BitInt { .. } | TyKind::BitArray { .. } => node.finish(
            LoadState::Failed(Rc::new(node.not_supported("loading outside a bit record"))),
            0,
            Payload::None,
        ),
    }
}

/// Fixed-size leaf: keep whatever prefix the source yields; a short prefix
/// is a partial load annotated with the exact shortfall.
fn load_leaf(node: &Region, wanted: u64) {
    let offset = node.offset();
    match read_at(&node.source(), offset, wanted as usize) {
        Ok(bytes) => {
            let got = bytes.len() as u64;
            if got < wanted {
                node.finish(
                    LoadState::Partial(Rc::new(Error::ShortRead {
                        offset,
                        wanted,
                        got,
                    })),
                    got,
                    Payload::Bytes(bytes),
                );
            } else {
                node.finish(LoadState::Loaded, wanted, Payload::Bytes(bytes));
            }
        }
        Err(e) => node.finish(LoadState::Failed(Rc::new(e)), 0, Payload::None),
    }
}

fn load_str(node: &Region, unit: CharUnit, policy: StrPolicy) {
    match policy {
        StrPolicy::Units(n) => load_leaf(node, n * unit.bytes() as u64),
        StrPolicy::Terminated { terminator } => {
            let ub = unit.bytes();
            let source = node.source();
            let order = node.byteorder();
            let mut raw = Vec::new();
            let mut cur = node.offset();
            loop {
                let chunk = match read_at(&source, cur, ub) {
                    Ok(chunk) => chunk,
                    Err(e) => {
                        return node.finish(LoadState::Failed(Rc::new(e)), 0, Payload::None)
                    }
                };
                if chunk.len() < ub {
                    let got = chunk.len() as u64;
                    raw.extend(chunk);
                    let size = raw.len() as u64;
                    return node.finish(
                        LoadState::Partial(Rc::new(Error::ShortRead {
                            offset: cur,
                            wanted: ub as u64,
                            got,
                        })),
                        size,
                        Payload::Bytes(raw),
                    );
                }
                let value = atom::decode_uint(&chunk, order) as u32;
                raw.extend(chunk);
                cur += ub as u64;
                if value == terminator {
                    let size = raw.len() as u64;
                    return node.finish(LoadState::Loaded, size, Payload::Bytes(raw));
                }
            }
        }
    }
}

fn load_record(node: &Region, fields: &[crate::ty::Field]) {
    node.finish(LoadState::Uninitialized, 0, Payload::Fields(Vec::new()));
    let mut cur = node.offset();
    let mut partial: Option<Rc<Error>> = None;

    for field in fields {
        let ty = match &field.ty {
            FieldTy::Fixed(ty) => ty.clone(),
            FieldTy::Late(producer) => match producer(node) {
                Ok(ty) => ty,
                Err(e) => {
                    partial = Some(Rc::new(Error::at(field.name.clone(), Rc::new(e))));
                    break;
                }
            },
        };
        let child = Region::alloc(&ty, node.source(), cur, Unit::Bytes, Some(node));
        push_field(node, field.name.clone(), child.clone());
        load_node(&child);

        match child.state() {
            LoadState::Loaded => cur += child.size(),
            LoadState::Partial(e) => {
                cur += child.size();
                partial = Some(Rc::new(Error::at(field.name.clone(), e)));
                break;
            }
            LoadState::Failed(e) => {
                partial = Some(Rc::new(Error::at(field.name.clone(), e)));
                break;
            }
            LoadState::Uninitialized => unreachable!(),
        }
    }

    let size = cur - node.offset();
    let state = match partial {
        Some(e) => LoadState::Partial(e),
        None => LoadState::Loaded,
    };
    set_state_size(node, state, size);
}

fn push_field(node: &Region, name: Cow<'static, str>, child: Region) {
    if let Payload::Fields(fields) | Payload::BitRoot { fields, .. } =
        &mut node.inner.borrow_mut().payload
    {
        fields.push((name, child));
    }
}

fn push_elem(node: &Region, child: Region) {
    if let Payload::Elems(elems) = &mut node.inner.borrow_mut().payload {
        elems.push(child);
    }
}

fn set_state_size(node: &Region, state: LoadState, size: u64) {
    let mut inner = node.inner.borrow_mut();
    inner.state = state;
    inner.size = size;
}

/// True when a load stopped because the source ran out exactly at an
/// element boundary; infinite arrays treat this as a clean end.
fn is_clean_end(region: &Region) -> bool {
    if region.size() != 0 {
        return false;
    }
    match region.state() {
        LoadState::Loaded => true,
        LoadState::Partial(e) => {
            matches!(e.root_cause(), Error::ShortRead { got: 0, .. })
        }
        _ => false,
    }
}

fn load_array(node: &Region, spec: &Rc<crate::ty::ArraySpec>) {
    node.finish(LoadState::Uninitialized, 0, Payload::Elems(Vec::new()));
    let mut cur = node.offset();
    let mut state = LoadState::Loaded;

    let at_index = |i: usize, e: Rc<Error>| Rc::new(Error::at(format!("[{i}]"), e));

    match &spec.policy {
        ArrayPolicy::Count(len) => {
            let count = match len.resolve(node) {
                Ok(n) => n,
                Err(e) => return set_state_size(node, LoadState::Failed(Rc::new(e)), 0),
            };
            for i in 0..count {
                let elem = Region::alloc(&spec.elem, node.source(), cur, Unit::Bytes, Some(node));
                push_elem(node, elem.clone());
                load_node(&elem);
                cur += elem.size();
                match elem.state() {
                    LoadState::Loaded => {}
                    LoadState::Partial(e) | LoadState::Failed(e) => {
                        state = LoadState::Partial(at_index(i as usize, e));
                        break;
                    }
                    LoadState::Uninitialized => unreachable!(),
                }
            }
        }
        ArrayPolicy::Block(len) => {
            let budget = match len.resolve(node) {
                Ok(n) => n,
                Err(e) => return set_state_size(node, LoadState::Failed(Rc::new(e)), 0),
            };
            let mut consumed = 0u64;
            let mut i = 0usize;
            while consumed < budget {
                let elem = Region::alloc(&spec.elem, node.source(), cur, Unit::Bytes, Some(node));
                push_elem(node, elem.clone());
                load_node(&elem);
                cur += elem.size();
                consumed += elem.size();
                match elem.state() {
                    LoadState::Loaded => {
                        if consumed > budget {
                            state = LoadState::Partial(Rc::new(Error::Overshoot {
                                budget,
                                excess: consumed - budget,
                            }));
                            break;
                        }
                        if elem.size() == 0 {
                            state = LoadState::Partial(Rc::new(Error::Undershoot {
                                budget,
                                loaded: consumed,
                            }));
                            break;
                        }
                    }
                    LoadState::Partial(e) | LoadState::Failed(e) => {
                        // A short read inside the budget is an unfilled
                        // budget, not just a truncated element.
                        let cause = if e.is_short_read() {
                            Rc::new(Error::Undershoot {
                                budget,
                                loaded: consumed,
                            })
                        } else {
                            e
                        };
                        state = LoadState::Partial(at_index(i, cause));
                        break;
                    }
                    LoadState::Uninitialized => unreachable!(),
                }
                i += 1;
            }
        }
        ArrayPolicy::Terminated(pred) => {
            let mut i = 0usize;
            loop {
                let elem = Region::alloc(&spec.elem, node.source(), cur, Unit::Bytes, Some(node));
                push_elem(node, elem.clone());
                load_node(&elem);
                cur += elem.size();
                match elem.state() {
                    LoadState::Loaded => {
                        if pred(&elem) {
                            break;
                        }
                        // A zero-size non-terminator makes no progress and
                        // would loop forever.
                        if elem.size() == 0 {
                            state = LoadState::Partial(at_index(
                                i,
                                Rc::new(Error::NotSupported {
                                    ty: elem.name(),
                                    op: "zero-size elements before the terminator",
                                }),
                            ));
                            break;
                        }
                    }
                    LoadState::Partial(e) | LoadState::Failed(e) => {
                        state = LoadState::Partial(at_index(i, e));
                        break;
                    }
                    LoadState::Uninitialized => unreachable!(),
                }
                i += 1;
            }
        }
        ArrayPolicy::Infinite => {
            let mut i = 0usize;
            loop {
                let elem = Region::alloc(&spec.elem, node.source(), cur, Unit::Bytes, Some(node));
                load_node(&elem);
                if is_clean_end(&elem) {
                    break;
                }
                push_elem(node, elem.clone());
                cur += elem.size();
                match elem.state() {
                    LoadState::Loaded => {}
                    LoadState::Partial(e) | LoadState::Failed(e) => {
                        state = LoadState::Partial(at_index(i, e));
                        break;
                    }
                    LoadState::Uninitialized => unreachable!(),
                }
                i += 1;
            }
        }
    }

    set_state_size(node, state, cur - node.offset());
}

fn load_pointer(node: &Region, width: u64) {
    let offset = node.offset();
    match read_at(&node.source(), offset, width as usize) {
        Ok(bytes) => {
            let got = bytes.len() as u64;
            let payload = Payload::Pointer {
                raw: bytes,
                target: None,
            };
            if got < width {
                node.finish(
                    LoadState::Partial(Rc::new(Error::ShortRead {
                        offset,
                        wanted: width,
                        got,
                    })),
                    got,
                    payload,
                );
            } else {
                node.finish(LoadState::Loaded, width, payload);
            }
        }
        Err(e) => node.finish(LoadState::Failed(Rc::new(e)), 0, Payload::None),
    }
}

fn load_encoded(node: &Region, window: &LenSpec) {
    let wanted = match window.resolve(node) {
        Ok(n) => n,
        Err(e) => return node.finish(LoadState::Failed(Rc::new(e)), 0, Payload::None),
    };
    let offset = node.offset();
    match read_at(&node.source(), offset, wanted as usize) {
        Ok(bytes) => {
            let got = bytes.len() as u64;
            let payload = Payload::Encoded {
                raw: bytes,
                child: None,
            };
            if got < wanted {
                node.finish(
                    LoadState::Partial(Rc::new(Error::ShortRead {
                        offset,
                        wanted,
                        got,
                    })),
                    got,
                    payload,
                );
            } else {
                node.finish(LoadState::Loaded, wanted, payload);
            }
        }
        Err(e) => node.finish(LoadState::Failed(Rc::new(e)), 0, Payload::None),
    }
}

fn load_union(node: &Region, spec: &Rc<crate::ty::UnionSpec>) {
    let (key, expected_size) = match (spec.discr)(node) {
        Ok(pair) => pair,
        Err(e) => return node.finish(LoadState::Failed(Rc::new(e)), 0, Payload::None),
    };
    let ty = match spec.registry.lookup(&key, expected_size) {
        Ok(ty) => ty,
        Err(e) => return node.finish(LoadState::Failed(Rc::new(e)), 0, Payload::None),
    };
    trace!("union `{}` key {key} -> `{}`", node.name(), ty.name());

    let child = Region::alloc(&ty, node.source(), node.offset(), Unit::Bytes, Some(node));
    node.finish(
        LoadState::Uninitialized,
        0,
        Payload::Variant {
            key: key.to_string(),
            child: child.clone(),
        },
    );
    load_node(&child);

    let state = match child.state() {
        LoadState::Loaded => LoadState::Loaded,
        LoadState::Partial(e) | LoadState::Failed(e) => {
            LoadState::Partial(Rc::new(Error::at(key.to_string(), e)))
        }
        LoadState::Uninitialized => unreachable!(),
    };
    set_state_size(node, state, child.size());
}

// ---------------------------------------------------------------------------
// Bit containers
// ---------------------------------------------------------------------------

fn load_bit_container(node: &Region, spec: &Rc<crate::bits::BitRecordSpec>) {
    let total_bits = spec.total_bits();
    if total_bits % 8 != 0 {
        return node.finish(
            LoadState::Failed(Rc::new(Error::Misaligned { bits: total_bits })),
            0,
            Payload::None,
        );
    }
    let wanted = total_bits / 8;
    let offset = node.offset();
    let raw = match read_at(&node.source(), offset, wanted as usize) {
        Ok(bytes) => bytes,
        Err(e) => return node.finish(LoadState::Failed(Rc::new(e)), 0, Payload::None),
    };
    let got = raw.len() as u64;

    // Little-endian bit containers consume their bytes end to end reversed,
    // so the first declared field comes from the last stored byte.
    let mut stream = raw.clone();
    if node.byteorder() == ByteOrder::Little {
        stream.reverse();
    }

    node.finish(
        LoadState::Uninitialized,
        got,
        Payload::BitRoot {
            raw,
            fields: Vec::new(),
        },
    );

    let mut reader = BitReader::new(&stream, node.bitorder());
    let base_bits = offset * 8;
    let ran_dry = load_bit_fields(node, &spec.fields, &mut reader, base_bits);

    let state = if got < wanted || ran_dry {
        LoadState::Partial(Rc::new(Error::ShortRead {
            offset,
            wanted,
            got,
        }))
    } else {
        LoadState::Loaded
    };
    set_state_size(node, state, got);
}

/// Loads one level of bit fields into `parent`. Returns true when the
/// reader ran out of bits before every field was placed.
fn load_bit_fields(
    parent: &Region,
    fields: &[BitField],
    reader: &mut BitReader<'_>,
    base_bits: u64,
) -> bool {
    for field in fields {
        match load_bit_value(parent, &field.kind, reader, base_bits) {
            Some(child) => push_field(parent, field.name.clone(), child),
            None => return true,
        }
    }
    false
}

fn load_bit_value(
    parent: &Region,
    kind: &BitFieldKind,
    reader: &mut BitReader<'_>,
    base_bits: u64,
) -> Option<Region> {
    let bit_offset = base_bits + reader.position();
    match kind {
        BitFieldKind::Bits(width) | BitFieldKind::SignedBits(width) => {
            let bm = reader.take(*width)?;
            let signed = matches!(kind, BitFieldKind::SignedBits(_));
            let child = Region::alloc(
                &bits::bit_int_ty(*width, signed),
                parent.source(),
                bit_offset,
                Unit::Bits,
                Some(parent),
            );
            child.finish(LoadState::Loaded, u64::from(*width), Payload::Bits(bm));
            Some(child)
        }
        BitFieldKind::Nested(ty) => {
            let nested = match ty.kind() {
                TyKind::BitRecord(spec) => Rc::clone(spec),
                _ => return None,
            };
            let child = Region::alloc(ty, parent.source(), bit_offset, Unit::Bits, Some(parent));
            child.finish(
                LoadState::Uninitialized,
                nested.total_bits(),
                Payload::Fields(Vec::new()),
            );
            let ran_dry = load_bit_fields(&child, &nested.fields, reader, base_bits);
            let consumed = base_bits + reader.position() - bit_offset;
            let state = if ran_dry {
                LoadState::Partial(Rc::new(Error::ShortRead {
                    offset: bit_offset,
                    wanted: nested.total_bits(),
                    got: consumed,
                }))
            } else {
                LoadState::Loaded
            };
            set_state_size(&child, state, consumed);
            if ran_dry {
                None
            } else {
                Some(child)
            }
        }
        BitFieldKind::Array { elem, count } => {
            let child = Region::alloc(
                &bits::bit_array_ty(elem, *count),
                parent.source(),
                bit_offset,
                Unit::Bits,
                Some(parent),
            );
            child.finish(LoadState::Uninitialized, 0, Payload::Elems(Vec::new()));
            for _ in 0..*count {
                match load_bit_value(&child, elem, reader, base_bits) {
                    Some(e) => push_elem(&child, e),
                    None => return None,
                }
            }
            let consumed = base_bits + reader.position() - bit_offset;
            set_state_size(&child, LoadState::Loaded, consumed);
            Some(child)
        }
    }
}

fn pack_bits(region: &Region, writer: &mut BitWriter) -> Result<()> {
    let inner = region.borrow();
    match &inner.payload {
        Payload::Bits(bm) => {
            writer.put(*bm);
            Ok(())
        }
        Payload::Fields(fields) => {
            for (_, child) in fields {
                pack_bits(child, writer)?;
            }
            Ok(())
        }
        Payload::Elems(elems) => {
            for child in elems {
                pack_bits(child, writer)?;
            }
            Ok(())
        }
        _ => Err(Error::NotSupported {
            ty: inner.ty.name().to_owned(),
            op: "bit packing",
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ty::Field;
    use pretty_assertions::assert_eq;

    fn pair() -> Ty {
        Ty::record(
            "pair",
            vec![Field::new("a", Ty::u16()), Field::new("b", Ty::u16())],
        )
        .unwrap()
    }

    #[test]
    fn test_record_loads_in_declaration_order() {
        crate::ensure_env_logger_initialized();
        let r = pair().parse(vec![0x34, 0x12, 0x78, 0x56]);
        assert!(r.state().is_loaded());
        assert_eq!(r.field("a").unwrap().as_u64().unwrap(), 0x1234);
        assert_eq!(r.field("b").unwrap().as_u64().unwrap(), 0x5678);
        assert_eq!(r.size(), 4);
        assert_eq!(r.serialize().unwrap(), vec![0x34, 0x12, 0x78, 0x56]);
    }

    #[test]
    fn test_late_field_sees_loaded_prefix() {
        let rec = Ty::record(
            "sized",
            vec![
                Field::new("len", Ty::u8()),
                Field::late("data", |r| Ok(Ty::block(r.field("len")?.as_u64()?))),
            ],
        )
        .unwrap();
        let r = rec.parse(vec![3, 0xaa, 0xbb, 0xcc, 0xdd]);
        assert!(r.state().is_loaded());
        assert_eq!(r.size(), 4);
        assert_eq!(
            r.field("data").unwrap().as_bytes().unwrap(),
            vec![0xaa, 0xbb, 0xcc]
        );
    }

    #[test]
    fn test_truncated_record_is_partial_and_serializes_prefix() {
        crate::ensure_env_logger_initialized();
        let rec = Ty::record(
            "five",
            vec![
                Field::new("a", Ty::u32()),
                Field::new("b", Ty::u32()),
                Field::new("c", Ty::u32()),
                Field::new("d", Ty::u32()),
                Field::new("e", Ty::u32()),
            ],
        )
        .unwrap();
        let input: Vec<u8> = (1..=10).collect();
        let r = rec.parse(input.clone());

        assert!(r.state().is_partial());
        assert_eq!(r.field("a").unwrap().as_u64().unwrap(), 0x04030201);
        assert_eq!(r.field("b").unwrap().as_u64().unwrap(), 0x08070605);
        // Third field loaded a 2-byte prefix; fourth and fifth not attempted.
        assert!(r.field("c").unwrap().state().is_partial());
        assert!(r.field("d").is_err());
        let err = r.state().error().unwrap().clone();
        assert!(matches!(
            err.root_cause(),
            Error::ShortRead {
                offset: 8,
                wanted: 4,
                got: 2
            }
        ));
        assert_eq!(r.size(), 10);
        assert_eq!(r.serialize().unwrap(), input);
    }

    #[test]
    fn test_terminated_string_stops_at_terminator() {
        let r = Ty::str_terminated(CharUnit::One).parse(vec![0x48, 0x69, 0x00, 0xff]);
        assert!(r.state().is_loaded());
        assert_eq!(r.size(), 3);
        assert_eq!(r.to_text().unwrap(), "Hi");
        assert_eq!(r.serialize().unwrap(), vec![0x48, 0x69, 0x00]);
    }

    #[test]
    fn test_counted_array() {
        let r = Ty::array(Ty::u16(), 3).parse(vec![1, 0, 2, 0, 3, 0]);
        assert!(r.state().is_loaded());
        assert_eq!(r.len(), 3);
        assert_eq!(r.index(2).unwrap().as_u64().unwrap(), 3);
        assert!(r.index(3).is_err());
    }

    #[test]
    fn test_infinite_array_ends_cleanly_at_source_end() {
        let r = Ty::infinite_array(Ty::u16()).parse(vec![1, 0, 2, 0]);
        assert!(r.state().is_loaded());
        assert_eq!(r.len(), 2);
    }

    #[test]
    fn test_infinite_array_truncated_element_is_partial() {
        let r = Ty::infinite_array(Ty::u16()).parse(vec![1, 0, 2]);
        assert!(r.state().is_partial());
        assert_eq!(r.len(), 2);
        assert_eq!(r.serialize().unwrap(), vec![1, 0, 2]);
    }

    #[test]
    fn test_block_array_overshoot() {
        // 3-byte elements cannot exactly fill a 7-byte budget.
        let r = Ty::block_array(Ty::block(3), 7).parse(vec![0; 12]);
        assert!(r.state().is_partial());
        assert!(matches!(
            r.state().error().unwrap().root_cause(),
            Error::Overshoot { budget: 7, excess: 2 }
        ));
    }

    #[test]
    fn test_block_array_undershoot_on_truncated_input() {
        // Five bytes of supply cannot fill a 7-byte budget.
        let r = Ty::block_array(Ty::u8(), 7).parse(vec![1, 2, 3, 4, 5]);
        assert!(r.state().is_partial());
        assert!(matches!(
            r.state().error().unwrap().root_cause(),
            Error::Undershoot { budget: 7, loaded: 5 }
        ));
        assert_eq!(r.serialize().unwrap(), vec![1, 2, 3, 4, 5]);
    }

    #[test]
    fn test_terminated_array_includes_terminator() {
        let r = Ty::terminated_array(Ty::u8(), |e| e.as_u64().map(|v| v == 0).unwrap_or(false))
            .parse(vec![5, 6, 0, 9]);
        assert!(r.state().is_loaded());
        assert_eq!(r.len(), 3);
        assert_eq!(r.size(), 3);
    }

    #[test]
    fn test_terminated_array_stops_on_zero_size_elements() {
        let r = Ty::terminated_array(Ty::block(0), |_| false).parse(vec![1, 2]);
        assert!(r.state().is_partial());
        assert!(matches!(
            r.state().error().unwrap().root_cause(),
            Error::NotSupported { .. }
        ));
        assert_eq!(r.len(), 1);
    }

    #[test]
    fn test_bit_record_msb_and_lsb() {
        let rec = || {
            Ty::bit_record(
                "flags",
                vec![
                    BitField::bits("a", 1),
                    BitField::bits("b", 3),
                    BitField::bits("c", 4),
                ],
            )
            .unwrap()
        };

        let r = rec().with_bitorder(BitOrder::MsbFirst).parse(vec![0b1010_0110]);
        assert_eq!(r.field("a").unwrap().as_u64().unwrap(), 1);
        assert_eq!(r.field("b").unwrap().as_u64().unwrap(), 2);
        assert_eq!(r.field("c").unwrap().as_u64().unwrap(), 6);
        assert_eq!(r.serialize().unwrap(), vec![0b1010_0110]);

        let r = rec().with_bitorder(BitOrder::LsbFirst).parse(vec![0b1010_0110]);
        assert_eq!(r.field("a").unwrap().as_u64().unwrap(), 0);
        assert_eq!(r.field("b").unwrap().as_u64().unwrap(), 3);
        assert_eq!(r.field("c").unwrap().as_u64().unwrap(), 10);
        assert_eq!(r.serialize().unwrap(), vec![0b1010_0110]);
    }

    #[test]
    fn test_bit_record_little_endian_reverses_bytes() {
        let rec = Ty::bit_record(
            "wide",
            vec![BitField::bits("hi", 4), BitField::bits("rest", 12)],
        )
        .unwrap()
        .with_byteorder(ByteOrder::Little);
        let r = rec.parse(vec![0x34, 0xf2]);
        // Stream is 0xf2 0x34 after the little-endian reversal.
        assert_eq!(r.field("hi").unwrap().as_u64().unwrap(), 0xf);
        assert_eq!(r.field("rest").unwrap().as_u64().unwrap(), 0x234);
        assert_eq!(r.serialize().unwrap(), vec![0x34, 0xf2]);
    }

    #[test]
    fn test_misaligned_bit_record_fails() {
        let rec = Ty::bit_record("odd", vec![BitField::bits("a", 3)]).unwrap();
        let r = rec.parse(vec![0xff]);
        assert!(r.state().is_failed());
        assert!(matches!(
            r.state().error().unwrap().root_cause(),
            Error::Misaligned { bits: 3 }
        ));
    }

    #[test]
    fn test_mutation_and_commit_write_back() {
        let src = MemSource::shared(vec![0x34, 0x12, 0x78, 0x56]);
        let r = pair().load(Rc::clone(&src), 0);
        r.field("b").unwrap().set_uint(0xbeef).unwrap();
        r.commit().unwrap();
        assert_eq!(read_at(&src, 0, 4).unwrap(), vec![0x34, 0x12, 0xef, 0xbe]);
    }

    #[test]
    fn test_copy_is_isolated_from_the_original() {
        let r = pair().parse(vec![0x34, 0x12, 0x78, 0x56]);
        let clone = r.copy().unwrap();
        clone.field("a").unwrap().set_uint(0).unwrap();
        assert_eq!(r.field("a").unwrap().as_u64().unwrap(), 0x1234);
        assert!(clone.parent().is_none());
    }

    #[test]
    fn test_cast_reinterprets_in_place() {
        let r = Ty::block(4).parse(vec![0x34, 0x12, 0x78, 0x56]);
        let as_pair = r.cast(&pair());
        assert_eq!(as_pair.field("a").unwrap().as_u64().unwrap(), 0x1234);
    }

    #[test]
    fn test_align_pads_to_boundary() {
        let rec = Ty::record(
            "aligned",
            vec![
                Field::new("tag", Ty::u8()),
                Field::new("pad", Ty::align(4)),
                Field::new("value", Ty::u32()),
            ],
        )
        .unwrap();
        let input = vec![0x01, 0, 0, 0, 0x78, 0x56, 0x34, 0x12];
        let r = rec.parse(input.clone());

        assert!(r.state().is_loaded());
        assert_eq!(r.field("pad").unwrap().size(), 3);
        assert_eq!(r.field("value").unwrap().offset(), 4);
        assert_eq!(r.field("value").unwrap().as_u64().unwrap(), 0x12345678);
        assert_eq!(r.serialize().unwrap(), input);
    }

    #[test]
    fn test_enum_atom_names_its_value() {
        let machine = Ty::enumeration("machine", 2, &[("i386", 0x14c), ("amd64", 0x8664)]);
        let r = machine.parse(vec![0x64, 0x86]);
        assert_eq!(r.enum_name().unwrap(), Some("amd64"));
        assert_eq!(r.as_u64().unwrap(), 0x8664);

        r.set_uint(0x14c).unwrap();
        assert_eq!(r.enum_name().unwrap(), Some("i386"));
        assert_eq!(r.serialize().unwrap(), vec![0x4c, 0x01]);
    }

    #[test]
    fn test_alloc_set_serialize() {
        let r = pair().alloc().unwrap();
        r.field("a").unwrap().set_uint(0x0102).unwrap();
        r.field("b").unwrap().set_uint(0x0304).unwrap();
        assert_eq!(r.serialize().unwrap(), vec![0x02, 0x01, 0x04, 0x03]);
    }
}
