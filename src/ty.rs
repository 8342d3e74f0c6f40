//! First-class type descriptors.
//!
//! A [`Ty`] is an immutable, cheaply clonable description of how to decode
//! a region: schemas are built by composing `Ty` values, and late-bound
//! pieces (field types that depend on earlier fields, content-driven
//! lengths, union discriminators, pointer targets) are closures over the
//! partially loaded tree.

use std::borrow::Cow;
use std::rc::Rc;

use crate::atom::{CharUnit, EnumNames, FixedSpec, FloatSpec, IntSpec, StrPolicy};
use crate::bits::{BitField, BitFieldKind, BitRecordSpec};
use crate::encoded::Codec;
use crate::err::{Error, Result};
use crate::order::{BitOrder, ByteOrder};
use crate::pointer::{PtrMask, Resolver};
use crate::region::Region;
use crate::registry::{Key, Registry};
use crate::source::{MemSource, SharedSource};

/// Produces the concrete type of a late-bound field, given the partially
/// loaded record.
pub(crate) type LateTy = Rc<dyn Fn(&Region) -> Result<Ty>>;
/// Produces a content-dependent length, given the region being sized.
pub(crate) type LateLen = Rc<dyn Fn(&Region) -> Result<u64>>;
/// Per-element terminator predicate for terminated arrays.
pub(crate) type TerminatorFn = Rc<dyn Fn(&Region) -> bool>;
/// Reads the discriminator for a union, given the union region (siblings
/// are reachable through `parent()`). Returns the key and an optional
/// expected size for the registry default.
pub(crate) type DiscriminatorFn = Rc<dyn Fn(&Region) -> Result<(Key, Option<u64>)>>;
/// Produces a pointer's target type, given the pointer region and the
/// decoded flag bits (zero for unmasked pointers).
pub(crate) type TargetFn = Rc<dyn Fn(&Region, u64) -> Result<Ty>>;

/// A declared length: constant, alignment padding, or computed from the
/// loaded tree.
#[derive(Clone)]
pub(crate) enum LenSpec {
    Const(u64),
    /// Pad to the next multiple of `n` bytes from the region's own offset.
    Align(u64),
    Late(LateLen),
}

impl LenSpec {
    pub(crate) fn resolve(&self, node: &Region) -> Result<u64> {
        match self {
            LenSpec::Const(n) => Ok(*n),
            LenSpec::Align(n) => {
                let off = node.offset();
                Ok((n - off % n) % n)
            }
            LenSpec::Late(f) => f(node),
        }
    }

    fn fixed(&self) -> Option<u64> {
        match self {
            LenSpec::Const(n) => Some(*n),
            _ => None,
        }
    }
}

/// One record field: a name plus either a concrete type or a producer that
/// sees the fields loaded so far.
#[derive(Clone)]
pub struct Field {
    pub(crate) name: Cow<'static, str>,
    pub(crate) ty: FieldTy,
}

#[derive(Clone)]
pub(crate) enum FieldTy {
    Fixed(Ty),
    Late(LateTy),
}

impl Field {
    pub fn new(name: impl Into<Cow<'static, str>>, ty: Ty) -> Field {
        Field {
            name: name.into(),
            ty: FieldTy::Fixed(ty),
        }
    }

    /// A late-bound field. The producer runs when all earlier fields have
    /// loaded and receives the partial record.
    pub fn late(
        name: impl Into<Cow<'static, str>>,
        producer: impl Fn(&Region) -> Result<Ty> + 'static,
    ) -> Field {
        Field {
            name: name.into(),
            ty: FieldTy::Late(Rc::new(producer)),
        }
    }
}

pub(crate) struct RecordSpec {
    pub(crate) fields: Vec<Field>,
}

pub(crate) struct ArraySpec {
    pub(crate) elem: Ty,
    pub(crate) policy: ArrayPolicy,
}

#[derive(Clone)]
pub(crate) enum ArrayPolicy {
    /// Exactly this many elements.
    Count(LenSpec),
    /// Elements until a byte budget is exhausted; exact fit required.
    Block(LenSpec),
    /// Elements until the predicate matches; the terminator is included.
    Terminated(TerminatorFn),
    /// Elements until the source runs out.
    Infinite,
}

pub(crate) struct PointerSpec {
    pub(crate) stored: IntSpec,
    pub(crate) resolver: Resolver,
    pub(crate) mask: Option<PtrMask>,
    pub(crate) target: TargetFn,
}

pub(crate) struct EncodedSpec {
    pub(crate) window: LenSpec,
    pub(crate) codec: Rc<dyn Codec>,
    pub(crate) target: Ty,
}

pub(crate) struct UnionSpec {
    pub(crate) registry: Registry,
    pub(crate) discr: DiscriminatorFn,
}

pub(crate) enum TyKind {
    Int(IntSpec),
    Enum(IntSpec, Rc<EnumNames>),
    Float(FloatSpec),
    Fixed(FixedSpec),
    Str { unit: CharUnit, policy: StrPolicy },
    Block(LenSpec),
    Record(Rc<RecordSpec>),
    Array(Rc<ArraySpec>),
    BitRecord(Rc<BitRecordSpec>),
    /// A bit-addressed integer leaf. Built internally by the bit-record
    /// loader; never declared directly.
    BitInt { width: u32, signed: bool },
    /// A bit-addressed fixed-count array, likewise internal.
    BitArray { elem: Rc<BitFieldKind>, count: u64 },
    Pointer(Rc<PointerSpec>),
    Encoded(Rc<EncodedSpec>),
    Union(Rc<UnionSpec>),
}

pub(crate) struct TyInner {
    pub(crate) name: Cow<'static, str>,
    pub(crate) byteorder: Option<ByteOrder>,
    pub(crate) bitorder: Option<BitOrder>,
    pub(crate) boundary: bool,
    pub(crate) kind: TyKind,
}

/// A shared, immutable type descriptor. Clones are cheap and share the
/// underlying definition.
#[derive(Clone)]
pub struct Ty {
    pub(crate) inner: Rc<TyInner>,
}

impl Ty {
    pub(crate) fn make_internal(name: impl Into<Cow<'static, str>>, kind: TyKind) -> Ty {
        Ty::make(name, kind)
    }

    fn make(name: impl Into<Cow<'static, str>>, kind: TyKind) -> Ty {
        Ty {
            inner: Rc::new(TyInner {
                name: name.into(),
                byteorder: None,
                bitorder: None,
                boundary: false,
                kind,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub(crate) fn kind(&self) -> &TyKind {
        &self.inner.kind
    }

    // --- integers -----------------------------------------------------

    pub fn uint(width: u8) -> Ty {
        Ty::make(format!("u{}", u32::from(width) * 8), TyKind::Int(IntSpec::new(width, false)))
    }

    pub fn sint(width: u8) -> Ty {
        Ty::make(format!("i{}", u32::from(width) * 8), TyKind::Int(IntSpec::new(width, true)))
    }

    pub fn u8() -> Ty {
        Ty::uint(1)
    }

    pub fn u16() -> Ty {
        Ty::uint(2)
    }

    pub fn u32() -> Ty {
        Ty::uint(4)
    }

    pub fn u64() -> Ty {
        Ty::uint(8)
    }

    pub fn i8() -> Ty {
        Ty::sint(1)
    }

    pub fn i16() -> Ty {
        Ty::sint(2)
    }

    pub fn i32() -> Ty {
        Ty::sint(4)
    }

    pub fn i64() -> Ty {
        Ty::sint(8)
    }

    /// An integer atom with a name table; round-trips through the
    /// underlying integer.
    pub fn enumeration(
        name: impl Into<Cow<'static, str>>,
        width: u8,
        entries: &[(&'static str, u128)],
    ) -> Ty {
        Ty::make(
            name,
            TyKind::Enum(IntSpec::new(width, false), Rc::new(EnumNames::new(entries))),
        )
    }

    // --- floats and fixed-point ----------------------------------------

    pub fn float(sign_bits: u32, exp_bits: u32, mant_bits: u32) -> Ty {
        let spec = FloatSpec::new(sign_bits, exp_bits, mant_bits);
        Ty::make(format!("f{}", spec.width_bytes() * 8), TyKind::Float(spec))
    }

    pub fn f16() -> Ty {
        Ty::float(1, 5, 10)
    }

    pub fn f32() -> Ty {
        Ty::float(1, 8, 23)
    }

    pub fn f64() -> Ty {
        Ty::float(1, 11, 52)
    }

    pub fn fixed_point(total_bytes: u8, frac_bits: u32, signed: bool) -> Ty {
        Ty::make(
            format!("fixed{}.{}", u32::from(total_bytes) * 8 - frac_bits, frac_bits),
            TyKind::Fixed(FixedSpec::new(total_bytes, frac_bits, signed)),
        )
    }

    // --- strings and blocks ---------------------------------------------

    /// Exactly `units` character units.
    pub fn str_fixed(units: u64, unit: CharUnit) -> Ty {
        Ty::make(
            "string",
            TyKind::Str {
                unit,
                policy: StrPolicy::Units(units),
            },
        )
    }

    /// Units until (and including) a zero terminator.
    pub fn str_terminated(unit: CharUnit) -> Ty {
        Ty::str_terminated_by(unit, 0)
    }

    pub fn str_terminated_by(unit: CharUnit, terminator: u32) -> Ty {
        Ty::make(
            "string",
            TyKind::Str {
                unit,
                policy: StrPolicy::Terminated { terminator },
            },
        )
    }

    /// An opaque byte region of constant length.
    pub fn block(len: u64) -> Ty {
        Ty::make("block", TyKind::Block(LenSpec::Const(len)))
    }

    /// An opaque byte region whose length is computed from the loaded tree
    /// (typically a sibling length field, via `parent()`).
    pub fn block_late(len: impl Fn(&Region) -> Result<u64> + 'static) -> Ty {
        Ty::make("block", TyKind::Block(LenSpec::Late(Rc::new(len))))
    }

    /// Padding up to the next `n`-byte boundary from the region's offset.
    pub fn align(n: u64) -> Ty {
        assert!(n > 0, "alignment of zero");
        Ty::make("align", TyKind::Block(LenSpec::Align(n)))
    }

    // --- containers -----------------------------------------------------

    /// An ordered sequence of named fields, loaded in declaration order.
    /// Duplicate field names are a schema bug, caught here.
    pub fn record(name: impl Into<Cow<'static, str>>, fields: Vec<Field>) -> Result<Ty> {
        let name = name.into();
        for (i, field) in fields.iter().enumerate() {
            if fields[..i].iter().any(|f| f.name == field.name) {
                return Err(Error::DuplicateField {
                    record: name.into_owned(),
                    field: field.name.clone().into_owned(),
                });
            }
        }
        Ok(Ty::make(name, TyKind::Record(Rc::new(RecordSpec { fields }))))
    }

    /// A homogeneous array of exactly `count` elements.
    pub fn array(elem: Ty, count: u64) -> Ty {
        let name = format!("{}[{}]", elem.name(), count);
        Ty::make(
            name,
            TyKind::Array(Rc::new(ArraySpec {
                elem,
                policy: ArrayPolicy::Count(LenSpec::Const(count)),
            })),
        )
    }

    /// An array whose element count is computed from the loaded tree.
    pub fn array_late(elem: Ty, count: impl Fn(&Region) -> Result<u64> + 'static) -> Ty {
        let name = format!("{}[]", elem.name());
        Ty::make(
            name,
            TyKind::Array(Rc::new(ArraySpec {
                elem,
                policy: ArrayPolicy::Count(LenSpec::Late(Rc::new(count))),
            })),
        )
    }

    /// Elements until a byte budget is exactly exhausted. Overshoot and
    /// undershoot are load errors.
    pub fn block_array(elem: Ty, budget: u64) -> Ty {
        let name = format!("{}[..{}b]", elem.name(), budget);
        Ty::make(
            name,
            TyKind::Array(Rc::new(ArraySpec {
                elem,
                policy: ArrayPolicy::Block(LenSpec::Const(budget)),
            })),
        )
    }

    pub fn block_array_late(elem: Ty, budget: impl Fn(&Region) -> Result<u64> + 'static) -> Ty {
        let name = format!("{}[..]", elem.name());
        Ty::make(
            name,
            TyKind::Array(Rc::new(ArraySpec {
                elem,
                policy: ArrayPolicy::Block(LenSpec::Late(Rc::new(budget))),
            })),
        )
    }

    /// Elements until the predicate matches one; the terminator element is
    /// included in the array.
    pub fn terminated_array(elem: Ty, terminator: impl Fn(&Region) -> bool + 'static) -> Ty {
        let name = format!("{}[~]", elem.name());
        Ty::make(
            name,
            TyKind::Array(Rc::new(ArraySpec {
                elem,
                policy: ArrayPolicy::Terminated(Rc::new(terminator)),
            })),
        )
    }

    /// Elements until the source runs out. Only meaningful over bounded
    /// sources.
    pub fn infinite_array(elem: Ty) -> Ty {
        let name = format!("{}[*]", elem.name());
        Ty::make(
            name,
            TyKind::Array(Rc::new(ArraySpec {
                elem,
                policy: ArrayPolicy::Infinite,
            })),
        )
    }

    /// A record addressed in bits. Duplicate field names are caught here,
    /// like byte records.
    pub fn bit_record(name: impl Into<Cow<'static, str>>, fields: Vec<BitField>) -> Result<Ty> {
        let name = name.into();
        let spec = BitRecordSpec::new(name.clone(), fields)?;
        Ok(Ty::make(name, TyKind::BitRecord(Rc::new(spec))))
    }

    // --- indirection ------------------------------------------------------

    /// A typed reference: a stored integer decoded as an offset, resolved
    /// through `resolver`, loading the type `target` produces.
    pub fn pointer(
        stored: IntSpec,
        resolver: Resolver,
        target: impl Fn(&Region, u64) -> Result<Ty> + 'static,
    ) -> Ty {
        Ty::make(
            "pointer",
            TyKind::Pointer(Rc::new(PointerSpec {
                stored,
                resolver,
                mask: None,
                target: Rc::new(target),
            })),
        )
    }

    /// A pointer whose stored integer carries flag bits selecting among
    /// target types; the flag is passed to `target`.
    pub fn masked_pointer(
        stored: IntSpec,
        resolver: Resolver,
        mask: PtrMask,
        target: impl Fn(&Region, u64) -> Result<Ty> + 'static,
    ) -> Ty {
        Ty::make(
            "pointer",
            TyKind::Pointer(Rc::new(PointerSpec {
                stored,
                resolver,
                mask: Some(mask),
                target: Rc::new(target),
            })),
        )
    }

    /// An opaque encoded window that decodes (lazily, through `codec`) to a
    /// child region over a synthetic in-memory source.
    pub fn encoded(window: u64, codec: Rc<dyn Codec>, target: Ty) -> Ty {
        let name = format!("encoded<{}>", codec.name());
        Ty::make(
            name,
            TyKind::Encoded(Rc::new(EncodedSpec {
                window: LenSpec::Const(window),
                codec,
                target,
            })),
        )
    }

    pub fn encoded_late(
        window: impl Fn(&Region) -> Result<u64> + 'static,
        codec: Rc<dyn Codec>,
        target: Ty,
    ) -> Ty {
        let name = format!("encoded<{}>", codec.name());
        Ty::make(
            name,
            TyKind::Encoded(Rc::new(EncodedSpec {
                window: LenSpec::Late(Rc::new(window)),
                codec,
                target,
            })),
        )
    }

    /// A tagged union: the discriminator accessor reads a sibling or
    /// ancestor field, and the registry picks the concrete type.
    pub fn union(
        registry: Registry,
        discr: impl Fn(&Region) -> Result<(Key, Option<u64>)> + 'static,
    ) -> Ty {
        let name = format!("union<{}>", registry.name());
        Ty::make(
            name,
            TyKind::Union(Rc::new(UnionSpec {
                registry,
                discr: Rc::new(discr),
            })),
        )
    }

    // --- modifiers ---------------------------------------------------------

    fn modify(&self, f: impl FnOnce(&mut TyInner)) -> Ty {
        let mut inner = TyInner {
            name: self.inner.name.clone(),
            byteorder: self.inner.byteorder,
            bitorder: self.inner.bitorder,
            boundary: self.inner.boundary,
            kind: clone_kind(&self.inner.kind),
        };
        f(&mut inner);
        Ty {
            inner: Rc::new(inner),
        }
    }

    pub fn with_byteorder(&self, order: ByteOrder) -> Ty {
        self.modify(|inner| inner.byteorder = Some(order))
    }

    pub fn with_bitorder(&self, order: BitOrder) -> Ty {
        self.modify(|inner| inner.bitorder = Some(order))
    }

    /// Marks this type as an anchor for boundary-relative pointers.
    pub fn boundary(&self) -> Ty {
        self.modify(|inner| inner.boundary = true)
    }

    pub fn named(&self, name: impl Into<Cow<'static, str>>) -> Ty {
        let name = name.into();
        self.modify(|inner| inner.name = name)
    }

    pub(crate) fn is_boundary(&self) -> bool {
        self.inner.boundary
    }

    // --- sizing and instantiation -----------------------------------------

    /// The byte size this type occupies when it can be known without
    /// loading; `None` for content-dependent layouts.
    pub fn fixed_size(&self) -> Option<u64> {
        match &self.inner.kind {
            TyKind::Int(spec) | TyKind::Enum(spec, _) => Some(u64::from(spec.width)),
            TyKind::Float(spec) => Some(spec.width_bytes() as u64),
            TyKind::Fixed(spec) => Some(u64::from(spec.total_bytes)),
            TyKind::Str { unit, policy } => match policy {
                StrPolicy::Units(n) => Some(n * unit.bytes() as u64),
                StrPolicy::Terminated { .. } => None,
            },
            TyKind::Block(len) => len.fixed(),
            TyKind::Record(spec) => {
                let mut total = 0u64;
                for field in &spec.fields {
                    match &field.ty {
                        FieldTy::Fixed(ty) => total += ty.fixed_size()?,
                        FieldTy::Late(_) => return None,
                    }
                }
                Some(total)
            }
            TyKind::Array(spec) => match &spec.policy {
                ArrayPolicy::Count(len) => Some(len.fixed()? * spec.elem.fixed_size()?),
                ArrayPolicy::Block(len) => len.fixed(),
                _ => None,
            },
            TyKind::BitRecord(spec) => {
                let bits = spec.total_bits();
                if bits % 8 == 0 {
                    Some(bits / 8)
                } else {
                    None
                }
            }
            TyKind::Pointer(spec) => Some(u64::from(spec.stored.width)),
            TyKind::Encoded(spec) => spec.window.fixed(),
            TyKind::Union(_) => None,
            // Bit-unit kinds have no byte size of their own.
            TyKind::BitInt { .. } | TyKind::BitArray { .. } => None,
        }
    }

    /// Loads an instance of this type at `offset` in `source`. The returned
    /// region is always navigable; inspect [`Region::state`] for partial or
    /// failed loads.
    pub fn load(&self, source: SharedSource, offset: u64) -> Region {
        crate::region::load_root(self, source, offset)
    }

    /// Convenience: load over a fresh in-memory source.
    pub fn parse(&self, bytes: impl Into<Vec<u8>>) -> Region {
        self.load(MemSource::shared(bytes), 0)
    }

    /// Builds a loaded instance over a zeroed in-memory source, so values
    /// can be set and serialized without parsing existing bytes. Requires a
    /// statically sized type.
    pub fn alloc(&self) -> Result<Region> {
        let size = self.fixed_size().ok_or_else(|| Error::NotSupported {
            ty: self.name().to_owned(),
            op: "allocation without a source (content-dependent size)",
        })?;
        let region = self.load(MemSource::zeroed(size as usize).into_shared(), 0);
        Ok(region)
    }
}

/// Shallow clone of a kind; all heavy parts are behind `Rc`.
fn clone_kind(kind: &TyKind) -> TyKind {
    match kind {
        TyKind::Int(spec) => TyKind::Int(*spec),
        TyKind::Enum(spec, names) => TyKind::Enum(*spec, Rc::clone(names)),
        TyKind::Float(spec) => TyKind::Float(*spec),
        TyKind::Fixed(spec) => TyKind::Fixed(*spec),
        TyKind::Str { unit, policy } => TyKind::Str {
            unit: *unit,
            policy: *policy,
        },
        TyKind::Block(len) => TyKind::Block(len.clone()),
        TyKind::Record(spec) => TyKind::Record(Rc::clone(spec)),
        TyKind::Array(spec) => TyKind::Array(Rc::clone(spec)),
        TyKind::BitRecord(spec) => TyKind::BitRecord(Rc::clone(spec)),
        TyKind::BitInt { width, signed } => TyKind::BitInt {
            width: *width,
            signed: *signed,
        },
        TyKind::BitArray { elem, count } => TyKind::BitArray {
            elem: Rc::clone(elem),
            count: *count,
        },
        TyKind::Pointer(spec) => TyKind::Pointer(Rc::clone(spec)),
        TyKind::Encoded(spec) => TyKind::Encoded(Rc::clone(spec)),
        TyKind::Union(spec) => TyKind::Union(Rc::clone(spec)),
    }
}

impl std::fmt::Debug for Ty {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Ty({})", self.name())
    }
}
