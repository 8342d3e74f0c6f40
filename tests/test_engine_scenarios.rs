mod fixtures;

use binregion::{
    BitField, BitOrder, CharUnit, Error, Field, IntSpec, Key, Registry, Resolver, Ty,
};
use fixtures::*;
use pretty_assertions::assert_eq;

#[test]
fn little_endian_u16_record() {
    ensure_env_logger_initialized();
    let rec = Ty::record(
        "pair",
        vec![Field::new("a", Ty::u16()), Field::new("b", Ty::u16())],
    )
    .unwrap();

    let input = vec![0x34, 0x12, 0x78, 0x56];
    let r = rec.parse(input.clone());

    assert!(r.state().is_loaded());
    assert_eq!(r.field("a").unwrap().as_u64().unwrap(), 0x1234);
    assert_eq!(r.field("b").unwrap().as_u64().unwrap(), 0x5678);
    assert_eq!(r.serialize().unwrap(), input);
}

#[test]
fn terminated_string_leaves_trailing_bytes_unconsumed() {
    ensure_env_logger_initialized();
    let r = Ty::str_terminated(CharUnit::One).parse(vec![0x48, 0x69, 0x00, 0xff]);

    assert!(r.state().is_loaded());
    assert_eq!(r.to_text().unwrap(), "Hi");
    // Terminator included, the 0xFF after it untouched.
    assert_eq!(r.size(), 3);
    assert_eq!(r.serialize().unwrap(), vec![0x48, 0x69, 0x00]);
}

#[test]
fn absolute_pointer_dereferences_to_a_string() {
    ensure_env_logger_initialized();
    let mut input = vec![0u8; 32];
    input[0] = 0x10;
    input[0x10..0x14].copy_from_slice(b"ABC\0");

    let rec = Ty::record(
        "header",
        vec![Field::new(
            "p",
            Ty::pointer(IntSpec::new(4, false), Resolver::Absolute, |_, _| {
                Ok(Ty::str_terminated(CharUnit::One))
            }),
        )],
    )
    .unwrap();

    let r = rec.parse(input);
    let p = r.field("p").unwrap();
    assert_eq!(p.offset(), 0);

    let target = p.deref().unwrap();
    assert_eq!(target.offset(), 0x10);
    assert_eq!(target.to_text().unwrap(), "ABC");
}

fn tagged() -> Ty {
    let bodies = Registry::new("bodies");
    bodies.register(1u64, Ty::u8().named("one")).unwrap();
    bodies
        .register(
            2u64,
            Ty::record(
                "two",
                vec![Field::new("x", Ty::u8()), Field::new("y", Ty::u8())],
            )
            .unwrap(),
        )
        .unwrap();

    Ty::record(
        "tagged",
        vec![
            Field::new("tag", Ty::u8()),
            Field::new(
                "body",
                Ty::union(bodies, |u| {
                    Ok((Key::Int(u.sibling("tag")?.as_u64()?), None))
                }),
            ),
        ],
    )
    .unwrap()
}

#[test]
fn block_array_fills_its_budget_exactly() {
    ensure_env_logger_initialized();
    // (tag=1, 0x02) (tag=2, 0x41 0x42) (tag=1, 0x43): 2 + 3 + 2 = 7 bytes.
    let input = vec![0x01, 0x02, 0x02, 0x41, 0x42, 0x01, 0x43];
    let r = Ty::block_array(tagged(), 7).parse(input.clone());

    assert!(r.state().is_loaded());
    assert_eq!(r.len(), 3);
    assert_eq!(
        r.index(0).unwrap().field("body").unwrap().as_u64().unwrap(),
        0x02
    );
    let middle = r.index(1).unwrap().field("body").unwrap();
    assert_eq!(middle.field("x").unwrap().as_u64().unwrap(), 0x41);
    assert_eq!(middle.field("y").unwrap().as_u64().unwrap(), 0x42);
    assert_eq!(r.serialize().unwrap(), input);
}

#[test]
fn registry_default_keeps_every_byte_represented() {
    ensure_env_logger_initialized();
    let rows = Registry::new("rows");
    rows.register(1u64, Ty::u16().named("known")).unwrap();
    rows.set_block_default();

    let rec = Ty::record(
        "entry",
        vec![
            Field::new("tag", Ty::u8()),
            Field::new("len", Ty::u8()),
            Field::new(
                "body",
                Ty::union(rows, |u| {
                    Ok((
                        Key::Int(u.sibling("tag")?.as_u64()?),
                        Some(u.sibling("len")?.as_u64()?),
                    ))
                }),
            ),
        ],
    )
    .unwrap();

    // Unknown tag 9: the default block spans exactly `len` bytes.
    let input = vec![0x09, 0x03, 0xaa, 0xbb, 0xcc];
    let r = rec.parse(input.clone());

    assert!(r.state().is_loaded());
    let body = r.field("body").unwrap();
    assert_eq!(body.size(), 3);
    assert_eq!(body.variant().unwrap().as_bytes().unwrap(), vec![0xaa, 0xbb, 0xcc]);
    assert_eq!(r.serialize().unwrap(), input);
}

#[test]
fn bit_record_under_both_bit_orders() {
    ensure_env_logger_initialized();
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

    let msb = rec().with_bitorder(BitOrder::MsbFirst).parse(vec![0b1010_0110]);
    assert_eq!(msb.field("a").unwrap().as_u64().unwrap(), 1);
    assert_eq!(msb.field("b").unwrap().as_u64().unwrap(), 2);
    assert_eq!(msb.field("c").unwrap().as_u64().unwrap(), 6);
    assert_eq!(msb.serialize().unwrap(), vec![0b1010_0110]);

    let lsb = rec().with_bitorder(BitOrder::LsbFirst).parse(vec![0b1010_0110]);
    assert_eq!(lsb.field("a").unwrap().as_u64().unwrap(), 0);
    assert_eq!(lsb.field("b").unwrap().as_u64().unwrap(), 3);
    assert_eq!(lsb.field("c").unwrap().as_u64().unwrap(), 10);
    assert_eq!(lsb.serialize().unwrap(), vec![0b1010_0110]);
}

#[test]
fn truncated_record_loads_a_prefix_and_round_trips() {
    ensure_env_logger_initialized();
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
    assert_eq!(r.field("a").unwrap().as_u64().unwrap(), 0x0403_0201);
    assert_eq!(r.field("b").unwrap().as_u64().unwrap(), 0x0807_0605);
    assert!(r.field("c").unwrap().state().is_partial());
    assert!(r.field("d").is_err());
    assert!(r.field("e").is_err());

    let err = r.state().error().unwrap().clone();
    assert!(matches!(
        err.root_cause(),
        Error::ShortRead {
            offset: 8,
            wanted: 4,
            got: 2
        }
    ));
    assert_eq!(r.serialize().unwrap(), input);
}

#[test]
fn every_prefix_of_a_valid_input_loads_a_prefix_of_the_fields() {
    ensure_env_logger_initialized();
    let rec = Ty::record(
        "mix",
        vec![
            Field::new("a", Ty::u16()),
            Field::new("b", Ty::u32()),
            Field::new("c", Ty::u8()),
        ],
    )
    .unwrap();
    let full = vec![0x11, 0x22, 0x33, 0x44, 0x55, 0x66, 0x77];

    let loaded_fields = |n: usize| {
        let r = rec.parse(full[..n].to_vec());
        assert!(!r.state().is_failed(), "prefix of {n} bytes failed at root");
        let loaded = ["a", "b", "c"]
            .into_iter()
            .filter(|&f| {
                r.field(f)
                    .map(|c| c.state().is_loaded())
                    .unwrap_or(false)
            })
            .count();
        (loaded, r.serialize().unwrap())
    };

    for n in 0..=full.len() {
        let (loaded, bytes) = loaded_fields(n);
        assert_eq!(bytes, full[..n].to_vec(), "prefix of {n} bytes");
        let expected = match n {
            0..=1 => 0,
            2..=5 => 1,
            6 => 2,
            _ => 3,
        };
        assert_eq!(loaded, expected, "prefix of {n} bytes");
    }
}

#[test]
fn composite_round_trip() {
    ensure_env_logger_initialized();
    let rec = Ty::record(
        "shape",
        vec![
            Field::new("count", Ty::u8()),
            Field::late("points", |r| {
                let n = r.field("count")?.as_u64()?;
                Ok(Ty::array(
                    Ty::record(
                        "point",
                        vec![Field::new("x", Ty::i16()), Field::new("y", Ty::i16())],
                    )?,
                    n,
                ))
            }),
        ],
    )
    .unwrap();

    let input = vec![2, 0x01, 0x00, 0xff, 0xff, 0x10, 0x00, 0xf0, 0xff];
    let r = rec.parse(input.clone());

    assert!(r.state().is_loaded());
    let points = r.field("points").unwrap();
    assert_eq!(points.len(), 2);
    assert_eq!(points.index(0).unwrap().field("y").unwrap().as_i64().unwrap(), -1);
    assert_eq!(points.index(1).unwrap().field("y").unwrap().as_i64().unwrap(), -16);
    assert_eq!(r.serialize().unwrap(), input);
}
