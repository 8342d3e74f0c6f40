use std::cmp;
use std::fmt::Write;

use crate::err::Result;
use crate::region::Region;

/// Classic 16-bytes-per-line hex view, addressed from `offset`.
pub fn hexdump(data: &[u8], offset: u64) -> String {
    let mut out = String::new();
    let mut address = 0;
    while address < data.len() {
        let end = cmp::min(address + 16, data.len());
        dump_line(&mut out, &data[address..end], offset + address as u64);
        address += 16;
    }
    out
}

/// Hex view of a region's serialized bytes, addressed at the region's own
/// offset so lines line up with the enclosing source.
pub fn dump_region(region: &Region) -> Result<String> {
    let bytes = region.serialize()?;
    Ok(hexdump(&bytes, region.offset()))
}

fn dump_line(out: &mut String, line: &[u8], address: u64) {
    let _ = write!(out, "{address:08x}:");
    for b in line {
        let _ = write!(out, " {b:02x}");
    }
    for _ in line.len()..16 {
        out.push_str("   ");
    }
    out.push_str("  ");
    for b in line {
        let c = *b as char;
        out.push(if c.is_control() { '.' } else { c });
    }
    out.push('\n');
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_one_line() {
        let dump = hexdump(b"Hi\x00", 0x10);
        let mut expected = String::from("00000010: 48 69 00");
        for _ in 3..16 {
            expected.push_str("   ");
        }
        expected.push_str("  Hi.\n");
        assert_eq!(dump, expected);
    }

    #[test]
    fn test_splits_at_sixteen() {
        let dump = hexdump(&[0u8; 17], 0);
        let lines: Vec<&str> = dump.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].starts_with("00000000:"));
        assert!(lines[1].starts_with("00000010:"));
    }

    #[test]
    fn test_empty_input_dumps_nothing() {
        assert_eq!(hexdump(&[], 0), "");
    }
}
