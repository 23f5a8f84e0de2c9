//! Static operand tables of the one- and two-byte opcode maps.
//!
//! Each entry is a set of flags describing which operand bytes follow the opcode. Prefix bytes,
//! the `0x0F` escape and the VEX/EVEX lead bytes are handled by the decoder before these tables
//! are consulted, so their entries are irrelevant.

/// A ModRM byte follows the opcode.
pub const MODRM: u8 = 0x01;
/// An 8-bit immediate.
pub const IMM8: u8 = 0x02;
/// A 16-bit immediate.
pub const IMM16: u8 = 0x04;
/// A 16- or 32-bit immediate, depending on the operand size.
pub const IMMZ: u8 = 0x08;
/// A 16-, 32- or 64-bit immediate, depending on the operand size (`mov reg, imm`).
pub const IMMV: u8 = 0x10;
/// A memory offset as wide as the address size (`mov al, moffs`).
pub const MOFFS: u8 = 0x20;
/// A far pointer: a 16- or 32-bit offset followed by a 16-bit selector.
pub const FAR: u8 = 0x40;
/// Not encodable in 64-bit mode.
pub const INVALID64: u8 = 0x80;

const ___: u8 = 0;
const M__: u8 = MODRM;
const MB_: u8 = MODRM | IMM8;
const MZ_: u8 = MODRM | IMMZ;
const B__: u8 = IMM8;
const W__: u8 = IMM16;
const Z__: u8 = IMMZ;
const V__: u8 = IMMV;
const O__: u8 = MOFFS;
const X__: u8 = INVALID64;
const XB_: u8 = INVALID64 | IMM8;
const XF_: u8 = INVALID64 | FAR;
const XM_: u8 = INVALID64 | MODRM;
const XMB: u8 = INVALID64 | MODRM | IMM8;
const WB_: u8 = IMM16 | IMM8;

/// The one-byte opcode map.
#[rustfmt::skip]
pub static ONE_BYTE: [u8; 256] = [
//  0    1    2    3    4    5    6    7    8    9    a    b    c    d    e    f
    M__, M__, M__, M__, B__, Z__, X__, X__, M__, M__, M__, M__, B__, Z__, X__, ___, // 0
    M__, M__, M__, M__, B__, Z__, X__, X__, M__, M__, M__, M__, B__, Z__, X__, X__, // 1
    M__, M__, M__, M__, B__, Z__, ___, X__, M__, M__, M__, M__, B__, Z__, ___, X__, // 2
    M__, M__, M__, M__, B__, Z__, ___, X__, M__, M__, M__, M__, B__, Z__, ___, X__, // 3
    ___, ___, ___, ___, ___, ___, ___, ___, ___, ___, ___, ___, ___, ___, ___, ___, // 4
    ___, ___, ___, ___, ___, ___, ___, ___, ___, ___, ___, ___, ___, ___, ___, ___, // 5
    X__, X__, XM_, M__, ___, ___, ___, ___, Z__, MZ_, B__, MB_, ___, ___, ___, ___, // 6
    B__, B__, B__, B__, B__, B__, B__, B__, B__, B__, B__, B__, B__, B__, B__, B__, // 7
    MB_, MZ_, XMB, MB_, M__, M__, M__, M__, M__, M__, M__, M__, M__, M__, M__, M__, // 8
    ___, ___, ___, ___, ___, ___, ___, ___, ___, ___, XF_, ___, ___, ___, ___, ___, // 9
    O__, O__, O__, O__, ___, ___, ___, ___, B__, Z__, ___, ___, ___, ___, ___, ___, // a
    B__, B__, B__, B__, B__, B__, B__, B__, V__, V__, V__, V__, V__, V__, V__, V__, // b
    MB_, MB_, W__, ___, XM_, XM_, MB_, MZ_, WB_, ___, W__, ___, ___, B__, X__, ___, // c
    M__, M__, M__, M__, XB_, XB_, X__, ___, M__, M__, M__, M__, M__, M__, M__, M__, // d
    B__, B__, B__, B__, B__, B__, B__, B__, Z__, Z__, XF_, B__, ___, ___, ___, ___, // e
    ___, ___, ___, ___, ___, ___, M__, M__, ___, ___, ___, ___, ___, ___, M__, M__, // f
];

/// The two-byte opcode map, following the `0x0F` escape.
///
/// `0F 38` and `0F 3A` escape into the three-byte maps, whose operands are uniform: all opcodes
/// take a ModRM byte and the `0F 3A` map adds an 8-bit immediate.
#[rustfmt::skip]
pub static TWO_BYTE: [u8; 256] = [
//  0    1    2    3    4    5    6    7    8    9    a    b    c    d    e    f
    M__, M__, M__, M__, ___, ___, ___, ___, ___, ___, ___, ___, ___, M__, ___, MB_, // 0
    M__, M__, M__, M__, M__, M__, M__, M__, M__, M__, M__, M__, M__, M__, M__, M__, // 1
    M__, M__, M__, M__, M__, M__, M__, M__, M__, M__, M__, M__, M__, M__, M__, M__, // 2
    ___, ___, ___, ___, ___, ___, ___, ___, ___, ___, ___, ___, ___, ___, ___, ___, // 3
    M__, M__, M__, M__, M__, M__, M__, M__, M__, M__, M__, M__, M__, M__, M__, M__, // 4
    M__, M__, M__, M__, M__, M__, M__, M__, M__, M__, M__, M__, M__, M__, M__, M__, // 5
    M__, M__, M__, M__, M__, M__, M__, M__, M__, M__, M__, M__, M__, M__, M__, M__, // 6
    MB_, MB_, MB_, MB_, M__, M__, M__, ___, M__, M__, M__, M__, M__, M__, M__, M__, // 7
    Z__, Z__, Z__, Z__, Z__, Z__, Z__, Z__, Z__, Z__, Z__, Z__, Z__, Z__, Z__, Z__, // 8
    M__, M__, M__, M__, M__, M__, M__, M__, M__, M__, M__, M__, M__, M__, M__, M__, // 9
    ___, ___, ___, M__, MB_, M__, ___, ___, ___, ___, ___, M__, MB_, M__, M__, M__, // a
    M__, M__, M__, M__, M__, M__, M__, M__, M__, M__, MB_, M__, M__, M__, M__, M__, // b
    M__, M__, MB_, M__, MB_, MB_, MB_, M__, ___, ___, ___, ___, ___, ___, ___, ___, // c
    M__, M__, M__, M__, M__, M__, M__, M__, M__, M__, M__, M__, M__, M__, M__, M__, // d
    M__, M__, M__, M__, M__, M__, M__, M__, M__, M__, M__, M__, M__, M__, M__, M__, // e
    M__, M__, M__, M__, M__, M__, M__, M__, M__, M__, M__, M__, M__, M__, M__, M__, // f
];

/// Returns `true` if a VEX or EVEX encoded opcode in the given map takes an 8-bit immediate.
///
/// Maps are numbered as in the VEX `mmmmm` field: 1 is `0F`, 2 is `0F 38`, 3 is `0F 3A`.
pub fn vex_has_imm8(map: u8, opcode: u8) -> bool {
    match map {
        1 => matches!(opcode, 0x70..=0x73 | 0xc2 | 0xc4..=0xc6),
        3 => true,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prefix_entries_are_empty() {
        for prefix in [0x26, 0x2e, 0x36, 0x3e, 0x64, 0x65, 0x66, 0x67, 0xf0, 0xf2, 0xf3] {
            assert_eq!(ONE_BYTE[prefix], 0, "prefix {prefix:#04x}");
        }
    }

    #[test]
    fn test_branch_entries() {
        assert_eq!(ONE_BYTE[0xe8], IMMZ);
        assert_eq!(ONE_BYTE[0xeb], IMM8);
        assert_eq!(ONE_BYTE[0xff], MODRM);
        assert_eq!(TWO_BYTE[0x84], IMMZ);
        assert!((0x70..=0x7f).all(|op| ONE_BYTE[op] == IMM8));
    }
}
