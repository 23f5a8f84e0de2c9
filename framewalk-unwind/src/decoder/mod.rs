//! Decoding of single x86 and x86-64 instructions.
//!
//! The decoder is not a disassembler. It determines the exact length of every instruction,
//! classifies control transfers, recognizes the handful of stack-manipulating instructions found
//! in function prologues and epilogues, and records the memory operand so that the target of an
//! indirect branch can be evaluated later against a register file.
//!
//! ```
//! use framewalk_unwind::decoder::{decode, InstructionKind};
//!
//! // call 0x401020
//! let call = decode(&[0xe8, 0x1b, 0x00, 0x00, 0x00], 0x401000, true);
//! assert_eq!(call.kind(), InstructionKind::Call);
//! assert_eq!(call.length(), Some(5));
//! assert_eq!(call.target(), Some(0x401020));
//! ```

use smallvec::SmallVec;

mod eval;
mod interpret;
mod tables;

pub use self::eval::*;
pub use self::interpret::*;

use self::tables::{FAR, IMM16, IMM8, IMMV, IMMZ, INVALID64, MODRM, MOFFS};

/// The architectural limit on the length of one instruction.
///
/// The decoder never looks at more bytes than this, regardless of the length of its input.
pub const MAX_INSTRUCTION_LENGTH: usize = 15;

/// Hardware encoding of the stack pointer in ModRM, SIB and opcode register fields.
pub const ENCODING_SP: u8 = 4;
/// Hardware encoding of the frame pointer in ModRM, SIB and opcode register fields.
pub const ENCODING_BP: u8 = 5;

/// A stack manipulating instruction that can be simulated when unwinding through a prologue or
/// epilogue.
///
/// Registers are given in their hardware encoding, extended by REX.B in 64-bit mode.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum FrameOp {
    /// `push reg`
    Push(u8),
    /// `pop reg`
    Pop(u8),
    /// `mov %sp, %bp`
    MovSpToBp,
    /// `mov %bp, %sp`
    MovBpToSp,
    /// `leave`
    Leave,
    /// `nop`, including the multi-byte forms.
    Nop,
    /// `sub $imm, %sp`
    SubSp(i64),
    /// `add $imm, %sp`
    AddSp(i64),
}

/// The classification of a decoded instruction.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum InstructionKind {
    /// A relative call.
    Call,
    /// A relative unconditional jump.
    Jump,
    /// A relative conditional jump, including `loop` and `jcxz`.
    ConditionalJump,
    /// A call through a register or memory operand.
    IndirectCall,
    /// A jump through a register or memory operand.
    IndirectJump,
    /// A near return, popping the given number of bytes in addition to the return address.
    Return(u16),
    /// A prologue or epilogue instruction.
    Frame(FrameOp),
    /// Any other valid instruction.
    Other,
    /// Malformed, truncated or unsupported bytes.
    Unknown,
}

impl InstructionKind {
    /// Returns `true` for every kind of branch, call and return.
    pub fn is_control_transfer(self) -> bool {
        matches!(
            self,
            Self::Call
                | Self::Jump
                | Self::ConditionalJump
                | Self::IndirectCall
                | Self::IndirectJump
                | Self::Return(_)
        )
    }

    /// Returns `true` for direct and indirect calls.
    pub fn is_call(self) -> bool {
        matches!(self, Self::Call | Self::IndirectCall)
    }
}

/// The operand addressing specification of an instruction.
///
/// The address is `base + (index << scale) + displacement`, truncated to `address_size` bytes.
/// When `rip_relative` is set, the base is the address of the following instruction. Relative
/// branches are expressed this way, without dereference.
#[derive(Clone, Copy, Debug, Default, Eq, Hash, PartialEq)]
pub struct EffectiveAddress {
    /// Hardware encoding of the base register.
    pub base: Option<u8>,
    /// Hardware encoding of the index register.
    pub index: Option<u8>,
    /// Shift applied to the index register.
    pub scale: u8,
    /// Signed displacement.
    pub displacement: i64,
    /// Whether the computed address is read from memory. Unset for register-direct operands.
    pub dereference: bool,
    /// Whether the base is the instruction pointer after this instruction.
    pub rip_relative: bool,
    /// Width of the address computation in bytes.
    pub address_size: u8,
}

/// A single decoded instruction.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Instruction {
    address: u64,
    kind: InstructionKind,
    length: Option<u32>,
    effective_address: Option<EffectiveAddress>,
    bytes: SmallVec<[u8; MAX_INSTRUCTION_LENGTH]>,
    is_64bit: bool,
}

impl Instruction {
    fn unknown(address: u64, window: &[u8], is_64bit: bool) -> Self {
        Self {
            address,
            kind: InstructionKind::Unknown,
            length: None,
            effective_address: None,
            bytes: SmallVec::from_slice(window),
            is_64bit,
        }
    }

    /// The address of the first byte of this instruction.
    pub fn address(&self) -> u64 {
        self.address
    }

    /// The classification of this instruction.
    pub fn kind(&self) -> InstructionKind {
        self.kind
    }

    /// The encoded length, or `None` if the bytes could not be decoded.
    ///
    /// Never advance past an instruction without a length.
    pub fn length(&self) -> Option<u32> {
        self.length
    }

    /// Returns `true` if the instruction was decoded successfully.
    pub fn is_valid(&self) -> bool {
        self.length.is_some()
    }

    /// Whether the instruction was decoded in 64-bit mode.
    pub fn is_64bit(&self) -> bool {
        self.is_64bit
    }

    /// The operand of a branch or ModRM encoded instruction.
    pub fn effective_address(&self) -> Option<&EffectiveAddress> {
        self.effective_address.as_ref()
    }

    /// The bytes of this instruction.
    ///
    /// For unknown instructions, these are all bytes the decoder looked at.
    pub fn raw_bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// The address of the instruction following this one.
    pub fn next_address(&self) -> Option<u64> {
        let length = self.length?;
        Some(truncate(
            self.address.wrapping_add(length.into()),
            self.pointer_size(),
        ))
    }

    /// The target of a relative call or jump.
    pub fn target(&self) -> Option<u64> {
        match self.kind {
            InstructionKind::Call | InstructionKind::Jump | InstructionKind::ConditionalJump => {}
            _ => return None,
        }

        let ea = self.effective_address?;
        let next = self.next_address()?;
        Some(truncate(
            next.wrapping_add(ea.displacement as u64),
            ea.address_size,
        ))
    }

    /// Returns `true` if the instruction can be simulated by [`interpret`].
    pub fn is_interpretable(&self) -> bool {
        !matches!(
            self.kind,
            InstructionKind::ConditionalJump | InstructionKind::Other | InstructionKind::Unknown
        )
    }

    pub(crate) fn pointer_size(&self) -> u8 {
        if self.is_64bit {
            8
        } else {
            4
        }
    }
}

/// Truncates a value to an operand or address size in bytes.
pub(crate) fn truncate(value: u64, size: u8) -> u64 {
    match size {
        1 => value & 0xff,
        2 => value & 0xffff,
        4 => value & 0xffff_ffff,
        _ => value,
    }
}

/// Decodes the instruction at the start of `bytes`, located at `address`.
///
/// At most [`MAX_INSTRUCTION_LENGTH`] bytes are inspected. If the input ends within the
/// instruction, or the bytes do not form a valid instruction in the given mode, the result is
/// [`InstructionKind::Unknown`] without a length.
pub fn decode(bytes: &[u8], address: u64, is_64bit: bool) -> Instruction {
    let window = &bytes[..bytes.len().min(MAX_INSTRUCTION_LENGTH)];
    let mut decoder = Decoder::new(window, is_64bit);

    match decoder.decode() {
        Some((kind, effective_address)) => Instruction {
            address,
            kind,
            length: Some(decoder.pos as u32),
            effective_address,
            bytes: SmallVec::from_slice(&window[..decoder.pos]),
            is_64bit,
        },
        None => Instruction::unknown(address, window, is_64bit),
    }
}

/// Decodes consecutive instructions until the input is exhausted or an instruction is unknown.
///
/// The unknown instruction, if any, is the last item.
pub fn decode_all(bytes: &[u8], address: u64, is_64bit: bool) -> Instructions<'_> {
    Instructions {
        bytes,
        address,
        is_64bit,
        done: false,
    }
}

/// Iterator returned by [`decode_all`].
#[derive(Clone, Debug)]
pub struct Instructions<'a> {
    bytes: &'a [u8],
    address: u64,
    is_64bit: bool,
    done: bool,
}

impl Iterator for Instructions<'_> {
    type Item = Instruction;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done || self.bytes.is_empty() {
            return None;
        }

        let instruction = decode(self.bytes, self.address, self.is_64bit);
        match instruction.length() {
            Some(length) => {
                self.bytes = &self.bytes[length as usize..];
                self.address = self.address.wrapping_add(length.into());
            }
            None => self.done = true,
        }

        Some(instruction)
    }
}

type Decoded = (InstructionKind, Option<EffectiveAddress>);

struct ModRm {
    mode: u8,
    /// The `reg` field without REX extension, used as opcode extension by groups.
    digit: u8,
    /// The `reg` field extended by REX.R.
    reg: u8,
    /// The `r/m` field extended by REX.B, only meaningful for register-direct forms.
    rm: u8,
    operand: EffectiveAddress,
}

struct Decoder<'a> {
    bytes: &'a [u8],
    pos: usize,
    is_64bit: bool,
    operand_size_override: bool,
    address_size_override: bool,
    rex: u8,
}

impl<'a> Decoder<'a> {
    fn new(bytes: &'a [u8], is_64bit: bool) -> Self {
        Self {
            bytes,
            pos: 0,
            is_64bit,
            operand_size_override: false,
            address_size_override: false,
            rex: 0,
        }
    }

    fn peek(&self) -> Option<u8> {
        self.bytes.get(self.pos).copied()
    }

    fn byte(&mut self) -> Option<u8> {
        let byte = self.peek()?;
        self.pos += 1;
        Some(byte)
    }

    fn skip(&mut self, count: usize) -> Option<()> {
        if self.pos + count > self.bytes.len() {
            return None;
        }
        self.pos += count;
        Some(())
    }

    /// Reads a little-endian value of `size` bytes and sign-extends it.
    fn signed(&mut self, size: usize) -> Option<i64> {
        let bytes = self.bytes.get(self.pos..self.pos + size)?;
        self.pos += size;

        let mut buf = [0; 8];
        buf[..size].copy_from_slice(bytes);
        let shift = 64 - 8 * size as u32;
        Some((i64::from_le_bytes(buf) << shift) >> shift)
    }

    fn rex_w(&self) -> bool {
        self.rex & 0x08 != 0
    }

    fn rex_bit(&self, mask: u8) -> u8 {
        if self.rex & mask != 0 {
            8
        } else {
            0
        }
    }

    fn pointer_size(&self) -> u8 {
        if self.is_64bit {
            8
        } else {
            4
        }
    }

    fn address_size(&self) -> u8 {
        match (self.is_64bit, self.address_size_override) {
            (true, false) => 8,
            (true, true) | (false, false) => 4,
            (false, true) => 2,
        }
    }

    /// Size of a `z` immediate: 16 bits with the operand size override, 32 bits otherwise.
    fn immz_size(&self) -> usize {
        if self.operand_size_override && !self.rex_w() {
            2
        } else {
            4
        }
    }

    /// Returns `true` if the operand size equals the width of the stack pointer.
    fn is_stack_width(&self) -> bool {
        !self.operand_size_override && (!self.is_64bit || self.rex_w())
    }

    fn relative(&self, displacement: i64) -> Option<EffectiveAddress> {
        Some(EffectiveAddress {
            displacement,
            rip_relative: true,
            address_size: self.pointer_size(),
            ..EffectiveAddress::default()
        })
    }

    fn prefixes(&mut self) -> Option<()> {
        loop {
            match self.peek()? {
                0x26 | 0x2e | 0x36 | 0x3e | 0x64 | 0x65 | 0xf0 | 0xf2 | 0xf3 => self.rex = 0,
                0x66 => {
                    self.operand_size_override = true;
                    self.rex = 0;
                }
                0x67 => {
                    self.address_size_override = true;
                    self.rex = 0;
                }
                // A REX prefix only counts if it immediately precedes the opcode.
                byte @ 0x40..=0x4f if self.is_64bit => self.rex = byte,
                _ => return Some(()),
            }
            self.pos += 1;
        }
    }

    fn decode(&mut self) -> Option<Decoded> {
        self.prefixes()?;

        let opcode = self.byte()?;
        match opcode {
            0x0f => return self.two_byte(),
            // In 32-bit mode, these are `les`, `lds` and `bound` unless ModRM selects a register.
            0xc4 | 0xc5 if self.is_64bit || self.peek()? >= 0xc0 => return self.vex(opcode),
            0x62 if self.is_64bit || self.peek()? >= 0xc0 => return self.evex(),
            _ => {}
        }

        let flags = tables::ONE_BYTE[opcode as usize];
        if self.is_64bit && flags & INVALID64 != 0 {
            return None;
        }

        let kind = match opcode {
            0x70..=0x7f | 0xe0..=0xe3 => {
                let displacement = self.signed(1)?;
                return Some((InstructionKind::ConditionalJump, self.relative(displacement)));
            }
            0xe8 | 0xe9 => {
                let size = if self.rex_w() {
                    8
                } else if self.address_size_override {
                    2
                } else {
                    4
                };
                let displacement = self.signed(size)?;
                let kind = if opcode == 0xe8 {
                    InstructionKind::Call
                } else {
                    InstructionKind::Jump
                };
                return Some((kind, self.relative(displacement)));
            }
            0xeb => {
                let displacement = self.signed(1)?;
                return Some((InstructionKind::Jump, self.relative(displacement)));
            }
            0xc3 => InstructionKind::Return(0),
            0xc2 => InstructionKind::Return(self.signed(2)? as u16),
            0x50..=0x57 if !self.operand_size_override => {
                InstructionKind::Frame(FrameOp::Push((opcode & 7) | self.rex_bit(0x01)))
            }
            0x58..=0x5f if !self.operand_size_override => {
                InstructionKind::Frame(FrameOp::Pop((opcode & 7) | self.rex_bit(0x01)))
            }
            // With REX.B, this is `xchg %r8, %rax`.
            0x90 if self.rex & 0x01 == 0 => InstructionKind::Frame(FrameOp::Nop),
            0xc9 => InstructionKind::Frame(FrameOp::Leave),
            _ => return self.operands(opcode, flags),
        };

        Some((kind, None))
    }

    /// Decodes the ModRM and immediate operands of a one-byte opcode.
    fn operands(&mut self, opcode: u8, flags: u8) -> Option<Decoded> {
        let modrm = if flags & MODRM != 0 {
            Some(self.modrm()?)
        } else {
            None
        };

        let mut immediate = self.immediate_size(flags);
        if let (0xf6 | 0xf7, Some(modrm)) = (opcode, &modrm) {
            // Only `test` in group 3 takes an immediate.
            if modrm.digit <= 1 {
                immediate = if opcode == 0xf6 { 1 } else { self.immz_size() };
            }
        }

        let Some(modrm) = modrm else {
            self.skip(immediate)?;
            return Some((InstructionKind::Other, None));
        };

        let value = if matches!(opcode, 0x81 | 0x83) {
            self.signed(immediate)?
        } else {
            self.skip(immediate)?;
            0
        };

        let kind = match opcode {
            0xff => match modrm.digit {
                2 | 3 => InstructionKind::IndirectCall,
                4 | 5 => InstructionKind::IndirectJump,
                _ => InstructionKind::Other,
            },
            0x89 | 0x8b if modrm.mode == 3 && self.is_stack_width() => {
                // 0x89 moves `reg` into `r/m`, 0x8b moves `r/m` into `reg`.
                let (source, target) = if opcode == 0x89 {
                    (modrm.reg, modrm.rm)
                } else {
                    (modrm.rm, modrm.reg)
                };
                match (source, target) {
                    (ENCODING_SP, ENCODING_BP) => InstructionKind::Frame(FrameOp::MovSpToBp),
                    (ENCODING_BP, ENCODING_SP) => InstructionKind::Frame(FrameOp::MovBpToSp),
                    _ => InstructionKind::Other,
                }
            }
            0x81 | 0x83 if modrm.mode == 3 && modrm.rm == ENCODING_SP && self.is_stack_width() => {
                match modrm.digit {
                    0 => InstructionKind::Frame(FrameOp::AddSp(value)),
                    5 => InstructionKind::Frame(FrameOp::SubSp(value)),
                    _ => InstructionKind::Other,
                }
            }
            _ => InstructionKind::Other,
        };

        Some((kind, Some(modrm.operand)))
    }

    fn immediate_size(&self, flags: u8) -> usize {
        let mut size = 0;
        if flags & IMM8 != 0 {
            size += 1;
        }
        if flags & IMM16 != 0 {
            size += 2;
        }
        if flags & IMMZ != 0 {
            size += self.immz_size();
        }
        if flags & IMMV != 0 {
            size += if self.rex_w() { 8 } else { self.immz_size() };
        }
        if flags & MOFFS != 0 {
            size += self.address_size() as usize;
        }
        if flags & FAR != 0 {
            size += self.immz_size() + 2;
        }
        size
    }

    fn two_byte(&mut self) -> Option<Decoded> {
        let opcode = self.byte()?;
        match opcode {
            0x38 => {
                self.byte()?;
                self.modrm()?;
                return Some((InstructionKind::Other, None));
            }
            0x3a => {
                self.byte()?;
                self.modrm()?;
                self.skip(1)?;
                return Some((InstructionKind::Other, None));
            }
            0x80..=0x8f => {
                let size = if !self.is_64bit && self.operand_size_override {
                    2
                } else {
                    4
                };
                let displacement = self.signed(size)?;
                return Some((InstructionKind::ConditionalJump, self.relative(displacement)));
            }
            _ => {}
        }

        let flags = tables::TWO_BYTE[opcode as usize];
        if flags & MODRM == 0 {
            self.skip(self.immediate_size(flags))?;
            return Some((InstructionKind::Other, None));
        }

        let modrm = self.modrm()?;
        self.skip(self.immediate_size(flags))?;

        let kind = if opcode == 0x1f && modrm.digit == 0 {
            InstructionKind::Frame(FrameOp::Nop)
        } else {
            InstructionKind::Other
        };

        Some((kind, Some(modrm.operand)))
    }

    /// Decodes the length of a VEX encoded instruction (`0xc4` three-byte or `0xc5` two-byte).
    fn vex(&mut self, lead: u8) -> Option<Decoded> {
        if self.rex != 0 {
            return None;
        }

        let map = if lead == 0xc5 {
            self.byte()?;
            1
        } else {
            let map = self.byte()? & 0x1f;
            self.byte()?;
            map
        };

        if !(1..=3).contains(&map) {
            return None;
        }

        let opcode = self.byte()?;
        // vzeroupper and vzeroall
        if map == 1 && opcode == 0x77 {
            return Some((InstructionKind::Other, None));
        }

        self.modrm()?;
        if tables::vex_has_imm8(map, opcode) {
            self.skip(1)?;
        }

        Some((InstructionKind::Other, None))
    }

    /// Decodes the length of an EVEX encoded instruction.
    fn evex(&mut self) -> Option<Decoded> {
        if self.rex != 0 {
            return None;
        }

        let map = self.byte()? & 0x07;
        self.skip(2)?;
        if !matches!(map, 1 | 2 | 3 | 5 | 6) {
            return None;
        }

        let opcode = self.byte()?;
        self.modrm()?;
        if tables::vex_has_imm8(map, opcode) {
            self.skip(1)?;
        }

        Some((InstructionKind::Other, None))
    }

    fn modrm(&mut self) -> Option<ModRm> {
        let byte = self.byte()?;
        let mode = byte >> 6;
        let digit = (byte >> 3) & 7;
        let rm_low = byte & 7;

        let mut modrm = ModRm {
            mode,
            digit,
            reg: digit | self.rex_bit(0x04),
            rm: rm_low | self.rex_bit(0x01),
            operand: EffectiveAddress::default(),
        };

        if mode == 3 {
            modrm.operand = EffectiveAddress {
                base: Some(modrm.rm),
                address_size: self.pointer_size(),
                ..EffectiveAddress::default()
            };
        } else if self.address_size() == 2 {
            modrm.operand = self.memory16(mode, rm_low)?;
        } else {
            modrm.operand = self.memory(mode, rm_low)?;
        }

        Some(modrm)
    }

    /// Decodes a 32- or 64-bit memory operand, including SIB and displacement.
    fn memory(&mut self, mode: u8, rm_low: u8) -> Option<EffectiveAddress> {
        let mut operand = EffectiveAddress {
            dereference: true,
            address_size: self.address_size(),
            ..EffectiveAddress::default()
        };

        let mut displacement_size = match mode {
            1 => 1,
            2 => 4,
            _ => 0,
        };

        if rm_low == 4 {
            let sib = self.byte()?;
            let index = ((sib >> 3) & 7) | self.rex_bit(0x02);
            let base = sib & 7;

            operand.scale = sib >> 6;
            operand.index = (index != ENCODING_SP).then_some(index);

            if base == ENCODING_BP && mode == 0 {
                displacement_size = 4;
            } else {
                operand.base = Some(base | self.rex_bit(0x01));
            }
        } else if rm_low == ENCODING_BP && mode == 0 {
            // Absolute in 32-bit mode, relative to the next instruction in 64-bit mode.
            operand.rip_relative = self.is_64bit;
            displacement_size = 4;
        } else {
            operand.base = Some(rm_low | self.rex_bit(0x01));
        }

        if displacement_size > 0 {
            operand.displacement = self.signed(displacement_size)?;
        }

        Some(operand)
    }

    /// Decodes a 16-bit memory operand.
    fn memory16(&mut self, mode: u8, rm_low: u8) -> Option<EffectiveAddress> {
        const BX: u8 = 3;
        const BP: u8 = 5;
        const SI: u8 = 6;
        const DI: u8 = 7;

        let (base, index) = match rm_low {
            0 => (Some(BX), Some(SI)),
            1 => (Some(BX), Some(DI)),
            2 => (Some(BP), Some(SI)),
            3 => (Some(BP), Some(DI)),
            4 => (Some(SI), None),
            5 => (Some(DI), None),
            6 if mode == 0 => (None, None),
            6 => (Some(BP), None),
            _ => (Some(BX), None),
        };

        let displacement = match mode {
            0 if rm_low == 6 => self.signed(2)?,
            1 => self.signed(1)?,
            2 => self.signed(2)?,
            _ => 0,
        };

        Some(EffectiveAddress {
            base,
            index,
            scale: 0,
            displacement,
            dereference: true,
            rip_relative: false,
            address_size: 2,
        })
    }
}
