use crate::{sleb128, uleb128};

/// Builds a call frame instruction program.
///
/// Register numbers are DWARF numbers. Offsets passed to [`offset`](Self::offset) and
/// [`val_offset`](Self::val_offset) are factored by the CIE's data alignment factor when
/// interpreted, and advances by the code alignment factor.
#[derive(Clone, Debug, Default)]
pub struct Program {
    bytes: Vec<u8>,
}

impl Program {
    /// Creates an empty program.
    pub fn new() -> Self {
        Self::default()
    }

    fn op(mut self, opcode: u8) -> Self {
        self.bytes.push(opcode);
        self
    }

    fn uleb(mut self, value: u64) -> Self {
        self.bytes.extend(uleb128(value));
        self
    }

    fn sleb(mut self, value: i64) -> Self {
        self.bytes.extend(sleb128(value));
        self
    }

    /// `DW_CFA_def_cfa`: `CFA = register + offset`.
    pub fn def_cfa(self, register: u16, offset: u64) -> Self {
        self.op(0x0c).uleb(register.into()).uleb(offset)
    }

    /// `DW_CFA_def_cfa_sf` with a factored signed offset.
    pub fn def_cfa_sf(self, register: u16, offset: i64) -> Self {
        self.op(0x12).uleb(register.into()).sleb(offset)
    }

    /// `DW_CFA_def_cfa_register`.
    pub fn def_cfa_register(self, register: u16) -> Self {
        self.op(0x0d).uleb(register.into())
    }

    /// `DW_CFA_def_cfa_offset`.
    pub fn def_cfa_offset(self, offset: u64) -> Self {
        self.op(0x0e).uleb(offset)
    }

    /// `DW_CFA_def_cfa_expression` with an opaque expression.
    pub fn def_cfa_expression(self, expression: &[u8]) -> Self {
        self.op(0x0f).uleb(expression.len() as u64).raw(expression)
    }

    /// `DW_CFA_expression`: the register was saved at the address an opaque expression computes.
    pub fn expression(self, register: u16, expression: &[u8]) -> Self {
        self.op(0x10)
            .uleb(register.into())
            .uleb(expression.len() as u64)
            .raw(expression)
    }

    /// `DW_CFA_val_expression`: the register's value is computed by an opaque expression.
    pub fn val_expression(self, register: u16, expression: &[u8]) -> Self {
        self.op(0x16)
            .uleb(register.into())
            .uleb(expression.len() as u64)
            .raw(expression)
    }

    /// `DW_CFA_offset`, or `DW_CFA_offset_extended` for registers above 63.
    pub fn offset(self, register: u16, offset: u64) -> Self {
        if register < 64 {
            self.op(0x80 | register as u8).uleb(offset)
        } else {
            self.op(0x05).uleb(register.into()).uleb(offset)
        }
    }

    /// `DW_CFA_offset_extended_sf`.
    pub fn offset_sf(self, register: u16, offset: i64) -> Self {
        self.op(0x11).uleb(register.into()).sleb(offset)
    }

    /// `DW_CFA_val_offset`.
    pub fn val_offset(self, register: u16, offset: u64) -> Self {
        self.op(0x14).uleb(register.into()).uleb(offset)
    }

    /// `DW_CFA_restore`, or `DW_CFA_restore_extended` for registers above 63.
    pub fn restore(self, register: u16) -> Self {
        if register < 64 {
            self.op(0xc0 | register as u8)
        } else {
            self.op(0x06).uleb(register.into())
        }
    }

    /// `DW_CFA_undefined`.
    pub fn undefined(self, register: u16) -> Self {
        self.op(0x07).uleb(register.into())
    }

    /// `DW_CFA_same_value`.
    pub fn same_value(self, register: u16) -> Self {
        self.op(0x08).uleb(register.into())
    }

    /// `DW_CFA_register`.
    pub fn register(self, register: u16, source: u16) -> Self {
        self.op(0x09).uleb(register.into()).uleb(source.into())
    }

    /// `DW_CFA_remember_state`.
    pub fn remember_state(self) -> Self {
        self.op(0x0a)
    }

    /// `DW_CFA_restore_state`.
    pub fn restore_state(self) -> Self {
        self.op(0x0b)
    }

    /// `DW_CFA_GNU_args_size`.
    pub fn args_size(self, size: u64) -> Self {
        self.op(0x2e).uleb(size)
    }

    /// Advances the location by `delta` code units with the smallest encoding.
    pub fn advance_loc(self, delta: u32) -> Self {
        if delta < 0x40 {
            self.op(0x40 | delta as u8)
        } else if delta <= 0xff {
            self.op(0x02).raw(&[delta as u8])
        } else if delta <= 0xffff {
            self.op(0x03).raw(&(delta as u16).to_le_bytes())
        } else {
            self.op(0x04).raw(&delta.to_le_bytes())
        }
    }

    /// `DW_CFA_nop`.
    pub fn nop(self) -> Self {
        self.op(0x00)
    }

    /// Appends raw bytes, for opcodes without a dedicated method.
    pub fn raw(mut self, bytes: &[u8]) -> Self {
        self.bytes.extend_from_slice(bytes);
        self
    }

    /// The encoded program.
    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }
}

/// Builds the contents of a `.debug_frame` or `.eh_frame` section.
///
/// `.eh_frame` entries use the `zR` augmentation with PC-relative, signed 4-byte addresses, as
/// emitted by GCC and Clang. `.debug_frame` entries use version 3 CIEs and absolute addresses.
#[derive(Clone, Debug)]
pub struct CfiBuilder {
    eh_frame: bool,
    address: u64,
    address_size: u8,
    data: Vec<u8>,
}

impl CfiBuilder {
    /// Starts a `.debug_frame` section.
    pub fn debug_frame(address_size: u8) -> Self {
        Self {
            eh_frame: false,
            address: 0,
            address_size,
            data: Vec::new(),
        }
    }

    /// Starts an `.eh_frame` section linked at `address`.
    pub fn eh_frame(address: u64, address_size: u8) -> Self {
        Self {
            eh_frame: true,
            address,
            address_size,
            data: Vec::new(),
        }
    }

    fn begin_entry(&mut self) -> usize {
        let start = self.data.len();
        self.data.extend_from_slice(&[0; 4]);
        start
    }

    fn end_entry(&mut self, start: usize) {
        while (self.data.len() - start) % usize::from(self.address_size) != 0 {
            self.data.push(0x00);
        }
        let length = (self.data.len() - start - 4) as u32;
        self.data[start..start + 4].copy_from_slice(&length.to_le_bytes());
    }

    fn address(&mut self, value: u64) {
        let bytes = value.to_le_bytes();
        self.data
            .extend_from_slice(&bytes[..usize::from(self.address_size)]);
    }

    /// Appends a CIE and returns its section offset.
    pub fn cie(
        &mut self,
        code_alignment_factor: u64,
        data_alignment_factor: i64,
        return_address_register: u16,
        program: &Program,
    ) -> u64 {
        let start = self.begin_entry();

        if self.eh_frame {
            self.data.extend_from_slice(&0u32.to_le_bytes());
            self.data.push(1);
            self.data.extend_from_slice(b"zR\0");
        } else {
            self.data.extend_from_slice(&u32::MAX.to_le_bytes());
            self.data.push(3);
            self.data.push(0);
        }

        self.data.extend(uleb128(code_alignment_factor));
        self.data.extend(sleb128(data_alignment_factor));

        if self.eh_frame {
            self.data.push(return_address_register as u8);
            self.data.extend(uleb128(1));
            // DW_EH_PE_pcrel | DW_EH_PE_sdata4
            self.data.push(0x1b);
        } else {
            self.data.extend(uleb128(return_address_register.into()));
        }

        self.data.extend_from_slice(program.bytes());
        self.end_entry(start);
        start as u64
    }

    /// Appends an FDE covering `[start, start + length)` and returns its section offset.
    pub fn fde(&mut self, cie: u64, start: u64, length: u64, program: &Program) -> u64 {
        let entry = self.begin_entry();

        let id_offset = self.data.len() as u64;
        if self.eh_frame {
            self.data
                .extend_from_slice(&((id_offset - cie) as u32).to_le_bytes());
            let field_address = self.address + self.data.len() as u64;
            let relative = start.wrapping_sub(field_address) as i32;
            self.data.extend_from_slice(&relative.to_le_bytes());
            self.data.extend_from_slice(&(length as u32).to_le_bytes());
            self.data.extend(uleb128(0));
        } else {
            self.data.extend_from_slice(&(cie as u32).to_le_bytes());
            self.address(start);
            self.address(length);
        }

        self.data.extend_from_slice(program.bytes());
        self.end_entry(entry);
        entry as u64
    }

    /// Appends the zero length entry ending an `.eh_frame` section.
    pub fn terminate(&mut self) {
        self.data.extend_from_slice(&[0; 4]);
    }

    /// Returns the section contents built so far.
    pub fn finish(self) -> Vec<u8> {
        self.data
    }
}
