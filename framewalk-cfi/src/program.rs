//! Rule rows and the call frame instruction interpreter.

use std::fmt;
use std::ops::Range;

use gimli::{constants, Reader, ReaderOffset};
use smallvec::SmallVec;

use crate::entries::{CfiReader, PointerReader};
use crate::{CfiError, CfiErrorKind};

/// A rule recovering one register of the caller.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum Column {
    /// The register cannot be recovered.
    Undefined,
    /// The register holds the same value as in the callee.
    SameValue,
    /// The register was saved at `CFA + offset`.
    Offset(i64),
    /// The register's value is `CFA + offset` itself.
    ValOffset(i64),
    /// The register was saved in another register of the callee.
    Register(u16),
}

impl fmt::Display for Column {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Column::Undefined => write!(f, "undefined"),
            Column::SameValue => write!(f, "same"),
            Column::Offset(offset) => write!(f, "[cfa{offset:+}]"),
            Column::ValOffset(offset) => write!(f, "cfa{offset:+}"),
            Column::Register(register) => write!(f, "r{register}"),
        }
    }
}

/// The rule computing the Canonical Frame Address.
#[derive(Clone, Copy, Debug, Default, Eq, Hash, PartialEq)]
pub enum CfaRule {
    /// No rule has been defined yet.
    #[default]
    Undefined,
    /// `CFA = register + offset`.
    RegisterOffset {
        /// DWARF number of the base register.
        register: u16,
        /// Unfactored byte offset added to the register.
        offset: i64,
    },
    /// The CFA is computed by a DWARF expression, which is not evaluated.
    Expression,
}

impl fmt::Display for CfaRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            CfaRule::Undefined => write!(f, "undefined"),
            CfaRule::RegisterOffset { register, offset } => write!(f, "r{register}{offset:+}"),
            CfaRule::Expression => write!(f, "expr"),
        }
    }
}

type Columns = SmallVec<[(u16, Column); 16]>;

/// The recovery rules in effect over a range of instruction addresses.
///
/// Registers without an explicit column have no rule. Whether such a register keeps its value is
/// up to the calling convention of the architecture.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct UnwindRow {
    start_address: u64,
    end_address: u64,
    cfa: CfaRule,
    columns: Columns,
    return_address_register: u16,
    signal_frame: bool,
    args_size: u64,
}

impl UnwindRow {
    pub(crate) fn new(return_address_register: u16, signal_frame: bool) -> Self {
        Self {
            return_address_register,
            signal_frame,
            ..Self::default()
        }
    }

    /// The instruction addresses covered by this row.
    pub fn address_range(&self) -> Range<u64> {
        self.start_address..self.end_address
    }

    /// Determines whether the given address is covered by this row.
    pub fn contains(&self, address: u64) -> bool {
        self.address_range().contains(&address)
    }

    /// The rule computing the CFA.
    pub fn cfa(&self) -> CfaRule {
        self.cfa
    }

    /// Returns the rule for the given DWARF register, if one was defined.
    pub fn column(&self, register: u16) -> Option<Column> {
        self.columns
            .iter()
            .find(|(r, _)| *r == register)
            .map(|(_, column)| *column)
    }

    /// Iterates all defined rules in ascending register order.
    pub fn columns(&self) -> impl Iterator<Item = (u16, Column)> + '_ {
        self.columns.iter().copied()
    }

    /// The DWARF register holding the return address, as declared by the CIE.
    pub fn return_address_register(&self) -> u16 {
        self.return_address_register
    }

    /// Returns `true` if the CIE marks this function as a signal handler trampoline.
    ///
    /// The PC of a signal frame points at the interrupted instruction, not after a call.
    pub fn is_signal_frame(&self) -> bool {
        self.signal_frame
    }

    /// Size of outgoing arguments pushed at this point, from `DW_CFA_GNU_args_size`.
    pub fn args_size(&self) -> u64 {
        self.args_size
    }

    pub(crate) fn set_range(&mut self, range: Range<u64>) {
        self.start_address = range.start;
        self.end_address = range.end;
    }

    fn set_column(&mut self, register: u16, column: Column) {
        match self.columns.binary_search_by_key(&register, |(r, _)| *r) {
            Ok(index) => self.columns[index].1 = column,
            Err(index) => self.columns.insert(index, (register, column)),
        }
    }

    fn clear_column(&mut self, register: u16) {
        self.columns.retain(|(r, _)| *r != register);
    }

    fn restore_column(&mut self, register: u16, initial: Option<&UnwindRow>) {
        match initial.and_then(|row| row.column(register)) {
            Some(column) => self.set_column(register, column),
            None => self.clear_column(register),
        }
    }
}

impl fmt::Display for UnwindRow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:#x}..{:#x}: cfa={}",
            self.start_address, self.end_address, self.cfa
        )?;
        for (register, column) in &self.columns {
            write!(f, " r{register}={column}")?;
        }
        Ok(())
    }
}

/// Everything the interpreter needs to know about the entry it executes.
pub(crate) struct ProgramContext<'a, 'd> {
    pub entry_offset: u64,
    pub code_alignment_factor: u64,
    pub data_alignment_factor: i64,
    pub pointers: &'a PointerReader<'d>,
    pub address_encoding: constants::DwEhPe,
}

impl<'d> ProgramContext<'_, 'd> {
    fn error(&self, kind: CfiErrorKind) -> CfiError {
        CfiError::new(kind, self.entry_offset)
    }

    fn read(&self, error: gimli::Error) -> CfiError {
        CfiError::read(self.entry_offset, error)
    }

    fn factored(&self, offset: i64) -> i64 {
        offset.wrapping_mul(self.data_alignment_factor)
    }

    fn skip_block(&self, program: &mut CfiReader<'d>) -> Result<(), CfiError> {
        let len = program.read_uleb128().map_err(|e| self.read(e))?;
        let len = usize::from_u64(len).map_err(|e| self.read(e))?;
        program.skip(len).map_err(|e| self.read(e))
    }
}

/// Executes a call frame program, updating `row` in place.
///
/// `initial` is the row produced by the CIE program and is used by `DW_CFA_restore`. When
/// executing the CIE program itself, it is `None`.
///
/// With a `target`, execution stops at the first advance that moves the location past the
/// target, leaving `row` with the rules in effect at the target. The row's range is narrowed to
/// the instructions it covers.
pub(crate) fn execute<'d>(
    mut program: CfiReader<'d>,
    cx: &ProgramContext<'_, 'd>,
    row: &mut UnwindRow,
    initial: Option<&UnwindRow>,
    target: Option<u64>,
) -> Result<(), CfiError> {
    let mut location = row.start_address;
    let mut stack: Vec<(CfaRule, Columns)> = Vec::new();

    while !program.is_empty() {
        let opcode = program.read_u8().map_err(|e| cx.read(e))?;
        let low = opcode & 0x3f;

        let next_location = match opcode & 0xc0 {
            0x40 => Some(advance(location, low.into(), cx)),
            0x80 => {
                let offset = program.read_uleb128().map_err(|e| cx.read(e))?;
                row.set_column(u16::from(low), Column::Offset(cx.factored(offset as i64)));
                None
            }
            0xc0 => {
                row.restore_column(u16::from(low), initial);
                None
            }
            _ => execute_extended(&mut program, cx, opcode, location, row, initial, &mut stack)?,
        };

        if let Some(next) = next_location {
            if target.map_or(false, |target| next > target) {
                row.end_address = next;
                return Ok(());
            }
            location = next;
            row.start_address = next;
        }
    }

    Ok(())
}

/// Executes an opcode outside of the three primary classes. Returns the new location for
/// opcodes that advance it.
fn execute_extended<'d>(
    program: &mut CfiReader<'d>,
    cx: &ProgramContext<'_, 'd>,
    opcode: u8,
    location: u64,
    row: &mut UnwindRow,
    initial: Option<&UnwindRow>,
    stack: &mut Vec<(CfaRule, Columns)>,
) -> Result<Option<u64>, CfiError> {
    let read = |e| cx.read(e);

    match constants::DwCfa(opcode) {
        constants::DW_CFA_nop => {}
        constants::DW_CFA_set_loc => {
            let address = cx
                .pointers
                .read(program, cx.address_encoding, cx.entry_offset)?;
            return Ok(Some(address));
        }
        constants::DW_CFA_advance_loc1 => {
            let delta = program.read_u8().map_err(read)?;
            return Ok(Some(advance(location, delta.into(), cx)));
        }
        constants::DW_CFA_advance_loc2 => {
            let delta = program.read_u16().map_err(read)?;
            return Ok(Some(advance(location, delta.into(), cx)));
        }
        constants::DW_CFA_advance_loc4 => {
            let delta = program.read_u32().map_err(read)?;
            return Ok(Some(advance(location, delta.into(), cx)));
        }
        constants::DW_CFA_offset_extended => {
            let register = program.read_uleb128_u16().map_err(read)?;
            let offset = program.read_uleb128().map_err(read)?;
            row.set_column(register, Column::Offset(cx.factored(offset as i64)));
        }
        constants::DW_CFA_offset_extended_sf => {
            let register = program.read_uleb128_u16().map_err(read)?;
            let offset = program.read_sleb128().map_err(read)?;
            row.set_column(register, Column::Offset(cx.factored(offset)));
        }
        constants::DW_CFA_GNU_negative_offset_extended => {
            let register = program.read_uleb128_u16().map_err(read)?;
            let offset = program.read_uleb128().map_err(read)?;
            row.set_column(register, Column::Offset(cx.factored((offset as i64).wrapping_neg())));
        }
        constants::DW_CFA_val_offset => {
            let register = program.read_uleb128_u16().map_err(read)?;
            let offset = program.read_uleb128().map_err(read)?;
            row.set_column(register, Column::ValOffset(cx.factored(offset as i64)));
        }
        constants::DW_CFA_val_offset_sf => {
            let register = program.read_uleb128_u16().map_err(read)?;
            let offset = program.read_sleb128().map_err(read)?;
            row.set_column(register, Column::ValOffset(cx.factored(offset)));
        }
        constants::DW_CFA_restore_extended => {
            let register = program.read_uleb128_u16().map_err(read)?;
            row.restore_column(register, initial);
        }
        constants::DW_CFA_undefined => {
            let register = program.read_uleb128_u16().map_err(read)?;
            row.set_column(register, Column::Undefined);
        }
        constants::DW_CFA_same_value => {
            let register = program.read_uleb128_u16().map_err(read)?;
            row.set_column(register, Column::SameValue);
        }
        constants::DW_CFA_register => {
            let register = program.read_uleb128_u16().map_err(read)?;
            let source = program.read_uleb128_u16().map_err(read)?;
            row.set_column(register, Column::Register(source));
        }
        constants::DW_CFA_remember_state => {
            stack.push((row.cfa, row.columns.clone()));
        }
        constants::DW_CFA_restore_state => {
            let (cfa, columns) = stack
                .pop()
                .ok_or_else(|| cx.error(CfiErrorKind::BadInstruction))?;
            row.cfa = cfa;
            row.columns = columns;
        }
        constants::DW_CFA_def_cfa => {
            let register = program.read_uleb128_u16().map_err(read)?;
            let offset = program.read_uleb128().map_err(read)?;
            row.cfa = CfaRule::RegisterOffset {
                register,
                offset: offset as i64,
            };
        }
        constants::DW_CFA_def_cfa_sf => {
            let register = program.read_uleb128_u16().map_err(read)?;
            let offset = program.read_sleb128().map_err(read)?;
            row.cfa = CfaRule::RegisterOffset {
                register,
                offset: cx.factored(offset),
            };
        }
        constants::DW_CFA_def_cfa_register => {
            let register = program.read_uleb128_u16().map_err(read)?;
            row.cfa = match row.cfa {
                CfaRule::RegisterOffset { offset, .. } => CfaRule::RegisterOffset { register, offset },
                _ => CfaRule::RegisterOffset {
                    register,
                    offset: 0,
                },
            };
        }
        constants::DW_CFA_def_cfa_offset => {
            let offset = program.read_uleb128().map_err(read)?;
            if let CfaRule::RegisterOffset { register, .. } = row.cfa {
                row.cfa = CfaRule::RegisterOffset {
                    register,
                    offset: offset as i64,
                };
            }
        }
        constants::DW_CFA_def_cfa_offset_sf => {
            let offset = program.read_sleb128().map_err(read)?;
            if let CfaRule::RegisterOffset { register, .. } = row.cfa {
                row.cfa = CfaRule::RegisterOffset {
                    register,
                    offset: cx.factored(offset),
                };
            }
        }
        constants::DW_CFA_def_cfa_expression => {
            cx.skip_block(program)?;
            row.cfa = CfaRule::Expression;
        }
        constants::DW_CFA_expression | constants::DW_CFA_val_expression => {
            // Expressions are not evaluated, so an earlier rule for the register no longer holds.
            let register = program.read_uleb128_u16().map_err(read)?;
            cx.skip_block(program)?;
            row.set_column(register, Column::Undefined);
        }
        constants::DW_CFA_GNU_args_size => {
            row.args_size = program.read_uleb128().map_err(read)?;
        }
        constants::DW_CFA_GNU_window_save => {}
        other => {
            tracing::trace!(opcode = %other, "skipping unknown call frame instruction");
        }
    }

    Ok(None)
}

fn advance(location: u64, delta: u64, cx: &ProgramContext<'_, '_>) -> u64 {
    location.wrapping_add(delta.wrapping_mul(cx.code_alignment_factor))
}
