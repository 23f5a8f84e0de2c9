use fallible_iterator::FallibleIterator;
use proptest::prelude::*;
use similar_asserts::assert_eq;

use framewalk_cfi::{CfaRule, CfiEntry, CfiErrorKind, CfiSection, CfiSectionKind, Column};
use framewalk_testutils::{CfiBuilder, Program};

type Error = Box<dyn std::error::Error>;

const RSP: u16 = 7;
const RBP: u16 = 6;
const RIP: u16 = 16;

/// The canonical x86-64 CIE: `CFA = rsp + 8`, return address at `CFA - 8`.
fn x86_64_cie() -> Program {
    Program::new().def_cfa(RSP, 8).offset(RIP, 1)
}

/// `push %rbp; mov %rsp,%rbp` as described by compilers.
fn frame_pointer_fde() -> Program {
    Program::new()
        .def_cfa_offset(16)
        .offset(RBP, 2)
        .advance_loc(4)
        .def_cfa_register(RBP)
}

fn debug_frame() -> CfiSection<'static> {
    let mut builder = CfiBuilder::debug_frame(8);
    let cie = builder.cie(1, -8, RIP, &x86_64_cie());
    builder.fde(cie, 0x1000, 0x20, &frame_pointer_fde());
    CfiSection::new(CfiSectionKind::DebugFrame, builder.finish(), 0, 8)
}

#[test]
fn test_advance_selects_later_rule() -> Result<(), Error> {
    let section = debug_frame();

    let row = section.unwind_row(0x1008)?.expect("row at 0x1008");
    assert_eq!(
        row.cfa(),
        CfaRule::RegisterOffset {
            register: RBP,
            offset: 16
        }
    );
    assert_eq!(row.address_range(), 0x1004..0x1020);
    insta::assert_snapshot!(row.to_string(), @"0x1004..0x1020: cfa=r6+16 r6=[cfa-16] r16=[cfa-8]");

    Ok(())
}

#[test]
fn test_entry_rule_before_advance() -> Result<(), Error> {
    let section = debug_frame();

    let row = section.unwind_row(0x1003)?.expect("row at 0x1003");
    assert_eq!(
        row.cfa(),
        CfaRule::RegisterOffset {
            register: RSP,
            offset: 16
        }
    );
    assert_eq!(row.address_range(), 0x1000..0x1004);
    assert_eq!(row.column(RBP), Some(Column::Offset(-16)));
    assert_eq!(row.column(RIP), Some(Column::Offset(-8)));

    Ok(())
}

#[test]
fn test_advance_to_exact_target() -> Result<(), Error> {
    let section = debug_frame();

    // The rules after an advance apply to the address advanced to.
    let row = section.unwind_row(0x1004)?.expect("row at 0x1004");
    assert_eq!(
        row.cfa(),
        CfaRule::RegisterOffset {
            register: RBP,
            offset: 16
        }
    );

    Ok(())
}

#[test]
fn test_outside_of_fde() -> Result<(), Error> {
    let section = debug_frame();

    assert!(section.unwind_row(0xfff)?.is_none());
    assert!(section.unwind_row(0x1020)?.is_none());

    Ok(())
}

#[test]
fn test_eh_frame_pc_relative() -> Result<(), Error> {
    let mut builder = CfiBuilder::eh_frame(0x40_0000, 8);
    let cie = builder.cie(1, -8, RIP, &x86_64_cie());
    builder.fde(cie, 0x40_1000, 0x10, &Program::new());
    builder.fde(cie, 0x40_1010, 0x30, &frame_pointer_fde());
    builder.terminate();

    let section = CfiSection::new(CfiSectionKind::EhFrame, builder.finish(), 0x40_0000, 8);

    let row = section.unwind_row(0x40_1005)?.expect("first fde");
    assert_eq!(row.address_range(), 0x40_1000..0x40_1010);
    insta::assert_snapshot!(row.to_string(), @"0x401000..0x401010: cfa=r7+8 r16=[cfa-8]");

    let fde = section.find_fde(0x40_1020)?.expect("second fde");
    assert_eq!(fde.pc_range(), 0x40_1010..0x40_1040);
    assert_eq!(fde.cie().augmentation(), "zR");

    Ok(())
}

#[test]
fn test_eh_frame_terminator_ends_iteration() -> Result<(), Error> {
    let mut builder = CfiBuilder::eh_frame(0x2000, 8);
    let cie = builder.cie(1, -8, RIP, &x86_64_cie());
    builder.fde(cie, 0x1000, 0x10, &Program::new());
    builder.terminate();
    let mut data = builder.finish();
    // Garbage after the terminator must not be parsed.
    data.extend_from_slice(&[0xff; 7]);

    let section = CfiSection::new(CfiSectionKind::EhFrame, data, 0x2000, 8);
    let entries: Vec<_> = section.entries().collect()?;
    assert_eq!(entries.len(), 2);
    assert!(matches!(entries[0], CfiEntry::Cie(_)));
    assert!(matches!(entries[1], CfiEntry::Fde(_)));

    Ok(())
}

#[test]
fn test_cie_is_cached() -> Result<(), Error> {
    let mut builder = CfiBuilder::debug_frame(8);
    let cie = builder.cie(1, -8, RIP, &x86_64_cie());
    builder.fde(cie, 0x1000, 0x10, &Program::new());
    builder.fde(cie, 0x1010, 0x10, &Program::new());
    let section = CfiSection::new(CfiSectionKind::DebugFrame, builder.finish(), 0, 8);

    assert!(section.cache().is_empty());
    section.unwind_row(0x1018)?;
    assert_eq!(section.cache().len(), 1);

    let first = section.cie_at(cie)?;
    let second = section.cie_at(cie)?;
    assert!(std::sync::Arc::ptr_eq(&first, &second));

    Ok(())
}

#[test]
fn test_remember_restore_state() -> Result<(), Error> {
    let program = Program::new()
        .def_cfa_offset(16)
        .offset(RBP, 2)
        .advance_loc(1)
        .remember_state()
        .def_cfa_offset(8)
        .restore(RBP)
        .advance_loc(1)
        .restore_state()
        .advance_loc(1)
        .args_size(16);

    let mut builder = CfiBuilder::debug_frame(8);
    let cie = builder.cie(1, -8, RIP, &x86_64_cie());
    builder.fde(cie, 0x1000, 0x10, &program);
    let section = CfiSection::new(CfiSectionKind::DebugFrame, builder.finish(), 0, 8);

    let epilogue = section.unwind_row(0x1001)?.expect("epilogue row");
    assert_eq!(
        epilogue.cfa(),
        CfaRule::RegisterOffset {
            register: RSP,
            offset: 8
        }
    );
    assert_eq!(epilogue.column(RBP), None);

    let restored = section.unwind_row(0x1002)?.expect("restored row");
    assert_eq!(
        restored.cfa(),
        CfaRule::RegisterOffset {
            register: RSP,
            offset: 16
        }
    );
    assert_eq!(restored.column(RBP), Some(Column::Offset(-16)));
    assert_eq!(restored.args_size(), 0);

    let last = section.unwind_row(0x1003)?.expect("last row");
    assert_eq!(last.args_size(), 16);

    Ok(())
}

#[test]
fn test_register_rules() -> Result<(), Error> {
    let program = Program::new()
        .same_value(3)
        .undefined(12)
        .register(13, 0)
        .val_offset(14, 2)
        .offset_sf(15, 3);

    let mut builder = CfiBuilder::debug_frame(8);
    let cie = builder.cie(1, -8, RIP, &x86_64_cie());
    builder.fde(cie, 0x1000, 0x10, &program);
    let section = CfiSection::new(CfiSectionKind::DebugFrame, builder.finish(), 0, 8);

    let row = section.unwind_row(0x1000)?.expect("row");
    let columns: Vec<_> = row.columns().collect();
    assert_eq!(
        columns,
        vec![
            (3, Column::SameValue),
            (12, Column::Undefined),
            (13, Column::Register(0)),
            (14, Column::ValOffset(-16)),
            (15, Column::Offset(-24)),
            (RIP, Column::Offset(-8)),
        ]
    );

    Ok(())
}

#[test]
fn test_expression_cfa_is_reported() -> Result<(), Error> {
    let program = Program::new()
        .def_cfa_expression(&[0x77, 0x08])
        // DW_CFA_expression for r3 with a two byte block, skipped.
        .raw(&[0x10, 0x03, 0x02, 0x70, 0x00])
        .offset(RBP, 2);

    let mut builder = CfiBuilder::debug_frame(8);
    let cie = builder.cie(1, -8, RIP, &x86_64_cie());
    builder.fde(cie, 0x1000, 0x10, &program);
    let section = CfiSection::new(CfiSectionKind::DebugFrame, builder.finish(), 0, 8);

    let row = section.unwind_row(0x1000)?.expect("row");
    assert_eq!(row.cfa(), CfaRule::Expression);
    assert_eq!(row.column(3), Some(Column::Undefined));
    assert_eq!(row.column(RBP), Some(Column::Offset(-16)));

    Ok(())
}

#[test]
fn test_expression_replaces_earlier_rule() -> Result<(), Error> {
    const RBX: u16 = 3;

    // breg6 -16, breg6 -24
    let program = Program::new()
        .def_cfa_offset(16)
        .offset(RBP, 2)
        .offset(RBX, 3)
        .advance_loc(4)
        .expression(RBP, &[0x76, 0x70])
        .val_expression(RBX, &[0x76, 0x68]);

    let mut builder = CfiBuilder::debug_frame(8);
    let cie = builder.cie(1, -8, RIP, &x86_64_cie());
    builder.fde(cie, 0x1000, 0x10, &program);
    let section = CfiSection::new(CfiSectionKind::DebugFrame, builder.finish(), 0, 8);

    let before = section.unwind_row(0x1002)?.expect("row at 0x1002");
    assert_eq!(before.column(RBP), Some(Column::Offset(-16)));
    assert_eq!(before.column(RBX), Some(Column::Offset(-24)));

    let after = section.unwind_row(0x1008)?.expect("row at 0x1008");
    assert_eq!(after.column(RBP), Some(Column::Undefined));
    assert_eq!(after.column(RBX), Some(Column::Undefined));
    assert_eq!(after.column(RIP), Some(Column::Offset(-8)));
    assert_eq!(
        after.cfa(),
        CfaRule::RegisterOffset {
            register: RSP,
            offset: 16
        }
    );

    Ok(())
}

#[test]
fn test_restore_state_underflow() {
    let mut builder = CfiBuilder::debug_frame(8);
    let cie = builder.cie(1, -8, RIP, &x86_64_cie());
    builder.fde(cie, 0x1000, 0x10, &Program::new().restore_state());
    let section = CfiSection::new(CfiSectionKind::DebugFrame, builder.finish(), 0, 8)
        .with_file("libfoo.so");

    let error = section.unwind_row(0x1000).unwrap_err();
    assert_eq!(error.kind(), CfiErrorKind::BadInstruction);
    assert_eq!(error.file(), Some("libfoo.so"));
}

#[test]
fn test_truncated_entry() {
    let mut data = debug_frame().data().to_vec();
    // Claim a second entry longer than the remaining section.
    data.extend_from_slice(&0x100u32.to_le_bytes());
    data.extend_from_slice(&[0; 4]);
    let section = CfiSection::new(CfiSectionKind::DebugFrame, data, 0, 8).with_file("a.out");

    // Lookups matching the first FDE still succeed.
    assert!(section.unwind_row(0x1000).unwrap().is_some());

    let error = section.unwind_row(0x5000).unwrap_err();
    assert_eq!(error.kind(), CfiErrorKind::BadLength);
    insta::assert_snapshot!(error.to_string(), @"invalid cfi entry length at offset 0x38 in a.out");
}

#[test]
fn test_bad_cie_pointer() {
    let mut builder = CfiBuilder::debug_frame(8);
    builder.fde(0x400, 0x1000, 0x10, &Program::new());
    let section = CfiSection::new(CfiSectionKind::DebugFrame, builder.finish(), 0, 8);

    let error = section.unwind_row(0x1000).unwrap_err();
    assert_eq!(error.kind(), CfiErrorKind::BadCiePointer);
}

#[test]
fn test_i386_debug_frame() -> Result<(), Error> {
    const ESP: u16 = 4;
    const EBP: u16 = 5;
    const EIP: u16 = 8;

    let cie = Program::new().def_cfa(ESP, 4).offset(EIP, 1);
    let fde = Program::new()
        .advance_loc(1)
        .def_cfa_offset(8)
        .offset(EBP, 2)
        .advance_loc(2)
        .def_cfa_register(EBP);

    let mut builder = CfiBuilder::debug_frame(4);
    let cie = builder.cie(1, -4, EIP, &cie);
    builder.fde(cie, 0x8048000, 0x40, &fde);
    let section = CfiSection::new(CfiSectionKind::DebugFrame, builder.finish(), 0, 4);

    let row = section.unwind_row(0x8048010)?.expect("row");
    insta::assert_snapshot!(row.to_string(), @"0x8048003..0x8048040: cfa=r5+8 r5=[cfa-8] r8=[cfa-4]");

    Ok(())
}

#[test]
fn test_dwarf64_version4() -> Result<(), Error> {
    let mut data = Vec::new();

    // CIE: 64-bit length escape, version 4 with address and segment sizes
    data.extend_from_slice(&[0xff, 0xff, 0xff, 0xff]);
    data.extend_from_slice(&20u64.to_le_bytes());
    data.extend_from_slice(&u64::MAX.to_le_bytes());
    data.extend_from_slice(&[4, 0, 8, 0, 1, 0x78, 16]);
    data.extend_from_slice(&[0x0c, 7, 8, 0x90, 1]);

    // FDE referencing the CIE at offset 0
    data.extend_from_slice(&[0xff, 0xff, 0xff, 0xff]);
    data.extend_from_slice(&24u64.to_le_bytes());
    data.extend_from_slice(&0u64.to_le_bytes());
    data.extend_from_slice(&0x1000u64.to_le_bytes());
    data.extend_from_slice(&0x20u64.to_le_bytes());

    let section = CfiSection::new(CfiSectionKind::DebugFrame, data, 0, 8);
    let row = section.unwind_row(0x1010)?.expect("row");
    assert_eq!(
        row.cfa(),
        CfaRule::RegisterOffset {
            register: RSP,
            offset: 8
        }
    );
    assert_eq!(row.address_range(), 0x1000..0x1020);
    assert!(!row.is_signal_frame());

    Ok(())
}

#[test]
fn test_signal_frame_augmentation() -> Result<(), Error> {
    let mut data = Vec::new();

    // CIE with the `zS` augmentation and no augmentation data
    data.extend_from_slice(&17u32.to_le_bytes());
    data.extend_from_slice(&0xffff_ffffu32.to_le_bytes());
    data.extend_from_slice(&[1, b'z', b'S', 0, 1, 0x78, 16, 0]);
    data.extend_from_slice(&[0x0c, 7, 8, 0x90, 1]);

    data.extend_from_slice(&21u32.to_le_bytes());
    data.extend_from_slice(&0u32.to_le_bytes());
    data.extend_from_slice(&0x1000u64.to_le_bytes());
    data.extend_from_slice(&0x20u64.to_le_bytes());
    data.push(0);

    let section = CfiSection::new(CfiSectionKind::DebugFrame, data, 0, 8);
    let row = section.unwind_row(0x1000)?.expect("row");
    assert!(row.is_signal_frame());
    assert!(section.cie_at(0)?.is_signal_frame());

    Ok(())
}

proptest! {
    #[test]
    fn test_rows_are_deterministic(address in 0x1000u64..0x1020) {
        let section = debug_frame();

        let first = section.unwind_row(address).unwrap().unwrap();
        let second = section.unwind_row(address).unwrap().unwrap();
        prop_assert_eq!(&first, &second);
        prop_assert!(first.contains(address));
    }

    #[test]
    fn test_garbage_does_not_panic(data in proptest::collection::vec(any::<u8>(), 0..256), address: u64) {
        let section = CfiSection::new(CfiSectionKind::EhFrame, data, 0x1000, 8);
        let _ = section.unwind_row(address);
    }
}
