use similar_asserts::assert_eq;

use framewalk_cfi::{CfiSection, CfiSectionKind};
use framewalk_common::Arch;
use framewalk_debuginfo::{SymbolFile, SymbolTable};
use framewalk_testutils::{CfiBuilder, ElfBuilder, MockMemory, Program, SHF_ALLOC, SHF_EXECINSTR};
use framewalk_unwind::arch::{self, amd64, i386, Amd64, Architecture, I386};
use framewalk_unwind::{FrameBuilder, Registers, UnwindMethod, UnwindOptions};

type Error = Box<dyn std::error::Error>;

const BIAS: u64 = 0x5555_0000_0000;

const DW_RSP: u16 = 7;
const DW_RBP: u16 = 6;
const DW_RIP: u16 = 16;

/// Two functions: `leaf` at `0x1000` and `main` at `0x1020`, which calls `leaf`.
///
/// Both start with `push %rbp; mov %rsp,%rbp`, but only `leaf` is covered by `.eh_frame`.
fn text() -> Vec<u8> {
    let mut code = vec![0x90; 0x100];
    code[..4].copy_from_slice(&[0x55, 0x48, 0x89, 0xe5]);
    code[0x20..0x24].copy_from_slice(&[0x55, 0x48, 0x89, 0xe5]);
    // call 0x1000
    code[0x24..0x29].copy_from_slice(&[0xe8, 0xd7, 0xff, 0xff, 0xff]);
    code
}

fn eh_frame() -> Vec<u8> {
    let mut builder = CfiBuilder::eh_frame(0x2000, 8);
    let cie = builder.cie(
        1,
        -8,
        DW_RIP,
        &Program::new().def_cfa(DW_RSP, 8).offset(DW_RIP, 1),
    );
    let fde = Program::new()
        .def_cfa_offset(16)
        .offset(DW_RBP, 2)
        .advance_loc(4)
        .def_cfa_register(DW_RBP);
    builder.fde(cie, 0x1000, 0x20, &fde);
    builder.terminate();
    builder.finish()
}

fn image() -> Vec<u8> {
    ElfBuilder::new(true)
        .section(".text", 0x1000, SHF_ALLOC | SHF_EXECINSTR, &text())
        .section(".eh_frame", 0x2000, SHF_ALLOC, &eh_frame())
        .function("leaf", 0x1000, 0x20)
        .function("main", 0x1020, 0x40)
        .build()
}

#[test]
fn test_cfi_round_trip() -> Result<(), Error> {
    let mut builder = CfiBuilder::debug_frame(8);
    let cie = builder.cie(
        1,
        -8,
        DW_RIP,
        &Program::new()
            .def_cfa(DW_RBP, 16)
            .offset(DW_RIP, 1)
            .offset(DW_RBP, 2),
    );
    builder.fde(cie, 0x1000, 0x20, &Program::new());
    let section = CfiSection::new(CfiSectionKind::DebugFrame, builder.finish(), 0, 8);

    let row = section.unwind_row(0x1004)?.expect("row");
    let memory = MockMemory::new().with_words(0x7000, 8, &[0x7100, 0x40_1234]);
    let registers = Registers::new()
        .with(amd64::RIP, 0x1004)
        .with(amd64::RSP, 0x6fe0)
        .with(amd64::RBP, 0x7000)
        .with(amd64::RAX, 0xdead);

    assert_eq!(
        framewalk_unwind::compute_cfa(&Amd64, &row, &registers),
        Some(0x7010)
    );

    let caller = Amd64.unwind_cfi(&row, &registers, &memory).expect("caller");
    assert_eq!(caller.get(amd64::RIP), Some(0x40_1234));
    assert_eq!(caller.source(amd64::RIP), Some(0x7008));
    assert_eq!(caller.get(amd64::RBP), Some(0x7100));
    assert_eq!(caller.source(amd64::RBP), Some(0x7000));
    assert_eq!(caller.get(amd64::RSP), Some(0x7010));
    // Caller-saved registers may have been clobbered.
    assert_eq!(caller.get(amd64::RAX), None);

    Ok(())
}

#[test]
fn test_cfi_missing_base_register() -> Result<(), Error> {
    let mut builder = CfiBuilder::debug_frame(8);
    let cie = builder.cie(1, -8, DW_RIP, &Program::new().def_cfa(DW_RBP, 16));
    builder.fde(cie, 0x1000, 0x20, &Program::new());
    let section = CfiSection::new(CfiSectionKind::DebugFrame, builder.finish(), 0, 8);

    let row = section.unwind_row(0x1000)?.expect("row");
    let registers = Registers::new().with(amd64::RSP, 0x7000);
    assert!(Amd64
        .unwind_cfi(&row, &registers, &MockMemory::new())
        .is_none());

    Ok(())
}

#[test]
fn test_cfi_expression_rule_is_not_restored() -> Result<(), Error> {
    let mut builder = CfiBuilder::debug_frame(8);
    let cie = builder.cie(
        1,
        -8,
        DW_RIP,
        &Program::new()
            .def_cfa(DW_RBP, 16)
            .offset(DW_RIP, 1)
            .offset(DW_RBP, 2),
    );
    // rbp moved to a location described by a DWARF expression.
    builder.fde(cie, 0x1000, 0x20, &Program::new().expression(DW_RBP, &[0x76, 0x60]));
    let section = CfiSection::new(CfiSectionKind::DebugFrame, builder.finish(), 0, 8);

    let row = section.unwind_row(0x1004)?.expect("row");
    let memory = MockMemory::new().with_words(0x7000, 8, &[0x7100, 0x40_1234]);
    let registers = Registers::new()
        .with(amd64::RIP, 0x1004)
        .with(amd64::RSP, 0x6fe0)
        .with(amd64::RBP, 0x7000);

    let caller = Amd64.unwind_cfi(&row, &registers, &memory).expect("caller");
    assert_eq!(caller.get(amd64::RIP), Some(0x40_1234));
    assert_eq!(caller.get(amd64::RSP), Some(0x7010));
    assert_eq!(caller.get(amd64::RBP), None);

    Ok(())
}

#[test]
fn test_eh_frame_scenario() -> Result<(), Error> {
    let data = image();
    let module = SymbolFile::parse("demo", &data, BIAS)?;
    let arch = arch::for_target(module.object().target_name().unwrap_or_default())?;
    assert_eq!(arch.arch(), Arch::Amd64);

    // Inside the prologue, the CFA is still relative to the stack pointer.
    let row = module
        .unwind_row(CfiSectionKind::EhFrame, BIAS + 0x1002)?
        .expect("row");
    let memory = MockMemory::new().with_words(0x7ff0, 8, &[0x8010, BIAS + 0x1029]);
    let registers = Registers::new()
        .with(amd64::RIP, BIAS + 0x1002)
        .with(amd64::RSP, 0x7ff0);
    let caller = arch.unwind_cfi(&row, &registers, &memory).expect("caller");
    assert_eq!(caller.get(amd64::RSP), Some(0x8000));
    assert_eq!(caller.get(amd64::RBP), Some(0x8010));

    // After the frame setup at 0x1008, it is relative to the frame pointer.
    let row = module
        .unwind_row(CfiSectionKind::EhFrame, BIAS + 0x1008)?
        .expect("row");
    let registers = Registers::new()
        .with(amd64::RIP, BIAS + 0x1008)
        .with(amd64::RSP, 0x7fe0)
        .with(amd64::RBP, 0x7ff0);
    let caller = arch.unwind_cfi(&row, &registers, &memory).expect("caller");
    assert_eq!(caller.get(amd64::RIP), Some(BIAS + 0x1029));
    assert_eq!(caller.get(amd64::RSP), Some(0x8000));
    assert_eq!(caller.get(amd64::RBP), Some(0x8010));

    Ok(())
}

#[test]
fn test_prologue_entry() {
    let code = [0x55, 0x48, 0x89, 0xe5];
    let memory = MockMemory::new().with_words(0x7000, 8, &[0x40_1234]);
    let registers = Registers::new()
        .with(amd64::RIP, 0x1000)
        .with(amd64::RSP, 0x7000)
        .with(amd64::RBP, 0x7100);

    let caller = Amd64
        .unwind_by_prologue_bytes(&registers, &code, 0, &memory)
        .expect("caller");
    assert_eq!(caller.get(amd64::RIP), Some(0x40_1234));
    assert_eq!(caller.get(amd64::RSP), Some(0x7008));
    assert_eq!(caller.get(amd64::RBP), Some(0x7100));
}

#[test]
fn test_prologue_after_push() {
    let code = [0x55, 0x48, 0x89, 0xe5];
    let memory = MockMemory::new().with_words(0x6ff8, 8, &[0x7100, 0x40_1234]);
    let registers = Registers::new()
        .with(amd64::RIP, 0x1001)
        .with(amd64::RSP, 0x6ff8)
        .with(amd64::RBP, 0x7100);

    let caller = Amd64
        .unwind_by_prologue_bytes(&registers, &code, 1, &memory)
        .expect("caller");
    assert_eq!(caller.get(amd64::RIP), Some(0x40_1234));
    assert_eq!(caller.get(amd64::RBP), Some(0x7100));
    assert_eq!(caller.source(amd64::RBP), Some(0x6ff8));
    assert_eq!(caller.get(amd64::RSP), Some(0x7008));
}

#[test]
fn test_prologue_after_frame_setup() {
    // push %ebp; mov %esp,%ebp; push %esi; push %ebx
    let code = [0x55, 0x89, 0xe5, 0x56, 0x53];
    let memory = MockMemory::new()
        .with_words(0x6ff0, 4, &[0xb0, 0x51])
        .with_words(0x6ff8, 4, &[0x7100, 0x0804_8123]);
    let registers = Registers::new()
        .with(i386::EIP, 0x0804_9005)
        .with(i386::ESP, 0x6ff0)
        .with(i386::EBP, 0x6ff8)
        .with(i386::ESI, 0x1)
        .with(i386::EBX, 0x2);

    let caller = I386
        .unwind_by_prologue_bytes(&registers, &code, 5, &memory)
        .expect("caller");
    assert_eq!(caller.get(i386::EIP), Some(0x0804_8123));
    assert_eq!(caller.get(i386::EBP), Some(0x7100));
    assert_eq!(caller.get(i386::ESP), Some(0x7000));
    assert_eq!(caller.get(i386::ESI), Some(0x51));
    assert_eq!(caller.get(i386::EBX), Some(0xb0));
}

#[test]
fn test_prologue_mismatch() {
    // sub $0x8,%rsp
    let code = [0x48, 0x83, 0xec, 0x08];
    let memory = MockMemory::new().with_words(0x7000, 8, &[0x7100, 0x40_1234]);
    let registers = Registers::new()
        .with(amd64::RSP, 0x7000)
        .with(amd64::RBP, 0x7000);

    assert!(Amd64
        .unwind_by_prologue_bytes(&registers, &code, 4, &memory)
        .is_none());
}

#[test]
fn test_backtrace() -> Result<(), Error> {
    let data = image();
    let mut symbols = SymbolTable::new();
    symbols.add(SymbolFile::parse("demo", &data, BIAS)?);

    let memory = MockMemory::new()
        // Frame of `leaf`: saved frame pointer and return address into `main`.
        .with_words(0x7ff0, 8, &[0x8010, BIAS + 0x1029])
        // Frame of `main`: its caller has no module.
        .with_words(0x8010, 8, &[0x8100, 0x7777_0000])
        .with_words(0x8100, 8, &[0, 0]);

    let builder = FrameBuilder::new(arch::for_arch(Arch::Amd64).unwrap(), &symbols, &memory)
        .with_thread(42);

    let registers = Registers::new()
        .with(amd64::RIP, BIAS + 0x1008)
        .with(amd64::RSP, 0x7fe0)
        .with(amd64::RBP, 0x7ff0);
    let frames: Vec<_> = builder.backtrace(registers).collect();

    let methods: Vec<_> = frames.iter().map(|frame| frame.method()).collect();
    assert_eq!(
        methods,
        [
            UnwindMethod::Context,
            UnwindMethod::EhFrame,
            UnwindMethod::Prologue
        ]
    );

    assert_eq!(frames[1].call_site(), Some(BIAS + 0x1024));
    assert_eq!(frames[1].stack_pointer(), 0x8000);
    assert_eq!(frames[1].frame_pointer(), Some(0x8010));
    assert_eq!(frames[2].stack_pointer(), 0x8020);
    assert_eq!(frames[2].thread(), Some(42));
    assert!(frames[2].symbol().is_none());

    let output: Vec<_> = frames.iter().map(ToString::to_string).collect();
    insta::assert_snapshot!(output.join("\n"), @r###"
    #0 0x555500001008 in leaf+0x8
    #1 0x555500001029 in main+0x9
    #2 0x77770000 in ??
    "###);

    Ok(())
}

#[test]
fn test_backtrace_strategies_disabled() -> Result<(), Error> {
    let data = image();
    let mut symbols = SymbolTable::new();
    symbols.add(SymbolFile::parse("demo", &data, BIAS)?);

    let memory = MockMemory::new().with_words(0x7ff0, 8, &[0x8010, BIAS + 0x1029]);
    let options = UnwindOptions::new().cfi(false).prologue(false).frame_pointer(false);
    let builder = FrameBuilder::new(&Amd64, &symbols, &memory).with_options(options);

    let registers = Registers::new()
        .with(amd64::RIP, BIAS + 0x1008)
        .with(amd64::RSP, 0x7fe0)
        .with(amd64::RBP, 0x7ff0);
    assert_eq!(builder.backtrace(registers).count(), 1);

    Ok(())
}

#[test]
fn test_context_requires_stack_pointer() {
    let symbols = SymbolTable::new();
    let memory = MockMemory::new();
    let builder = FrameBuilder::new(&I386, &symbols, &memory);

    let registers = Registers::new().with(i386::EIP, 0x0804_8000);
    assert!(builder.context_frame(registers.clone()).is_none());
    assert_eq!(builder.backtrace(registers).count(), 0);
}

#[test]
fn test_signal_frame() {
    const TRAMPOLINE: u64 = 0x7f00_0000_1000;
    const STACK: u64 = 0x9000;

    // The saved mcontext: r8 to r15, rdi, rsi, rbp, rbx, rdx, rax, rcx, rsp, rip, eflags.
    let mut context = vec![0; 18];
    context[10] = 0xa000;
    context[15] = 0x9f00;
    context[16] = 0x40_1003;
    context[17] = 0x246;

    let memory = MockMemory::new()
        // mov $0xf,%rax; syscall
        .with_bytes(TRAMPOLINE, &[0x48, 0xc7, 0xc0, 0x0f, 0x00, 0x00, 0x00, 0x0f, 0x05])
        .with_words(STACK + 40, 8, &context)
        .with_words(0xa000, 8, &[0, 0]);

    let symbols = SymbolTable::new();
    let builder = FrameBuilder::new(&Amd64, &symbols, &memory);

    let registers = Registers::new()
        .with(amd64::RIP, TRAMPOLINE)
        .with(amd64::RSP, STACK);
    let frames: Vec<_> = builder.backtrace(registers).collect();
    assert_eq!(frames.len(), 2);

    let interrupted = &frames[1];
    assert_eq!(interrupted.method(), UnwindMethod::Special);
    assert!(interrupted.is_signal_frame());
    assert_eq!(interrupted.pc(), 0x40_1003);
    assert_eq!(interrupted.lookup_address(), 0x40_1003);
    assert_eq!(interrupted.call_site(), None);
    assert_eq!(interrupted.stack_pointer(), 0x9f00);
    assert_eq!(interrupted.frame_pointer(), Some(0xa000));
    assert_eq!(interrupted.registers().get(amd64::EFLAGS), Some(0x246));
    assert_eq!(
        interrupted.registers().source(amd64::RIP),
        Some(STACK + 40 + 128)
    );
}

#[test]
fn test_i386_sigreturn() {
    const STACK: u64 = 0xbfff_0000;

    // sigcontext: gs, fs, es, ds, edi, esi, ebp, esp, ebx, edx, ecx, eax, trapno, err, eip, cs,
    // eflags, esp_at_signal, ss.
    let mut context = vec![0; 19];
    context[6] = 0xbfff_1000;
    context[7] = 0xbfff_0f00;
    context[14] = 0x0804_8456;
    context[16] = 0x246;

    let memory = MockMemory::new()
        .with_bytes(0xb7fd_0000, &[0x58, 0xb8, 0x77, 0x00, 0x00, 0x00, 0xcd, 0x80])
        .with_words(STACK + 4, 4, &context);

    let symbols = SymbolTable::new();
    let builder = FrameBuilder::new(&I386, &symbols, &memory);
    let frame = builder
        .context_frame(
            Registers::new()
                .with(i386::EIP, 0xb7fd_0000)
                .with(i386::ESP, STACK),
        )
        .expect("context");

    let caller = builder.caller_frame(&frame).expect("caller");
    assert!(caller.is_signal_frame());
    assert_eq!(caller.pc(), 0x0804_8456);
    assert_eq!(caller.stack_pointer(), 0xbfff_0f00);
    assert_eq!(caller.frame_pointer(), Some(0xbfff_1000));
    assert_eq!(caller.registers().get(i386::EFLAGS), Some(0x246));
}
