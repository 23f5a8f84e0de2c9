use similar_asserts::assert_eq;

use framewalk_debuginfo::{SymbolFile, SymbolTable};
use framewalk_testutils::{ElfBuilder, MockMemory, SHF_ALLOC, SHF_EXECINSTR, SHF_WRITE};
use framewalk_unwind::arch::{amd64, i386, Amd64, Architecture, I386};
use framewalk_unwind::{
    classify_call_target, CallTarget, FrameBuilder, ManagedRuntime, Registers, ResolvedSymbol,
};

type Error = Box<dyn std::error::Error>;

const BIAS: u64 = 0x5555_0000_0000;
const BIAS32: u64 = 0xf7f0_0000;

/// The lazy binding part of a PLT entry: `push $index; jmp .plt`.
fn lazy_tail(index: u8, address: u64) -> Vec<u8> {
    let rel = 0x1000i64 - (address as i64 + 10);
    let mut tail = vec![0x68, index, 0, 0, 0, 0xe9];
    tail.extend_from_slice(&(rel as i32).to_le_bytes());
    tail
}

fn x86_64_plt() -> Vec<u8> {
    let mut plt = vec![0xcc; 0x30];
    // puts@plt: jmp *0x2002(%rip), slot 0x3018
    plt[0x10..0x16].copy_from_slice(&[0xff, 0x25, 0x02, 0x20, 0x00, 0x00]);
    plt[0x16..0x20].copy_from_slice(&lazy_tail(0, 0x1016));
    // malloc@plt: jmp *0x1ffa(%rip), slot 0x3020
    plt[0x20..0x26].copy_from_slice(&[0xff, 0x25, 0xfa, 0x1f, 0x00, 0x00]);
    plt[0x26..0x30].copy_from_slice(&lazy_tail(1, 0x1026));
    plt
}

fn x86_64_text() -> Vec<u8> {
    let mut text = vec![0x90; 0x20];
    // call puts@plt
    text[0x00..0x05].copy_from_slice(&[0xe8, 0x0b, 0xff, 0xff, 0xff]);
    // call malloc@plt
    text[0x05..0x0a].copy_from_slice(&[0xe8, 0x16, 0xff, 0xff, 0xff]);
    text
}

fn x86_64_module(data: &[u8]) -> Result<SymbolTable<'_>, Error> {
    let mut symbols = SymbolTable::new();
    symbols.add(SymbolFile::parse("/usr/bin/demo", data, BIAS)?);
    Ok(symbols)
}

fn x86_64_image() -> Vec<u8> {
    ElfBuilder::new(true)
        .section(".plt", 0x1000, SHF_ALLOC | SHF_EXECINSTR, &x86_64_plt())
        .section(".text", 0x1100, SHF_ALLOC | SHF_EXECINSTR, &x86_64_text())
        .section(".got.plt", 0x3000, SHF_ALLOC | SHF_WRITE, &[0; 0x28])
        .function("main", 0x1100, 0x20)
        .plt_import("puts")
        .plt_import("malloc")
        .build()
}

fn got_memory() -> MockMemory {
    MockMemory::new()
        // puts has not been called yet and points back into its stub.
        .with_words(BIAS + 0x3018, 8, &[BIAS + 0x1016])
        // malloc has been resolved into the C library.
        .with_words(BIAS + 0x3020, 8, &[0x7f00_1234_5678])
}

#[test]
fn test_unresolved_plt() -> Result<(), Error> {
    let data = x86_64_image();
    let symbols = x86_64_module(&data)?;
    let memory = got_memory();

    let call = Amd64.decode(&x86_64_text(), BIAS + 0x1100);
    let target = classify_call_target(
        &Amd64,
        &call,
        &Registers::new(),
        &symbols,
        &memory,
        None,
    );

    assert_eq!(
        target,
        Some(CallTarget::Plt {
            stub: BIAS + 0x1010,
            target: BIAS + 0x1016,
            is_start: true,
        })
    );
    assert_eq!(target.map(|t| t.address()), Some(BIAS + 0x1010));
    assert_eq!(
        symbols.lookup(BIAS + 0x1010).map(|s| s.name),
        Some("puts@plt".to_owned())
    );

    Ok(())
}

#[test]
fn test_resolved_plt() -> Result<(), Error> {
    let data = x86_64_image();
    let symbols = x86_64_module(&data)?;
    let memory = got_memory();

    let call = Amd64.decode(&x86_64_text()[5..], BIAS + 0x1105);
    let target = classify_call_target(
        &Amd64,
        &call,
        &Registers::new(),
        &symbols,
        &memory,
        None,
    )
    .expect("call target");

    assert_eq!(
        target,
        CallTarget::Plt {
            stub: BIAS + 0x1020,
            target: 0x7f00_1234_5678,
            is_start: false,
        }
    );
    assert_eq!(target.address(), 0x7f00_1234_5678);

    Ok(())
}

#[test]
fn test_direct_call() -> Result<(), Error> {
    let data = x86_64_image();
    let symbols = x86_64_module(&data)?;

    // call main
    let call = Amd64.decode(&[0xe8, 0xf1, 0xff, 0xff, 0xff], BIAS + 0x110a);
    let target = classify_call_target(
        &Amd64,
        &call,
        &Registers::new(),
        &symbols,
        &MockMemory::new(),
        None,
    );
    assert_eq!(target, Some(CallTarget::Direct(BIAS + 0x1100)));

    // Not a call at all.
    let nop = Amd64.decode(&[0x90], BIAS + 0x110a);
    let target = classify_call_target(
        &Amd64,
        &nop,
        &Registers::new(),
        &symbols,
        &MockMemory::new(),
        None,
    );
    assert_eq!(target, None);

    Ok(())
}

#[test]
fn test_i386_pic_plt() -> Result<(), Error> {
    let mut plt = vec![0xcc; 0x20];
    // jmp *0xc(%ebx)
    plt[0x10..0x16].copy_from_slice(&[0xff, 0xa3, 0x0c, 0x00, 0x00, 0x00]);
    plt[0x16..0x20].copy_from_slice(&lazy_tail(0, 0x1016));

    let data = ElfBuilder::new(false)
        .section(".plt", 0x1000, SHF_ALLOC | SHF_EXECINSTR, &plt)
        .section(".text", 0x1100, SHF_ALLOC | SHF_EXECINSTR, &[0x90; 0x10])
        .section(".got.plt", 0x3000, SHF_ALLOC | SHF_WRITE, &[0; 0x10])
        .build();
    let mut symbols = SymbolTable::new();
    symbols.add(SymbolFile::parse("libdemo.so", &data, BIAS32)?);

    let memory = MockMemory::new().with_words(BIAS32 + 0x300c, 4, &[BIAS32 + 0x1016]);
    let call = I386.decode(&[0xe8, 0x0b, 0xff, 0xff, 0xff], BIAS32 + 0x1100);

    // %ebx is not known in outer frames, the GOT address is used instead.
    let target = classify_call_target(
        &I386,
        &call,
        &Registers::new(),
        &symbols,
        &memory,
        None,
    );
    assert_eq!(
        target,
        Some(CallTarget::Plt {
            stub: BIAS32 + 0x1010,
            target: BIAS32 + 0x1016,
            is_start: true,
        })
    );

    // With a known %ebx, the slot is computed from it.
    let memory = MockMemory::new().with_words(0x5000 + 0xc, 4, &[0xf7e0_1000]);
    let registers = Registers::new().with(i386::EBX, 0x5000);
    let target = classify_call_target(&I386, &call, &registers, &symbols, &memory, None);
    assert_eq!(target.map(|t| t.address()), Some(0xf7e0_1000));

    Ok(())
}

#[derive(Debug)]
struct Jit;

impl ManagedRuntime for Jit {
    fn is_trampoline(&self, address: u64) -> bool {
        address == 0x6000_0000
    }

    fn lookup_symbol(&self, address: u64) -> Option<ResolvedSymbol> {
        (0x6000_0000..0x6000_1000)
            .contains(&address)
            .then(|| ResolvedSymbol {
                name: "Program.Main".to_owned(),
                address: 0x6000_0000,
                offset: address - 0x6000_0000,
                module: None,
            })
    }
}

#[test]
fn test_managed_trampoline() {
    let symbols = SymbolTable::new();
    let memory = MockMemory::new();

    // call *%rax
    let call = Amd64.decode(&[0xff, 0xd0], 0x40_1000);
    let registers = Registers::new().with(amd64::RAX, 0x6000_0000);

    let target = classify_call_target(&Amd64, &call, &registers, &symbols, &memory, Some(&Jit));
    assert_eq!(target, Some(CallTarget::Managed(0x6000_0000)));

    let registers = Registers::new().with(amd64::RAX, 0x6000_0040);
    let target = classify_call_target(&Amd64, &call, &registers, &symbols, &memory, Some(&Jit));
    assert_eq!(target, Some(CallTarget::Direct(0x6000_0040)));
}

#[test]
fn test_managed_symbols() {
    let symbols = SymbolTable::new();
    let memory = MockMemory::new();
    let jit = Jit;
    let builder = FrameBuilder::new(&Amd64, &symbols, &memory).with_runtime(&jit);

    let frame = builder
        .context_frame(
            Registers::new()
                .with(amd64::RIP, 0x6000_0010)
                .with(amd64::RSP, 0x7000),
        )
        .expect("frame");

    insta::assert_snapshot!(frame.to_string(), @"#0 0x60000010 in Program.Main+0x10");
    assert_eq!(frame.symbol().and_then(|s| s.module.as_deref()), None);
}
