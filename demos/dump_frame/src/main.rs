use std::fs::File;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Arg, ArgMatches, Command};
use memmap2::Mmap;

use framewalk::cfi::CfiSectionKind;
use framewalk::debuginfo::SymbolFile;
use framewalk::unwind::arch;
use framewalk::unwind::decoder::{InstructionKind, MAX_INSTRUCTION_LENGTH};

fn parse_address(value: &str) -> Result<u64, String> {
    let parsed = match value.strip_prefix("0x") {
        Some(hex) => u64::from_str_radix(hex, 16),
        None => value.parse(),
    };
    parsed.map_err(|e| e.to_string())
}

fn hex_bytes(bytes: &[u8]) -> String {
    bytes
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect::<Vec<_>>()
        .join(" ")
}

fn execute(matches: &ArgMatches) -> Result<()> {
    let path = matches
        .get_one::<PathBuf>("path")
        .context("missing path")?;
    let address = *matches
        .get_one::<u64>("address")
        .context("missing address")?;

    let file = File::open(path).context("failed to open file")?;
    // SAFETY: the file must not be truncated while it is mapped.
    let data = unsafe { Mmap::map(&file) }.context("failed to map file")?;
    let module = SymbolFile::parse(path.display().to_string(), &data, 0)
        .context("failed to parse file")?;

    let target = match matches.get_one::<String>("target") {
        Some(target) => target.as_str(),
        None => module
            .object()
            .target_name()
            .context("unsupported architecture")?,
    };
    let arch = arch::for_target(target).with_context(|| format!("unsupported target {target}"))?;

    println!("module:      {}", module.name());
    println!("target:      {}", arch.target_name());
    match module.section_at(address) {
        Some(section) => println!("section:     .{}", section.name),
        None => println!("section:     ??"),
    }
    match module.lookup(address) {
        Some(symbol) => println!("symbol:      {symbol}"),
        None => println!("symbol:      ??"),
    }

    for kind in [CfiSectionKind::DebugFrame, CfiSectionKind::EhFrame] {
        match module.unwind_row(kind, address) {
            Ok(Some(row)) => println!("{:<12} {row}", format!("{kind}:")),
            Ok(None) => println!("{:<12} no entry", format!("{kind}:")),
            Err(error) => println!("{:<12} {error}", format!("{kind}:")),
        }
    }

    let Some(code) = module.code_bytes(address, MAX_INSTRUCTION_LENGTH) else {
        println!("instruction: not backed by the file");
        return Ok(());
    };

    let instruction = arch.decode(code, address);
    match instruction.kind() {
        InstructionKind::Unknown => println!("instruction: ?? [{}]", hex_bytes(code)),
        kind => println!(
            "instruction: {:?} [{}]",
            kind,
            hex_bytes(instruction.raw_bytes())
        ),
    }
    if let Some(target) = instruction.target() {
        println!("target:      {target:#x}");
    }

    Ok(())
}

fn main() {
    tracing_subscriber::fmt::init();

    let matches = Command::new("dump_frame")
        .about("Prints the symbol, call frame information and instruction at an address")
        .arg(
            Arg::new("path")
                .required(true)
                .value_name("PATH")
                .help("Path to the ELF file")
                .value_parser(clap::value_parser!(PathBuf))
                .index(1),
        )
        .arg(
            Arg::new("address")
                .required(true)
                .value_name("ADDRESS")
                .help("The virtual address to inspect, in hex with a 0x prefix or decimal")
                .value_parser(parse_address)
                .index(2),
        )
        .arg(
            Arg::new("target")
                .long("target")
                .value_name("NAME")
                .help("Overrides the BFD target declared by the file, such as elf32-i386"),
        )
        .get_matches();

    match execute(&matches) {
        Ok(()) => (),
        Err(e) => eprintln!("{e:?}"),
    };
}
