mod common;

use common::{TestSym, build_dylib, write_temp};
use soloader::image::ElfImage;

const BASE: usize = 0x7f00_0000_0000;

fn test_syms() -> Vec<TestSym> {
    vec![
        TestSym::func("add_numbers", 0x1040, 0x20),
        TestSym::func("sum_array", 0x1060, 0x40),
        TestSym::func("compute_average", 0x10a0, 0x30),
        TestSym::object("global_var", 0x2000, 8),
        TestSym::func("weak_thing", 0x1100, 8).weak(),
        TestSym::func("missing_ext", 0, 0).undefined(),
    ]
}

fn load_fixture() -> ElfImage {
    common::init_logging();
    let bytes = build_dylib(&test_syms(), 0, 0);
    let path = write_temp("image", &bytes);
    ElfImage::create(path.to_str().unwrap(), Some(BASE)).unwrap()
}

#[test]
fn hash_lookups_agree() {
    let image = load_fixture();
    for sym in test_syms() {
        if sym.shndx == 0 {
            continue;
        }
        let gnu = image.gnu_hash_lookup(sym.name).unwrap();
        let sysv = image.sysv_hash_lookup(sym.name).unwrap();
        let linear = image.linear_lookup(sym.name).unwrap();
        let combined = image.find_symbol_offset(sym.name).unwrap();
        assert_eq!(gnu.value, sym.value as usize, "gnu {}", sym.name);
        assert_eq!(sysv.value, gnu.value, "sysv {}", sym.name);
        assert_eq!(linear.value, gnu.value, "linear {}", sym.name);
        assert_eq!(combined.value, gnu.value, "combined {}", sym.name);
        assert_eq!(gnu.bind, sym.bind);
        assert_eq!(gnu.stype, sym.stype);
    }
}

#[test]
fn undefined_symbols_are_rejected() {
    let image = load_fixture();
    assert!(image.gnu_hash_lookup("missing_ext").is_none());
    assert!(image.sysv_hash_lookup("missing_ext").is_none());
    assert!(image.linear_lookup("missing_ext").is_none());
    assert!(image.find_symbol_offset("missing_ext").is_none());
}

#[test]
fn unknown_names_miss() {
    let image = load_fixture();
    assert!(image.find_symbol_offset("no_such_symbol_here").is_none());
    assert!(image.find_symbol_offset("").is_none());
}

#[test]
fn address_resolution_applies_base_and_bias() {
    let image = load_fixture();
    assert_eq!(image.bias(), 0);
    let sym = image.find_symbol_address("add_numbers").unwrap();
    assert_eq!(sym.addr, BASE + 0x1040);

    let offset = image.find_symbol_offset("sum_array").unwrap();
    let addr = image.find_symbol_address("sum_array").unwrap();
    assert_eq!(addr.addr, BASE + offset.value - image.bias());
}

#[test]
fn bias_falls_back_to_vaddr_minus_offset() {
    common::init_logging();
    let bytes = build_dylib(&test_syms(), 0x401000, 0x1000);
    let path = write_temp("biased", &bytes);
    let image = ElfImage::create(path.to_str().unwrap(), Some(BASE)).unwrap();
    assert_eq!(image.bias(), 0x400000);

    let sym = image.find_symbol_address("add_numbers").unwrap();
    assert_eq!(sym.addr, BASE + 0x1040 - 0x400000);
    assert_eq!(image.load_bias(), BASE - 0x400000);
}

#[test]
fn reverse_lookup_finds_containing_symbol() {
    let image = load_fixture();
    let (name, start) = image.symbol_at(BASE + 0x1040).unwrap();
    assert_eq!(name.to_str().unwrap(), "add_numbers");
    assert_eq!(start, BASE + 0x1040);

    // Interior address maps to the same symbol.
    let (name, _) = image.symbol_at(BASE + 0x1040 + 0x1f).unwrap();
    assert_eq!(name.to_str().unwrap(), "add_numbers");

    // One past the end belongs to the next symbol or nothing.
    let miss = image.symbol_at(BASE + 0x3000);
    assert!(miss.is_none());
}

#[test]
fn rejects_foreign_headers() {
    common::init_logging();
    let good = build_dylib(&test_syms(), 0, 0);

    let mut bad_magic = good.clone();
    bad_magic[0] = 0x7e;
    let path = write_temp("badmagic", &bad_magic);
    assert!(ElfImage::create(path.to_str().unwrap(), Some(BASE)).is_err());

    let mut bad_class = good.clone();
    bad_class[4] = 1; // ELFCLASS32
    let path = write_temp("badclass", &bad_class);
    assert!(ElfImage::create(path.to_str().unwrap(), Some(BASE)).is_err());

    let mut bad_machine = good.clone();
    bad_machine[18] = 62; // EM_X86_64
    bad_machine[19] = 0;
    let path = write_temp("badmachine", &bad_machine);
    assert!(ElfImage::create(path.to_str().unwrap(), Some(BASE)).is_err());

    let mut bad_type = good.clone();
    bad_type[16] = 1; // ET_REL
    bad_type[17] = 0;
    let path = write_temp("badtype", &bad_type);
    assert!(ElfImage::create(path.to_str().unwrap(), Some(BASE)).is_err());

    let mut no_phdrs = good.clone();
    no_phdrs[32..40].copy_from_slice(&0u64.to_le_bytes()); // e_phoff
    let path = write_temp("nophdr", &no_phdrs);
    assert!(ElfImage::create(path.to_str().unwrap(), Some(BASE)).is_err());
}

#[test]
fn out_of_bounds_sections_are_ignored_not_fatal() {
    common::init_logging();
    let mut bytes = build_dylib(&test_syms(), 0, 0);
    // Push e_shoff far past the end of the file.
    bytes[40..48].copy_from_slice(&(1u64 << 40).to_le_bytes());
    let path = write_temp("badshoff", &bytes);
    let image = ElfImage::create(path.to_str().unwrap(), Some(BASE)).unwrap();
    assert!(image.find_symbol_offset("add_numbers").is_none());
}

#[test]
fn missing_file_fails() {
    common::init_logging();
    assert!(ElfImage::create("/nonexistent/definitely-not-here.so", Some(BASE)).is_err());
}
