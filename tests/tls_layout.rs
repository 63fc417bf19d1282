use soloader::tls::{TlsModuleTable, TlsSegment};

fn seg(align: usize, memsz: usize, owner: usize) -> TlsSegment {
    TlsSegment {
        align,
        memsz,
        filesz: memsz,
        init_image: 0,
        owner,
    }
}

#[test]
fn offsets_are_sequential_and_aligned() {
    let mut table = TlsModuleTable::new();

    let a = table.register(seg(16, 24, 0x1000)).unwrap();
    let b = table.register(seg(8, 10, 0x2000)).unwrap();
    let c = table.register(seg(16, 4, 0x3000)).unwrap();

    assert_eq!((a, b, c), (1, 2, 3));
    assert_eq!(table.block_offset(a, 0), Some(0));
    assert_eq!(table.block_offset(b, 0), Some(24));
    // 24 + 10 = 34, aligned up to 48 for the 16-byte module.
    assert_eq!(table.block_offset(c, 0), Some(48));
    assert_eq!(table.static_size(), 52);
    assert_eq!(table.static_align_max(), 16);
}

#[test]
fn static_size_grows_monotonically_across_reuse() {
    let mut table = TlsModuleTable::new();
    let a = table.register(seg(8, 32, 0xa)).unwrap();
    let b = table.register(seg(8, 32, 0xb)).unwrap();
    let before = table.static_size();

    table.unregister(0xa);
    assert!(table.block_offset(a, 0).is_none());
    // Slot is reused, but the layout keeps growing; offsets never overlap.
    let c = table.register(seg(8, 16, 0xc)).unwrap();
    assert_eq!(c, a);
    let c_off = table.block_offset(c, 0).unwrap();
    assert!(c_off >= before);
    assert!(table.static_size() > before);
    // b's layout is untouched.
    assert_eq!(table.block_offset(b, 0), Some(32));
}

#[test]
fn bounds_and_id_validation() {
    let mut table = TlsModuleTable::new();
    let a = table.register(seg(8, 16, 0x1)).unwrap();

    assert_eq!(table.block_offset(a, 15), Some(15));
    // One past the module's (and block's) end.
    assert!(table.block_offset(a, 16).is_none());
    // Module id 0 is reserved.
    assert!(table.block_offset(0, 0).is_none());
    // Never-registered module.
    assert!(table.block_offset(7, 0).is_none());
    assert!(table.block_offset(soloader::tls::MAX_TLS_MODULES, 0).is_none());
}

#[test]
fn interior_offsets_stay_inside_the_block() {
    let mut table = TlsModuleTable::new();
    let a = table.register(seg(8, 16, 0x1)).unwrap();
    let b = table.register(seg(8, 16, 0x2)).unwrap();

    // a's offsets may run into b's range arithmetically, but stay inside
    // the static block.
    for off in 0..16 {
        let abs = table.block_offset(a, off).unwrap();
        assert!(abs < table.static_size());
    }
    assert_eq!(table.block_offset(b, 0), Some(16));
}

#[test]
fn generation_bumps() {
    let mut table = TlsModuleTable::new();
    assert_eq!(table.generation(), 0);
    table.bump_generation();
    table.bump_generation();
    assert_eq!(table.generation(), 2);
}

#[test]
fn zero_alignment_is_treated_as_one() {
    let mut table = TlsModuleTable::new();
    let a = table.register(seg(0, 5, 0x1)).unwrap();
    let b = table.register(seg(0, 3, 0x2)).unwrap();
    assert_eq!(table.block_offset(a, 0), Some(0));
    assert_eq!(table.block_offset(b, 0), Some(5));
    assert_eq!(table.static_align_max(), 1);
}

#[test]
fn slot_exhaustion_returns_none() {
    let mut table = TlsModuleTable::new();
    for i in 1..soloader::tls::MAX_TLS_MODULES {
        assert_eq!(table.register(seg(8, 8, i)), Some(i));
    }
    assert_eq!(table.register(seg(8, 8, 0xdead)), None);
}
