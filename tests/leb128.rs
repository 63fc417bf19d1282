use soloader::leb128::Leb128Reader;

#[test]
fn unsigned_decoding() {
    let mut r = Leb128Reader::new(&[0xe5, 0x8e, 0x26]);
    assert_eq!(r.uleb128(), 624485);
    assert!(!r.has_more());

    let mut r = Leb128Reader::new(&[0x00]);
    assert_eq!(r.uleb128(), 0);

    let mut r = Leb128Reader::new(&[0x7f]);
    assert_eq!(r.uleb128(), 127);

    let mut r = Leb128Reader::new(&[0x80, 0x01]);
    assert_eq!(r.uleb128(), 128);
}

#[test]
fn signed_decoding() {
    let mut r = Leb128Reader::new(&[0xc0, 0xbb, 0x78]);
    assert_eq!(r.sleb128(), -123456);

    let mut r = Leb128Reader::new(&[0x7f]);
    assert_eq!(r.sleb128(), -1);

    let mut r = Leb128Reader::new(&[0x3f]);
    assert_eq!(r.sleb128(), 63);

    // 0x40 bit in the final byte sign-extends.
    let mut r = Leb128Reader::new(&[0x40]);
    assert_eq!(r.sleb128(), -64);

    let mut r = Leb128Reader::new(&[0x00]);
    assert_eq!(r.sleb128(), 0);
}

#[test]
fn consecutive_values_share_the_cursor() {
    let mut r = Leb128Reader::new(&[0x02, 0x7f, 0xe5, 0x8e, 0x26]);
    assert_eq!(r.uleb128(), 2);
    assert_eq!(r.sleb128(), -1);
    assert_eq!(r.uleb128(), 624485);
    assert!(!r.has_more());
    assert_eq!(r.position(), 5);
}

#[test]
fn truncated_input_yields_zero() {
    // Continuation bit set but no further bytes.
    let mut r = Leb128Reader::new(&[0x80]);
    assert_eq!(r.uleb128(), 0);

    let mut r = Leb128Reader::new(&[0xff]);
    assert_eq!(r.sleb128(), 0);

    let mut r = Leb128Reader::new(&[]);
    assert_eq!(r.uleb128(), 0);
    assert_eq!(r.sleb128(), 0);
    assert!(!r.has_more());
}
