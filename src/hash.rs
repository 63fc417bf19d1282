//! ELF symbol hash tables.
//!
//! Both the GNU and the traditional SYSV hash tables are parsed out of the
//! image's owned file copy; the descriptors below hold file-buffer offsets
//! rather than pointers so an [`crate::image::ElfImage`] stays movable.

/// Compute the GNU hash of a symbol name.
#[inline]
pub fn gnu_hash(name: &[u8]) -> u32 {
    let mut hash = 5381u32;
    for byte in name {
        hash = hash.wrapping_mul(33).wrapping_add(u32::from(*byte));
    }
    hash
}

/// Compute the traditional SYSV ELF hash of a symbol name.
#[inline]
pub fn sysv_hash(name: &[u8]) -> u32 {
    let mut hash = 0u32;
    for byte in name {
        hash = (hash << 4).wrapping_add(u32::from(*byte));
        let g = hash & 0xf000_0000;
        if g != 0 {
            hash ^= g >> 24;
        }
        hash &= !g;
    }
    hash
}

/// Geometry of a `SHT_HASH` section, as offsets into the file copy.
#[derive(Debug, Clone, Copy)]
pub(crate) struct SysvHashTable {
    pub nbucket: u32,
    /// File offset of the bucket array.
    pub bucket_off: usize,
    /// File offset of the chain array.
    pub chain_off: usize,
}

impl SysvHashTable {
    /// Parse the table header located at `off` inside `file`.
    ///
    /// Returns `None` when the section is too small to hold the two-word
    /// header.
    pub(crate) fn parse(file: &[u8], off: usize, size: usize) -> Option<SysvHashTable> {
        if size < 2 * size_of::<u32>() || off + size > file.len() {
            return None;
        }
        let nbucket = read_u32(file, off);
        let bucket_off = off + 2 * size_of::<u32>();
        let chain_off = bucket_off + nbucket as usize * size_of::<u32>();
        Some(SysvHashTable {
            nbucket,
            bucket_off,
            chain_off,
        })
    }
}

/// Geometry of a `SHT_GNU_HASH` section, as offsets into the file copy.
#[derive(Debug, Clone, Copy)]
pub(crate) struct GnuHashTable {
    pub nbucket: u32,
    /// Index of the first hashed symbol in `.dynsym`.
    pub symndx: u32,
    /// Bloom filter length in words.
    pub bloom_size: u32,
    pub shift2: u32,
    /// File offset of the bloom filter words.
    pub bloom_off: usize,
    /// File offset of the bucket array.
    pub bucket_off: usize,
    /// File offset of the chain array.
    pub chain_off: usize,
}

impl GnuHashTable {
    pub(crate) fn parse(file: &[u8], off: usize, size: usize) -> Option<GnuHashTable> {
        if size < 4 * size_of::<u32>() || off + size > file.len() {
            return None;
        }
        let nbucket = read_u32(file, off);
        let symndx = read_u32(file, off + 4);
        let bloom_size = read_u32(file, off + 8);
        let shift2 = read_u32(file, off + 12);
        let bloom_off = off + 4 * size_of::<u32>();
        let bucket_off = bloom_off + bloom_size as usize * size_of::<usize>();
        let chain_off = bucket_off + nbucket as usize * size_of::<u32>();
        Some(GnuHashTable {
            nbucket,
            symndx,
            bloom_size,
            shift2,
            bloom_off,
            bucket_off,
            chain_off,
        })
    }

    /// Bloom filter test for `hash`; a `false` result proves absence.
    pub(crate) fn bloom_test(&self, file: &[u8], hash: u32) -> bool {
        const BLOOM_BITS: u32 = usize::BITS;
        if self.bloom_size == 0 {
            return false;
        }
        let word_idx = (hash / BLOOM_BITS) % self.bloom_size;
        let word = read_word(file, self.bloom_off + word_idx as usize * size_of::<usize>());
        let mask = (1usize << (hash % BLOOM_BITS)) | (1usize << ((hash >> self.shift2) % BLOOM_BITS));
        word & mask == mask
    }
}

// Reads past the end of a truncated table degrade to zero, which every
// chain walk treats as a terminator.
#[inline]
pub(crate) fn read_u32(buf: &[u8], off: usize) -> u32 {
    match buf.get(off..off + 4) {
        Some(bytes) => u32::from_le_bytes(bytes.try_into().unwrap()),
        None => 0,
    }
}

#[inline]
pub(crate) fn read_word(buf: &[u8], off: usize) -> usize {
    match buf.get(off..off + size_of::<usize>()) {
        Some(bytes) => usize::from_le_bytes(bytes.try_into().unwrap()),
        None => 0,
    }
}
