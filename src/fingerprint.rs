//! Fingerprint and union record shapes, the stored-key codec, and the
//! windowed key compressor.
//!
//! A leaf fingerprint and a branch union share one packed layout: the three
//! descriptor families sit at identical offsets in both shapes, and the
//! union reuses the leaf's `songlen` and `num_errors` slots for its
//! `[min_songlen,max_songlen]` interval.  Descriptor routines read either
//! shape through the [`Descriptors`] trait and never care which one they
//! were handed.
//!
//! Stored keys travel in a varlena envelope: a 4 byte total-length header
//! (native endian, length includes the header), the packed record, then zero
//! padding to the next 8 byte boundary.  There is no version field; a layout
//! change requires a reindex.

use crate::Error;

/// width of the scaled-Hamming descriptor in bytes
pub const R_SIZE: usize = 348;
/// width of the popcount-Hamming descriptor in bytes
pub const DOM_SIZE: usize = 66;
/// longest chroma slice an index key will carry
pub const MAX_KEY_CP_LEN: usize = 240;
/// chroma words produced by a full 60 second extraction (~15.8 words/s)
pub const KNOWN_CPRINT_LEN: usize = 948;
/// a stored record claiming more chroma words than this is corrupt
pub const CPRINT_LEN_LIMIT: u64 = 100_000;

// key window boundaries, in chroma words (~15.8 words/s)
const KEY_WINDOW_MID_START: usize = 464; // secs 29-44
const KEY_WINDOW_MID_END: usize = 704;
const KEY_WINDOW_TAIL_START: usize = 704; // secs 44-59
const KEY_WINDOW_TAIL_END: usize = 944;

// packed record offsets, shared by both shapes
const OFF_CPRINT_LEN: usize = 0;
const OFF_SONGLEN: usize = 8; // min_songlen in a union
const OFF_BIT_RATE: usize = 12;
const OFF_NUM_ERRORS: usize = 16; // max_songlen in a union
const OFF_R: usize = 20;
const OFF_DOM: usize = OFF_R + R_SIZE;
const OFF_CPRINT: usize = 436; // dom ends at 434, 2 pad bytes keep i32 alignment

/// varlena length header width
pub const VARHDRSZ: usize = 4;

/// packed size of a record carrying `cprint_len` chroma words
pub fn record_size(cprint_len: usize) -> usize {
    OFF_CPRINT + cprint_len.max(1) * 4
}

fn varlena_size(cprint_len: usize) -> usize {
    (VARHDRSZ + record_size(cprint_len) + 7) & !7
}

/// Start of the chroma window an index key keeps.  Recordings long enough
/// keep a mid-to-late window, where the chroma stream discriminates best;
/// short recordings keep the head.  The window never runs past the input:
/// a tail window needs at least `KEY_WINDOW_TAIL_END` words of input.
fn window_start(cprint_len: usize) -> usize {
    if cprint_len >= KEY_WINDOW_TAIL_END {
        KEY_WINDOW_TAIL_START
    } else if cprint_len >= KEY_WINDOW_MID_END {
        KEY_WINDOW_MID_START
    } else {
        0
    }
}

/// Uniform read access to the three descriptor families.
pub trait Descriptors {
    fn r(&self) -> &[u8; R_SIZE];
    fn dom(&self) -> &[u8; DOM_SIZE];
    fn cprint(&self) -> &[i32];
}

/// The full three-descriptor record for a single recording.
#[derive(Clone,Debug,PartialEq)]
pub struct Fingerprint {
    /// recording length in whole seconds
    pub songlen: u32,
    /// encoded bit rate in kbps
    pub bit_rate: i32,
    /// decode errors tolerated while extracting
    pub num_errors: i32,
    /// scaled-Hamming descriptor: 2-bit quantized band values
    pub r: [u8; R_SIZE],
    /// popcount-Hamming descriptor
    pub dom: [u8; DOM_SIZE],
    /// chroma words; variable length, lowest-set-bit position is the signal
    pub cprint: Vec<i32>
}

/// A branch summary: bit-OR of the descriptors of every reachable leaf plus
/// the covered `songlen` interval.
#[derive(Clone,Debug,PartialEq)]
pub struct UnionKey {
    pub min_songlen: u32,
    pub max_songlen: u32,
    /// carried along from the first merged record; not part of the summary
    pub bit_rate: i32,
    pub r: [u8; R_SIZE],
    pub dom: [u8; DOM_SIZE],
    pub cprint: Vec<i32>
}

impl Descriptors for Fingerprint {
    fn r(&self) -> &[u8; R_SIZE] { &self.r }
    fn dom(&self) -> &[u8; DOM_SIZE] { &self.dom }
    fn cprint(&self) -> &[i32] { &self.cprint }
}

impl Descriptors for UnionKey {
    fn r(&self) -> &[u8; R_SIZE] { &self.r }
    fn dom(&self) -> &[u8; DOM_SIZE] { &self.dom }
    fn cprint(&self) -> &[i32] { &self.cprint }
}

fn get_u32(buf: &[u8], off: usize) -> u32 {
    u32::from_ne_bytes([buf[off],buf[off+1],buf[off+2],buf[off+3]])
}

fn get_i32(buf: &[u8], off: usize) -> i32 {
    get_u32(buf,off) as i32
}

fn get_u64(buf: &[u8], off: usize) -> u64 {
    u64::from_ne_bytes([buf[off],buf[off+1],buf[off+2],buf[off+3],
        buf[off+4],buf[off+5],buf[off+6],buf[off+7]])
}

fn put_u32(buf: &mut [u8], off: usize, val: u32) {
    buf[off..off+4].copy_from_slice(&val.to_ne_bytes());
}

fn put_i32(buf: &mut [u8], off: usize, val: i32) {
    buf[off..off+4].copy_from_slice(&val.to_ne_bytes());
}

fn put_u64(buf: &mut [u8], off: usize, val: u64) {
    buf[off..off+8].copy_from_slice(&val.to_ne_bytes());
}

/// Strip the varlena envelope and validate the record inside.
/// Returns the chroma word count and the record bytes.
pub(crate) fn record_slice(buf: &[u8]) -> Result<(usize,&[u8]),Error> {
    if buf.len() < VARHDRSZ {
        return Err(Error::EmptyValue);
    }
    let total = get_u32(buf,0) as usize;
    if total == 0 {
        return Err(Error::EmptyValue);
    }
    if total < VARHDRSZ + OFF_CPRINT || total > buf.len() {
        return Err(Error::TruncatedValue);
    }
    let rec = &buf[VARHDRSZ..total];
    let cprint_len = get_u64(rec,OFF_CPRINT_LEN);
    if cprint_len > CPRINT_LEN_LIMIT {
        return Err(Error::OversizedValue(cprint_len));
    }
    let cprint_len = cprint_len as usize;
    if rec.len() < record_size(cprint_len) {
        return Err(Error::TruncatedValue);
    }
    Ok((cprint_len,rec))
}

fn pack_varlena(cprint_len: usize, songlen_slot: u32, bit_rate: i32,
                errors_slot: i32, r: &[u8; R_SIZE], dom: &[u8; DOM_SIZE],
                cprint: &[i32]) -> Vec<u8> {
    let total = varlena_size(cprint_len);
    let mut buf = vec![0u8;total];
    put_u32(&mut buf,0,total as u32);
    let rec = &mut buf[VARHDRSZ..];
    put_u64(rec,OFF_CPRINT_LEN,cprint_len as u64);
    put_u32(rec,OFF_SONGLEN,songlen_slot);
    put_i32(rec,OFF_BIT_RATE,bit_rate);
    put_i32(rec,OFF_NUM_ERRORS,errors_slot);
    rec[OFF_R..OFF_R+R_SIZE].copy_from_slice(r);
    rec[OFF_DOM..OFF_DOM+DOM_SIZE].copy_from_slice(dom);
    for (i,word) in cprint.iter().enumerate() {
        put_i32(rec,OFF_CPRINT + i*4,*word);
    }
    buf
}

fn read_descriptors(rec: &[u8]) -> ([u8; R_SIZE],[u8; DOM_SIZE]) {
    let mut r = [0u8; R_SIZE];
    r.copy_from_slice(&rec[OFF_R..OFF_R+R_SIZE]);
    let mut dom = [0u8; DOM_SIZE];
    dom.copy_from_slice(&rec[OFF_DOM..OFF_DOM+DOM_SIZE]);
    (r,dom)
}

fn read_cprint(rec: &[u8], start: usize, count: usize) -> Vec<i32> {
    let mut cprint = Vec::with_capacity(count);
    for i in 0..count {
        cprint.push(get_i32(rec,OFF_CPRINT + (start + i)*4));
    }
    cprint
}

impl Fingerprint {
    /// Serialize into the stored-key envelope.
    pub fn to_varlena(&self) -> Vec<u8> {
        pack_varlena(self.cprint.len(),self.songlen,self.bit_rate,
            self.num_errors,&self.r,&self.dom,&self.cprint)
    }

    /// Decode a stored value in full, chroma stream included.
    pub fn from_varlena(buf: &[u8]) -> Result<Fingerprint,Error> {
        let (cprint_len,rec) = record_slice(buf)?;
        let (r,dom) = read_descriptors(rec);
        Ok(Fingerprint {
            songlen: get_u32(rec,OFF_SONGLEN),
            bit_rate: get_i32(rec,OFF_BIT_RATE),
            num_errors: get_i32(rec,OFF_NUM_ERRORS),
            r,
            dom,
            cprint: read_cprint(rec,0,cprint_len)
        })
    }

    /// Decode a stored value the way the index operators read it: the key
    /// window is folded in, so every comparison sees index-shaped data.
    /// Idempotent on values that already fit the window.
    pub fn key_from_varlena(buf: &[u8]) -> Result<Fingerprint,Error> {
        let (cprint_len,rec) = record_slice(buf)?;
        let start = window_start(cprint_len);
        let key_len = cprint_len.min(MAX_KEY_CP_LEN);
        let (r,dom) = read_descriptors(rec);
        Ok(Fingerprint {
            songlen: get_u32(rec,OFF_SONGLEN),
            bit_rate: get_i32(rec,OFF_BIT_RATE),
            num_errors: get_i32(rec,OFF_NUM_ERRORS),
            r,
            dom,
            cprint: read_cprint(rec,start,key_len)
        })
    }

    /// Reduce the chroma stream to the bounded window an index key carries.
    /// Everything else is copied verbatim.
    pub fn key_window(&self) -> Fingerprint {
        let start = window_start(self.cprint.len());
        let key_len = self.cprint.len().min(MAX_KEY_CP_LEN);
        Fingerprint {
            songlen: self.songlen,
            bit_rate: self.bit_rate,
            num_errors: self.num_errors,
            r: self.r,
            dom: self.dom,
            cprint: self.cprint[start..start+key_len].to_vec()
        }
    }
}

/// Read `songlen` straight off a stored leaf value without decoding the
/// descriptors.
pub fn songlen_of(buf: &[u8]) -> Result<u32,Error> {
    let (_,rec) = record_slice(buf)?;
    Ok(get_u32(rec,OFF_SONGLEN))
}

/// Read `num_errors` straight off a stored leaf value without decoding the
/// descriptors.
pub fn num_errors_of(buf: &[u8]) -> Result<i32,Error> {
    let (_,rec) = record_slice(buf)?;
    Ok(get_i32(rec,OFF_NUM_ERRORS))
}

impl UnionKey {
    /// A summary of a single leaf: its descriptors and a point interval.
    pub fn from_leaf(a: &Fingerprint) -> UnionKey {
        let key_len = a.cprint.len().min(MAX_KEY_CP_LEN);
        UnionKey {
            min_songlen: a.songlen,
            max_songlen: a.songlen,
            bit_rate: a.bit_rate,
            r: a.r,
            dom: a.dom,
            cprint: a.cprint[..key_len].to_vec()
        }
    }

    /// Serialize into the stored-key envelope.  The interval lands in the
    /// leaf shape's `songlen` and `num_errors` slots.
    pub fn to_varlena(&self) -> Vec<u8> {
        pack_varlena(self.cprint.len(),self.min_songlen,self.bit_rate,
            self.max_songlen as i32,&self.r,&self.dom,&self.cprint)
    }

    /// Decode a stored value as a branch summary.
    pub fn from_varlena(buf: &[u8]) -> Result<UnionKey,Error> {
        let (cprint_len,rec) = record_slice(buf)?;
        let (r,dom) = read_descriptors(rec);
        Ok(UnionKey {
            min_songlen: get_u32(rec,OFF_SONGLEN),
            max_songlen: get_u32(rec,OFF_NUM_ERRORS),
            bit_rate: get_i32(rec,OFF_BIT_RATE),
            r,
            dom,
            cprint: read_cprint(rec,0,cprint_len)
        })
    }

    fn absorb_descriptors(&mut self, other: &impl Descriptors) {
        for (u,a) in self.r.iter_mut().zip(other.r().iter()) {
            *u |= a;
        }
        for (u,a) in self.dom.iter_mut().zip(other.dom().iter()) {
            *u |= a;
        }
        let cp = other.cprint();
        let len = cp.len().min(MAX_KEY_CP_LEN);
        if len > self.cprint.len() {
            log::debug!("growing union cprint {} -> {}",self.cprint.len(),len);
            self.cprint.resize(len,0);
        }
        for k in 0..len {
            self.cprint[k] |= cp[k];
        }
    }

    /// Fold a leaf into this summary: descriptors are OR'd in and the
    /// interval widens to include its `songlen`.
    pub fn absorb_leaf(&mut self, a: &Fingerprint) {
        self.absorb_descriptors(a);
        self.min_songlen = self.min_songlen.min(a.songlen);
        self.max_songlen = self.max_songlen.max(a.songlen);
    }

    /// Fold another summary into this one, adopting its interval bounds
    /// elementwise.
    pub fn absorb_union(&mut self, a: &UnionKey) {
        self.absorb_descriptors(a);
        self.min_songlen = self.min_songlen.min(a.min_songlen);
        self.max_songlen = self.max_songlen.max(a.max_songlen);
    }
}

// *************** TESTS *****************

#[cfg(test)]
pub(crate) fn test_fp(songlen: u32, cprint_len: usize, seed: u32) -> Fingerprint {
    let mut state = seed.max(1);
    let mut next = move || -> u32 {
        state ^= state << 13;
        state ^= state >> 17;
        state ^= state << 5;
        state
    };
    let mut r = [0u8; R_SIZE];
    for byte in r.iter_mut() {
        *byte = next() as u8;
    }
    let mut dom = [0u8; DOM_SIZE];
    for byte in dom.iter_mut() {
        *byte = next() as u8;
    }
    let cprint = (0..cprint_len).map(|_| (next() & 0x0007_ffff) as i32).collect();
    Fingerprint { songlen, bit_rate: 192, num_errors: 0, r, dom, cprint }
}

#[test]
fn varlena_round_trip() {
    let fp = test_fp(223,948,7);
    let buf = fp.to_varlena();
    assert_eq!(buf.len() % 8,0);
    let back = Fingerprint::from_varlena(&buf).expect("decode failed");
    assert_eq!(fp,back);

    let short = test_fp(31,17,11);
    let back = Fingerprint::from_varlena(&short.to_varlena()).expect("decode failed");
    assert_eq!(short,back);
}

#[test]
fn union_round_trip() {
    let mut u = UnionKey::from_leaf(&test_fp(100,240,3));
    u.absorb_leaf(&test_fp(120,240,4));
    let back = UnionKey::from_varlena(&u.to_varlena()).expect("decode failed");
    assert_eq!(u,back);
    assert_eq!(back.min_songlen,100);
    assert_eq!(back.max_songlen,120);
}

#[test]
fn window_selection() {
    // full 60s extraction keeps the tail window
    let fp = test_fp(223,948,7);
    let key = fp.key_window();
    assert_eq!(key.cprint.len(),MAX_KEY_CP_LEN);
    assert_eq!(key.cprint[..],fp.cprint[704..944]);
    // too short for the tail, long enough for the middle
    let fp = test_fp(57,900,7);
    let key = fp.key_window();
    assert_eq!(key.cprint.len(),MAX_KEY_CP_LEN);
    assert_eq!(key.cprint[..],fp.cprint[464..704]);
    // head window, still truncated
    let fp = test_fp(19,300,7);
    let key = fp.key_window();
    assert_eq!(key.cprint[..],fp.cprint[..240]);
    // shorter than the window: identity
    let fp = test_fp(9,150,7);
    assert_eq!(fp.key_window(),fp);
}

#[test]
fn window_is_idempotent() {
    let fp = test_fp(223,948,7);
    let key = fp.key_window();
    assert_eq!(key.key_window(),key);
    let decoded = Fingerprint::key_from_varlena(&key.to_varlena()).expect("decode failed");
    assert_eq!(decoded,key);
}

#[test]
fn keyed_decode_matches_window() {
    let fp = test_fp(223,948,7);
    let keyed = Fingerprint::key_from_varlena(&fp.to_varlena()).expect("decode failed");
    assert_eq!(keyed,fp.key_window());
}

#[test]
fn union_covers_members() {
    let a = test_fp(100,240,21);
    let b = test_fp(130,200,22);
    let mut u = UnionKey::from_leaf(&a);
    u.absorb_leaf(&b);
    for i in 0..R_SIZE {
        assert_eq!(u.r[i],a.r[i] | b.r[i]);
    }
    for i in 0..DOM_SIZE {
        assert_eq!(u.dom[i],a.dom[i] | b.dom[i]);
    }
    for i in 0..200 {
        assert_eq!(u.cprint[i],a.cprint[i] | b.cprint[i]);
    }
    for i in 200..240 {
        assert_eq!(u.cprint[i],a.cprint[i]);
    }
    assert!(u.min_songlen <= a.songlen && a.songlen <= u.max_songlen);
    assert!(u.min_songlen <= b.songlen && b.songlen <= u.max_songlen);
}

#[test]
fn union_growth_is_capped() {
    let mut u = UnionKey::from_leaf(&test_fp(60,10,1));
    u.absorb_leaf(&test_fp(60,400,2));
    assert_eq!(u.cprint.len(),MAX_KEY_CP_LEN);
}

#[test]
fn field_accessors_skip_the_descriptors() {
    let mut fp = test_fp(223,948,7);
    fp.num_errors = 3;
    let buf = fp.to_varlena();
    assert_eq!(songlen_of(&buf),Ok(223));
    assert_eq!(num_errors_of(&buf),Ok(3));
    assert_eq!(songlen_of(&[]),Err(Error::EmptyValue));
}

#[test]
fn bad_stored_values() {
    assert_eq!(Fingerprint::from_varlena(&[]),Err(Error::EmptyValue));
    let mut zeroed = test_fp(10,4,1).to_varlena();
    zeroed[0..4].copy_from_slice(&0u32.to_ne_bytes());
    assert_eq!(Fingerprint::from_varlena(&zeroed),Err(Error::EmptyValue));

    let fp = test_fp(10,4,1);
    let mut buf = fp.to_varlena();
    buf[VARHDRSZ..VARHDRSZ+8].copy_from_slice(&200_000u64.to_ne_bytes());
    assert_eq!(Fingerprint::from_varlena(&buf),Err(Error::OversizedValue(200_000)));

    let buf = fp.to_varlena();
    assert_eq!(Fingerprint::from_varlena(&buf[..buf.len()-8]),Err(Error::TruncatedValue));
}
