//! Deterministic fingerprint builders shared by the integration tests.

#![allow(dead_code)]

use fpgist::fingerprint::{Fingerprint,R_SIZE,DOM_SIZE};

/// xorshift32; repeatable descriptor filler
pub struct Rng(u32);

impl Rng {
    pub fn new(seed: u32) -> Self {
        Rng(seed.max(1))
    }
    pub fn next(&mut self) -> u32 {
        let mut x = self.0;
        x ^= x << 13;
        x ^= x >> 17;
        x ^= x << 5;
        self.0 = x;
        x
    }
}

/// Build a fingerprint whose descriptors are filled from `seed`.  Equal
/// seeds give byte-identical descriptors, so similarity between two sample
/// fingerprints is under test control.
pub fn sample_fingerprint(songlen: u32, cprint_len: usize, seed: u32) -> Fingerprint {
    let mut rng = Rng::new(seed);
    let mut r = [0u8; R_SIZE];
    for byte in r.iter_mut() {
        *byte = rng.next() as u8;
    }
    let mut dom = [0u8; DOM_SIZE];
    for byte in dom.iter_mut() {
        *byte = rng.next() as u8;
    }
    let cprint = (0..cprint_len).map(|_| (rng.next() & 0x0007_ffff) as i32).collect();
    Fingerprint { songlen, bit_rate: 192, num_errors: 0, r, dom, cprint }
}
