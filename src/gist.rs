//! GiST-style index operators for fingerprint keys
//!
//! The host generalized search tree calls these seven operators while
//! maintaining and searching the index; everything here runs synchronously
//! inside the host's call frame and never blocks or spawns.  Keys cross the
//! boundary serialized (see `fingerprint` for the envelope); every operator
//! decodes the keys it reads and owns its scratch until it returns.
//!
//! Entries on a leaf page hold fingerprint keys, entries on an internal
//! page hold union keys.  The host knows which page a key came from; here
//! that knowledge rides along on [`GistEntry::leaf`].
//!
//! The split and penalty shaping matter more than they look: if a split
//! leaves one side empty, or two siblings end up with identical insertion
//! cost everywhere, the host's leaf search can loop forever.  Picksplit
//! therefore seeds the two sides from the songlen extremes, orders the rest
//! so the hard cases are decided last, and biases ties toward the smaller
//! side.

use num_traits::FromPrimitive;
use crate::{Error,Thresholds};
use crate::algebra::{match_cpfm,match_merges,match_fprint_merge,try_match_merges,
    EXACT_CUTOFF,MATCH_CUTOFF};
use crate::fingerprint::{Descriptors,Fingerprint,UnionKey,record_slice,record_size};

/// Strategy numbers assigned by the host's operator class.
#[derive(num_derive::FromPrimitive,Clone,Copy,PartialEq,Debug)]
pub enum Strategy {
    Eq = 3,
    Same = 6,
    Neq = 12
}

/// penalty reported for null-ish inputs; effectively "never descend here"
const NULL_PENALTY: f32 = 1e10;

/// pairwise score below which a page with uniform songlens is considered
/// truly homogeneous and split by position
const HOMOGENEOUS_CUTOFF: f64 = 0.4;

/// tie-bias weight nudging the smaller split side to grow
const WISH_BIAS: f64 = 0.1;

/// One index entry as the host hands it to an operator: the serialized key
/// and whether it is a leaf key (a fingerprint) or an internal key (a
/// union).
#[derive(Clone)]
pub struct GistEntry {
    pub key: Vec<u8>,
    pub leaf: bool
}

impl GistEntry {
    pub fn leaf_key(key: Vec<u8>) -> Self {
        Self { key, leaf: true }
    }
    pub fn node_key(key: Vec<u8>) -> Self {
        Self { key, leaf: false }
    }
}

/// Outcome of a page split: positions into the input slice for each side,
/// plus the serialized union keys summarizing them.
pub struct SplitVec {
    pub left: Vec<usize>,
    pub right: Vec<usize>,
    pub left_key: Vec<u8>,
    pub right_key: Vec<u8>
}

/// Fold a leaf entry through the key window so it fits an index page.
/// Internal keys pass through unchanged; re-applying to an already windowed
/// key is a copy.
pub fn compress(entry: &GistEntry) -> Result<GistEntry,Error> {
    if !entry.leaf {
        return Ok(entry.clone());
    }
    let fp = Fingerprint::key_from_varlena(&entry.key)?;
    Ok(GistEntry { key: fp.to_varlena(), leaf: true })
}

/// Identity.  The operator set does not rely on a pre-decompression step;
/// each consumer decodes the keys it reads.
pub fn decompress(entry: GistEntry) -> GistEntry {
    entry
}

fn union_of(entry: &GistEntry) -> Result<UnionKey,Error> {
    match entry.leaf {
        true => Ok(UnionKey::from_leaf(&Fingerprint::key_from_varlena(&entry.key)?)),
        false => UnionKey::from_varlena(&entry.key)
    }
}

/// Merge any mix of leaf and union entries into one serialized union key:
/// descriptors are bit-OR'd, the songlen interval is the elementwise
/// min/max (a leaf contributes a point interval), and the chroma length is
/// the longest input capped at the key window.
pub fn union(entries: &[GistEntry]) -> Result<Vec<u8>,Error> {
    let first = entries.first().ok_or(Error::NoEntries)?;
    let mut scratch = union_of(first)?;
    for entry in &entries[1..] {
        match entry.leaf {
            true => scratch.absorb_leaf(&Fingerprint::key_from_varlena(&entry.key)?),
            false => scratch.absorb_union(&UnionKey::from_varlena(&entry.key)?)
        }
    }
    log::debug!("union of {} entries spans [{},{}]",entries.len(),
        scratch.min_songlen,scratch.max_songlen);
    Ok(scratch.to_varlena())
}

/// Whether two stored union keys are byte-identical over their packed
/// records.  The host uses this to decide whether a node key needs
/// re-propagation after a child update.
pub fn same(a: &[u8], b: &[u8]) -> Result<bool,Error> {
    let (len_a,rec_a) = record_slice(a)?;
    let (len_b,rec_b) = record_slice(b)?;
    Ok(len_a == len_b && rec_a[..record_size(len_a)] == rec_b[..record_size(len_b)])
}

/// Cost of inserting `new` under the branch summarized by `orig`; the host
/// descends where this is lowest.  Descriptor mismatch dominates; widening
/// the branch's songlen interval is punished much harder, which keeps the
/// tree partitioned by length first.  Null-ish inputs cost `1e10` so a
/// damaged branch never attracts inserts.
pub fn penalty(orig: &GistEntry, new: &GistEntry) -> Result<f32,Error> {
    let orig_u = match UnionKey::from_varlena(&orig.key) {
        Ok(u) => u,
        Err(Error::EmptyValue) => return Ok(NULL_PENALTY),
        Err(e) => return Err(e)
    };
    let new_fp = match Fingerprint::key_from_varlena(&new.key) {
        Ok(fp) => fp,
        Err(Error::EmptyValue) => return Ok(NULL_PENALTY),
        Err(e) => return Err(e)
    };

    let orig_span = orig_u.max_songlen - orig_u.min_songlen;
    let new_span = orig_u.max_songlen.max(new_fp.songlen)
        - orig_u.min_songlen.min(new_fp.songlen);
    let mut growth = 0.0;
    if new_span > 0 {
        growth = (new_span - orig_span) as f64 / new_span as f64 * 2000.0;
    }
    let val = match_fprint_merge(&new_fp,&orig_u);
    let miss = match val > 0.0 {
        true => (1.0 - val) * 100.0,
        false => 100.0
    };
    Ok((miss + growth) as f32)
}

// The split algorithm is identical for leaf and internal pages apart from
// how an entry reads, bounds and merges; this seam carries the difference.
trait SplitItem: Descriptors + Sized {
    fn read(entry: &GistEntry) -> Result<Self,Error>;
    /// covered songlen interval; a point interval for a leaf
    fn bounds(&self) -> (u32,u32);
    fn seed_union(&self) -> UnionKey;
    fn absorb_into(&self, scratch: &mut UnionKey);
    fn pair_score(&self, other: &Self) -> f64;
}

impl SplitItem for Fingerprint {
    fn read(entry: &GistEntry) -> Result<Self,Error> {
        Fingerprint::key_from_varlena(&entry.key)
    }
    fn bounds(&self) -> (u32,u32) {
        (self.songlen,self.songlen)
    }
    fn seed_union(&self) -> UnionKey {
        UnionKey::from_leaf(self)
    }
    fn absorb_into(&self, scratch: &mut UnionKey) {
        scratch.absorb_leaf(self);
    }
    fn pair_score(&self, other: &Self) -> f64 {
        match_cpfm(self,other)
    }
}

impl SplitItem for UnionKey {
    fn read(entry: &GistEntry) -> Result<Self,Error> {
        UnionKey::from_varlena(&entry.key)
    }
    fn bounds(&self) -> (u32,u32) {
        (self.min_songlen,self.max_songlen)
    }
    fn seed_union(&self) -> UnionKey {
        self.clone()
    }
    fn absorb_into(&self, scratch: &mut UnionKey) {
        scratch.absorb_union(self);
    }
    fn pair_score(&self, other: &Self) -> f64 {
        match_merges(self,other)
    }
}

struct PairMatch {
    ix1: usize,
    ix2: usize,
    songlen_diff: u32,
    val: f64
}

fn sort_matches(matches: &mut [PairMatch]) {
    matches.sort_by(|a,b| a.songlen_diff.cmp(&b.songlen_diff)
        .then(a.val.total_cmp(&b.val)));
}

// convex bias that nudges the smaller side to grow
fn wish_f(a: usize, b: usize, c: f64) -> f64 {
    let d = a as f64 - b as f64;
    -(d * d * d) * c
}

/// Split an overfull page.  Both sides always come back nonempty and
/// together cover every input exactly once; the result is deterministic for
/// a given input order.
pub fn picksplit(entries: &[GistEntry]) -> Result<SplitVec,Error> {
    if entries.len() < 2 {
        // a one entry split would send the host's leaf search into an
        // infinite loop; surface it instead
        log::error!("picksplit called with {} entries",entries.len());
        return Err(Error::DegenerateSplit(entries.len()));
    }
    // pages are uniform: all leaf keys or all union keys
    match entries[0].leaf {
        true => {
            let items = entries.iter().map(Fingerprint::read)
                .collect::<Result<Vec<_>,_>>()?;
            split_items(&items)
        }
        false => {
            let items = entries.iter().map(UnionKey::read)
                .collect::<Result<Vec<_>,_>>()?;
            split_items(&items)
        }
    }
}

fn split_items<T: SplitItem>(items: &[T]) -> Result<SplitVec,Error> {
    let n = items.len();

    // seed selection by songlen extremes
    let (mut global_min,mut global_max) = items[0].bounds();
    let mut seed_left = 0;
    let mut seed_right = 0;
    let mut all_equal = true;
    for (i,item) in items.iter().enumerate().skip(1) {
        let (bmin,bmax) = item.bounds();
        if global_min > bmin {
            seed_left = i;
            global_min = bmin;
            all_equal = false;
        } else if global_max < bmax {
            seed_right = i;
            global_max = bmax;
            all_equal = false;
        }
    }

    if n == 2 {
        let (l,r) = match all_equal {
            true => (0,1),
            false => (seed_left,seed_right)
        };
        log::debug!("two entry split");
        return Ok(SplitVec {
            left: vec![l],
            right: vec![r],
            left_key: items[l].seed_union().to_varlena(),
            right_key: items[r].seed_union().to_varlena()
        });
    }

    if all_equal {
        // no songlen differentiation: fall back to pairwise comparison
        let mut pairs = Vec::with_capacity(n * (n - 1) / 2);
        for k in 0..n {
            for l in k+1..n {
                pairs.push(PairMatch {
                    ix1: k,
                    ix2: l,
                    songlen_diff: 0,
                    val: items[k].pair_score(&items[l])
                });
            }
        }
        sort_matches(&mut pairs);
        let best = pairs[pairs.len() - 1].val;
        if best <= HOMOGENEOUS_CUTOFF {
            // nothing tells these entries apart; split by position
            return Ok(split_homogeneous(items));
        }
        // the most dissimilar pair makes the best seeds
        seed_left = pairs[0].ix1;
        seed_right = pairs[0].ix2;
        log::debug!("uniform songlens, seeding from pair ({},{})",seed_left,seed_right);
    }

    let mut left_union = items[seed_left].seed_union();
    let mut right_union = items[seed_right].seed_union();
    let mut left = vec![seed_left];
    let mut right = vec![seed_right];

    // order the remaining entries: middle-of-the-range first, most
    // polarizing last, so the sides have taken shape before the hard calls
    let mut order: Vec<PairMatch> = (0..n).map(|k| {
        let (bmin,bmax) = items[k].bounds();
        let tmatch_left = try_match_merges(&right_union,&left_union,&items[k]);
        let tmatch_right = try_match_merges(&left_union,&right_union,&items[k]);
        PairMatch {
            ix1: k,
            ix2: k,
            songlen_diff: (bmax - global_min).min(global_max - bmin),
            val: tmatch_left.min(tmatch_right)
        }
    }).collect();
    sort_matches(&mut order);

    for entry in &order {
        let k = entry.ix1;
        if k == seed_left || k == seed_right {
            continue;
        }
        let item = &items[k];
        let (bmin,bmax) = item.bounds();
        if bmax - global_min < global_max - bmin {
            item.absorb_into(&mut left_union);
            left.push(k);
        } else if bmax - global_min > global_max - bmin {
            item.absorb_into(&mut right_union);
            right.push(k);
        } else {
            let tmatch_left = try_match_merges(&right_union,&left_union,item);
            let tmatch_right = try_match_merges(&left_union,&right_union,item);
            log::trace!("entry {}: try left {:.6} try right {:.6}",k,tmatch_left,tmatch_right);
            if tmatch_left < tmatch_right + wish_f(left.len(),right.len(),WISH_BIAS) {
                item.absorb_into(&mut left_union);
                left.push(k);
            } else if tmatch_left > tmatch_right {
                item.absorb_into(&mut right_union);
                right.push(k);
            } else if left.len() < right.len() {
                item.absorb_into(&mut left_union);
                left.push(k);
            } else {
                item.absorb_into(&mut right_union);
                right.push(k);
            }
        }
    }

    log::debug!("split: {} left [{},{}], {} right [{},{}]",
        left.len(),left_union.min_songlen,left_union.max_songlen,
        right.len(),right_union.min_songlen,right_union.max_songlen);

    Ok(SplitVec {
        left,
        right,
        left_key: left_union.to_varlena(),
        right_key: right_union.to_varlena()
    })
}

fn split_homogeneous<T: SplitItem>(items: &[T]) -> SplitVec {
    let n = items.len();
    let cluster = (n + 1) / 2;
    let mut left_union = items[0].seed_union();
    let mut right_union = items[n-1].seed_union();
    let mut left = vec![0];
    let mut right = vec![n - 1];
    for k in 1..n-1 {
        if k < cluster {
            items[k].absorb_into(&mut left_union);
            left.push(k);
        } else {
            items[k].absorb_into(&mut right_union);
            right.push(k);
        }
    }
    log::debug!("homogeneous split: {} left, {} right",left.len(),right.len());
    SplitVec {
        left,
        right,
        left_key: left_union.to_varlena(),
        right_key: right_union.to_varlena()
    }
}

/// Whether the subtree or leaf behind `entry` can satisfy `query` under the
/// given strategy number.  Returns `(hit, recheck)`: for a leaf the score
/// is decisive and `recheck` is false; for an internal node a hit only
/// means the subtree may contain matches, so `recheck` stays raised and the
/// leaves revalidate.  A null query admits nothing.
pub fn consistent(entry: &GistEntry, query: &[u8], strategy: u16,
                  thresholds: &Thresholds) -> Result<(bool,bool),Error> {
    let query_fp = match Fingerprint::key_from_varlena(query) {
        Ok(fp) => fp,
        Err(Error::EmptyValue) => return Ok((false,false)),
        Err(e) => return Err(e)
    };

    if entry.leaf {
        let key = match Fingerprint::key_from_varlena(&entry.key) {
            Ok(fp) => fp,
            Err(Error::EmptyValue) => return Ok((false,false)),
            Err(e) => return Err(e)
        };
        let val = match_cpfm(&query_fp,&key);
        log::trace!("leaf score {:.8}",val);
        let hit = match Strategy::from_u16(strategy) {
            Some(Strategy::Eq) => val > EXACT_CUTOFF,
            Some(Strategy::Neq) => val <= EXACT_CUTOFF,
            // Same, and any strategy we do not recognize
            _ => val > MATCH_CUTOFF
        };
        return Ok((hit,false));
    }

    let node = match UnionKey::from_varlena(&entry.key) {
        Ok(u) => u,
        Err(Error::EmptyValue) => return Ok((false,false)),
        Err(e) => return Err(e)
    };
    let songlen = query_fp.songlen;
    let mut threshold = thresholds.base;
    let hit;
    if node.min_songlen <= songlen && songlen <= node.max_songlen {
        if songlen > 150 {
            threshold = thresholds.long_track;
        } else if songlen > 40 && songlen < 46 {
            threshold = thresholds.narrow_band;
        }
        let val = match_fprint_merge(&query_fp,&node);
        log::trace!("node score {:.8} threshold {}",val,threshold);
        hit = val > threshold;
    } else if songlen < 155 {
        // outside the interval: admit only in narrow relative-distance
        // windows, tighter as recordings get longer
        let songlen_diff = match songlen < node.min_songlen {
            true => (node.min_songlen - songlen) as f64 / node.min_songlen as f64,
            false => (songlen - node.max_songlen) as f64 / songlen as f64
        };
        if songlen < 61 {
            if (songlen < 30 && songlen_diff < 0.8) || songlen_diff < 0.6 {
                hit = match_fprint_merge(&query_fp,&node) > threshold;
            } else {
                hit = false;
            }
        } else if (songlen < 110 && songlen_diff < 0.07) || songlen_diff < 0.05 {
            if songlen > 150 {
                threshold = thresholds.edge_long;
            }
            hit = match_fprint_merge(&query_fp,&node) > threshold;
        } else {
            hit = false;
        }
    } else {
        hit = false;
    }
    // recheck stays raised only while the subtree is admitted, so a
    // rejection also stops the host from recursing
    Ok((hit,hit))
}

// *************** TESTS *****************

#[cfg(test)]
use crate::fingerprint::test_fp;
#[cfg(test)]
use crate::STD_THRESHOLDS;

#[test]
fn compress_applies_the_window() {
    let fp = test_fp(223,948,7);
    let entry = GistEntry::leaf_key(fp.to_varlena());
    let key = compress(&entry).expect("compress failed");
    let stored = Fingerprint::from_varlena(&key.key).expect("decode failed");
    assert_eq!(stored.cprint.len(),240);
    assert_eq!(stored.cprint[..],fp.cprint[704..944]);
    // idempotent: compressing the compressed key changes nothing
    let again = compress(&key).expect("compress failed");
    assert_eq!(again.key,key.key);
}

#[test]
fn compress_passes_node_keys_through() {
    let u = UnionKey::from_leaf(&test_fp(60,240,3));
    let entry = GistEntry::node_key(u.to_varlena());
    let out = compress(&entry).expect("compress failed");
    assert_eq!(out.key,entry.key);
}

#[test]
fn union_and_same() {
    let a = test_fp(100,948,1);
    let b = test_fp(120,948,2);
    let entries = [
        GistEntry::leaf_key(a.to_varlena()),
        GistEntry::leaf_key(b.to_varlena())
    ];
    let key1 = union(&entries).expect("union failed");
    let key2 = union(&entries).expect("union failed");
    assert!(same(&key1,&key2).expect("same failed"));

    let u = UnionKey::from_varlena(&key1).expect("decode failed");
    assert_eq!(u.min_songlen,100);
    assert_eq!(u.max_songlen,120);
    assert_eq!(u.cprint.len(),240);

    let c = test_fp(90,948,3);
    let wider = union(&[
        entries[0].clone(),
        GistEntry::leaf_key(c.to_varlena())
    ]).expect("union failed");
    assert!(!same(&key1,&wider).expect("same failed"));
}

#[test]
fn union_adopts_node_intervals() {
    let mut u = UnionKey::from_leaf(&test_fp(80,240,4));
    u.absorb_leaf(&test_fp(95,240,5));
    let entries = [
        GistEntry::node_key(u.to_varlena()),
        GistEntry::leaf_key(test_fp(60,948,6).to_varlena())
    ];
    let merged = UnionKey::from_varlena(&union(&entries).expect("union failed"))
        .expect("decode failed");
    assert_eq!(merged.min_songlen,60);
    assert_eq!(merged.max_songlen,95);
}

#[test]
fn penalty_tolerates_null_inputs() {
    let u = UnionKey::from_leaf(&test_fp(100,240,1));
    let good = GistEntry::node_key(u.to_varlena());
    let null = GistEntry::leaf_key(Vec::new());
    assert_eq!(penalty(&good,&null).expect("penalty failed"),NULL_PENALTY);
    assert_eq!(penalty(&null,&good).expect("penalty failed"),NULL_PENALTY);
}

#[test]
fn picksplit_rejects_single_entries() {
    let entry = GistEntry::leaf_key(test_fp(100,240,1).to_varlena());
    assert!(matches!(picksplit(&[entry]),Err(Error::DegenerateSplit(1))));
}

#[test]
fn consistent_dispatches_on_strategy() {
    let fp = test_fp(223,948,7);
    let entry = compress(&GistEntry::leaf_key(fp.to_varlena())).expect("compress failed");
    let query = fp.to_varlena();
    let (hit,recheck) = consistent(&entry,&query,Strategy::Same as u16,&STD_THRESHOLDS)
        .expect("consistent failed");
    assert!(hit && !recheck);
    let (hit,_) = consistent(&entry,&query,Strategy::Eq as u16,&STD_THRESHOLDS)
        .expect("consistent failed");
    assert!(hit);
    let (hit,_) = consistent(&entry,&query,Strategy::Neq as u16,&STD_THRESHOLDS)
        .expect("consistent failed");
    assert!(!hit);
    // unknown strategy numbers behave like Same
    let (hit,_) = consistent(&entry,&query,99,&STD_THRESHOLDS)
        .expect("consistent failed");
    assert!(hit);
}

#[test]
fn consistent_rejects_null_queries() {
    let fp = test_fp(223,948,7);
    let entry = compress(&GistEntry::leaf_key(fp.to_varlena())).expect("compress failed");
    let (hit,recheck) = consistent(&entry,&[],Strategy::Same as u16,&STD_THRESHOLDS)
        .expect("consistent failed");
    assert!(!hit && !recheck);
}
