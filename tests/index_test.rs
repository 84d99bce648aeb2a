//! End-to-end scenarios driving the index operators the way a host
//! generalized search tree would: inserts descend by penalty, overfull
//! pages split through picksplit, branch keys rebuild through union, and
//! searches prune through consistent before leaves revalidate.

use fpgist::gist::{self,GistEntry,Strategy};
use fpgist::fingerprint::{Fingerprint,UnionKey,MAX_KEY_CP_LEN};
use fpgist::{algebra,STD_THRESHOLDS};

mod common;
use common::sample_fingerprint;

type STDRESULT = Result<(),Box<dyn std::error::Error>>;

/// entries per leaf page before a split, as a small host page would hold
const PAGE_CAPACITY: usize = 4;

struct LeafItem {
    key: Vec<u8>,
    row: Fingerprint
}

struct Branch {
    key: Vec<u8>,
    page: Vec<LeafItem>
}

/// Minimal two-level tree over the operator set.
struct Tree {
    branches: Vec<Branch>
}

impl Tree {
    fn new() -> Self {
        Tree { branches: Vec::new() }
    }

    fn page_entries(page: &[LeafItem]) -> Vec<GistEntry> {
        page.iter().map(|item| GistEntry::leaf_key(item.key.clone())).collect()
    }

    fn insert(&mut self, row: Fingerprint) -> STDRESULT {
        let raw = GistEntry::leaf_key(row.to_varlena());
        let compressed = gist::compress(&raw)?;
        let item = LeafItem { key: compressed.key.clone(), row };

        if self.branches.is_empty() {
            let key = gist::union(&[compressed])?;
            self.branches.push(Branch { key, page: vec![item] });
            return Ok(());
        }

        // descend where the penalty is lowest
        let chosen = self.branches.iter().enumerate()
            .map(|(ix,branch)| {
                let node = GistEntry::node_key(branch.key.clone());
                Ok((ix,gist::penalty(&node,&compressed)?))
            })
            .collect::<Result<Vec<_>,fpgist::Error>>()?
            .into_iter()
            .min_by(|a,b| a.1.total_cmp(&b.1))
            .map(|(ix,_)| ix)
            .expect("no branches");

        self.branches[chosen].page.push(item);
        if self.branches[chosen].page.len() > PAGE_CAPACITY {
            let old = self.branches.remove(chosen);
            let entries = Self::page_entries(&old.page);
            let split = gist::picksplit(&entries)?;
            let mut left_page = Vec::new();
            let mut right_page = Vec::new();
            for (ix,item) in old.page.into_iter().enumerate() {
                if split.left.contains(&ix) {
                    left_page.push(item);
                } else {
                    right_page.push(item);
                }
            }
            assert!(!left_page.is_empty() && !right_page.is_empty());
            self.branches.insert(chosen,Branch { key: split.right_key, page: right_page });
            self.branches.insert(chosen,Branch { key: split.left_key, page: left_page });
        } else {
            let entries = Self::page_entries(&self.branches[chosen].page);
            self.branches[chosen].key = gist::union(&entries)?;
        }
        Ok(())
    }

    fn search(&self, query: &Fingerprint, strategy: Strategy) -> Result<Vec<Fingerprint>,fpgist::Error> {
        let query_key = query.to_varlena();
        let mut rows = Vec::new();
        for branch in &self.branches {
            let node = gist::decompress(GistEntry::node_key(branch.key.clone()));
            let (hit,recheck) = gist::consistent(&node,&query_key,strategy as u16,&STD_THRESHOLDS)?;
            if !hit {
                continue;
            }
            assert!(recheck);
            for item in &branch.page {
                let leaf = GistEntry::leaf_key(item.key.clone());
                let (hit,recheck) = gist::consistent(&leaf,&query_key,strategy as u16,&STD_THRESHOLDS)?;
                if hit {
                    assert!(!recheck);
                    rows.push(item.row.clone());
                }
            }
        }
        Ok(rows)
    }
}

fn build_tree(rows: &[Fingerprint]) -> Tree {
    let mut tree = Tree::new();
    for row in rows {
        tree.insert(row.clone()).expect("insert failed");
    }
    tree
}

fn fillers() -> Vec<Fingerprint> {
    vec![
        sample_fingerprint(30,470,101),
        sample_fingerprint(95,948,102),
        sample_fingerprint(150,948,103),
        sample_fingerprint(222,948,104),
        sample_fingerprint(240,948,105)
    ]
}

#[test]
fn identical_round_trip() -> STDRESULT {
    // the inserted row comes back byte for byte on a Same search
    let target = sample_fingerprint(223,948,7);
    let mut rows = fillers();
    rows.push(target.clone());
    let tree = build_tree(&rows);
    assert!(tree.branches.len() > 1,"expected at least one split");
    let hits = tree.search(&target,Strategy::Same)?;
    assert_eq!(hits.len(),1);
    assert_eq!(hits[0],target);
    Ok(())
}

#[test]
fn near_duplicate_is_found() -> STDRESULT {
    let target = sample_fingerprint(223,948,7);
    let mut rows = fillers();
    rows.push(target.clone());
    let tree = build_tree(&rows);

    let mut mutated = target.clone();
    for i in 0..10 {
        mutated.r[i * 30] ^= 1 << (i % 8);
    }
    assert!(algebra::compare(&target,&mutated) > algebra::MATCH_CUTOFF);
    let hits = tree.search(&mutated,Strategy::Same)?;
    assert!(hits.iter().any(|row| *row == target));
    Ok(())
}

#[test]
fn songlen_gate_blocks_search() -> STDRESULT {
    let stored = sample_fingerprint(200,948,9);
    let tree = build_tree(&[stored.clone(),sample_fingerprint(205,948,10)]);
    let mut query = stored;
    query.songlen = 100;
    assert!(tree.search(&query,Strategy::Same)?.is_empty());
    Ok(())
}

#[test]
fn split_seeds_from_songlen_extremes() -> STDRESULT {
    let songlens = [30u32,31,180,181,182];
    let entries: Vec<GistEntry> = songlens.iter().enumerate()
        .map(|(ix,&songlen)| {
            let fp = sample_fingerprint(songlen,948,200 + ix as u32);
            gist::compress(&GistEntry::leaf_key(fp.to_varlena()))
        })
        .collect::<Result<Vec<_>,_>>()?;
    let split = gist::picksplit(&entries)?;
    let side_lens = |ixs: &[usize]| -> Vec<u32> {
        let mut lens: Vec<u32> = ixs.iter().map(|&ix| songlens[ix]).collect();
        lens.sort();
        lens
    };
    assert_eq!(side_lens(&split.left),vec![30,31]);
    assert_eq!(side_lens(&split.right),vec![180,181,182]);

    let left = UnionKey::from_varlena(&split.left_key)?;
    assert_eq!((left.min_songlen,left.max_songlen),(30,31));
    let right = UnionKey::from_varlena(&split.right_key)?;
    assert_eq!((right.min_songlen,right.max_songlen),(180,182));
    Ok(())
}

#[test]
fn stored_keys_carry_the_window() -> STDRESULT {
    // a full 60s extraction keys to the tail window
    let fp = sample_fingerprint(223,948,7);
    let key = gist::compress(&GistEntry::leaf_key(fp.to_varlena()))?;
    let stored = Fingerprint::from_varlena(&key.key)?;
    assert_eq!(stored.cprint.len(),MAX_KEY_CP_LEN);
    assert_eq!(stored.cprint[..],fp.cprint[704..944]);
    // 900 words cannot reach the tail window and key to the middle one
    let fp = sample_fingerprint(57,900,8);
    let key = gist::compress(&GistEntry::leaf_key(fp.to_varlena()))?;
    let stored = Fingerprint::from_varlena(&key.key)?;
    assert_eq!(stored.cprint.len(),MAX_KEY_CP_LEN);
    assert_eq!(stored.cprint[..],fp.cprint[464..704]);
    Ok(())
}

#[test]
fn penalty_prefers_the_similar_leaf() -> STDRESULT {
    let node_key = gist::union(&[
        gist::compress(&GistEntry::leaf_key(sample_fingerprint(100,948,70).to_varlena()))?,
        gist::compress(&GistEntry::leaf_key(sample_fingerprint(120,948,70).to_varlena()))?
    ])?;
    let node = GistEntry::node_key(node_key);
    let near = GistEntry::leaf_key(sample_fingerprint(110,948,70).to_varlena());
    let far = GistEntry::leaf_key(sample_fingerprint(300,948,99).to_varlena());
    let penalty_near = gist::penalty(&node,&near)?;
    let penalty_far = gist::penalty(&node,&far)?;
    assert!(penalty_near < penalty_far);
    assert!(penalty_near >= 0.0);
    Ok(())
}

#[test]
fn splits_always_cover_both_sides() -> STDRESULT {
    for n in 2..=10usize {
        let entries: Vec<GistEntry> = (0..n)
            .map(|i| {
                let songlen = 40 + ((i as u32 * 37) % 160);
                let fp = sample_fingerprint(songlen,400 + i * 50,300 + i as u32);
                gist::compress(&GistEntry::leaf_key(fp.to_varlena()))
            })
            .collect::<Result<Vec<_>,_>>()?;
        let split = gist::picksplit(&entries)?;
        assert!(!split.left.is_empty());
        assert!(!split.right.is_empty());
        assert_eq!(split.left.len() + split.right.len(),n);
        let mut seen: Vec<usize> = split.left.iter().chain(split.right.iter()).copied().collect();
        seen.sort();
        assert_eq!(seen,(0..n).collect::<Vec<_>>());
    }
    Ok(())
}

#[test]
fn homogeneous_pages_split_by_position() -> STDRESULT {
    // uniform songlen, mutually dissimilar descriptors
    let entries: Vec<GistEntry> = (0..5u32)
        .map(|i| {
            let fp = sample_fingerprint(100,948,400 + i);
            gist::compress(&GistEntry::leaf_key(fp.to_varlena()))
        })
        .collect::<Result<Vec<_>,_>>()?;
    let split = gist::picksplit(&entries)?;
    let mut left = split.left.clone();
    left.sort();
    let mut right = split.right.clone();
    right.sort();
    assert_eq!(left,vec![0,1,2]);
    assert_eq!(right,vec![3,4]);
    Ok(())
}

#[test]
fn duplicate_pair_seeds_a_regular_split() -> STDRESULT {
    // uniform songlen but two entries are identical: the pairwise pass
    // finds differentiation and the page splits around the extremes
    let entries: Vec<GistEntry> = [500u32,501,500,502,503].iter()
        .map(|&seed| {
            let fp = sample_fingerprint(100,948,seed);
            gist::compress(&GistEntry::leaf_key(fp.to_varlena()))
        })
        .collect::<Result<Vec<_>,_>>()?;
    let split = gist::picksplit(&entries)?;
    assert!(!split.left.is_empty());
    assert!(!split.right.is_empty());
    assert_eq!(split.left.len() + split.right.len(),5);
    Ok(())
}

#[test]
fn union_splits_keep_intervals() -> STDRESULT {
    // internal pages hold union keys; splitting them goes by interval
    let union_entry = |lo: u32,hi: u32,seed: u32| -> Result<GistEntry,fpgist::Error> {
        let key = gist::union(&[
            gist::compress(&GistEntry::leaf_key(sample_fingerprint(lo,948,seed).to_varlena()))?,
            gist::compress(&GistEntry::leaf_key(sample_fingerprint(hi,948,seed + 1).to_varlena()))?
        ])?;
        Ok(GistEntry::node_key(key))
    };
    let entries = vec![
        union_entry(30,35,600)?,
        union_entry(33,40,602)?,
        union_entry(170,180,604)?,
        union_entry(175,185,606)?
    ];
    let split = gist::picksplit(&entries)?;
    assert_eq!(split.left.len() + split.right.len(),4);
    let left = UnionKey::from_varlena(&split.left_key)?;
    let right = UnionKey::from_varlena(&split.right_key)?;
    assert!(left.max_songlen < right.min_songlen);
    assert_eq!(left.min_songlen,30);
    assert_eq!(right.max_songlen,185);
    Ok(())
}

#[test]
fn members_stay_consistent_with_their_union() -> STDRESULT {
    // no false negatives on membership: a subtree containing the query's
    // row must admit the query
    let members: Vec<Fingerprint> = (0..4u32)
        .map(|i| sample_fingerprint(140 + i * 5,948,700 + i))
        .collect();
    let entries: Vec<GistEntry> = members.iter()
        .map(|fp| gist::compress(&GistEntry::leaf_key(fp.to_varlena())))
        .collect::<Result<Vec<_>,_>>()?;
    let node = GistEntry::node_key(gist::union(&entries)?);
    for member in &members {
        let (hit,recheck) = gist::consistent(&node,&member.to_varlena(),
            Strategy::Same as u16,&STD_THRESHOLDS)?;
        assert!(hit,"union rejected its own member");
        assert!(recheck);
    }
    Ok(())
}

#[test]
fn same_union_scores_as_identical() -> STDRESULT {
    let entries = [
        gist::compress(&GistEntry::leaf_key(sample_fingerprint(100,948,800).to_varlena()))?,
        gist::compress(&GistEntry::leaf_key(sample_fingerprint(104,948,801).to_varlena()))?
    ];
    let key1 = gist::union(&entries)?;
    let key2 = gist::union(&entries)?;
    assert!(gist::same(&key1,&key2)?);
    let u1 = UnionKey::from_varlena(&key1)?;
    let u2 = UnionKey::from_varlena(&key2)?;
    assert_eq!(algebra::match_merges(&u1,&u2),1.0);
    Ok(())
}
