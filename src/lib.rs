//! # fpgist Library
//!
//! Content-based audio similarity over three-descriptor fingerprints.
//! * `fingerprint` holds the two record shapes (leaf fingerprint and branch
//!   union), the binary key codec and the windowed key compressor
//! * `algebra` scores fingerprints against each other and against branch
//!   summaries
//! * `text` parses and emits the parenthesized interchange form
//! * `gist` implements the operator set a generalized search tree asks of a
//!   user-defined key type: compress, decompress, union, same, penalty,
//!   picksplit and consistent
//!
//! ## Scoring Example
//!
//! ```rs
//! use fpgist::{algebra,text};
//! let a = text::parse(&std::fs::read_to_string("one.fp").expect("read failed"))
//!     .expect("parse failed");
//! let b = text::parse(&std::fs::read_to_string("two.fp").expect("read failed"))
//!     .expect("parse failed");
//! eprintln!("score {}",algebra::compare(&a,&b));
//! ```
//!
//! ## Index Example
//!
//! ```rs
//! use fpgist::gist;
//! let entry = gist::GistEntry::leaf_key(fp.to_varlena());
//! let key = gist::compress(&entry).expect("compression failed");
//! ```

mod tools;
pub mod fingerprint;
pub mod algebra;
pub mod text;
pub mod gist;

/// Fingerprint Errors
#[derive(thiserror::Error,Debug,PartialEq)]
pub enum Error {
    #[error("text form too short: {0} characters")]
    TextTooShort(usize),
    #[error("text form must begin with 3 comma separated integers")]
    BadHeader,
    #[error("bad hex block at character {0}")]
    BadHexBlock(usize),
    #[error("integer ending at position {0} is too wide")]
    IntegerTooWide(usize),
    #[error("invalid character '{0}' at position {1}")]
    BadCharacter(char,usize),
    #[error("missing terminating ')'")]
    MissingTerminator,
    #[error("stored value is empty")]
    EmptyValue,
    #[error("stored value is truncated")]
    TruncatedValue,
    #[error("stored value is invalid: cprint_len {0}")]
    OversizedValue(u64),
    #[error("cannot split a page of {0} entries")]
    DegenerateSplit(usize),
    #[error("no entries to merge")]
    NoEntries
}

/// Thresholds controlling subtree admission in `gist::consistent`.
/// These are empirically tuned; keeping them in a value rather than in the
/// code means a recalibration does not require a rebuild.
#[derive(Clone)]
pub struct Thresholds {
    /// floor a subtree score must clear when its interval covers the query
    pub base: f64,
    /// long recordings (songlen > 150) cluster tightly and get a higher floor
    pub long_track: f64,
    /// the 41-45 second band is noisy and gets a lower floor
    pub narrow_band: f64,
    /// floor for out-of-interval admission of 151-154 second queries
    pub edge_long: f64
}

pub const STD_THRESHOLDS: Thresholds = Thresholds {
    base: 0.08,
    long_track: 0.10,
    narrow_band: 0.03,
    edge_long: 0.15
};
