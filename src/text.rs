//! Text form of a fingerprint
//!
//! ```text
//! '(' songlen ',' bit_rate ',' num_errors ','
//!     hex(r) ',' hex(dom) ','
//!     cprint[0] ' ' cprint[1] ' ' ... cprint[n-1] ')'
//! ```
//!
//! Three unsigned decimals, two uppercase hex blocks of exactly `2*R_SIZE`
//! and `2*DOM_SIZE` digits, then a space separated list of signed decimals
//! closed by `)`.  This is the ingest and debugging format; the index never
//! sees it.  Parsing is strict: every rejection carries a distinguishable
//! error kind and, where it makes sense, the offending position.

use crate::Error;
use crate::fingerprint::{Fingerprint,R_SIZE,DOM_SIZE,KNOWN_CPRINT_LEN};
use std::fmt::Write as _;

/// minimum legal length: "(0,0,0," + both hex blocks + ",," + "0)"
const MIN_TEXT_LEN: usize = 11 + 2 * R_SIZE + 2 * DOM_SIZE;

/// widest accepted integer run, sign included
const MAX_INT_WIDTH: usize = 12;

/// Render a fingerprint in text form.
pub fn emit(fp: &Fingerprint) -> String {
    let mut out = String::with_capacity(MIN_TEXT_LEN + 12 * fp.cprint.len());
    // bit_rate and num_errors print through u32 so the round trip is exact
    // even for negative values
    let _ = write!(out,"({},{},{},",fp.songlen,fp.bit_rate as u32,fp.num_errors as u32);
    out.push_str(&hex::encode_upper(fp.r));
    out.push(',');
    out.push_str(&hex::encode_upper(fp.dom));
    out.push(',');
    for (i,word) in fp.cprint.iter().enumerate() {
        if i > 0 {
            out.push(' ');
        }
        let _ = write!(out,"{}",word);
    }
    out.push(')');
    out
}

fn scan_u32(bytes: &[u8], ix: &mut usize) -> Result<u32,Error> {
    let start = *ix;
    while *ix < bytes.len() && bytes[*ix].is_ascii_digit() {
        *ix += 1;
    }
    if *ix == start {
        return Err(Error::BadHeader);
    }
    std::str::from_utf8(&bytes[start..*ix]).ok()
        .and_then(|s| s.parse::<u32>().ok())
        .ok_or(Error::BadHeader)
}

fn expect_header_comma(bytes: &[u8], ix: &mut usize) -> Result<(),Error> {
    if bytes.get(*ix) != Some(&b',') {
        return Err(Error::BadHeader);
    }
    *ix += 1;
    Ok(())
}

fn scan_hex_block<const N: usize>(bytes: &[u8], ix: &mut usize) -> Result<[u8; N],Error> {
    let start = *ix;
    let end = start + 2 * N;
    if end > bytes.len() {
        return Err(Error::BadHexBlock(start));
    }
    let decoded = hex::decode(&bytes[start..end]).map_err(|_| Error::BadHexBlock(start))?;
    let mut block = [0u8; N];
    block.copy_from_slice(&decoded);
    *ix = end;
    Ok(block)
}

/// Parse the text form.  Characters after the terminating `)` are ignored,
/// so a trailing newline is harmless.
pub fn parse(s: &str) -> Result<Fingerprint,Error> {
    if s.len() < MIN_TEXT_LEN {
        return Err(Error::TextTooShort(s.len()));
    }
    let bytes = s.as_bytes();
    if bytes[0] != b'(' {
        return Err(Error::BadHeader);
    }
    let mut ix = 1;
    let songlen = scan_u32(bytes,&mut ix)?;
    expect_header_comma(bytes,&mut ix)?;
    let bit_rate = scan_u32(bytes,&mut ix)? as i32;
    expect_header_comma(bytes,&mut ix)?;
    let num_errors = scan_u32(bytes,&mut ix)? as i32;
    expect_header_comma(bytes,&mut ix)?;

    let r = scan_hex_block::<R_SIZE>(bytes,&mut ix)?;
    if bytes.get(ix) != Some(&b',') {
        return Err(Error::BadCharacter(char::from(*bytes.get(ix).unwrap_or(&b' ')),ix));
    }
    ix += 1;
    let dom = scan_hex_block::<DOM_SIZE>(bytes,&mut ix)?;
    if bytes.get(ix) != Some(&b',') {
        return Err(Error::BadCharacter(char::from(*bytes.get(ix).unwrap_or(&b' ')),ix));
    }
    ix += 1;

    let mut cprint: Vec<i32> = Vec::with_capacity(KNOWN_CPRINT_LEN);
    let mut run_start = ix;
    let mut closed = false;
    while ix < bytes.len() {
        let c = bytes[ix];
        match c {
            b' ' | b')' => {
                if ix == run_start || &bytes[run_start..ix] == b"-" {
                    return Err(Error::BadCharacter(char::from(c),ix));
                }
                // strtol semantics: values wider than i32 truncate
                let word = std::str::from_utf8(&bytes[run_start..ix]).ok()
                    .and_then(|t| t.parse::<i64>().ok())
                    .ok_or(Error::BadCharacter(char::from(c),ix))? as i32;
                cprint.push(word);
                if c == b')' {
                    closed = true;
                    break;
                }
                run_start = ix + 1;
            }
            b'0'..=b'9' => {
                if ix - run_start >= MAX_INT_WIDTH {
                    return Err(Error::IntegerTooWide(ix));
                }
            }
            b'-' if ix == run_start => {}
            _ => {
                return Err(Error::BadCharacter(char::from(c),ix));
            }
        }
        ix += 1;
    }
    if !closed {
        return Err(Error::MissingTerminator);
    }

    Ok(Fingerprint { songlen, bit_rate, num_errors, r, dom, cprint })
}

// *************** TESTS *****************

#[cfg(test)]
use crate::fingerprint::test_fp;

#[test]
fn round_trip() {
    let fp = test_fp(223,948,7);
    let back = parse(&emit(&fp)).expect("parse failed");
    assert_eq!(fp,back);

    let mut fp = test_fp(31,3,11);
    fp.cprint = vec![0,-1,i32::MAX];
    fp.num_errors = -2;
    fp.bit_rate = 128;
    let back = parse(&emit(&fp)).expect("parse failed");
    assert_eq!(fp,back);
}

#[test]
fn trailing_newline_is_ignored() {
    let fp = test_fp(60,20,3);
    let mut s = emit(&fp);
    s.push('\n');
    assert_eq!(parse(&s).expect("parse failed"),fp);
}

#[test]
fn rejects_short_text() {
    assert_eq!(parse("(1,2,3,AB)"),Err(Error::TextTooShort(10)));
}

#[test]
fn rejects_bad_header() {
    let good = emit(&test_fp(60,20,3));
    let bad = good.replacen("(60","(x0",1);
    assert_eq!(parse(&bad),Err(Error::BadHeader));
    let bad = good.replacen("(60,","(60;",1);
    assert_eq!(parse(&bad),Err(Error::BadHeader));
}

#[test]
fn rejects_bad_hex() {
    let fp = test_fp(60,20,3);
    let mut s = emit(&fp);
    // corrupt the first hex digit of the r block
    let prefix = format!("({},{},{},",fp.songlen,fp.bit_rate,fp.num_errors);
    s.replace_range(prefix.len()..prefix.len()+1,"G");
    assert_eq!(parse(&s),Err(Error::BadHexBlock(prefix.len())));
}

#[test]
fn rejects_wide_integers() {
    let fp = test_fp(60,20,3);
    // 12 characters is the widest accepted run
    let s = emit(&fp).replace(')'," 123456789012)");
    assert!(parse(&s).is_ok());
    let s = emit(&fp).replace(')'," 1234567890123)");
    assert!(matches!(parse(&s),Err(Error::IntegerTooWide(_))));
}

#[test]
fn rejects_bad_characters() {
    let fp = test_fp(60,20,3);
    let s = emit(&fp).replace(')'," 12a)");
    assert!(matches!(parse(&s),Err(Error::BadCharacter('a',_))));
    let s = emit(&fp).replace(')',"  7)");
    assert!(matches!(parse(&s),Err(Error::BadCharacter(' ',_))));
}

#[test]
fn rejects_missing_terminator() {
    let fp = test_fp(60,20,3);
    let s = emit(&fp).replace(')',"");
    assert_eq!(parse(&s),Err(Error::MissingTerminator));
}
