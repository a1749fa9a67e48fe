use std::fmt;

use bytes::{BufMut, BytesMut};
use nom::combinator::complete;
use nom::multi::{count, many0};
use nom::number::complete::{be_u16, be_u32, be_u8};
use nom::IResult;

use crate::{AttrEmitter, AttrFlags, AttrType};

pub const AS_SET: u8 = 1;
pub const AS_SEQ: u8 = 2;
pub const AS_CONFED_SEQ: u8 = 3;
pub const AS_CONFED_SET: u8 = 4;

/// Substituted for 4-byte AS numbers on a 2-byte session (RFC 6793).
pub const AS_TRANS: u16 = 23456;

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct AsSegment {
    pub typ: u8,
    pub asn: Vec<u32>,
}

impl AsSegment {
    pub fn new(typ: u8) -> Self {
        Self {
            typ,
            asn: Vec::new(),
        }
    }

    /// Segment contribution to the path length per RFC 4271 and RFC 5065:
    /// AS_SEQUENCE counts each AS, AS_SET counts one, confederation
    /// segments do not count.
    fn path_len(&self) -> u32 {
        match self.typ {
            AS_SEQ => self.asn.len() as u32,
            AS_SET => 1,
            _ => 0,
        }
    }

    fn emit2(&self, buf: &mut BytesMut) {
        buf.put_u8(self.typ);
        buf.put_u8(self.asn.len() as u8);
        for &asn in self.asn.iter() {
            if asn > u16::MAX as u32 {
                buf.put_u16(AS_TRANS);
            } else {
                buf.put_u16(asn as u16);
            }
        }
    }

    fn emit4(&self, buf: &mut BytesMut) {
        buf.put_u8(self.typ);
        buf.put_u8(self.asn.len() as u8);
        for &asn in self.asn.iter() {
            buf.put_u32(asn);
        }
    }
}

/// An AS path held 4-byte wide internally regardless of what was on the
/// wire; the session's negotiated ASN width only matters at the codec edge.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct AsPath {
    pub segs: Vec<AsSegment>,
}

impl AsPath {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_sequence<I: IntoIterator<Item = u32>>(asns: I) -> Self {
        let asn: Vec<u32> = asns.into_iter().collect();
        if asn.is_empty() {
            return Self::new();
        }
        Self {
            segs: vec![AsSegment { typ: AS_SEQ, asn }],
        }
    }

    pub fn path_len(&self) -> u32 {
        self.segs.iter().map(|seg| seg.path_len()).sum()
    }

    /// Leftmost AS of the first AS_SEQUENCE segment.
    pub fn neighboring_as(&self) -> Option<u32> {
        for seg in self.segs.iter() {
            if seg.typ == AS_SEQ {
                return seg.asn.first().copied();
            }
            if seg.typ == AS_SET {
                return None;
            }
        }
        None
    }

    pub fn contains(&self, asn: u32) -> bool {
        self.segs.iter().any(|seg| seg.asn.contains(&asn))
    }

    pub fn prepend(&mut self, asn: u32) {
        match self.segs.first_mut() {
            Some(seg) if seg.typ == AS_SEQ && seg.asn.len() < 255 => {
                seg.asn.insert(0, asn);
            }
            _ => {
                self.segs.insert(
                    0,
                    AsSegment {
                        typ: AS_SEQ,
                        asn: vec![asn],
                    },
                );
            }
        }
    }

    /// Total AS count, AS_SETs counted by their size (used by the RFC 6793
    /// merge below, which works on AS counts rather than segments).
    fn as_count(&self) -> usize {
        self.segs.iter().map(|seg| seg.asn.len()).sum()
    }

    pub fn has_wide_asn(&self) -> bool {
        self.segs
            .iter()
            .any(|seg| seg.asn.iter().any(|&asn| asn > u16::MAX as u32))
    }

    pub fn parse2(input: &[u8]) -> IResult<&[u8], AsPath> {
        let (input, segs) = many0(complete(parse_as2_segment))(input)?;
        Ok((input, AsPath { segs }))
    }

    pub fn parse4(input: &[u8]) -> IResult<&[u8], AsPath> {
        let (input, segs) = many0(complete(parse_as4_segment))(input)?;
        Ok((input, AsPath { segs }))
    }

    pub fn emit(&self, buf: &mut BytesMut, as4: bool) {
        for seg in self.segs.iter() {
            if as4 {
                seg.emit4(buf);
            } else {
                seg.emit2(buf);
            }
        }
    }

    fn emitted_len(&self, as4: bool) -> usize {
        let width = if as4 { 4 } else { 2 };
        self.segs
            .iter()
            .map(|seg| 2 + seg.asn.len() * width)
            .sum()
    }

    /// RFC 6793 section 4.2.3: reconstruct the full path from a 2-byte
    /// AS_PATH and an AS4_PATH. If the AS4_PATH claims more ASes than the
    /// AS_PATH it is ignored; otherwise the leading excess of the AS_PATH
    /// is prepended to the AS4_PATH.
    pub fn merge_as4(two: &AsPath, four: &AsPath) -> AsPath {
        let n = two.as_count();
        let m = four.as_count();
        if m > n {
            return two.clone();
        }
        let mut excess = n - m;
        let mut merged = AsPath::new();
        for seg in two.segs.iter() {
            if excess == 0 {
                break;
            }
            let take = excess.min(seg.asn.len());
            merged.segs.push(AsSegment {
                typ: seg.typ,
                asn: seg.asn[..take].to_vec(),
            });
            excess -= take;
        }
        merged.segs.extend(four.segs.iter().cloned());
        merged
    }
}

fn parse_as2_segment(input: &[u8]) -> IResult<&[u8], AsSegment> {
    let (input, typ) = be_u8(input)?;
    let (input, length) = be_u8(input)?;
    let (input, asns) = count(be_u16, length as usize)(input)?;
    Ok((
        input,
        AsSegment {
            typ,
            asn: asns.into_iter().map(u32::from).collect(),
        },
    ))
}

fn parse_as4_segment(input: &[u8]) -> IResult<&[u8], AsSegment> {
    let (input, typ) = be_u8(input)?;
    let (input, length) = be_u8(input)?;
    let (input, asns) = count(be_u32, length as usize)(input)?;
    Ok((input, AsSegment { typ, asn: asns }))
}

/// Emitter for the session-width AS_PATH attribute.
pub struct AsPathAttr<'a> {
    pub aspath: &'a AsPath,
    pub as4: bool,
}

impl AttrEmitter for AsPathAttr<'_> {
    fn attr_flags(&self) -> AttrFlags {
        AttrFlags::well_known()
    }

    fn attr_type(&self) -> AttrType {
        AttrType::AsPath
    }

    fn len(&self) -> Option<usize> {
        Some(self.aspath.emitted_len(self.as4))
    }

    fn emit(&self, buf: &mut BytesMut) {
        self.aspath.emit(buf, self.as4);
    }
}

/// Emitter for the AS4_PATH attribute used on 2-byte sessions.
pub struct As4PathAttr<'a> {
    pub aspath: &'a AsPath,
}

impl AttrEmitter for As4PathAttr<'_> {
    fn attr_flags(&self) -> AttrFlags {
        AttrFlags::optional_transitive()
    }

    fn attr_type(&self) -> AttrType {
        AttrType::As4Path
    }

    fn len(&self) -> Option<usize> {
        Some(self.aspath.emitted_len(true))
    }

    fn emit(&self, buf: &mut BytesMut) {
        self.aspath.emit(buf, true);
    }
}

pub fn asn_to_string(val: u32) -> String {
    if val > 65535 {
        let hval: u32 = (val & 0xFFFF0000) >> 16;
        let lval: u32 = val & 0x0000FFFF;
        hval.to_string() + "." + &lval.to_string()
    } else {
        val.to_string()
    }
}

impl fmt::Display for AsPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for seg in self.segs.iter() {
            if !first {
                write!(f, " ")?;
            }
            first = false;
            match seg.typ {
                AS_SET | AS_CONFED_SET => {
                    write!(f, "{{")?;
                    for (i, asn) in seg.asn.iter().enumerate() {
                        if i > 0 {
                            write!(f, ",")?;
                        }
                        write!(f, "{}", asn_to_string(*asn))?;
                    }
                    write!(f, "}}")?;
                }
                _ => {
                    for (i, asn) in seg.asn.iter().enumerate() {
                        if i > 0 {
                            write!(f, " ")?;
                        }
                        write!(f, "{}", asn_to_string(*asn))?;
                    }
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn path_len_counts() {
        let mut path = AsPath::from_sequence([65001, 65002]);
        path.segs.push(AsSegment {
            typ: AS_SET,
            asn: vec![1, 2, 3],
        });
        path.segs.push(AsSegment {
            typ: AS_CONFED_SEQ,
            asn: vec![9, 10],
        });
        assert_eq!(path.path_len(), 3);
    }

    #[test]
    fn as_trans_substitution() {
        let path = AsPath::from_sequence([70000, 65001]);
        let mut buf = BytesMut::new();
        path.emit(&mut buf, false);
        assert_eq!(&buf[..], &[2, 2, 0x5b, 0xa0, 0xfd, 0xe9]);
    }

    #[test]
    fn merge_as4_path() {
        // Wire AS_PATH: TRANS TRANS 65001; AS4_PATH: 70000 70001.
        let two = AsPath::from_sequence([AS_TRANS as u32, AS_TRANS as u32, 65001]);
        let four = AsPath::from_sequence([70000, 70001]);
        let merged = AsPath::merge_as4(&two, &four);
        assert_eq!(
            merged,
            AsPath {
                segs: vec![
                    AsSegment {
                        typ: AS_SEQ,
                        asn: vec![AS_TRANS as u32]
                    },
                    AsSegment {
                        typ: AS_SEQ,
                        asn: vec![70000, 70001]
                    },
                ]
            }
        );

        // An over-long AS4_PATH is ignored.
        let four_long = AsPath::from_sequence([1, 2, 3, 4]);
        assert_eq!(AsPath::merge_as4(&two, &four_long), two);
    }

    #[test]
    fn roundtrip4() {
        let path = AsPath::from_sequence([70000, 65001]);
        let mut buf = BytesMut::new();
        path.emit(&mut buf, true);
        let (rest, parsed) = AsPath::parse4(&buf).unwrap();
        assert!(rest.is_empty());
        assert_eq!(parsed, path);
    }
}
