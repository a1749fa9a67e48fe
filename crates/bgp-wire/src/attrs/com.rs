use std::collections::BTreeSet;
use std::fmt;

use bytes::{BufMut, BytesMut};
use nom::combinator::complete;
use nom::multi::many0;
use nom::number::complete::be_u32;
use nom::IResult;

use crate::{AttrEmitter, AttrFlags, AttrType, ParseBe};

pub const COM_NO_EXPORT: u32 = 0xFFFF_FF01;
pub const COM_NO_ADVERTISE: u32 = 0xFFFF_FF02;
pub const COM_NO_EXPORT_SUBCONFED: u32 = 0xFFFF_FF03;

#[derive(Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct Community(pub Vec<u32>);

impl Community {
    pub fn new() -> Self {
        Community(Vec::new())
    }

    pub fn push(&mut self, value: u32) {
        self.0.push(value)
    }

    pub fn sort_uniq(&mut self) {
        let coms: BTreeSet<u32> = self.0.iter().cloned().collect();
        self.0 = coms.into_iter().collect();
    }

    pub fn contains(&self, val: &u32) -> bool {
        self.0.contains(val)
    }

    pub fn is_no_export(&self) -> bool {
        self.contains(&COM_NO_EXPORT)
    }

    pub fn is_no_advertise(&self) -> bool {
        self.contains(&COM_NO_ADVERTISE)
    }
}

impl ParseBe<Community> for Community {
    fn parse_be(input: &[u8]) -> IResult<&[u8], Self> {
        let (input, coms) = many0(complete(be_u32))(input)?;
        Ok((input, Community(coms)))
    }
}

impl AttrEmitter for Community {
    fn attr_flags(&self) -> AttrFlags {
        AttrFlags::optional_transitive()
    }

    fn attr_type(&self) -> AttrType {
        AttrType::Community
    }

    fn len(&self) -> Option<usize> {
        Some(self.0.len() * 4)
    }

    fn emit(&self, buf: &mut BytesMut) {
        for &community in &self.0 {
            buf.put_u32(community);
        }
    }
}

fn community_str(val: u32) -> String {
    match val {
        COM_NO_EXPORT => "no-export".to_string(),
        COM_NO_ADVERTISE => "no-advertise".to_string(),
        COM_NO_EXPORT_SUBCONFED => "no-export-subconfed".to_string(),
        v => format!("{}:{}", v >> 16, v & 0xFFFF),
    }
}

impl fmt::Display for Community {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let strs: Vec<String> = self.0.iter().map(|&v| community_str(v)).collect();
        write!(f, "{}", strs.join(" "))
    }
}
