use std::fmt;

use bytes::{BufMut, BytesMut};
use nom::number::complete::be_u32;
use nom::IResult;

use crate::{AttrEmitter, AttrFlags, AttrType, ParseBe};

#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Default, Hash)]
pub struct LocalPref {
    pub local_pref: u32,
}

impl LocalPref {
    pub fn new(local_pref: u32) -> Self {
        Self { local_pref }
    }
}

impl ParseBe<LocalPref> for LocalPref {
    fn parse_be(input: &[u8]) -> IResult<&[u8], Self> {
        let (input, local_pref) = be_u32(input)?;
        Ok((input, Self { local_pref }))
    }
}

impl AttrEmitter for LocalPref {
    fn attr_flags(&self) -> AttrFlags {
        AttrFlags::well_known()
    }

    fn attr_type(&self) -> AttrType {
        AttrType::LocalPref
    }

    fn len(&self) -> Option<usize> {
        Some(4)
    }

    fn emit(&self, buf: &mut BytesMut) {
        buf.put_u32(self.local_pref);
    }
}

impl fmt::Display for LocalPref {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.local_pref)
    }
}

impl fmt::Debug for LocalPref {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "LocalPref: {}", self)
    }
}
