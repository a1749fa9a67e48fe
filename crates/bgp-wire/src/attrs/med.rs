use std::fmt;

use bytes::{BufMut, BytesMut};
use nom::number::complete::be_u32;
use nom::IResult;

use crate::{AttrEmitter, AttrFlags, AttrType, ParseBe};

#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Default, Hash)]
pub struct Med {
    pub med: u32,
}

impl Med {
    pub fn new(med: u32) -> Self {
        Self { med }
    }
}

impl ParseBe<Med> for Med {
    fn parse_be(input: &[u8]) -> IResult<&[u8], Self> {
        let (input, med) = be_u32(input)?;
        Ok((input, Self { med }))
    }
}

impl AttrEmitter for Med {
    fn attr_flags(&self) -> AttrFlags {
        AttrFlags::optional_non_transitive()
    }

    fn attr_type(&self) -> AttrType {
        AttrType::Med
    }

    fn len(&self) -> Option<usize> {
        Some(4)
    }

    fn emit(&self, buf: &mut BytesMut) {
        buf.put_u32(self.med);
    }
}

impl fmt::Display for Med {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.med)
    }
}

impl fmt::Debug for Med {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Med: {}", self)
    }
}
