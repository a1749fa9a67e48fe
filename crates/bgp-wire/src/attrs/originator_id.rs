use std::fmt;
use std::net::Ipv4Addr;

use bytes::{BufMut, BytesMut};
use nom::IResult;

use crate::{AttrEmitter, AttrFlags, AttrType, ParseBe};

/// ORIGINATOR_ID (RFC 4456).
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct OriginatorId {
    pub id: Ipv4Addr,
}

impl OriginatorId {
    pub fn new(id: Ipv4Addr) -> Self {
        Self { id }
    }
}

impl ParseBe<OriginatorId> for OriginatorId {
    fn parse_be(input: &[u8]) -> IResult<&[u8], Self> {
        let (input, id) = Ipv4Addr::parse_be(input)?;
        Ok((input, Self { id }))
    }
}

impl AttrEmitter for OriginatorId {
    fn attr_flags(&self) -> AttrFlags {
        AttrFlags::optional_non_transitive()
    }

    fn attr_type(&self) -> AttrType {
        AttrType::OriginatorId
    }

    fn len(&self) -> Option<usize> {
        Some(4)
    }

    fn emit(&self, buf: &mut BytesMut) {
        buf.put(&self.id.octets()[..]);
    }
}

impl fmt::Display for OriginatorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.id)
    }
}

impl fmt::Debug for OriginatorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "OriginatorId: {}", self)
    }
}
