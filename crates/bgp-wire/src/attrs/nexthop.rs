use std::fmt;
use std::net::Ipv4Addr;

use bytes::{BufMut, BytesMut};
use nom::IResult;

use crate::{AttrEmitter, AttrFlags, AttrType, ParseBe};

/// NEXT_HOP path attribute (IPv4 only; other families ride in MP_REACH).
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct NexthopAttr {
    pub nexthop: Ipv4Addr,
}

impl NexthopAttr {
    pub fn new(nexthop: Ipv4Addr) -> Self {
        Self { nexthop }
    }
}

impl ParseBe<NexthopAttr> for NexthopAttr {
    fn parse_be(input: &[u8]) -> IResult<&[u8], Self> {
        let (input, nexthop) = Ipv4Addr::parse_be(input)?;
        Ok((input, Self { nexthop }))
    }
}

impl AttrEmitter for NexthopAttr {
    fn attr_flags(&self) -> AttrFlags {
        AttrFlags::well_known()
    }

    fn attr_type(&self) -> AttrType {
        AttrType::NextHop
    }

    fn len(&self) -> Option<usize> {
        Some(4)
    }

    fn emit(&self, buf: &mut BytesMut) {
        buf.put(&self.nexthop.octets()[..]);
    }
}

impl fmt::Display for NexthopAttr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.nexthop)
    }
}

impl fmt::Debug for NexthopAttr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Nexthop: {}", self)
    }
}
