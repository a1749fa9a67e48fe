use std::fmt;
use std::net::Ipv4Addr;

use bytes::{BufMut, BytesMut};
use nom::number::complete::{be_u16, be_u32};
use nom::IResult;

use crate::{AttrEmitter, AttrFlags, AttrType, ParseBe};

/// AGGREGATOR. The ASN field is 2 or 4 octets depending on session width;
/// held 4-byte wide internally like the AS path.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Aggregator {
    pub asn: u32,
    pub addr: Ipv4Addr,
}

impl Aggregator {
    pub fn new(asn: u32, addr: Ipv4Addr) -> Self {
        Self { asn, addr }
    }

    pub fn parse2(input: &[u8]) -> IResult<&[u8], Self> {
        let (input, asn) = be_u16(input)?;
        let (input, addr) = Ipv4Addr::parse_be(input)?;
        Ok((
            input,
            Self {
                asn: asn.into(),
                addr,
            },
        ))
    }

    pub fn parse4(input: &[u8]) -> IResult<&[u8], Self> {
        let (input, asn) = be_u32(input)?;
        let (input, addr) = Ipv4Addr::parse_be(input)?;
        Ok((input, Self { asn, addr }))
    }
}

/// Emits at the negotiated width.
pub struct AggregatorAttr<'a> {
    pub aggregator: &'a Aggregator,
    pub as4: bool,
}

impl AttrEmitter for AggregatorAttr<'_> {
    fn attr_flags(&self) -> AttrFlags {
        AttrFlags::optional_transitive()
    }

    fn attr_type(&self) -> AttrType {
        AttrType::Aggregator
    }

    fn len(&self) -> Option<usize> {
        Some(if self.as4 { 8 } else { 6 })
    }

    fn emit(&self, buf: &mut BytesMut) {
        if self.as4 {
            buf.put_u32(self.aggregator.asn);
        } else if self.aggregator.asn > u16::MAX as u32 {
            buf.put_u16(crate::AS_TRANS);
        } else {
            buf.put_u16(self.aggregator.asn as u16);
        }
        buf.put(&self.aggregator.addr.octets()[..]);
    }
}

impl fmt::Display for Aggregator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "AS {} {}", self.asn, self.addr)
    }
}

impl fmt::Debug for Aggregator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Aggregator: {}", self)
    }
}
