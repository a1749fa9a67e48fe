use std::net::{Ipv4Addr, Ipv6Addr};

use nom::number::complete::{be_u32, be_u128};
use nom::IResult;

pub trait ParseBe<T> {
    fn parse_be(input: &[u8]) -> IResult<&[u8], T>;
}

impl ParseBe<Ipv4Addr> for Ipv4Addr {
    fn parse_be(input: &[u8]) -> IResult<&[u8], Self> {
        let (input, addr) = be_u32(input)?;
        Ok((input, Self::from(addr)))
    }
}

impl ParseBe<Ipv6Addr> for Ipv6Addr {
    fn parse_be(input: &[u8]) -> IResult<&[u8], Self> {
        let (input, addr) = be_u128(input)?;
        Ok((input, Self::from(addr)))
    }
}
