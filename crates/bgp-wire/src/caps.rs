use std::fmt;

use bytes::{BufMut, BytesMut};
use nom::bytes::complete::take;
use nom::combinator::complete;
use nom::multi::many0;
use nom::number::complete::{be_u32, be_u8};
use nom::IResult;

use crate::{Afi, AfiSafi, Safi};

pub const CAPABILITY_CODE: u8 = 2;

pub const CAP_MULTI_PROTOCOL: u8 = 1;
pub const CAP_ROUTE_REFRESH: u8 = 2;
pub const CAP_AS4: u8 = 65;

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CapMultiProtocol {
    pub afi: Afi,
    pub safi: Safi,
}

impl CapMultiProtocol {
    pub fn new(afi: &Afi, safi: &Safi) -> Self {
        Self {
            afi: *afi,
            safi: *safi,
        }
    }
}

impl fmt::Display for CapMultiProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MultiProtocol: {}/{}", self.afi, self.safi)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CapAs4 {
    pub asn: u32,
}

impl CapAs4 {
    pub fn new(asn: u32) -> Self {
        Self { asn }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CapRefresh;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CapUnknown {
    pub code: u8,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CapabilityPacket {
    MultiProtocol(CapMultiProtocol),
    Refresh(CapRefresh),
    As4(CapAs4),
    Unknown(CapUnknown),
}

impl CapabilityPacket {
    pub fn emit(&self, buf: &mut BytesMut) {
        match self {
            Self::MultiProtocol(m) => {
                buf.put_u8(CAP_MULTI_PROTOCOL);
                buf.put_u8(4);
                buf.put_u16(m.afi.into());
                buf.put_u8(0);
                buf.put_u8(m.safi.into());
            }
            Self::Refresh(_) => {
                buf.put_u8(CAP_ROUTE_REFRESH);
                buf.put_u8(0);
            }
            Self::As4(m) => {
                buf.put_u8(CAP_AS4);
                buf.put_u8(4);
                buf.put_u32(m.asn);
            }
            Self::Unknown(m) => {
                buf.put_u8(m.code);
                buf.put_u8(m.data.len() as u8);
                buf.put(&m.data[..]);
            }
        }
    }

    pub fn parse_cap(input: &[u8]) -> IResult<&[u8], Self> {
        let (input, code) = be_u8(input)?;
        let (input, length) = be_u8(input)?;
        let (input, body) = take(length as usize)(input)?;
        let cap = match code {
            CAP_MULTI_PROTOCOL => {
                let (body, afi) = Afi::parse_be(body)?;
                let (body, _reserved) = be_u8(body)?;
                let (_, safi) = Safi::parse_be(body)?;
                Self::MultiProtocol(CapMultiProtocol { afi, safi })
            }
            CAP_ROUTE_REFRESH => Self::Refresh(CapRefresh),
            CAP_AS4 => {
                let (_, asn) = be_u32(body)?;
                Self::As4(CapAs4 { asn })
            }
            _ => Self::Unknown(CapUnknown {
                code,
                data: body.to_vec(),
            }),
        };
        Ok((input, cap))
    }
}

/// The negotiated capability set carried in an OPEN.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BgpCap {
    pub mp: Vec<CapMultiProtocol>,
    pub refresh: Option<CapRefresh>,
    pub as4: Option<CapAs4>,
    pub unknown: Vec<CapUnknown>,
}

impl BgpCap {
    pub fn is_empty(&self) -> bool {
        self.mp.is_empty() && self.refresh.is_none() && self.as4.is_none() && self.unknown.is_empty()
    }

    pub fn has_mp(&self, afi: Afi, safi: Safi) -> bool {
        self.mp.iter().any(|m| m.afi == afi && m.safi == safi)
    }

    pub fn afi_safis(&self) -> Vec<AfiSafi> {
        self.mp.iter().map(|m| AfiSafi::new(m.afi, m.safi)).collect()
    }

    /// Emit the whole set as one Capabilities Optional Parameter.
    pub fn emit(&self, buf: &mut BytesMut) {
        if self.is_empty() {
            return;
        }
        let mut cap_buf = BytesMut::new();
        for mp in self.mp.iter() {
            CapabilityPacket::MultiProtocol(mp.clone()).emit(&mut cap_buf);
        }
        if let Some(refresh) = &self.refresh {
            CapabilityPacket::Refresh(*refresh).emit(&mut cap_buf);
        }
        if let Some(as4) = &self.as4 {
            CapabilityPacket::As4(*as4).emit(&mut cap_buf);
        }
        for unknown in self.unknown.iter() {
            CapabilityPacket::Unknown(unknown.clone()).emit(&mut cap_buf);
        }
        buf.put_u8(CAPABILITY_CODE);
        buf.put_u8(cap_buf.len() as u8);
        buf.put(&cap_buf[..]);
    }
}

impl From<Vec<CapabilityPacket>> for BgpCap {
    fn from(caps: Vec<CapabilityPacket>) -> Self {
        let mut bgp_cap = BgpCap::default();
        for cap in caps {
            match cap {
                CapabilityPacket::MultiProtocol(m) => bgp_cap.mp.push(m),
                CapabilityPacket::Refresh(m) => bgp_cap.refresh = Some(m),
                CapabilityPacket::As4(m) => bgp_cap.as4 = Some(m),
                CapabilityPacket::Unknown(m) => bgp_cap.unknown.push(m),
            }
        }
        bgp_cap
    }
}

impl fmt::Display for BgpCap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for mp in self.mp.iter() {
            writeln!(f, " {}", mp)?;
        }
        if self.refresh.is_some() {
            writeln!(f, " RouteRefresh")?;
        }
        if let Some(as4) = &self.as4 {
            writeln!(f, " FourOctetAs: {}", as4.asn)?;
        }
        Ok(())
    }
}

/// Parse the body of one Capabilities Optional Parameter.
pub fn parse_caps_block(body: &[u8]) -> IResult<&[u8], Vec<CapabilityPacket>> {
    many0(complete(CapabilityPacket::parse_cap))(body)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cap_roundtrip() {
        let mut cap = BgpCap::default();
        cap.mp.push(CapMultiProtocol::new(&Afi::Ip, &Safi::Unicast));
        cap.mp.push(CapMultiProtocol::new(&Afi::Ip6, &Safi::Unicast));
        cap.as4 = Some(CapAs4::new(4_200_000_000));
        cap.refresh = Some(CapRefresh);

        let mut buf = BytesMut::new();
        cap.emit(&mut buf);
        assert_eq!(buf[0], CAPABILITY_CODE);
        assert_eq!(buf[1] as usize, buf.len() - 2);

        let (rest, caps) = parse_caps_block(&buf[2..]).unwrap();
        assert!(rest.is_empty());
        let parsed = BgpCap::from(caps);
        assert_eq!(parsed, cap);
    }
}
