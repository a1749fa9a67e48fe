use std::fmt;
use std::net::{Ipv4Addr, Ipv6Addr};

use bytes::{BufMut, BytesMut};
use ipnet::{Ipv4Net, Ipv6Net};
use nom::number::complete::be_u8;

use crate::{
    emit_ipv4_nlri, emit_ipv6_nlri, parse_ipv4_nlri, parse_ipv6_nlri, Afi, AttrEmitter, AttrFlags,
    AttrType, ParseBe, Safi, UpdateSubcode, WireError,
};

/// Next hop carried inside MP_REACH_NLRI.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum MpNexthop {
    Ipv4(Ipv4Addr),
    Ipv6 {
        global: Ipv6Addr,
        linklocal: Option<Ipv6Addr>,
    },
}

impl MpNexthop {
    fn emitted_len(&self) -> usize {
        match self {
            Self::Ipv4(_) => 4,
            Self::Ipv6 { linklocal, .. } => {
                if linklocal.is_some() {
                    32
                } else {
                    16
                }
            }
        }
    }

    fn emit(&self, buf: &mut BytesMut) {
        match self {
            Self::Ipv4(addr) => buf.put(&addr.octets()[..]),
            Self::Ipv6 { global, linklocal } => {
                buf.put(&global.octets()[..]);
                if let Some(ll) = linklocal {
                    buf.put(&ll.octets()[..]);
                }
            }
        }
    }
}

/// Per-AFI NLRI list.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum MpNlri {
    Ipv4(Vec<Ipv4Net>),
    Ipv6(Vec<Ipv6Net>),
}

impl MpNlri {
    pub fn is_empty(&self) -> bool {
        match self {
            Self::Ipv4(nets) => nets.is_empty(),
            Self::Ipv6(nets) => nets.is_empty(),
        }
    }

    fn emit(&self, buf: &mut BytesMut) {
        match self {
            Self::Ipv4(nets) => {
                for net in nets.iter() {
                    emit_ipv4_nlri(buf, net);
                }
            }
            Self::Ipv6(nets) => {
                for net in nets.iter() {
                    emit_ipv6_nlri(buf, net);
                }
            }
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct MpReachAttr {
    pub afi: Afi,
    pub safi: Safi,
    pub nexthop: MpNexthop,
    pub nlri: MpNlri,
}

impl MpReachAttr {
    pub fn parse_attr(body: &[u8]) -> Result<MpReachAttr, WireError> {
        let (body, afi) = Afi::parse_be(body)?;
        let (body, safi) = Safi::parse_be(body)?;
        let (body, nh_len) = be_u8::<_, nom::error::Error<&[u8]>>(body)?;
        if body.len() < nh_len as usize + 1 {
            return Err(WireError::Truncated);
        }
        let (nh_bytes, body) = body.split_at(nh_len as usize);
        let nexthop = parse_mp_nexthop(afi, nh_bytes)?;
        let (_, body) = body.split_at(1); // Reserved octet.
        let nlri = match afi {
            Afi::Ip => {
                let (_, nets) = parse_ipv4_nlri(body, body.len() as u16)?;
                MpNlri::Ipv4(nets)
            }
            Afi::Ip6 => {
                let (_, nets) = parse_ipv6_nlri(body, body.len() as u16)?;
                MpNlri::Ipv6(nets)
            }
            Afi::Unknown(_) => {
                return Err(WireError::Update(
                    UpdateSubcode::OptionalAttributeError,
                    Vec::new(),
                ));
            }
        };
        Ok(MpReachAttr {
            afi,
            safi,
            nexthop,
            nlri,
        })
    }
}

pub fn parse_mp_nexthop(afi: Afi, bytes: &[u8]) -> Result<MpNexthop, WireError> {
    match (afi, bytes.len()) {
        (Afi::Ip, 4) => {
            let (_, addr) = Ipv4Addr::parse_be(bytes)?;
            Ok(MpNexthop::Ipv4(addr))
        }
        (Afi::Ip6, 16) => {
            let (_, global) = Ipv6Addr::parse_be(bytes)?;
            Ok(MpNexthop::Ipv6 {
                global,
                linklocal: None,
            })
        }
        (Afi::Ip6, 32) => {
            let (rest, global) = Ipv6Addr::parse_be(bytes)?;
            let (_, linklocal) = Ipv6Addr::parse_be(rest)?;
            Ok(MpNexthop::Ipv6 {
                global,
                linklocal: Some(linklocal),
            })
        }
        _ => Err(WireError::Update(
            UpdateSubcode::InvalidNexthopAttribute,
            bytes.to_vec(),
        )),
    }
}

impl AttrEmitter for MpReachAttr {
    fn attr_flags(&self) -> AttrFlags {
        AttrFlags::optional_non_transitive()
    }

    fn attr_type(&self) -> AttrType {
        AttrType::MpReachNlri
    }

    fn len(&self) -> Option<usize> {
        None
    }

    fn emit(&self, buf: &mut BytesMut) {
        buf.put_u16(self.afi.into());
        buf.put_u8(self.safi.into());
        buf.put_u8(self.nexthop.emitted_len() as u8);
        self.nexthop.emit(buf);
        buf.put_u8(0); // Reserved.
        self.nlri.emit(buf);
    }
}

impl fmt::Display for MpReachAttr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, " MP Reach: {}/{}", self.afi, self.safi)?;
        match &self.nlri {
            MpNlri::Ipv4(nets) => {
                for net in nets.iter() {
                    writeln!(f, "  {}", net)?;
                }
            }
            MpNlri::Ipv6(nets) => {
                for net in nets.iter() {
                    writeln!(f, "  {}", net)?;
                }
            }
        }
        Ok(())
    }
}
