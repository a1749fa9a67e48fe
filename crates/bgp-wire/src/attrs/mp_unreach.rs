use std::fmt;

use bytes::{BufMut, BytesMut};

use crate::{
    parse_ipv4_nlri, parse_ipv6_nlri, Afi, AttrEmitter, AttrFlags, AttrType, MpNlri, Safi,
    UpdateSubcode, WireError,
};

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct MpUnreachAttr {
    pub afi: Afi,
    pub safi: Safi,
    pub withdraw: MpNlri,
}

impl MpUnreachAttr {
    pub fn parse_attr(body: &[u8]) -> Result<MpUnreachAttr, WireError> {
        let (body, afi) = Afi::parse_be(body)?;
        let (body, safi) = Safi::parse_be(body)?;
        let withdraw = match afi {
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
        Ok(MpUnreachAttr {
            afi,
            safi,
            withdraw,
        })
    }
}

impl AttrEmitter for MpUnreachAttr {
    fn attr_flags(&self) -> AttrFlags {
        AttrFlags::optional_non_transitive()
    }

    fn attr_type(&self) -> AttrType {
        AttrType::MpUnreachNlri
    }

    fn len(&self) -> Option<usize> {
        None
    }

    fn emit(&self, buf: &mut BytesMut) {
        buf.put_u16(self.afi.into());
        buf.put_u8(self.safi.into());
        match &self.withdraw {
            MpNlri::Ipv4(nets) => {
                for net in nets.iter() {
                    crate::emit_ipv4_nlri(buf, net);
                }
            }
            MpNlri::Ipv6(nets) => {
                for net in nets.iter() {
                    crate::emit_ipv6_nlri(buf, net);
                }
            }
        }
    }
}

impl fmt::Display for MpUnreachAttr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, " MP Unreach: {}/{}", self.afi, self.safi)?;
        match &self.withdraw {
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
