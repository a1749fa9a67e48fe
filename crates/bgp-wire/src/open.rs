use std::fmt;
use std::net::Ipv4Addr;

use bytes::{BufMut, BytesMut};
use nom::bytes::complete::take;
use nom::number::complete::{be_u16, be_u8};

use crate::{
    fill_length, parse_caps_block, BgpCap, BgpHeader, BgpType, CapabilityPacket, OpenSubcode,
    WireError, BGP_HEADER_LEN,
};

pub const BGP_VERSION: u8 = 4;

#[derive(Debug, Clone, PartialEq)]
pub struct OpenPacket {
    pub header: BgpHeader,
    pub version: u8,
    pub asn: u16,
    pub hold_time: u16,
    pub bgp_id: [u8; 4],
    pub caps: BgpCap,
    /// Set when the OPEN carried an optional parameter that is not a
    /// Capabilities parameter; triggers UnsupportedOptionalParameter.
    pub unknown_opt_param: Option<u8>,
}

impl OpenPacket {
    pub fn new(asn: u16, hold_time: u16, router_id: &Ipv4Addr, caps: BgpCap) -> OpenPacket {
        OpenPacket {
            header: BgpHeader::new(BgpType::Open, BGP_HEADER_LEN + 10),
            version: BGP_VERSION,
            asn,
            hold_time,
            bgp_id: router_id.octets(),
            caps,
            unknown_opt_param: None,
        }
    }

    pub fn bgp_id_addr(&self) -> Ipv4Addr {
        Ipv4Addr::new(self.bgp_id[0], self.bgp_id[1], self.bgp_id[2], self.bgp_id[3])
    }

    pub fn parse_packet(input: &[u8]) -> Result<(&[u8], OpenPacket), WireError> {
        let (input, header) = BgpHeader::parse_packet(input)?;
        let (input, version) = be_u8::<_, nom::error::Error<&[u8]>>(input)?;
        if version != BGP_VERSION {
            // Data carries the version we would accept.
            return Err(WireError::Open(
                OpenSubcode::UnsupportedVersionNumber,
                vec![0, BGP_VERSION],
            ));
        }
        let (input, asn) = be_u16::<_, nom::error::Error<&[u8]>>(input)?;
        let (input, hold_time) = be_u16::<_, nom::error::Error<&[u8]>>(input)?;
        let (input, id) = take::<_, _, nom::error::Error<&[u8]>>(4usize)(input)?;
        let mut bgp_id = [0u8; 4];
        bgp_id.copy_from_slice(id);
        let (input, opt_param_len) = be_u8::<_, nom::error::Error<&[u8]>>(input)?;
        if input.len() < opt_param_len as usize {
            return Err(WireError::Truncated);
        }
        let (mut opts, input) = input.split_at(opt_param_len as usize);

        let mut caps: Vec<CapabilityPacket> = Vec::new();
        let mut unknown_opt_param = None;
        while !opts.is_empty() {
            let (rest, typ) = be_u8::<_, nom::error::Error<&[u8]>>(opts)?;
            let (rest, length) = be_u8::<_, nom::error::Error<&[u8]>>(rest)?;
            let (rest, body) = take::<_, _, nom::error::Error<&[u8]>>(length as usize)(rest)?;
            if typ == crate::CAPABILITY_CODE {
                let (_, mut parsed) = parse_caps_block(body)?;
                caps.append(&mut parsed);
            } else if unknown_opt_param.is_none() {
                unknown_opt_param = Some(typ);
            }
            opts = rest;
        }

        Ok((
            input,
            OpenPacket {
                header,
                version,
                asn,
                hold_time,
                bgp_id,
                caps: BgpCap::from(caps),
                unknown_opt_param,
            },
        ))
    }
}

impl From<OpenPacket> for BytesMut {
    fn from(open: OpenPacket) -> Self {
        let mut buf = BytesMut::new();
        let header: BytesMut = open.header.into();
        buf.put(&header[..]);
        buf.put_u8(open.version);
        buf.put_u16(open.asn);
        buf.put_u16(open.hold_time);
        buf.put(&open.bgp_id[..]);

        let mut opt_buf = BytesMut::new();
        open.caps.emit(&mut opt_buf);
        buf.put_u8(opt_buf.len() as u8);
        buf.put(&opt_buf[..]);

        fill_length(&mut buf);
        buf
    }
}

impl fmt::Display for OpenPacket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Open Message:")?;
        writeln!(f, " AS: {} HoldTime: {}", self.asn, self.hold_time)?;
        write!(f, "{}", self.caps)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Afi, BgpPacket, CapAs4, CapMultiProtocol, Safi};

    fn sample_open() -> OpenPacket {
        let mut caps = BgpCap::default();
        caps.mp.push(CapMultiProtocol::new(&Afi::Ip, &Safi::Unicast));
        caps.as4 = Some(CapAs4::new(65536));
        OpenPacket::new(65001, 90, &Ipv4Addr::new(10, 0, 0, 1), caps)
    }

    #[test]
    fn roundtrip() {
        let open = sample_open();
        let buf: BytesMut = open.clone().into();
        let (rest, packet) = BgpPacket::parse_packet(&buf, true).unwrap();
        assert!(rest.is_empty());
        let BgpPacket::Open(parsed) = packet else {
            panic!("not an OPEN");
        };
        assert_eq!(parsed.asn, 65001);
        assert_eq!(parsed.hold_time, 90);
        assert_eq!(parsed.bgp_id_addr(), Ipv4Addr::new(10, 0, 0, 1));
        assert_eq!(parsed.caps, open.caps);
        assert!(parsed.unknown_opt_param.is_none());

        // Byte-exact re-encode.
        let reencoded: BytesMut = (*parsed).into();
        assert_eq!(&reencoded[..], &buf[..]);
    }

    #[test]
    fn known_bytes_fixture() {
        use hex_literal::hex;
        // OPEN: version 4, AS 65001, hold 90, id 10.0.0.1, no options.
        let bytes = hex!(
            "ffffffffffffffffffffffffffffffff"
            "001d 01"
            "04 fde9 005a 0a000001 00"
        );
        let (rest, packet) = BgpPacket::parse_packet(&bytes, true).unwrap();
        assert!(rest.is_empty());
        let BgpPacket::Open(parsed) = packet else {
            panic!("not an OPEN");
        };
        assert_eq!(parsed.asn, 65001);
        assert_eq!(parsed.hold_time, 90);
        assert_eq!(parsed.bgp_id_addr(), Ipv4Addr::new(10, 0, 0, 1));
        assert!(parsed.caps.is_empty());

        let reencoded: BytesMut = (*parsed).into();
        assert_eq!(&reencoded[..], &bytes[..]);
    }

    #[test]
    fn bad_version() {
        let open = sample_open();
        let mut buf: BytesMut = open.into();
        buf[19] = 3;
        let err = BgpPacket::parse_packet(&buf, true).unwrap_err();
        assert_eq!(
            err,
            WireError::Open(OpenSubcode::UnsupportedVersionNumber, vec![0, BGP_VERSION])
        );
    }
}
