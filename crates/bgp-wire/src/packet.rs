use bytes::{BufMut, BytesMut};
use nom::number::complete::{be_u16, be_u8};
use nom::IResult;

use crate::{
    HeaderSubcode, NotificationPacket, OpenPacket, UpdatePacket, WireError,
};

pub const BGP_PACKET_LEN: usize = 4096;
pub const BGP_HEADER_LEN: u16 = 19;
pub const BGP_PORT: u16 = 179;

pub const BGP_MARKER: [u8; 16] = [0xff; 16];

#[repr(u8)]
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum BgpType {
    Open = 1,
    Update = 2,
    Notification = 3,
    Keepalive = 4,
    Max = 5,
}

impl TryFrom<u8> for BgpType {
    type Error = u8;

    fn try_from(val: u8) -> Result<Self, u8> {
        match val {
            1 => Ok(Self::Open),
            2 => Ok(Self::Update),
            3 => Ok(Self::Notification),
            4 => Ok(Self::Keepalive),
            v => Err(v),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BgpHeader {
    pub marker: [u8; 16],
    pub length: u16,
    pub typ: BgpType,
}

impl BgpHeader {
    pub fn new(typ: BgpType, length: u16) -> Self {
        Self {
            marker: BGP_MARKER,
            length,
            typ,
        }
    }

    /// Header decode with the byte-exact checks of RFC 4271 section 6.1.
    pub fn parse_packet(input: &[u8]) -> Result<(&[u8], BgpHeader), WireError> {
        if input.len() < BGP_HEADER_LEN as usize {
            return Err(WireError::Truncated);
        }
        let (input, header) = Self::parse_be(input)?;
        if header.marker != BGP_MARKER {
            return Err(WireError::Header(
                HeaderSubcode::ConnectionNotSynchronized,
                Vec::new(),
            ));
        }
        if header.length < BGP_HEADER_LEN || header.length as usize > BGP_PACKET_LEN {
            return Err(WireError::Header(
                HeaderSubcode::BadMessageLength,
                header.length.to_be_bytes().to_vec(),
            ));
        }
        Ok((input, header))
    }

    fn parse_be(input: &[u8]) -> Result<(&[u8], BgpHeader), WireError> {
        let (input, marker) = take_marker(input)?;
        let (input, length) = be_u16::<_, nom::error::Error<&[u8]>>(input)?;
        let (input, typ) = be_u8::<_, nom::error::Error<&[u8]>>(input)?;
        let typ = BgpType::try_from(typ)
            .map_err(|v| WireError::Header(HeaderSubcode::BadMessageType, vec![v]))?;
        Ok((
            input,
            BgpHeader {
                marker,
                length,
                typ,
            },
        ))
    }
}

fn take_marker(input: &[u8]) -> IResult<&[u8], [u8; 16]> {
    let (input, bytes) = nom::bytes::complete::take(16usize)(input)?;
    let mut marker = [0u8; 16];
    marker.copy_from_slice(bytes);
    Ok((input, marker))
}

impl From<BgpHeader> for BytesMut {
    fn from(header: BgpHeader) -> Self {
        let mut buf = BytesMut::new();
        buf.put(&header.marker[..]);
        buf.put_u16(header.length);
        buf.put_u8(header.typ as u8);
        buf
    }
}

/// Byte range of the length field, for backfilling after emit.
pub const LENGTH_POS: std::ops::Range<usize> = 16..18;

pub fn fill_length(buf: &mut BytesMut) {
    let length: u16 = buf.len() as u16;
    buf[LENGTH_POS].copy_from_slice(&length.to_be_bytes());
}

/// Peek the total message length out of a partially buffered stream.
pub fn peek_bgp_length(input: &[u8]) -> usize {
    if let Some(len) = input.get(16..18) {
        u16::from_be_bytes(len.try_into().unwrap()) as usize
    } else {
        0
    }
}

#[derive(Debug)]
pub enum BgpPacket {
    Open(Box<OpenPacket>),
    Keepalive(BgpHeader),
    Notification(NotificationPacket),
    Update(Box<UpdatePacket>),
}

impl BgpPacket {
    /// Parse one whole message. `as4` selects 4-byte AS_PATH decoding as
    /// negotiated by capability exchange.
    pub fn parse_packet(input: &[u8], as4: bool) -> Result<(&[u8], BgpPacket), WireError> {
        let (_, header) = BgpHeader::parse_packet(input)?;
        if input.len() < header.length as usize {
            return Err(WireError::Truncated);
        }
        match header.typ {
            BgpType::Open => {
                let (input, packet) = OpenPacket::parse_packet(input)?;
                Ok((input, BgpPacket::Open(Box::new(packet))))
            }
            BgpType::Update => {
                let (input, packet) = UpdatePacket::parse_packet(input, as4)?;
                Ok((input, BgpPacket::Update(Box::new(packet))))
            }
            BgpType::Notification => {
                let (input, packet) = NotificationPacket::parse_packet(input)?;
                Ok((input, BgpPacket::Notification(packet)))
            }
            BgpType::Keepalive => {
                let (rest, _) = nom::bytes::complete::take::<_, _, nom::error::Error<&[u8]>>(
                    header.length as usize,
                )(input)?;
                if header.length != BGP_HEADER_LEN {
                    return Err(WireError::Header(
                        HeaderSubcode::BadMessageLength,
                        header.length.to_be_bytes().to_vec(),
                    ));
                }
                Ok((rest, BgpPacket::Keepalive(header)))
            }
            BgpType::Max => unreachable!(),
        }
    }
}

/// A KEEPALIVE is a bare header.
pub fn keepalive_packet() -> BytesMut {
    BgpHeader::new(BgpType::Keepalive, BGP_HEADER_LEN).into()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keepalive_is_bare_header() {
        let buf = keepalive_packet();
        assert_eq!(buf.len(), 19);
        assert_eq!(&buf[0..16], &BGP_MARKER);
        assert_eq!(peek_bgp_length(&buf), 19);
        let (_, packet) = BgpPacket::parse_packet(&buf, true).unwrap();
        assert!(matches!(packet, BgpPacket::Keepalive(_)));
    }

    #[test]
    fn bad_marker_is_not_synchronized() {
        let mut buf = keepalive_packet();
        buf[3] = 0;
        let err = BgpPacket::parse_packet(&buf, true).unwrap_err();
        assert_eq!(
            err,
            WireError::Header(HeaderSubcode::ConnectionNotSynchronized, Vec::new())
        );
    }

    #[test]
    fn short_length_is_rejected() {
        let mut buf = keepalive_packet();
        buf[16..18].copy_from_slice(&10u16.to_be_bytes());
        let err = BgpPacket::parse_packet(&buf, true).unwrap_err();
        assert_eq!(
            err,
            WireError::Header(HeaderSubcode::BadMessageLength, vec![0, 10])
        );
    }

    #[test]
    fn unknown_type_is_rejected() {
        let mut buf = keepalive_packet();
        buf[18] = 9;
        let err = BgpPacket::parse_packet(&buf, true).unwrap_err();
        assert_eq!(err, WireError::Header(HeaderSubcode::BadMessageType, vec![9]));
    }
}
