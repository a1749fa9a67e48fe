use std::fmt;

use bytes::{BufMut, BytesMut};
use ipnet::Ipv4Net;
use nom::number::complete::be_u16;

use crate::{
    emit_attrs, emit_ipv4_nlri, fill_length, ipv4_nlri_size, parse_ipv4_nlri, parse_update_attrs,
    Attr, BgpHeader, BgpType, MpReachAttr, MpUnreachAttr, WireError, BGP_HEADER_LEN,
    BGP_PACKET_LEN,
};

#[derive(Clone)]
pub struct UpdatePacket {
    pub header: BgpHeader,
    pub attrs: Vec<Attr>,
    pub ipv4_update: Vec<Ipv4Net>,
    pub ipv4_withdraw: Vec<Ipv4Net>,
    pub mp_update: Option<MpReachAttr>,
    pub mp_withdraw: Option<MpUnreachAttr>,
}

impl Default for UpdatePacket {
    fn default() -> Self {
        Self {
            header: BgpHeader::new(BgpType::Update, BGP_HEADER_LEN),
            attrs: Vec::new(),
            ipv4_update: Vec::new(),
            ipv4_withdraw: Vec::new(),
            mp_update: None,
            mp_withdraw: None,
        }
    }
}

impl UpdatePacket {
    pub fn new() -> Self {
        Self::default()
    }

    /// End-of-RIB marker: an UPDATE with nothing in it.
    pub fn is_eor(&self) -> bool {
        self.attrs.is_empty()
            && self.ipv4_update.is_empty()
            && self.ipv4_withdraw.is_empty()
            && self.mp_update.is_none()
            && self.mp_withdraw.is_none()
    }

    pub fn parse_packet(input: &[u8], as4: bool) -> Result<(&[u8], UpdatePacket), WireError> {
        let (input, header) = BgpHeader::parse_packet(input)?;
        let (input, withdraw_len) = be_u16::<_, nom::error::Error<&[u8]>>(input)?;
        let (input, ipv4_withdraw) = parse_ipv4_nlri(input, withdraw_len)?;
        let (input, attr_len) = be_u16::<_, nom::error::Error<&[u8]>>(input)?;
        let (input, mut attrs) = if attr_len > 0 {
            parse_update_attrs(input, attr_len, as4)?
        } else {
            (input, Vec::new())
        };

        let mut mp_update = None;
        let mut mp_withdraw = None;
        attrs.retain_mut(|attr| match attr {
            Attr::MpReachNlri(v) => {
                mp_update = Some(v.clone());
                false
            }
            Attr::MpUnreachNlri(v) => {
                mp_withdraw = Some(v.clone());
                false
            }
            _ => true,
        });

        let nlri_len = header
            .length
            .checked_sub(BGP_HEADER_LEN + 2 + withdraw_len + 2 + attr_len)
            .ok_or(WireError::Header(
                crate::HeaderSubcode::BadMessageLength,
                header.length.to_be_bytes().to_vec(),
            ))?;
        let (input, ipv4_update) = parse_ipv4_nlri(input, nlri_len)?;

        Ok((
            input,
            UpdatePacket {
                header,
                attrs,
                ipv4_update,
                ipv4_withdraw,
                mp_update,
                mp_withdraw,
            },
        ))
    }

    /// Encode into one message. Fails when the result would exceed the
    /// 4096-octet maximum; splitting is the producer's job.
    pub fn encode(&self, as4: bool) -> Result<BytesMut, WireError> {
        let mut buf = BytesMut::with_capacity(BGP_PACKET_LEN);
        let header: BytesMut = self.header.clone().into();
        buf.put(&header[..]);

        // IPv4 unicast withdraw.
        let withdraw_len_pos = buf.len();
        buf.put_u16(0u16); // Placeholder.
        for net in self.ipv4_withdraw.iter() {
            emit_ipv4_nlri(&mut buf, net);
        }
        let withdraw_len: u16 = (buf.len() - withdraw_len_pos - 2) as u16;
        buf[withdraw_len_pos..withdraw_len_pos + 2].copy_from_slice(&withdraw_len.to_be_bytes());

        // Attributes.
        let attr_len_pos = buf.len();
        buf.put_u16(0u16); // Placeholder.
        emit_attrs(&mut buf, &self.attrs, as4);
        if let Some(mp_update) = &self.mp_update {
            use crate::AttrEmitter;
            mp_update.attr_emit(&mut buf);
        }
        if let Some(mp_withdraw) = &self.mp_withdraw {
            use crate::AttrEmitter;
            mp_withdraw.attr_emit(&mut buf);
        }
        let attr_len: u16 = (buf.len() - attr_len_pos - 2) as u16;
        buf[attr_len_pos..attr_len_pos + 2].copy_from_slice(&attr_len.to_be_bytes());

        // IPv4 unicast update.
        for net in self.ipv4_update.iter() {
            emit_ipv4_nlri(&mut buf, net);
        }

        if buf.len() > BGP_PACKET_LEN {
            return Err(WireError::TooLong(buf.len()));
        }
        fill_length(&mut buf);
        Ok(buf)
    }

    /// Wire size this packet would need with the given session width.
    pub fn encoded_len(&self, as4: bool) -> usize {
        let mut fixed = BGP_HEADER_LEN as usize + 4;
        fixed += self
            .ipv4_withdraw
            .iter()
            .map(ipv4_nlri_size)
            .sum::<usize>();
        fixed += self.ipv4_update.iter().map(ipv4_nlri_size).sum::<usize>();
        let mut attr_buf = BytesMut::new();
        emit_attrs(&mut attr_buf, &self.attrs, as4);
        if let Some(mp_update) = &self.mp_update {
            use crate::AttrEmitter;
            mp_update.attr_emit(&mut attr_buf);
        }
        if let Some(mp_withdraw) = &self.mp_withdraw {
            use crate::AttrEmitter;
            mp_withdraw.attr_emit(&mut attr_buf);
        }
        fixed + attr_buf.len()
    }

    /// Room left before another v4 NLRI would overflow the message.
    pub fn fits_ipv4(&self, net: &Ipv4Net, as4: bool) -> bool {
        self.encoded_len(as4) + ipv4_nlri_size(net) <= BGP_PACKET_LEN
    }
}

impl fmt::Debug for UpdatePacket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self)
    }
}

impl fmt::Display for UpdatePacket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Update Message:")?;
        for attr in self.attrs.iter() {
            writeln!(f, " {:?}", attr)?;
        }
        if !self.ipv4_update.is_empty() {
            writeln!(f, " IPv4 Updates:")?;
            for update in self.ipv4_update.iter() {
                writeln!(f, "  {}", update)?;
            }
        }
        if !self.ipv4_withdraw.is_empty() {
            writeln!(f, " IPv4 Withdraw:")?;
            for withdraw in self.ipv4_withdraw.iter() {
                writeln!(f, "  {}", withdraw)?;
            }
        }
        if let Some(mp_update) = &self.mp_update {
            write!(f, "{}", mp_update)?;
        }
        if let Some(mp_withdraw) = &self.mp_withdraw {
            write!(f, "{}", mp_withdraw)?;
        }
        if self.is_eor() {
            writeln!(f, " EoR: IPv4/Unicast")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{AsPath, BgpPacket, NexthopAttr, Origin};
    use std::net::Ipv4Addr;

    fn sample_update() -> UpdatePacket {
        let mut update = UpdatePacket::new();
        update.attrs = vec![
            Attr::Origin(Origin::Igp),
            Attr::AsPath(AsPath::from_sequence([65001, 65002])),
            Attr::NextHop(NexthopAttr::new(Ipv4Addr::new(10, 0, 0, 1))),
        ];
        update.ipv4_update = vec!["10.0.0.0/24".parse().unwrap()];
        update.ipv4_withdraw = vec!["10.1.0.0/16".parse().unwrap()];
        update
    }

    #[test]
    fn roundtrip() {
        let update = sample_update();
        let buf = update.encode(true).unwrap();
        let (rest, packet) = BgpPacket::parse_packet(&buf, true).unwrap();
        assert!(rest.is_empty());
        let BgpPacket::Update(parsed) = packet else {
            panic!("not an UPDATE");
        };
        assert_eq!(parsed.attrs, update.attrs);
        assert_eq!(parsed.ipv4_update, update.ipv4_update);
        assert_eq!(parsed.ipv4_withdraw, update.ipv4_withdraw);

        // Byte-exact re-encode.
        let reencoded = parsed.encode(true).unwrap();
        assert_eq!(&reencoded[..], &buf[..]);
    }

    #[test]
    fn encoded_len_matches_encode() {
        let update = sample_update();
        let buf = update.encode(true).unwrap();
        assert_eq!(update.encoded_len(true), buf.len());
    }

    #[test]
    fn eor_detection() {
        let update = UpdatePacket::new();
        let buf = update.encode(true).unwrap();
        assert_eq!(buf.len(), 23);
        let (_, packet) = BgpPacket::parse_packet(&buf, true).unwrap();
        let BgpPacket::Update(parsed) = packet else {
            panic!("not an UPDATE");
        };
        assert!(parsed.is_eor());
    }
}
