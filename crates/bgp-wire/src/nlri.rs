use bytes::{BufMut, BytesMut};
use ipnet::{Ipv4Net, Ipv6Net};

use crate::{UpdateSubcode, WireError};

/// Number of octets needed to carry `plen` prefix bits.
pub fn nlri_psize(plen: u8) -> usize {
    plen.div_ceil(8) as usize
}

pub fn parse_ipv4_nlri(input: &[u8], len: u16) -> Result<(&[u8], Vec<Ipv4Net>), WireError> {
    let (mut body, input) = split_nlri(input, len)?;
    let mut nets = Vec::new();
    while !body.is_empty() {
        let plen = body[0];
        if plen > 32 {
            return Err(WireError::Update(
                UpdateSubcode::InvalidNetworkField,
                vec![plen],
            ));
        }
        let psize = nlri_psize(plen);
        if body.len() < 1 + psize {
            return Err(WireError::Truncated);
        }
        let mut octets = [0u8; 4];
        octets[..psize].copy_from_slice(&body[1..1 + psize]);
        let net = Ipv4Net::new(octets.into(), plen)
            .map_err(|_| WireError::Update(UpdateSubcode::InvalidNetworkField, vec![plen]))?;
        // Host bits beyond the prefix length must be zero on the wire; we
        // accept and mask, as most implementations do.
        nets.push(net.trunc());
        body = &body[1 + psize..];
    }
    Ok((input, nets))
}

pub fn parse_ipv6_nlri(input: &[u8], len: u16) -> Result<(&[u8], Vec<Ipv6Net>), WireError> {
    let (mut body, input) = split_nlri(input, len)?;
    let mut nets = Vec::new();
    while !body.is_empty() {
        let plen = body[0];
        if plen > 128 {
            return Err(WireError::Update(
                UpdateSubcode::InvalidNetworkField,
                vec![plen],
            ));
        }
        let psize = nlri_psize(plen);
        if body.len() < 1 + psize {
            return Err(WireError::Truncated);
        }
        let mut octets = [0u8; 16];
        octets[..psize].copy_from_slice(&body[1..1 + psize]);
        let net = Ipv6Net::new(octets.into(), plen)
            .map_err(|_| WireError::Update(UpdateSubcode::InvalidNetworkField, vec![plen]))?;
        nets.push(net.trunc());
        body = &body[1 + psize..];
    }
    Ok((input, nets))
}

fn split_nlri(input: &[u8], len: u16) -> Result<(&[u8], &[u8]), WireError> {
    if input.len() < len as usize {
        return Err(WireError::Truncated);
    }
    Ok(input.split_at(len as usize))
}

pub fn emit_ipv4_nlri(buf: &mut BytesMut, net: &Ipv4Net) {
    buf.put_u8(net.prefix_len());
    let psize = nlri_psize(net.prefix_len());
    buf.put(&net.addr().octets()[0..psize]);
}

pub fn emit_ipv6_nlri(buf: &mut BytesMut, net: &Ipv6Net) {
    buf.put_u8(net.prefix_len());
    let psize = nlri_psize(net.prefix_len());
    buf.put(&net.addr().octets()[0..psize]);
}

/// Wire size of one NLRI entry.
pub fn ipv4_nlri_size(net: &Ipv4Net) -> usize {
    1 + nlri_psize(net.prefix_len())
}

pub fn ipv6_nlri_size(net: &Ipv6Net) -> usize {
    1 + nlri_psize(net.prefix_len())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ipv4_roundtrip() {
        let nets: Vec<Ipv4Net> = vec![
            "10.0.0.0/24".parse().unwrap(),
            "192.0.2.128/25".parse().unwrap(),
            "0.0.0.0/0".parse().unwrap(),
        ];
        let mut buf = BytesMut::new();
        for net in nets.iter() {
            emit_ipv4_nlri(&mut buf, net);
        }
        let (rest, parsed) = parse_ipv4_nlri(&buf, buf.len() as u16).unwrap();
        assert!(rest.is_empty());
        assert_eq!(parsed, nets);
    }

    #[test]
    fn too_long_prefix_is_invalid() {
        let buf = [33u8, 1, 2, 3, 4, 5];
        let err = parse_ipv4_nlri(&buf, 6).unwrap_err();
        assert_eq!(
            err,
            WireError::Update(UpdateSubcode::InvalidNetworkField, vec![33])
        );
    }
}
