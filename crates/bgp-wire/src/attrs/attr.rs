use std::fmt;

use bytes::BytesMut;
use nom::number::complete::{be_u16, be_u8};

use crate::{
    Aggregator, AggregatorAttr, AsPath, AsPathAttr, As4PathAttr, AtomicAggregate, AttrEmitter,
    AttrFlags, ClusterList, Community, LocalPref, Med, MpReachAttr, MpUnreachAttr, NexthopAttr,
    Origin, OriginatorId, ParseBe, UnknownAttr, UpdateSubcode, WireError,
};

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum AttrType {
    Origin = 1,
    AsPath = 2,
    NextHop = 3,
    Med = 4,
    LocalPref = 5,
    AtomicAggregate = 6,
    Aggregator = 7,
    Community = 8,
    OriginatorId = 9,
    ClusterList = 10,
    MpReachNlri = 14,
    MpUnreachNlri = 15,
    As4Path = 17,
    Unknown(u8),
}

impl From<AttrType> for u8 {
    fn from(typ: AttrType) -> Self {
        use AttrType::*;
        match typ {
            Origin => 1,
            AsPath => 2,
            NextHop => 3,
            Med => 4,
            LocalPref => 5,
            AtomicAggregate => 6,
            Aggregator => 7,
            Community => 8,
            OriginatorId => 9,
            ClusterList => 10,
            MpReachNlri => 14,
            MpUnreachNlri => 15,
            As4Path => 17,
            Unknown(v) => v,
        }
    }
}

impl From<u8> for AttrType {
    fn from(val: u8) -> Self {
        use AttrType::*;
        match val {
            1 => Origin,
            2 => AsPath,
            3 => NextHop,
            4 => Med,
            5 => LocalPref,
            6 => AtomicAggregate,
            7 => Aggregator,
            8 => Community,
            9 => OriginatorId,
            10 => ClusterList,
            14 => MpReachNlri,
            15 => MpUnreachNlri,
            17 => As4Path,
            v => Unknown(v),
        }
    }
}

/// One decoded path attribute.
#[derive(Clone, Debug, PartialEq)]
pub enum Attr {
    Origin(Origin),
    AsPath(AsPath),
    NextHop(NexthopAttr),
    Med(Med),
    LocalPref(LocalPref),
    AtomicAggregate(AtomicAggregate),
    Aggregator(Aggregator),
    Community(Community),
    OriginatorId(OriginatorId),
    ClusterList(ClusterList),
    MpReachNlri(MpReachAttr),
    MpUnreachNlri(MpUnreachAttr),
    As4Path(AsPath),
    Unknown(UnknownAttr),
}

impl Attr {
    pub fn attr_type(&self) -> AttrType {
        match self {
            Attr::Origin(_) => AttrType::Origin,
            Attr::AsPath(_) => AttrType::AsPath,
            Attr::NextHop(_) => AttrType::NextHop,
            Attr::Med(_) => AttrType::Med,
            Attr::LocalPref(_) => AttrType::LocalPref,
            Attr::AtomicAggregate(_) => AttrType::AtomicAggregate,
            Attr::Aggregator(_) => AttrType::Aggregator,
            Attr::Community(_) => AttrType::Community,
            Attr::OriginatorId(_) => AttrType::OriginatorId,
            Attr::ClusterList(_) => AttrType::ClusterList,
            Attr::MpReachNlri(_) => AttrType::MpReachNlri,
            Attr::MpUnreachNlri(_) => AttrType::MpUnreachNlri,
            Attr::As4Path(_) => AttrType::As4Path,
            Attr::Unknown(m) => AttrType::Unknown(m.typ),
        }
    }
}

/// Expected (optional, transitive) bits for every attribute we know.
fn expected_flags(typ: AttrType) -> Option<(bool, bool)> {
    use AttrType::*;
    match typ {
        Origin | AsPath | NextHop | LocalPref | AtomicAggregate => Some((false, true)),
        Med | OriginatorId | ClusterList | MpReachNlri | MpUnreachNlri => Some((true, false)),
        Aggregator | Community | As4Path => Some((true, true)),
        Unknown(_) => None,
    }
}

fn echo_attr(flags: u8, typ: u8, body: &[u8]) -> Vec<u8> {
    let mut data = vec![flags, typ, body.len() as u8];
    data.extend_from_slice(body);
    data
}

/// Parse the attribute block of an UPDATE. `as4` selects the AS_PATH /
/// AGGREGATOR width negotiated for the session.
pub fn parse_update_attrs(input: &[u8], attr_len: u16, as4: bool) -> Result<(&[u8], Vec<Attr>), WireError> {
    if input.len() < attr_len as usize {
        return Err(WireError::Truncated);
    }
    let (mut block, input) = input.split_at(attr_len as usize);
    let mut attrs: Vec<Attr> = Vec::new();

    while !block.is_empty() {
        let (rest, flags_raw) = be_u8::<_, nom::error::Error<&[u8]>>(block)?;
        let (rest, typ_raw) = be_u8::<_, nom::error::Error<&[u8]>>(rest)?;
        let flags = AttrFlags::from(flags_raw);
        let (rest, length) = if flags.extended() {
            be_u16::<_, nom::error::Error<&[u8]>>(rest)?
        } else {
            let (rest, len) = be_u8::<_, nom::error::Error<&[u8]>>(rest)?;
            (rest, len as u16)
        };
        if rest.len() < length as usize {
            return Err(WireError::Update(
                UpdateSubcode::AttributeLengthError,
                echo_attr(flags_raw, typ_raw, rest),
            ));
        }
        let (body, rest) = rest.split_at(length as usize);
        let typ = AttrType::from(typ_raw);

        if let Some((optional, transitive)) = expected_flags(typ) {
            if flags.optional() != optional || flags.transitive() != transitive {
                return Err(WireError::Update(
                    UpdateSubcode::AttributeFlagsError,
                    echo_attr(flags_raw, typ_raw, body),
                ));
            }
        } else if !flags.optional() {
            // An unrecognized well-known attribute is fatal to the session.
            return Err(WireError::Update(
                UpdateSubcode::UnrecognizedWellknownAttribute,
                echo_attr(flags_raw, typ_raw, body),
            ));
        }

        let attr = parse_one_attr(typ, flags, body, as4)?;
        if attrs.iter().any(|a| a.attr_type() == attr.attr_type()) {
            // At most one attribute per type (RFC 4271 section 5).
            return Err(WireError::Update(
                UpdateSubcode::MalformedAttributeList,
                Vec::new(),
            ));
        }
        attrs.push(attr);
        block = rest;
    }

    Ok((input, attrs))
}

fn parse_one_attr(
    typ: AttrType,
    flags: AttrFlags,
    body: &[u8],
    as4: bool,
) -> Result<Attr, WireError> {
    let bad_len =
        || WireError::Update(UpdateSubcode::AttributeLengthError, echo_attr(flags.into(), typ.into(), body));
    let attr = match typ {
        AttrType::Origin => {
            if body.len() != 1 {
                return Err(bad_len());
            }
            if body[0] > 2 {
                return Err(WireError::Update(
                    UpdateSubcode::InvalidOriginAttribute,
                    echo_attr(flags.into(), typ.into(), body),
                ));
            }
            let (_, origin) = Origin::parse_be(body)?;
            Attr::Origin(origin)
        }
        AttrType::AsPath => {
            let parse = if as4 { AsPath::parse4 } else { AsPath::parse2 };
            let (rest, aspath) = parse(body)
                .map_err(|_| WireError::Update(UpdateSubcode::MalformedAsPath, Vec::new()))?;
            if !rest.is_empty() {
                return Err(WireError::Update(UpdateSubcode::MalformedAsPath, Vec::new()));
            }
            Attr::AsPath(aspath)
        }
        AttrType::NextHop => {
            if body.len() != 4 {
                return Err(bad_len());
            }
            let (_, nexthop) = NexthopAttr::parse_be(body)?;
            Attr::NextHop(nexthop)
        }
        AttrType::Med => {
            if body.len() != 4 {
                return Err(bad_len());
            }
            let (_, med) = Med::parse_be(body)?;
            Attr::Med(med)
        }
        AttrType::LocalPref => {
            if body.len() != 4 {
                return Err(bad_len());
            }
            let (_, local_pref) = LocalPref::parse_be(body)?;
            Attr::LocalPref(local_pref)
        }
        AttrType::AtomicAggregate => {
            if !body.is_empty() {
                return Err(bad_len());
            }
            Attr::AtomicAggregate(AtomicAggregate)
        }
        AttrType::Aggregator => match (as4, body.len()) {
            (true, 8) => {
                let (_, aggregator) = Aggregator::parse4(body)?;
                Attr::Aggregator(aggregator)
            }
            (false, 6) => {
                let (_, aggregator) = Aggregator::parse2(body)?;
                Attr::Aggregator(aggregator)
            }
            _ => return Err(bad_len()),
        },
        AttrType::Community => {
            if body.len() % 4 != 0 {
                return Err(bad_len());
            }
            let (_, com) = Community::parse_be(body)?;
            Attr::Community(com)
        }
        AttrType::OriginatorId => {
            if body.len() != 4 {
                return Err(bad_len());
            }
            let (_, id) = OriginatorId::parse_be(body)?;
            Attr::OriginatorId(id)
        }
        AttrType::ClusterList => {
            if body.len() % 4 != 0 {
                return Err(bad_len());
            }
            let (_, list) = ClusterList::parse_be(body)?;
            Attr::ClusterList(list)
        }
        AttrType::MpReachNlri => Attr::MpReachNlri(MpReachAttr::parse_attr(body)?),
        AttrType::MpUnreachNlri => Attr::MpUnreachNlri(MpUnreachAttr::parse_attr(body)?),
        AttrType::As4Path => {
            let (rest, aspath) = AsPath::parse4(body)
                .map_err(|_| WireError::Update(UpdateSubcode::MalformedAsPath, Vec::new()))?;
            if !rest.is_empty() {
                return Err(WireError::Update(UpdateSubcode::MalformedAsPath, Vec::new()));
            }
            Attr::As4Path(aspath)
        }
        AttrType::Unknown(v) => Attr::Unknown(UnknownAttr {
            flags,
            typ: v,
            data: body.to_vec(),
        }),
    };
    Ok(attr)
}

/// Emit a list of attributes at the session width. The caller is expected
/// to keep the list type-ordered; this function emits in list order.
pub fn emit_attrs(buf: &mut BytesMut, attrs: &[Attr], as4: bool) {
    for attr in attrs.iter() {
        match attr {
            Attr::Origin(v) => v.attr_emit(buf),
            Attr::AsPath(v) => AsPathAttr { aspath: v, as4 }.attr_emit(buf),
            Attr::NextHop(v) => v.attr_emit(buf),
            Attr::Med(v) => v.attr_emit(buf),
            Attr::LocalPref(v) => v.attr_emit(buf),
            Attr::AtomicAggregate(v) => v.attr_emit(buf),
            Attr::Aggregator(v) => AggregatorAttr { aggregator: v, as4 }.attr_emit(buf),
            Attr::Community(v) => v.attr_emit(buf),
            Attr::OriginatorId(v) => v.attr_emit(buf),
            Attr::ClusterList(v) => v.attr_emit(buf),
            Attr::MpReachNlri(v) => v.attr_emit(buf),
            Attr::MpUnreachNlri(v) => v.attr_emit(buf),
            Attr::As4Path(v) => As4PathAttr { aspath: v }.attr_emit(buf),
            Attr::Unknown(v) => v.attr_emit(buf),
        }
    }
}

impl fmt::Display for AttrType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        use AttrType::*;
        match self {
            Origin => write!(f, "ORIGIN"),
            AsPath => write!(f, "AS_PATH"),
            NextHop => write!(f, "NEXT_HOP"),
            Med => write!(f, "MULTI_EXIT_DISC"),
            LocalPref => write!(f, "LOCAL_PREF"),
            AtomicAggregate => write!(f, "ATOMIC_AGGREGATE"),
            Aggregator => write!(f, "AGGREGATOR"),
            Community => write!(f, "COMMUNITY"),
            OriginatorId => write!(f, "ORIGINATOR_ID"),
            ClusterList => write!(f, "CLUSTER_LIST"),
            MpReachNlri => write!(f, "MP_REACH_NLRI"),
            MpUnreachNlri => write!(f, "MP_UNREACH_NLRI"),
            As4Path => write!(f, "AS4_PATH"),
            Unknown(v) => write!(f, "UNKNOWN({})", v),
        }
    }
}
