use std::fmt;
use std::net::Ipv4Addr;

use bytes::BytesMut;

use crate::{
    emit_attrs, Aggregator, AsPath, Attr, AtomicAggregate, ClusterList, Community, LocalPref, Med,
    MpNexthop, NexthopAttr, Origin, OriginatorId, UnknownAttr, UpdateSubcode, WireError,
};

/// Dense, slotted view of a path-attribute list: one slot per well-known
/// or supported optional attribute plus an overflow list for the rest.
/// The "at most one attribute per type" invariant is structural here.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct PathAttrs {
    pub origin: Option<Origin>,
    pub aspath: Option<AsPath>,
    pub nexthop: Option<NexthopAttr>,
    pub med: Option<Med>,
    pub local_pref: Option<LocalPref>,
    pub atomic_aggregate: Option<AtomicAggregate>,
    pub aggregator: Option<Aggregator>,
    pub community: Option<Community>,
    pub originator_id: Option<OriginatorId>,
    pub cluster_list: Option<ClusterList>,
    /// Next hop carried by MP_REACH for non-v4-unicast families.
    pub mp_nexthop: Option<MpNexthop>,
    pub unknown: Vec<UnknownAttr>,
}

impl PathAttrs {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold a decoded attribute list into slots. AS4_PATH is merged into
    /// the AS path here (RFC 6793) and does not survive as a slot.
    pub fn from_attrs(attrs: Vec<Attr>) -> Result<Self, WireError> {
        let mut pa = PathAttrs::default();
        let mut as4path: Option<AsPath> = None;
        for attr in attrs {
            match attr {
                Attr::Origin(v) => pa.origin = Some(v),
                Attr::AsPath(v) => pa.aspath = Some(v),
                Attr::NextHop(v) => pa.nexthop = Some(v),
                Attr::Med(v) => pa.med = Some(v),
                Attr::LocalPref(v) => pa.local_pref = Some(v),
                Attr::AtomicAggregate(v) => pa.atomic_aggregate = Some(v),
                Attr::Aggregator(v) => pa.aggregator = Some(v),
                Attr::Community(v) => pa.community = Some(v),
                Attr::OriginatorId(v) => pa.originator_id = Some(v),
                Attr::ClusterList(v) => pa.cluster_list = Some(v),
                Attr::As4Path(v) => as4path = Some(v),
                Attr::MpReachNlri(v) => pa.mp_nexthop = Some(v.nexthop),
                Attr::MpUnreachNlri(_) => {}
                Attr::Unknown(v) => {
                    if v.should_forward() {
                        pa.unknown.push(v);
                    }
                }
            }
        }
        if let (Some(two), Some(four)) = (&pa.aspath, &as4path) {
            pa.aspath = Some(AsPath::merge_as4(two, four));
        }
        Ok(pa)
    }

    /// Mandatory attribute presence for a reachability UPDATE
    /// (RFC 4271 section 5; NEXT_HOP checked only for v4 unicast NLRI).
    pub fn well_known_check(&self, need_nexthop: bool) -> Result<(), WireError> {
        let missing = |typ: u8| WireError::Update(UpdateSubcode::MissingWellknownAttribute, vec![typ]);
        if self.origin.is_none() {
            return Err(missing(1));
        }
        if self.aspath.is_none() {
            return Err(missing(2));
        }
        if need_nexthop && self.nexthop.is_none() {
            return Err(missing(3));
        }
        Ok(())
    }

    /// Flatten back to a type-ordered attribute list. `as4` picks the AS
    /// path width; on 2-byte sessions an AS4_PATH is appended when the
    /// path holds ASNs that do not fit (RFC 6793).
    pub fn to_attrs(&self, as4: bool) -> Vec<Attr> {
        let mut attrs: Vec<Attr> = Vec::new();
        if let Some(v) = self.origin {
            attrs.push(Attr::Origin(v));
        }
        if let Some(v) = &self.aspath {
            attrs.push(Attr::AsPath(v.clone()));
        }
        if let Some(v) = self.nexthop {
            attrs.push(Attr::NextHop(v));
        }
        if let Some(v) = self.med {
            attrs.push(Attr::Med(v));
        }
        if let Some(v) = self.local_pref {
            attrs.push(Attr::LocalPref(v));
        }
        if let Some(v) = self.atomic_aggregate {
            attrs.push(Attr::AtomicAggregate(v));
        }
        if let Some(v) = self.aggregator {
            attrs.push(Attr::Aggregator(v));
        }
        if let Some(v) = &self.community {
            attrs.push(Attr::Community(v.clone()));
        }
        if let Some(v) = self.originator_id {
            attrs.push(Attr::OriginatorId(v));
        }
        if let Some(v) = &self.cluster_list {
            attrs.push(Attr::ClusterList(v.clone()));
        }
        if !as4 {
            if let Some(aspath) = &self.aspath {
                if aspath.has_wide_asn() {
                    attrs.push(Attr::As4Path(aspath.clone()));
                }
            }
        }
        for unknown in self.unknown.iter() {
            attrs.push(Attr::Unknown(unknown.clone()));
        }
        attrs
    }

    pub fn attr_emit(&self, buf: &mut BytesMut, as4: bool) {
        let attrs = self.to_attrs(as4);
        emit_attrs(buf, &attrs, as4);
    }

    pub fn aspath_len(&self) -> u32 {
        self.aspath.as_ref().map(|p| p.path_len()).unwrap_or(0)
    }

    pub fn neighboring_as(&self) -> Option<u32> {
        self.aspath.as_ref().and_then(|p| p.neighboring_as())
    }

    pub fn origin_or_incomplete(&self) -> Origin {
        self.origin.unwrap_or(Origin::Incomplete)
    }

    pub fn nexthop_v4(&self) -> Option<Ipv4Addr> {
        if let Some(nh) = self.nexthop {
            return Some(nh.nexthop);
        }
        if let Some(MpNexthop::Ipv4(addr)) = self.mp_nexthop {
            return Some(addr);
        }
        None
    }
}

impl fmt::Display for PathAttrs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(v) = &self.origin {
            writeln!(f, " Origin: {}", v)?;
        }
        if let Some(v) = &self.aspath {
            writeln!(f, " AS Path: {}", v)?;
        }
        if let Some(v) = &self.nexthop {
            writeln!(f, " Nexthop: {}", v)?;
        }
        if let Some(v) = &self.med {
            writeln!(f, " MED: {}", v)?;
        }
        if let Some(v) = &self.local_pref {
            writeln!(f, " LocalPref: {}", v)?;
        }
        if self.atomic_aggregate.is_some() {
            writeln!(f, " Atomic Aggregate")?;
        }
        if let Some(v) = &self.aggregator {
            writeln!(f, " Aggregator: {}", v)?;
        }
        if let Some(v) = &self.community {
            writeln!(f, " Community: {}", v)?;
        }
        if let Some(v) = &self.originator_id {
            writeln!(f, " OriginatorId: {}", v)?;
        }
        if let Some(v) = &self.cluster_list {
            writeln!(f, " ClusterList: {}", v)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parse_update_attrs;

    #[test]
    fn slots_hold_one_per_type() {
        let attrs = vec![
            Attr::Origin(Origin::Igp),
            Attr::AsPath(AsPath::from_sequence([65001])),
            Attr::NextHop(NexthopAttr::new(Ipv4Addr::new(10, 0, 0, 1))),
        ];
        let pa = PathAttrs::from_attrs(attrs).unwrap();
        assert!(pa.well_known_check(true).is_ok());
        assert_eq!(pa.aspath_len(), 1);
        assert_eq!(pa.neighboring_as(), Some(65001));
    }

    #[test]
    fn as4_path_merges_into_slot() {
        let attrs = vec![
            Attr::Origin(Origin::Igp),
            Attr::AsPath(AsPath::from_sequence([crate::AS_TRANS as u32, 65001])),
            Attr::As4Path(AsPath::from_sequence([70000, 65001])),
        ];
        let pa = PathAttrs::from_attrs(attrs).unwrap();
        assert_eq!(pa.aspath, Some(AsPath::from_sequence([70000, 65001])));
    }

    #[test]
    fn narrow_session_emits_as4_path() {
        let mut pa = PathAttrs::new();
        pa.origin = Some(Origin::Igp);
        pa.aspath = Some(AsPath::from_sequence([70000]));
        pa.nexthop = Some(NexthopAttr::new(Ipv4Addr::new(10, 0, 0, 1)));

        let mut buf = BytesMut::new();
        pa.attr_emit(&mut buf, false);
        let (_, parsed) = parse_update_attrs(&buf, buf.len() as u16, false).unwrap();
        let roundtrip = PathAttrs::from_attrs(parsed).unwrap();
        // The AS4_PATH emitted on the narrow session restores the wide ASN.
        assert_eq!(roundtrip.aspath, Some(AsPath::from_sequence([70000])));
    }
}
