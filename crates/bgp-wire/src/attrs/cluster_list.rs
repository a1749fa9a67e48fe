use std::fmt;
use std::net::Ipv4Addr;

use bytes::{BufMut, BytesMut};
use nom::combinator::complete;
use nom::multi::many0;
use nom::number::complete::be_u32;
use nom::IResult;

use crate::{AttrEmitter, AttrFlags, AttrType, ParseBe};

/// CLUSTER_LIST (RFC 4456).
#[derive(Clone, Default, PartialEq, Eq, Hash)]
pub struct ClusterList {
    pub list: Vec<Ipv4Addr>,
}

impl ClusterList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.list.len()
    }

    pub fn is_empty(&self) -> bool {
        self.list.is_empty()
    }

    pub fn contains(&self, id: &Ipv4Addr) -> bool {
        self.list.contains(id)
    }

    pub fn prepend(&mut self, id: Ipv4Addr) {
        self.list.insert(0, id);
    }
}

impl ParseBe<ClusterList> for ClusterList {
    fn parse_be(input: &[u8]) -> IResult<&[u8], Self> {
        let (input, ids) = many0(complete(be_u32))(input)?;
        let list = ids.into_iter().map(Ipv4Addr::from).collect();
        Ok((input, ClusterList { list }))
    }
}

impl AttrEmitter for ClusterList {
    fn attr_flags(&self) -> AttrFlags {
        AttrFlags::optional_non_transitive()
    }

    fn attr_type(&self) -> AttrType {
        AttrType::ClusterList
    }

    fn len(&self) -> Option<usize> {
        Some(self.list.len() * 4)
    }

    fn emit(&self, buf: &mut BytesMut) {
        for cluster_id in &self.list {
            buf.put(&cluster_id.octets()[..]);
        }
    }
}

impl fmt::Display for ClusterList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let strs: Vec<String> = self.list.iter().map(|id| id.to_string()).collect();
        write!(f, "{}", strs.join(" "))
    }
}

impl fmt::Debug for ClusterList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Cluster List: {}", self)
    }
}
