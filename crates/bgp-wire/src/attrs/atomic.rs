use std::fmt;

use bytes::BytesMut;

use crate::{AttrEmitter, AttrFlags, AttrType};

/// ATOMIC_AGGREGATE: zero-length marker attribute.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct AtomicAggregate;

impl AttrEmitter for AtomicAggregate {
    fn attr_flags(&self) -> AttrFlags {
        AttrFlags::well_known()
    }

    fn attr_type(&self) -> AttrType {
        AttrType::AtomicAggregate
    }

    fn len(&self) -> Option<usize> {
        Some(0)
    }

    fn emit(&self, _buf: &mut BytesMut) {}
}

impl fmt::Debug for AtomicAggregate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Atomic Aggregate")
    }
}
