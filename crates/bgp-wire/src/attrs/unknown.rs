use std::fmt;

use bytes::{BufMut, BytesMut};

use crate::AttrFlags;

/// Attribute we do not recognize. Optional transitive ones are carried
/// through with the partial bit set; the rest are dropped by the holder.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct UnknownAttr {
    pub flags: AttrFlags,
    pub typ: u8,
    pub data: Vec<u8>,
}

impl UnknownAttr {
    pub fn should_forward(&self) -> bool {
        self.flags.optional() && self.flags.transitive()
    }

    /// Re-emit with the partial bit set, as required for forwarded unknown
    /// transitive attributes.
    pub fn attr_emit(&self, buf: &mut BytesMut) {
        let flags = self.flags.with_partial(true);
        let extended = self.data.len() > 255 || self.flags.extended();
        if extended {
            buf.put_u8(flags.with_extended(true).into());
            buf.put_u8(self.typ);
            buf.put_u16(self.data.len() as u16);
        } else {
            buf.put_u8(flags.into());
            buf.put_u8(self.typ);
            buf.put_u8(self.data.len() as u8);
        }
        buf.put(&self.data[..]);
    }
}

impl fmt::Debug for UnknownAttr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Unknown({}): {} octets", self.typ, self.data.len())
    }
}
