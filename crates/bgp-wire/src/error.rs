use thiserror::Error;

use crate::notification::{
    CeaseSubcode, HeaderSubcode, NotifyCode, OpenSubcode, UpdateSubcode,
};

/// Decode failure carrying the NOTIFICATION the peer should receive.
///
/// Decode never panics or unwinds; every malformed input maps to the
/// RFC 4271 section 6 error-code/subcode pair plus the data octets to
/// echo back in the NOTIFICATION.
#[derive(Error, Debug, PartialEq, Eq, Clone)]
pub enum WireError {
    #[error("message header error: {0:?}")]
    Header(HeaderSubcode, Vec<u8>),

    #[error("open message error: {0:?}")]
    Open(OpenSubcode, Vec<u8>),

    #[error("update message error: {0:?}")]
    Update(UpdateSubcode, Vec<u8>),

    #[error("message truncated")]
    Truncated,

    #[error("encoded message would exceed {0} octets")]
    TooLong(usize),
}

impl WireError {
    pub fn code(&self) -> NotifyCode {
        match self {
            WireError::Header(..) => NotifyCode::MessageHeaderError,
            WireError::Open(..) => NotifyCode::OpenMessageError,
            WireError::Update(..) => NotifyCode::UpdateMessageError,
            // A short read is indistinguishable from a header length lie.
            WireError::Truncated => NotifyCode::MessageHeaderError,
            WireError::TooLong(_) => NotifyCode::Cease,
        }
    }

    pub fn subcode(&self) -> u8 {
        match self {
            WireError::Header(sub, _) => *sub as u8,
            WireError::Open(sub, _) => *sub as u8,
            WireError::Update(sub, _) => *sub as u8,
            WireError::Truncated => HeaderSubcode::BadMessageLength as u8,
            WireError::TooLong(_) => CeaseSubcode::OutOfResources as u8,
        }
    }

    pub fn data(&self) -> &[u8] {
        match self {
            WireError::Header(_, data) => data,
            WireError::Open(_, data) => data,
            WireError::Update(_, data) => data,
            _ => &[],
        }
    }
}

impl From<nom::Err<nom::error::Error<&[u8]>>> for WireError {
    fn from(_: nom::Err<nom::error::Error<&[u8]>>) -> Self {
        WireError::Truncated
    }
}
