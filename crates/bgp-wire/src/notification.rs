use std::fmt::Display;

use bytes::{BufMut, BytesMut};
use nom::bytes::complete::take;
use nom::number::complete::be_u8;
use serde::Serialize;

use crate::{fill_length, BgpHeader, BgpType, WireError, BGP_HEADER_LEN};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NotificationPacket {
    pub header: BgpHeader,
    pub code: NotifyCode,
    pub sub_code: u8,
    pub data: Vec<u8>,
}

#[repr(u8)]
#[derive(Debug, PartialEq, Eq, Clone, Copy, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum NotifyCode {
    MessageHeaderError = 1,
    OpenMessageError = 2,
    UpdateMessageError = 3,
    HoldTimerExpired = 4,
    FsmError = 5,
    Cease = 6,
    Unknown(u8),
}

impl From<NotifyCode> for u8 {
    fn from(code: NotifyCode) -> Self {
        use NotifyCode::*;
        match code {
            MessageHeaderError => 1,
            OpenMessageError => 2,
            UpdateMessageError => 3,
            HoldTimerExpired => 4,
            FsmError => 5,
            Cease => 6,
            Unknown(v) => v,
        }
    }
}

impl From<u8> for NotifyCode {
    fn from(code: u8) -> Self {
        use NotifyCode::*;
        match code {
            1 => MessageHeaderError,
            2 => OpenMessageError,
            3 => UpdateMessageError,
            4 => HoldTimerExpired,
            5 => FsmError,
            6 => Cease,
            v => Unknown(v),
        }
    }
}

impl Display for NotifyCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        use NotifyCode::*;
        match self {
            MessageHeaderError => write!(f, "Message Header Error"),
            OpenMessageError => write!(f, "OPEN Message Error"),
            UpdateMessageError => write!(f, "UPDATE Message Error"),
            HoldTimerExpired => write!(f, "Hold Timer Expired"),
            FsmError => write!(f, "Finite State Machine Error"),
            Cease => write!(f, "Cease"),
            Unknown(v) => write!(f, "Unknown {}", v),
        }
    }
}

#[repr(u8)]
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum HeaderSubcode {
    ConnectionNotSynchronized = 1,
    BadMessageLength = 2,
    BadMessageType = 3,
}

#[repr(u8)]
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum OpenSubcode {
    UnsupportedVersionNumber = 1,
    BadPeerAs = 2,
    BadBgpIdentifier = 3,
    UnsupportedOptionalParameter = 4,
    // 5 is deprecated.
    UnacceptableHoldTime = 6,
    UnsupportedCapability = 7, // RFC5492
}

#[repr(u8)]
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum UpdateSubcode {
    MalformedAttributeList = 1,
    UnrecognizedWellknownAttribute = 2,
    MissingWellknownAttribute = 3,
    AttributeFlagsError = 4,
    AttributeLengthError = 5,
    InvalidOriginAttribute = 6,
    // 7 is deprecated.
    InvalidNexthopAttribute = 8,
    OptionalAttributeError = 9,
    InvalidNetworkField = 10,
    MalformedAsPath = 11,
}

#[repr(u8)]
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum FsmSubcode {
    UnexpectedMessageInOpenSent = 1,    // RFC6608
    UnexpectedMessageInOpenConfirm = 2, // RFC6608
    UnexpectedMessageInEstablished = 3, // RFC6608
}

#[repr(u8)]
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum CeaseSubcode {
    MaximumNumberOfPrefixesReached = 1, // RFC4486
    AdministrativeShutdown = 2,
    PeerDeConfigured = 3,
    AdministrativeReset = 4,
    ConnectionRejected = 5,
    OtherConfigChange = 6,
    ConnectionCollisionResolution = 7,
    OutOfResources = 8,
}

/// Validate a (code, subcode) pair before a NOTIFICATION is built. Unknown
/// pairs are refused at send time rather than put on the wire.
pub fn notify_pair_valid(code: NotifyCode, sub_code: u8) -> bool {
    use NotifyCode::*;
    match code {
        MessageHeaderError => (1..=3).contains(&sub_code),
        OpenMessageError => matches!(sub_code, 1..=4 | 6 | 7),
        UpdateMessageError => matches!(sub_code, 1..=6 | 8..=11),
        HoldTimerExpired => sub_code == 0,
        FsmError => (0..=3).contains(&sub_code),
        Cease => (0..=8).contains(&sub_code),
        Unknown(_) => false,
    }
}

fn notify_sub_code_str(code: NotifyCode, sub_code: u8) -> String {
    use NotifyCode::*;
    match code {
        MessageHeaderError => match sub_code {
            1 => "Connection Not Synchronized".into(),
            2 => "Bad Message Length".into(),
            3 => "Bad Message Type".into(),
            v => format!("Unknown({})", v),
        },
        OpenMessageError => match sub_code {
            1 => "Unsupported Version Number".into(),
            2 => "Bad Peer AS".into(),
            3 => "Bad BGP Identifier".into(),
            4 => "Unsupported Optional Parameter".into(),
            6 => "Unacceptable Hold Time".into(),
            7 => "Unsupported Capability".into(),
            v => format!("Unknown({})", v),
        },
        UpdateMessageError => match sub_code {
            1 => "Malformed Attribute List".into(),
            2 => "Unrecognized Well-known Attribute".into(),
            3 => "Missing Well-known Attribute".into(),
            4 => "Attribute Flags Error".into(),
            5 => "Attribute Length Error".into(),
            6 => "Invalid ORIGIN Attribute".into(),
            8 => "Invalid NEXT_HOP Attribute".into(),
            9 => "Optional Attribute Error".into(),
            10 => "Invalid Network Field".into(),
            11 => "Malformed AS_PATH".into(),
            v => format!("Unknown({})", v),
        },
        HoldTimerExpired => "Hold Timer Expired".into(),
        FsmError => match sub_code {
            1 => "Unexpected Message in OpenSent State".into(),
            2 => "Unexpected Message in OpenConfirm State".into(),
            3 => "Unexpected Message in Established State".into(),
            v => format!("Unknown({})", v),
        },
        Cease => match sub_code {
            1 => "Maximum Number of Prefixes Reached".into(),
            2 => "Administrative Shutdown".into(),
            3 => "Peer De-configured".into(),
            4 => "Administrative Reset".into(),
            5 => "Connection Rejected".into(),
            6 => "Other Configuration Change".into(),
            7 => "Connection Collision Resolution".into(),
            8 => "Out of Resources".into(),
            v => format!("Unknown({})", v),
        },
        Unknown(v) => format!("Unknown {}", v),
    }
}

impl NotificationPacket {
    pub fn new(code: NotifyCode, sub_code: u8, data: Vec<u8>) -> Self {
        Self {
            header: BgpHeader::new(BgpType::Notification, BGP_HEADER_LEN),
            code,
            sub_code,
            data,
        }
    }

    pub fn parse_packet(input: &[u8]) -> Result<(&[u8], NotificationPacket), WireError> {
        let (input, header) = BgpHeader::parse_packet(input)?;
        let (input, code) = be_u8::<_, nom::error::Error<&[u8]>>(input)?;
        let (input, sub_code) = be_u8::<_, nom::error::Error<&[u8]>>(input)?;
        let len = header.length - BGP_HEADER_LEN - 2;
        let (input, data) = take::<_, _, nom::error::Error<&[u8]>>(len as usize)(input)?;
        Ok((
            input,
            NotificationPacket {
                header,
                code: code.into(),
                sub_code,
                data: data.to_vec(),
            },
        ))
    }
}

impl From<NotificationPacket> for BytesMut {
    fn from(notification: NotificationPacket) -> Self {
        let mut buf = BytesMut::new();
        let header: BytesMut = notification.header.into();
        buf.put(&header[..]);
        buf.put_u8(notification.code.into());
        buf.put_u8(notification.sub_code);
        buf.put(&notification.data[..]);
        fill_length(&mut buf);
        buf
    }
}

impl Display for NotificationPacket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "Notification")?;
        writeln!(f, " Code: {}", self.code)?;
        writeln!(
            f,
            " Sub Code: {}",
            notify_sub_code_str(self.code, self.sub_code)
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip() {
        let packet = NotificationPacket::new(NotifyCode::Cease, CeaseSubcode::AdministrativeShutdown as u8, vec![1, 2]);
        let buf: BytesMut = packet.clone().into();
        let (rest, parsed) = NotificationPacket::parse_packet(&buf).unwrap();
        assert!(rest.is_empty());
        assert_eq!(parsed.code, NotifyCode::Cease);
        assert_eq!(parsed.sub_code, 2);
        assert_eq!(parsed.data, vec![1, 2]);
    }

    #[test]
    fn pair_validation() {
        assert!(notify_pair_valid(NotifyCode::HoldTimerExpired, 0));
        assert!(notify_pair_valid(NotifyCode::OpenMessageError, 7));
        assert!(!notify_pair_valid(NotifyCode::OpenMessageError, 5));
        assert!(!notify_pair_valid(NotifyCode::UpdateMessageError, 7));
        assert!(!notify_pair_valid(NotifyCode::Unknown(9), 0));
    }
}
