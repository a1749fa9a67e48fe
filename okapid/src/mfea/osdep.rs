//! Kernel ABI for the multicast-routing socket: option codes, control
//! structures and upcall message layouts. Values follow the Linux
//! mroute/mroute6 headers, with the advanced-API pieces (bandwidth
//! upcalls, per-oif flags) from the BSD lineage; kernels without an
//! option simply fail the setsockopt, which is how support is probed.

use std::net::{Ipv4Addr, Ipv6Addr};

pub const MAX_VIFS: usize = 32;
/// Minimum TTL a packet needs to be forwarded out a member interface.
pub const MIN_TTL: u8 = 1;
/// 'default' routing table id in Linux.
pub const DEFAULT_MROUTE_TABLE: u32 = 253;

// IPv4 multicast routing socket options (IPPROTO_IP level).
pub const MRT_BASE: libc::c_int = 200;
pub const MRT_INIT: libc::c_int = MRT_BASE;
pub const MRT_DONE: libc::c_int = MRT_BASE + 1;
pub const MRT_ADD_VIF: libc::c_int = MRT_BASE + 2;
pub const MRT_DEL_VIF: libc::c_int = MRT_BASE + 3;
pub const MRT_ADD_MFC: libc::c_int = MRT_BASE + 4;
pub const MRT_DEL_MFC: libc::c_int = MRT_BASE + 5;
pub const MRT_VERSION: libc::c_int = MRT_BASE + 6;
pub const MRT_ASSERT: libc::c_int = MRT_BASE + 7;
pub const MRT_PIM: libc::c_int = MRT_BASE + 8;
/// New multi-table API.
pub const MRT_TABLE: libc::c_int = MRT_BASE + 9;
// Advanced multicast API (BSD lineage).
pub const MRT_API_SUPPORT: libc::c_int = MRT_BASE + 10;
pub const MRT_API_CONFIG: libc::c_int = MRT_BASE + 11;
pub const MRT_ADD_BW_UPCALL: libc::c_int = MRT_BASE + 12;
pub const MRT_DEL_BW_UPCALL: libc::c_int = MRT_BASE + 13;

// IPv6 multicast routing socket options (IPPROTO_IPV6 level).
pub const MRT6_BASE: libc::c_int = 200;
pub const MRT6_INIT: libc::c_int = MRT6_BASE;
pub const MRT6_DONE: libc::c_int = MRT6_BASE + 1;
pub const MRT6_ADD_MIF: libc::c_int = MRT6_BASE + 2;
pub const MRT6_DEL_MIF: libc::c_int = MRT6_BASE + 3;
pub const MRT6_ADD_MFC: libc::c_int = MRT6_BASE + 4;
pub const MRT6_DEL_MFC: libc::c_int = MRT6_BASE + 5;
pub const MRT6_VERSION: libc::c_int = MRT6_BASE + 6;
pub const MRT6_ASSERT: libc::c_int = MRT6_BASE + 7;
pub const MRT6_PIM: libc::c_int = MRT6_BASE + 8;
pub const MRT6_TABLE: libc::c_int = MRT6_BASE + 9;
pub const MRT6_ADD_BW_UPCALL: libc::c_int = MRT6_BASE + 12;
pub const MRT6_DEL_BW_UPCALL: libc::c_int = MRT6_BASE + 13;

// Advanced-API feature bits negotiated with MRT_API_CONFIG.
pub const MRT_MFC_FLAGS_DISABLE_WRONGVIF: u32 = 1 << 0;
pub const MRT_MFC_FLAGS_BORDER_VIF: u32 = 1 << 1;
pub const MRT_MFC_RP: u32 = 1 << 8;
pub const MRT_MFC_BW_UPCALL: u32 = 1 << 9;

// vifctl flags.
pub const VIFF_TUNNEL: u8 = 0x1;
pub const VIFF_SRCRT: u8 = 0x2;
pub const VIFF_REGISTER: u8 = 0x4;
pub const VIFF_USE_IFINDEX: u8 = 0x8;
// mif6ctl flags.
pub const MIFF_REGISTER: u8 = 0x1;

// Counter ioctls (SIOCPROTOPRIVATE block).
pub const SIOCGETVIFCNT: libc::c_ulong = 0x89E0;
pub const SIOCGETSGCNT: libc::c_ulong = 0x89E1;
pub const SIOCGETMIFCNT_IN6: libc::c_ulong = 0x89E0;
pub const SIOCGETSGCNT_IN6: libc::c_ulong = 0x89E1;

// Kernel upcall message types.
pub const IGMPMSG_NOCACHE: u8 = 1;
pub const IGMPMSG_WRONGVIF: u8 = 2;
pub const IGMPMSG_WHOLEPKT: u8 = 3;
pub const IGMPMSG_BW_UPCALL: u8 = 4;
pub const MRT6MSG_NOCACHE: u8 = 1;
pub const MRT6MSG_WRONGMIF: u8 = 2;
pub const MRT6MSG_WHOLEPKT: u8 = 3;
pub const MRT6MSG_BW_UPCALL: u8 = 4;

/// The unified signal type forwarded to protocol modules. The numeric
/// values are part of the inter-module contract and must stay byte-equal
/// with both families' kernel constants.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KernelSignalType {
    NoCache = 1,
    WrongVif = 2,
    WholePkt = 3,
    BwUpcall = 4,
}

impl TryFrom<u8> for KernelSignalType {
    type Error = u8;

    fn try_from(val: u8) -> Result<Self, u8> {
        match val {
            1 => Ok(Self::NoCache),
            2 => Ok(Self::WrongVif),
            3 => Ok(Self::WholePkt),
            4 => Ok(Self::BwUpcall),
            v => Err(v),
        }
    }
}

// The four message-type constants are byte-equal across the v4 and v6
// kernel headers; the demultiplexer depends on it.
const _: () = {
    assert!(IGMPMSG_NOCACHE == MRT6MSG_NOCACHE);
    assert!(IGMPMSG_WRONGVIF == MRT6MSG_WRONGMIF);
    assert!(IGMPMSG_WHOLEPKT == MRT6MSG_WHOLEPKT);
    assert!(IGMPMSG_BW_UPCALL == MRT6MSG_BW_UPCALL);
    assert!(IGMPMSG_NOCACHE == KernelSignalType::NoCache as u8);
    assert!(IGMPMSG_WRONGVIF == KernelSignalType::WrongVif as u8);
    assert!(IGMPMSG_WHOLEPKT == KernelSignalType::WholePkt as u8);
    assert!(IGMPMSG_BW_UPCALL == KernelSignalType::BwUpcall as u8);
};

/// Linux `struct vifctl`; the lcl field is an address or, with
/// VIFF_USE_IFINDEX, an interface index.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct Vifctl {
    pub vifc_vifi: u16,
    pub vifc_flags: u8,
    pub vifc_threshold: u8,
    pub vifc_rate_limit: u32,
    pub vifc_lcl: u32,
    pub vifc_rmt_addr: u32,
}

/// Linux `struct mif6ctl`.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct Mif6ctl {
    pub mif6c_mifi: u16,
    pub mif6c_flags: u8,
    pub vifc_threshold: u8,
    pub mif6c_pifi: u16,
    pub vifc_rate_limit: u32,
}

/// Linux `struct mfcctl` (basic API).
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct Mfcctl {
    pub mfcc_origin: u32,
    pub mfcc_mcastgrp: u32,
    pub mfcc_parent: u16,
    pub mfcc_ttls: [u8; MAX_VIFS],
    pub mfcc_pkt_cnt: libc::c_uint,
    pub mfcc_byte_cnt: libc::c_uint,
    pub mfcc_wrong_if: libc::c_uint,
    pub mfcc_expire: libc::c_int,
}

impl Default for Mfcctl {
    fn default() -> Self {
        Self {
            mfcc_origin: 0,
            mfcc_mcastgrp: 0,
            mfcc_parent: 0,
            mfcc_ttls: [0; MAX_VIFS],
            mfcc_pkt_cnt: 0,
            mfcc_byte_cnt: 0,
            mfcc_wrong_if: 0,
            mfcc_expire: 0,
        }
    }
}

/// `struct mfcctl2` of the advanced API: per-oif flags and the RP.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct Mfcctl2 {
    pub mfcc_origin: u32,
    pub mfcc_mcastgrp: u32,
    pub mfcc_parent: u16,
    pub mfcc_ttls: [u8; MAX_VIFS],
    pub mfcc_flags: [u8; MAX_VIFS],
    pub mfcc_rp: u32,
}

impl Default for Mfcctl2 {
    fn default() -> Self {
        Self {
            mfcc_origin: 0,
            mfcc_mcastgrp: 0,
            mfcc_parent: 0,
            mfcc_ttls: [0; MAX_VIFS],
            mfcc_flags: [0; MAX_VIFS],
            mfcc_rp: 0,
        }
    }
}

/// Linux `struct mf6cctl`.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct Mf6cctl {
    pub mf6cc_origin: libc::sockaddr_in6,
    pub mf6cc_mcastgrp: libc::sockaddr_in6,
    pub mf6cc_parent: u16,
    pub mf6cc_ifset: [u32; 8],
}

/// Compat payload for the hacked multi-table API: the plain option value
/// plus the table it applies to.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct MrtSockoptSimple {
    pub optval: u32,
    pub table_id: u32,
}

/// Linux `struct igmpmsg`: the upcall header on the IPv4 socket.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct Igmpmsg {
    pub unused1: u32,
    pub unused2: u32,
    pub im_msgtype: u8,
    pub im_mbz: u8,
    pub im_vif: u8,
    pub im_vif_hi: u8,
    pub im_src: u32,
    pub im_dst: u32,
}

pub const IGMPMSG_SIZE: usize = std::mem::size_of::<Igmpmsg>();

impl Igmpmsg {
    pub fn parse(buf: &[u8]) -> Option<Self> {
        if buf.len() < IGMPMSG_SIZE {
            return None;
        }
        // The kernel hands us a host-native struct; addresses stay in
        // network order inside in_addr.
        let mut msg = Igmpmsg::default();
        unsafe {
            std::ptr::copy_nonoverlapping(
                buf.as_ptr(),
                &mut msg as *mut Igmpmsg as *mut u8,
                IGMPMSG_SIZE,
            );
        }
        Some(msg)
    }

    pub fn vif_index(&self) -> u32 {
        self.im_vif as u32 | ((self.im_vif_hi as u32) << 8)
    }

    pub fn src_addr(&self) -> Ipv4Addr {
        Ipv4Addr::from(u32::from_be(self.im_src))
    }

    pub fn dst_addr(&self) -> Ipv4Addr {
        Ipv4Addr::from(u32::from_be(self.im_dst))
    }
}

/// Linux `struct mrt6msg`.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct Mrt6msg {
    pub im6_mbz: u8,
    pub im6_msgtype: u8,
    pub im6_mif: u16,
    pub im6_pad: u32,
    pub im6_src: [u8; 16],
    pub im6_dst: [u8; 16],
}

pub const MRT6MSG_SIZE: usize = std::mem::size_of::<Mrt6msg>();

impl Mrt6msg {
    pub fn parse(buf: &[u8]) -> Option<Self> {
        if buf.len() < MRT6MSG_SIZE {
            return None;
        }
        let mut msg = Mrt6msg {
            im6_mbz: 0,
            im6_msgtype: 0,
            im6_mif: 0,
            im6_pad: 0,
            im6_src: [0; 16],
            im6_dst: [0; 16],
        };
        unsafe {
            std::ptr::copy_nonoverlapping(
                buf.as_ptr(),
                &mut msg as *mut Mrt6msg as *mut u8,
                MRT6MSG_SIZE,
            );
        }
        Some(msg)
    }

    pub fn src_addr(&self) -> Ipv6Addr {
        Ipv6Addr::from(self.im6_src)
    }

    pub fn dst_addr(&self) -> Ipv6Addr {
        Ipv6Addr::from(self.im6_dst)
    }
}

// Bandwidth-upcall flags.
pub const BW_UPCALL_UNIT_PACKETS: u32 = 1 << 0;
pub const BW_UPCALL_UNIT_BYTES: u32 = 1 << 1;
pub const BW_UPCALL_GEQ: u32 = 1 << 2;
pub const BW_UPCALL_LEQ: u32 = 1 << 3;
pub const BW_UPCALL_DELETE_ALL: u32 = 1 << 4;

#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct BwData {
    pub b_time_sec: i64,
    pub b_time_usec: i64,
    pub b_packets: u64,
    pub b_bytes: u64,
}

/// `struct bw_upcall` used both to install kernel filters and in the
/// upcall payload when the kernel supports bandwidth monitoring.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct BwUpcall {
    pub bu_src: u32,
    pub bu_dst: u32,
    pub bu_flags: u32,
    pub bu_threshold: BwData,
    pub bu_measured: BwData,
}

/// `struct sioc_sg_req` for SIOCGETSGCNT.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct SiocSgReq {
    pub src: u32,
    pub grp: u32,
    pub pktcnt: libc::c_ulong,
    pub bytecnt: libc::c_ulong,
    pub wrong_if: libc::c_ulong,
}

/// `struct sioc_vif_req` for SIOCGETVIFCNT.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct SiocVifReq {
    pub vifi: u16,
    pub icount: libc::c_ulong,
    pub ocount: libc::c_ulong,
    pub ibytes: libc::c_ulong,
    pub obytes: libc::c_ulong,
}

/// Decoded minimal IPv4 header, for digging the inner source and group
/// out of a WHOLEPKT payload.
pub fn parse_inner_ipv4(buf: &[u8]) -> Option<(Ipv4Addr, Ipv4Addr)> {
    if buf.len() < 20 || (buf[0] >> 4) != 4 {
        return None;
    }
    let src = Ipv4Addr::new(buf[12], buf[13], buf[14], buf[15]);
    let dst = Ipv4Addr::new(buf[16], buf[17], buf[18], buf[19]);
    Some((src, dst))
}

pub fn parse_inner_ipv6(buf: &[u8]) -> Option<(Ipv6Addr, Ipv6Addr)> {
    if buf.len() < 40 || (buf[0] >> 4) != 6 {
        return None;
    }
    let mut src = [0u8; 16];
    let mut dst = [0u8; 16];
    src.copy_from_slice(&buf[8..24]);
    dst.copy_from_slice(&buf[24..40]);
    Some((Ipv6Addr::from(src), Ipv6Addr::from(dst)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn igmpmsg_layout_and_parse() {
        assert_eq!(IGMPMSG_SIZE, 20);
        let mut buf = [0u8; 20];
        buf[8] = IGMPMSG_NOCACHE;
        buf[10] = 2; // im_vif
        buf[12..16].copy_from_slice(&[192, 0, 2, 1]);
        buf[16..20].copy_from_slice(&[239, 1, 1, 1]);
        let msg = Igmpmsg::parse(&buf).unwrap();
        assert_eq!(msg.im_msgtype, IGMPMSG_NOCACHE);
        assert_eq!(msg.vif_index(), 2);
        assert_eq!(msg.src_addr(), Ipv4Addr::new(192, 0, 2, 1));
        assert_eq!(msg.dst_addr(), Ipv4Addr::new(239, 1, 1, 1));
    }

    #[test]
    fn inner_ipv4_header() {
        let mut buf = [0u8; 24];
        buf[0] = 0x45;
        buf[12..16].copy_from_slice(&[10, 0, 0, 1]);
        buf[16..20].copy_from_slice(&[239, 0, 0, 5]);
        let (src, dst) = parse_inner_ipv4(&buf).unwrap();
        assert_eq!(src, Ipv4Addr::new(10, 0, 0, 1));
        assert_eq!(dst, Ipv4Addr::new(239, 0, 0, 5));
        assert!(parse_inner_ipv4(&buf[..10]).is_none());
    }
}
