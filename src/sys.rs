//! System native types and constants.

#![allow(non_camel_case_types)]

use libc::sa_family_t;

pub const BTPROTO_HCI: i32 = 1;
pub const BTPROTO_SCO: i32 = 2;

pub const SOL_BLUETOOTH: i32 = 274;
pub const SOL_SCO: i32 = 17;

#[repr(packed)]
#[repr(C)]
#[derive(Clone)]
pub struct bdaddr_t {
    pub b: [u8; 6],
}

/// Voice setting for synchronous connections.
///
/// This corresponds to the `BT_VOICE` socket option.
#[repr(C)]
#[derive(Clone)]
pub struct bt_voice {
    pub setting: u16,
}

pub const BT_VOICE: i32 = 11;
pub const BT_VOICE_TRANSPARENT: u16 = 0x0003;
pub const BT_VOICE_CVSD_16BIT: u16 = 0x0060;

pub const BT_SNDMTU: i32 = 12;
pub const BT_RCVMTU: i32 = 13;

#[repr(C)]
#[derive(Clone)]
pub struct sockaddr_sco {
    pub sco_family: sa_family_t,
    pub sco_bdaddr: bdaddr_t,
}

#[repr(C)]
#[derive(Clone)]
pub struct sco_options {
    pub mtu: u16,
}

pub const SCO_OPTIONS: i32 = 1;

/// Subset of `struct hci_dev_info` from the kernel Bluetooth UAPI.
///
/// Only the fields up to and including the LMP feature mask are interpreted;
/// the remainder keeps the structure ioctl-size compatible.
#[repr(C)]
#[derive(Clone)]
pub struct hci_dev_info {
    pub dev_id: u16,
    pub name: [u8; 8],
    pub bdaddr: bdaddr_t,
    pub flags: u32,
    pub dev_type: u8,
    pub features: [u8; 8],
    pub pkt_type: u32,
    pub link_policy: u32,
    pub link_mode: u32,
    pub acl_mtu: u16,
    pub acl_pkts: u16,
    pub sco_mtu: u16,
    pub sco_pkts: u16,
    pub stat: [u32; 10],
}

// LMP feature bits relevant to wideband speech eligibility.
pub const LMP_TRSP_SCO: u8 = 0x08; // features[2]
pub const LMP_ESCO: u8 = 0x80; // features[3]

pub const HCIGETDEVINFO: libc::c_ulong = 0x800448D3;

nix::ioctl_read_bad!(hci_get_dev_info, HCIGETDEVINFO, hci_dev_info);
