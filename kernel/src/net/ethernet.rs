//! Ethernet frame parsing, construction and dispatch.
//!
//! Incoming frames are parsed with transparent 802.1Q handling: a VLAN
//! tag shifts the payload four bytes and carries the VLAN id in the low
//! 12 bits of the word after the tag. The 4-byte frame trailer is never
//! part of the payload. Outbound frames are never VLAN-tagged.

use alloc::vec::Vec;

use crate::error::{KernelError, KernelResult};

use super::{
    device::{self, DeviceId},
    MacAddress,
};

/// Header: dst(6) + src(6) + ethertype(2).
pub const ETHERNET_HEADER_SIZE: usize = 14;

/// Frame check sequence trailing every received frame.
pub const CRC_SIZE: usize = 4;

/// Extra bytes inserted by an 802.1Q tag.
pub const VLAN_TAG_SIZE: usize = 4;

/// EtherType constants.
pub const ETHERTYPE_IPV4: u16 = 0x0800;
pub const ETHERTYPE_ARP: u16 = 0x0806;
pub const ETHERTYPE_VLAN: u16 = 0x8100;

/// Parsed Ethernet frame with a zero-copy payload.
#[derive(Debug)]
pub struct EthernetFrame<'a> {
    pub dst_mac: MacAddress,
    pub src_mac: MacAddress,
    /// Inner EtherType (the real one when a VLAN tag was present).
    pub ethertype: u16,
    /// VLAN id from the low 12 bits of the tag word, if tagged.
    pub vlan: Option<u16>,
    /// Payload bytes, excluding the 4-byte trailer.
    pub payload: &'a [u8],
}

/// Parse a received frame.
pub fn parse_frame(data: &[u8]) -> KernelResult<EthernetFrame<'_>> {
    if data.len() < ETHERNET_HEADER_SIZE + CRC_SIZE {
        return Err(KernelError::MalformedPacket {
            protocol: "ethernet",
            reason: "too short",
        });
    }

    let mut dst = [0u8; 6];
    let mut src = [0u8; 6];
    dst.copy_from_slice(&data[0..6]);
    src.copy_from_slice(&data[6..12]);
    let outer_type = u16::from_be_bytes([data[12], data[13]]);

    let (ethertype, vlan, payload_start) = if outer_type == ETHERTYPE_VLAN {
        if data.len() < ETHERNET_HEADER_SIZE + VLAN_TAG_SIZE + CRC_SIZE {
            return Err(KernelError::MalformedPacket {
                protocol: "ethernet",
                reason: "truncated vlan tag",
            });
        }
        // PCP/DEI/VID word follows the tag; only the low 12 bits are the
        // VLAN id. The real EtherType sits after it.
        let vid = u16::from_be_bytes([data[14], data[15]]) & 0x0FFF;
        let inner_type = u16::from_be_bytes([data[16], data[17]]);
        (inner_type, Some(vid), ETHERNET_HEADER_SIZE + VLAN_TAG_SIZE)
    } else {
        (outer_type, None, ETHERNET_HEADER_SIZE)
    };

    Ok(EthernetFrame {
        dst_mac: MacAddress(dst),
        src_mac: MacAddress(src),
        ethertype,
        vlan,
        payload: &data[payload_start..data.len() - CRC_SIZE],
    })
}

/// Entry point called by every Ethernet driver on packet arrival.
///
/// Dispatches on the (inner) EtherType to the ARP or IPv4/UDP handler;
/// unknown types are dropped silently.
pub fn receive_eth_packet(data: &[u8], id: DeviceId) -> KernelResult<()> {
    let frame = parse_frame(data)?;

    match frame.ethertype {
        ETHERTYPE_ARP => super::arp::receive_arp_packet(frame.payload, frame.vlan, id),
        ETHERTYPE_IPV4 => {
            // The only protocol carried over IPv4 here is UDP.
            super::udp::receive_udp_packet(frame.payload, frame.src_mac, frame.vlan, id)
        }
        _ => {
            log::debug!("dropping frame with ethertype {:#06x}", frame.ethertype);
            Ok(())
        }
    }
}

/// Assemble a frame (never VLAN-tagged) and transmit it on `id`.
pub fn send_eth_packet(
    dst_mac: MacAddress,
    ethertype: u16,
    payload: &[u8],
    id: DeviceId,
) -> KernelResult<()> {
    let src_mac = device::mac_addr(id).ok_or(KernelError::NotFound {
        resource: "eth device",
        id,
    })?;

    let mut frame = Vec::with_capacity(ETHERNET_HEADER_SIZE + payload.len());
    frame.extend_from_slice(&dst_mac.0);
    frame.extend_from_slice(&src_mac.0);
    frame.extend_from_slice(&ethertype.to_be_bytes());
    frame.extend_from_slice(payload);

    device::transmit(id, &frame)
}
