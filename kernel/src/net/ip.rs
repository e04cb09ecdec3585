//! IPv4 header construction and validation.
//!
//! Only what the UDP path needs: fixed 20-byte headers (no options), no
//! fragmentation on send, fragmented packets rejected on receive.

use crate::error::{KernelError, KernelResult};

use super::Ipv4Address;

/// Size of an IPv4 header without options.
pub const IP_HEADER_SIZE: usize = 20;

/// Protocol number for UDP.
pub const IP_PROTOCOL_UDP: u8 = 17;

/// Maximum total length of an IP packet.
const IP_PACKET_MAX_SIZE: usize = 65535;

/// Hop limit on everything we send.
const IP_TTL: u8 = 64;

/// More-fragments flag bit in the flags field.
const FLAG_MORE_FRAGMENTS: u8 = 0x1;

/// One's-complement sum of the 16-bit big-endian words of `data`.
fn ones_complement_sum(data: &[u8]) -> u16 {
    let mut sum: u32 = 0;
    for chunk in data.chunks(2) {
        let word = if chunk.len() == 2 {
            u16::from_be_bytes([chunk[0], chunk[1]])
        } else {
            u16::from_be_bytes([chunk[0], 0])
        };
        sum += word as u32;
    }
    while sum >> 16 != 0 {
        sum = (sum & 0xFFFF) + (sum >> 16);
    }
    sum as u16
}

/// Build a header for `data_len` payload bytes from `src` to `dst`:
/// version 4, IHL 5, zero DSCP/ECN, fragment id 0, DF/MF clear, TTL 64,
/// protocol UDP, with the one's-complement checksum in place.
pub fn build_ipv4_header(
    data_len: u16,
    src: Ipv4Address,
    dst: Ipv4Address,
) -> KernelResult<[u8; IP_HEADER_SIZE]> {
    if data_len as usize + IP_HEADER_SIZE > IP_PACKET_MAX_SIZE {
        return Err(KernelError::InvalidArgument {
            name: "data_len",
            value: "exceeds max packet size",
        });
    }

    let mut header = [0u8; IP_HEADER_SIZE];
    header[0] = 4 << 4 | 5; // version 4, IHL 5 words
    // header[1]: DSCP/ECN stay zero
    header[2..4].copy_from_slice(&(IP_HEADER_SIZE as u16 + data_len).to_be_bytes());
    // bytes 4..8: fragment id 0, flags 0, fragment offset 0
    header[8] = IP_TTL;
    header[9] = IP_PROTOCOL_UDP;
    // bytes 10..12: checksum, filled below
    header[12..16].copy_from_slice(&src.0);
    header[16..20].copy_from_slice(&dst.0);

    let checksum = !ones_complement_sum(&header);
    header[10..12].copy_from_slice(&checksum.to_be_bytes());

    Ok(header)
}

/// The header fields the UDP receive path cares about.
#[derive(Debug, Clone, Copy)]
pub struct Ipv4HeaderInfo {
    pub src: Ipv4Address,
    pub dst: Ipv4Address,
    pub protocol: u8,
    pub more_fragments: bool,
}

/// Validate and extract a received header.
pub fn parse_ipv4_header(buffer: &[u8]) -> KernelResult<Ipv4HeaderInfo> {
    if buffer.len() < IP_HEADER_SIZE {
        return Err(KernelError::MalformedPacket {
            protocol: "ipv4",
            reason: "too short",
        });
    }

    Ok(Ipv4HeaderInfo {
        src: Ipv4Address([buffer[12], buffer[13], buffer[14], buffer[15]]),
        dst: Ipv4Address([buffer[16], buffer[17], buffer[18], buffer[19]]),
        protocol: buffer[9],
        more_fragments: (buffer[6] >> 5) & FLAG_MORE_FRAGMENTS != 0,
    })
}
