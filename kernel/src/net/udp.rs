//! UDP send and receive paths.
//!
//! Sending resolves the next-hop MAC (ARP for on-link destinations, the
//! cached router MAC otherwise) and spins while a lookup is outstanding;
//! eviction of the Waiting entry bounds the wait. Receiving hands the
//! DHCP client its port and otherwise copies the datagram to every
//! process blocked in `udp_read`, waking them.

use alloc::vec::Vec;

use crate::{
    error::{KernelError, KernelResult},
    process::{
        self,
        pcb::{ReceivedUdpPacket, UDP_RX_BUF_SIZE},
        BlockingCall, ProcessState,
    },
};

use super::{
    arp::{self, ArpLookup},
    device::{self, DeviceId},
    ethernet, ip, Ipv4Address, MacAddress,
};

/// Size of a UDP header.
pub const UDP_HEADER_SIZE: usize = 8;

/// The DHCP client listens here; port 68 traffic never reaches user
/// processes.
pub const DHCP_CLIENT_PORT: u16 = 68;

/// Resolve the next-hop MAC for `dst_ip` on `device_id`.
///
/// On-link destinations go through the ARP cache, with a request issued
/// on a cold lookup and a spin while the reply is outstanding; the
/// eviction sweep turns an unanswered Waiting entry back to Empty, which
/// fails the send. Off-link destinations use the router's cached MAC.
fn resolve_dest_mac(dst_ip: Ipv4Address, device_id: DeviceId) -> KernelResult<MacAddress> {
    let (our_ip, mask, router_mac) = device::with_device(device_id, |d| {
        (d.ip, d.subnet_mask, d.router_mac)
    })
    .ok_or(KernelError::NotFound {
        resource: "eth device",
        id: device_id,
    })?;

    if !our_ip.same_subnet(dst_ip, mask) {
        return Ok(router_mac);
    }

    if let ArpLookup::Empty = arp::get_arp_entry(dst_ip, device_id) {
        let _ = arp::send_arp_request(dst_ip, device_id);
    }

    // Spin until the reply lands or the eviction timeout clears the
    // Waiting entry.
    while arp::get_arp_entry(dst_ip, device_id) == ArpLookup::Waiting {
        core::hint::spin_loop();
    }

    match arp::get_arp_entry(dst_ip, device_id) {
        ArpLookup::Present(mac) => Ok(mac),
        _ => {
            log::warn!("no arp response for {}, dropping udp send", dst_ip);
            Err(KernelError::NotFound {
                resource: "arp entry",
                id: device_id,
            })
        }
    }
}

/// Send one datagram.
pub fn send_udp_packet(
    data: &[u8],
    src_port: u16,
    dst_ip: Ipv4Address,
    dst_port: u16,
    device_id: DeviceId,
) -> KernelResult<()> {
    let src_ip = device::ip_addr(device_id).ok_or(KernelError::NotFound {
        resource: "eth device",
        id: device_id,
    })?;

    let udp_len = (UDP_HEADER_SIZE + data.len()) as u16;
    let ip_header = ip::build_ipv4_header(udp_len, src_ip, dst_ip)?;

    let mut packet = Vec::with_capacity(ip::IP_HEADER_SIZE + UDP_HEADER_SIZE + data.len());
    packet.extend_from_slice(&ip_header);
    packet.extend_from_slice(&src_port.to_be_bytes());
    packet.extend_from_slice(&dst_port.to_be_bytes());
    packet.extend_from_slice(&udp_len.to_be_bytes());
    // UDP checksum is not computed.
    packet.extend_from_slice(&0u16.to_be_bytes());
    packet.extend_from_slice(data);

    let dst_mac = resolve_dest_mac(dst_ip, device_id)?;
    ethernet::send_eth_packet(dst_mac, ethernet::ETHERTYPE_IPV4, &packet, device_id)
}

/// Process a received IPv4 payload assumed to carry UDP.
pub fn receive_udp_packet(
    buffer: &[u8],
    _src_mac: MacAddress,
    _vlan: Option<u16>,
    device_id: DeviceId,
) -> KernelResult<()> {
    if buffer.len() < ip::IP_HEADER_SIZE + UDP_HEADER_SIZE {
        return Err(KernelError::MalformedPacket {
            protocol: "udp",
            reason: "too short",
        });
    }

    let header = ip::parse_ipv4_header(buffer)?;
    if header.protocol != ip::IP_PROTOCOL_UDP {
        return Err(KernelError::MalformedPacket {
            protocol: "udp",
            reason: "not udp",
        });
    }
    // Fragmented packets are unsupported.
    if header.more_fragments {
        return Err(KernelError::MalformedPacket {
            protocol: "udp",
            reason: "fragmented",
        });
    }

    let udp = &buffer[ip::IP_HEADER_SIZE..];
    let dst_port = u16::from_be_bytes([udp[2], udp[3]]);
    let udp_len = u16::from_be_bytes([udp[4], udp[5]]) as usize;
    let data_len = udp_len.saturating_sub(UDP_HEADER_SIZE);

    // Frames may be padded, so only reject data that exceeds the payload.
    if data_len + UDP_HEADER_SIZE + ip::IP_HEADER_SIZE > buffer.len() {
        return Err(KernelError::MalformedPacket {
            protocol: "udp",
            reason: "length exceeds frame",
        });
    }

    let data = &udp[UDP_HEADER_SIZE..UDP_HEADER_SIZE + data_len];

    if dst_port == DHCP_CLIENT_PORT {
        return super::dhcp::receive_dhcp_packet(data, device_id);
    }

    deliver_to_readers(data, header.src, dst_port);
    Ok(())
}

/// Copy the datagram into every process blocked in `udp_read` and wake
/// them. With no blocked reader the datagram is dropped.
fn deliver_to_readers(data: &[u8], src: Ipv4Address, dst_port: u16) {
    let mut delivered = false;

    process::with_table(|t| {
        for i in 0..t.len() {
            let pid = i as process::Pid;
            let Some(pcb) = t.pcb_mut(pid) else { continue };
            if !pcb.in_use() || pcb.state != ProcessState::Sleeping {
                continue;
            }

            if let BlockingCall::UdpRead(Some(packet)) = &mut pcb.blocking_call {
                let n = data.len().min(UDP_RX_BUF_SIZE);
                packet.data[..n].copy_from_slice(&data[..n]);
                packet.length = n;
                pcb.state = ProcessState::Running;
                delivered = true;
            }
        }
    });

    if !delivered {
        log::debug!(
            "udp datagram from {} to port {} with no reader, dropped",
            src,
            dst_port
        );
    }
}

/// Blocking read on a UDP socket fd: park a kernel buffer in the PCB,
/// sleep until the receive path fills it, then copy out at most
/// `buf.len()` bytes.
pub fn udp_read(buf: &mut [u8]) -> i32 {
    let pid = process::current_pid();

    let ok = process::with_table(|t| match t.pcb_mut(pid) {
        Some(pcb) => {
            pcb.blocking_call = BlockingCall::UdpRead(Some(ReceivedUdpPacket::empty()));
            true
        }
        None => false,
    });
    if !ok {
        return -1;
    }

    process::process_sleep(pid);

    process::with_table(|t| {
        let Some(pcb) = t.pcb_mut(pid) else { return -1 };
        let taken = core::mem::replace(&mut pcb.blocking_call, BlockingCall::None);
        match taken {
            BlockingCall::UdpRead(Some(packet)) => {
                let n = packet.length.min(buf.len());
                buf[..n].copy_from_slice(&packet.data[..n]);
                n as i32
            }
            _ => -1,
        }
    })
}

/// The interface UDP socket fds send on.
pub const DEFAULT_ETH_DEVICE: DeviceId = 1;

/// Write on a UDP socket fd. The first 8 bytes of `buf` select the
/// destination: `{dst_ip[4], src_port[2], dst_port[2]}`; the rest is the
/// payload.
pub fn udp_write(buf: &[u8]) -> i32 {
    udp_write_on(buf, DEFAULT_ETH_DEVICE)
}

fn udp_write_on(buf: &[u8], device_id: DeviceId) -> i32 {
    if buf.len() < 8 {
        return -1;
    }

    let dst_ip = Ipv4Address([buf[0], buf[1], buf[2], buf[3]]);
    let src_port = u16::from_le_bytes([buf[4], buf[5]]);
    let dst_port = u16::from_le_bytes([buf[6], buf[7]]);

    match send_udp_packet(&buf[8..], src_port, dst_ip, dst_port, device_id) {
        Ok(()) => (buf.len() - 8) as i32,
        Err(_) => -1,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::device::testing::FrameRecorder;
    use crate::process::with_table;

    // Datagram delivery wakes any parked reader; serialize the tests
    // that inject datagrams so they cannot steal each other's wakeups.
    fn delivery_lock() -> std::sync::MutexGuard<'static, ()> {
        static LOCK: std::sync::Mutex<()> = std::sync::Mutex::new(());
        LOCK.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Craft an IPv4+UDP packet as it appears after Ethernet parsing.
    fn udp_packet(src: Ipv4Address, dst: Ipv4Address, dst_port: u16, data: &[u8]) -> Vec<u8> {
        let udp_len = (UDP_HEADER_SIZE + data.len()) as u16;
        let mut packet = Vec::new();
        packet.extend_from_slice(&ip::build_ipv4_header(udp_len, src, dst).unwrap());
        packet.extend_from_slice(&4242u16.to_be_bytes());
        packet.extend_from_slice(&dst_port.to_be_bytes());
        packet.extend_from_slice(&udp_len.to_be_bytes());
        packet.extend_from_slice(&0u16.to_be_bytes());
        packet.extend_from_slice(data);
        packet
    }

    #[test]
    fn test_send_on_link_uses_arp_entry() {
        let _arp_guard = arp::test_table_lock();
        let (recorder, id) = FrameRecorder::install(MacAddress::new([2, 1, 0, 0, 0, 1]));
        device::with_device_mut(id, |d| {
            d.ip = Ipv4Address::new(10, 9, 0, 1);
            d.subnet_mask = Ipv4Address::new(255, 255, 255, 0);
        });

        // Teach the cache the peer's MAC through a crafted reply.
        let peer_ip = Ipv4Address::new(10, 9, 0, 2);
        let peer_mac = MacAddress::new([0xAA, 9, 9, 9, 9, 2]);
        let mut reply = Vec::new();
        reply.extend_from_slice(&1u16.to_be_bytes());
        reply.extend_from_slice(&0x0800u16.to_be_bytes());
        reply.push(6);
        reply.push(4);
        reply.extend_from_slice(&2u16.to_be_bytes());
        reply.extend_from_slice(&peer_mac.0);
        reply.extend_from_slice(&peer_ip.0);
        reply.extend_from_slice(&[0u8; 10]);
        arp::receive_arp_packet(&reply, None, id).unwrap();

        send_udp_packet(b"hi", 4242, peer_ip, 7, id).unwrap();

        let frame = recorder.last_frame().unwrap();
        // Destination MAC came from the ARP cache.
        assert_eq!(&frame[..6], &peer_mac.0);
        assert_eq!(
            u16::from_be_bytes([frame[12], frame[13]]),
            ethernet::ETHERTYPE_IPV4
        );

        let ip_bytes = &frame[14..34];
        assert_eq!(ip_bytes[9], ip::IP_PROTOCOL_UDP);
        assert_eq!(&ip_bytes[16..20], &peer_ip.0);

        let udp_bytes = &frame[34..];
        assert_eq!(u16::from_be_bytes([udp_bytes[0], udp_bytes[1]]), 4242);
        assert_eq!(u16::from_be_bytes([udp_bytes[2], udp_bytes[3]]), 7);
        // Length covers header + data; checksum is zero.
        assert_eq!(u16::from_be_bytes([udp_bytes[4], udp_bytes[5]]), 10);
        assert_eq!(u16::from_be_bytes([udp_bytes[6], udp_bytes[7]]), 0);
        assert_eq!(&udp_bytes[8..10], b"hi");
    }

    #[test]
    fn test_send_off_link_uses_router_mac() {
        let (recorder, id) = FrameRecorder::install(MacAddress::new([2, 1, 0, 0, 0, 2]));
        let router_mac = MacAddress::new([0xAA, 0, 0, 0, 0, 0xFE]);
        device::with_device_mut(id, |d| {
            d.ip = Ipv4Address::new(10, 10, 0, 1);
            d.subnet_mask = Ipv4Address::new(255, 255, 255, 0);
            d.router_mac = router_mac;
        });

        send_udp_packet(b"out", 5000, Ipv4Address::new(8, 8, 8, 8), 53, id).unwrap();

        let frame = recorder.last_frame().unwrap();
        assert_eq!(&frame[..6], &router_mac.0);
    }

    #[test]
    fn test_send_fails_without_arp_answer() {
        let _arp_guard = arp::test_table_lock();
        let (_, id) = FrameRecorder::install(MacAddress::new([2, 1, 0, 0, 0, 3]));
        device::with_device_mut(id, |d| {
            d.ip = Ipv4Address::new(10, 11, 0, 1);
            d.subnet_mask = Ipv4Address::new(255, 255, 255, 0);
        });

        let dead_peer = Ipv4Address::new(10, 11, 0, 200);
        // Simulate the eviction timeout having already cleared the entry:
        // a cold cache with the request going unanswered. The Waiting
        // entry is flushed before the spin loop sees it.
        let _ = arp::send_arp_request(dead_peer, id);
        arp::flush_arp_entries(crate::timer::system_time() + 100.0);

        assert!(send_udp_packet(b"x", 1, dead_peer, 2, id).is_err());
    }

    #[test]
    fn test_receive_validation() {
        let _guard = delivery_lock();
        let (_, id) = FrameRecorder::install(MacAddress::new([2, 1, 0, 0, 0, 4]));
        let src = Ipv4Address::new(10, 0, 0, 2);
        let dst = Ipv4Address::new(10, 0, 0, 1);

        // Too short.
        assert!(receive_udp_packet(&[0u8; 20], MacAddress::ZERO, None, id).is_err());

        // Wrong protocol.
        let mut packet = udp_packet(src, dst, 9000, b"data");
        packet[9] = 6;
        assert!(receive_udp_packet(&packet, MacAddress::ZERO, None, id).is_err());

        // Fragmented.
        let mut packet = udp_packet(src, dst, 9000, b"data");
        packet[6] |= 0x20;
        assert!(receive_udp_packet(&packet, MacAddress::ZERO, None, id).is_err());

        // UDP length pointing past the frame.
        let mut packet = udp_packet(src, dst, 9000, b"data");
        let bad_len = (UDP_HEADER_SIZE + 4000) as u16;
        packet[24..26].copy_from_slice(&bad_len.to_be_bytes());
        assert!(receive_udp_packet(&packet, MacAddress::ZERO, None, id).is_err());

        // A well-formed datagram with no reader is dropped silently.
        let packet = udp_packet(src, dst, 9000, b"data");
        assert!(receive_udp_packet(&packet, MacAddress::ZERO, None, id).is_ok());
    }

    #[test]
    fn test_blocked_reader_receives_datagram() {
        use crate::process::table::with_current_pid;

        let _guard = delivery_lock();
        let (_, id) = FrameRecorder::install(MacAddress::new([2, 1, 0, 0, 0, 5]));
        let pid = with_table(|t| t.get_open_pid());

        let reader = std::thread::spawn(move || {
            with_current_pid(pid, || {
                let mut buf = [0u8; 1024];
                let n = udp_read(&mut buf);
                (n, buf)
            })
        });

        // Wait until the reader has parked its buffer and gone to sleep.
        loop {
            let parked = with_table(|t| {
                t.pcb(pid)
                    .map(|p| {
                        p.state == ProcessState::Sleeping
                            && matches!(p.blocking_call, BlockingCall::UdpRead(Some(_)))
                    })
                    .unwrap_or(false)
            });
            if parked {
                break;
            }
            std::thread::yield_now();
        }

        let packet = udp_packet(
            Ipv4Address::new(10, 0, 0, 2),
            Ipv4Address::new(10, 0, 0, 1),
            7,
            b"hi",
        );
        receive_udp_packet(&packet, MacAddress::ZERO, None, id).unwrap();

        let (n, buf) = reader.join().unwrap();
        assert_eq!(n, 2);
        assert_eq!(&buf[..2], b"hi");

        with_table(|t| t.release_slot(pid));
    }

    #[test]
    fn test_udp_write_header_prefix() {
        let (recorder, id) = FrameRecorder::install(MacAddress::new([2, 1, 0, 0, 0, 6]));
        device::with_device_mut(id, |d| {
            d.ip = Ipv4Address::new(10, 12, 0, 1);
            d.subnet_mask = Ipv4Address::new(255, 255, 255, 0);
            d.router_mac = MacAddress::new([0xAA, 0, 0, 0, 0, 1]);
        });

        // {dst_ip, src_port, dst_port} then payload.
        let mut buf = Vec::new();
        buf.extend_from_slice(&[10, 0, 0, 2]);
        buf.extend_from_slice(&4242u16.to_le_bytes());
        buf.extend_from_slice(&7u16.to_le_bytes());
        buf.extend_from_slice(b"hi");

        // 10.0.0.2 is off-link for this device, so the router MAC is
        // used and no ARP wait happens.
        assert_eq!(udp_write_on(&buf, id), 2);

        let frame = recorder.last_frame().unwrap();
        let udp_bytes = &frame[34..];
        assert_eq!(u16::from_be_bytes([udp_bytes[0], udp_bytes[1]]), 4242);
        assert_eq!(u16::from_be_bytes([udp_bytes[2], udp_bytes[3]]), 7);
        assert_eq!(&udp_bytes[8..10], b"hi");

        // An undersized buffer cannot carry the addressing prefix.
        assert_eq!(udp_write_on(&[0u8; 7], id), -1);
    }
}
