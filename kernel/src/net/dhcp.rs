//! DHCP client state machine.
//!
//! Per-device `Uninit -> Selecting -> Requesting -> Bound` with
//! regressions to `Uninit` on failure, driven entirely by packets
//! arriving on UDP port 68. Offers are accepted immediately; an Ack must
//! carry both the subnet mask and the router or the negotiation starts
//! over.

use alloc::vec::Vec;

use crate::error::{KernelError, KernelResult};

use super::{
    device::{self, DeviceId, DhcpState},
    udp, Ipv4Address, MacAddress,
};

/// BOOTP fixed part: everything before the options, cookie included.
const DHCP_FIXED_SIZE: usize = 240;

/// Operation codes.
const OP_BOOTREQUEST: u8 = 1;
const OP_BOOTREPLY: u8 = 2;

/// Hardware type/length for Ethernet.
const HTYPE_ETHERNET: u8 = 1;
const HLEN_ETHERNET: u8 = 6;

/// Fixed transaction id; a proper random xid needs an entropy source.
const TRANSACTION_ID: u32 = 0xDEAD_BEEF;

/// Distinguishes DHCP from plain BOOTP.
const MAGIC_COOKIE: u32 = 0x6382_5363;

/// UDP ports.
pub const CLIENT_PORT: u16 = 68;
pub const SERVER_PORT: u16 = 67;

/// Option tags.
const OPT_SUBNET_MASK: u8 = 1;
const OPT_ROUTER: u8 = 3;
const OPT_MESSAGE_TYPE: u8 = 53;
const OPT_SERVER_ID: u8 = 54;
const OPT_PARAMETER_LIST: u8 = 55;
const OPT_END: u8 = 255;
const OPT_PAD: u8 = 0;

/// DHCP message types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
enum MessageType {
    Discover = 1,
    Offer = 2,
    Request = 3,
    Ack = 5,
    Nak = 6,
}

impl MessageType {
    fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(Self::Discover),
            2 => Some(Self::Offer),
            3 => Some(Self::Request),
            5 => Some(Self::Ack),
            6 => Some(Self::Nak),
            _ => None,
        }
    }
}

/// A DHCP packet: the BOOTP fixed part plus its option block.
#[derive(Debug, Clone)]
struct DhcpPacket {
    op: u8,
    htype: u8,
    hlen: u8,
    hops: u8,
    xid: u32,
    secs: u16,
    flags: u16,
    ciaddr: Ipv4Address,
    yiaddr: Ipv4Address,
    siaddr: Ipv4Address,
    giaddr: Ipv4Address,
    chaddr: [u8; 16],
    cookie: u32,
    options: Vec<u8>,
}

impl DhcpPacket {
    /// A client-to-server packet with our MAC in the hardware field and
    /// all addresses zeroed.
    fn request_template(mac: MacAddress) -> Self {
        let mut chaddr = [0u8; 16];
        chaddr[..6].copy_from_slice(&mac.0);

        Self {
            op: OP_BOOTREQUEST,
            htype: HTYPE_ETHERNET,
            hlen: HLEN_ETHERNET,
            hops: 0,
            xid: TRANSACTION_ID,
            secs: 0,
            flags: 0,
            ciaddr: Ipv4Address::ANY,
            yiaddr: Ipv4Address::ANY,
            siaddr: Ipv4Address::ANY,
            giaddr: Ipv4Address::ANY,
            chaddr,
            cookie: MAGIC_COOKIE,
            options: Vec::new(),
        }
    }

    fn add_message_type(&mut self, mt: MessageType) {
        self.options.extend_from_slice(&[OPT_MESSAGE_TYPE, 1, mt as u8]);
    }

    fn add_parameter_request_list(&mut self) {
        self.options
            .extend_from_slice(&[OPT_PARAMETER_LIST, 2, OPT_SUBNET_MASK, OPT_ROUTER]);
    }

    fn add_server_id(&mut self, server: Ipv4Address) {
        self.options.extend_from_slice(&[OPT_SERVER_ID, 4]);
        self.options.extend_from_slice(&server.0);
    }

    fn finish_options(&mut self) {
        self.options.push(OPT_END);
    }

    fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(DHCP_FIXED_SIZE + self.options.len());
        bytes.push(self.op);
        bytes.push(self.htype);
        bytes.push(self.hlen);
        bytes.push(self.hops);
        bytes.extend_from_slice(&self.xid.to_be_bytes());
        bytes.extend_from_slice(&self.secs.to_be_bytes());
        bytes.extend_from_slice(&self.flags.to_be_bytes());
        bytes.extend_from_slice(&self.ciaddr.0);
        bytes.extend_from_slice(&self.yiaddr.0);
        bytes.extend_from_slice(&self.siaddr.0);
        bytes.extend_from_slice(&self.giaddr.0);
        bytes.extend_from_slice(&self.chaddr);
        // Server name and boot file are unused.
        bytes.extend_from_slice(&[0u8; 192]);
        bytes.extend_from_slice(&self.cookie.to_be_bytes());
        bytes.extend_from_slice(&self.options);
        bytes
    }

    fn from_bytes(bytes: &[u8]) -> KernelResult<Self> {
        if bytes.len() < DHCP_FIXED_SIZE {
            return Err(KernelError::MalformedPacket {
                protocol: "dhcp",
                reason: "too short",
            });
        }

        let mut chaddr = [0u8; 16];
        chaddr.copy_from_slice(&bytes[28..44]);

        Ok(Self {
            op: bytes[0],
            htype: bytes[1],
            hlen: bytes[2],
            hops: bytes[3],
            xid: u32::from_be_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]),
            secs: u16::from_be_bytes([bytes[8], bytes[9]]),
            flags: u16::from_be_bytes([bytes[10], bytes[11]]),
            ciaddr: Ipv4Address([bytes[12], bytes[13], bytes[14], bytes[15]]),
            yiaddr: Ipv4Address([bytes[16], bytes[17], bytes[18], bytes[19]]),
            siaddr: Ipv4Address([bytes[20], bytes[21], bytes[22], bytes[23]]),
            giaddr: Ipv4Address([bytes[24], bytes[25], bytes[26], bytes[27]]),
            chaddr,
            cookie: u32::from_be_bytes([bytes[236], bytes[237], bytes[238], bytes[239]]),
            options: bytes[DHCP_FIXED_SIZE..].to_vec(),
        })
    }
}

/// Options extracted from a server response.
#[derive(Debug, Default)]
struct ParsedOptions {
    message_type: Option<MessageType>,
    subnet_mask: Option<Ipv4Address>,
    router: Option<Ipv4Address>,
}

/// Walk the option block defensively: every `(tag, len, data)` must fit
/// inside the packet; the end marker or running off the end stops the
/// walk.
fn parse_options(options: &[u8]) -> ParsedOptions {
    let mut parsed = ParsedOptions::default();
    let mut i = 0;

    while i < options.len() {
        let tag = options[i];
        if tag == OPT_END {
            break;
        }
        if tag == OPT_PAD {
            i += 1;
            continue;
        }
        if i + 1 >= options.len() {
            break;
        }
        let len = options[i + 1] as usize;
        if i + 2 + len > options.len() {
            break;
        }
        let data = &options[i + 2..i + 2 + len];

        match tag {
            OPT_MESSAGE_TYPE if len == 1 => {
                parsed.message_type = MessageType::from_u8(data[0]);
            }
            OPT_SUBNET_MASK if len == 4 => {
                parsed.subnet_mask = Some(Ipv4Address([data[0], data[1], data[2], data[3]]));
            }
            OPT_ROUTER if len >= 4 => {
                parsed.router = Some(Ipv4Address([data[0], data[1], data[2], data[3]]));
            }
            _ => {}
        }

        i += 2 + len;
    }

    parsed
}

/// Broadcast a packet from the client port to the server port.
fn broadcast(packet: &DhcpPacket, device_id: DeviceId) -> KernelResult<()> {
    udp::send_udp_packet(
        &packet.to_bytes(),
        CLIENT_PORT,
        Ipv4Address::BROADCAST,
        SERVER_PORT,
        device_id,
    )
}

/// Kick off negotiation: broadcast a Discover asking for the subnet mask
/// and router, and move to `Selecting`.
pub fn send_dhcp_discover(device_id: DeviceId) -> KernelResult<()> {
    let (mac, state) = device::with_device(device_id, |d| (d.mac, d.dhcp_state)).ok_or(
        KernelError::NotFound {
            resource: "eth device",
            id: device_id,
        },
    )?;

    if state != DhcpState::Uninit {
        return Err(KernelError::InvalidState {
            expected: "uninit",
            actual: "negotiating",
        });
    }

    let mut packet = DhcpPacket::request_template(mac);
    packet.add_message_type(MessageType::Discover);
    packet.add_parameter_request_list();
    packet.finish_options();

    broadcast(&packet, device_id)?;

    device::with_device_mut(device_id, |d| d.dhcp_state = DhcpState::Selecting);
    log::debug!("dhcp discover sent on device {}", device_id);
    Ok(())
}

/// Accept an Offer: answer immediately with a Request naming the
/// offering server.
fn receive_offer(packet: &DhcpPacket, device_id: DeviceId) -> KernelResult<()> {
    let (mac, state) = device::with_device(device_id, |d| (d.mac, d.dhcp_state)).ok_or(
        KernelError::NotFound {
            resource: "eth device",
            id: device_id,
        },
    )?;

    if state != DhcpState::Selecting {
        return Err(KernelError::InvalidState {
            expected: "selecting",
            actual: "other",
        });
    }

    let mut request = DhcpPacket::request_template(mac);
    request.siaddr = packet.siaddr;
    request.add_message_type(MessageType::Request);
    request.add_server_id(packet.siaddr);
    request.add_parameter_request_list();
    request.finish_options();

    match broadcast(&request, device_id) {
        Ok(()) => {
            device::with_device_mut(device_id, |d| d.dhcp_state = DhcpState::Requesting);
            log::debug!("dhcp request sent on device {}", device_id);
            Ok(())
        }
        Err(e) => {
            device::with_device_mut(device_id, |d| d.dhcp_state = DhcpState::Uninit);
            Err(e)
        }
    }
}

/// Bind an Ack: adopt the offered address, subnet mask and router. A
/// response missing either option regresses to `Uninit`.
fn receive_ack(
    packet: &DhcpPacket,
    options: &ParsedOptions,
    device_id: DeviceId,
) -> KernelResult<()> {
    let state = device::with_device(device_id, |d| d.dhcp_state).ok_or(KernelError::NotFound {
        resource: "eth device",
        id: device_id,
    })?;

    if state != DhcpState::Requesting {
        return Err(KernelError::InvalidState {
            expected: "requesting",
            actual: "other",
        });
    }

    let (Some(subnet_mask), Some(router)) = (options.subnet_mask, options.router) else {
        device::with_device_mut(device_id, |d| d.dhcp_state = DhcpState::Uninit);
        return Err(KernelError::MalformedPacket {
            protocol: "dhcp",
            reason: "ack missing subnet or router",
        });
    };

    device::with_device_mut(device_id, |d| {
        d.ip = packet.yiaddr;
        d.subnet_mask = subnet_mask;
        d.router_ip = router;
        d.dhcp_state = DhcpState::Bound;
    });

    log::info!(
        "dhcp bound: {} mask {} router {}",
        packet.yiaddr,
        subnet_mask,
        router
    );
    Ok(())
}

/// Handle a packet delivered to the DHCP client port.
pub fn receive_dhcp_packet(buffer: &[u8], device_id: DeviceId) -> KernelResult<()> {
    let packet = DhcpPacket::from_bytes(buffer)?;

    // A reply must be server-to-client on Ethernet with our transaction.
    if packet.op != OP_BOOTREPLY
        || packet.htype != HTYPE_ETHERNET
        || packet.hlen != HLEN_ETHERNET
        || packet.xid != TRANSACTION_ID
        || packet.cookie != MAGIC_COOKIE
    {
        return Err(KernelError::MalformedPacket {
            protocol: "dhcp",
            reason: "bad reply fields",
        });
    }

    let options = parse_options(&packet.options);

    match options.message_type {
        Some(MessageType::Offer) => receive_offer(&packet, device_id),
        Some(MessageType::Ack) => receive_ack(&packet, &options, device_id),
        Some(MessageType::Nak) => {
            // The server refused: start over.
            log::debug!("dhcp nak on device {}, restarting", device_id);
            device::with_device_mut(device_id, |d| d.dhcp_state = DhcpState::Uninit);
            send_dhcp_discover(device_id)
        }
        _ => Err(KernelError::MalformedPacket {
            protocol: "dhcp",
            reason: "missing message type",
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::device::testing::FrameRecorder;

    const SERVER_IP: Ipv4Address = Ipv4Address::new(10, 0, 0, 1);

    fn install_device(mac_tail: u8) -> (&'static FrameRecorder, DeviceId) {
        FrameRecorder::install(MacAddress::new([2, 2, 0, 0, 0, mac_tail]))
    }

    /// The DHCP payload of the most recent frame the device sent.
    fn last_dhcp_payload(recorder: &FrameRecorder) -> Vec<u8> {
        let frame = recorder.last_frame().unwrap();
        // 14 bytes Ethernet + 20 IP + 8 UDP.
        frame[42..].to_vec()
    }

    fn server_reply(mt: MessageType, extra_options: &[u8]) -> Vec<u8> {
        let mut packet = DhcpPacket::request_template(MacAddress::ZERO);
        packet.op = OP_BOOTREPLY;
        packet.yiaddr = Ipv4Address::new(10, 0, 0, 42);
        packet.siaddr = SERVER_IP;
        packet.add_message_type(mt);
        packet.options.extend_from_slice(extra_options);
        packet.finish_options();
        packet.to_bytes()
    }

    fn full_ack_options() -> Vec<u8> {
        let mut opts = Vec::new();
        opts.extend_from_slice(&[OPT_SUBNET_MASK, 4, 255, 255, 255, 0]);
        opts.extend_from_slice(&[OPT_ROUTER, 4, 10, 0, 0, 1]);
        opts
    }

    #[test]
    fn test_discover_packet_shape() {
        let (recorder, id) = install_device(1);
        send_dhcp_discover(id).unwrap();

        assert_eq!(
            device::with_device(id, |d| d.dhcp_state),
            Some(DhcpState::Selecting)
        );

        let frame = recorder.last_frame().unwrap();
        // Broadcast at both layers, client port to server port.
        assert_eq!(&frame[..6], &[0xFF; 6]);
        let udp_header = &frame[34..42];
        assert_eq!(u16::from_be_bytes([udp_header[0], udp_header[1]]), 68);
        assert_eq!(u16::from_be_bytes([udp_header[2], udp_header[3]]), 67);

        let dhcp = last_dhcp_payload(recorder);
        assert_eq!(dhcp[0], OP_BOOTREQUEST);
        assert_eq!(dhcp[1], HTYPE_ETHERNET);
        assert_eq!(dhcp[2], HLEN_ETHERNET);
        assert_eq!(
            u32::from_be_bytes([dhcp[4], dhcp[5], dhcp[6], dhcp[7]]),
            TRANSACTION_ID
        );
        // Client hardware address is our MAC, zero padded.
        assert_eq!(&dhcp[28..34], &[2, 2, 0, 0, 0, 1]);
        assert_eq!(&dhcp[34..44], &[0u8; 10]);
        assert_eq!(
            u32::from_be_bytes([dhcp[236], dhcp[237], dhcp[238], dhcp[239]]),
            MAGIC_COOKIE
        );
        // Options: message type Discover, parameter list {mask, router},
        // end.
        assert_eq!(
            &dhcp[240..],
            &[
                OPT_MESSAGE_TYPE,
                1,
                MessageType::Discover as u8,
                OPT_PARAMETER_LIST,
                2,
                OPT_SUBNET_MASK,
                OPT_ROUTER,
                OPT_END
            ]
        );

        // A second discover while negotiating is refused.
        assert!(send_dhcp_discover(id).is_err());
    }

    #[test]
    fn test_offer_triggers_request_with_server_id() {
        let (recorder, id) = install_device(2);
        send_dhcp_discover(id).unwrap();

        receive_dhcp_packet(&server_reply(MessageType::Offer, &[]), id).unwrap();
        assert_eq!(
            device::with_device(id, |d| d.dhcp_state),
            Some(DhcpState::Requesting)
        );

        let dhcp = last_dhcp_payload(recorder);
        let options = &dhcp[240..];
        // Message type Request followed by the chosen server id.
        assert_eq!(options[0..3], [OPT_MESSAGE_TYPE, 1, MessageType::Request as u8]);
        assert_eq!(options[3..5], [OPT_SERVER_ID, 4]);
        assert_eq!(&options[5..9], &SERVER_IP.0);
    }

    #[test]
    fn test_ack_binds_address() {
        let (_, id) = install_device(3);
        send_dhcp_discover(id).unwrap();
        receive_dhcp_packet(&server_reply(MessageType::Offer, &[]), id).unwrap();

        receive_dhcp_packet(&server_reply(MessageType::Ack, &full_ack_options()), id).unwrap();

        device::with_device(id, |d| {
            assert_eq!(d.dhcp_state, DhcpState::Bound);
            assert_eq!(d.ip, Ipv4Address::new(10, 0, 0, 42));
            assert_eq!(d.subnet_mask, Ipv4Address::new(255, 255, 255, 0));
            assert_eq!(d.router_ip, Ipv4Address::new(10, 0, 0, 1));
        });
    }

    #[test]
    fn test_ack_missing_router_regresses() {
        let (_, id) = install_device(4);
        send_dhcp_discover(id).unwrap();
        receive_dhcp_packet(&server_reply(MessageType::Offer, &[]), id).unwrap();

        let mut opts = Vec::new();
        opts.extend_from_slice(&[OPT_SUBNET_MASK, 4, 255, 255, 255, 0]);
        let result = receive_dhcp_packet(&server_reply(MessageType::Ack, &opts), id);

        assert!(result.is_err());
        assert_eq!(
            device::with_device(id, |d| d.dhcp_state),
            Some(DhcpState::Uninit)
        );
    }

    #[test]
    fn test_nak_restarts_negotiation() {
        let (recorder, id) = install_device(5);
        send_dhcp_discover(id).unwrap();
        receive_dhcp_packet(&server_reply(MessageType::Offer, &[]), id).unwrap();
        let frames_before = recorder.frame_count();

        receive_dhcp_packet(&server_reply(MessageType::Nak, &[]), id).unwrap();

        // A fresh Discover went out and we are Selecting again.
        assert_eq!(recorder.frame_count(), frames_before + 1);
        assert_eq!(
            device::with_device(id, |d| d.dhcp_state),
            Some(DhcpState::Selecting)
        );
        let dhcp = last_dhcp_payload(recorder);
        assert_eq!(
            dhcp[240..243],
            [OPT_MESSAGE_TYPE, 1, MessageType::Discover as u8]
        );
    }

    #[test]
    fn test_reply_validation() {
        let (_, id) = install_device(6);
        send_dhcp_discover(id).unwrap();

        // Wrong op.
        let mut bad = server_reply(MessageType::Offer, &[]);
        bad[0] = OP_BOOTREQUEST;
        assert!(receive_dhcp_packet(&bad, id).is_err());

        // Wrong transaction id.
        let mut bad = server_reply(MessageType::Offer, &[]);
        bad[4] = 0;
        assert!(receive_dhcp_packet(&bad, id).is_err());

        // Wrong cookie.
        let mut bad = server_reply(MessageType::Offer, &[]);
        bad[236] = 0;
        assert!(receive_dhcp_packet(&bad, id).is_err());

        // Truncated.
        assert!(receive_dhcp_packet(&[0u8; 100], id).is_err());

        // Options running past the end terminate parsing without a
        // message type.
        let mut packet = DhcpPacket::request_template(MacAddress::ZERO);
        packet.op = OP_BOOTREPLY;
        packet.options.extend_from_slice(&[OPT_MESSAGE_TYPE, 200]);
        assert!(receive_dhcp_packet(&packet.to_bytes(), id).is_err());
    }

    #[test]
    fn test_dhcp_over_udp_port_routing() {
        // A datagram to port 68 lands in the DHCP machine via the UDP
        // receive path.
        let (_, id) = install_device(7);
        send_dhcp_discover(id).unwrap();

        let payload = server_reply(MessageType::Offer, &[]);
        let udp_len = (crate::net::udp::UDP_HEADER_SIZE + payload.len()) as u16;
        let mut packet = Vec::new();
        packet.extend_from_slice(
            &crate::net::ip::build_ipv4_header(udp_len, SERVER_IP, Ipv4Address::BROADCAST)
                .unwrap(),
        );
        packet.extend_from_slice(&SERVER_PORT.to_be_bytes());
        packet.extend_from_slice(&CLIENT_PORT.to_be_bytes());
        packet.extend_from_slice(&udp_len.to_be_bytes());
        packet.extend_from_slice(&0u16.to_be_bytes());
        packet.extend_from_slice(&payload);

        crate::net::udp::receive_udp_packet(&packet, MacAddress::ZERO, None, id).unwrap();
        assert_eq!(
            device::with_device(id, |d| d.dhcp_state),
            Some(DhcpState::Requesting)
        );
    }
}
