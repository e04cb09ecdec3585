//! ARP table and request/reply processing.
//!
//! Fixed-capacity table keyed by `(ip, device)` with at most one
//! non-empty entry per key. Entries age out through a periodic eviction
//! callback; because the sweep itself runs every `ARP_TIMEOUT` seconds,
//! an entry actually lives between one and two timeouts.

use alloc::vec::Vec;

use crate::{
    error::{KernelError, KernelResult},
    sync::SpinLock,
    timer,
};

use super::{
    device::{self, DeviceId},
    ethernet, Ipv4Address, MacAddress,
};

/// Number of entries in the ARP table.
pub const ARP_TABLE_SIZE: usize = 64;

/// Seconds an entry stays valid (nominally; see module docs).
pub const ARP_TIMEOUT_SECONDS: f64 = 10.0;

/// ARP wire constants.
const ARP_HTYPE_ETHERNET: u16 = 1;
const ARP_PTYPE_IPV4: u16 = 0x0800;
const ARP_OP_REQUEST: u16 = 1;
const ARP_OP_REPLY: u16 = 2;
const ARP_PACKET_SIZE: usize = 28;

/// State of one table slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArpEntryState {
    /// Slot unused.
    Empty,
    /// A request is outstanding for this IP.
    Waiting,
    /// Valid mapping.
    Present,
}

/// Result of a lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArpLookup {
    Present(MacAddress),
    Waiting,
    Empty,
}

#[derive(Debug, Clone, Copy)]
struct ArpEntry {
    state: ArpEntryState,
    ip: Ipv4Address,
    mac: MacAddress,
    device_id: DeviceId,
    vlan: Option<u16>,
    time_added: f64,
}

const EMPTY_ENTRY: ArpEntry = ArpEntry {
    state: ArpEntryState::Empty,
    ip: Ipv4Address::ANY,
    mac: MacAddress::ZERO,
    device_id: 0,
    vlan: None,
    time_added: 0.0,
};

/// The ARP table. All access paths already run with interrupts masked
/// (interrupt context or irqsave sections); the lock encodes that
/// discipline.
static ARP_TABLE: SpinLock<[ArpEntry; ARP_TABLE_SIZE]> =
    SpinLock::new([EMPTY_ENTRY; ARP_TABLE_SIZE]);

/// Evict every entry older than the timeout. Runs from the periodic
/// timer, so actual lifetimes land between 1x and 2x the timeout.
pub fn flush_arp_entries(time: f64) {
    let mut table = ARP_TABLE.lock_irqsave();
    for entry in table.iter_mut() {
        if entry.state != ArpEntryState::Empty && time - entry.time_added > ARP_TIMEOUT_SECONDS {
            log::debug!("arp entry for {} expired", entry.ip);
            entry.state = ArpEntryState::Empty;
        }
    }
}

/// Register the eviction callback. Called once at boot.
pub fn init() -> KernelResult<()> {
    let interval = (timer::PIT_FREQUENCY as f64 * ARP_TIMEOUT_SECONDS) as u32;
    let id = timer::register_periodic_callback(interval, flush_arp_entries);
    if id == 0 {
        return Err(KernelError::ResourceExhausted {
            resource: "timer callbacks",
        });
    }
    Ok(())
}

/// Look up the MAC for `ip` on `device_id`.
///
/// The broadcast IP resolves to the broadcast MAC without touching the
/// table.
pub fn get_arp_entry(ip: Ipv4Address, device_id: DeviceId) -> ArpLookup {
    if ip == Ipv4Address::BROADCAST {
        return ArpLookup::Present(MacAddress::BROADCAST);
    }

    let table = ARP_TABLE.lock_irqsave();
    for entry in table.iter() {
        if entry.state != ArpEntryState::Empty && entry.device_id == device_id && entry.ip == ip {
            return match entry.state {
                ArpEntryState::Present => ArpLookup::Present(entry.mac),
                ArpEntryState::Waiting => ArpLookup::Waiting,
                ArpEntryState::Empty => ArpLookup::Empty,
            };
        }
    }

    ArpLookup::Empty
}

/// Common fields of requests and replies.
fn build_arp_packet(
    operation: u16,
    sender_mac: MacAddress,
    sender_ip: Ipv4Address,
    target_mac: MacAddress,
    target_ip: Ipv4Address,
) -> Vec<u8> {
    let mut pkt = Vec::with_capacity(ARP_PACKET_SIZE);
    pkt.extend_from_slice(&ARP_HTYPE_ETHERNET.to_be_bytes());
    pkt.extend_from_slice(&ARP_PTYPE_IPV4.to_be_bytes());
    pkt.push(6);
    pkt.push(4);
    pkt.extend_from_slice(&operation.to_be_bytes());
    pkt.extend_from_slice(&sender_mac.0);
    pkt.extend_from_slice(&sender_ip.0);
    pkt.extend_from_slice(&target_mac.0);
    pkt.extend_from_slice(&target_ip.0);
    pkt
}

/// Broadcast a request for `target_ip`, claiming a Waiting slot first.
///
/// A request already in flight for the same `(ip, device)` drops this
/// one; a Present entry is left alone (the reply will refresh it).
pub fn send_arp_request(target_ip: Ipv4Address, device_id: DeviceId) -> KernelResult<()> {
    {
        let mut table = ARP_TABLE.lock_irqsave();

        let mut entry_exists = false;
        for entry in table.iter() {
            if entry.state != ArpEntryState::Empty
                && entry.device_id == device_id
                && entry.ip == target_ip
            {
                if entry.state == ArpEntryState::Waiting {
                    return Err(KernelError::WouldBlock);
                }
                entry_exists = true;
            }
        }

        if !entry_exists {
            let slot = table
                .iter_mut()
                .find(|e| e.state == ArpEntryState::Empty)
                .ok_or(KernelError::ResourceExhausted { resource: "arp table" })?;
            slot.state = ArpEntryState::Waiting;
            slot.ip = target_ip;
            slot.device_id = device_id;
            slot.time_added = timer::system_time();
        }
    }

    let our_mac = device::mac_addr(device_id).ok_or(KernelError::NotFound {
        resource: "eth device",
        id: device_id,
    })?;
    let our_ip = device::ip_addr(device_id).ok_or(KernelError::NotFound {
        resource: "eth device",
        id: device_id,
    })?;

    let packet = build_arp_packet(
        ARP_OP_REQUEST,
        our_mac,
        our_ip,
        MacAddress::ZERO,
        target_ip,
    );
    ethernet::send_eth_packet(MacAddress::BROADCAST, ethernet::ETHERTYPE_ARP, &packet, device_id)
}

/// Unicast a reply carrying our MAC to `target`.
fn send_arp_reply(
    target_ip: Ipv4Address,
    target_mac: MacAddress,
    device_id: DeviceId,
) -> KernelResult<()> {
    let our_mac = device::mac_addr(device_id).ok_or(KernelError::NotFound {
        resource: "eth device",
        id: device_id,
    })?;
    let our_ip = device::ip_addr(device_id).ok_or(KernelError::NotFound {
        resource: "eth device",
        id: device_id,
    })?;

    let packet = build_arp_packet(ARP_OP_REPLY, our_mac, our_ip, target_mac, target_ip);
    ethernet::send_eth_packet(target_mac, ethernet::ETHERTYPE_ARP, &packet, device_id)
}

/// Insert or refresh the `(sender_ip, device)` mapping, evicting the
/// oldest entry when the table is full.
fn learn(
    sender_ip: Ipv4Address,
    sender_mac: MacAddress,
    vlan: Option<u16>,
    device_id: DeviceId,
) {
    let now = timer::system_time();
    let mut table = ARP_TABLE.lock_irqsave();

    // Pick the slot in strict preference order: the existing entry for
    // this key (so the key never duplicates), then any empty slot, then
    // the oldest entry in a full table.
    let mut slot_index = None;
    let mut empty_index = None;
    let mut oldest_index = 0;
    let mut oldest_time = f64::INFINITY;

    for (i, entry) in table.iter().enumerate() {
        if entry.state == ArpEntryState::Empty {
            if empty_index.is_none() {
                empty_index = Some(i);
            }
            continue;
        }

        if entry.device_id == device_id && entry.ip == sender_ip {
            slot_index = Some(i);
            break;
        }

        if entry.time_added < oldest_time {
            oldest_time = entry.time_added;
            oldest_index = i;
        }
    }

    let index = match (slot_index, empty_index) {
        (Some(i), _) => i,
        (None, Some(i)) => i,
        (None, None) => {
            log::debug!("arp table full, replacing entry for {}", table[oldest_index].ip);
            oldest_index
        }
    };

    let entry = &mut table[index];
    entry.state = ArpEntryState::Present;
    entry.ip = sender_ip;
    entry.mac = sender_mac;
    entry.vlan = vlan;
    entry.device_id = device_id;
    entry.time_added = now;
    log::debug!("arp learned {} on device {}", sender_ip, device_id);
}

/// Process a received ARP packet: answer requests for our IP, learn from
/// replies.
pub fn receive_arp_packet(
    buffer: &[u8],
    vlan: Option<u16>,
    device_id: DeviceId,
) -> KernelResult<()> {
    if buffer.len() < ARP_PACKET_SIZE {
        return Err(KernelError::MalformedPacket {
            protocol: "arp",
            reason: "too short",
        });
    }

    let htype = u16::from_be_bytes([buffer[0], buffer[1]]);
    let ptype = u16::from_be_bytes([buffer[2], buffer[3]]);
    let hlen = buffer[4];
    let plen = buffer[5];
    let operation = u16::from_be_bytes([buffer[6], buffer[7]]);

    let mut sender_mac = [0u8; 6];
    sender_mac.copy_from_slice(&buffer[8..14]);
    let sender_mac = MacAddress(sender_mac);
    let sender_ip = Ipv4Address([buffer[14], buffer[15], buffer[16], buffer[17]]);
    let target_ip = Ipv4Address([buffer[24], buffer[25], buffer[26], buffer[27]]);

    if operation == ARP_OP_REQUEST {
        let our_ip = device::ip_addr(device_id).unwrap_or(Ipv4Address::ANY);
        if target_ip == our_ip {
            let _ = send_arp_reply(sender_ip, sender_mac, device_id);
        }
        return Ok(());
    }

    if operation != ARP_OP_REPLY {
        return Err(KernelError::MalformedPacket {
            protocol: "arp",
            reason: "unknown operation",
        });
    }

    if htype != ARP_HTYPE_ETHERNET || ptype != ARP_PTYPE_IPV4 || hlen != 6 || plen != 4 {
        return Err(KernelError::MalformedPacket {
            protocol: "arp",
            reason: "not ethernet/ipv4",
        });
    }

    learn(sender_ip, sender_mac, vlan, device_id);
    Ok(())
}

/// Eviction sweeps the shared table with arbitrary times; tests that
/// assert on table contents serialize through this lock.
#[cfg(test)]
pub(crate) fn test_table_lock() -> std::sync::MutexGuard<'static, ()> {
    static LOCK: std::sync::Mutex<()> = std::sync::Mutex::new(());
    LOCK.lock().unwrap_or_else(|e| e.into_inner())
}
