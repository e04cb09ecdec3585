//! Ethernet device registry.
//!
//! Drivers register a transmit hook and a MAC address; the registry hands
//! back the smallest unused positive id. Addressing state (IP, subnet,
//! router) is filled in by the DHCP client as it converges.

use alloc::vec::Vec;

use crate::{
    error::{KernelError, KernelResult},
    sync::SpinLock,
};

use super::{Ipv4Address, MacAddress};

/// Registry-assigned device identifier (positive, unique).
pub type DeviceId = u32;

/// DHCP client state of one interface.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DhcpState {
    Uninit,
    Selecting,
    Requesting,
    Bound,
}

/// Driver-side transmit hook.
pub trait EthTransmit: Send + Sync {
    fn transmit(&self, frame: &[u8]) -> KernelResult<()>;
}

/// One registered Ethernet interface.
pub struct EthDevice {
    pub id: DeviceId,
    pub mac: MacAddress,
    pub ip: Ipv4Address,
    pub subnet_mask: Ipv4Address,
    pub router_ip: Ipv4Address,
    pub router_mac: MacAddress,
    pub dhcp_state: DhcpState,
    transmit: &'static dyn EthTransmit,
}

static DEVICES: SpinLock<Vec<EthDevice>> = SpinLock::new(Vec::new());

/// Register a device, assigning the smallest unused positive id.
pub fn register_eth_device(mac: MacAddress, transmit: &'static dyn EthTransmit) -> DeviceId {
    let mut devices = DEVICES.lock_irqsave();

    let mut id: DeviceId = 1;
    loop {
        if !devices.iter().any(|d| d.id == id) {
            break;
        }
        id += 1;
    }

    devices.push(EthDevice {
        id,
        mac,
        ip: Ipv4Address::ANY,
        subnet_mask: Ipv4Address::ANY,
        router_ip: Ipv4Address::ANY,
        router_mac: MacAddress::ZERO,
        dhcp_state: DhcpState::Uninit,
        transmit,
    });

    id
}

/// Remove a device from the registry.
pub fn unregister_eth_device(id: DeviceId) {
    DEVICES.lock_irqsave().retain(|d| d.id != id);
}

/// Transmit a fully assembled frame on the given device.
pub fn transmit(id: DeviceId, frame: &[u8]) -> KernelResult<()> {
    let devices = DEVICES.lock_irqsave();
    let device = devices
        .iter()
        .find(|d| d.id == id)
        .ok_or(KernelError::NotFound {
            resource: "eth device",
            id,
        })?;
    device.transmit.transmit(frame)
}

/// Run `f` against the device record, if it exists.
pub fn with_device<R>(id: DeviceId, f: impl FnOnce(&EthDevice) -> R) -> Option<R> {
    let devices = DEVICES.lock_irqsave();
    devices.iter().find(|d| d.id == id).map(f)
}

/// Run `f` against the mutable device record, if it exists.
pub fn with_device_mut<R>(id: DeviceId, f: impl FnOnce(&mut EthDevice) -> R) -> Option<R> {
    let mut devices = DEVICES.lock_irqsave();
    devices.iter_mut().find(|d| d.id == id).map(f)
}

/// MAC address of a device.
pub fn mac_addr(id: DeviceId) -> Option<MacAddress> {
    with_device(id, |d| d.mac)
}

/// IP address of a device (0.0.0.0 before DHCP converges).
pub fn ip_addr(id: DeviceId) -> Option<Ipv4Address> {
    with_device(id, |d| d.ip)
}
