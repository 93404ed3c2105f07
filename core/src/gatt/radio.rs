//! Native radio seam
//!
//! A [`RadioLink`] starts primitive GATT requests and reports whether the
//! stack accepted them. Completions arrive later, from whatever thread the
//! stack uses, through the [`RadioEventSink`] handed over at connect time.

use super::address::DeviceAddress;
use super::session::Command;
use super::types::{CharacteristicId, GattService, GattStatus, LinkState, WriteType};
use tokio::sync::mpsc::UnboundedSender;
use uuid::Uuid;

/// Opaque handle to one native connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LinkHandle(pub u64);

/// Asynchronous completion or notification from the radio
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RadioEvent {
    ConnectionStateChanged {
        status: GattStatus,
        state: LinkState,
    },
    ServicesDiscovered {
        status: GattStatus,
        services: Vec<GattService>,
    },
    CharacteristicRead {
        characteristic: CharacteristicId,
        status: GattStatus,
        value: Vec<u8>,
    },
    CharacteristicWrite {
        characteristic: CharacteristicId,
        status: GattStatus,
    },
    DescriptorWrite {
        characteristic: CharacteristicId,
        descriptor: Uuid,
        status: GattStatus,
    },
    CharacteristicChanged {
        characteristic: CharacteristicId,
        value: Vec<u8>,
    },
    RssiRead {
        rssi: i16,
        status: GattStatus,
    },
}

/// Delivers radio events into a session's dispatch queue.
///
/// Each sink is bound to the connect attempt that created it; events sent
/// through a sink from an earlier attempt are discarded by the session.
#[derive(Debug, Clone)]
pub struct RadioEventSink {
    commands: UnboundedSender<Command>,
    epoch: u64,
}

impl RadioEventSink {
    pub(crate) fn new(commands: UnboundedSender<Command>, epoch: u64) -> Self {
        Self { commands, epoch }
    }

    /// Queue an event. Returns false once the session is gone.
    pub fn emit(&self, event: RadioEvent) -> bool {
        self.commands
            .send(Command::Radio {
                epoch: self.epoch,
                event,
            })
            .is_ok()
    }

    pub fn is_closed(&self) -> bool {
        self.commands.is_closed()
    }
}

/// Primitive BLE operations provided by the platform binding.
///
/// Every request method returns whether the stack accepted it; `false`
/// means no completion event will follow.
pub trait RadioLink: Send + Sync {
    /// Whether the adapter is present and powered
    fn is_enabled(&self) -> bool;

    fn is_bonded(&self, _address: DeviceAddress) -> bool {
        false
    }

    fn connect(
        &self,
        address: DeviceAddress,
        auto_connect: bool,
        events: RadioEventSink,
    ) -> Option<LinkHandle>;

    fn disconnect(&self, link: LinkHandle) -> bool;

    /// Release all native resources of the link
    fn close(&self, link: LinkHandle);

    fn discover_services(&self, link: LinkHandle) -> bool;

    fn read_characteristic(&self, link: LinkHandle, characteristic: &CharacteristicId) -> bool;

    fn write_characteristic(
        &self,
        link: LinkHandle,
        characteristic: &CharacteristicId,
        value: &[u8],
        write_type: Option<WriteType>,
    ) -> bool;

    /// Enable or disable local delivery of value changes; no completion event
    fn set_notification(
        &self,
        link: LinkHandle,
        characteristic: &CharacteristicId,
        enable: bool,
    ) -> bool;

    fn write_descriptor(
        &self,
        link: LinkHandle,
        characteristic: &CharacteristicId,
        descriptor: Uuid,
        value: &[u8],
    ) -> bool;

    fn read_rssi(&self, link: LinkHandle) -> bool;
}
