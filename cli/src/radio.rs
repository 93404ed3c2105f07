// btleplug binding for the GATT session layer
//
// Every RadioLink call returns immediately; the actual btleplug future runs
// on the tokio runtime and reports back through the link's event sink.

use anyhow::{Context, Result};
use btleplug::api::{
    Central, CentralEvent, CentralState, CharPropFlags, Characteristic, Descriptor,
    Manager as _, Peripheral as _, ScanFilter, WriteType as BtWriteType,
};
use btleplug::platform::{Adapter, Manager, Peripheral};
use futures::StreamExt;
use gattlink_core::gatt::uuids::CLIENT_CHARACTERISTIC_CONFIG;
use gattlink_core::{
    CharacteristicId, DeviceAddress, GattService, GattStatus, LinkHandle, LinkState, RadioEvent,
    RadioEventSink, RadioLink, WriteType,
};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// btleplug reports errors without a protocol status code
const STACK_FAILURE: GattStatus = GattStatus(1);

struct Link {
    address: DeviceAddress,
    peripheral: Peripheral,
    events: RadioEventSink,
    tasks: Vec<JoinHandle<()>>,
}

pub struct BtleplugRadio {
    adapter: Adapter,
    runtime: Handle,
    powered: Arc<AtomicBool>,
    state_task: JoinHandle<()>,
    known: Mutex<HashMap<DeviceAddress, Peripheral>>,
    links: Mutex<HashMap<LinkHandle, Link>>,
    next_link: AtomicU64,
}

/// Address of a peripheral, if the platform exposes one
pub fn peripheral_address(peripheral: &Peripheral) -> Option<DeviceAddress> {
    DeviceAddress::from_bytes(peripheral.address().into_inner()).ok()
}

impl BtleplugRadio {
    /// Bind to the first adapter of the system
    pub async fn first_adapter() -> Result<Self> {
        let manager = Manager::new().await.context("Failed to start BLE manager")?;
        let adapter = manager
            .adapters()
            .await
            .context("Failed to list BLE adapters")?
            .into_iter()
            .next()
            .context("No BLE adapter found")?;
        match adapter.adapter_info().await {
            Ok(info) => info!("Using adapter {}", info),
            Err(e) => debug!("Adapter info unavailable: {}", e),
        }
        let runtime = Handle::try_current().context("No tokio runtime")?;

        let powered = match adapter.adapter_state().await {
            Ok(state) => is_powered(state),
            Err(e) => {
                debug!("Adapter state unavailable: {}", e);
                true
            }
        };
        let powered = Arc::new(AtomicBool::new(powered));
        let mut events = adapter
            .events()
            .await
            .context("Failed to subscribe to adapter events")?;
        let tracker = powered.clone();
        let state_task = runtime.spawn(async move {
            while let Some(event) = events.next().await {
                if let CentralEvent::StateUpdate(state) = event {
                    info!("Adapter state changed: {:?}", state);
                    tracker.store(is_powered(state), Ordering::SeqCst);
                }
            }
        });

        Ok(Self {
            adapter,
            runtime,
            powered,
            state_task,
            known: Mutex::new(HashMap::new()),
            links: Mutex::new(HashMap::new()),
            next_link: AtomicU64::new(1),
        })
    }

    pub fn adapter(&self) -> &Adapter {
        &self.adapter
    }

    /// Scan until `address` shows up or `timeout` passes
    pub async fn find(&self, address: DeviceAddress, timeout: Duration) -> Result<bool> {
        if self.known.lock().contains_key(&address) {
            return Ok(true);
        }
        self.adapter
            .start_scan(ScanFilter::default())
            .await
            .context("Failed to start scan")?;
        let deadline = tokio::time::Instant::now() + timeout;
        let found = loop {
            for peripheral in self.adapter.peripherals().await? {
                if peripheral_address(&peripheral) == Some(address) {
                    self.known.lock().insert(address, peripheral);
                }
            }
            if self.known.lock().contains_key(&address) {
                break true;
            }
            if tokio::time::Instant::now() >= deadline {
                break false;
            }
            tokio::time::sleep(Duration::from_millis(250)).await;
        };
        if let Err(e) = self.adapter.stop_scan().await {
            warn!("Failed to stop scan: {}", e);
        }
        Ok(found)
    }

    fn link(&self, link: LinkHandle) -> Option<(DeviceAddress, Peripheral, RadioEventSink)> {
        self.links
            .lock()
            .get(&link)
            .map(|l| (l.address, l.peripheral.clone(), l.events.clone()))
    }

    fn spawn_on(&self, link: LinkHandle, task: impl Future<Output = ()> + Send + 'static) {
        let handle = self.runtime.spawn(task);
        if let Some(l) = self.links.lock().get_mut(&link) {
            l.tasks.retain(|t| !t.is_finished());
            l.tasks.push(handle);
        }
    }

    fn characteristic(peripheral: &Peripheral, id: &CharacteristicId) -> Option<Characteristic> {
        peripheral
            .characteristics()
            .into_iter()
            .find(|c| c.service_uuid == id.service && c.uuid == id.characteristic)
    }
}

impl Drop for BtleplugRadio {
    fn drop(&mut self) {
        self.state_task.abort();
    }
}

/// An adapter in an unknown state is given the benefit of the doubt
fn is_powered(state: CentralState) -> bool {
    !matches!(state, CentralState::PoweredOff)
}

fn descriptor_of(characteristic: &Characteristic, uuid: Uuid) -> Option<Descriptor> {
    characteristic
        .descriptors
        .iter()
        .find(|d| d.uuid == uuid)
        .cloned()
}

fn services_of(peripheral: &Peripheral) -> Vec<GattService> {
    let mut services: BTreeMap<Uuid, Vec<Uuid>> = BTreeMap::new();
    for service in peripheral.services() {
        let characteristics = services.entry(service.uuid).or_default();
        characteristics.extend(service.characteristics.iter().map(|c| c.uuid));
    }
    services
        .into_iter()
        .map(|(uuid, characteristics)| GattService::new(uuid, characteristics))
        .collect()
}

impl RadioLink for BtleplugRadio {
    fn is_enabled(&self) -> bool {
        self.powered.load(Ordering::SeqCst)
    }

    fn connect(
        &self,
        address: DeviceAddress,
        _auto_connect: bool,
        events: RadioEventSink,
    ) -> Option<LinkHandle> {
        let Some(peripheral) = self.known.lock().get(&address).cloned() else {
            warn!("{} connect: peripheral not seen in a scan", address);
            return None;
        };
        let link = LinkHandle(self.next_link.fetch_add(1, Ordering::SeqCst));
        self.links.lock().insert(
            link,
            Link {
                address,
                peripheral: peripheral.clone(),
                events: events.clone(),
                tasks: Vec::new(),
            },
        );

        self.spawn_on(link, async move {
            if let Err(e) = peripheral.connect().await {
                warn!("{} connect failed: {}", address, e);
                events.emit(RadioEvent::ConnectionStateChanged {
                    status: STACK_FAILURE,
                    state: LinkState::Disconnected,
                });
                return;
            }
            events.emit(RadioEvent::ConnectionStateChanged {
                status: GattStatus::SUCCESS,
                state: LinkState::Connected,
            });

            // Forward value changes for the lifetime of the link
            let mut notifications = match peripheral.notifications().await {
                Ok(stream) => stream,
                Err(e) => {
                    warn!("{} notification stream unavailable: {}", address, e);
                    return;
                }
            };
            while let Some(notification) = notifications.next().await {
                let service = peripheral
                    .characteristics()
                    .into_iter()
                    .find(|c| c.uuid == notification.uuid)
                    .map(|c| c.service_uuid);
                if let Some(service) = service {
                    events.emit(RadioEvent::CharacteristicChanged {
                        characteristic: CharacteristicId::new(service, notification.uuid),
                        value: notification.value,
                    });
                }
            }
        });
        Some(link)
    }

    fn disconnect(&self, link: LinkHandle) -> bool {
        let Some((address, peripheral, events)) = self.link(link) else {
            return false;
        };
        // Detached so that a close right after it does not abort the teardown
        self.runtime.spawn(async move {
            let status = match peripheral.disconnect().await {
                Ok(()) => GattStatus::SUCCESS,
                Err(e) => {
                    warn!("{} disconnect failed: {}", address, e);
                    STACK_FAILURE
                }
            };
            events.emit(RadioEvent::ConnectionStateChanged {
                status,
                state: LinkState::Disconnected,
            });
        });
        true
    }

    fn close(&self, link: LinkHandle) {
        if let Some(l) = self.links.lock().remove(&link) {
            debug!("{} closing {:?}", l.address, link);
            for task in l.tasks {
                task.abort();
            }
        }
    }

    fn discover_services(&self, link: LinkHandle) -> bool {
        let Some((address, peripheral, events)) = self.link(link) else {
            return false;
        };
        self.spawn_on(link, async move {
            let event = match peripheral.discover_services().await {
                Ok(()) => RadioEvent::ServicesDiscovered {
                    status: GattStatus::SUCCESS,
                    services: services_of(&peripheral),
                },
                Err(e) => {
                    warn!("{} service discovery failed: {}", address, e);
                    RadioEvent::ServicesDiscovered {
                        status: STACK_FAILURE,
                        services: Vec::new(),
                    }
                }
            };
            events.emit(event);
        });
        true
    }

    fn read_characteristic(&self, link: LinkHandle, characteristic: &CharacteristicId) -> bool {
        let Some((address, peripheral, events)) = self.link(link) else {
            return false;
        };
        let Some(native) = Self::characteristic(&peripheral, characteristic) else {
            return false;
        };
        let id = *characteristic;
        self.spawn_on(link, async move {
            let (status, value) = match peripheral.read(&native).await {
                Ok(value) => (GattStatus::SUCCESS, value),
                Err(e) => {
                    warn!("{} read {} failed: {}", address, id, e);
                    (STACK_FAILURE, Vec::new())
                }
            };
            events.emit(RadioEvent::CharacteristicRead {
                characteristic: id,
                status,
                value,
            });
        });
        true
    }

    fn write_characteristic(
        &self,
        link: LinkHandle,
        characteristic: &CharacteristicId,
        value: &[u8],
        write_type: Option<WriteType>,
    ) -> bool {
        let Some((address, peripheral, events)) = self.link(link) else {
            return false;
        };
        let Some(native) = Self::characteristic(&peripheral, characteristic) else {
            return false;
        };
        let write_type = match write_type {
            Some(WriteType::WithResponse) => BtWriteType::WithResponse,
            Some(WriteType::WithoutResponse) => BtWriteType::WithoutResponse,
            Some(WriteType::Signed) => {
                warn!("{} signed writes are not supported by btleplug", address);
                return false;
            }
            None if native.properties.contains(CharPropFlags::WRITE) => BtWriteType::WithResponse,
            None => BtWriteType::WithoutResponse,
        };
        let id = *characteristic;
        let value = value.to_vec();
        self.spawn_on(link, async move {
            let status = match peripheral.write(&native, &value, write_type).await {
                Ok(()) => GattStatus::SUCCESS,
                Err(e) => {
                    warn!("{} write {} failed: {}", address, id, e);
                    STACK_FAILURE
                }
            };
            events.emit(RadioEvent::CharacteristicWrite {
                characteristic: id,
                status,
            });
        });
        true
    }

    fn set_notification(
        &self,
        link: LinkHandle,
        characteristic: &CharacteristicId,
        _enable: bool,
    ) -> bool {
        // Delivery is always on; the descriptor write does the subscribing
        self.link(link)
            .map_or(false, |(_, peripheral, _)| {
                Self::characteristic(&peripheral, characteristic).is_some()
            })
    }

    fn write_descriptor(
        &self,
        link: LinkHandle,
        characteristic: &CharacteristicId,
        descriptor: Uuid,
        value: &[u8],
    ) -> bool {
        let Some((address, peripheral, events)) = self.link(link) else {
            return false;
        };
        let Some(native) = Self::characteristic(&peripheral, characteristic) else {
            return false;
        };
        let id = *characteristic;
        // btleplug owns the CCCD; subscribe writes it for us
        let target = if descriptor == CLIENT_CHARACTERISTIC_CONFIG {
            None
        } else {
            match descriptor_of(&native, descriptor) {
                Some(d) => Some(d),
                None => {
                    warn!("{} descriptor {} not found on {}", address, descriptor, id);
                    return false;
                }
            }
        };
        let value = value.to_vec();
        self.spawn_on(link, async move {
            let result = match target {
                Some(d) => peripheral.write_descriptor(&d, &value).await,
                None if value.first().copied().unwrap_or(0) == 0 => {
                    peripheral.unsubscribe(&native).await
                }
                None => peripheral.subscribe(&native).await,
            };
            let status = match result {
                Ok(()) => GattStatus::SUCCESS,
                Err(e) => {
                    warn!("{} descriptor {} write failed: {}", address, descriptor, e);
                    STACK_FAILURE
                }
            };
            events.emit(RadioEvent::DescriptorWrite {
                characteristic: id,
                descriptor,
                status,
            });
        });
        true
    }

    fn read_rssi(&self, link: LinkHandle) -> bool {
        let Some((address, peripheral, events)) = self.link(link) else {
            return false;
        };
        self.spawn_on(link, async move {
            let rssi = match peripheral.properties().await {
                Ok(properties) => properties.and_then(|p| p.rssi),
                Err(e) => {
                    warn!("{} properties unavailable: {}", address, e);
                    None
                }
            };
            let event = match rssi {
                Some(rssi) => RadioEvent::RssiRead {
                    rssi,
                    status: GattStatus::SUCCESS,
                },
                None => RadioEvent::RssiRead {
                    rssi: 0,
                    status: STACK_FAILURE,
                },
            };
            events.emit(event);
        });
        true
    }
}
