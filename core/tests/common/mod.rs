//! Fixtures shared by the session integration tests

#![allow(dead_code)]

use gattlink_core::gatt::uuids;
use gattlink_core::{
    CharacteristicId, ConnectRequest, ConnectionState, DeviceAddress, DisconnectReason,
    GattListener, GattService, GattSession, GattStatus, LinkDecision, LinkHandle, LinkState,
    OperationKind, RadioEvent, RadioEventSink, RadioLink, Retention, TimeoutDecision, WriteType,
};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use uuid::Uuid;

// ============================================================================
// FAKE RADIO
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    Connect { auto_connect: bool, link: Option<LinkHandle> },
    Disconnect(LinkHandle),
    Close(LinkHandle),
    DiscoverServices(LinkHandle),
    Read(CharacteristicId),
    Write(CharacteristicId, Vec<u8>, Option<WriteType>),
    SetNotification(CharacteristicId, bool),
    WriteDescriptor(CharacteristicId, Uuid, Vec<u8>),
    ReadRssi,
}

/// Records every primitive call; completions are emitted by the test
#[derive(Default)]
pub struct FakeRadio {
    disabled: AtomicBool,
    bonded: AtomicBool,
    rejected: Mutex<HashSet<&'static str>>,
    calls: Mutex<Vec<Call>>,
    sinks: Mutex<Vec<RadioEventSink>>,
    next_link: AtomicU64,
}

impl FakeRadio {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.disabled.store(!enabled, Ordering::SeqCst);
    }

    pub fn set_bonded(&self, bonded: bool) {
        self.bonded.store(bonded, Ordering::SeqCst);
    }

    /// Make a primitive ("connect", "write", ...) report rejection
    pub fn reject(&self, primitive: &'static str) {
        self.rejected.lock().expect("rejected lock").insert(primitive);
    }

    fn accepts(&self, primitive: &'static str) -> bool {
        !self.rejected.lock().expect("rejected lock").contains(primitive)
    }

    fn record(&self, call: Call) {
        self.calls.lock().expect("calls lock").push(call);
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().expect("calls lock").clone()
    }

    pub fn count(&self, matches: impl Fn(&Call) -> bool) -> usize {
        self.calls().iter().filter(|call| matches(call)).count()
    }

    pub fn connects(&self) -> usize {
        self.count(|call| matches!(call, Call::Connect { .. }))
    }

    pub fn disconnects(&self) -> usize {
        self.count(|call| matches!(call, Call::Disconnect(_)))
    }

    /// Emit through the sink of the most recent connect
    pub fn emit(&self, event: RadioEvent) {
        let sinks = self.sinks.lock().expect("sinks lock");
        let sink = sinks.last().expect("no connect issued yet");
        assert!(sink.emit(event), "session is gone");
    }

    /// Emit through the sink of the `index`-th connect
    pub fn emit_on(&self, index: usize, event: RadioEvent) {
        let sinks = self.sinks.lock().expect("sinks lock");
        sinks[index].emit(event);
    }

    pub fn emit_connected(&self) {
        self.emit(RadioEvent::ConnectionStateChanged {
            status: GattStatus::SUCCESS,
            state: LinkState::Connected,
        });
    }

    pub fn emit_disconnected(&self, status: GattStatus) {
        self.emit(RadioEvent::ConnectionStateChanged {
            status,
            state: LinkState::Disconnected,
        });
    }
}

impl RadioLink for FakeRadio {
    fn is_enabled(&self) -> bool {
        !self.disabled.load(Ordering::SeqCst)
    }

    fn is_bonded(&self, _address: DeviceAddress) -> bool {
        self.bonded.load(Ordering::SeqCst)
    }

    fn connect(
        &self,
        _address: DeviceAddress,
        auto_connect: bool,
        events: RadioEventSink,
    ) -> Option<LinkHandle> {
        let link = if self.accepts("connect") {
            Some(LinkHandle(self.next_link.fetch_add(1, Ordering::SeqCst) + 1))
        } else {
            None
        };
        self.sinks.lock().expect("sinks lock").push(events);
        self.record(Call::Connect { auto_connect, link });
        link
    }

    fn disconnect(&self, link: LinkHandle) -> bool {
        self.record(Call::Disconnect(link));
        self.accepts("disconnect")
    }

    fn close(&self, link: LinkHandle) {
        self.record(Call::Close(link));
    }

    fn discover_services(&self, link: LinkHandle) -> bool {
        self.record(Call::DiscoverServices(link));
        self.accepts("discover_services")
    }

    fn read_characteristic(&self, _link: LinkHandle, characteristic: &CharacteristicId) -> bool {
        self.record(Call::Read(*characteristic));
        self.accepts("read")
    }

    fn write_characteristic(
        &self,
        _link: LinkHandle,
        characteristic: &CharacteristicId,
        value: &[u8],
        write_type: Option<WriteType>,
    ) -> bool {
        self.record(Call::Write(*characteristic, value.to_vec(), write_type));
        self.accepts("write")
    }

    fn set_notification(
        &self,
        _link: LinkHandle,
        characteristic: &CharacteristicId,
        enable: bool,
    ) -> bool {
        self.record(Call::SetNotification(*characteristic, enable));
        self.accepts("set_notification")
    }

    fn write_descriptor(
        &self,
        _link: LinkHandle,
        characteristic: &CharacteristicId,
        descriptor: Uuid,
        value: &[u8],
    ) -> bool {
        self.record(Call::WriteDescriptor(*characteristic, descriptor, value.to_vec()));
        self.accepts("write_descriptor")
    }

    fn read_rssi(&self, _link: LinkHandle) -> bool {
        self.record(Call::ReadRssi);
        self.accepts("read_rssi")
    }
}

// ============================================================================
// RECORDING LISTENER
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Seen {
    Connecting,
    Connected,
    ServicesDiscovered { count: usize, success: bool },
    Read { characteristic: CharacteristicId, value: Vec<u8>, success: bool, elapsed: Duration },
    Write { characteristic: CharacteristicId, success: bool, elapsed: Duration },
    SetNotification { characteristic: CharacteristicId, success: bool },
    Changed { characteristic: CharacteristicId, value: Vec<u8> },
    Rssi { rssi: i16, success: bool },
    Timeout { kind: OperationKind, timeout: Duration },
    Disconnected { status: GattStatus, reason: DisconnectReason },
}

#[derive(Default)]
pub struct RecordingListener {
    seen: Mutex<Vec<Seen>>,
    pub stay_connected_on_timeout: AtomicBool,
    pub remove_on_disconnect: AtomicBool,
    pub disconnect_after_read: AtomicBool,
}

impl RecordingListener {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn seen(&self) -> Vec<Seen> {
        self.seen.lock().expect("seen lock").clone()
    }

    pub fn count(&self, matches: impl Fn(&Seen) -> bool) -> usize {
        self.seen().iter().filter(|seen| matches(seen)).count()
    }

    pub fn disconnects(&self) -> Vec<(GattStatus, DisconnectReason)> {
        self.seen()
            .into_iter()
            .filter_map(|seen| match seen {
                Seen::Disconnected { status, reason } => Some((status, reason)),
                _ => None,
            })
            .collect()
    }

    fn push(&self, seen: Seen) {
        self.seen.lock().expect("seen lock").push(seen);
    }
}

impl GattListener for RecordingListener {
    fn on_connecting(&self, _session: &GattSession) -> LinkDecision {
        self.push(Seen::Connecting);
        LinkDecision::Keep
    }

    fn on_connected(&self, _session: &GattSession, _elapsed: Duration) -> LinkDecision {
        self.push(Seen::Connected);
        LinkDecision::Keep
    }

    fn on_services_discovered(
        &self,
        _session: &GattSession,
        services: &[GattService],
        success: bool,
        _elapsed: Duration,
    ) -> LinkDecision {
        self.push(Seen::ServicesDiscovered {
            count: services.len(),
            success,
        });
        LinkDecision::Keep
    }

    fn on_characteristic_read(
        &self,
        _session: &GattSession,
        characteristic: &CharacteristicId,
        value: &[u8],
        success: bool,
        elapsed: Duration,
    ) -> LinkDecision {
        self.push(Seen::Read {
            characteristic: *characteristic,
            value: value.to_vec(),
            success,
            elapsed,
        });
        if self.disconnect_after_read.load(Ordering::SeqCst) {
            LinkDecision::Disconnect
        } else {
            LinkDecision::Keep
        }
    }

    fn on_characteristic_write(
        &self,
        _session: &GattSession,
        characteristic: &CharacteristicId,
        success: bool,
        elapsed: Duration,
    ) -> LinkDecision {
        self.push(Seen::Write {
            characteristic: *characteristic,
            success,
            elapsed,
        });
        LinkDecision::Keep
    }

    fn on_characteristic_set_notification(
        &self,
        _session: &GattSession,
        characteristic: &CharacteristicId,
        success: bool,
        _elapsed: Duration,
    ) -> LinkDecision {
        self.push(Seen::SetNotification {
            characteristic: *characteristic,
            success,
        });
        LinkDecision::Keep
    }

    fn on_characteristic_changed(
        &self,
        _session: &GattSession,
        characteristic: &CharacteristicId,
        value: &[u8],
    ) -> LinkDecision {
        self.push(Seen::Changed {
            characteristic: *characteristic,
            value: value.to_vec(),
        });
        LinkDecision::Keep
    }

    fn on_read_remote_rssi(
        &self,
        _session: &GattSession,
        rssi: i16,
        success: bool,
        _elapsed: Duration,
    ) -> LinkDecision {
        self.push(Seen::Rssi { rssi, success });
        LinkDecision::Keep
    }

    fn on_operation_timeout(
        &self,
        _session: &GattSession,
        kind: OperationKind,
        timeout: Duration,
        _elapsed: Duration,
    ) -> TimeoutDecision {
        self.push(Seen::Timeout { kind, timeout });
        if self.stay_connected_on_timeout.load(Ordering::SeqCst) {
            TimeoutDecision::StayConnected
        } else {
            TimeoutDecision::Disconnect
        }
    }

    fn on_disconnected(
        &self,
        _session: &GattSession,
        status: GattStatus,
        reason: DisconnectReason,
        _elapsed: Duration,
    ) -> Retention {
        self.push(Seen::Disconnected { status, reason });
        if self.remove_on_disconnect.load(Ordering::SeqCst) {
            Retention::Remove
        } else {
            Retention::Keep
        }
    }
}

// ============================================================================
// HELPERS
// ============================================================================

pub fn address() -> DeviceAddress {
    "C0:FF:EE:00:00:01".parse().expect("address")
}

pub fn battery_level() -> CharacteristicId {
    CharacteristicId::new(uuids::BATTERY_SERVICE, uuids::BATTERY_LEVEL)
}

pub fn device_name() -> CharacteristicId {
    CharacteristicId::new(uuids::GENERIC_ACCESS, uuids::DEVICE_NAME)
}

pub fn services() -> Vec<GattService> {
    vec![
        GattService::new(uuids::GENERIC_ACCESS, vec![uuids::DEVICE_NAME]),
        GattService::new(uuids::BATTERY_SERVICE, vec![uuids::BATTERY_LEVEL]),
    ]
}

pub fn ms(value: u64) -> Duration {
    Duration::from_millis(value)
}

/// Let the dispatch task drain its queue
pub async fn settle() {
    tokio::time::sleep(ms(1)).await;
}

/// Session with a recording listener attached
pub fn session_with(radio: &Arc<FakeRadio>) -> (GattSession, Arc<RecordingListener>) {
    let session = GattSession::new(address(), radio.clone(), Default::default()).expect("session");
    let listener = RecordingListener::new();
    session.add_listener(listener.clone());
    (session, listener)
}

/// Drive a session through connect and discovery until it is ready
pub async fn connect_ready(session: &GattSession, radio: &FakeRadio) {
    session.connect(ConnectRequest::new()).expect("connect accepted");
    settle().await;
    radio.emit_connected();
    settle().await;
    // Unbonded settle delay
    tokio::time::sleep(ms(300)).await;
    radio.emit(RadioEvent::ServicesDiscovered {
        status: GattStatus::SUCCESS,
        services: services(),
    });
    settle().await;
    assert_eq!(session.state(), ConnectionState::Ready);
}
