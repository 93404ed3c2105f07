//! Connection session state machine
//!
//! A [`GattSession`] drives one peripheral through connect, service
//! discovery, characteristic operations and disconnect. Public methods only
//! validate and enqueue; all state changes, radio calls and listener
//! callbacks happen on the session's dispatch task, one command at a time.
//!
//! At most one operation is pending at any instant. Each pending operation
//! carries a timeout; connect-phase timeouts trigger a disconnect and
//! reconnect until the overall connect deadline has passed, every other
//! timeout is reported to listeners and ends in a disconnect unless a
//! listener asks to stay connected.

use super::address::DeviceAddress;
use super::listener::{GattListener, LinkDecision, Retention, TimeoutDecision};
use super::radio::{LinkHandle, RadioEvent, RadioEventSink, RadioLink};
use super::request::{
    Callback, ConnectRequest, DisconnectRequest, NotificationRequest, OperationOptions,
    WriteRequest,
};
use super::types::{
    CharacteristicId, ConnectionState, DisconnectReason, GattService, GattStatus, LinkState,
    OperationKind,
};
use super::uuids::CLIENT_CHARACTERISTIC_CONFIG;
use crate::config::GattConfig;
use crate::listeners::ListenerSet;
use crate::scheduler::{Fired, Scheduler};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Weak};
use std::time::Duration;
use thiserror::Error;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, error, info, trace, warn};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    #[error("Bluetooth adapter is disabled or unavailable")]
    RadioDisabled,
    #[error("Not connected")]
    NotConnected,
    #[error("Disconnect in progress")]
    Disconnecting,
    #[error("Invalid request: {0}")]
    InvalidRequest(String),
    #[error("No tokio runtime available to run the session")]
    NoRuntime,
    #[error("Session dispatch task has stopped")]
    DispatchStopped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) enum TimerKey {
    Operation,
    Disconnect,
    DiscoveryDelay,
}

/// Work item for the session dispatch task
pub(crate) enum Command {
    Connect(ConnectRequest),
    Disconnect(DisconnectRequest),
    DiscoverServices(OperationOptions),
    Read(CharacteristicId, OperationOptions),
    Write(WriteRequest),
    SetNotification(NotificationRequest),
    ReadRssi(OperationOptions),
    /// A deferred connect overtaken by a newer one
    Replaced(ConnectRequest),
    Radio { epoch: u64, event: RadioEvent },
    Timer(Fired<TimerKey>),
}

impl fmt::Debug for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Command::Connect(request) => f.debug_tuple("Connect").field(request).finish(),
            Command::Disconnect(request) => f.debug_tuple("Disconnect").field(request).finish(),
            Command::DiscoverServices(_) => f.write_str("DiscoverServices"),
            Command::Read(characteristic, _) => f.debug_tuple("Read").field(characteristic).finish(),
            Command::Write(request) => f.debug_tuple("Write").field(request.characteristic()).finish(),
            Command::SetNotification(request) => f
                .debug_tuple("SetNotification")
                .field(&request.characteristic)
                .field(&request.mode)
                .finish(),
            Command::ReadRssi(_) => f.write_str("ReadRssi"),
            Command::Replaced(request) => f.debug_tuple("Replaced").field(request).finish(),
            Command::Radio { epoch, event } => f
                .debug_struct("Radio")
                .field("epoch", epoch)
                .field("event", event)
                .finish(),
            Command::Timer(fired) => f.debug_tuple("Timer").field(fired).finish(),
        }
    }
}

/// Sessions owned by a registry, keyed by address
pub(crate) type SessionMap = Mutex<HashMap<DeviceAddress, GattSession>>;

#[derive(Default)]
struct Completion {
    on_success: Option<Callback>,
    on_failure: Option<Callback>,
}

impl Completion {
    fn finish(self, success: bool) {
        let callback = if success {
            self.on_success
        } else {
            self.on_failure
        };
        if let Some(callback) = callback {
            callback();
        }
    }
}

impl From<OperationOptions> for Completion {
    fn from(options: OperationOptions) -> Self {
        Self {
            on_success: options.on_success,
            on_failure: options.on_failure,
        }
    }
}

struct PendingOperation {
    kind: OperationKind,
    target: Option<CharacteristicId>,
    /// Origin for the connect deadline; the connect start for connect-phase work
    started_at: Instant,
    issued_at: Instant,
    timeout: Duration,
    completion: Completion,
}

impl PendingOperation {
    fn new(
        kind: OperationKind,
        target: Option<CharacteristicId>,
        started_at: Instant,
        timeout: Duration,
        completion: Completion,
    ) -> Self {
        Self {
            kind,
            target,
            started_at,
            issued_at: Instant::now(),
            timeout,
            completion,
        }
    }
}

struct ConnectAttempt {
    auto_connect: bool,
    external_timeout: Duration,
}

struct SessionCore {
    state: ConnectionState,
    /// Set only when a connect is issued and cleared only on disconnect completion
    link: Option<LinkHandle>,
    epoch: u64,
    disconnecting: bool,
    pending: Option<PendingOperation>,
    /// Present from connect request until services are discovered
    connect: Option<ConnectAttempt>,
    link_started_at: Option<Instant>,
    services: Vec<GattService>,
    awaiting_descriptor: Option<CharacteristicId>,
    after_disconnect: Option<Callback>,
    deferred_connect: Option<ConnectRequest>,
}

struct Shared {
    address: DeviceAddress,
    radio: Arc<dyn RadioLink>,
    config: GattConfig,
    listeners: ListenerSet<dyn GattListener>,
    core: Mutex<SessionCore>,
    timers: Scheduler<TimerKey, Command>,
    commands: mpsc::UnboundedSender<Command>,
    owner: Option<Weak<SessionMap>>,
}

impl Drop for Shared {
    fn drop(&mut self) {
        if let Some(link) = self.core.get_mut().link.take() {
            debug!("{} session dropped with an open link; closing", self.address);
            self.radio.disconnect(link);
            self.radio.close(link);
        }
    }
}

/// Handle to one peripheral's connection session. Cheap to clone.
#[derive(Clone)]
pub struct GattSession {
    shared: Arc<Shared>,
}

impl fmt::Debug for GattSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GattSession")
            .field("address", &self.shared.address)
            .field("state", &self.state())
            .finish()
    }
}

impl GattSession {
    /// Create a session and start its dispatch task on the current tokio runtime
    pub fn new(
        address: DeviceAddress,
        radio: Arc<dyn RadioLink>,
        config: GattConfig,
    ) -> Result<Self, SessionError> {
        Self::spawn(address, radio, config, None)
    }

    pub(crate) fn spawn(
        address: DeviceAddress,
        radio: Arc<dyn RadioLink>,
        config: GattConfig,
        owner: Option<Weak<SessionMap>>,
    ) -> Result<Self, SessionError> {
        config
            .validate()
            .map_err(|e| SessionError::InvalidRequest(e.to_string()))?;
        let runtime = Handle::try_current().map_err(|_| SessionError::NoRuntime)?;
        let (command_tx, mut command_rx) = mpsc::unbounded_channel::<Command>();

        let shared = Arc::new(Shared {
            address,
            radio,
            config,
            listeners: ListenerSet::new(format!("{}.listeners", address)),
            core: Mutex::new(SessionCore {
                state: ConnectionState::Disconnected,
                link: None,
                epoch: 0,
                disconnecting: false,
                pending: None,
                connect: None,
                link_started_at: None,
                services: Vec::new(),
                awaiting_descriptor: None,
                after_disconnect: None,
                deferred_connect: None,
            }),
            timers: Scheduler::new(runtime.clone(), command_tx.clone(), Command::Timer),
            commands: command_tx,
            owner,
        });

        let weak = Arc::downgrade(&shared);
        runtime.spawn(async move {
            while let Some(command) = command_rx.recv().await {
                let Some(shared) = weak.upgrade() else {
                    break;
                };
                trace!("{} dispatch {:?}", shared.address, command);
                GattSession { shared }.handle(command);
            }
        });

        debug!("{} session created", address);
        Ok(Self { shared })
    }

    // ========================================================================
    // OBSERVATION
    // ========================================================================

    pub fn address(&self) -> DeviceAddress {
        self.shared.address
    }

    pub fn config(&self) -> &GattConfig {
        &self.shared.config
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.core.lock().state
    }

    pub fn is_connected(&self) -> bool {
        self.state().is_connected()
    }

    pub fn is_disconnecting(&self) -> bool {
        self.shared.core.lock().disconnecting
    }

    /// Services from the last successful discovery on the current link
    pub fn services(&self) -> Vec<GattService> {
        self.shared.core.lock().services.clone()
    }

    pub fn pending_operation(&self) -> Option<OperationKind> {
        self.shared.core.lock().pending.as_ref().map(|p| p.kind)
    }

    pub fn add_listener(&self, listener: Arc<dyn GattListener>) -> bool {
        self.shared.listeners.attach(listener)
    }

    pub fn remove_listener(&self, listener: &Arc<dyn GattListener>) -> bool {
        self.shared.listeners.detach(listener)
    }

    pub fn listener_count(&self) -> usize {
        self.shared.listeners.len()
    }

    /// Whether both handles refer to the same session
    pub fn ptr_eq(&self, other: &GattSession) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }

    // ========================================================================
    // REQUESTS
    // ========================================================================

    /// Start connecting. Accepted without effect if already connecting or
    /// connected; deferred until completion if a disconnect is in progress.
    pub fn connect(&self, request: ConnectRequest) -> Result<(), SessionError> {
        self.check_enabled("connect")?;
        Self::check_timeout(request.options.timeout)?;
        {
            let mut core = self.shared.core.lock();
            if core.disconnecting {
                info!("{} connect: disconnect in progress; deferring", self.address());
                if let Some(replaced) = core.deferred_connect.replace(request) {
                    drop(core);
                    return self.enqueue(Command::Replaced(replaced));
                }
                return Ok(());
            }
            if core.state != ConnectionState::Disconnected {
                debug!(
                    "{} connect: already {}; ignoring",
                    self.address(),
                    core.state
                );
                return Ok(());
            }
            core.state = ConnectionState::Connecting;
        }
        self.enqueue(Command::Connect(request))
    }

    pub fn disconnect(&self, request: DisconnectRequest) -> Result<(), SessionError> {
        {
            let core = self.shared.core.lock();
            if core.state == ConnectionState::Disconnected {
                return Err(SessionError::NotConnected);
            }
            if core.disconnecting {
                return Err(SessionError::Disconnecting);
            }
        }
        self.enqueue(Command::Disconnect(request))
    }

    pub fn discover_services(&self, options: OperationOptions) -> Result<(), SessionError> {
        self.check_operation("discover_services", options.timeout)?;
        self.enqueue(Command::DiscoverServices(options))
    }

    pub fn read(
        &self,
        characteristic: CharacteristicId,
        options: OperationOptions,
    ) -> Result<(), SessionError> {
        self.check_operation("read", options.timeout)?;
        self.enqueue(Command::Read(characteristic, options))
    }

    pub fn write(&self, request: WriteRequest) -> Result<(), SessionError> {
        self.check_operation("write", request.options.timeout)?;
        self.enqueue(Command::Write(request))
    }

    pub fn set_notification(&self, request: NotificationRequest) -> Result<(), SessionError> {
        self.check_operation("set_notification", request.options.timeout)?;
        self.enqueue(Command::SetNotification(request))
    }

    pub fn read_rssi(&self, options: OperationOptions) -> Result<(), SessionError> {
        self.check_operation("read_rssi", options.timeout)?;
        self.enqueue(Command::ReadRssi(options))
    }

    /// Remove the session from its registry (if any) and disconnect
    pub fn close(&self) {
        if let Some(map) = self.shared.owner.as_ref().and_then(Weak::upgrade) {
            let mut sessions = map.lock();
            let owned = sessions
                .get(&self.address())
                .map_or(false, |session| session.ptr_eq(self));
            if owned {
                sessions.remove(&self.address());
            }
        }
        if let Err(e) = self.disconnect(DisconnectRequest::default()) {
            debug!("{} close: {}", self.address(), e);
        }
    }

    fn enqueue(&self, command: Command) -> Result<(), SessionError> {
        self.shared
            .commands
            .send(command)
            .map_err(|_| SessionError::DispatchStopped)
    }

    fn check_enabled(&self, caller: &str) -> Result<(), SessionError> {
        if self.shared.radio.is_enabled() {
            Ok(())
        } else {
            warn!("{} {}: adapter disabled; ignoring", self.address(), caller);
            Err(SessionError::RadioDisabled)
        }
    }

    fn check_timeout(timeout: Option<Duration>) -> Result<(), SessionError> {
        match timeout {
            Some(timeout) if timeout.is_zero() => Err(SessionError::InvalidRequest(
                "timeout must be greater than zero".to_string(),
            )),
            _ => Ok(()),
        }
    }

    fn check_operation(&self, caller: &str, timeout: Option<Duration>) -> Result<(), SessionError> {
        self.check_enabled(caller)?;
        Self::check_timeout(timeout)?;
        let core = self.shared.core.lock();
        if core.state == ConnectionState::Disconnected {
            warn!("{} {}: not connected; ignoring", self.address(), caller);
            return Err(SessionError::NotConnected);
        }
        if core.disconnecting {
            warn!("{} {}: disconnecting; ignoring", self.address(), caller);
            return Err(SessionError::Disconnecting);
        }
        Ok(())
    }

    // ========================================================================
    // DISPATCH TASK
    // ========================================================================

    fn handle(&self, command: Command) {
        match command {
            Command::Connect(request) => self.start_connect(request),
            Command::Disconnect(request) => self.begin_disconnect(request),
            Command::DiscoverServices(options) => self.run_discover_services(options),
            Command::Read(characteristic, options) => self.run_read(characteristic, options),
            Command::Write(request) => self.run_write(request),
            Command::SetNotification(request) => self.run_set_notification(request),
            Command::ReadRssi(options) => self.run_read_rssi(options),
            Command::Replaced(request) => {
                debug!("{} connect: deferred request replaced", self.address());
                Completion::from(request.options).finish(false);
            }
            Command::Radio { epoch, event } => self.on_radio_event(epoch, event),
            Command::Timer(fired) => self.on_timer(fired),
        }
    }

    /// Notify every listener; true if any asked to disconnect
    fn dispatch_link(&self, notify: impl Fn(&dyn GattListener) -> LinkDecision) -> bool {
        let traversal = self.shared.listeners.begin_traversal();
        let mut disconnect = false;
        for listener in traversal.iter() {
            if notify(listener.as_ref()) == LinkDecision::Disconnect {
                disconnect = true;
            }
        }
        disconnect
    }

    fn log_status(&self, caller: &str, status: GattStatus) {
        if !status.is_success() && status != GattStatus::UNKNOWN {
            error!("{} {}: {}", self.address(), caller, status.describe());
        }
    }

    fn request_disconnect(&self) {
        self.begin_disconnect(DisconnectRequest::default());
    }

    fn external_timeout(&self, core: &SessionCore) -> Duration {
        core.connect
            .as_ref()
            .map(|attempt| attempt.external_timeout)
            .unwrap_or_else(|| self.shared.config.connect_external_timeout())
    }

    /// Replace the pending operation and arm its timeout. Returns the link to
    /// issue the request on, or `None` when the link is gone or going away.
    fn begin_operation(
        &self,
        kind: OperationKind,
        target: Option<CharacteristicId>,
        options: OperationOptions,
    ) -> Option<LinkHandle> {
        let timeout = options
            .timeout
            .unwrap_or_else(|| self.shared.config.operation_timeout());
        let (link, superseded) = {
            let mut core = self.shared.core.lock();
            let superseded = core.pending.take();
            core.awaiting_descriptor = None;
            core.pending = Some(PendingOperation::new(
                kind,
                target,
                Instant::now(),
                timeout,
                options.into(),
            ));
            let link = if core.disconnecting { None } else { core.link };
            (link, superseded)
        };
        self.shared.timers.schedule(TimerKey::Operation, timeout);
        self.supersede(superseded, kind);
        if link.is_none() {
            warn!("{} {}: no usable link", self.address(), kind);
        }
        link
    }

    fn supersede(&self, previous: Option<PendingOperation>, by: OperationKind) {
        if let Some(previous) = previous {
            warn!(
                "{} {} superseded by {}; abandoning it",
                self.address(),
                previous.kind,
                by
            );
            previous.completion.finish(false);
        }
    }

    /// Take the pending operation if it matches a completion, cancelling its timeout
    fn take_pending(
        &self,
        kind: OperationKind,
        target: Option<&CharacteristicId>,
    ) -> Option<PendingOperation> {
        let pending = {
            let mut core = self.shared.core.lock();
            let matches = core.pending.as_ref().map_or(false, |pending| {
                pending.kind == kind && (target.is_none() || pending.target.as_ref() == target)
            });
            if !matches {
                warn!(
                    "{} {} completion without a matching pending operation; ignoring",
                    self.address(),
                    kind
                );
                return None;
            }
            core.pending.take()
        };
        self.shared.timers.cancel(&TimerKey::Operation);
        pending
    }

    /// Whether a characteristic can be addressed given the discovered services
    fn knows(&self, characteristic: &CharacteristicId) -> bool {
        let core = self.shared.core.lock();
        core.services.is_empty()
            || core.services.iter().any(|service| {
                service.uuid == characteristic.service
                    && service.has_characteristic(&characteristic.characteristic)
            })
    }

    // ------------------------------------------------------------------------
    // connect / disconnect
    // ------------------------------------------------------------------------

    fn start_connect(&self, request: ConnectRequest) {
        let ConnectRequest {
            auto_connect,
            options,
        } = request;
        if !self.shared.radio.is_enabled() {
            warn!("{} connect: adapter disabled; dropping", self.address());
            let mut core = self.shared.core.lock();
            if core.link.is_none() {
                core.state = ConnectionState::Disconnected;
            }
            drop(core);
            Completion::from(options).finish(false);
            return;
        }

        let started_at = Instant::now();
        {
            let mut core = self.shared.core.lock();
            if core.link.is_some() {
                debug!(
                    "{} connect: already {}; ignoring",
                    self.address(),
                    core.state
                );
                return;
            }
            core.connect = Some(ConnectAttempt {
                auto_connect,
                external_timeout: options
                    .timeout
                    .unwrap_or_else(|| self.shared.config.connect_external_timeout()),
            });
            core.link_started_at = Some(started_at);
        }
        info!(
            "{} connect(auto_connect={}, timeout={:?})",
            self.address(),
            auto_connect,
            options.timeout
        );
        self.connect_internal(started_at, options.into());
    }

    fn connect_internal(&self, started_at: Instant, completion: Completion) {
        let disconnect = self.dispatch_link(|l| l.on_connecting(self));

        let (auto_connect, epoch) = {
            let mut core = self.shared.core.lock();
            core.epoch += 1;
            core.state = ConnectionState::Connecting;
            let auto_connect = core
                .connect
                .as_ref()
                .map_or(false, |attempt| attempt.auto_connect);
            (auto_connect, core.epoch)
        };

        let sink = RadioEventSink::new(self.shared.commands.clone(), epoch);
        let link = self.shared.radio.connect(self.address(), auto_connect, sink);

        // Retried every internal timeout until the connect deadline passes
        let timeout = {
            let core = self.shared.core.lock();
            let remaining = self
                .external_timeout(&core)
                .saturating_sub(started_at.elapsed());
            self.shared.config.connect_internal_timeout().min(remaining)
        };
        let pending =
            PendingOperation::new(OperationKind::Connect, None, started_at, timeout, completion);
        let superseded = {
            let mut core = self.shared.core.lock();
            core.link = link;
            core.pending.replace(pending)
        };
        self.supersede(superseded, OperationKind::Connect);

        match link {
            Some(link) => {
                debug!("{} connect: issued on {:?}", self.address(), link);
                self.shared.timers.schedule(TimerKey::Operation, timeout);
                if disconnect {
                    self.request_disconnect();
                }
            }
            None => {
                warn!("{} connect: radio refused to connect", self.address());
                self.on_device_disconnected(GattStatus::UNKNOWN, DisconnectReason::ConnectFailed);
            }
        }
    }

    /// Restart the connect cycle if a connect-phase operation is pending and
    /// the connect deadline has not passed. Returns true if reconnecting.
    fn reconnect_if_connecting(&self) -> bool {
        let pending = {
            let mut core = self.shared.core.lock();
            let external_timeout = self.external_timeout(&core);
            let eligible = core.pending.as_ref().map_or(false, |pending| {
                pending.kind.is_connect_phase() && pending.started_at.elapsed() < external_timeout
            });
            if !eligible {
                return false;
            }
            core.pending.take()
        };
        self.shared.timers.cancel(&TimerKey::Operation);
        if let Some(pending) = pending {
            self.reconnect(pending);
        }
        true
    }

    fn reconnect(&self, pending: PendingOperation) {
        info!(
            "{} reconnecting after {:?} ({} pending)",
            self.address(),
            pending.started_at.elapsed(),
            pending.kind
        );
        let link = {
            let mut core = self.shared.core.lock();
            core.services.clear();
            if core.connect.is_none() {
                core.connect = Some(ConnectAttempt {
                    auto_connect: false,
                    external_timeout: self.shared.config.connect_external_timeout(),
                });
            }
            core.link.take()
        };
        self.shared.timers.cancel(&TimerKey::DiscoveryDelay);
        if let Some(link) = link {
            self.shared.radio.disconnect(link);
            self.shared.radio.close(link);
        }
        self.connect_internal(pending.started_at, pending.completion);
    }

    fn begin_disconnect(&self, request: DisconnectRequest) {
        let DisconnectRequest {
            timeout,
            on_disconnected,
        } = request;
        let (link, pending) = {
            let mut core = self.shared.core.lock();
            let Some(link) = core.link else {
                debug!("{} disconnect: no link; ignoring", self.address());
                drop(core);
                if let Some(callback) = on_disconnected {
                    callback();
                }
                return;
            };
            if core.disconnecting {
                debug!("{} disconnect: already disconnecting; ignoring", self.address());
                return;
            }
            core.disconnecting = true;
            core.state = ConnectionState::Disconnecting;
            core.awaiting_descriptor = None;
            core.after_disconnect = on_disconnected;
            (link, core.pending.take())
        };
        info!("{} disconnect", self.address());
        self.shared.timers.cancel(&TimerKey::Operation);
        self.shared.timers.cancel(&TimerKey::DiscoveryDelay);
        if let Some(pending) = pending {
            debug!("{} disconnect: cancelling pending {}", self.address(), pending.kind);
            pending.completion.finish(false);
        }

        if self.shared.radio.disconnect(link) {
            // Completion is not always reported by the radio
            let timeout = timeout.unwrap_or_else(|| self.shared.config.disconnect_timeout());
            self.shared.timers.schedule(TimerKey::Disconnect, timeout);
        } else {
            self.on_device_disconnected(GattStatus::UNKNOWN, DisconnectReason::SolicitedDisconnect);
        }
    }

    /// Single completion path for every kind of disconnect
    fn on_device_disconnected(&self, status: GattStatus, reason: DisconnectReason) {
        let (link, pending, after, deferred, elapsed) = {
            let mut core = self.shared.core.lock();
            if core.link.is_none() && core.state == ConnectionState::Disconnected {
                debug!("{} disconnected: already disconnected; ignoring", self.address());
                return;
            }
            let link = core.link.take();
            core.state = ConnectionState::Disconnected;
            core.disconnecting = false;
            core.awaiting_descriptor = None;
            core.services.clear();
            core.connect = None;
            let elapsed = core
                .link_started_at
                .take()
                .map(|started_at| started_at.elapsed())
                .unwrap_or_default();
            (
                link,
                core.pending.take(),
                core.after_disconnect.take(),
                core.deferred_connect.take(),
                elapsed,
            )
        };
        self.shared.timers.cancel_all();
        self.log_status("disconnected", status);
        if let Some(link) = link {
            self.shared.radio.close(link);
        }
        info!(
            "{} disconnected: reason={}, status={}, elapsed={:?}",
            self.address(),
            reason,
            status,
            elapsed
        );

        {
            let traversal = self.shared.listeners.begin_traversal();
            for listener in traversal.iter() {
                if listener.on_disconnected(self, status, reason, elapsed) == Retention::Remove {
                    self.shared.listeners.detach(listener);
                }
            }
        }

        if let Some(pending) = pending {
            pending.completion.finish(false);
        }
        if let Some(after) = after {
            after();
        }
        if let Some(request) = deferred {
            info!("{} running deferred connect", self.address());
            self.start_connect(request);
        }
    }

    fn on_connection_state_changed(&self, status: GattStatus, state: LinkState) {
        debug!(
            "{} connection state changed: status={}, state={:?}",
            self.address(),
            status,
            state
        );
        if status.is_success() && state == LinkState::Connected {
            let elapsed = {
                let mut core = self.shared.core.lock();
                if core.state != ConnectionState::Connecting {
                    debug!("{} connected while {}; ignoring", self.address(), core.state);
                    return;
                }
                core.state = ConnectionState::Connected;
                core.link_started_at
                    .map(|started_at| started_at.elapsed())
                    .unwrap_or_default()
            };
            let bonded = self.shared.radio.is_bonded(self.address());
            let delay = self.shared.config.discovery_delay(bonded);
            info!(
                "{} connected after {:?}; discovering services in {:?}",
                self.address(),
                elapsed,
                delay
            );
            self.shared.timers.schedule(TimerKey::DiscoveryDelay, delay);
            if self.dispatch_link(|l| l.on_connected(self, elapsed)) {
                self.request_disconnect();
            }
            return;
        }

        self.log_status("connection state changed", status);
        if state != LinkState::Disconnected {
            warn!(
                "{} unexpected link state {:?}; treating as lost",
                self.address(),
                state
            );
        }

        if self.shared.core.lock().disconnecting {
            self.on_device_disconnected(status, DisconnectReason::SolicitedDisconnect);
            return;
        }
        if self.reconnect_if_connecting() {
            return;
        }
        let reason = if self.shared.core.lock().connect.is_some() {
            DisconnectReason::ConnectFailed
        } else {
            DisconnectReason::UnsolicitedDisconnect
        };
        self.on_device_disconnected(status, reason);
    }

    // ------------------------------------------------------------------------
    // timers
    // ------------------------------------------------------------------------

    fn on_timer(&self, fired: Fired<TimerKey>) {
        if !self.shared.timers.claim(&fired) {
            return;
        }
        match fired.key {
            TimerKey::Operation => self.on_operation_timeout(),
            TimerKey::Disconnect => {
                warn!("{} disconnect was not confirmed; forcing", self.address());
                self.on_device_disconnected(
                    GattStatus::UNKNOWN,
                    DisconnectReason::SolicitedDisconnectTimeout,
                );
            }
            TimerKey::DiscoveryDelay => self.discover_after_connect(),
        }
    }

    fn on_operation_timeout(&self) {
        if self.reconnect_if_connecting() {
            return;
        }
        let (pending, connecting) = {
            let mut core = self.shared.core.lock();
            let pending = core.pending.take();
            if pending.as_ref().map(|p| p.kind) == Some(OperationKind::CharacteristicSetNotification)
            {
                core.awaiting_descriptor = None;
            }
            (pending, core.connect.is_some())
        };
        let Some(pending) = pending else {
            return;
        };
        let elapsed = pending.started_at.elapsed();
        warn!(
            "{} {} timed out after {:?}",
            self.address(),
            pending.kind,
            elapsed
        );

        let mut stay_connected = false;
        {
            let traversal = self.shared.listeners.begin_traversal();
            for listener in traversal.iter() {
                let decision = listener.on_operation_timeout(self, pending.kind, pending.timeout, elapsed);
                if decision == TimeoutDecision::StayConnected {
                    stay_connected = true;
                }
            }
        }
        let connect_exhausted = pending.kind.is_connect_phase() && connecting;
        pending.completion.finish(false);

        if connect_exhausted {
            warn!("{} connect deadline passed; giving up", self.address());
            let link = self.shared.core.lock().link;
            if let Some(link) = link {
                self.shared.radio.disconnect(link);
            }
            self.on_device_disconnected(GattStatus::UNKNOWN, DisconnectReason::ConnectFailed);
        } else if !stay_connected {
            self.request_disconnect();
        }
    }

    // ------------------------------------------------------------------------
    // operations
    // ------------------------------------------------------------------------

    fn discover_after_connect(&self) {
        let (link, superseded) = {
            let mut core = self.shared.core.lock();
            let Some(link) = core.link else {
                return;
            };
            if core.state != ConnectionState::Connected {
                return;
            }
            core.state = ConnectionState::DiscoveringServices;
            let (started_at, completion, superseded) = match core.pending.take() {
                Some(pending) if pending.kind == OperationKind::Connect => {
                    (pending.started_at, pending.completion, None)
                }
                other => (
                    core.link_started_at.unwrap_or_else(Instant::now),
                    Completion::default(),
                    other,
                ),
            };
            core.pending = Some(PendingOperation::new(
                OperationKind::DiscoverServices,
                None,
                started_at,
                self.shared.config.operation_timeout(),
                completion,
            ));
            (link, superseded)
        };
        self.shared
            .timers
            .schedule(TimerKey::Operation, self.shared.config.operation_timeout());
        self.supersede(superseded, OperationKind::DiscoverServices);

        debug!("{} discovering services", self.address());
        if !self.shared.radio.discover_services(link) {
            warn!("{} discover_services: radio rejected request", self.address());
            self.on_services_discovered(GattStatus::UNKNOWN, Vec::new());
        }
    }

    fn run_discover_services(&self, options: OperationOptions) {
        let link = self.begin_operation(OperationKind::DiscoverServices, None, options);
        if let Some(link) = link {
            {
                let mut core = self.shared.core.lock();
                if matches!(core.state, ConnectionState::Connected | ConnectionState::Ready) {
                    core.state = ConnectionState::DiscoveringServices;
                }
            }
            if self.shared.radio.discover_services(link) {
                return;
            }
            warn!("{} discover_services: radio rejected request", self.address());
        }
        self.on_services_discovered(GattStatus::UNKNOWN, Vec::new());
    }

    fn on_services_discovered(&self, status: GattStatus, services: Vec<GattService>) {
        let Some(pending) = self.take_pending(OperationKind::DiscoverServices, None) else {
            return;
        };
        self.log_status("services discovered", status);
        let success = status.is_success();
        let services = if success { services } else { Vec::new() };
        {
            let mut core = self.shared.core.lock();
            if success && !core.disconnecting {
                core.services = services.clone();
                core.connect = None;
                core.state = ConnectionState::Ready;
            }
        }
        let elapsed = pending.issued_at.elapsed();
        info!(
            "{} services discovered: success={}, count={}, elapsed={:?}",
            self.address(),
            success,
            services.len(),
            elapsed
        );

        let disconnect =
            self.dispatch_link(|l| l.on_services_discovered(self, &services, success, elapsed));
        pending.completion.finish(success);
        if !success || disconnect {
            self.request_disconnect();
        }
    }

    fn run_read(&self, characteristic: CharacteristicId, options: OperationOptions) {
        let kind = OperationKind::CharacteristicRead;
        if let Some(link) = self.begin_operation(kind, Some(characteristic), options) {
            if !self.knows(&characteristic) {
                warn!("{} read: {} not found in services", self.address(), characteristic);
            } else if self.shared.radio.read_characteristic(link, &characteristic) {
                return;
            } else {
                warn!("{} read: radio rejected request for {}", self.address(), characteristic);
            }
        }
        self.on_characteristic_read(characteristic, GattStatus::UNKNOWN, Vec::new());
    }

    fn on_characteristic_read(&self, characteristic: CharacteristicId, status: GattStatus, value: Vec<u8>) {
        let Some(pending) =
            self.take_pending(OperationKind::CharacteristicRead, Some(&characteristic))
        else {
            return;
        };
        self.log_status("characteristic read", status);
        let success = status.is_success();
        let value = if success { value } else { Vec::new() };
        let elapsed = pending.issued_at.elapsed();
        debug!(
            "{} read {}: success={}, {} bytes",
            self.address(),
            characteristic,
            success,
            value.len()
        );

        let disconnect = self.dispatch_link(|l| {
            l.on_characteristic_read(self, &characteristic, &value, success, elapsed)
        });
        pending.completion.finish(success);
        if !success || disconnect {
            self.request_disconnect();
        }
    }

    fn run_write(&self, request: WriteRequest) {
        let WriteRequest {
            characteristic,
            value,
            write_type,
            options,
        } = request;
        let kind = OperationKind::CharacteristicWrite;
        if let Some(link) = self.begin_operation(kind, Some(characteristic), options) {
            if !self.knows(&characteristic) {
                warn!("{} write: {} not found in services", self.address(), characteristic);
            } else if self
                .shared
                .radio
                .write_characteristic(link, &characteristic, &value, write_type)
            {
                return;
            } else {
                warn!("{} write: radio rejected request for {}", self.address(), characteristic);
            }
        }
        self.on_characteristic_write(characteristic, GattStatus::UNKNOWN);
    }

    fn on_characteristic_write(&self, characteristic: CharacteristicId, status: GattStatus) {
        let Some(pending) =
            self.take_pending(OperationKind::CharacteristicWrite, Some(&characteristic))
        else {
            return;
        };
        self.log_status("characteristic write", status);
        let success = status.is_success();
        let elapsed = pending.issued_at.elapsed();
        debug!("{} write {}: success={}", self.address(), characteristic, success);

        let disconnect =
            self.dispatch_link(|l| l.on_characteristic_write(self, &characteristic, success, elapsed));
        pending.completion.finish(success);
        if !success || disconnect {
            self.request_disconnect();
        }
    }

    fn run_set_notification(&self, request: NotificationRequest) {
        let NotificationRequest {
            characteristic,
            mode,
            write_descriptor,
            options,
        } = request;
        let kind = OperationKind::CharacteristicSetNotification;
        let Some(link) = self.begin_operation(kind, Some(characteristic), options) else {
            return self.on_characteristic_set_notification(characteristic, GattStatus::UNKNOWN);
        };
        if !self.knows(&characteristic) {
            warn!(
                "{} set_notification: {} not found in services",
                self.address(),
                characteristic
            );
            return self.on_characteristic_set_notification(characteristic, GattStatus::UNKNOWN);
        }
        if !self
            .shared
            .radio
            .set_notification(link, &characteristic, mode.enables())
        {
            warn!(
                "{} set_notification({:?}): radio rejected request for {}",
                self.address(),
                mode,
                characteristic
            );
            return self.on_characteristic_set_notification(characteristic, GattStatus::UNKNOWN);
        }
        if !write_descriptor {
            return self.on_characteristic_set_notification(characteristic, GattStatus::SUCCESS);
        }

        self.shared.core.lock().awaiting_descriptor = Some(characteristic);
        let value = mode.descriptor_value();
        if !self.shared.radio.write_descriptor(
            link,
            &characteristic,
            CLIENT_CHARACTERISTIC_CONFIG,
            &value,
        ) {
            warn!(
                "{} set_notification: descriptor write rejected for {}",
                self.address(),
                characteristic
            );
            self.shared.core.lock().awaiting_descriptor = None;
            self.on_characteristic_set_notification(characteristic, GattStatus::UNKNOWN);
        }
    }

    fn on_descriptor_write(&self, characteristic: CharacteristicId, descriptor: uuid::Uuid, status: GattStatus) {
        {
            let mut core = self.shared.core.lock();
            if descriptor != CLIENT_CHARACTERISTIC_CONFIG
                || core.awaiting_descriptor != Some(characteristic)
            {
                trace!(
                    "{} descriptor write {} for {} not awaited; ignoring",
                    self.address(),
                    descriptor,
                    characteristic
                );
                return;
            }
            core.awaiting_descriptor = None;
        }
        self.on_characteristic_set_notification(characteristic, status);
    }

    fn on_characteristic_set_notification(&self, characteristic: CharacteristicId, status: GattStatus) {
        let Some(pending) = self.take_pending(
            OperationKind::CharacteristicSetNotification,
            Some(&characteristic),
        ) else {
            return;
        };
        self.log_status("set notification", status);
        let success = status.is_success();
        let elapsed = pending.issued_at.elapsed();
        debug!(
            "{} set notification {}: success={}",
            self.address(),
            characteristic,
            success
        );

        let disconnect = self.dispatch_link(|l| {
            l.on_characteristic_set_notification(self, &characteristic, success, elapsed)
        });
        pending.completion.finish(success);
        if !success || disconnect {
            self.request_disconnect();
        }
    }

    fn run_read_rssi(&self, options: OperationOptions) {
        if let Some(link) = self.begin_operation(OperationKind::ReadRemoteRssi, None, options) {
            if self.shared.radio.read_rssi(link) {
                return;
            }
            warn!("{} read_rssi: radio rejected request", self.address());
        }
        self.on_rssi_read(0, GattStatus::UNKNOWN);
    }

    fn on_rssi_read(&self, rssi: i16, status: GattStatus) {
        let Some(pending) = self.take_pending(OperationKind::ReadRemoteRssi, None) else {
            return;
        };
        self.log_status("read rssi", status);
        let success = status.is_success();
        let elapsed = pending.issued_at.elapsed();
        debug!("{} rssi={} success={}", self.address(), rssi, success);

        let disconnect = self.dispatch_link(|l| l.on_read_remote_rssi(self, rssi, success, elapsed));
        pending.completion.finish(success);
        if !success || disconnect {
            self.request_disconnect();
        }
    }

    fn on_characteristic_changed(&self, characteristic: CharacteristicId, value: Vec<u8>) {
        trace!(
            "{} {} changed: {} bytes",
            self.address(),
            characteristic,
            value.len()
        );
        if self.dispatch_link(|l| l.on_characteristic_changed(self, &characteristic, &value)) {
            self.request_disconnect();
        }
    }

    fn on_radio_event(&self, epoch: u64, event: RadioEvent) {
        {
            let core = self.shared.core.lock();
            if core.epoch != epoch || core.link.is_none() {
                trace!(
                    "{} stale radio event (epoch {} != {}); dropping {:?}",
                    self.address(),
                    epoch,
                    core.epoch,
                    event
                );
                return;
            }
        }
        match event {
            RadioEvent::ConnectionStateChanged { status, state } => {
                self.on_connection_state_changed(status, state)
            }
            RadioEvent::ServicesDiscovered { status, services } => {
                self.on_services_discovered(status, services)
            }
            RadioEvent::CharacteristicRead {
                characteristic,
                status,
                value,
            } => self.on_characteristic_read(characteristic, status, value),
            RadioEvent::CharacteristicWrite {
                characteristic,
                status,
            } => self.on_characteristic_write(characteristic, status),
            RadioEvent::DescriptorWrite {
                characteristic,
                descriptor,
                status,
            } => self.on_descriptor_write(characteristic, descriptor, status),
            RadioEvent::CharacteristicChanged {
                characteristic,
                value,
            } => self.on_characteristic_changed(characteristic, value),
            RadioEvent::RssiRead { rssi, status } => self.on_rssi_read(rssi, status),
        }
    }
}
