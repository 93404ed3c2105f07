//! Value types shared by the session, the radio binding and listeners

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// The kind of request a session is waiting on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OperationKind {
    Connect,
    DiscoverServices,
    CharacteristicRead,
    CharacteristicWrite,
    CharacteristicSetNotification,
    ReadRemoteRssi,
}

impl OperationKind {
    /// Connect and discovery timeouts are retried until the connect deadline
    pub fn is_connect_phase(&self) -> bool {
        matches!(self, OperationKind::Connect | OperationKind::DiscoverServices)
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            OperationKind::Connect => "Connect",
            OperationKind::DiscoverServices => "DiscoverServices",
            OperationKind::CharacteristicRead => "CharacteristicRead",
            OperationKind::CharacteristicWrite => "CharacteristicWrite",
            OperationKind::CharacteristicSetNotification => "CharacteristicSetNotification",
            OperationKind::ReadRemoteRssi => "ReadRemoteRssi",
        };
        f.write_str(name)
    }
}

/// Why a session ended up disconnected
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DisconnectReason {
    ConnectFailed,
    SolicitedDisconnect,
    /// The radio never confirmed a requested disconnect; it was forced
    SolicitedDisconnectTimeout,
    UnsolicitedDisconnect,
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DisconnectReason::ConnectFailed => "ConnectFailed",
            DisconnectReason::SolicitedDisconnect => "SolicitedDisconnect",
            DisconnectReason::SolicitedDisconnectTimeout => "SolicitedDisconnectTimeout",
            DisconnectReason::UnsolicitedDisconnect => "UnsolicitedDisconnect",
        };
        f.write_str(name)
    }
}

/// Raw status code reported by the radio stack
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct GattStatus(pub i32);

impl GattStatus {
    pub const SUCCESS: GattStatus = GattStatus(0);
    /// Status attached to locally synthesized completions
    pub const UNKNOWN: GattStatus = GattStatus(-1);
    pub const ERROR: GattStatus = GattStatus(133);
    pub const FAILURE: GattStatus = GattStatus(257);

    pub fn is_success(&self) -> bool {
        *self == Self::SUCCESS
    }

    /// Human readable diagnosis for logs
    pub fn describe(&self) -> String {
        match self.0 {
            0 => "success".to_string(),
            -1 => "no status (synthesized)".to_string(),
            133 => "status 133 (too many connections, or a previous link was never closed)"
                .to_string(),
            257 => "status 257 (close raced a pending disconnect)".to_string(),
            other => format!("error status={}", other),
        }
    }
}

impl fmt::Display for GattStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Characteristic write mode; `None` on a request leaves the radio default
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum WriteType {
    WithResponse,
    WithoutResponse,
    Signed,
}

/// Value written to the client characteristic configuration descriptor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NotificationMode {
    Disable,
    Notify,
    Indicate,
}

impl NotificationMode {
    pub fn enables(&self) -> bool {
        !matches!(self, NotificationMode::Disable)
    }

    /// Little-endian CCCD value
    pub fn descriptor_value(&self) -> [u8; 2] {
        match self {
            NotificationMode::Disable => [0x00, 0x00],
            NotificationMode::Notify => [0x01, 0x00],
            NotificationMode::Indicate => [0x02, 0x00],
        }
    }
}

/// A characteristic addressed through its owning service
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CharacteristicId {
    pub service: Uuid,
    pub characteristic: Uuid,
}

impl CharacteristicId {
    pub fn new(service: Uuid, characteristic: Uuid) -> Self {
        Self {
            service,
            characteristic,
        }
    }
}

impl fmt::Display for CharacteristicId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.service, self.characteristic)
    }
}

/// A discovered primary service
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GattService {
    pub uuid: Uuid,
    pub characteristics: Vec<Uuid>,
}

impl GattService {
    pub fn new(uuid: Uuid, characteristics: Vec<Uuid>) -> Self {
        Self {
            uuid,
            characteristics,
        }
    }

    pub fn has_characteristic(&self, characteristic: &Uuid) -> bool {
        self.characteristics.contains(characteristic)
    }
}

/// Session lifecycle as seen by callers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    /// Link is up; waiting out the settle delay before discovery
    Connected,
    DiscoveringServices,
    Ready,
    Disconnecting,
}

impl ConnectionState {
    pub fn is_connected(&self) -> bool {
        matches!(
            self,
            ConnectionState::Connected
                | ConnectionState::DiscoveringServices
                | ConnectionState::Ready
        )
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Link state reported by the radio in a connection state change
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LinkState {
    Disconnected,
    Connecting,
    Connected,
    Disconnecting,
}
