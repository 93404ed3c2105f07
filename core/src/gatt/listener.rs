//! Session observer interface

use super::session::GattSession;
use super::types::{CharacteristicId, DisconnectReason, GattService, GattStatus, OperationKind};
use std::time::Duration;

/// Returned by completion callbacks; any `Disconnect` tears the link down
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LinkDecision {
    #[default]
    Keep,
    Disconnect,
}

/// Returned by `on_operation_timeout`; any `StayConnected` suppresses the disconnect
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TimeoutDecision {
    #[default]
    Disconnect,
    StayConnected,
}

/// Returned by `on_disconnected`; `Remove` detaches the listener
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Retention {
    #[default]
    Keep,
    Remove,
}

/// Receives session events on the session's dispatch task.
///
/// Every method has a no-op default. Callbacks may call back into the
/// session (requests are queued behind the current event).
#[allow(unused_variables)]
pub trait GattListener: Send + Sync {
    fn on_connecting(&self, session: &GattSession) -> LinkDecision {
        LinkDecision::Keep
    }

    fn on_connected(&self, session: &GattSession, elapsed: Duration) -> LinkDecision {
        LinkDecision::Keep
    }

    fn on_services_discovered(
        &self,
        session: &GattSession,
        services: &[GattService],
        success: bool,
        elapsed: Duration,
    ) -> LinkDecision {
        LinkDecision::Keep
    }

    /// `value` is empty when `success` is false
    fn on_characteristic_read(
        &self,
        session: &GattSession,
        characteristic: &CharacteristicId,
        value: &[u8],
        success: bool,
        elapsed: Duration,
    ) -> LinkDecision {
        LinkDecision::Keep
    }

    fn on_characteristic_write(
        &self,
        session: &GattSession,
        characteristic: &CharacteristicId,
        success: bool,
        elapsed: Duration,
    ) -> LinkDecision {
        LinkDecision::Keep
    }

    fn on_characteristic_set_notification(
        &self,
        session: &GattSession,
        characteristic: &CharacteristicId,
        success: bool,
        elapsed: Duration,
    ) -> LinkDecision {
        LinkDecision::Keep
    }

    fn on_characteristic_changed(
        &self,
        session: &GattSession,
        characteristic: &CharacteristicId,
        value: &[u8],
    ) -> LinkDecision {
        LinkDecision::Keep
    }

    fn on_read_remote_rssi(
        &self,
        session: &GattSession,
        rssi: i16,
        success: bool,
        elapsed: Duration,
    ) -> LinkDecision {
        LinkDecision::Keep
    }

    fn on_operation_timeout(
        &self,
        session: &GattSession,
        kind: OperationKind,
        timeout: Duration,
        elapsed: Duration,
    ) -> TimeoutDecision {
        TimeoutDecision::Disconnect
    }

    fn on_disconnected(
        &self,
        session: &GattSession,
        status: GattStatus,
        reason: DisconnectReason,
        elapsed: Duration,
    ) -> Retention {
        Retention::Keep
    }
}
