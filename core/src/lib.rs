// gattlink core: BLE GATT client sessions and expiring registries
#![allow(clippy::empty_line_after_doc_comments)]
//
// Turns an event-driven, unreliable radio API into timeout-bounded,
// listener-driven sessions, one operation at a time.

pub mod config;
pub mod expiring;
pub mod gatt;
pub mod listeners;
pub mod scheduler;

use thiserror::Error;

pub use config::{ConfigError, GattConfig, RegistryConfig, Settings};
pub use expiring::{
    EntryInfo, ExpiringRegistry, ExpiryDecision, PutOutcome, RegistryError, RegistryListener,
    ValuesCursor,
};
pub use gatt::{
    AddressError, CharacteristicId, ConnectRequest, ConnectionState, DeviceAddress,
    DisconnectReason, DisconnectRequest, GattListener, GattService, GattSession, GattStatus,
    LinkDecision, LinkHandle, LinkState, NotificationMode, NotificationRequest, OperationKind,
    OperationOptions, RadioEvent, RadioEventSink, RadioLink, Retention, SessionError,
    SessionRegistry, TimeoutDecision, WriteRequest, WriteType,
};
pub use listeners::{ListenerSet, Traversal};

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Debug, Error)]
pub enum GattLinkError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error(transparent)]
    Session(#[from] SessionError),
    #[error(transparent)]
    Address(#[from] AddressError),
    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<anyhow::Error> for GattLinkError {
    fn from(err: anyhow::Error) -> Self {
        GattLinkError::Internal(err.to_string())
    }
}

// ============================================================================
// LOGGING
// ============================================================================

/// Install a `tracing` subscriber filtered by `RUST_LOG`, falling back to
/// `default_filter`. Safe to call more than once.
pub fn init_logging(default_filter: &str) {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_filter)),
        )
        .try_init();
}
