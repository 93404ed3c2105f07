//! GATT client: per-peripheral sessions over an abstract radio

pub mod address;
pub mod listener;
pub mod manager;
pub mod radio;
pub mod request;
pub mod session;
pub mod types;
pub mod uuids;

pub use address::{AddressError, DeviceAddress};
pub use listener::{GattListener, LinkDecision, Retention, TimeoutDecision};
pub use manager::SessionRegistry;
pub use radio::{LinkHandle, RadioEvent, RadioEventSink, RadioLink};
pub use request::{
    Callback, ConnectRequest, DisconnectRequest, NotificationRequest, OperationOptions,
    WriteRequest,
};
pub use session::{GattSession, SessionError};
pub use types::{
    CharacteristicId, ConnectionState, DisconnectReason, GattService, GattStatus, LinkState,
    NotificationMode, OperationKind, WriteType,
};
