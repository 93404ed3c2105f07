//! Request builders for session operations

use super::types::{CharacteristicId, NotificationMode, WriteType};
use std::fmt;
use std::time::Duration;

/// One-shot completion hook run on the session's dispatch task
pub type Callback = Box<dyn FnOnce() + Send + 'static>;

/// Timeout and completion hooks common to every operation
#[derive(Default)]
pub struct OperationOptions {
    pub(crate) timeout: Option<Duration>,
    pub(crate) on_success: Option<Callback>,
    pub(crate) on_failure: Option<Callback>,
}

impl OperationOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Override the configured operation timeout
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn on_success(mut self, callback: impl FnOnce() + Send + 'static) -> Self {
        self.on_success = Some(Box::new(callback));
        self
    }

    /// Runs on failure, timeout, or when the operation is superseded or cancelled
    pub fn on_failure(mut self, callback: impl FnOnce() + Send + 'static) -> Self {
        self.on_failure = Some(Box::new(callback));
        self
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }
}

impl fmt::Debug for OperationOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OperationOptions")
            .field("timeout", &self.timeout)
            .field("on_success", &self.on_success.is_some())
            .field("on_failure", &self.on_failure.is_some())
            .finish()
    }
}

/// Connect parameters. `timeout` is the overall deadline across retries.
#[derive(Debug, Default)]
pub struct ConnectRequest {
    pub(crate) auto_connect: bool,
    pub(crate) options: OperationOptions,
}

impl ConnectRequest {
    pub fn new() -> Self {
        Self::default()
    }

    /// Let the radio connect whenever the peripheral becomes available
    pub fn auto_connect(mut self, auto_connect: bool) -> Self {
        self.auto_connect = auto_connect;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.options = self.options.with_timeout(timeout);
        self
    }

    /// Runs once services have been discovered
    pub fn on_connected(mut self, callback: impl FnOnce() + Send + 'static) -> Self {
        self.options = self.options.on_success(callback);
        self
    }

    pub fn on_failure(mut self, callback: impl FnOnce() + Send + 'static) -> Self {
        self.options = self.options.on_failure(callback);
        self
    }
}

#[derive(Default)]
pub struct DisconnectRequest {
    pub(crate) timeout: Option<Duration>,
    pub(crate) on_disconnected: Option<Callback>,
}

impl DisconnectRequest {
    pub fn new() -> Self {
        Self::default()
    }

    /// How long to wait for the radio to confirm before forcing completion
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Runs after listeners have seen the disconnect
    pub fn on_disconnected(mut self, callback: impl FnOnce() + Send + 'static) -> Self {
        self.on_disconnected = Some(Box::new(callback));
        self
    }
}

impl fmt::Debug for DisconnectRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DisconnectRequest")
            .field("timeout", &self.timeout)
            .field("on_disconnected", &self.on_disconnected.is_some())
            .finish()
    }
}

#[derive(Debug)]
pub struct WriteRequest {
    pub(crate) characteristic: CharacteristicId,
    pub(crate) value: Vec<u8>,
    pub(crate) write_type: Option<WriteType>,
    pub(crate) options: OperationOptions,
}

impl WriteRequest {
    pub fn new(characteristic: CharacteristicId, value: impl Into<Vec<u8>>) -> Self {
        Self {
            characteristic,
            value: value.into(),
            write_type: None,
            options: OperationOptions::default(),
        }
    }

    /// Encode a string as UTF-8
    pub fn text(characteristic: CharacteristicId, value: &str) -> Self {
        Self::new(characteristic, value.as_bytes())
    }

    /// Encode an integer as little-endian bytes
    pub fn u32_le(characteristic: CharacteristicId, value: u32) -> Self {
        Self::new(characteristic, value.to_le_bytes())
    }

    pub fn write_type(mut self, write_type: WriteType) -> Self {
        self.write_type = Some(write_type);
        self
    }

    pub fn options(mut self, options: OperationOptions) -> Self {
        self.options = options;
        self
    }

    pub fn characteristic(&self) -> &CharacteristicId {
        &self.characteristic
    }

    pub fn value(&self) -> &[u8] {
        &self.value
    }
}

#[derive(Debug)]
pub struct NotificationRequest {
    pub(crate) characteristic: CharacteristicId,
    pub(crate) mode: NotificationMode,
    pub(crate) write_descriptor: bool,
    pub(crate) options: OperationOptions,
}

impl NotificationRequest {
    /// Also writes the configuration descriptor unless disabled with `local_only`
    pub fn new(characteristic: CharacteristicId, mode: NotificationMode) -> Self {
        Self {
            characteristic,
            mode,
            write_descriptor: true,
            options: OperationOptions::default(),
        }
    }

    /// Only toggle local delivery; leave the peripheral's descriptor untouched
    pub fn local_only(mut self) -> Self {
        self.write_descriptor = false;
        self
    }

    pub fn options(mut self, options: OperationOptions) -> Self {
        self.options = options;
        self
    }

    pub fn mode(&self) -> NotificationMode {
        self.mode
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn id() -> CharacteristicId {
        CharacteristicId::new(Uuid::from_u128(1), Uuid::from_u128(2))
    }

    #[test]
    fn test_write_request_encodings() {
        assert_eq!(WriteRequest::text(id(), "hi").value(), b"hi");
        assert_eq!(WriteRequest::u32_le(id(), 0x0102_0304).value(), &[4, 3, 2, 1]);
        let request = WriteRequest::new(id(), vec![9]).write_type(WriteType::WithoutResponse);
        assert_eq!(request.write_type, Some(WriteType::WithoutResponse));
    }

    #[test]
    fn test_notification_request_defaults_to_descriptor_write() {
        let request = NotificationRequest::new(id(), NotificationMode::Notify);
        assert!(request.write_descriptor);
        assert!(!request.local_only().write_descriptor);
    }

    #[test]
    fn test_options_builder() {
        let options = OperationOptions::new()
            .with_timeout(Duration::from_secs(2))
            .on_success(|| {});
        assert_eq!(options.timeout(), Some(Duration::from_secs(2)));
        assert!(options.on_success.is_some());
        assert!(options.on_failure.is_none());
    }
}
