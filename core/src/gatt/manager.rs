//! One session per peripheral address

use super::address::DeviceAddress;
use super::radio::RadioLink;
use super::request::DisconnectRequest;
use super::session::{GattSession, SessionError, SessionMap};
use crate::config::GattConfig;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info};

/// Creates sessions lazily and keeps exactly one per address.
///
/// Disconnecting a session does not remove it; only `release`, `close_all`
/// or [`GattSession::close`] do.
pub struct SessionRegistry {
    radio: Arc<dyn RadioLink>,
    config: GattConfig,
    sessions: Arc<SessionMap>,
}

impl SessionRegistry {
    pub fn new(radio: Arc<dyn RadioLink>, config: GattConfig) -> Self {
        Self {
            radio,
            config,
            sessions: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn config(&self) -> &GattConfig {
        &self.config
    }

    /// Existing session for `address`, or a new one
    pub fn get_or_create(&self, address: DeviceAddress) -> Result<GattSession, SessionError> {
        let mut sessions = self.sessions.lock();
        if let Some(session) = sessions.get(&address) {
            return Ok(session.clone());
        }
        let session = GattSession::spawn(
            address,
            Arc::clone(&self.radio),
            self.config.clone(),
            Some(Arc::downgrade(&self.sessions)),
        )?;
        debug!("Session registered: {}", address);
        sessions.insert(address, session.clone());
        Ok(session)
    }

    pub fn get(&self, address: DeviceAddress) -> Option<GattSession> {
        self.sessions.lock().get(&address).cloned()
    }

    pub fn contains(&self, address: DeviceAddress) -> bool {
        self.sessions.lock().contains_key(&address)
    }

    pub fn addresses(&self) -> Vec<DeviceAddress> {
        let mut addresses: Vec<_> = self.sessions.lock().keys().copied().collect();
        addresses.sort();
        addresses
    }

    pub fn len(&self) -> usize {
        self.sessions.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Forget `session` and disconnect it. Returns false if it was not registered here.
    pub fn release(&self, session: &GattSession) -> bool {
        let removed = {
            let mut sessions = self.sessions.lock();
            let registered = sessions
                .get(&session.address())
                .map_or(false, |existing| existing.ptr_eq(session));
            if registered {
                sessions.remove(&session.address())
            } else {
                None
            }
        };
        match removed {
            Some(session) => {
                debug!("Session released: {}", session.address());
                Self::disconnect_quietly(&session);
                true
            }
            None => false,
        }
    }

    /// Release every session
    pub fn close_all(&self) {
        let drained: Vec<GattSession> = {
            let mut sessions = self.sessions.lock();
            sessions.drain().map(|(_, session)| session).collect()
        };
        info!("Closing {} session(s)", drained.len());
        for session in &drained {
            Self::disconnect_quietly(session);
        }
    }

    fn disconnect_quietly(session: &GattSession) {
        if let Err(e) = session.disconnect(DisconnectRequest::default()) {
            debug!("{} release: {}", session.address(), e);
        }
    }
}
