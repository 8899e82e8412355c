//! Authoritative connect state machine
//!
//! ```text
//! Disconnected -> Connecting -> Connected -> Disconnecting -> Disconnected
//!                 Connecting -> Disconnected      (failed before tunnel up)
//!                 Connecting -> Disconnecting     (cancelled mid-connect)
//!                 Connected  -> Connecting        (backend reconnecting)
//! ```
//!
//! Setting the current state again is a no-op and emits nothing. Any other
//! transition is a caller bug: it asserts in debug builds and is ignored in
//! release builds.

use crate::types::{ConnectError, ConnectState, DisconnectReason, LocationId};
use std::sync::{Mutex, MutexGuard};
use tracing::{debug, error};

/// Emitted once per actual state change
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectStateChange {
    pub state: ConnectState,
    pub reason: Option<DisconnectReason>,
    pub error: Option<ConnectError>,
    pub location: LocationId,
}

type Listener = Box<dyn Fn(&ConnectStateChange) + Send + Sync>;

struct Inner {
    state: ConnectState,
    reason: Option<DisconnectReason>,
    error: Option<ConnectError>,
    location: LocationId,
}

pub struct ConnectStateController {
    name: &'static str,
    inner: Mutex<Inner>,
    listener: Listener,
}

pub fn is_legal_transition(from: ConnectState, to: ConnectState) -> bool {
    use ConnectState::*;
    matches!(
        (from, to),
        (Disconnected, Connecting)
            | (Connecting, Connected)
            | (Connecting, Disconnected)
            | (Connecting, Disconnecting)
            | (Connected, Disconnecting)
            | (Connected, Connecting)
            | (Disconnecting, Disconnected)
    )
}

impl ConnectStateController {
    /// `listener` runs under the controller's lock, so it observes
    /// transitions in the exact order they were applied
    pub fn new<F>(name: &'static str, listener: F) -> Self
    where
        F: Fn(&ConnectStateChange) + Send + Sync + 'static,
    {
        Self {
            name,
            inner: Mutex::new(Inner {
                state: ConnectState::Disconnected,
                reason: None,
                error: None,
                location: LocationId::Empty,
            }),
            listener: Box::new(listener),
        }
    }

    pub fn set_connecting_state(&self, location: &LocationId) -> bool {
        self.transition(ConnectState::Connecting, |inner| {
            if location.is_valid() {
                inner.location = location.clone();
            }
            inner.reason = None;
            inner.error = None;
        })
    }

    pub fn set_connected_state(&self, location: &LocationId) -> bool {
        self.transition(ConnectState::Connected, |inner| {
            if location.is_valid() {
                inner.location = location.clone();
            }
        })
    }

    pub fn set_disconnecting_state(&self) -> bool {
        self.transition(ConnectState::Disconnecting, |_| {})
    }

    pub fn set_disconnected_state(
        &self,
        reason: DisconnectReason,
        error: Option<ConnectError>,
    ) -> bool {
        self.transition(ConnectState::Disconnected, |inner| {
            inner.reason = Some(reason);
            inner.error = error;
        })
    }

    pub fn current_state(&self) -> ConnectState {
        self.lock().state
    }

    pub fn location(&self) -> LocationId {
        self.lock().location.clone()
    }

    pub fn connect_error(&self) -> Option<ConnectError> {
        self.lock().error.clone()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn transition(&self, next: ConnectState, update: impl FnOnce(&mut Inner)) -> bool {
        let mut inner = self.lock();

        if inner.state == next {
            if next == ConnectState::Connecting || next == ConnectState::Connected {
                update(&mut inner);
            }
            return false;
        }

        if !is_legal_transition(inner.state, next) {
            error!(
                "[{}] illegal connect state transition {:?} -> {:?}",
                self.name, inner.state, next
            );
            debug_assert!(false, "illegal transition {:?} -> {:?}", inner.state, next);
            return false;
        }

        update(&mut inner);
        debug!("[{}] connect state {:?} -> {:?}", self.name, inner.state, next);
        inner.state = next;

        let change = ConnectStateChange {
            state: next,
            reason: inner.reason.filter(|_| next == ConnectState::Disconnected),
            error: inner.error.clone().filter(|_| next == ConnectState::Disconnected),
            location: inner.location.clone(),
        };
        (self.listener)(&change);
        true
    }
}
