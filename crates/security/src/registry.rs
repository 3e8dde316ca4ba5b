//! The set of authenticated connections, and the guard generation events
//! pass through.

use std::collections::HashSet;
use std::sync::{Mutex, PoisonError};

use elowen_core::ConnectionId;

/// Result of guarding a generation event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Access {
    Allowed,
    Denied { reason: String },
}

/// Connections that passed verification.
///
/// A connection is admitted once, after its token verifies, and removed when
/// it closes. Nothing outside the relay mutates it.
#[derive(Debug, Default)]
pub struct SessionRegistry {
    admitted: Mutex<HashSet<ConnectionId>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn admit(&self, connection: &ConnectionId) {
        self.lock().insert(connection.clone());
    }

    pub fn remove(&self, connection: &ConnectionId) -> bool {
        self.lock().remove(connection)
    }

    pub fn is_admitted(&self, connection: &ConnectionId) -> bool {
        self.lock().contains(connection)
    }

    /// Check a connection before any session is built for it.
    pub fn guard(&self, connection: &ConnectionId) -> Access {
        if self.is_admitted(connection) {
            Access::Allowed
        } else {
            Access::Denied {
                reason: "Not authenticated".into(),
            }
        }
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashSet<ConnectionId>> {
        self.admitted.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
