use std::{
    collections::HashMap,
    net::SocketAddr,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use tracing::info;

use crate::core::PeerKey;
use super::session::{PeerSession, SessionTimers, TickOutcome};

/// Peer table shared between the receive loop, the supervisor and handles
pub type SharedPeerTable = Arc<Mutex<PeerTable>>;

/// Locks the shared table; a panic elsewhere does not wedge the gateway
pub(crate) fn lock_table(table: &SharedPeerTable) -> MutexGuard<'_, PeerTable> {
    table.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Result of one supervisor sweep
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SweepReport {
    /// Sessions removed for silence
    pub expired: Vec<PeerKey>,
    /// Addresses owed a keepalive
    pub keepalives: Vec<SocketAddr>,
}

/// Bound repeaters, keyed by source address
#[derive(Default)]
pub struct PeerTable {
    sessions: HashMap<PeerKey, PeerSession>,
}

impl PeerTable {
    pub fn new() -> Self {
        PeerTable {
            sessions: HashMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub fn contains(&self, key: &PeerKey) -> bool {
        self.sessions.contains_key(key)
    }

    pub fn get(&self, key: &PeerKey) -> Option<&PeerSession> {
        self.sessions.get(key)
    }

    pub fn get_mut(&mut self, key: &PeerKey) -> Option<&mut PeerSession> {
        self.sessions.get_mut(key)
    }

    /// Adds a session unless one already exists for its key; returns whether it was added
    pub fn insert(&mut self, session: PeerSession) -> bool {
        let key = session.key();
        if self.sessions.contains_key(&key) {
            return false;
        }
        self.sessions.insert(key, session);
        true
    }

    /// Removes a session, closing its link; unknown keys are a no-op
    pub fn remove(&mut self, key: &PeerKey) -> Option<PeerSession> {
        let session = self.sessions.remove(key)?;
        session.link().close();
        Some(session)
    }

    /// Removes every session, closing their links
    pub fn drain(&mut self) -> Vec<PeerKey> {
        self.sessions
            .drain()
            .map(|(key, session)| {
                session.link().close();
                key
            })
            .collect()
    }

    pub fn keys(&self) -> impl Iterator<Item = &PeerKey> {
        self.sessions.keys()
    }

    /// Advances every session by one tick, expiring the dead ones
    pub fn sweep(&mut self, timers: &SessionTimers) -> SweepReport {
        let mut report = SweepReport::default();
        self.sessions.retain(|key, session| match session.tick(timers) {
            TickOutcome::Dead => {
                info!(peer = %key, callsign = %session.callsign(), "Peer timed out");
                session.link().close();
                report.expired.push(*key);
                false
            }
            TickOutcome::Keepalive => {
                report.keepalives.push(session.addr());
                true
            }
            TickOutcome::Idle => true,
        });
        report
    }
}
