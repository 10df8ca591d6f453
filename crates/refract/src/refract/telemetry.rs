use std::{
    sync::{
        Arc,
        atomic::{AtomicU64, AtomicUsize, Ordering},
    },
    time::{SystemTime, UNIX_EPOCH},
};

use anyhow::Context;
use dashmap::DashMap;
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

use crate::refract::session::{CloseReason, Session, SessionError, SessionInfo};

/// Installs a Prometheus recorder for the `metrics` crate and returns the handle the admin
/// endpoint renders from. Call once per process.
pub fn init_prometheus() -> anyhow::Result<PrometheusHandle> {
    PrometheusBuilder::new()
        .install_recorder()
        .context("metrics: install Prometheus recorder")
}

/// Live sessions by id.
#[derive(Debug)]
pub struct SessionRegistry {
    sessions: DashMap<String, Arc<Session>>,
    // Slots taken, reserved before the insert so concurrent adds cannot overshoot `max`.
    slots: AtomicUsize,
    max: usize,
}

impl SessionRegistry {
    /// `max == 0` means unbounded.
    pub fn new(max: usize) -> Self {
        Self {
            sessions: DashMap::new(),
            slots: AtomicUsize::new(0),
            max,
        }
    }

    pub fn try_add(&self, s: Arc<Session>) -> Result<(), SessionError> {
        let max = self.max;
        self.slots
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (max == 0 || n < max).then_some(n + 1)
            })
            .map_err(|_| SessionError::Capacity(max))?;
        if self.sessions.insert(s.id().to_string(), s).is_some() {
            // Same id registered twice: the slot is already counted.
            self.slots.fetch_sub(1, Ordering::AcqRel);
        }
        Ok(())
    }

    pub fn remove(&self, id: &str) {
        if self.sessions.remove(id).is_some() {
            self.slots.fetch_sub(1, Ordering::AcqRel);
        }
    }

    pub fn get(&self, id: &str) -> Option<Arc<Session>> {
        self.sessions.get(id).map(|e| e.value().clone())
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub fn snapshot(&self) -> Vec<SessionInfo> {
        let live: Vec<Arc<Session>> = self.sessions.iter().map(|e| e.value().clone()).collect();
        let mut out: Vec<SessionInfo> = live.iter().map(|s| s.info()).collect();
        out.sort_by(|a, b| a.started_at_unix_ms.cmp(&b.started_at_unix_ms));
        out
    }

    /// Closes every live session. Returns how many were closed by this call.
    pub fn close_all(&self, reason: CloseReason) -> usize {
        // Closing removes from the map, so collect before touching any session.
        let live: Vec<Arc<Session>> = self.sessions.iter().map(|e| e.value().clone()).collect();
        live.into_iter()
            .filter(|s| s.close(reason.clone()))
            .count()
    }
}

pub fn now_unix_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

pub fn new_session_id() -> String {
    static SEQ: AtomicU64 = AtomicU64::new(1);
    let n = SEQ.fetch_add(1, Ordering::Relaxed);
    format!("s{n}")
}

pub type SharedSessions = Arc<SessionRegistry>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::refract::{
        session::{ConnectionState, SessionParams},
        transfer::TransferCache,
        translate::PassthroughTranslator,
        version::ProtocolVersion,
    };

    fn open(reg: &Arc<SessionRegistry>, port: u16) -> Arc<Session> {
        Session::create(
            reg,
            format!("127.0.0.1:{port}").parse().unwrap(),
            SessionParams {
                client_version: ProtocolVersion::V1_20_3,
                pending_limit: 4,
                translator: Arc::new(PassthroughTranslator),
                transfers: Arc::new(TransferCache::new()),
            },
        )
        .unwrap()
    }

    #[test]
    fn ids_are_unique() {
        let a = new_session_id();
        let b = new_session_id();
        assert_ne!(a, b);
        assert!(a.starts_with('s'));
    }

    #[test]
    fn snapshot_is_ordered_by_start() {
        let reg = Arc::new(SessionRegistry::new(0));
        let first = open(&reg, 1);
        let second = open(&reg, 2);
        let snap = reg.snapshot();
        assert_eq!(snap.len(), 2);
        assert!(snap[0].started_at_unix_ms <= snap[1].started_at_unix_ms);
        assert!(reg.get(first.id()).is_some());
        assert!(reg.get(second.id()).is_some());
    }

    #[test]
    fn concurrent_adds_respect_the_limit() {
        let reg = Arc::new(SessionRegistry::new(4));
        let admitted: Vec<Arc<Session>> = std::thread::scope(|scope| {
            let handles: Vec<_> = (0..32u16)
                .map(|i| {
                    let reg = reg.clone();
                    scope.spawn(move || {
                        Session::create(
                            &reg,
                            format!("127.0.0.1:{}", 2000 + i).parse().unwrap(),
                            SessionParams {
                                client_version: ProtocolVersion::V1_20_3,
                                pending_limit: 4,
                                translator: Arc::new(PassthroughTranslator),
                                transfers: Arc::new(TransferCache::new()),
                            },
                        )
                        .ok()
                    })
                })
                .collect();
            handles
                .into_iter()
                .filter_map(|h| h.join().unwrap())
                .collect()
        });
        assert_eq!(admitted.len(), 4);
        assert_eq!(reg.len(), 4);

        admitted[0].close(CloseReason::ClientDisconnected);
        let _again = open(&reg, 3000);
        assert_eq!(reg.len(), 4);
    }

    #[test]
    fn close_all_empties_the_registry() {
        let reg = Arc::new(SessionRegistry::new(0));
        let sessions: Vec<_> = (1..=3).map(|p| open(&reg, p)).collect();
        sessions[0].close(CloseReason::ClientDisconnected);

        assert_eq!(reg.close_all(CloseReason::Shutdown), 2);
        assert!(reg.is_empty());
        assert!(sessions.iter().all(|s| s.state() == ConnectionState::Closed));
    }
}
