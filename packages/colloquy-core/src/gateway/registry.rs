//! Connection admission and lifetime tracking for the gateway.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;

/// Tracks live bot connections and enforces the admission cap.
pub struct ClientRegistry {
    clients: DashMap<String, Instant>,
    max_clients: AtomicUsize,
    max_connection_time: Duration,
}

/// Admission verdict for a new connection.
#[derive(Debug, PartialEq, Eq)]
pub enum Admission {
    Accepted,
    /// Server is full; estimated wait in minutes until a slot frees up.
    Full { wait_minutes: u64 },
}

impl ClientRegistry {
    pub fn new(max_clients: usize, max_connection_time: Duration) -> Self {
        Self {
            clients: DashMap::new(),
            max_clients: AtomicUsize::new(max_clients),
            max_connection_time,
        }
    }

    /// Applies a client-supplied cap override. Only ever shrinks the cap so a
    /// misbehaving bot cannot widen the server's admission policy.
    pub fn tighten_max_clients(&self, requested: usize) {
        if requested == 0 {
            return;
        }
        let current = self.max_clients.load(Ordering::Relaxed);
        if requested < current {
            self.max_clients.store(requested, Ordering::Relaxed);
        }
    }

    pub fn max_connection_time(&self) -> Duration {
        self.max_connection_time
    }

    /// Registers `uid` if a slot is free.
    pub fn try_admit(&self, uid: &str) -> Admission {
        let cap = self.max_clients.load(Ordering::Relaxed);
        if self.clients.len() >= cap {
            return Admission::Full {
                wait_minutes: self.estimated_wait_minutes(),
            };
        }
        self.clients.insert(uid.to_string(), Instant::now());
        Admission::Accepted
    }

    pub fn remove(&self, uid: &str) {
        self.clients.remove(uid);
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }

    /// Minutes until the connection closest to its lifetime limit expires.
    fn estimated_wait_minutes(&self) -> u64 {
        let shortest_remaining = self
            .clients
            .iter()
            .map(|entry| {
                self.max_connection_time
                    .saturating_sub(entry.value().elapsed())
            })
            .min()
            .unwrap_or(Duration::ZERO);
        // Round up: a 30 s wait reads as 1 minute, not 0.
        shortest_remaining.as_secs().div_ceil(60)
    }
}

pub type SharedRegistry = Arc<ClientRegistry>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn admits_until_the_cap() {
        let reg = ClientRegistry::new(2, Duration::from_secs(600));
        assert_eq!(reg.try_admit("a"), Admission::Accepted);
        assert_eq!(reg.try_admit("b"), Admission::Accepted);
        match reg.try_admit("c") {
            Admission::Full { wait_minutes } => assert!(wait_minutes <= 10),
            other => panic!("expected Full, got {other:?}"),
        }
    }

    #[test]
    fn removal_frees_a_slot() {
        let reg = ClientRegistry::new(1, Duration::from_secs(600));
        assert_eq!(reg.try_admit("a"), Admission::Accepted);
        reg.remove("a");
        assert_eq!(reg.try_admit("b"), Admission::Accepted);
    }

    #[test]
    fn client_override_only_tightens() {
        let reg = ClientRegistry::new(4, Duration::from_secs(600));
        reg.tighten_max_clients(8);
        assert_eq!(reg.try_admit("a"), Admission::Accepted);
        reg.tighten_max_clients(1);
        assert!(matches!(reg.try_admit("b"), Admission::Full { .. }));
    }
}
