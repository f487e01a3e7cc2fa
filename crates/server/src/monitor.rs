use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

#[derive(Clone, Copy, Debug)]
struct Subscription {
    peer: SocketAddr,
    expires_at: Instant,
}

/// Standing monitor registrations, keyed by facility name.
///
/// Expiry is lazy: entries are pruned whenever the notification path runs,
/// never by a background task. Repeat registrations from the same endpoint
/// are kept as separate entries; the earlier one simply ages out on its own
/// deadline.
#[derive(Default)]
pub struct MonitorRegistry {
    monitors: HashMap<String, Vec<Subscription>>,
}

impl MonitorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &mut self,
        facility: &str,
        peer: SocketAddr,
        duration: Duration,
        now: Instant,
    ) {
        self.monitors
            .entry(facility.to_string())
            .or_default()
            .push(Subscription {
                peer,
                expires_at: now + duration,
            });
    }

    /// Drops every subscription whose deadline has passed, across all
    /// facilities, and forgets facilities left with no subscribers.
    pub fn prune_expired(&mut self, now: Instant) {
        for subs in self.monitors.values_mut() {
            subs.retain(|s| now < s.expires_at);
        }
        self.monitors.retain(|_, subs| !subs.is_empty());
    }

    /// Live subscriber endpoints for one facility. Callers snapshot this
    /// under the registry lock and send outside it.
    pub fn subscribers(&mut self, facility: &str, now: Instant) -> Vec<SocketAddr> {
        self.prune_expired(now);
        self.monitors
            .get(facility)
            .map(|subs| subs.iter().map(|s| s.peer).collect())
            .unwrap_or_default()
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.monitors.values().map(Vec::len).sum()
    }
}
