use crate::ttl::{Tracker, TtlKey};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::{Duration, Instant};
use tracing::debug;

pub type CacheKey = (SocketAddr, u32);

struct Entry {
    response: Vec<u8>,
    created: Instant,
    ttl_key: TtlKey,
}

/// At-most-once response cache: `(client endpoint, request id)` mapped to the
/// exact bytes that were sent, so a retransmitted request replays the original
/// response instead of re-executing.
///
/// Entries age out after `ttl`. The sweep runs inline, only once the number
/// of distinct client endpoints passes `client_limit`; until then stale
/// entries just fail the age check on lookup.
pub struct ResponseCache {
    ttl: Duration,
    client_limit: usize,
    clients: HashMap<SocketAddr, HashMap<u32, Entry>>,
    expiries: Tracker,
}

impl ResponseCache {
    pub fn new(ttl: Duration, client_limit: usize) -> Self {
        Self {
            ttl,
            client_limit,
            clients: HashMap::new(),
            expiries: Tracker::new(),
        }
    }

    pub fn lookup(&self, peer: SocketAddr, request_id: u32, now: Instant) -> Option<&[u8]> {
        let entry = self.clients.get(&peer)?.get(&request_id)?;
        if now.duration_since(entry.created) >= self.ttl {
            return None;
        }

        Some(&entry.response)
    }

    pub fn insert(&mut self, peer: SocketAddr, request_id: u32, response: Vec<u8>, now: Instant) {
        let requests = self.clients.entry(peer).or_default();

        // A stale entry may still sit here if no sweep ran since it aged
        // out. Its expiry handle must go with it or the tracker would later
        // evict the replacement.
        if let Some(old) = requests.remove(&request_id) {
            self.expiries.remove(old.ttl_key);
        }

        let ttl_key = self.expiries.add((peer, request_id), now + self.ttl);
        requests.insert(
            request_id,
            Entry {
                response,
                created: now,
                ttl_key,
            },
        );

        if self.clients.len() > self.client_limit {
            self.sweep(now);
        }
    }

    fn sweep(&mut self, now: Instant) {
        let expired = self.expiries.drain_expired(now);
        let dropped = expired.len();

        for (peer, request_id) in expired {
            if let Some(requests) = self.clients.get_mut(&peer) {
                requests.remove(&request_id);
                if requests.is_empty() {
                    self.clients.remove(&peer);
                }
            }
        }

        debug!(
            dropped,
            clients = self.clients.len(),
            "swept response cache"
        );
    }

    #[cfg(test)]
    fn client_count(&self) -> usize {
        self.clients.len()
    }
}
