use crate::cache::CacheKey;
use slab::Slab;
use std::collections::BTreeMap;
use std::num::NonZeroUsize;
use std::sync::LazyLock;
use std::time::Instant;

static EPOCH: LazyLock<Instant> = LazyLock::new(Instant::now);

fn millis_since_epoch(time: Instant) -> u64 {
    time.duration_since(*EPOCH).as_millis() as u64
}

struct Entry {
    key: CacheKey,
    expires_at: Instant,
}

/// Handle to one tracked expiry, held by the owning cache entry.
#[repr(transparent)]
pub struct TtlKey(NonZeroUsize);

impl TtlKey {
    fn from_slab_key(key: usize) -> Self {
        Self(NonZeroUsize::new(key + 1).unwrap())
    }

    fn to_slab_key(self) -> usize {
        self.0.get() - 1
    }
}

/// Expiry index over cache keys: a slab of entries bucketed by expiry
/// millisecond. Draining expired keys costs time proportional to what
/// actually expired, not to the cache size.
pub struct Tracker {
    entries: Slab<Entry>,
    by_time: BTreeMap<u64, Vec<usize>>,
}

impl Tracker {
    pub fn new() -> Self {
        Self {
            entries: Slab::new(),
            by_time: BTreeMap::new(),
        }
    }

    pub fn add(&mut self, key: CacheKey, expires_at: Instant) -> TtlKey {
        let group = millis_since_epoch(expires_at);
        let slab_key = self.entries.insert(Entry { key, expires_at });
        self.by_time.entry(group).or_default().push(slab_key);
        TtlKey::from_slab_key(slab_key)
    }

    /// Untracks an entry that is being replaced before it expired.
    pub fn remove(&mut self, key: TtlKey) {
        let slab_key = key.to_slab_key();
        let entry = self.entries.remove(slab_key);
        let group = millis_since_epoch(entry.expires_at);

        let bucket = self.by_time.get_mut(&group).expect("bucket exists");
        let pos = bucket
            .iter()
            .position(|&k| k == slab_key)
            .expect("entry in its bucket");
        bucket.swap_remove(pos);
        if bucket.is_empty() {
            self.by_time.remove(&group);
        }
    }

    /// Removes and returns every key whose deadline is at or before `now`.
    pub fn drain_expired(&mut self, now: Instant) -> Vec<CacheKey> {
        let cutoff = millis_since_epoch(now);

        let mut expired = Vec::new();
        while let Some(entry) = self.by_time.first_entry() {
            if *entry.key() > cutoff {
                break;
            }

            for slab_key in entry.remove() {
                expired.push(self.entries.remove(slab_key).key);
            }
        }

        expired
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::SocketAddr;
    use std::time::Duration;

    fn key(port: u16, id: u32) -> CacheKey {
        let addr: SocketAddr = format!("127.0.0.1:{port}").parse().unwrap();
        (addr, id)
    }

    #[test]
    fn drains_only_entries_past_the_cutoff() {
        let mut t = Tracker::new();
        let t0 = Instant::now();
        t.add(key(1, 1), t0 + Duration::from_secs(1));
        t.add(key(1, 2), t0 + Duration::from_secs(5));
        t.add(key(2, 1), t0 + Duration::from_secs(1));

        let drained = t.drain_expired(t0 + Duration::from_secs(2));
        assert_eq!(drained.len(), 2);
        assert!(drained.contains(&key(1, 1)));
        assert!(drained.contains(&key(2, 1)));
        assert_eq!(t.len(), 1);

        assert!(t.drain_expired(t0 + Duration::from_secs(2)).is_empty());
        assert_eq!(t.drain_expired(t0 + Duration::from_secs(10)), vec![key(1, 2)]);
    }

    #[test]
    fn removed_entries_are_not_drained() {
        let mut t = Tracker::new();
        let t0 = Instant::now();
        let handle = t.add(key(1, 1), t0 + Duration::from_secs(1));
        t.add(key(1, 2), t0 + Duration::from_secs(1));

        t.remove(handle);
        assert_eq!(t.drain_expired(t0 + Duration::from_secs(2)), vec![key(1, 2)]);
        assert_eq!(t.len(), 0);
    }
}
