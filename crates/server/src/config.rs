use chrono::FixedOffset;
use clap::ValueEnum;
use std::path::PathBuf;
use std::thread;
use std::time::Duration;

/// Duplicate-handling policy for incoming requests.
#[derive(Clone, Copy, PartialEq, Eq, Debug, ValueEnum)]
pub enum Semantic {
    /// No dedup cache. Retransmitted requests are re-executed.
    AtLeastOnce,
    /// Responses are cached per `(client, request id)` and replayed
    /// byte-for-byte when a duplicate arrives.
    AtMostOnce,
}

#[derive(Clone, Debug)]
pub struct Config {
    pub port: u16,
    pub semantic: Semantic,
    pub workers: usize,
    pub drop_rate: f64,
    /// Zone used for availability slot generation. Bookings themselves are
    /// absolute instants and do not depend on it.
    pub zone: FixedOffset,
    /// Directory for the JSON persistence files. `None` keeps all state in
    /// memory only.
    pub data_dir: Option<PathBuf>,
    pub cache_ttl: Duration,
    pub cache_client_limit: usize,
}

pub fn default_workers() -> usize {
    thread::available_parallelism().map(|n| n.get()).unwrap_or(4)
}

impl Config {
    pub fn new(port: u16, semantic: Semantic) -> Self {
        Self {
            port,
            semantic,
            workers: default_workers(),
            drop_rate: 0.0,
            // UTC+8, the service's deployment zone
            zone: FixedOffset::east_opt(8 * 3600).unwrap(),
            data_dir: Some(PathBuf::from("data")),
            cache_ttl: Duration::from_secs(300),
            cache_client_limit: 1_000,
        }
    }
}
