use crate::cache::ResponseCache;
use crate::config::{Config, Semantic};
use crate::dispatch::Dispatcher;
use crate::persist::{JsonStorage, Storage};
use crate::store::BookingStore;
use anyhow::{Context, Result};
use crossbeam_queue::ArrayQueue;
use parking_lot::{Condvar, Mutex};
use proto::peek_request_id;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};
use transport::{timed_out, Endpoint, MAX_DATAGRAM};

const QUEUE_CAPACITY: usize = 1024;

// How long blocked threads sleep before rechecking the shutdown flag.
const POLL_INTERVAL: Duration = Duration::from_millis(100);

struct Task {
    buf: Vec<u8>,
    peer: SocketAddr,
    received_at: Instant,
}

struct Shared {
    socket: Endpoint,
    dispatcher: Dispatcher,
    // present only under at-most-once
    cache: Option<Mutex<ResponseCache>>,
    queue: ArrayQueue<Task>,
    shutdown: AtomicBool,
    wake_lock: Mutex<()>,
    wake: Condvar,
}

/// The running service: one reader thread that owns the receive side of the
/// socket and a pool of workers that execute requests and share the send
/// side. Requests from one client may be handled out of order when they land
/// on different workers; clients needing ordering wait for each response.
pub struct Server {
    shared: Arc<Shared>,
    local_addr: SocketAddr,
    reader: Option<JoinHandle<()>>,
    workers: Vec<JoinHandle<()>>,
}

impl Server {
    /// Loads persisted state, binds the socket and spawns the thread pool.
    pub fn start(cfg: Config) -> Result<Self> {
        let storage: Option<Box<dyn Storage>> = match &cfg.data_dir {
            Some(dir) => Some(Box::new(JsonStorage::open(dir)?)),
            None => None,
        };

        let snapshot = match storage.as_ref().map(|s| s.load()).transpose() {
            Ok(snapshot) => snapshot.flatten(),
            Err(err) => {
                warn!(%err, "failed to load persisted state, starting empty");
                None
            }
        };

        let mut store = match snapshot {
            Some(snapshot) => BookingStore::from_snapshot(cfg.zone, snapshot),
            None => BookingStore::new(cfg.zone),
        };
        let seeded = store.seed_defaults();

        let dispatcher = Dispatcher::new(store, storage);
        if seeded {
            info!("created default facilities");
            dispatcher.persist_initial();
        }

        let socket = Endpoint::bind(format!("0.0.0.0:{}", cfg.port).parse()?)
            .context("binding server socket")?
            .with_drop_rate(cfg.drop_rate)?;
        socket.set_read_timeout(Some(POLL_INTERVAL))?;
        let local_addr = socket.local_addr()?;

        let cache = match cfg.semantic {
            Semantic::AtMostOnce => Some(Mutex::new(ResponseCache::new(
                cfg.cache_ttl,
                cfg.cache_client_limit,
            ))),
            Semantic::AtLeastOnce => None,
        };

        let shared = Arc::new(Shared {
            socket,
            dispatcher,
            cache,
            queue: ArrayQueue::new(QUEUE_CAPACITY),
            shutdown: AtomicBool::new(false),
            wake_lock: Mutex::new(()),
            wake: Condvar::new(),
        });

        info!(
            %local_addr,
            semantic = ?cfg.semantic,
            workers = cfg.workers,
            "server listening"
        );

        let workers = (0..cfg.workers.max(1))
            .map(|i| {
                let shared = Arc::clone(&shared);
                thread::Builder::new()
                    .name(format!("worker-{i}"))
                    .spawn(move || worker_loop(&shared))
                    .context("spawning worker thread")
            })
            .collect::<Result<Vec<_>>>()?;

        let reader = {
            let shared = Arc::clone(&shared);
            thread::Builder::new()
                .name("reader".to_string())
                .spawn(move || reader_loop(&shared))
                .context("spawning reader thread")?
        };

        Ok(Self {
            shared,
            local_addr,
            reader: Some(reader),
            workers,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Blocks the calling thread for the lifetime of the server.
    pub fn wait(mut self) {
        if let Some(reader) = self.reader.take() {
            let _ = reader.join();
        }
        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
    }

    /// Cooperative shutdown: raise the flag, wake everyone, join. Workers
    /// drain whatever is left in the queue before exiting.
    pub fn shutdown(mut self) {
        self.shared.shutdown.store(true, Ordering::Release);
        {
            let _guard = self.shared.wake_lock.lock();
            self.shared.wake.notify_all();
        }

        if let Some(reader) = self.reader.take() {
            let _ = reader.join();
        }
        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
        info!("server stopped");
    }
}

fn reader_loop(shared: &Shared) {
    let mut buf = vec![0u8; MAX_DATAGRAM];

    while !shared.shutdown.load(Ordering::Acquire) {
        let (len, peer) = match shared.socket.recv(&mut buf) {
            Ok(res) => res,
            Err(ref err) if timed_out(err) => continue,
            Err(err) => {
                error!(%err, "receive failed");
                continue;
            }
        };

        let task = Task {
            buf: buf[..len].to_vec(),
            peer,
            received_at: Instant::now(),
        };

        if shared.queue.push(task).is_err() {
            warn!(%peer, "work queue full, dropping datagram");
            continue;
        }

        let _guard = shared.wake_lock.lock();
        shared.wake.notify_one();
    }
}

fn worker_loop(shared: &Shared) {
    loop {
        if let Some(task) = shared.queue.pop() {
            handle_task(shared, task);
            continue;
        }

        // queue fully drained, safe to leave once shutdown is flagged
        if shared.shutdown.load(Ordering::Acquire) {
            break;
        }

        let mut guard = shared.wake_lock.lock();
        if shared.queue.is_empty() && !shared.shutdown.load(Ordering::Acquire) {
            shared.wake.wait_for(&mut guard, POLL_INTERVAL);
        }
    }
}

fn handle_task(shared: &Shared, task: Task) {
    let request_id = peek_request_id(&task.buf);

    if let (Some(cache), Some(request_id)) = (&shared.cache, request_id) {
        let hit = cache
            .lock()
            .lookup(task.peer, request_id, task.received_at)
            .map(<[u8]>::to_vec);

        if let Some(cached) = hit {
            debug!(peer = %task.peer, request_id, "replaying cached response");
            send_response(shared, &cached, task.peer);
            return;
        }
    }

    let Some((response, change)) = shared.dispatcher.process(&task.buf, task.peer) else {
        return;
    };

    if let (Some(cache), Some(request_id)) = (&shared.cache, request_id) {
        cache
            .lock()
            .insert(task.peer, request_id, response.clone(), task.received_at);
    }

    send_response(shared, &response, task.peer);

    if let Some(change) = change {
        shared.dispatcher.notify(&change, &shared.socket);
    }
}

fn send_response(shared: &Shared, response: &[u8], peer: SocketAddr) {
    match shared.socket.send_lossy(response, peer) {
        Ok(true) => {}
        Ok(false) => debug!(%peer, "response withheld by loss simulation"),
        Err(err) => warn!(%peer, %err, "failed to send response"),
    }
}
