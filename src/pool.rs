//! Bounded-lifetime socket pool.
//!
//! Caches idle outbound connections to one host and evicts entries a
//! reaper thread finds older than the idle window. The FIFO is ordered
//! by insertion time, so the reaper stops at the first entry younger
//! than the cutoff.

use std::collections::VecDeque;
use std::io;
use std::net::{TcpStream, ToSocketAddrs};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// How long an idle socket may sit in the pool before eviction.
pub const IDLE_TIMEOUT: Duration = Duration::from_secs(10);

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Default)]
struct PoolState {
    sockets: VecDeque<(Instant, TcpStream)>,
    exit: bool,
}

#[derive(Default)]
struct PoolShared {
    state: Mutex<PoolState>,
    cv: Condvar,
}

/// Thread-safe cache of reusable connections to one host.
pub struct SocketPool {
    host: String,
    idle_timeout: Duration,
    shared: Arc<PoolShared>,
    reaper: Option<JoinHandle<()>>,
}

impl SocketPool {
    pub fn new(host: impl Into<String>) -> Self {
        Self::with_idle_timeout(host, IDLE_TIMEOUT)
    }

    pub fn with_idle_timeout(host: impl Into<String>, idle_timeout: Duration) -> Self {
        let shared = Arc::new(PoolShared::default());
        let reaper = {
            let shared = Arc::clone(&shared);
            thread::spawn(move || reap(&shared, idle_timeout))
        };
        Self {
            host: host.into(),
            idle_timeout,
            shared,
            reaper: Some(reaper),
        }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    /// A pooled socket if one is idle, else a fresh synchronous
    /// connection, else None when the host cannot be reached.
    pub fn get(&self) -> Option<TcpStream> {
        {
            let mut state = self.shared.state.lock().expect("socket pool lock poisoned");
            if let Some((_, socket)) = state.sockets.pop_front() {
                return Some(socket);
            }
        }

        match open_socket(&self.host) {
            Ok(socket) => Some(socket),
            Err(err) => {
                tracing::warn!("socket to {} failed to open: {err}", self.host);
                None
            }
        }
    }

    /// Return an idle socket, tagged with the current time, and wake
    /// the reaper so it can schedule the eviction.
    pub fn put(&self, socket: TcpStream) {
        {
            let mut state = self.shared.state.lock().expect("socket pool lock poisoned");
            state.sockets.push_back((Instant::now(), socket));
        }
        self.shared.cv.notify_one();
    }

    pub fn len(&self) -> usize {
        let state = self.shared.state.lock().expect("socket pool lock poisoned");
        state.sockets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn idle_timeout(&self) -> Duration {
        self.idle_timeout
    }
}

impl Drop for SocketPool {
    fn drop(&mut self) {
        {
            let mut state = self.shared.state.lock().expect("socket pool lock poisoned");
            state.exit = true;
        }
        self.shared.cv.notify_one();
        if let Some(reaper) = self.reaper.take() {
            let _ = reaper.join();
        }
        // Remaining pooled sockets close when the state drops.
    }
}

fn reap(shared: &PoolShared, idle_timeout: Duration) {
    let mut state = shared.state.lock().expect("socket pool lock poisoned");
    loop {
        if state.exit {
            return;
        }

        // Prune expired entries from the front. Emptiness is checked
        // before the entry's timestamp is read.
        let now = Instant::now();
        while let Some((inserted, _)) = state.sockets.front() {
            if *inserted + idle_timeout <= now {
                state.sockets.pop_front();
            } else {
                break;
            }
        }

        // Sleep until the oldest survivor expires, or indefinitely when
        // the pool is empty.
        let next_expiry = state
            .sockets
            .front()
            .map(|(inserted, _)| *inserted + idle_timeout);
        state = match next_expiry {
            Some(expiry) => {
                shared
                    .cv
                    .wait_timeout(state, expiry.saturating_duration_since(now))
                    .expect("socket pool lock poisoned")
                    .0
            }
            None => shared.cv.wait(state).expect("socket pool lock poisoned"),
        };
    }
}

/// Synchronously open a connection to `host` (a `host:port` string).
pub(crate) fn open_socket(host: &str) -> io::Result<TcpStream> {
    let addr = host.to_socket_addrs()?.next().ok_or_else(|| {
        io::Error::new(io::ErrorKind::AddrNotAvailable, format!("no address for {host}"))
    })?;
    let socket = TcpStream::connect_timeout(&addr, CONNECT_TIMEOUT)?;
    socket.set_nodelay(true)?;
    Ok(socket)
}
