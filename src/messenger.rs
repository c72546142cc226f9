//! Leader escalation over the line-oriented command protocol.
//!
//! `run_on_leader` sends exactly one command to the current leader and
//! populates its response, synchronously on the caller's thread. The
//! protocol forbids pipelining, so a response is framed complete the
//! moment the parser consumes a full message. Retryability is decided
//! by whether any request bytes have left the socket: before that the
//! command is untouched and the caller may re-attempt; after it, an
//! ambiguous failure synthesizes a `500 Internal Server Error`.

use std::collections::HashMap;
use std::io::{self, Read, Write};
use std::net::TcpStream;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use thiserror::Error;

use crate::clock;
use crate::cluster::ClusterState;
use crate::command::Command;
use crate::error::{Effect, Transience};
use crate::pool::SocketPool;

const POLL_TICK: Duration = Duration::from_millis(100);
const RECV_CHUNK: usize = 4096;

/// Why a blocked read or write stopped waiting.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum WaitOutcome {
    /// Transient; retry the operation on the next tick.
    Ready,
    ShuttingDown,
    TimedOut,
    Disconnected,
    Failed,
}

/// Escalation lifecycle, surfaced in logs.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Phase {
    Created,
    AddressResolved,
    SocketOpen,
    Sending,
    Receiving,
    Done,
    FailedRetryable,
    FailedFatal,
}

impl Phase {
    fn as_str(self) -> &'static str {
        match self {
            Phase::Created => "created",
            Phase::AddressResolved => "address_resolved",
            Phase::SocketOpen => "socket_open",
            Phase::Sending => "sending",
            Phase::Receiving => "receiving",
            Phase::Done => "done",
            Phase::FailedRetryable => "failed_retryable",
            Phase::FailedFatal => "failed_fatal",
        }
    }
}

#[derive(Debug, Error)]
enum EscalationError {
    #[error("shutting down")]
    ShuttingDown,
    #[error("timed out")]
    TimedOut,
    #[error("disconnected")]
    Disconnected,
    #[error("socket error: {0}")]
    Socket(#[source] io::Error),
}

#[derive(Debug)]
struct EscalationFailure {
    error: EscalationError,
    /// Whether any request bytes had left the socket when it failed.
    after_send: bool,
    phase: Phase,
}

impl EscalationFailure {
    fn transience(&self) -> Transience {
        if self.after_send {
            Transience::Permanent
        } else {
            Transience::Retryable
        }
    }

    fn effect(&self) -> Effect {
        if self.after_send { Effect::Unknown } else { Effect::None }
    }

    /// After-send failures must not leave an ambiguous state, so the
    /// command gets the synthetic 500.
    fn poisons_response(&self) -> bool {
        self.after_send
    }

    fn terminal_phase(&self) -> Phase {
        if self.after_send {
            Phase::FailedFatal
        } else {
            Phase::FailedRetryable
        }
    }
}

/// Sends commands to the current leader, one request and one response
/// per connection, reusing sockets through per-address pools.
pub struct ClusterMessenger {
    cluster: Arc<ClusterState>,
    pools: Mutex<HashMap<String, Arc<SocketPool>>>,
    shutdown_by_us: AtomicU64,
}

impl ClusterMessenger {
    pub fn new(cluster: Arc<ClusterState>) -> Self {
        Self {
            cluster,
            pools: Mutex::new(HashMap::new()),
            shutdown_by_us: AtomicU64::new(0),
        }
    }

    /// Record a shutdown deadline; in-flight waits abandon within the
    /// next tick.
    pub fn shutdown_by(&self, timestamp_us: u64) {
        self.shutdown_by_us.store(timestamp_us, Ordering::Relaxed);
    }

    /// Clear the shutdown deadline.
    pub fn reset(&self) {
        self.shutdown_by_us.store(0, Ordering::Relaxed);
    }

    /// Send `command` to the leader and fill in its response.
    ///
    /// True iff a well-formed response was received; the command is
    /// then complete and escalated, with `escalation_time_us` holding
    /// the elapsed µs. On false the command is either untouched
    /// (retryable) or carries the synthetic 500 (unretryable).
    pub fn run_on_leader(&self, command: &mut Command) -> bool {
        tracing::debug!("escalation {}", Phase::Created.as_str());
        let Some(address) = self.cluster.leader_command_address() else {
            tracing::info!("escalation: no leader command address");
            return false;
        };
        let Some(endpoint) = parse_endpoint(&address) else {
            tracing::info!("escalation: malformed leader address {address:?}");
            return false;
        };
        tracing::debug!("escalation {} -> {endpoint}", Phase::AddressResolved.as_str());

        // Escalation timing covers every exit path from here on.
        let start_us = clock::now_us();

        let pool = self.pool_for(&endpoint);
        let Some(socket) = pool.get() else {
            command.escalation_time_us = clock::now_us().saturating_sub(start_us);
            return false;
        };
        tracing::debug!("escalation {} -> {endpoint}", Phase::SocketOpen.as_str());

        match self.exchange(socket, command) {
            Ok(socket) => {
                command.complete = true;
                command.escalated = true;
                command.escalation_time_us = clock::now_us().saturating_sub(start_us);
                tracing::debug!("escalation {} -> {endpoint}", Phase::Done.as_str());
                // The round-trip finished cleanly, so the connection is
                // idle again and safe to reuse.
                pool.put(socket);
                true
            }
            Err(failure) => {
                command.escalation_time_us = clock::now_us().saturating_sub(start_us);
                tracing::info!(
                    "escalation {} in {}: {} (transience={}, effect={})",
                    failure.terminal_phase().as_str(),
                    failure.phase.as_str(),
                    failure.error,
                    failure.transience().as_str(),
                    failure.effect().as_str(),
                );
                if failure.poisons_response() {
                    set_error_response(command);
                }
                false
            }
        }
    }

    /// One full request/response exchange. Returns the socket on a
    /// clean round-trip so it can go back to the pool; every failure
    /// path drops it.
    fn exchange(
        &self,
        stream: TcpStream,
        command: &mut Command,
    ) -> Result<TcpStream, EscalationFailure> {
        let deadline_us = command.timeout();
        if let Err(err) = stream
            .set_write_timeout(Some(POLL_TICK))
            .and_then(|()| stream.set_read_timeout(Some(POLL_TICK)))
        {
            return Err(EscalationFailure {
                error: EscalationError::Socket(err),
                after_send: false,
                phase: Phase::SocketOpen,
            });
        }

        let mut request = command.request().clone();
        request.set("ID", command.id.clone());
        let payload = request.serialize();

        let mut sent = 0usize;
        while sent < payload.len() {
            match (&stream).write(&payload[sent..]) {
                Ok(0) => {
                    return Err(fail(EscalationError::Disconnected, sent > 0, Phase::Sending));
                }
                Ok(n) => sent += n,
                Err(err) => match self.wait_outcome(&err, deadline_us) {
                    WaitOutcome::Ready => continue,
                    outcome => {
                        return Err(fail(error_for(outcome, err), sent > 0, Phase::Sending));
                    }
                },
            }
        }

        let mut received = Vec::new();
        let mut chunk = [0u8; RECV_CHUNK];
        loop {
            match (&stream).read(&mut chunk) {
                Ok(0) => {
                    // Peer closed before a complete frame arrived.
                    return Err(fail(EscalationError::Disconnected, true, Phase::Receiving));
                }
                Ok(n) => {
                    received.extend_from_slice(&chunk[..n]);
                    // Only one command went out, so one complete frame
                    // ends the read.
                    if command.response.parse(&received) != 0 {
                        break;
                    }
                }
                Err(err) => match self.wait_outcome(&err, deadline_us) {
                    WaitOutcome::Ready => continue,
                    outcome => {
                        return Err(fail(error_for(outcome, err), true, Phase::Receiving));
                    }
                },
            }
        }

        Ok(stream)
    }

    /// Classify one blocked tick on the escalation socket.
    fn wait_outcome(&self, err: &io::Error, deadline_us: u64) -> WaitOutcome {
        match err.kind() {
            io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut => {
                if self.shutdown_by_us.load(Ordering::Relaxed) != 0 {
                    tracing::info!("escalation: giving up because shutting down");
                    WaitOutcome::ShuttingDown
                } else if deadline_us != 0 && clock::now_us() > deadline_us {
                    tracing::info!("escalation: timeout waiting for socket");
                    WaitOutcome::TimedOut
                } else {
                    WaitOutcome::Ready
                }
            }
            io::ErrorKind::Interrupted => WaitOutcome::Ready,
            io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::NotConnected
            | io::ErrorKind::UnexpectedEof => {
                tracing::info!("escalation: socket disconnected while waiting to be ready");
                WaitOutcome::Disconnected
            }
            _ => WaitOutcome::Failed,
        }
    }

    fn pool_for(&self, endpoint: &str) -> Arc<SocketPool> {
        let mut pools = self.pools.lock().expect("messenger pools lock poisoned");
        Arc::clone(
            pools
                .entry(endpoint.to_string())
                .or_insert_with(|| Arc::new(SocketPool::new(endpoint))),
        )
    }
}

/// Synthetic response for failures after the request may have been
/// observed by the leader.
fn set_error_response(command: &mut Command) {
    command.response.clear();
    command.response.method_line = "500 Internal Server Error".to_string();
    command.complete = true;
}

fn fail(error: EscalationError, after_send: bool, phase: Phase) -> EscalationFailure {
    EscalationFailure {
        error,
        after_send,
        phase,
    }
}

fn error_for(outcome: WaitOutcome, err: io::Error) -> EscalationError {
    match outcome {
        WaitOutcome::ShuttingDown => EscalationError::ShuttingDown,
        WaitOutcome::TimedOut => EscalationError::TimedOut,
        WaitOutcome::Disconnected => EscalationError::Disconnected,
        WaitOutcome::Ready | WaitOutcome::Failed => EscalationError::Socket(err),
    }
}

/// Normalize a leader address (`host:port`, optionally behind an
/// `http://` scheme) into a dialable endpoint.
fn parse_endpoint(address: &str) -> Option<String> {
    let trimmed = address.strip_prefix("http://").unwrap_or(address);
    let (host, port) = trimmed.rsplit_once(':')?;
    let port: u16 = port.parse().ok()?;
    if host.is_empty() || port == 0 {
        return None;
    }
    Some(format!("{host}:{port}"))
}
