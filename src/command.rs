//! Command model: one client request/response pair.
//!
//! A command owns an immutable request, a mutable response, and the
//! routing metadata the queue and messenger schedule on. The request is
//! never rewritten after construction; once `complete` is set the
//! response is final.

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::clock;
use crate::wire::Message;

/// Fallback when the request carries no `timeout` header, in ms.
pub const DEFAULT_TIMEOUT_MS: u64 = 60_000;

const REQUEST_ID_LEN: usize = 6;
const REQUEST_ID_CHARS: &[u8] =
    b"abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";

/// Scheduling priority carried in the `priority` request header.
///
/// Only these enumerators are representable; anything else in the
/// header is coerced to `Normal` at construction.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Min = 0,
    Low = 250,
    Normal = 500,
    High = 750,
    Max = 1000,
}

impl Priority {
    pub fn from_value(value: i64) -> Option<Self> {
        match value {
            0 => Some(Priority::Min),
            250 => Some(Priority::Low),
            500 => Some(Priority::Normal),
            750 => Some(Priority::High),
            1000 => Some(Priority::Max),
            _ => None,
        }
    }

    pub fn value(self) -> i64 {
        self as i64
    }
}

impl Default for Priority {
    fn default() -> Self {
        Priority::Normal
    }
}

/// How widely a write must be acknowledged before it commits.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WriteConsistency {
    Async = 0,
    One = 1,
    Quorum = 2,
}

impl WriteConsistency {
    pub fn from_value(value: i64) -> Option<Self> {
        match value {
            0 => Some(WriteConsistency::Async),
            1 => Some(WriteConsistency::One),
            2 => Some(WriteConsistency::Quorum),
            _ => None,
        }
    }

    pub fn value(self) -> i64 {
        self as i64
    }
}

impl Default for WriteConsistency {
    fn default() -> Self {
        WriteConsistency::Async
    }
}

/// An outstanding outbound sub-request issued by a plug-in while the
/// command was being processed.
#[derive(Debug, Default)]
pub struct OutboundRequest {
    pub created_us: u64,
    pub finished_us: u64,
    pub request: Message,
    pub response: Message,
    pub status: u16,
}

impl OutboundRequest {
    pub fn new(request: Message) -> Self {
        Self {
            created_us: clock::now_us(),
            finished_us: 0,
            request,
            response: Message::default(),
            status: 0,
        }
    }
}

/// One client request/response pair with routing metadata.
///
/// Owned by one executor thread at a time. There is no copy; handing a
/// command to another owner is a move, and the moved-from binding is
/// gone with everything it held.
#[derive(Debug)]
pub struct Command {
    request: Message,
    pub response: Message,
    pub id: String,
    pub priority: Priority,
    pub write_consistency: WriteConsistency,
    pub creation_time_us: u64,
    pub escalation_time_us: u64,
    pub complete: bool,
    pub escalated: bool,
    pub peek_count: u32,
    pub process_count: u32,
    outbound: Option<Box<OutboundRequest>>,
}

/// Enrich an inbound request with the headers every command must carry.
///
/// Adds `commandExecuteTime` (µs since epoch) and a 6-character
/// alphanumeric `requestID` when absent. A request already carrying
/// both passes through unchanged.
pub fn preprocess_request(mut request: Message) -> Message {
    if !request.is_set("commandExecuteTime") {
        request.set("commandExecuteTime", clock::now_us().to_string());
    }
    if !request.is_set("requestID") {
        let mut rng = rand::thread_rng();
        let id: String = (0..REQUEST_ID_LEN)
            .map(|_| REQUEST_ID_CHARS[rng.gen_range(0..REQUEST_ID_CHARS.len())] as char)
            .collect();
        request.set("requestID", id);
    }
    request
}

impl Command {
    pub fn new(request: Message) -> Self {
        let request = preprocess_request(request);

        let priority = match request.calc("priority") {
            Some(value) => Priority::from_value(value).unwrap_or_else(|| {
                tracing::warn!(
                    "'{}' requested invalid priority: {value}",
                    request.method_line
                );
                Priority::Normal
            }),
            None => Priority::Normal,
        };

        let write_consistency = match request.calc("writeConsistency") {
            Some(value) => WriteConsistency::from_value(value).unwrap_or_else(|| {
                tracing::warn!(
                    "'{}' requested invalid consistency: {value}",
                    request.method_line
                );
                WriteConsistency::Async
            }),
            None => WriteConsistency::Async,
        };

        Self {
            request,
            response: Message::default(),
            id: String::new(),
            priority,
            write_consistency,
            creation_time_us: clock::now_us(),
            escalation_time_us: 0,
            complete: false,
            escalated: false,
            peek_count: 0,
            process_count: 0,
            outbound: None,
        }
    }

    /// The request this command was built from. Stable for the life of
    /// the command.
    pub fn request(&self) -> &Message {
        &self.request
    }

    /// Absolute deadline in µs since epoch, from the request's
    /// `timeout` header (milliseconds) or the default.
    pub fn timeout(&self) -> u64 {
        let timeout_ms = self
            .request
            .calc("timeout")
            .and_then(|v| u64::try_from(v).ok())
            .unwrap_or(DEFAULT_TIMEOUT_MS);
        self.creation_time_us.saturating_add(timeout_ms.saturating_mul(1_000))
    }

    pub fn attach_outbound(&mut self, outbound: OutboundRequest) {
        self.outbound = Some(Box::new(outbound));
    }

    pub fn outbound(&self) -> Option<&OutboundRequest> {
        self.outbound.as_deref()
    }

    /// Detach the outstanding sub-request; the command owns none after.
    pub fn take_outbound(&mut self) -> Option<Box<OutboundRequest>> {
        self.outbound.take()
    }
}
