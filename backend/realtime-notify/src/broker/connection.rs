/// Identity and lifecycle types for realtime connections
///
/// - `UserId`: verified user identifier handed over by the host
/// - `ConnectionId`: one open channel, derived from the owning user plus a sequence suffix
/// - `ConnectionLifecycle`: OPENING → OPEN → CLOSING → CLOSED, shared by broker and host
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU8, Ordering};
use tokio::sync::Notify;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(Uuid);

impl UserId {
    pub fn new(id: Uuid) -> Self {
        Self(id)
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl From<Uuid> for UserId {
    fn from(id: Uuid) -> Self {
        Self(id)
    }
}

impl FromStr for UserId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s.trim()).map(Self)
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Identifier of one open channel.
///
/// A user holding several tabs gets several ids that differ only in `seq`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId {
    user_id: UserId,
    seq: u64,
}

impl ConnectionId {
    pub fn new(user_id: UserId, seq: u64) -> Self {
        Self { user_id, seq }
    }

    pub fn user_id(&self) -> UserId {
        self.user_id
    }

    pub fn seq(&self) -> u64 {
        self.seq
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.user_id, self.seq)
    }
}

impl Serialize for ConnectionId {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConnectionState {
    /// Allocated, register + replay not finished yet
    Opening,
    /// Registered and receiving live events
    Open,
    /// Teardown started (explicit close, write failure or disconnect)
    Closing,
    /// Unregistered and heartbeat cancelled; terminal
    Closed,
}

impl ConnectionState {
    fn as_u8(self) -> u8 {
        match self {
            ConnectionState::Opening => 0,
            ConnectionState::Open => 1,
            ConnectionState::Closing => 2,
            ConnectionState::Closed => 3,
        }
    }

    fn from_u8(value: u8) -> Self {
        match value {
            0 => ConnectionState::Opening,
            1 => ConnectionState::Open,
            2 => ConnectionState::Closing,
            _ => ConnectionState::Closed,
        }
    }
}

/// Shared state cell for one connection.
///
/// Outlives the registry entry so the host can still observe `Closed`
/// after the broker forgot the connection.
#[derive(Debug)]
pub struct ConnectionLifecycle {
    state: AtomicU8,
    closed: Notify,
}

impl ConnectionLifecycle {
    pub fn new() -> Self {
        Self {
            state: AtomicU8::new(ConnectionState::Opening.as_u8()),
            closed: Notify::new(),
        }
    }

    pub fn state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn is_open(&self) -> bool {
        self.state() == ConnectionState::Open
    }

    /// OPENING → OPEN. Fails if a close already started.
    pub fn mark_open(&self) -> bool {
        self.transition(ConnectionState::Opening, ConnectionState::Open)
    }

    /// OPENING/OPEN → CLOSING. Only the first caller gets `true`.
    pub fn begin_close(&self) -> bool {
        self.transition(ConnectionState::Open, ConnectionState::Closing)
            || self.transition(ConnectionState::Opening, ConnectionState::Closing)
    }

    /// CLOSING → CLOSED. Wakes everyone waiting in `closed()`.
    pub fn mark_closed(&self) {
        if self.transition(ConnectionState::Closing, ConnectionState::Closed) {
            self.closed.notify_waiters();
        }
    }

    /// Resolves once the connection reached CLOSED (sink released).
    pub async fn closed(&self) {
        loop {
            // Register before checking so a concurrent mark_closed is not missed
            let notified = self.closed.notified();
            if self.state() == ConnectionState::Closed {
                return;
            }
            notified.await;
        }
    }

    fn transition(&self, from: ConnectionState, to: ConnectionState) -> bool {
        self.state
            .compare_exchange(from.as_u8(), to.as_u8(), Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}

impl Default for ConnectionLifecycle {
    fn default() -> Self {
        Self::new()
    }
}
