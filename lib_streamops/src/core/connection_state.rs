use std::fmt;

/// Lifecycle of the realtime connection.
///
/// `Idle → Connecting → Open → Closing → Closed`. From `Closed` the manager
/// goes back to `Connecting` on its own unless the closure was normal.
/// `Exhausted` is terminal until the caller invokes `connect()` again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    /// Never connected.
    #[default]
    Idle,
    /// Handshake in flight, or waiting for a reconnect timer.
    Connecting,
    /// Frames flow in both directions.
    Open,
    /// A close frame has been sent.
    Closing,
    /// Closed, no reconnect pending.
    Closed,
    /// The reconnect budget is spent.
    Exhausted,
}

impl ConnectionState {
    /// `true` while `connect()` has nothing to do.
    pub fn is_active(self) -> bool {
        matches!(self, ConnectionState::Connecting | ConnectionState::Open)
    }

    /// Lowercase name used in logs and status lines.
    pub fn as_str(self) -> &'static str {
        match self {
            ConnectionState::Idle => "idle",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Open => "open",
            ConnectionState::Closing => "closing",
            ConnectionState::Closed => "closed",
            ConnectionState::Exhausted => "exhausted",
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
