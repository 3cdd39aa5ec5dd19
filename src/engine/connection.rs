// ── Connection state machine ──
//
// Pure bookkeeping: the sync loop feeds it handshake and poll outcomes and
// acts on the returned transitions. Nothing here touches the network or the
// clock.

use std::fmt;
use std::time::Duration;

/// Reachability of the gateway as seen by the sync loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    /// Last poll failed; previously synced values are stale but kept.
    Degraded,
}

impl ConnectionState {
    /// Value of the externally visible connection flag.
    pub fn is_online(self) -> bool {
        matches!(self, Self::Connected | Self::Degraded)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Degraded => "degraded",
        };
        f.write_str(label)
    }
}

/// Exponential backoff bounded by `max`.
#[derive(Debug, Clone)]
pub struct Backoff {
    min: Duration,
    max: Duration,
    current: Duration,
}

impl Backoff {
    pub fn new(min: Duration, max: Duration) -> Self {
        let max = max.max(min);
        Self { min, max, current: min }
    }

    /// Delay to wait now; the following call returns twice as much.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = self.current.saturating_mul(2).min(self.max);
        delay
    }

    pub fn reset(&mut self) {
        self.current = self.min;
    }
}

/// Result of feeding one event into the [`ConnectionManager`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub from: ConnectionState,
    pub to: ConnectionState,
    /// New value of the connection flag, only when it flipped.
    pub online: Option<bool>,
}

impl Transition {
    pub fn changed(&self) -> bool {
        self.from != self.to
    }
}

#[derive(Debug)]
pub struct ConnectionManager {
    state: ConnectionState,
    online: bool,
    consecutive_failures: u32,
    failure_threshold: u32,
    backoff: Backoff,
}

impl ConnectionManager {
    pub fn new(failure_threshold: u32, backoff: Backoff) -> Self {
        Self {
            state: ConnectionState::Disconnected,
            online: false,
            consecutive_failures: 0,
            failure_threshold,
            backoff,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    /// Disconnected → Connecting.
    pub fn begin_connect(&mut self) -> Transition {
        match self.state {
            ConnectionState::Disconnected | ConnectionState::Connecting => {
                self.move_to(ConnectionState::Connecting)
            }
            _ => self.stay(),
        }
    }

    /// Handshake and initial discovery succeeded.
    pub fn connected(&mut self) -> Transition {
        self.consecutive_failures = 0;
        self.backoff.reset();
        self.move_to(ConnectionState::Connected)
    }

    /// Handshake or initial discovery failed.
    pub fn connect_failed(&mut self) -> Transition {
        self.move_to(ConnectionState::Disconnected)
    }

    pub fn poll_succeeded(&mut self) -> Transition {
        match self.state {
            ConnectionState::Connected | ConnectionState::Degraded => {
                self.consecutive_failures = 0;
                self.move_to(ConnectionState::Connected)
            }
            _ => self.stay(),
        }
    }

    /// A poll or the push listener failed. Outside Connected/Degraded this
    /// is a late result and is ignored.
    pub fn poll_failed(&mut self) -> Transition {
        match self.state {
            ConnectionState::Connected | ConnectionState::Degraded => {
                self.consecutive_failures += 1;
                if self.consecutive_failures > self.failure_threshold {
                    self.consecutive_failures = 0;
                    self.backoff.reset();
                    self.move_to(ConnectionState::Disconnected)
                } else {
                    self.move_to(ConnectionState::Degraded)
                }
            }
            _ => self.stay(),
        }
    }

    /// Engine stop.
    pub fn shutdown(&mut self) -> Transition {
        self.consecutive_failures = 0;
        self.backoff.reset();
        self.move_to(ConnectionState::Disconnected)
    }

    /// How long to stay Disconnected before the next attempt. Escalates on
    /// every call until a connection succeeds.
    pub fn next_retry_delay(&mut self) -> Duration {
        self.backoff.next_delay()
    }

    fn stay(&self) -> Transition {
        Transition {
            from: self.state,
            to: self.state,
            online: None,
        }
    }

    fn move_to(&mut self, to: ConnectionState) -> Transition {
        let from = std::mem::replace(&mut self.state, to);
        let online = to.is_online();
        let flipped = (online != self.online).then(|| {
            self.online = online;
            online
        });
        Transition {
            from,
            to,
            online: flipped,
        }
    }
}
