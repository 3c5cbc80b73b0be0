//! Reconnect state machine.
//!
//! ```text
//!   Idle ──Connect──▶ Connecting ──Opened──▶ Connected
//!    ▲                 │     ▲                  │
//!    │              Lost     TimerElapsed      Lost
//!    │                 ▼     │                  │
//!    │               Backoff(n) ◀───────────────┘
//!    │                 │ n > max_attempts
//!    │                 ▼
//!    └──Shutdown──   Failed ──Connect──▶ Connecting
//! ```
//!
//! `Shutdown` returns any state to `Idle`.

use std::time::Duration;

/// Retry schedule for a dropped or refused link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    /// Delay before the first retry; doubles per attempt.
    pub base_delay: Duration,
    pub max_attempts: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(500),
            max_attempts: 5,
        }
    }
}

impl ReconnectPolicy {
    /// Delay before retry number `attempt` (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1).min(16);
        self.base_delay.saturating_mul(1u32 << shift)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Idle,
    Connecting,
    Connected,
    /// Waiting before retry `n`.
    Backoff(u32),
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkInput {
    Connect,
    Opened,
    /// The connection attempt failed or an open link dropped.
    Lost,
    TimerElapsed,
    Shutdown,
}

/// [`LinkState`] plus the failure count that drives it.
#[derive(Debug, Clone)]
pub struct Reconnect {
    policy: ReconnectPolicy,
    state: LinkState,
    failures: u32,
}

impl Reconnect {
    pub fn new(policy: ReconnectPolicy) -> Self {
        Self {
            policy,
            state: LinkState::Idle,
            failures: 0,
        }
    }

    pub fn state(&self) -> LinkState {
        self.state
    }

    pub fn policy(&self) -> &ReconnectPolicy {
        &self.policy
    }

    /// Apply one input and return the new state.
    pub fn on(&mut self, input: LinkInput) -> LinkState {
        use LinkInput::*;
        use LinkState::*;

        self.state = match (self.state, input) {
            (_, Shutdown) => {
                self.failures = 0;
                Idle
            }
            (Idle | Failed, Connect) => {
                self.failures = 0;
                Connecting
            }
            (Connecting, Opened) => {
                self.failures = 0;
                Connected
            }
            (Connecting | Connected, Lost) => {
                self.failures += 1;
                if self.failures > self.policy.max_attempts {
                    Failed
                } else {
                    Backoff(self.failures)
                }
            }
            (Backoff(_), TimerElapsed) => Connecting,
            (state, _) => state,
        };
        self.state
    }

    /// How long to wait in the current state, if it is a backoff.
    pub fn pending_delay(&self) -> Option<Duration> {
        match self.state {
            LinkState::Backoff(n) => Some(self.policy.delay_for(n)),
            _ => None,
        }
    }
}
