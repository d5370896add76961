//! Client-side reconnection policy and state machine.
//!
//! ```text
//!   Connecting ──ok──► Connected ──lost──► Reconnecting{n} ──ok──► Connected
//!       │                                      │   ▲
//!       └──────────────fail───────────────────►│   └─ fail, n < max
//!                                              └─ n > max ──► Failed
//! ```
//!
//! Delay before attempt `n` is `clamp(base · 2^(n-1), base, max)`, scaled by
//! a uniform factor in `[1 - r, 1 + r]`. From `Failed` only an explicit
//! [`ReconnectionController::retry_now`] starts over.

use std::collections::BTreeSet;
use std::time::Duration;
use rand::Rng;

use crate::config::ConfigError;
use crate::protocol::ProjectId;

#[derive(Debug, Clone, PartialEq)]
pub struct ReconnectPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Attempts after which the controller gives up.
    pub max_attempts: u32,
    /// Jitter as a fraction of the nominal delay, in `[0, 1)`.
    pub randomization_factor: f64,
    /// Upper bound on a single connection attempt.
    pub connect_timeout: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            max_attempts: 10,
            randomization_factor: 0.5,
            connect_timeout: Duration::from_secs(10),
        }
    }
}

impl ReconnectPolicy {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.base_delay.is_zero() {
            return Err(ConfigError::Zero { field: "base_delay" });
        }
        if self.max_delay < self.base_delay {
            return Err(ConfigError::OutOfOrder {
                field: "max_delay",
                min_field: "base_delay",
            });
        }
        if self.max_attempts == 0 {
            return Err(ConfigError::Zero { field: "max_attempts" });
        }
        if self.connect_timeout.is_zero() {
            return Err(ConfigError::Zero { field: "connect_timeout" });
        }
        let r = self.randomization_factor;
        if !(0.0..1.0).contains(&r) {
            return Err(ConfigError::Randomization(r));
        }
        Ok(())
    }

    /// Un-jittered delay before attempt `attempt` (1-based).
    pub fn nominal_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        let delay = self.base_delay.saturating_mul(1u32 << exponent);
        delay.clamp(self.base_delay, self.max_delay)
    }

    /// Delay before attempt `attempt` with jitter applied.
    pub fn jittered_delay<R: Rng>(&self, attempt: u32, rng: &mut R) -> Duration {
        let nominal = self.nominal_delay(attempt);
        let r = self.randomization_factor;
        if r == 0.0 {
            return nominal;
        }
        nominal.mul_f64(1.0 + rng.gen_range(-r..=r))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Connected,
    Disconnected,
    Reconnecting { attempt: u32 },
    Failed,
}

impl ConnectionState {
    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionState::Connected)
    }
}

/// Tracks connection state, the attempt counter and the rooms to re-join.
#[derive(Debug)]
pub struct ReconnectionController {
    policy: ReconnectPolicy,
    state: ConnectionState,
    attempt: u32,
    rooms: BTreeSet<ProjectId>,
}

impl ReconnectionController {
    pub fn new(policy: ReconnectPolicy) -> Result<Self, ConfigError> {
        policy.validate()?;
        Ok(Self {
            policy,
            state: ConnectionState::Connecting,
            attempt: 0,
            rooms: BTreeSet::new(),
        })
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn policy(&self) -> &ReconnectPolicy {
        &self.policy
    }

    pub fn remember_room(&mut self, project: impl Into<ProjectId>) {
        self.rooms.insert(project.into());
    }

    pub fn forget_room(&mut self, project: &str) {
        self.rooms.remove(project);
    }

    pub fn rooms(&self) -> impl Iterator<Item = &ProjectId> {
        self.rooms.iter()
    }

    /// Transport is up. Resets the attempt counter and returns the rooms
    /// to re-join.
    pub fn on_connected(&mut self) -> Vec<ProjectId> {
        if self.attempt > 0 {
            log::info!("Reconnected after {} attempt(s)", self.attempt);
        }
        self.state = ConnectionState::Connected;
        self.attempt = 0;
        self.rooms.iter().cloned().collect()
    }

    /// Transport went away. Returns `true` if we were connected, in which
    /// case every locally held room view is now stale.
    pub fn on_transport_lost(&mut self) -> bool {
        let was_connected = self.state.is_connected();
        if self.state != ConnectionState::Failed {
            self.state = ConnectionState::Disconnected;
        }
        was_connected
    }

    /// Schedule the next attempt, or give up. `None` means `Failed`.
    pub fn next_delay<R: Rng>(&mut self, rng: &mut R) -> Option<Duration> {
        if self.state == ConnectionState::Failed {
            return None;
        }
        self.attempt += 1;
        if self.attempt > self.policy.max_attempts {
            log::warn!(
                "Giving up after {} reconnection attempts",
                self.policy.max_attempts
            );
            self.state = ConnectionState::Failed;
            return None;
        }
        self.state = ConnectionState::Reconnecting { attempt: self.attempt };
        Some(self.policy.jittered_delay(self.attempt, rng))
    }

    /// Start over from attempt one, bypassing any pending delay.
    pub fn retry_now(&mut self) {
        self.attempt = 0;
        self.state = ConnectionState::Connecting;
    }
}
