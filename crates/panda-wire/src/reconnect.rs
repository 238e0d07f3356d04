//! Connection lifecycle shared by the debug bridge and the language-service connector.
//!
//! ```text
//! Idle --start--> Connecting --ok--> Connected
//!                     |                  |
//!                  failure          closed/error
//!                     v                  v
//!                  Backoff  <------------+   (continuous)
//!                     |
//!                  delay --> Connecting
//!
//! any --stop()--> Stopped (terminal)
//! ```
//!
//! Every asynchronous step captures a [`Generation`] when it starts and re-checks
//! it before changing state. A stale generation means "do nothing".

use std::{fmt, time::Duration};

use parking_lot::Mutex;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::channel::{ConnectionId, Endpoint, ResilientChannel};
use crate::error::{Result, WireError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Idle,
    Connecting,
    Connected,
    Backoff,
    Stopped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryMode {
    /// Report the first failure to the caller. Used by the debug bridge.
    SingleAttempt,
    /// Retry at a fixed delay until stopped. Used by the language-service connector.
    Continuous,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Generation(u64);

impl fmt::Display for Generation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug)]
struct Lifecycle {
    generation: u64,
    state: ConnectionState,
}

#[derive(Debug)]
pub struct ReconnectPolicy {
    mode: RetryMode,
    retry_delay: Duration,
    lifecycle: Mutex<Lifecycle>,
    state_tx: watch::Sender<ConnectionState>,
    stopped: CancellationToken,
}

impl ReconnectPolicy {
    pub fn new(mode: RetryMode, retry_delay: Duration) -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::Idle);
        Self {
            mode,
            retry_delay,
            lifecycle: Mutex::new(Lifecycle {
                generation: 0,
                state: ConnectionState::Idle,
            }),
            state_tx,
            stopped: CancellationToken::new(),
        }
    }

    pub fn single_attempt() -> Self {
        Self::new(RetryMode::SingleAttempt, Duration::ZERO)
    }

    pub fn continuous(retry_delay: Duration) -> Self {
        Self::new(RetryMode::Continuous, retry_delay)
    }

    pub fn mode(&self) -> RetryMode {
        self.mode
    }

    pub fn retry_delay(&self) -> Duration {
        self.retry_delay
    }

    /// Begin a new generation. Any loop holding an older generation becomes stale.
    ///
    /// Returns `None` once the policy has been stopped.
    pub fn start(&self) -> Option<Generation> {
        let mut lifecycle = self.lifecycle.lock();
        if lifecycle.state == ConnectionState::Stopped {
            return None;
        }
        lifecycle.generation += 1;
        self.set_state(&mut lifecycle, ConnectionState::Connecting);
        Some(Generation(lifecycle.generation))
    }

    /// Begin a new generation only if `generation` is still the current one.
    ///
    /// Delayed restarts use this so that a restart scheduled before a manual
    /// restart or a stop does nothing when it fires.
    pub fn restart_if_current(&self, generation: Generation) -> Option<Generation> {
        let mut lifecycle = self.lifecycle.lock();
        if lifecycle.state == ConnectionState::Stopped || lifecycle.generation != generation.0 {
            return None;
        }
        lifecycle.generation += 1;
        self.set_state(&mut lifecycle, ConnectionState::Connecting);
        Some(Generation(lifecycle.generation))
    }

    pub fn is_current(&self, generation: Generation) -> bool {
        let lifecycle = self.lifecycle.lock();
        lifecycle.state != ConnectionState::Stopped && lifecycle.generation == generation.0
    }

    /// Move to `to` if `generation` is current. Returns whether the transition happened.
    pub fn transition(&self, generation: Generation, to: ConnectionState) -> bool {
        let mut lifecycle = self.lifecycle.lock();
        if lifecycle.state == ConnectionState::Stopped || lifecycle.generation != generation.0 {
            return false;
        }
        self.set_state(&mut lifecycle, to);
        true
    }

    /// Drive `channel` to a connected state for `generation`.
    ///
    /// In [`RetryMode::SingleAttempt`] the first failure is returned. In
    /// [`RetryMode::Continuous`] failures are logged and retried after the fixed
    /// delay until the generation goes stale, which yields [`WireError::Cancelled`].
    pub async fn connect(
        &self,
        generation: Generation,
        channel: &ResilientChannel,
        endpoint: &Endpoint,
    ) -> Result<ConnectionId> {
        let mut attempt: u64 = 0;
        loop {
            if !self.transition(generation, ConnectionState::Connecting) {
                return Err(WireError::Cancelled);
            }
            attempt += 1;

            let err = match channel.connect(endpoint).await {
                Ok(id) => {
                    if self.transition(generation, ConnectionState::Connected) {
                        tracing::info!(
                            target: "panda.wire",
                            %endpoint,
                            %generation,
                            connection = %id,
                            "connected"
                        );
                        return Ok(id);
                    }
                    channel.close_connection(id);
                    return Err(WireError::Cancelled);
                }
                Err(err) => err,
            };
            if err.is_cancelled() {
                return Err(err);
            }

            match self.mode {
                RetryMode::SingleAttempt => {
                    self.transition(generation, ConnectionState::Idle);
                    tracing::warn!(target: "panda.wire", %endpoint, error = %err, "connect failed");
                    return Err(err);
                }
                RetryMode::Continuous => {
                    if !self.transition(generation, ConnectionState::Backoff) {
                        return Err(WireError::Cancelled);
                    }
                    tracing::warn!(
                        target: "panda.wire",
                        %endpoint,
                        attempt,
                        error = %err,
                        retry_in = ?self.retry_delay,
                        "connect failed, retrying"
                    );
                    if !self.wait(generation, self.retry_delay).await {
                        return Err(WireError::Cancelled);
                    }
                }
            }
        }
    }

    /// Record that the live connection went away.
    ///
    /// Returns the generation a delayed restart should be keyed on, or `None`
    /// when nothing should follow (single-attempt mode, or not connected).
    pub fn connection_lost(&self) -> Option<Generation> {
        let mut lifecycle = self.lifecycle.lock();
        if lifecycle.state != ConnectionState::Connected {
            return None;
        }
        match self.mode {
            RetryMode::SingleAttempt => {
                self.set_state(&mut lifecycle, ConnectionState::Idle);
                None
            }
            RetryMode::Continuous => {
                self.set_state(&mut lifecycle, ConnectionState::Backoff);
                Some(Generation(lifecycle.generation))
            }
        }
    }

    /// Sleep for `delay`, waking early on [`ReconnectPolicy::stop`].
    ///
    /// Returns whether `generation` is still current afterwards.
    pub async fn wait(&self, generation: Generation, delay: Duration) -> bool {
        tokio::select! {
            _ = self.stopped.cancelled() => {}
            _ = tokio::time::sleep(delay) => {}
        }
        self.is_current(generation)
    }

    /// Enter the terminal `Stopped` state. Pending delays wake up stale.
    pub fn stop(&self) {
        {
            let mut lifecycle = self.lifecycle.lock();
            if lifecycle.state == ConnectionState::Stopped {
                return;
            }
            lifecycle.generation += 1;
            self.set_state(&mut lifecycle, ConnectionState::Stopped);
        }
        self.stopped.cancel();
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.is_cancelled()
    }

    pub fn state(&self) -> ConnectionState {
        self.lifecycle.lock().state
    }

    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }

    fn set_state(&self, lifecycle: &mut Lifecycle, to: ConnectionState) {
        if lifecycle.state != to {
            tracing::trace!(
                target: "panda.wire",
                generation = lifecycle.generation,
                from = ?lifecycle.state,
                ?to,
                "state transition"
            );
        }
        lifecycle.state = to;
        self.state_tx.send_replace(to);
    }
}
