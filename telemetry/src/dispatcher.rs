//! Flush policy: when to send buffered events and what to do with the result.
//!
//! Every trigger (timer, critical capture, visibility loss, unload, manual)
//! goes through the same [`Dispatcher::flush`] state machine:
//!
//! 1. Empty buffer: nothing to do.
//! 2. Static/demo deployment: the buffer is discarded without sending.
//! 3. No authentication token: nothing is sent and nothing is dropped, so
//!    events captured before login are delivered after it.
//! 4. Timer trigger inside a backoff window: skipped until the window ends.
//! 5. Otherwise the buffer is snapshotted and sent as one batch. Success
//!    removes exactly the snapshot; failure keeps it and applies the
//!    [`BufferLimits`] bound.
//!
//! # In-flight Sends
//!
//! At most one send is in flight. A trigger that arrives while a send is
//! pending is coalesced into a no-op, except:
//!
//! - [`FlushReason::Unload`] waits for the pending send and then runs.
//! - A coalesced [`FlushReason::Critical`] schedules one follow-up attempt
//!   that runs as soon as the pending send succeeds.
//!
//! # Backoff
//!
//! Consecutive failures push back timer-driven flushes using exponential
//! backoff with jitter (30s → 300s, ±25% by default). Other triggers always
//! attempt a send. A 429 `Retry-After` replaces the computed delay.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use rand::Rng;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::buffer::{BufferLimits, EventBuffer};
use crate::context::{Deployment, TokenStore};
use crate::transport::{Transport, TransportError};
use crate::types::InteractionEvent;

/// Initial retry delay in seconds.
const INITIAL_RETRY_DELAY_SECS: u64 = 30;

/// Maximum retry delay in seconds.
const MAX_RETRY_DELAY_SECS: u64 = 300;

/// Jitter factor (±25%).
const JITTER_FACTOR: f64 = 0.25;

/// Why a flush was requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FlushReason {
    /// Recurring flush timer.
    Timer,
    /// A critical interaction was captured.
    Critical,
    /// The page became hidden.
    VisibilityChange,
    /// The page is being torn down.
    Unload,
    /// Explicit request from the host application.
    Manual,
}

impl fmt::Display for FlushReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Timer => "timer",
            Self::Critical => "critical",
            Self::VisibilityChange => "visibility_change",
            Self::Unload => "unload",
            Self::Manual => "manual",
        };
        f.write_str(name)
    }
}

/// What a flush attempt did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushOutcome {
    /// The buffer was empty.
    Empty,
    /// Another flush was in flight; this one did nothing.
    Coalesced,
    /// The deployment does not collect; buffered events were discarded.
    Suppressed { discarded: usize },
    /// No authentication token; events kept for later.
    Deferred { buffered: usize },
    /// Timer flush skipped because of backoff after earlier failures.
    BackingOff { retry_in: Duration },
    /// The batch was accepted.
    Sent { count: usize },
    /// The batch was rejected; events retained (after bounding).
    Failed { retained: usize, evicted: usize },
}

impl FlushOutcome {
    /// Returns `true` if a batch was delivered.
    #[must_use]
    pub fn is_sent(&self) -> bool {
        matches!(self, Self::Sent { .. })
    }
}

/// Capped exponential backoff applied to timer flushes after failures.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    /// Delay after the first failure.
    pub initial_delay: Duration,
    /// Upper bound for the delay.
    pub max_delay: Duration,
    /// Relative jitter applied to each delay (0.25 = ±25%).
    pub jitter_factor: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(INITIAL_RETRY_DELAY_SECS),
            max_delay: Duration::from_secs(MAX_RETRY_DELAY_SECS),
            jitter_factor: JITTER_FACTOR,
        }
    }
}

impl RetryPolicy {
    /// Short, jitter-free delays for tests.
    #[must_use]
    pub fn fast_for_tests() -> Self {
        Self {
            initial_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(80),
            jitter_factor: 0.0,
        }
    }

    /// Adds ±`jitter_factor` jitter to a duration.
    fn add_jitter(&self, duration: Duration) -> Duration {
        if self.jitter_factor <= 0.0 {
            return duration;
        }
        let mut rng = rand::rng();
        let jitter_range = duration.as_secs_f64() * self.jitter_factor;
        let jitter = rng.random_range(-jitter_range..=jitter_range);
        Duration::from_secs_f64((duration.as_secs_f64() + jitter).max(0.0))
    }
}

/// Backoff bookkeeping between flushes.
#[derive(Debug)]
struct Backoff {
    consecutive_failures: u32,
    current_delay: Duration,
    not_before: Option<Instant>,
}

impl Backoff {
    fn new(policy: &RetryPolicy) -> Self {
        Self {
            consecutive_failures: 0,
            current_delay: policy.initial_delay,
            not_before: None,
        }
    }

    /// Time left in the current backoff window.
    fn remaining(&self, now: Instant) -> Option<Duration> {
        self.not_before
            .filter(|deadline| *deadline > now)
            .map(|deadline| deadline - now)
    }

    fn record_failure(&mut self, policy: &RetryPolicy, error: &TransportError, now: Instant) {
        let delay = error
            .retry_after()
            .unwrap_or_else(|| policy.add_jitter(self.current_delay));
        self.not_before = Some(now + delay);
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        self.current_delay = (self.current_delay * 2).min(policy.max_delay);
    }

    fn reset(&mut self, policy: &RetryPolicy) {
        *self = Self::new(policy);
    }
}

/// Knobs for the flush state machine.
#[derive(Debug, Clone, Copy, Default)]
pub struct DispatchSettings {
    /// Whether a live collector exists.
    pub deployment: Deployment,
    /// Bound applied after failed sends.
    pub limits: BufferLimits,
    /// Backoff for timer flushes after failures.
    pub retry_policy: RetryPolicy,
    /// Also apply `limits` while waiting for a token.
    pub bound_while_unauthenticated: bool,
}

/// Owns the event buffer and decides when and how it is flushed.
pub struct Dispatcher {
    settings: DispatchSettings,
    buffer: Mutex<EventBuffer>,
    backoff: Mutex<Backoff>,
    transport: Arc<dyn Transport>,
    tokens: Arc<dyn TokenStore>,
    flush_gate: tokio::sync::Mutex<()>,
    follow_up: AtomicBool,
}

impl Dispatcher {
    /// Creates a dispatcher with an empty buffer.
    #[must_use]
    pub fn new(
        settings: DispatchSettings,
        transport: Arc<dyn Transport>,
        tokens: Arc<dyn TokenStore>,
    ) -> Self {
        Self {
            backoff: Mutex::new(Backoff::new(&settings.retry_policy)),
            settings,
            buffer: Mutex::new(EventBuffer::new()),
            transport,
            tokens,
            flush_gate: tokio::sync::Mutex::new(()),
            follow_up: AtomicBool::new(false),
        }
    }

    fn lock_buffer(&self) -> MutexGuard<'_, EventBuffer> {
        self.buffer.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_backoff(&self) -> MutexGuard<'_, Backoff> {
        self.backoff.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Appends an event. Never blocks on I/O and never truncates.
    pub fn append(&self, event: InteractionEvent) {
        self.lock_buffer().push(event);
    }

    /// Number of buffered events.
    #[must_use]
    pub fn buffer_len(&self) -> usize {
        self.lock_buffer().len()
    }

    /// Copies the buffered events, in capture order.
    #[must_use]
    pub fn buffered_events(&self) -> Vec<InteractionEvent> {
        self.lock_buffer().iter().cloned().collect()
    }

    /// Number of failed sends since the last success.
    #[must_use]
    pub fn consecutive_failures(&self) -> u32 {
        self.lock_backoff().consecutive_failures
    }

    /// Runs the flush state machine for `reason`.
    ///
    /// Safe to call concurrently; see the module docs for how overlapping
    /// calls are coalesced.
    pub async fn flush(&self, reason: FlushReason) -> FlushOutcome {
        let _gate = if reason == FlushReason::Unload {
            self.flush_gate.lock().await
        } else {
            match self.flush_gate.try_lock() {
                Ok(gate) => gate,
                Err(_) => {
                    if reason == FlushReason::Critical {
                        self.follow_up.store(true, Ordering::SeqCst);
                    }
                    debug!(reason = %reason, "Flush already in flight, coalesced");
                    return FlushOutcome::Coalesced;
                }
            }
        };

        let outcome = self.attempt(reason).await;

        let mut delivered = outcome.is_sent();
        while self.follow_up.swap(false, Ordering::SeqCst) && delivered {
            let follow_up = self.attempt(FlushReason::Critical).await;
            debug!(outcome = ?follow_up, "Follow-up flush for coalesced critical event");
            delivered = follow_up.is_sent();
        }

        outcome
    }

    async fn attempt(&self, reason: FlushReason) -> FlushOutcome {
        if self.lock_buffer().is_empty() {
            return FlushOutcome::Empty;
        }

        if !self.settings.deployment.collects() {
            let discarded = self.lock_buffer().clear();
            debug!(
                discarded,
                deployment = %self.settings.deployment,
                "Telemetry suppressed for deployment"
            );
            return FlushOutcome::Suppressed { discarded };
        }

        if !self.tokens.has_token() {
            return self.defer();
        }

        if reason == FlushReason::Timer {
            if let Some(retry_in) = self.lock_backoff().remaining(Instant::now()) {
                debug!(retry_in_ms = retry_in.as_millis(), "Timer flush skipped, backing off");
                return FlushOutcome::BackingOff { retry_in };
            }
        }

        let Some(snapshot) = self.lock_buffer().snapshot() else {
            return FlushOutcome::Empty;
        };
        let count = snapshot.len();

        debug!(reason = %reason, events = count, "Flushing interaction buffer");

        match self.transport.send(&snapshot.events).await {
            Ok(()) => {
                self.lock_buffer().acknowledge(&snapshot);
                self.lock_backoff().reset(&self.settings.retry_policy);
                info!(reason = %reason, events = count, "Interaction batch delivered");
                FlushOutcome::Sent { count }
            }
            Err(e) => {
                let failures = {
                    let mut backoff = self.lock_backoff();
                    backoff.record_failure(&self.settings.retry_policy, &e, Instant::now());
                    backoff.consecutive_failures
                };
                let mut buffer = self.lock_buffer();
                let evicted = buffer.enforce_bound(self.settings.limits);
                warn!(
                    error = %e,
                    reason = %reason,
                    events = count,
                    consecutive_failures = failures,
                    "Failed to deliver interaction batch, will retry on next trigger"
                );
                FlushOutcome::Failed {
                    retained: buffer.len(),
                    evicted,
                }
            }
        }
    }

    fn defer(&self) -> FlushOutcome {
        let mut buffer = self.lock_buffer();
        let limits = self.settings.limits;

        if self.settings.bound_while_unauthenticated {
            buffer.enforce_bound(limits);
        } else if buffer.len() > limits.high_water_mark {
            warn!(
                buffered = buffer.len(),
                high_water_mark = limits.high_water_mark,
                "No authentication token, buffer growing past high water mark"
            );
        }

        debug!(buffered = buffer.len(), "No authentication token, flush deferred");
        FlushOutcome::Deferred {
            buffered: buffer.len(),
        }
    }
}

impl fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dispatcher")
            .field("settings", &self.settings)
            .field("buffered", &self.buffer_len())
            .finish_non_exhaustive()
    }
}
