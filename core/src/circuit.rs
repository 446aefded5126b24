//! Circuit breaker built on a state machine
//!
//! Closed → Open when consecutive failures reach the threshold, Open →
//! HalfOpen once the reset timeout has elapsed (checked lazily by
//! [`CircuitBreaker::is_open`]), HalfOpen → Closed on the next success or back
//! to Open on the next failure.
//!
//! Transitions are serialized by a short mutex around the machine; the
//! failure counter is an atomic shared with the machine's guards. While
//! HalfOpen, every caller that asks `is_open()` is let through, so several
//! probes may run concurrently.

use crate::callbacks::{Callbacks, Transition};
use crate::errors::ConfigError;
use state_machines::state_machine;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tracing::{info, warn};

/// Circuit breaker configuration
#[derive(Debug, Clone, PartialEq)]
pub struct CircuitConfig {
    /// Consecutive failures that open the circuit
    pub failure_threshold: u32,

    /// Time the circuit stays open before letting a probe through
    pub reset_timeout: Duration,

    /// Jitter factor for reset_timeout (0.0 = no jitter, 1.0 = full jitter)
    /// Uses chrono-machines formula: timeout * (1 - jitter + rand * jitter)
    pub jitter_factor: f64,
}

impl Default for CircuitConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            reset_timeout: Duration::from_secs(30),
            jitter_factor: 0.0,
        }
    }
}

impl CircuitConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.failure_threshold == 0 {
            return Err(ConfigError::ZeroFailureThreshold);
        }
        if !(0.0..=1.0).contains(&self.jitter_factor) {
            return Err(ConfigError::InvalidJitter(self.jitter_factor));
        }
        Ok(())
    }
}

/// Public view of the machine's state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

impl BreakerState {
    fn from_name(name: &str) -> Self {
        match name {
            "Open" => BreakerState::Open,
            "HalfOpen" => BreakerState::HalfOpen,
            _ => BreakerState::Closed,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            BreakerState::Closed => "Closed",
            BreakerState::Open => "Open",
            BreakerState::HalfOpen => "HalfOpen",
        }
    }
}

/// Point-in-time view of a circuit
#[derive(Debug, Clone, PartialEq)]
pub struct CircuitSnapshot {
    pub state: BreakerState,
    pub consecutive_failures: u32,
    pub failure_threshold: u32,
    pub reset_timeout: Duration,
    /// Time left before a probe is allowed, if currently open
    pub open_remaining: Option<Duration>,
    /// Callers let through since entering HalfOpen
    pub half_open_probes: u32,
}

/// Circuit breaker context - shared data across all states
#[derive(Debug, Clone)]
pub struct CircuitContext {
    pub name: String,
    pub config: CircuitConfig,
    failures: Arc<AtomicU32>,
    started: Instant,
}

impl Default for CircuitContext {
    fn default() -> Self {
        Self {
            name: String::new(),
            config: CircuitConfig::default(),
            failures: Arc::new(AtomicU32::new(0)),
            started: Instant::now(),
        }
    }
}

impl CircuitContext {
    fn consecutive_failures(&self) -> u32 {
        self.failures.load(Ordering::Acquire)
    }

    /// Seconds since the circuit was created, immune to wall-clock jumps
    fn monotonic_time(&self) -> f64 {
        self.started.elapsed().as_secs_f64()
    }
}

/// Data specific to the Open state
#[derive(Debug, Clone, Default)]
pub struct OpenData {
    /// Time of the failure that (re)opened the circuit
    pub opened_at: f64,
}

/// Data specific to the HalfOpen state
#[derive(Debug, Clone, Default)]
pub struct HalfOpenData {
    pub probes: u32,
}

state_machine! {
    name: Circuit,
    context: CircuitContext,
    dynamic: true,

    initial: Closed,
    states: [
        Closed,
        Open(OpenData),
        HalfOpen(HalfOpenData),
    ],
    events {
        trip {
            guards: [should_open],
            transition: { from: [Closed, HalfOpen], to: Open }
        }
        attempt_reset {
            guards: [timeout_elapsed],
            transition: { from: Open, to: HalfOpen }
        }
        close {
            guards: [should_close],
            transition: { from: HalfOpen, to: Closed }
        }
    }
}

impl Circuit<Closed> {
    fn should_open(&self, ctx: &CircuitContext) -> bool {
        ctx.consecutive_failures() >= ctx.config.failure_threshold
    }
}

impl Circuit<HalfOpen> {
    /// A failed probe always reopens
    fn should_open(&self, _ctx: &CircuitContext) -> bool {
        true
    }

    /// The success path clears the counter before asking to close
    fn should_close(&self, ctx: &CircuitContext) -> bool {
        ctx.consecutive_failures() == 0
    }
}

impl Circuit<Open> {
    fn timeout_elapsed(&self, ctx: &CircuitContext) -> bool {
        let Some(data) = self.state_data_open() else {
            return true;
        };
        let elapsed = ctx.monotonic_time() - data.opened_at;

        elapsed > effective_timeout_secs(&ctx.config)
    }
}

fn effective_timeout_secs(config: &CircuitConfig) -> f64 {
    let timeout_secs = config.reset_timeout.as_secs_f64();
    if config.jitter_factor <= 0.0 {
        return timeout_secs;
    }

    let timeout_ms = config.reset_timeout.as_millis() as u64;
    let policy = chrono_machines::Policy {
        max_attempts: 1,
        base_delay_ms: timeout_ms,
        multiplier: 1.0,
        max_delay_ms: timeout_ms,
    };
    (policy.calculate_delay(1, config.jitter_factor) as f64) / 1000.0
}

/// Thread-safe circuit breaker shared by every call of a guard
pub struct CircuitBreaker {
    machine: Mutex<DynamicCircuit>,
    context: CircuitContext,
    callbacks: Callbacks,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: CircuitConfig) -> Result<Self, ConfigError> {
        Self::with_callbacks(name, config, Callbacks::new())
    }

    pub fn with_callbacks(
        name: impl Into<String>,
        config: CircuitConfig,
        callbacks: Callbacks,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        let context = CircuitContext {
            name: name.into(),
            config,
            ..CircuitContext::default()
        };
        let machine = DynamicCircuit::new(context.clone());

        Ok(Self {
            machine: Mutex::new(machine),
            context,
            callbacks,
        })
    }

    pub fn name(&self) -> &str {
        &self.context.name
    }

    pub fn config(&self) -> &CircuitConfig {
        &self.context.config
    }

    /// Whether calls must be short-circuited right now
    ///
    /// An Open circuit whose reset timeout has elapsed moves to HalfOpen as a
    /// side effect of this query and reports `false`, letting the caller
    /// through as a probe.
    pub fn is_open(&self) -> bool {
        let mut transition = None;

        let open = {
            let mut machine = self.lock_machine();

            if machine.current_state() == "Open"
                && machine.handle(CircuitEvent::AttemptReset).is_ok()
            {
                transition = Some(self.transition(BreakerState::Open, BreakerState::HalfOpen));
            }

            match machine.current_state() {
                "Open" => true,
                "HalfOpen" => {
                    if let Some(data) = machine.half_open_data_mut() {
                        data.probes = data.probes.saturating_add(1);
                    }
                    false
                }
                _ => false,
            }
        };

        if let Some(transition) = transition {
            info!(circuit = %self.context.name, "Circuit breaker half-open after reset timeout");
            self.callbacks.fire(&transition);
        }
        open
    }

    pub fn is_closed(&self) -> bool {
        self.lock_machine().current_state() == "Closed"
    }

    pub fn state(&self) -> BreakerState {
        BreakerState::from_name(self.state_name())
    }

    pub fn state_name(&self) -> &'static str {
        self.lock_machine().current_state()
    }

    /// Clear the failure count; a HalfOpen circuit closes
    ///
    /// A success landing while Open (a call admitted before the trip) is
    /// ignored so the open circuit keeps its failure count.
    pub fn record_success(&self) {
        let closed = {
            let mut machine = self.lock_machine();
            match machine.current_state() {
                "Open" => false,
                "HalfOpen" => {
                    self.context.failures.store(0, Ordering::Release);
                    machine.handle(CircuitEvent::Close).is_ok()
                }
                _ => {
                    self.context.failures.store(0, Ordering::Release);
                    false
                }
            }
        };

        if closed {
            info!(circuit = %self.context.name, "Circuit breaker closed after successful probe");
            self.callbacks
                .fire(&self.transition(BreakerState::HalfOpen, BreakerState::Closed));
        }
    }

    /// Count a failure; trips the circuit at the threshold or on a failed probe
    pub fn record_failure(&self) {
        let failures = self
            .context
            .failures
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                Some(n.saturating_add(1))
            })
            .map_or(u32::MAX, |previous| previous.saturating_add(1));

        let from = {
            let mut machine = self.lock_machine();
            let from = BreakerState::from_name(machine.current_state());

            if from != BreakerState::Open && machine.handle(CircuitEvent::Trip).is_ok() {
                let now = self.context.monotonic_time();
                if let Some(data) = machine.open_data_mut() {
                    data.opened_at = now;
                }
                Some(from)
            } else {
                None
            }
        };

        if let Some(from) = from {
            warn!(
                circuit = %self.context.name,
                failures,
                "Circuit breaker opened after {} failures",
                failures
            );
            self.callbacks
                .fire(&self.transition(from, BreakerState::Open));
        }
    }

    pub fn snapshot(&self) -> CircuitSnapshot {
        let machine = self.lock_machine();
        let state = BreakerState::from_name(machine.current_state());

        let open_remaining = machine.open_data().map(|data| {
            let elapsed = self.context.monotonic_time() - data.opened_at;
            let remaining = self.context.config.reset_timeout.as_secs_f64() - elapsed;
            Duration::from_secs_f64(remaining.max(0.0))
        });
        let half_open_probes = machine.half_open_data().map_or(0, |data| data.probes);

        CircuitSnapshot {
            state,
            consecutive_failures: self.context.consecutive_failures(),
            failure_threshold: self.context.config.failure_threshold,
            reset_timeout: self.context.config.reset_timeout,
            open_remaining,
            half_open_probes,
        }
    }

    /// Forget all failures and return to Closed
    pub fn reset(&self) {
        self.context.failures.store(0, Ordering::Release);
        *self.lock_machine() = DynamicCircuit::new(self.context.clone());
    }

    fn transition(&self, from: BreakerState, to: BreakerState) -> Transition {
        Transition {
            circuit: self.context.name.clone(),
            from,
            to,
            consecutive_failures: self.context.consecutive_failures(),
        }
    }

    fn lock_machine(&self) -> MutexGuard<'_, DynamicCircuit> {
        self.machine.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl std::fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("name", &self.context.name)
            .field("state", &self.state_name())
            .field("consecutive_failures", &self.context.consecutive_failures())
            .field("callbacks", &self.callbacks)
            .finish()
    }
}
