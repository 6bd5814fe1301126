//! Connection lifecycle and reconnect policy.
//!
//! [`LifecycleMachine`] is pure: it holds the state and backoff and answers
//! events with [`LifecycleAction`]s. [`Lifecycle`] is the async driver that
//! dials, sleeps, and closes sessions on its behalf.
//!
//! # State Machine
//!
//! ```text
//! ┌──────────────┐ connect ┌────────────┐  dial ok   ┌───────────┐
//! │ Disconnected │────────>│ Connecting │───────────>│ Connected │
//! └──────────────┘         └────────────┘            └───────────┘
//!        ↑                       │ dial failed             │ session failed
//!        │ give up / cancel      ↓                         ↓
//!        │                ┌──────────────┐<────────────────┘
//!        └────────────────│ Reconnecting │──┐
//!                         └──────────────┘  │ retry (dial)
//!                                ↑──────────┘
//! ```
//!
//! Nothing reconnects unless the caller reports a failure: sessions and
//! channels never retry on their own.

use std::{sync::Arc, time::Duration};

use rand::{Rng, SeedableRng, rngs::StdRng};
use tokio::sync::watch;

use crate::{
    CancelToken, Connector, RetryPolicy, ServerEndpoint, Session, TransportConfig, TransportError,
    error::ConnectionFailure,
};

/// Externally visible connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LifecycleState {
    /// No session and no attempt in progress
    Disconnected,
    /// First dial after an explicit connect
    Connecting,
    /// A session is live
    Connected,
    /// Waiting to retry, or retrying, after a failure
    Reconnecting,
}

/// Side effects requested by [`LifecycleMachine`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleAction {
    /// Close the current session, if any
    CloseSession,
    /// Attempt a new connection
    Dial,
    /// Sleep, then report [`LifecycleMachine::retry_elapsed`]
    RetryAfter(Duration),
    /// Stop and surface the last error
    GiveUp,
}

/// Capped exponential backoff with jitter.
#[derive(Debug, Clone)]
pub struct Backoff {
    policy: RetryPolicy,
    attempt: u32,
}

impl Backoff {
    /// Start at attempt zero.
    #[must_use]
    pub fn new(policy: RetryPolicy) -> Self {
        Self { policy, attempt: 0 }
    }

    /// Retries handed out since the last reset.
    #[must_use]
    pub fn attempts(&self) -> u32 {
        self.attempt
    }

    /// Delay before the next retry, or `None` once `max_attempts` retries
    /// have been handed out.
    ///
    /// The jittered delay lies in `[base * (1 - jitter), base]`, where `base`
    /// is `initial_backoff * multiplier^attempt` capped at `max_backoff`. A
    /// jitter that is not a finite number counts as zero.
    pub fn next_delay<R: Rng + ?Sized>(&mut self, rng: &mut R) -> Option<Duration> {
        if self.policy.max_attempts.is_some_and(|max| self.attempt >= max) {
            return None;
        }

        let base = self.base_delay();
        self.attempt = self.attempt.saturating_add(1);

        let jitter = if self.policy.jitter.is_finite() {
            self.policy.jitter.clamp(0.0, 1.0)
        } else {
            0.0
        };
        if jitter == 0.0 || base.is_zero() {
            return Some(base);
        }
        let factor = 1.0 - jitter * rng.gen_range(0.0..1.0);
        Some(base.mul_f64(factor))
    }

    /// Forget past attempts.
    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    fn base_delay(&self) -> Duration {
        let initial = self.policy.initial_backoff;
        let max = self.policy.max_backoff;
        if initial.is_zero() || initial >= max {
            return initial.min(max);
        }

        let exponent = i32::try_from(self.attempt).unwrap_or(i32::MAX);
        let scaled = initial.as_secs_f64() * self.policy.multiplier.max(1.0).powi(exponent);
        if scaled.is_finite() && scaled < max.as_secs_f64() {
            Duration::from_secs_f64(scaled)
        } else {
            max
        }
    }
}

/// Pure lifecycle state machine.
#[derive(Debug, Clone)]
pub struct LifecycleMachine {
    state: LifecycleState,
    enabled: bool,
    backoff: Backoff,
}

impl LifecycleMachine {
    /// Start disconnected.
    #[must_use]
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            state: LifecycleState::Disconnected,
            enabled: policy.enabled,
            backoff: Backoff::new(policy),
        }
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> LifecycleState {
        self.state
    }

    /// Caller asked to connect. Replaces any live session.
    pub fn connect_requested(&mut self) -> Vec<LifecycleAction> {
        let mut actions = Vec::new();
        if self.state == LifecycleState::Connected {
            actions.push(LifecycleAction::CloseSession);
        }
        self.state = LifecycleState::Connecting;
        self.backoff.reset();
        actions.push(LifecycleAction::Dial);
        actions
    }

    /// A dial produced a session.
    pub fn dial_succeeded(&mut self) -> Vec<LifecycleAction> {
        self.state = LifecycleState::Connected;
        self.backoff.reset();
        Vec::new()
    }

    /// A dial failed with an error that may clear up on its own.
    pub fn dial_failed<R: Rng + ?Sized>(&mut self, rng: &mut R) -> Vec<LifecycleAction> {
        self.schedule_retry(rng)
    }

    /// A dial failed in a way retrying cannot fix, such as a rejected
    /// certificate.
    pub fn dial_rejected(&mut self) -> Vec<LifecycleAction> {
        self.state = LifecycleState::Disconnected;
        self.backoff.reset();
        vec![LifecycleAction::GiveUp]
    }

    /// The live session reported a connection or stream failure.
    pub fn session_failed<R: Rng + ?Sized>(&mut self, rng: &mut R) -> Vec<LifecycleAction> {
        let mut actions = vec![LifecycleAction::CloseSession];
        actions.extend(self.schedule_retry(rng));
        actions
    }

    /// A `RetryAfter` delay ran out.
    pub fn retry_elapsed(&mut self) -> Vec<LifecycleAction> {
        match self.state {
            LifecycleState::Reconnecting => vec![LifecycleAction::Dial],
            _ => Vec::new(),
        }
    }

    /// The caller's cancellation stopped a connect or retry loop.
    pub fn cancelled(&mut self) -> Vec<LifecycleAction> {
        self.closed()
    }

    /// Caller asked to disconnect.
    pub fn closed(&mut self) -> Vec<LifecycleAction> {
        let actions = match self.state {
            LifecycleState::Connected => vec![LifecycleAction::CloseSession],
            _ => Vec::new(),
        };
        self.state = LifecycleState::Disconnected;
        self.backoff.reset();
        actions
    }

    fn schedule_retry<R: Rng + ?Sized>(&mut self, rng: &mut R) -> Vec<LifecycleAction> {
        let delay = if self.enabled { self.backoff.next_delay(rng) } else { None };
        match delay {
            Some(delay) => {
                self.state = LifecycleState::Reconnecting;
                vec![LifecycleAction::RetryAfter(delay)]
            },
            None => {
                self.state = LifecycleState::Disconnected;
                self.backoff.reset();
                vec![LifecycleAction::GiveUp]
            },
        }
    }
}

/// Async driver that owns the current [`Session`] and reconnects it.
///
/// Every successful connect yields a new session with a higher
/// [`generation`](Session::generation). Channels of an older session are
/// permanently invalid once it is replaced; callers reopen both channels on
/// the new session.
pub struct Lifecycle<C> {
    connector: Arc<C>,
    endpoint: ServerEndpoint,
    config: TransportConfig,
    machine: LifecycleMachine,
    rng: StdRng,
    state: watch::Sender<LifecycleState>,
    generation: u64,
    current: Option<Session>,
}

impl<C: Connector> Lifecycle<C> {
    /// Create a disconnected lifecycle.
    pub fn new(
        connector: C,
        endpoint: ServerEndpoint,
        config: TransportConfig,
        policy: RetryPolicy,
    ) -> Self {
        let (state, _) = watch::channel(LifecycleState::Disconnected);
        Self {
            connector: Arc::new(connector),
            endpoint,
            config,
            machine: LifecycleMachine::new(policy),
            rng: StdRng::from_entropy(),
            state,
            generation: 0,
            current: None,
        }
    }

    /// Replace the jitter source, for reproducible delays.
    #[must_use]
    pub fn with_rng(mut self, rng: StdRng) -> Self {
        self.rng = rng;
        self
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> LifecycleState {
        self.machine.state()
    }

    /// Watch state transitions.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<LifecycleState> {
        self.state.subscribe()
    }

    /// The live session, if connected.
    #[must_use]
    pub fn session(&self) -> Option<&Session> {
        self.current.as_ref()
    }

    /// Server this lifecycle connects to.
    #[must_use]
    pub fn endpoint(&self) -> &ServerEndpoint {
        &self.endpoint
    }

    /// Connect, retrying per policy on connection failures.
    ///
    /// A live session is closed first.
    ///
    /// # Errors
    ///
    /// - the last `Connection` error once retries are disabled or exhausted
    /// - a non-transient dial error (TLS rejection, protocol mismatch) at
    ///   once, without retrying
    /// - `Cancelled` if `cancel` fires; the state is then `Disconnected`
    pub async fn connect(&mut self, cancel: &CancelToken) -> Result<Session, TransportError> {
        tracing::info!(endpoint = %self.endpoint, "connecting");
        let actions = self.machine.connect_requested();
        self.drive(actions, None, cancel).await
    }

    /// Report a failure observed on `failed` and reconnect.
    ///
    /// Errors that do not warrant a reconnect (cancellation, clean end of
    /// stream, misuse) are returned unchanged. If `failed` was already
    /// replaced, for example because both channels reported the same
    /// connection loss, the current session is returned without dialing.
    ///
    /// # Errors
    ///
    /// As [`connect`](Self::connect); with retries disabled the reported
    /// error is returned after the session is closed.
    pub async fn recover(
        &mut self,
        failed: &Session,
        error: &TransportError,
        cancel: &CancelToken,
    ) -> Result<Session, TransportError> {
        if !error.triggers_reconnect() {
            return Err(error.clone());
        }

        match &self.current {
            Some(current) if current.generation() == failed.generation() => {},
            Some(current) => return Ok(current.clone()),
            None => return Err(error.clone()),
        }

        tracing::warn!(generation = failed.generation(), error = %error, "session failed");
        let actions = self.machine.session_failed(&mut self.rng);
        self.drive(actions, Some(error.clone()), cancel).await
    }

    /// Close the live session, if any, and stay disconnected.
    pub async fn close(&mut self) {
        let actions = self.machine.closed();
        for action in actions {
            if action == LifecycleAction::CloseSession {
                self.close_current().await;
            }
        }
        self.publish();
    }

    async fn drive(
        &mut self,
        mut actions: Vec<LifecycleAction>,
        mut last_error: Option<TransportError>,
        cancel: &CancelToken,
    ) -> Result<Session, TransportError> {
        loop {
            self.publish();
            let mut next = Vec::new();

            for action in actions {
                match action {
                    LifecycleAction::CloseSession => self.close_current().await,
                    LifecycleAction::Dial => {
                        let generation = self.generation + 1;
                        let dial = Session::establish(
                            self.connector.as_ref(),
                            self.endpoint.clone(),
                            self.config.clone(),
                            generation,
                        );
                        let outcome = tokio::select! {
                            biased;
                            () = cancel.cancelled() => return Err(self.abort().await),
                            outcome = dial => outcome,
                        };

                        match outcome {
                            Ok(session) => {
                                self.generation = generation;
                                self.current = Some(session.clone());
                                self.machine.dial_succeeded();
                                self.publish();
                                return Ok(session);
                            },
                            Err(err) => {
                                tracing::warn!(endpoint = %self.endpoint, error = %err, "dial failed");
                                let actions = if err.is_transient() {
                                    self.machine.dial_failed(&mut self.rng)
                                } else {
                                    self.machine.dial_rejected()
                                };
                                last_error = Some(err);
                                next.extend(actions);
                            },
                        }
                    },
                    LifecycleAction::RetryAfter(delay) => {
                        tracing::info!(endpoint = %self.endpoint, ?delay, "reconnecting");
                        tokio::select! {
                            biased;
                            () = cancel.cancelled() => return Err(self.abort().await),
                            () = tokio::time::sleep(delay) => {},
                        }
                        next.extend(self.machine.retry_elapsed());
                    },
                    LifecycleAction::GiveUp => {
                        self.publish();
                        tracing::warn!(endpoint = %self.endpoint, "giving up on connection");
                        return Err(last_error.unwrap_or_else(|| {
                            TransportError::connection(
                                ConnectionFailure::Unreachable,
                                "gave up reconnecting",
                            )
                        }));
                    },
                }
            }

            if next.is_empty() {
                return Err(TransportError::Cancelled);
            }
            actions = next;
        }
    }

    async fn abort(&mut self) -> TransportError {
        tracing::debug!(endpoint = %self.endpoint, "connect cancelled");
        let actions = self.machine.cancelled();
        if actions.contains(&LifecycleAction::CloseSession) {
            self.close_current().await;
        }
        self.publish();
        TransportError::Cancelled
    }

    async fn close_current(&mut self) {
        if let Some(session) = self.current.take() {
            session.close_and_wait().await;
        }
    }

    fn publish(&self) {
        let state = self.machine.state();
        self.state.send_if_modified(|current| {
            if *current == state {
                return false;
            }
            *current = state;
            true
        });
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    fn policy() -> RetryPolicy {
        RetryPolicy {
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(1),
            jitter: 0.0,
            ..RetryPolicy::default()
        }
    }

    #[test]
    fn backoff_doubles_until_capped() {
        let mut backoff = Backoff::new(policy());
        let mut rng = StdRng::seed_from_u64(7);

        let delays: Vec<_> = (0..6).filter_map(|_| backoff.next_delay(&mut rng)).collect();
        assert_eq!(delays, vec![
            Duration::from_millis(100),
            Duration::from_millis(200),
            Duration::from_millis(400),
            Duration::from_millis(800),
            Duration::from_secs(1),
            Duration::from_secs(1),
        ]);
    }

    #[test]
    fn backoff_stops_after_max_attempts() {
        let mut backoff = Backoff::new(RetryPolicy { max_attempts: Some(2), ..policy() });
        let mut rng = StdRng::seed_from_u64(7);

        assert!(backoff.next_delay(&mut rng).is_some());
        assert!(backoff.next_delay(&mut rng).is_some());
        assert_eq!(backoff.next_delay(&mut rng), None);

        backoff.reset();
        assert_eq!(backoff.next_delay(&mut rng), Some(Duration::from_millis(100)));
    }

    proptest! {
        #[test]
        fn jittered_delay_stays_within_bounds(
            seed in any::<u64>(),
            jitter in 0.0f64..=1.0,
            attempts in 1usize..20,
        ) {
            let policy = RetryPolicy { jitter, ..policy() };
            let mut plain = Backoff::new(RetryPolicy { jitter: 0.0, ..policy.clone() });
            let mut jittered = Backoff::new(policy);
            let mut rng = StdRng::seed_from_u64(seed);

            for _ in 0..attempts {
                let base = plain.next_delay(&mut rng).expect("unbounded");
                let delay = jittered.next_delay(&mut rng).expect("unbounded");
                prop_assert!(delay <= base);
                prop_assert!(delay >= base.mul_f64(1.0 - jitter) - Duration::from_nanos(1));
            }
        }
    }

    #[test]
    fn non_finite_jitter_means_no_jitter() {
        let mut rng = StdRng::seed_from_u64(7);
        for jitter in [f64::NAN, f64::INFINITY, f64::NEG_INFINITY] {
            let mut backoff = Backoff::new(RetryPolicy { jitter, ..policy() });
            assert_eq!(backoff.next_delay(&mut rng), Some(Duration::from_millis(100)), "{jitter}");
            assert_eq!(backoff.next_delay(&mut rng), Some(Duration::from_millis(200)), "{jitter}");
        }
    }

    #[test]
    fn rejected_dial_gives_up_even_with_retries_left() {
        let mut machine = LifecycleMachine::new(policy());
        let mut rng = StdRng::seed_from_u64(1);
        machine.connect_requested();
        machine.dial_failed(&mut rng);
        machine.retry_elapsed();

        assert_eq!(machine.dial_rejected(), vec![LifecycleAction::GiveUp]);
        assert_eq!(machine.state(), LifecycleState::Disconnected);

        machine.connect_requested();
        assert_eq!(
            machine.dial_failed(&mut rng),
            vec![LifecycleAction::RetryAfter(Duration::from_millis(100))],
            "backoff starts over after giving up"
        );
    }

    #[test]
    fn connect_then_failure_reconnects() {
        let mut machine = LifecycleMachine::new(policy());
        let mut rng = StdRng::seed_from_u64(1);

        assert_eq!(machine.connect_requested(), vec![LifecycleAction::Dial]);
        assert_eq!(machine.state(), LifecycleState::Connecting);

        assert!(machine.dial_succeeded().is_empty());
        assert_eq!(machine.state(), LifecycleState::Connected);

        assert_eq!(machine.session_failed(&mut rng), vec![
            LifecycleAction::CloseSession,
            LifecycleAction::RetryAfter(Duration::from_millis(100)),
        ]);
        assert_eq!(machine.state(), LifecycleState::Reconnecting);
        assert_eq!(machine.retry_elapsed(), vec![LifecycleAction::Dial]);

        assert_eq!(
            machine.dial_failed(&mut rng),
            vec![LifecycleAction::RetryAfter(Duration::from_millis(200))]
        );

        machine.dial_succeeded();
        assert_eq!(
            machine.session_failed(&mut rng),
            vec![
                LifecycleAction::CloseSession,
                LifecycleAction::RetryAfter(Duration::from_millis(100))
            ],
            "backoff resets after a successful dial"
        );
    }

    #[test]
    fn disabled_policy_gives_up_immediately() {
        let mut machine = LifecycleMachine::new(RetryPolicy::disabled());
        let mut rng = StdRng::seed_from_u64(1);

        machine.connect_requested();
        assert_eq!(machine.dial_failed(&mut rng), vec![LifecycleAction::GiveUp]);
        assert_eq!(machine.state(), LifecycleState::Disconnected);

        machine.connect_requested();
        machine.dial_succeeded();
        assert_eq!(machine.session_failed(&mut rng), vec![
            LifecycleAction::CloseSession,
            LifecycleAction::GiveUp
        ]);
        assert_eq!(machine.state(), LifecycleState::Disconnected);
    }

    #[test]
    fn connect_while_connected_replaces_session() {
        let mut machine = LifecycleMachine::new(policy());
        machine.connect_requested();
        machine.dial_succeeded();

        assert_eq!(machine.connect_requested(), vec![
            LifecycleAction::CloseSession,
            LifecycleAction::Dial
        ]);
    }

    #[test]
    fn retry_elapsed_is_ignored_after_close() {
        let mut machine = LifecycleMachine::new(policy());
        let mut rng = StdRng::seed_from_u64(1);
        machine.connect_requested();
        machine.dial_failed(&mut rng);

        assert!(machine.closed().is_empty());
        assert!(machine.retry_elapsed().is_empty());
        assert_eq!(machine.state(), LifecycleState::Disconnected);
    }
}
