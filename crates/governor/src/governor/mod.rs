//! Adaptive fetch governor.
//!
//! Bounds concurrent outbound requests and spaces dispatches, adapting both
//! with AIMD: a run of successes adds one slot and shortens the delay, a run
//! of rate-limit-like errors halves the slots and lengthens the delay.
//! All state lives under one mutex that is never held across an await.

use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use tipoff_core::{GovernorConfig, TelemetryBus, TelemetryEvent};

use crate::client::{FetchClient, FetchError, FetchRequest};
use crate::error::GovernorError;

/// Snapshot of the adaptive state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GovernorState {
    pub current_concurrency_limit: usize,
    pub current_delay: Duration,
    pub consecutive_successes: u32,
    pub consecutive_errors: u32,
}

struct Inner {
    state: GovernorState,
    in_flight: usize,
    /// Earliest instant the next dispatch may start.
    next_dispatch: Option<Instant>,
    closed: bool,
}

pub struct FetchGovernor {
    config: GovernorConfig,
    inner: Mutex<Inner>,
    slot_freed: Notify,
    bus: Option<Arc<TelemetryBus>>,
    peak_in_flight: AtomicUsize,
}

/// A held concurrency slot. Dropping it releases the slot.
pub struct SlotPermit<'a> {
    governor: &'a FetchGovernor,
}

impl Drop for SlotPermit<'_> {
    fn drop(&mut self) {
        self.governor.release();
    }
}

impl FetchGovernor {
    pub fn new(config: GovernorConfig) -> Self {
        let state = GovernorState {
            current_concurrency_limit: config.initial_concurrency.max(1),
            current_delay: config.initial_delay(),
            consecutive_successes: 0,
            consecutive_errors: 0,
        };
        Self {
            config,
            inner: Mutex::new(Inner {
                state,
                in_flight: 0,
                next_dispatch: None,
                closed: false,
            }),
            slot_freed: Notify::new(),
            bus: None,
            peak_in_flight: AtomicUsize::new(0),
        }
    }

    /// Publish `GovernorStateChanged` on `bus` whenever limit or delay move.
    pub fn with_telemetry(mut self, bus: Arc<TelemetryBus>) -> Self {
        self.bus = Some(bus);
        self
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        // The guarded section never panics midway, so a poisoned state is still consistent.
        self.inner.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub fn state(&self) -> GovernorState {
        self.lock().state
    }

    pub fn in_flight(&self) -> usize {
        self.lock().in_flight
    }

    /// Highest number of simultaneously held slots observed.
    pub fn peak_in_flight(&self) -> usize {
        self.peak_in_flight.load(Ordering::Relaxed)
    }

    pub fn config(&self) -> &GovernorConfig {
        &self.config
    }

    /// Stop handing out slots. Pending and future acquisitions fail with
    /// [`GovernorError::Closed`]; held permits stay valid.
    pub fn close(&self) {
        self.lock().closed = true;
        self.slot_freed.notify_waiters();
        debug!("governor closed");
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    // ── Slots ───────────────────────────────────────────────────

    /// Wait for a free slot, then for the inter-request delay since the
    /// previous dispatch.
    pub async fn acquire(&self) -> Result<SlotPermit<'_>, GovernorError> {
        loop {
            let notified = self.slot_freed.notified();
            tokio::pin!(notified);
            // Register before checking so a release between check and await is not lost.
            notified.as_mut().enable();

            let reserved = {
                let mut inner = self.lock();
                if inner.closed {
                    return Err(GovernorError::Closed);
                }
                if inner.in_flight < inner.state.current_concurrency_limit {
                    inner.in_flight += 1;
                    self.peak_in_flight.fetch_max(inner.in_flight, Ordering::Relaxed);

                    let now = Instant::now();
                    let at = match inner.next_dispatch {
                        Some(next) if next > now => next,
                        _ => now,
                    };
                    inner.next_dispatch = Some(at + inner.state.current_delay);
                    Some(at)
                } else {
                    None
                }
            };

            if let Some(at) = reserved {
                let permit = SlotPermit { governor: self };
                tokio::time::sleep_until(at).await;
                return Ok(permit);
            }
            notified.await;
        }
    }

    fn release(&self) {
        {
            let mut inner = self.lock();
            inner.in_flight = inner.in_flight.saturating_sub(1);
        }
        self.slot_freed.notify_waiters();
    }

    // ── Calls ───────────────────────────────────────────────────

    /// Run `op` inside a slot and feed its outcome into the AIMD controller.
    ///
    /// Rate-limit-like errors count toward a decrease; other errors leave the
    /// state untouched and are returned unchanged.
    pub async fn execute<T, F, Fut>(&self, op: F) -> Result<T, GovernorError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, FetchError>>,
    {
        let permit = self.acquire().await?;
        let result = op().await;
        drop(permit);

        match &result {
            Ok(_) => self.record_success(),
            Err(e) if e.is_rate_limit_like() => self.record_rate_limited(),
            Err(e) => debug!(error = %e, "terminal fetch error, governor state unchanged"),
        }
        result.map_err(GovernorError::Fetch)
    }

    /// Fetch `request` through `client` under governance.
    pub async fn fetch(
        &self,
        client: &dyn FetchClient,
        request: &FetchRequest,
    ) -> Result<bytes::Bytes, GovernorError> {
        self.execute(|| client.fetch(request)).await
    }

    // ── AIMD ────────────────────────────────────────────────────

    /// Count a success; at the threshold add one slot and shorten the delay.
    pub fn record_success(&self) {
        let changed = {
            let mut inner = self.lock();
            let before = inner.state;
            let state = &mut inner.state;
            state.consecutive_successes += 1;
            state.consecutive_errors = 0;
            if state.consecutive_successes >= self.config.success_threshold {
                state.consecutive_successes = 0;
                state.current_concurrency_limit =
                    (state.current_concurrency_limit + 1).min(self.config.max_concurrency);
                state.current_delay = state
                    .current_delay
                    .mul_f64(self.config.recovery_factor)
                    .max(self.config.min_delay());
            }
            let after = inner.state;
            moved(&before, &after).then_some(after)
        };

        if let Some(state) = changed {
            debug!(
                limit = state.current_concurrency_limit,
                delay_ms = state.current_delay.as_millis() as u64,
                "governor increased"
            );
            self.slot_freed.notify_waiters();
            self.publish(&state);
        }
    }

    /// Count a rate-limit-like error; at the threshold halve the slots and
    /// lengthen the delay.
    pub fn record_rate_limited(&self) {
        let changed = {
            let mut inner = self.lock();
            let before = inner.state;
            let state = &mut inner.state;
            state.consecutive_errors += 1;
            state.consecutive_successes = 0;
            if state.consecutive_errors >= self.config.error_threshold {
                state.consecutive_errors = 0;
                state.current_concurrency_limit = (state.current_concurrency_limit / 2).max(1);
                // A zero delay would never grow, so back off from at least 1ms.
                let base = state
                    .current_delay
                    .max(self.config.min_delay())
                    .max(Duration::from_millis(1));
                let max = self.config.max_delay();
                state.current_delay =
                    Duration::try_from_secs_f64(base.as_secs_f64() * self.config.backoff_factor)
                        .unwrap_or(max)
                        .min(max);
            }
            let after = inner.state;
            moved(&before, &after).then_some(after)
        };

        if let Some(state) = changed {
            warn!(
                limit = state.current_concurrency_limit,
                delay_ms = state.current_delay.as_millis() as u64,
                "governor backing off"
            );
            self.publish(&state);
        }
    }

    fn publish(&self, state: &GovernorState) {
        if let Some(bus) = &self.bus {
            bus.publish(TelemetryEvent::GovernorStateChanged {
                limit: state.current_concurrency_limit,
                delay_ms: state.current_delay.as_millis() as u64,
            });
        }
    }

    pub fn log_summary(&self) {
        let state = self.state();
        info!(
            limit = state.current_concurrency_limit,
            delay_ms = state.current_delay.as_millis() as u64,
            peak_in_flight = self.peak_in_flight(),
            "governor summary"
        );
    }
}

fn moved(before: &GovernorState, after: &GovernorState) -> bool {
    before.current_concurrency_limit != after.current_concurrency_limit
        || before.current_delay != after.current_delay
}
