//! Circuit breaker decisions over a service's runtime record.
//!
//! ```text
//! closed ──fail_count >= threshold──▶ open ──cooldown elapsed──▶ half_open
//!    ▲                                  ▲                            │
//!    └──────────── success ─────────────┼──────── trial fails ───────┘
//! ```
//!
//! `open → half_open` is evaluated lazily when `may_run` is asked, so no
//! timer is needed. `half_open → closed` happens in `mark_completed`.

use wiggum_core::CircuitBreakerSpec;

use crate::state::{CircuitState, ServiceRuntimeState};

/// Whether the breaker permits an execution at `now`.
/// Promotes `open` to `half_open` once the cooldown has elapsed.
pub fn may_run(state: &mut ServiceRuntimeState, cb: Option<&CircuitBreakerSpec>, now: i64) -> bool {
    let Some(cb) = cb.filter(|cb| cb.enabled) else {
        return true;
    };
    match state.circuit_state {
        CircuitState::Closed => true,
        CircuitState::HalfOpen => true,
        CircuitState::Open => {
            let cooldown = i64::try_from(cb.cooldown).unwrap_or(i64::MAX);
            if now.saturating_sub(state.circuit_opened_at) >= cooldown {
                state.circuit_state = CircuitState::HalfOpen;
                state.half_open_attempts = 0;
                true
            } else {
                false
            }
        }
    }
}

/// Apply a failure that `mark_failed` already counted.
/// Returns true when the breaker (re)opened.
pub fn record_failure(state: &mut ServiceRuntimeState, cb: Option<&CircuitBreakerSpec>, now: i64) -> bool {
    let Some(cb) = cb.filter(|cb| cb.enabled) else {
        return false;
    };
    let trip = match state.circuit_state {
        CircuitState::HalfOpen => true,
        CircuitState::Closed => state.fail_count >= cb.threshold,
        CircuitState::Open => false,
    };
    if trip {
        state.circuit_state = CircuitState::Open;
        state.circuit_opened_at = now;
    }
    trip
}

/// Count a trial dispatch. Returns true if the breaker is half-open.
pub fn begin_trial(state: &mut ServiceRuntimeState) -> bool {
    if state.circuit_state == CircuitState::HalfOpen {
        state.half_open_attempts += 1;
        true
    } else {
        false
    }
}
