//! Run-level cost accounting.
//!
//! The ledger is monotonic: spend only ever grows. Admission happens
//! before a call is issued and reserves the projected cost of the call,
//! so concurrent callers cannot collectively overshoot; when the
//! projection would push committed spend past the ceiling, the call is
//! refused and the caller stops submitting work.

use std::sync::Mutex;

use crate::domain::errors::{PipelineError, PipelineResult};

/// Pricing per million tokens (USD) for known model families.
const PRICING_TABLE: &[(&str, f64, f64)] = &[
    ("opus", 15.0, 75.0),
    ("sonnet", 3.0, 15.0),
    ("haiku", 0.80, 4.0),
];

/// Cost of one call given token usage, when the model is recognized.
pub fn price_for(model: &str, input_tokens: u64, output_tokens: u64) -> Option<f64> {
    let model = model.to_lowercase();
    let (_, input_rate, output_rate) = PRICING_TABLE
        .iter()
        .find(|(name, _, _)| model.contains(name))?;
    Some((input_tokens as f64 * input_rate + output_tokens as f64 * output_rate) / 1_000_000.0)
}

struct CostState {
    spent_usd: f64,
    calls: u64,
    /// Calls admitted but not yet settled; each reserves one projected
    /// call cost against the ceiling.
    in_flight: u64,
}

pub struct CostLedger {
    ceiling_usd: f64,
    /// Projected per-call cost used before real usage exists.
    estimate_usd: f64,
    state: Mutex<CostState>,
}

impl CostLedger {
    pub fn new(ceiling_usd: f64, estimate_usd: f64) -> Self {
        Self {
            ceiling_usd,
            estimate_usd: estimate_usd.max(0.0),
            state: Mutex::new(CostState {
                spent_usd: 0.0,
                calls: 0,
                in_flight: 0,
            }),
        }
    }

    /// Admit one more call, reserving its projected cost, or refuse when
    /// committed spend would exceed the ceiling.
    pub fn admit(&self) -> PipelineResult<()> {
        let mut state = self.state.lock().expect("ledger lock poisoned");
        let projected = self.projected_call_cost(&state);
        let committed = state.spent_usd + (state.in_flight + 1) as f64 * projected;
        if committed > self.ceiling_usd {
            return Err(PipelineError::CostCeilingReached {
                spent_usd: state.spent_usd,
                ceiling_usd: self.ceiling_usd,
            });
        }
        state.in_flight += 1;
        Ok(())
    }

    /// Settle an admitted call with its actual cost.
    pub fn record(&self, cost_usd: f64) {
        let mut state = self.state.lock().expect("ledger lock poisoned");
        state.in_flight = state.in_flight.saturating_sub(1);
        state.spent_usd += cost_usd.max(0.0);
        state.calls += 1;
    }

    /// Release an admitted call that never completed (error, cancel).
    pub fn abandon(&self) {
        let mut state = self.state.lock().expect("ledger lock poisoned");
        state.in_flight = state.in_flight.saturating_sub(1);
    }

    pub fn spent_usd(&self) -> f64 {
        self.state.lock().expect("ledger lock poisoned").spent_usd
    }

    pub fn calls(&self) -> u64 {
        self.state.lock().expect("ledger lock poisoned").calls
    }

    /// The larger of the configured estimate and the running average,
    /// so admission stays conservative as real costs come in.
    fn projected_call_cost(&self, state: &CostState) -> f64 {
        if state.calls == 0 {
            self.estimate_usd
        } else {
            self.estimate_usd.max(state.spent_usd / state.calls as f64)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pricing_matches_model_families() {
        let cost = price_for("claude-sonnet-4-5", 1_000_000, 0).unwrap();
        assert!((cost - 3.0).abs() < 1e-9);
        let cost = price_for("claude-opus-4", 0, 1_000_000).unwrap();
        assert!((cost - 75.0).abs() < 1e-9);
        assert!(price_for("unknown-model", 1000, 1000).is_none());
    }

    #[test]
    fn ceiling_bounds_admitted_calls() {
        // Ceiling $1.00, per-call estimate $0.30: exactly three calls fit.
        let ledger = CostLedger::new(1.0, 0.30);
        for _ in 0..3 {
            ledger.admit().expect("call should be admitted");
            ledger.record(0.30);
        }
        let err = ledger.admit().unwrap_err();
        assert!(matches!(err, PipelineError::CostCeilingReached { .. }));
    }

    #[test]
    fn concurrent_reservations_count_against_the_ceiling() {
        // Three in-flight reservations exhaust the ceiling before any
        // cost is recorded.
        let ledger = CostLedger::new(1.0, 0.30);
        ledger.admit().unwrap();
        ledger.admit().unwrap();
        ledger.admit().unwrap();
        assert!(ledger.admit().is_err());

        // Abandoning one frees its reservation.
        ledger.abandon();
        assert!(ledger.admit().is_ok());
    }

    #[test]
    fn spend_is_monotonic() {
        let ledger = CostLedger::new(10.0, 0.1);
        ledger.record(0.5);
        let before = ledger.spent_usd();
        ledger.record(0.0);
        ledger.record(-1.0); // Negative costs are ignored.
        assert!(ledger.spent_usd() >= before);
    }

    #[test]
    fn running_average_raises_projection() {
        let ledger = CostLedger::new(1.0, 0.01);
        ledger.record(0.6);
        // Average is 0.6 > estimate 0.01, so the next call projects 0.6
        // and would push committed spend past the ceiling.
        assert!(ledger.admit().is_err());
    }
}
