//! The GCRA decision, as a pure function.
//!
//! This is the in-process twin of [`Script::AllowN`](super::Script::AllowN).
//! Stores without a scripting engine run it inside their own per-key
//! critical section and must reply exactly what the Lua script would.

use crate::error::StoreError;
use crate::store::Reply;

/// Value used in place of a duration that does not apply.
pub const NOT_APPLICABLE: f64 = -1.0;

/// Script arguments, decoded from their wire form.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GcraParams {
    pub burst: f64,
    pub rate: f64,
    pub period: f64,
    pub cost: f64,
}

impl GcraParams {
    /// Decode the four ordered arguments: burst, rate, period seconds, cost.
    pub fn from_args(args: &[String]) -> Result<Self, StoreError> {
        if args.len() != 4 {
            return Err(StoreError::ScriptArguments(format!(
                "allow_n expects 4 arguments, got {}",
                args.len()
            )));
        }

        let parse = |name: &str, raw: &str| -> Result<f64, StoreError> {
            raw.parse::<f64>()
                .ok()
                .filter(|v| v.is_finite())
                .ok_or_else(|| {
                    StoreError::ScriptArguments(format!("argument {} is not a number: {:?}", name, raw))
                })
        };

        Ok(Self {
            burst: parse("burst", &args[0])?,
            rate: parse("rate", &args[1])?,
            period: parse("period", &args[2])?,
            cost: parse("cost", &args[3])?,
        })
    }
}

/// What one evaluation decided.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GcraOutcome {
    pub allowed: i64,
    pub remaining: i64,
    /// Seconds, or [`NOT_APPLICABLE`].
    pub retry_after: f64,
    /// Seconds until the key is fully replenished.
    pub reset_after: f64,
    /// TAT to persist. `None` means state must be left untouched.
    pub new_tat: Option<f64>,
}

impl GcraOutcome {
    /// Expiry of the persisted TAT, in whole seconds.
    pub fn expiry_secs(&self) -> f64 {
        self.reset_after.ceil()
    }

    /// The 4-element reply the Lua script would return.
    pub fn to_reply(&self) -> Reply {
        Reply::Array(vec![
            Reply::Int(self.allowed),
            Reply::Int(self.remaining),
            Reply::Text(self.retry_after.to_string()),
            Reply::Text(self.reset_after.to_string()),
        ])
    }
}

/// Run the GCRA decision for one key.
///
/// `tat` is the stored theoretical arrival time, `None` when the key is
/// absent. `now` comes from the store's clock. Both are seconds on the same
/// timeline.
pub fn evaluate(tat: Option<f64>, now: f64, params: &GcraParams) -> GcraOutcome {
    let tat = tat.unwrap_or(now);

    if params.cost > params.burst {
        return GcraOutcome {
            allowed: 0,
            remaining: 0,
            retry_after: NOT_APPLICABLE,
            reset_after: tat - now,
            new_tat: None,
        };
    }

    let emission_interval = params.period / params.rate;
    let increment = emission_interval * params.cost;
    let burst_offset = emission_interval * params.burst;

    let new_tat = tat.max(now) + increment;
    let allow_at = new_tat - burst_offset;
    let diff = now - allow_at;
    let remaining = (diff / emission_interval + 0.5).floor();

    if remaining < 0.0 {
        let mut retry_after = -diff;
        // Unreachable while cost <= burst; kept as a clamp.
        if retry_after > params.burst {
            retry_after = NOT_APPLICABLE;
        }
        GcraOutcome {
            allowed: 0,
            remaining: 0,
            retry_after,
            reset_after: tat - now,
            new_tat: None,
        }
    } else {
        GcraOutcome {
            allowed: params.cost as i64,
            remaining: remaining as i64,
            retry_after: NOT_APPLICABLE,
            reset_after: new_tat - now,
            new_tat: Some(new_tat),
        }
    }
}
