//! Decision records returned to callers.

use std::time::Duration;

use super::limit::Limit;
use super::script::SENTINEL;
use crate::error::StoreError;
use crate::store::{FromReply, Reply};

/// The limiter's decision for one call, plus metadata for the caller.
///
/// All durations are relative to the moment the store evaluated the call.
#[derive(Debug, Clone, PartialEq)]
pub struct RateLimitResult {
    /// The limit the call was evaluated against.
    pub limit: Limit,
    /// Units granted: the full cost, or 0 when denied.
    pub allowed: i64,
    /// Units still grantable right now, between 0 and the burst.
    pub remaining: i64,
    /// How long to wait before retrying the same cost. `None` when the
    /// call was admitted or when no amount of waiting helps.
    pub retry_after: Option<Duration>,
    /// Time until the key is fully replenished.
    pub reset_after: Option<Duration>,
}

impl RateLimitResult {
    /// Whether the call was admitted.
    pub fn is_allowed(&self) -> bool {
        self.allowed > 0
    }

    pub(crate) fn from_reply(limit: Limit, reply: AllowReply) -> Self {
        Self {
            limit,
            allowed: reply.allowed,
            remaining: reply.remaining,
            retry_after: reply.retry_after,
            reset_after: reply.reset_after,
        }
    }
}

/// The `allow_n` script reply, validated.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct AllowReply {
    pub allowed: i64,
    pub remaining: i64,
    pub retry_after: Option<Duration>,
    pub reset_after: Option<Duration>,
}

impl FromReply for AllowReply {
    fn from_reply(reply: Reply) -> Result<Self, StoreError> {
        let fields = match reply {
            Reply::Array(fields) => fields,
            other => {
                return Err(StoreError::MalformedReply(format!(
                    "expected 4-element array, got {}",
                    other.kind()
                )))
            }
        };
        let [allowed, remaining, retry_after, reset_after]: [Reply; 4] =
            fields.try_into().map_err(|fields: Vec<Reply>| {
                StoreError::MalformedReply(format!(
                    "expected 4-element array, got {} items",
                    fields.len()
                ))
            })?;

        Ok(Self {
            allowed: field("allowed", allowed)?,
            remaining: field("remaining", remaining)?,
            retry_after: duration_field("retry_after", retry_after)?,
            reset_after: duration_field("reset_after", reset_after)?,
        })
    }
}

fn field<T: FromReply>(name: &str, reply: Reply) -> Result<T, StoreError> {
    T::from_reply(reply).map_err(|e| StoreError::MalformedReply(format!("parse {}: {}", name, e)))
}

/// Decode a seconds field. The sentinel and empty values mean "not
/// applicable"; negative values clamp to zero.
pub(crate) fn duration_field(name: &str, reply: Reply) -> Result<Option<Duration>, StoreError> {
    let raw: Option<String> = field(name, reply)?;
    let raw = match raw.as_deref().map(str::trim) {
        None | Some("") | Some(SENTINEL) => return Ok(None),
        Some(raw) => raw,
    };

    let secs: f64 = field(name, Reply::Text(raw.to_string()))?;
    Duration::try_from_secs_f64(secs.max(0.0))
        .map(Some)
        .map_err(|e| StoreError::MalformedReply(format!("parse {}: {}", name, e)))
}
