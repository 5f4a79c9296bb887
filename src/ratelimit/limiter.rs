//! Core rate limiter implementation.

use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, instrument, trace};

use super::limit::Limit;
use super::result::{duration_field, AllowReply, RateLimitResult};
use super::script::Script;
use crate::error::{Error, Result};
use crate::store::{Command, StoreAdapter};

/// Enforces GCRA limits on arbitrary keys through a shared store.
///
/// The limiter itself holds no mutable state: every decision is made by the
/// store, atomically per key, so a limiter can be cloned freely and used
/// from any number of tasks, threads or processes at once. Nothing is
/// retried internally. When a call fails with [`Error::Store`] the decision
/// is unknown and the caller picks fail-open or fail-closed.
pub struct Limiter<S: StoreAdapter> {
    store: Arc<S>,
    prefix: Arc<str>,
}

impl<S: StoreAdapter> Clone for Limiter<S> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            prefix: self.prefix.clone(),
        }
    }
}

impl<S: StoreAdapter> std::fmt::Debug for Limiter<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Limiter")
            .field("prefix", &self.prefix)
            .finish_non_exhaustive()
    }
}

impl<S: StoreAdapter> Limiter<S> {
    /// Create a limiter that stores keys verbatim.
    pub fn new(store: Arc<S>) -> Self {
        Self::with_prefix(store, "")
    }

    /// Create a limiter that stores every key as `prefix + key`.
    pub fn with_prefix(store: Arc<S>, prefix: impl Into<String>) -> Self {
        let prefix: String = prefix.into();
        Self {
            store,
            prefix: Arc::from(prefix),
        }
    }

    /// The underlying store adapter.
    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    /// Shortcut for [`allow_n`](Self::allow_n) with a cost of 1.
    pub async fn allow(&self, key: &str, limit: Limit) -> Result<RateLimitResult> {
        self.allow_n(key, limit, 1).await
    }

    /// Try to consume `cost` units of `limit` for `key`.
    ///
    /// A denial is a normal outcome reported through
    /// [`RateLimitResult::allowed`], not an error.
    ///
    /// # Errors
    /// [`Error::InvalidArgument`] when `cost` or `limit` is invalid, before
    /// the store is contacted. [`Error::Store`] on transport failure or a
    /// malformed reply.
    #[instrument(level = "trace", skip(self, limit), fields(limit = %limit))]
    pub async fn allow_n(&self, key: &str, limit: Limit, cost: i64) -> Result<RateLimitResult> {
        validate(&limit, cost)?;

        let storage_key = self.storage_key(key);
        let args = [
            limit.burst.to_string(),
            limit.rate.to_string(),
            limit.period.as_secs_f64().to_string(),
            cost.to_string(),
        ];

        trace!(key = %storage_key, cost = cost, "Checking rate limit");

        let reply: AllowReply = self
            .store
            .eval_script(Script::AllowN, &storage_key, &args)
            .await?
            .decode()?;
        let result = RateLimitResult::from_reply(limit, reply);

        if result.is_allowed() {
            trace!(
                key = %storage_key,
                remaining = result.remaining,
                "Rate limit check passed"
            );
        } else {
            debug!(
                key = %storage_key,
                cost = cost,
                retry_after = ?result.retry_after,
                "Rate limit exceeded"
            );
        }

        Ok(result)
    }

    /// Remove all state for `key`, returning it to fully replenished.
    ///
    /// Resetting a key that has no state succeeds.
    #[instrument(level = "trace", skip(self))]
    pub async fn reset(&self, key: &str) -> Result<()> {
        let storage_key = self.storage_key(key);
        self.store
            .do_cmd(&Command::new("DEL").with_key(storage_key.as_str()))
            .await?
            .decode::<()>()?;
        debug!(key = %storage_key, "Rate limit state reset");
        Ok(())
    }

    /// Time until `key` is fully replenished, without consuming quota.
    ///
    /// Returns `None` when the key has no state.
    #[instrument(level = "trace", skip(self))]
    pub async fn peek(&self, key: &str) -> Result<Option<Duration>> {
        let storage_key = self.storage_key(key);
        let reply = self
            .store
            .eval_script(Script::Peek, &storage_key, &[])
            .await?;
        Ok(duration_field("peek", reply)?)
    }

    /// Check that the store is reachable.
    pub async fn ping(&self) -> Result<()> {
        self.store.do_cmd(&Command::new("PING")).await?;
        Ok(())
    }

    fn storage_key(&self, key: &str) -> String {
        format!("{}{}", self.prefix, key)
    }
}

/// Validate a call before it reaches the store.
pub fn validate(limit: &Limit, cost: i64) -> Result<()> {
    if cost <= 0 {
        return Err(Error::InvalidArgument(format!(
            "invalid cost: {}; must be > 0",
            cost
        )));
    }
    if limit.burst < 0 {
        return Err(Error::InvalidArgument(format!(
            "invalid limit {:?}: burst must not be negative",
            limit
        )));
    }
    if limit.period.is_zero() {
        return Err(Error::InvalidArgument(format!(
            "invalid limit {:?}: period must be greater than zero",
            limit
        )));
    }
    if limit.rate <= 0 {
        return Err(Error::InvalidArgument(format!(
            "invalid limit {:?}: rate must be greater than zero",
            limit
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StoreError;
    use crate::store::{ManualClock, MemoryStore, Pipeline, Reply};
    use async_trait::async_trait;
    use tokio_test::{assert_err, assert_ok};

    fn create_test_limiter() -> (Limiter<MemoryStore>, ManualClock) {
        let clock = ManualClock::default();
        let store = Arc::new(MemoryStore::with_clock(Arc::new(clock.clone())));
        (Limiter::new(store), clock)
    }

    async fn call(limiter: &Limiter<MemoryStore>, key: &str, limit: Limit, cost: i64) -> RateLimitResult {
        limiter
            .allow_n(key, limit, cost)
            .await
            .unwrap_or_else(|e| panic!("allow_n({}, {}, {}): {}", key, limit, cost, e))
    }

    fn assert_close(actual: Option<Duration>, expected: Duration, tolerance: Duration) {
        let actual = actual.expect("expected a duration");
        let delta = if actual > expected {
            actual - expected
        } else {
            expected - actual
        };
        assert!(
            delta <= tolerance,
            "{:?} not within {:?} of {:?}",
            actual,
            tolerance,
            expected
        );
    }

    #[tokio::test]
    async fn test_allow_sequence_and_replenish() {
        let (limiter, clock) = create_test_limiter();
        let limit = Limit::per_second(2, 2);

        let first = call(&limiter, "user:42", limit, 1).await;
        let second = call(&limiter, "user:42", limit, 1).await;
        let third = call(&limiter, "user:42", limit, 1).await;

        assert_eq!((first.allowed, first.remaining), (1, 1));
        assert_eq!(first.reset_after, Some(Duration::from_millis(500)));
        assert_eq!((second.allowed, second.remaining), (1, 0));
        assert_eq!(second.reset_after, Some(Duration::from_secs(1)));
        assert_eq!((third.allowed, third.remaining), (0, 0));
        assert_eq!(third.retry_after, Some(Duration::from_millis(500)));
        assert_eq!(third.reset_after, Some(Duration::from_secs(1)));

        clock.advance(Duration::from_millis(500));
        let fourth = call(&limiter, "user:42", limit, 1).await;
        assert_eq!((fourth.allowed, fourth.remaining), (1, 0));
        assert_eq!(fourth.retry_after, None);
        assert_close(fourth.reset_after, Duration::from_secs(1), Duration::from_millis(1));
    }

    #[tokio::test]
    async fn test_allow_n_with_cost() {
        let (limiter, clock) = create_test_limiter();
        let limit = Limit::per_minute(60, 300);

        let first = call(&limiter, "account:99", limit, 3).await;
        assert_eq!((first.allowed, first.remaining), (3, 297));
        assert_eq!(first.retry_after, None);
        assert_eq!(first.reset_after, Some(Duration::from_secs(3)));

        clock.advance(Duration::from_secs(3));
        let second = call(&limiter, "account:99", limit, 300).await;
        assert_eq!((second.allowed, second.remaining), (300, 0));
        assert_eq!(second.reset_after, Some(Duration::from_secs(300)));
    }

    #[tokio::test]
    async fn test_fixed_instant_admits_exactly_burst() {
        let (limiter, _clock) = create_test_limiter();
        let limit = Limit::per_hour(10, 7);

        let mut granted = 0;
        for _ in 0..20 {
            let result = call(&limiter, "k", limit, 1).await;
            assert!(result.remaining >= 0 && result.remaining <= limit.burst);
            granted += result.allowed;
        }
        assert_eq!(granted, 7);
    }

    #[tokio::test]
    async fn test_simultaneous_requests() {
        let (limiter, _clock) = create_test_limiter();
        let limit = Limit::per_second(1, 5);

        let handles: Vec<_> = (0..15)
            .map(|_| {
                let limiter = limiter.clone();
                tokio::spawn(async move { limiter.allow("simul", limit).await })
            })
            .collect();

        let mut admitted = 0;
        for handle in handles {
            let result = handle.await.unwrap().unwrap();
            admitted += result.allowed;
        }
        assert_eq!(admitted, 5);
    }

    #[tokio::test]
    async fn test_limits_after_depleted() {
        let (limiter, _clock) = create_test_limiter();
        let limit = Limit::per_second(10, 10);

        for _ in 0..10 {
            assert!(call(&limiter, "depleted", limit, 1).await.is_allowed());
        }

        for _ in 0..10 {
            let result = call(&limiter, "depleted", limit, 1).await;
            assert_eq!(result.allowed, 0);
            assert_eq!(result.remaining, 0);
            assert_close(result.retry_after, Duration::from_millis(100), Duration::from_millis(20));
            assert_close(result.reset_after, Duration::from_secs(1), Duration::from_millis(20));
        }
    }

    #[tokio::test]
    async fn test_recovers_after_retry_after() {
        let (limiter, clock) = create_test_limiter();
        let limit = Limit::per_second(10, 10);

        for _ in 0..10 {
            call(&limiter, "recover", limit, 1).await;
        }
        let limited = call(&limiter, "recover", limit, 1).await;
        assert!(!limited.is_allowed());

        clock.advance(limited.retry_after.unwrap());
        let passed = call(&limiter, "recover", limit, 1).await;
        assert!(passed.is_allowed());
    }

    #[tokio::test]
    async fn test_cost_bigger_than_burst() {
        let (limiter, _clock) = create_test_limiter();
        let limit = Limit::per_second(1, 5);

        let result = call(&limiter, "costbigger", limit, 10).await;
        assert_eq!(result.allowed, 0);
        assert_eq!(result.remaining, 0);
        assert_eq!(result.retry_after, None);
        assert_eq!(result.reset_after, Some(Duration::ZERO));

        // Still denied once the key has state.
        call(&limiter, "costbigger", limit, 2).await;
        let result = call(&limiter, "costbigger", limit, 6).await;
        assert_eq!(result.allowed, 0);
        assert_eq!(result.retry_after, None);
        assert_close(result.reset_after, Duration::from_secs(2), Duration::from_millis(1));
    }

    #[tokio::test]
    async fn test_cost_bigger_than_remaining() {
        let (limiter, _clock) = create_test_limiter();
        let limit = Limit::per_second(10, 10);

        call(&limiter, "remaining", limit, 9).await;
        let result = call(&limiter, "remaining", limit, 2).await;

        assert_eq!(result.allowed, 0);
        assert_eq!(result.remaining, 0);
        assert_close(result.retry_after, Duration::from_millis(100), Duration::from_millis(10));
        assert!(result.reset_after.is_some());
    }

    #[tokio::test]
    async fn test_zero_burst_always_denies() {
        let (limiter, clock) = create_test_limiter();
        let limit = Limit::per_second(1, 0);

        for _ in 0..5 {
            clock.advance(Duration::from_secs(1));
            let result = call(&limiter, "zero", limit, 1).await;
            assert!(!result.is_allowed());
        }
    }

    #[tokio::test]
    async fn test_remaining_table() {
        struct Case {
            burst: i64,
            rate: i64,
            period: u64,
            cost: i64,
            repeat: usize,
            expected_remaining: i64,
        }
        let cases = [
            Case { burst: 4500, rate: 75, period: 60, cost: 1, repeat: 1, expected_remaining: 4499 },
            Case { burst: 4500, rate: 75, period: 60, cost: 1, repeat: 2, expected_remaining: 4498 },
            Case { burst: 4500, rate: 75, period: 60, cost: 2, repeat: 1, expected_remaining: 4498 },
            Case { burst: 1000, rate: 100, period: 60, cost: 200, repeat: 1, expected_remaining: 800 },
            Case { burst: 1000, rate: 100, period: 60, cost: 200, repeat: 4, expected_remaining: 200 },
            Case { burst: 1000, rate: 100, period: 60, cost: 200, repeat: 5, expected_remaining: 0 },
            Case { burst: 1000, rate: 100, period: 60, cost: 1, repeat: 137, expected_remaining: 863 },
            Case { burst: 1000, rate: 100, period: 60, cost: 1001, repeat: 1, expected_remaining: 0 },
        ];

        for (i, case) in cases.iter().enumerate() {
            let (limiter, _clock) = create_test_limiter();
            let limit = Limit::new(case.rate, Duration::from_secs(case.period), case.burst);
            let key = format!("case:{}", i + 1);

            let mut last = None;
            for _ in 0..case.repeat {
                last = Some(call(&limiter, &key, limit, case.cost).await);
            }
            assert_eq!(
                last.unwrap().remaining,
                case.expected_remaining,
                "case {}",
                i + 1
            );
        }
    }

    #[tokio::test]
    async fn test_keys_are_independent() {
        let (limiter, _clock) = create_test_limiter();
        let limit = Limit::per_minute(60, 300);

        for _ in 0..100 {
            call(&limiter, "indep1", limit, 10).await;
        }
        let result = call(&limiter, "indep2", limit, 2).await;

        assert!(result.is_allowed());
        assert_eq!(result.remaining, 298);
        assert_eq!(result.retry_after, None);
        assert_eq!(result.reset_after, Some(Duration::from_secs(2)));
    }

    #[tokio::test]
    async fn test_peek_and_reset() {
        let (limiter, _clock) = create_test_limiter();
        let limit = Limit::per_second(1, 1);

        assert_eq!(limiter.peek("session:1").await.unwrap(), None);

        let result = call(&limiter, "session:1", limit, 1).await;
        assert_eq!((result.allowed, result.remaining), (1, 0));

        // Peeking does not consume quota.
        assert_eq!(limiter.peek("session:1").await.unwrap(), Some(Duration::from_secs(1)));
        assert_eq!(limiter.peek("session:1").await.unwrap(), Some(Duration::from_secs(1)));

        assert_ok!(limiter.reset("session:1").await);
        assert_eq!(limiter.peek("session:1").await.unwrap(), None);

        // Resetting an absent key is fine.
        assert_ok!(limiter.reset("session:1").await);
        assert_ok!(limiter.reset("never-seen").await);

        assert!(call(&limiter, "session:1", limit, 1).await.is_allowed());
    }

    #[tokio::test]
    async fn test_prefix_namespaces_keys() {
        let clock = ManualClock::default();
        let store = Arc::new(MemoryStore::with_clock(Arc::new(clock)));
        let tenant_a = Limiter::with_prefix(store.clone(), "a:");
        let tenant_b = Limiter::with_prefix(store.clone(), "b:");
        let limit = Limit::per_second(1, 1);

        assert!(tenant_a.allow("user", limit).await.unwrap().is_allowed());
        assert!(tenant_b.allow("user", limit).await.unwrap().is_allowed());
        assert!(!tenant_a.allow("user", limit).await.unwrap().is_allowed());

        let raw = store
            .do_cmd(&Command::new("GET").with_key("a:user"))
            .await
            .unwrap();
        assert_eq!(raw, Reply::Text("1".into()));
    }

    #[tokio::test]
    async fn test_invalid_arguments_rejected() {
        let (limiter, _clock) = create_test_limiter();
        let ok = Limit::per_second(1, 1);

        let cases = [
            (ok, 0),
            (ok, -1),
            (Limit::per_second(1, -1), 1),
            (Limit::new(1, Duration::ZERO, 1), 1),
            (Limit::per_second(0, 1), 1),
            (Limit::per_second(-5, 1), 1),
        ];
        for (limit, cost) in cases {
            let err = assert_err!(limiter.allow_n("k", limit, cost).await);
            assert!(err.is_invalid_argument(), "{:?} cost {}", limit, cost);
        }

        // Nothing reached the store.
        assert!(limiter.store().is_empty());
    }

    /// A store that answers every script with a fixed reply.
    struct FixedReplyStore(Reply);

    #[async_trait]
    impl StoreAdapter for FixedReplyStore {
        async fn do_cmd(&self, _command: &Command) -> std::result::Result<Reply, StoreError> {
            Err(StoreError::Closed)
        }

        async fn eval_script(
            &self,
            _script: Script,
            _key: &str,
            _args: &[String],
        ) -> std::result::Result<Reply, StoreError> {
            Ok(self.0.clone())
        }

        async fn pipe_do(&self, _pipeline: Pipeline) -> std::result::Result<Vec<Reply>, StoreError> {
            Ok(Vec::new())
        }

        async fn close(&self) -> std::result::Result<(), StoreError> {
            Ok(())
        }

        fn num_active_conns(&self) -> Option<usize> {
            None
        }

        fn implicit_pipelining_enabled(&self) -> bool {
            false
        }
    }

    #[tokio::test]
    async fn test_malformed_reply_is_store_error() {
        let limiter = Limiter::new(Arc::new(FixedReplyStore(Reply::Array(vec![Reply::Int(1)]))));
        let err = limiter.allow("k", Limit::per_second(1, 1)).await.unwrap_err();
        assert!(err.is_store_error());

        let limiter = Limiter::new(Arc::new(FixedReplyStore(Reply::Status("OK".into()))));
        let err = limiter.allow("k", Limit::per_second(1, 1)).await.unwrap_err();
        assert!(matches!(err, Error::Store(StoreError::MalformedReply(_))));
    }

    #[tokio::test]
    async fn test_transport_failure_is_store_error() {
        let limiter = Limiter::new(Arc::new(FixedReplyStore(Reply::Nil)));
        let err = limiter.reset("k").await.unwrap_err();
        assert!(matches!(err, Error::Store(StoreError::Closed)));
        assert!(limiter.ping().await.is_err());
    }

    #[tokio::test]
    async fn test_closed_store_surfaces_error() {
        let (limiter, _clock) = create_test_limiter();
        limiter.store().close().await.unwrap();

        let err = limiter.allow("k", Limit::per_second(1, 1)).await.unwrap_err();
        assert!(err.is_store_error());
    }
}
