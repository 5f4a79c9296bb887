//! In-process store.
//!
//! Runs the GCRA decision in Rust under a per-key lock. Correct for any
//! number of callers inside one process; it cannot coordinate separate
//! processes, and its clock is this process's clock rather than a shared
//! one.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tracing::{debug, trace};

use super::clock::{StoreClock, SystemClock};
use super::reply::Reply;
use super::{Command, Pipeline, StoreAdapter};
use crate::error::StoreError;
use crate::ratelimit::gcra::{self, GcraParams};
use crate::ratelimit::{Script, GCRA_EPOCH_UNIX_SECS, SENTINEL};

/// Expired entries are swept once every this many script evaluations.
const SWEEP_INTERVAL: usize = 1024;

/// A stored value and when it stops existing, both in clock seconds.
#[derive(Debug, Clone)]
struct StoredValue {
    value: String,
    expires_at: Option<f64>,
}

impl StoredValue {
    fn is_live(&self, now: f64) -> bool {
        self.expires_at.map_or(true, |at| now < at)
    }
}

/// A [`StoreAdapter`] holding all state in memory.
pub struct MemoryStore {
    entries: DashMap<String, StoredValue>,
    clock: Arc<dyn StoreClock>,
    closed: AtomicBool,
    evaluations: AtomicUsize,
}

impl std::fmt::Debug for MemoryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryStore")
            .field("entries", &self.entries.len())
            .field("closed", &self.closed.load(Ordering::Relaxed))
            .finish()
    }
}

impl MemoryStore {
    /// Create a store driven by the system clock.
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock::new()))
    }

    /// Create a store driven by the given clock.
    pub fn with_clock(clock: Arc<dyn StoreClock>) -> Self {
        Self {
            entries: DashMap::new(),
            clock,
            closed: AtomicBool::new(false),
            evaluations: AtomicUsize::new(0),
        }
    }

    /// Number of keys currently held, including expired ones not yet
    /// evicted.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drop every expired entry, returning how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = self.now_secs();
        let before = self.entries.len();
        self.entries.retain(|_, stored| stored.is_live(now));
        let purged = before.saturating_sub(self.entries.len());
        if purged > 0 {
            debug!(purged = purged, "Purged expired entries");
        }
        purged
    }

    fn maybe_sweep(&self) {
        let count = self.evaluations.fetch_add(1, Ordering::Relaxed) + 1;
        if count % SWEEP_INTERVAL == 0 {
            self.purge_expired();
        }
    }

    fn now_secs(&self) -> f64 {
        self.clock.now().as_secs_f64()
    }

    fn ensure_open(&self) -> Result<(), StoreError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(StoreError::Closed);
        }
        Ok(())
    }

    fn live_value(&self, key: &str, now: f64) -> Option<String> {
        self.entries
            .get(key)
            .filter(|stored| stored.is_live(now))
            .map(|stored| stored.value.clone())
    }

    fn allow_n(&self, key: &str, args: &[String]) -> Result<Reply, StoreError> {
        let params = GcraParams::from_args(args)?;

        // The entry guard holds the shard lock until the decision is stored.
        let entry = self.entries.entry(key.to_string());
        let now = self.now_secs();

        let stored_tat = match &entry {
            Entry::Occupied(occupied) if occupied.get().is_live(now) => {
                Some(occupied.get().value.parse::<f64>().map_err(|_| {
                    StoreError::MalformedReply(format!(
                        "stored TAT for {} is not a number: {:?}",
                        key,
                        occupied.get().value
                    ))
                })?)
            }
            _ => None,
        };

        let outcome = gcra::evaluate(stored_tat, now, &params);

        match (outcome.new_tat, entry) {
            (Some(new_tat), entry) => {
                let stored = StoredValue {
                    value: new_tat.to_string(),
                    expires_at: Some(now + outcome.expiry_secs()),
                };
                match entry {
                    Entry::Occupied(mut occupied) => {
                        occupied.insert(stored);
                    }
                    Entry::Vacant(vacant) => {
                        vacant.insert(stored);
                    }
                }
            }
            (None, Entry::Occupied(occupied)) if stored_tat.is_none() => {
                // Expired; drop it while we hold the lock.
                occupied.remove();
            }
            (None, _) => {}
        }

        trace!(
            key = %key,
            allowed = outcome.allowed,
            remaining = outcome.remaining,
            "Evaluated GCRA in memory"
        );

        Ok(outcome.to_reply())
    }

    fn peek(&self, key: &str) -> Result<Reply, StoreError> {
        let now = self.now_secs();
        let Some(raw) = self.live_value(key, now) else {
            return Ok(Reply::Text(SENTINEL.to_string()));
        };
        let tat: f64 = raw.parse().map_err(|_| {
            StoreError::MalformedReply(format!("stored TAT for {} is not a number: {:?}", key, raw))
        })?;

        let ttl = tat - now;
        if ttl <= 0.0 {
            return Ok(Reply::Text(SENTINEL.to_string()));
        }
        Ok(Reply::Text(ttl.to_string()))
    }

    fn run(&self, command: &Command) -> Result<Reply, StoreError> {
        let now = self.now_secs();
        let name = command.name().to_ascii_uppercase();

        match (name.as_str(), command.key()) {
            ("PING", _) => Ok(Reply::Status("PONG".to_string())),
            ("TIME", _) => {
                let now = self.clock.now() + Duration::from_secs(GCRA_EPOCH_UNIX_SECS);
                Ok(Reply::Array(vec![
                    Reply::Text(now.as_secs().to_string()),
                    Reply::Text(now.subsec_micros().to_string()),
                ]))
            }
            ("GET", Some(key)) => Ok(self
                .live_value(key, now)
                .map(Reply::Text)
                .unwrap_or(Reply::Nil)),
            ("SET", Some(key)) => {
                let (value, expires_at) = match command.args() {
                    [value] => (value.clone(), None),
                    [value, ex, secs] if ex.eq_ignore_ascii_case("EX") => {
                        let secs: f64 = secs.parse().map_err(|_| {
                            StoreError::ScriptArguments(format!("invalid expiry {:?}", secs))
                        })?;
                        (value.clone(), Some(now + secs))
                    }
                    _ => return Err(StoreError::UnsupportedCommand(command.to_string())),
                };
                self.entries
                    .insert(key.to_string(), StoredValue { value, expires_at });
                Ok(Reply::Status("OK".to_string()))
            }
            ("DEL", Some(key)) | ("EXISTS", Some(key)) => {
                let keys = std::iter::once(key).chain(command.args().iter().map(String::as_str));
                let mut count = 0;
                for key in keys {
                    let hit = if name == "DEL" {
                        self.entries
                            .remove(key)
                            .is_some_and(|(_, stored)| stored.is_live(now))
                    } else {
                        self.live_value(key, now).is_some()
                    };
                    if hit {
                        count += 1;
                    }
                }
                Ok(Reply::Int(count))
            }
            _ => Err(StoreError::UnsupportedCommand(command.to_string())),
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl StoreAdapter for MemoryStore {
    async fn do_cmd(&self, command: &Command) -> Result<Reply, StoreError> {
        self.ensure_open()?;
        self.run(command)
    }

    async fn eval_script(
        &self,
        script: Script,
        key: &str,
        args: &[String],
    ) -> Result<Reply, StoreError> {
        self.ensure_open()?;
        let reply = match script {
            Script::AllowN => self.allow_n(key, args),
            Script::Peek => self.peek(key),
        };
        // No entry guard is held here, so the sweep cannot deadlock.
        self.maybe_sweep();
        reply
    }

    async fn pipe_do(&self, pipeline: Pipeline) -> Result<Vec<Reply>, StoreError> {
        self.ensure_open()?;
        pipeline.commands().iter().map(|cmd| self.run(cmd)).collect()
    }

    async fn close(&self) -> Result<(), StoreError> {
        if !self.closed.swap(true, Ordering::AcqRel) {
            debug!(keys = self.entries.len(), "Closing memory store");
            self.entries.clear();
        }
        Ok(())
    }

    fn num_active_conns(&self) -> Option<usize> {
        None
    }

    fn implicit_pipelining_enabled(&self) -> bool {
        true
    }
}
