//! Backing store adapters.
//!
//! The limiter only needs a store that can run a script atomically against
//! one key using the store's own clock. [`StoreAdapter`] is that capability
//! surface; [`RedisStore`] and [`MemoryStore`] implement it.

mod clock;
mod memory;
mod redis_store;
mod reply;

pub use clock::{ManualClock, StoreClock, SystemClock};
pub use memory::MemoryStore;
pub use redis_store::RedisStore;
pub use reply::{FromReply, Reply};

use async_trait::async_trait;

use crate::error::StoreError;
use crate::ratelimit::Script;

/// A single store command: a name, an optional key and its arguments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    name: String,
    key: Option<String>,
    args: Vec<String>,
}

impl Command {
    /// Create a command with no key or arguments, e.g. `PING`.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            key: None,
            args: Vec::new(),
        }
    }

    /// Set the key the command operates on.
    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.key = Some(key.into());
        self
    }

    /// Append an argument.
    pub fn arg(mut self, arg: impl ToString) -> Self {
        self.args.push(arg.to_string());
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn key(&self) -> Option<&str> {
        self.key.as_deref()
    }

    pub fn args(&self) -> &[String] {
        &self.args
    }
}

impl std::fmt::Display for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.name)?;
        if let Some(key) = &self.key {
            write!(f, " {}", key)?;
        }
        for arg in &self.args {
            write!(f, " {}", arg)?;
        }
        Ok(())
    }
}

/// Commands queued for batched execution.
#[derive(Debug, Clone, Default)]
pub struct Pipeline {
    commands: Vec<Command>,
}

impl Pipeline {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, command: Command) {
        self.commands.push(command);
    }

    pub fn commands(&self) -> &[Command] {
        &self.commands
    }

    pub fn len(&self) -> usize {
        self.commands.len()
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }
}

/// Capabilities the limiter requires from a backing store.
///
/// Implementations must run [`eval_script`](StoreAdapter::eval_script)
/// atomically per key: concurrent evaluations against one key must be
/// equivalent to some serial order. The time a script sees must come from
/// the store, not from the caller.
#[async_trait]
pub trait StoreAdapter: Send + Sync {
    /// Execute one direct command.
    async fn do_cmd(&self, command: &Command) -> Result<Reply, StoreError>;

    /// Execute a server-side script atomically against `key`.
    async fn eval_script(
        &self,
        script: Script,
        key: &str,
        args: &[String],
    ) -> Result<Reply, StoreError>;

    /// Queue a command onto `pipeline`.
    fn pipe_append(&self, mut pipeline: Pipeline, command: Command) -> Pipeline {
        pipeline.push(command);
        pipeline
    }

    /// Execute every queued command, returning one reply per command.
    async fn pipe_do(&self, pipeline: Pipeline) -> Result<Vec<Reply>, StoreError>;

    /// Release the store's connections and state. Later calls fail with
    /// [`StoreError::Closed`].
    async fn close(&self) -> Result<(), StoreError>;

    /// Number of requests currently holding a connection, when the store
    /// has connections at all. Connections are multiplexed, so this counts
    /// requests rather than sockets.
    fn num_active_conns(&self) -> Option<usize>;

    /// Whether [`pipe_do`](StoreAdapter::pipe_do) runs commands one by one
    /// (`true`) or in a single round trip (`false`).
    fn implicit_pipelining_enabled(&self) -> bool;
}
