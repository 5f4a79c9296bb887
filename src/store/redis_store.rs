//! Redis-backed store.
//!
//! Scripts are sent with `EVALSHA` and loaded on demand by
//! [`redis::Script`]. Redis executes each script atomically and the scripts
//! read time with `TIME`, so every process using the same Redis shares one
//! serialized, clock-consistent view of each key.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use redis::aio::ConnectionManager;
use redis::Client;
use tracing::{debug, info, trace};

use super::reply::Reply;
use super::{Command, Pipeline, StoreAdapter};
use crate::config::StoreConfig;
use crate::error::StoreError;
use crate::ratelimit::Script;

/// A [`StoreAdapter`] over a small pool of Redis connection managers.
///
/// Connections are handed out round-robin. Each
/// [`ConnectionManager`] multiplexes requests and reconnects on its own.
/// [`close`](StoreAdapter::close) drops the pool; requests already in
/// flight finish on their own handle.
pub struct RedisStore {
    connections: RwLock<Option<Arc<Vec<ConnectionManager>>>>,
    next: AtomicUsize,
    in_flight: AtomicUsize,
    implicit_pipelining: bool,
    allow_n: redis::Script,
    peek: redis::Script,
}

impl std::fmt::Debug for RedisStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisStore")
            .field("pool_size", &self.pool_size())
            .field("implicit_pipelining", &self.implicit_pipelining)
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

/// Decrements the in-flight counter when a request finishes.
struct InFlight<'a>(&'a AtomicUsize);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::Relaxed);
    }
}

impl RedisStore {
    /// Connect to Redis with default pool settings.
    ///
    /// # Errors
    /// Returns error if the URL is invalid or the connection fails.
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        let config = StoreConfig {
            url: url.to_string(),
            ..StoreConfig::default()
        };
        Self::connect_with_config(&config).await
    }

    /// Connect to Redis using the given store configuration.
    pub async fn connect_with_config(config: &StoreConfig) -> Result<Self, StoreError> {
        let client = Client::open(config.url.as_str())?;
        Self::from_client(client, config.pool_size, config.implicit_pipelining).await
    }

    /// Build a store over `pool_size` connection managers created from
    /// `client`.
    ///
    /// When `implicit_pipelining` is set, [`pipe_do`](StoreAdapter::pipe_do)
    /// sends queued commands one at a time; otherwise as one pipeline round
    /// trip.
    pub async fn from_client(
        client: Client,
        pool_size: usize,
        implicit_pipelining: bool,
    ) -> Result<Self, StoreError> {
        if pool_size == 0 {
            return Err(StoreError::InvalidPoolSize(pool_size));
        }

        let mut connections = Vec::with_capacity(pool_size);
        for _ in 0..pool_size {
            connections.push(client.get_connection_manager().await?);
        }

        info!(
            pool_size = pool_size,
            implicit_pipelining = implicit_pipelining,
            "Connected to Redis"
        );

        Ok(Self::from_managers(connections, implicit_pipelining))
    }

    fn from_managers(connections: Vec<ConnectionManager>, implicit_pipelining: bool) -> Self {
        Self {
            connections: RwLock::new(Some(Arc::new(connections))),
            next: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
            implicit_pipelining,
            allow_n: redis::Script::new(Script::AllowN.source()),
            peek: redis::Script::new(Script::Peek.source()),
        }
    }

    /// Number of connection managers in the pool. Zero once closed.
    pub fn pool_size(&self) -> usize {
        self.connections.read().as_ref().map_or(0, |pool| pool.len())
    }

    /// Whether [`close`](StoreAdapter::close) has been called.
    pub fn is_closed(&self) -> bool {
        self.connections.read().is_none()
    }

    fn connection(&self) -> Result<(ConnectionManager, InFlight<'_>), StoreError> {
        let connection = {
            let pool = self.connections.read();
            let pool = pool.as_ref().ok_or(StoreError::Closed)?;
            if pool.is_empty() {
                return Err(StoreError::InvalidPoolSize(0));
            }
            let index = self.next.fetch_add(1, Ordering::Relaxed);
            pool[index % pool.len()].clone()
        };
        self.in_flight.fetch_add(1, Ordering::Relaxed);
        Ok((connection, InFlight(&self.in_flight)))
    }

    fn to_cmd(command: &Command) -> redis::Cmd {
        let mut cmd = redis::cmd(command.name());
        if let Some(key) = command.key() {
            cmd.arg(key);
        }
        for arg in command.args() {
            cmd.arg(arg);
        }
        cmd
    }

    fn script(&self, script: Script) -> &redis::Script {
        match script {
            Script::AllowN => &self.allow_n,
            Script::Peek => &self.peek,
        }
    }
}

#[async_trait]
impl StoreAdapter for RedisStore {
    async fn do_cmd(&self, command: &Command) -> Result<Reply, StoreError> {
        let (mut connection, _guard) = self.connection()?;
        trace!(command = %command.name(), "Sending command");

        let value: redis::Value = Self::to_cmd(command).query_async(&mut connection).await?;
        Reply::try_from(value)
    }

    async fn eval_script(
        &self,
        script: Script,
        key: &str,
        args: &[String],
    ) -> Result<Reply, StoreError> {
        let (mut connection, _guard) = self.connection()?;
        trace!(script = %script, key = %key, "Evaluating script");

        let mut invocation = self.script(script).key(key);
        for arg in args {
            invocation.arg(arg);
        }
        let value: redis::Value = invocation.invoke_async(&mut connection).await?;
        Reply::try_from(value)
    }

    async fn pipe_do(&self, pipeline: Pipeline) -> Result<Vec<Reply>, StoreError> {
        if pipeline.is_empty() {
            return Ok(Vec::new());
        }

        if self.implicit_pipelining {
            let mut replies = Vec::with_capacity(pipeline.len());
            for command in pipeline.commands() {
                replies.push(self.do_cmd(command).await?);
            }
            return Ok(replies);
        }

        let (mut connection, _guard) = self.connection()?;
        let mut pipe = redis::pipe();
        for command in pipeline.commands() {
            pipe.add_command(Self::to_cmd(command));
        }
        debug!(commands = pipeline.len(), "Sending pipeline");

        let values: Vec<redis::Value> = pipe.query_async(&mut connection).await?;
        values.into_iter().map(Reply::try_from).collect()
    }

    async fn close(&self) -> Result<(), StoreError> {
        let pool = self.connections.write().take();
        if let Some(pool) = pool {
            info!(
                pool_size = pool.len(),
                in_flight = self.in_flight.load(Ordering::Relaxed),
                "Closing Redis store"
            );
        }
        Ok(())
    }

    fn num_active_conns(&self) -> Option<usize> {
        Some(self.in_flight.load(Ordering::Relaxed))
    }

    fn implicit_pipelining_enabled(&self) -> bool {
        self.implicit_pipelining
    }
}

impl TryFrom<redis::Value> for Reply {
    type Error = StoreError;

    fn try_from(value: redis::Value) -> Result<Self, Self::Error> {
        match value {
            redis::Value::Nil => Ok(Reply::Nil),
            redis::Value::Int(v) => Ok(Reply::Int(v)),
            redis::Value::BulkString(bytes) => String::from_utf8(bytes)
                .map(Reply::Text)
                .map_err(|e| StoreError::MalformedReply(format!("non UTF-8 bulk string: {}", e))),
            redis::Value::SimpleString(s) => Ok(Reply::Status(s)),
            redis::Value::Okay => Ok(Reply::Status("OK".to_string())),
            redis::Value::Double(v) => Ok(Reply::Text(v.to_string())),
            redis::Value::Boolean(b) => Ok(Reply::Int(i64::from(b))),
            redis::Value::Array(items) | redis::Value::Set(items) => items
                .into_iter()
                .map(Reply::try_from)
                .collect::<Result<Vec<_>, _>>()
                .map(Reply::Array),
            other => Err(StoreError::MalformedReply(format!(
                "unsupported reply {:?}",
                other
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reply_from_redis_value() {
        let value = redis::Value::Array(vec![
            redis::Value::Int(1),
            redis::Value::Int(0),
            redis::Value::BulkString(b"-1".to_vec()),
            redis::Value::BulkString(b"0.5".to_vec()),
        ]);

        assert_eq!(
            Reply::try_from(value).unwrap(),
            Reply::Array(vec![
                Reply::Int(1),
                Reply::Int(0),
                Reply::Text("-1".into()),
                Reply::Text("0.5".into()),
            ])
        );
        assert_eq!(Reply::try_from(redis::Value::Okay).unwrap(), Reply::Status("OK".into()));
        assert_eq!(Reply::try_from(redis::Value::Nil).unwrap(), Reply::Nil);
    }

    #[test]
    fn test_reply_rejects_invalid_utf8() {
        let value = redis::Value::BulkString(vec![0xff, 0xfe]);
        assert!(matches!(Reply::try_from(value), Err(StoreError::MalformedReply(_))));
    }

    #[test]
    fn test_to_cmd_includes_key_and_args() {
        let cmd = RedisStore::to_cmd(&Command::new("SET").with_key("k").arg("v"));
        let packed = String::from_utf8(cmd.get_packed_command()).unwrap();
        assert!(packed.contains("SET"));
        assert!(packed.contains("\r\nk\r\n"));
        assert!(packed.contains("\r\nv\r\n"));
    }

    #[tokio::test]
    async fn test_close_drops_pool() {
        let store = RedisStore::from_managers(Vec::new(), false);
        assert!(!store.is_closed());
        let err = store.do_cmd(&Command::new("PING")).await.unwrap_err();
        assert!(matches!(err, StoreError::InvalidPoolSize(0)));

        store.close().await.unwrap();
        assert!(store.is_closed());
        assert_eq!(store.pool_size(), 0);
        assert_eq!(store.num_active_conns(), Some(0));

        let err = store.do_cmd(&Command::new("PING")).await.unwrap_err();
        assert!(matches!(err, StoreError::Closed));
        let err = store
            .eval_script(Script::Peek, "k", &[])
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Closed));
        let mut pipeline = Pipeline::new();
        pipeline.push(Command::new("PING"));
        assert!(matches!(store.pipe_do(pipeline).await, Err(StoreError::Closed)));

        // Closing twice is fine.
        store.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_zero_pool_size_rejected() {
        let client = Client::open("redis://127.0.0.1/").unwrap();
        let err = RedisStore::from_client(client, 0, false).await.unwrap_err();
        assert!(matches!(err, StoreError::InvalidPoolSize(0)));
    }
}
