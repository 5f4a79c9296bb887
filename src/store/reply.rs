//! Store replies and typed decoding.

use crate::error::StoreError;

/// A reply from the backing store, independent of the transport.
#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    /// Missing value.
    Nil,
    /// Integer reply.
    Int(i64),
    /// Bulk string reply.
    Text(String),
    /// Simple status reply such as `OK` or `PONG`.
    Status(String),
    /// Multi-value reply.
    Array(Vec<Reply>),
}

impl Reply {
    /// Decode this reply into a typed receiver.
    pub fn decode<T: FromReply>(self) -> Result<T, StoreError> {
        T::from_reply(self)
    }

    /// Name of the reply kind, for error messages.
    pub fn kind(&self) -> &'static str {
        match self {
            Reply::Nil => "nil",
            Reply::Int(_) => "integer",
            Reply::Text(_) => "bulk string",
            Reply::Status(_) => "status",
            Reply::Array(_) => "array",
        }
    }
}

/// Types a [`Reply`] can be decoded into.
pub trait FromReply: Sized {
    fn from_reply(reply: Reply) -> Result<Self, StoreError>;
}

fn unexpected<T>(want: &str, got: &Reply) -> Result<T, StoreError> {
    Err(StoreError::MalformedReply(format!(
        "expected {}, got {}",
        want,
        got.kind()
    )))
}

impl FromReply for Reply {
    fn from_reply(reply: Reply) -> Result<Self, StoreError> {
        Ok(reply)
    }
}

impl FromReply for () {
    fn from_reply(_reply: Reply) -> Result<Self, StoreError> {
        Ok(())
    }
}

impl FromReply for i64 {
    fn from_reply(reply: Reply) -> Result<Self, StoreError> {
        match reply {
            Reply::Int(v) => Ok(v),
            Reply::Text(ref s) => s.trim().parse().map_err(|_| {
                StoreError::MalformedReply(format!("expected integer, got {:?}", s))
            }),
            other => unexpected("integer", &other),
        }
    }
}

impl FromReply for f64 {
    fn from_reply(reply: Reply) -> Result<Self, StoreError> {
        match reply {
            Reply::Int(v) => Ok(v as f64),
            Reply::Text(ref s) => s
                .trim()
                .parse::<f64>()
                .ok()
                .filter(|v| v.is_finite())
                .ok_or_else(|| StoreError::MalformedReply(format!("expected number, got {:?}", s))),
            other => unexpected("number", &other),
        }
    }
}

impl FromReply for String {
    fn from_reply(reply: Reply) -> Result<Self, StoreError> {
        match reply {
            Reply::Text(s) | Reply::Status(s) => Ok(s),
            Reply::Int(v) => Ok(v.to_string()),
            other => unexpected("string", &other),
        }
    }
}

impl<T: FromReply> FromReply for Option<T> {
    fn from_reply(reply: Reply) -> Result<Self, StoreError> {
        match reply {
            Reply::Nil => Ok(None),
            other => T::from_reply(other).map(Some),
        }
    }
}

impl<T: FromReply> FromReply for Vec<T> {
    fn from_reply(reply: Reply) -> Result<Self, StoreError> {
        match reply {
            Reply::Array(items) => items.into_iter().map(T::from_reply).collect(),
            Reply::Nil => Ok(Vec::new()),
            other => unexpected("array", &other),
        }
    }
}
