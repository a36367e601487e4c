use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

pub type ResultT<A> = Result<A, ClientError>;

/// Errors surfaced by the client. Transport errors are wrapped in an `Arc`
/// so that one terminal error can be cloned into every queued promise.
#[derive(Debug, Clone, Error)]
pub enum ClientError {
    #[error("no connection targets available")]
    NoAvailableTargets,
    #[error("connection pool is closed")]
    PoolClosed,
    #[error("connection is closed")]
    ConnectionClosed,
    #[error("timed out acquiring a connection")]
    AcquireTimeout,
    #[error("subscriptions are not allowed on this connection")]
    SubscriptionsNotAllowed,
    #[error("server error: {0}")]
    Server(String),
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("handshake failed: {0}")]
    Handshake(String),
    #[error("io error: {0}")]
    Io(Arc<io::Error>),
}

impl From<io::Error> for ClientError {
    fn from(err: io::Error) -> ClientError {
        ClientError::Io(Arc::new(err))
    }
}

/// Sizing policy for the pool. `Strict` caps the total number of live
/// connections; `Leaky` caps only the preserved idle set and lets leased
/// connections overflow, closing the surplus when it comes back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MaxConnections {
    Strict(usize),
    Leaky(usize),
}

impl MaxConnections {
    pub fn cap(&self) -> usize {
        match *self {
            MaxConnections::Strict(n) | MaxConnections::Leaky(n) => n,
        }
    }

    pub fn is_leaky(&self) -> bool {
        matches!(self, MaxConnections::Leaky(_))
    }
}

#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Deadline for a single lease acquisition, including any connection
    /// attempts made on its behalf.
    pub timeout: Duration,
    /// First reconnect delay; attempt `n` waits `initial_delay * factor^n`.
    pub initial_delay: Duration,
    pub factor: u32,
}

impl Default for RetryConfig {
    fn default() -> RetryConfig {
        RetryConfig {
            timeout: Duration::from_secs(10),
            initial_delay: Duration::from_millis(100),
            factor: 2,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct FactoryConfig {
    pub password: Option<String>,
    pub initial_database: Option<i64>,
}

pub type UnexpectedClosureHandler = Arc<dyn Fn() + Send + Sync>;

#[derive(Clone)]
pub struct PoolConfig {
    pub initial_addresses: Vec<SocketAddr>,
    pub max_connections: MaxConnections,
    /// Idle floor maintained once the pool is activated.
    pub minimum_connections: usize,
    pub retry: RetryConfig,
    pub factory: FactoryConfig,
    /// Invoked whenever a pooled connection's socket closes without a
    /// caller-requested close.
    pub on_unexpected_closure: Option<UnexpectedClosureHandler>,
}

impl PoolConfig {
    pub fn new(initial_addresses: Vec<SocketAddr>) -> PoolConfig {
        PoolConfig {
            initial_addresses,
            max_connections: MaxConnections::Strict(8),
            minimum_connections: 1,
            retry: RetryConfig::default(),
            factory: FactoryConfig::default(),
            on_unexpected_closure: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn max_connections_cap() {
        assert_eq!(MaxConnections::Strict(4).cap(), 4);
        assert_eq!(MaxConnections::Leaky(4).cap(), 4);
        assert!(MaxConnections::Leaky(4).is_leaky());
        assert!(!MaxConnections::Strict(4).is_leaky());
    }

    #[test]
    fn io_errors_stay_cloneable() {
        let err: ClientError = io::Error::new(io::ErrorKind::BrokenPipe, "gone").into();
        let copy = err.clone();
        assert!(matches!(copy, ClientError::Io(_)));
    }
}
