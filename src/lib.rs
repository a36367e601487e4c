//! Async Redis client core: a streaming RESP codec, a strict-FIFO
//! per-connection command pipeline, and a leasing connection pool with a
//! reserved pub/sub connection slot.
//!
//! Commands are plain RESP arrays handed to [`Connection::send`] or
//! [`ConnectionPool::send`]; the full Redis command surface is the caller's
//! concern. The pool is an actor bound to the runtime it was created on:
//! every handle call submits a message to it, so pool state is mutated from
//! a single task and never behind a lock.

pub mod connection;
pub mod parser;
mod pipeline;
pub mod pool;
pub mod protocol;
pub mod pubsub;
pub mod rotator;
pub mod types;

pub use connection::Connection;
pub use parser::{decode, Decoded};
pub use pool::ConnectionPool;
pub use protocol::{command, RESP};
pub use pubsub::{MessageHandler, SubscriptionChangeHandler};
pub use rotator::AddressRotator;
pub use types::{
    ClientError, FactoryConfig, MaxConnections, PoolConfig, ResultT, RetryConfig,
};
