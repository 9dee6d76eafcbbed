//! Redis plumbing shared by the rate-limit store, the membership resolver
//! and the membership-change subscriber.
//!
//! - `RedisPool`: lazily connected multiplexed connection behind a circuit breaker
//! - `CircuitBreaker`: fails fast while Redis is unavailable
//! - `ExponentialBackoff`: reconnect delays for the pub/sub loop

mod backoff;
mod circuit_breaker;
mod pool;

pub use backoff::{BackoffConfig, ExponentialBackoff};
pub use circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitBreakerStats, CircuitState};
pub use pool::{PoolError, RedisPool};
