//! Process-local guards for the coordination core.
//!
//! Both guards are in-memory only: buckets and breaker counters reset on
//! restart, and multiple processes sharing a store each carry their own.
//! They protect a process from self-inflicted overload, not the fleet.

pub mod breaker;
pub mod bucket;

pub use breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitState};
pub use bucket::{RateLimiter, RateLimiterConfig};
