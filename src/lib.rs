//! hashbench: a benchmarking harness for a batched digest-echo socket
//! service.
//!
//! The server is a single-threaded mio reactor feeding a batching worker
//! pool; the client is a rate-limited traffic generator that verifies the
//! digests echoed back. See the `server` module for the interest-set
//! discipline that keeps at most one in-flight task per connection.

pub mod client;
pub mod config;
pub mod digest;
pub mod server;
pub mod stats;
